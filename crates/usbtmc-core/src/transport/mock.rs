//! Mock USB bus and device for testing.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::traits::*;
use crate::protocol::constants::*;
use crate::protocol::{Envelope, MessageKind};

/// One call made against a [`MockDevice`], in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsbCall {
    SetConfiguration(u8),
    DetachKernelDriver(u8),
    AttachKernelDriver(u8),
    ClaimInterface(u8),
    ReleaseInterface(u8),
    ControlIn { setup: ControlSetup, length: u16 },
    BulkOut { endpoint: u8, data: Vec<u8> },
    BulkIn { endpoint: u8, max_len: usize },
    InterruptIn { endpoint: u8, max_len: usize },
    ClearHalt(u8),
}

enum BulkInReply {
    /// Returned verbatim.
    Raw(Vec<u8>),
    /// Wrapped in a DEV_DEP_MSG_IN envelope echoing the last request tag.
    Response {
        payload: Vec<u8>,
        end_of_message: bool,
    },
    Error(TransportError),
}

struct MockState {
    configurations: Vec<ConfigurationInfo>,
    active_configuration: Option<u8>,
    kernel_driver_active: bool,
    claimed: Option<u8>,
    claim_error: Option<TransportError>,
    control_queue: HashMap<u8, VecDeque<Result<Vec<u8>, TransportError>>>,
    control_defaults: HashMap<u8, Vec<u8>>,
    bulk_out_errors: VecDeque<TransportError>,
    bulk_in_queue: VecDeque<BulkInReply>,
    interrupt_queue: VecDeque<Result<Vec<u8>, TransportError>>,
    last_request_tag: u8,
    calls: Vec<UsbCall>,
}

/// Scriptable device. Clones share state, so a test can keep a handle
/// while the session owns another.
#[derive(Clone)]
pub struct MockDevice {
    state: Arc<Mutex<MockState>>,
}

/// USBTMC interface descriptor with bulk OUT 0x02, bulk IN 0x81 and
/// optionally interrupt IN 0x83.
pub fn usbtmc_interface(number: u8, protocol: u8, interrupt: bool) -> InterfaceInfo {
    let mut endpoints = vec![
        EndpointInfo {
            address: 0x02,
            kind: EndpointKind::Bulk,
            direction: Direction::Out,
            max_packet_size: 512,
        },
        EndpointInfo {
            address: 0x81,
            kind: EndpointKind::Bulk,
            direction: Direction::In,
            max_packet_size: 512,
        },
    ];
    if interrupt {
        endpoints.push(EndpointInfo {
            address: 0x83,
            kind: EndpointKind::Interrupt,
            direction: Direction::In,
            max_packet_size: 8,
        });
    }
    InterfaceInfo {
        number,
        alt_setting: 0,
        class: USBTMC_INTERFACE_CLASS,
        subclass: USBTMC_INTERFACE_SUBCLASS,
        protocol,
        endpoints,
    }
}

/// A successful GET_CAPABILITIES response for USBTMC 1.00 / USB488 1.00.
pub fn capabilities_response(
    interface_caps: u8,
    device_caps: u8,
    usb488_interface_caps: u8,
    usb488_device_caps: u8,
) -> Vec<u8> {
    let mut data = vec![0u8; usize::from(CAPABILITIES_SIZE)];
    data[0] = STATUS_SUCCESS;
    data[2] = 0x00;
    data[3] = 0x01;
    data[4] = interface_caps;
    data[5] = device_caps;
    data[12] = 0x00;
    data[13] = 0x01;
    data[14] = usb488_interface_caps;
    data[15] = usb488_device_caps;
    data
}

impl MockDevice {
    pub fn new(configurations: Vec<ConfigurationInfo>) -> Self {
        let active_configuration = configurations.first().map(|c| c.value);
        let mut control_defaults = HashMap::new();
        control_defaults.insert(GET_CAPABILITIES, capabilities_response(0, 0, 0, 0));
        Self {
            state: Arc::new(Mutex::new(MockState {
                configurations,
                active_configuration,
                kernel_driver_active: false,
                claimed: None,
                claim_error: None,
                control_queue: HashMap::new(),
                control_defaults,
                bulk_out_errors: VecDeque::new(),
                bulk_in_queue: VecDeque::new(),
                interrupt_queue: VecDeque::new(),
                last_request_tag: 0,
                calls: Vec::new(),
            })),
        }
    }

    /// Plain USBTMC device: one configuration, interface 0, no interrupt endpoint.
    pub fn usbtmc() -> Self {
        Self::new(vec![ConfigurationInfo {
            value: 1,
            interfaces: vec![usbtmc_interface(0, USBTMC_PROTOCOL, false)],
        }])
    }

    /// USB488 device, optionally with an interrupt IN endpoint.
    pub fn usb488(interrupt: bool) -> Self {
        Self::new(vec![ConfigurationInfo {
            value: 1,
            interfaces: vec![usbtmc_interface(0, USB488_PROTOCOL, interrupt)],
        }])
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn set_active_configuration(&self, value: Option<u8>) {
        self.lock().active_configuration = value;
    }

    pub fn set_kernel_driver_active(&self, active: bool) {
        self.lock().kernel_driver_active = active;
    }

    /// Make the next claim fail with `error`.
    pub fn fail_claim(&self, error: TransportError) {
        self.lock().claim_error = Some(error);
    }

    /// Queue one response for `request`; queued responses win over defaults.
    pub fn queue_control(&self, request: u8, response: &[u8]) {
        self.lock()
            .control_queue
            .entry(request)
            .or_default()
            .push_back(Ok(response.to_vec()));
    }

    pub fn queue_control_error(&self, request: u8, error: TransportError) {
        self.lock()
            .control_queue
            .entry(request)
            .or_default()
            .push_back(Err(error));
    }

    /// Response returned for `request` whenever its queue is empty.
    pub fn set_control_default(&self, request: u8, response: &[u8]) {
        self.lock()
            .control_defaults
            .insert(request, response.to_vec());
    }

    pub fn set_capabilities(
        &self,
        interface_caps: u8,
        device_caps: u8,
        usb488_interface_caps: u8,
        usb488_device_caps: u8,
    ) {
        self.set_control_default(
            GET_CAPABILITIES,
            &capabilities_response(
                interface_caps,
                device_caps,
                usb488_interface_caps,
                usb488_device_caps,
            ),
        );
    }

    /// Queue a DEV_DEP_MSG_IN response; its tag is filled in from the most
    /// recent REQUEST_DEV_DEP_MSG_IN the device received.
    pub fn queue_response(&self, payload: &[u8], end_of_message: bool) {
        self.lock().bulk_in_queue.push_back(BulkInReply::Response {
            payload: payload.to_vec(),
            end_of_message,
        });
    }

    /// Queue a bulk IN transfer returned byte for byte.
    pub fn queue_bulk_in(&self, data: &[u8]) {
        self.lock()
            .bulk_in_queue
            .push_back(BulkInReply::Raw(data.to_vec()));
    }

    pub fn queue_bulk_in_error(&self, error: TransportError) {
        self.lock()
            .bulk_in_queue
            .push_back(BulkInReply::Error(error));
    }

    /// Make the next bulk OUT transfer fail with `error`.
    pub fn queue_bulk_out_error(&self, error: TransportError) {
        self.lock().bulk_out_errors.push_back(error);
    }

    pub fn queue_interrupt_in(&self, data: &[u8]) {
        self.lock().interrupt_queue.push_back(Ok(data.to_vec()));
    }

    pub fn queue_interrupt_error(&self, error: TransportError) {
        self.lock().interrupt_queue.push_back(Err(error));
    }

    /// All calls made so far.
    pub fn calls(&self) -> Vec<UsbCall> {
        self.lock().calls.clone()
    }

    /// Control requests issued so far, by bRequest.
    pub fn control_requests(&self) -> Vec<u8> {
        self.lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                UsbCall::ControlIn { setup, .. } => Some(setup.request),
                _ => None,
            })
            .collect()
    }

    /// Data of every bulk OUT transfer so far.
    pub fn bulk_writes(&self) -> Vec<Vec<u8>> {
        self.lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                UsbCall::BulkOut { data, .. } => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn claimed_interface(&self) -> Option<u8> {
        self.lock().claimed
    }

    pub fn kernel_driver_active(&self) -> bool {
        self.lock().kernel_driver_active
    }
}

fn require_claimed(state: &MockState) -> Result<(), TransportError> {
    match state.claimed {
        Some(_) => Ok(()),
        None => Err(TransportError::Transfer("interface not claimed".into())),
    }
}

impl UsbDevice for MockDevice {
    fn configurations(&self) -> Vec<ConfigurationInfo> {
        self.lock().configurations.clone()
    }

    fn active_configuration(&self) -> Option<u8> {
        self.lock().active_configuration
    }

    fn set_configuration(&mut self, value: u8) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.calls.push(UsbCall::SetConfiguration(value));
        state.active_configuration = Some(value);
        Ok(())
    }

    fn detach_kernel_driver(&mut self, interface: u8) -> Result<bool, TransportError> {
        let mut state = self.lock();
        if !state.kernel_driver_active {
            return Ok(false);
        }
        state.calls.push(UsbCall::DetachKernelDriver(interface));
        state.kernel_driver_active = false;
        Ok(true)
    }

    fn attach_kernel_driver(&mut self, interface: u8) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.calls.push(UsbCall::AttachKernelDriver(interface));
        state.kernel_driver_active = true;
        Ok(())
    }

    fn claim_interface(&mut self, interface: u8, _alt_setting: u8) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.calls.push(UsbCall::ClaimInterface(interface));
        if let Some(error) = state.claim_error.take() {
            return Err(error);
        }
        if state.kernel_driver_active {
            return Err(TransportError::ClaimInterfaceFailed {
                interface,
                message: "kernel driver active".into(),
            });
        }
        state.claimed = Some(interface);
        Ok(())
    }

    fn release_interface(&mut self, interface: u8) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.calls.push(UsbCall::ReleaseInterface(interface));
        state.claimed = None;
        Ok(())
    }

    fn control_in(
        &mut self,
        setup: ControlSetup,
        length: u16,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let mut state = self.lock();
        state.calls.push(UsbCall::ControlIn { setup, length });
        let queued = state
            .control_queue
            .get_mut(&setup.request)
            .and_then(VecDeque::pop_front);
        match queued {
            Some(result) => result,
            None => state
                .control_defaults
                .get(&setup.request)
                .cloned()
                .ok_or(TransportError::timeout(timeout)),
        }
    }

    fn bulk_out(
        &mut self,
        endpoint: u8,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<usize, TransportError> {
        let mut state = self.lock();
        state.calls.push(UsbCall::BulkOut {
            endpoint,
            data: data.to_vec(),
        });
        require_claimed(&state)?;
        if let Some(error) = state.bulk_out_errors.pop_front() {
            return Err(error);
        }
        if data.len() >= HEADER_SIZE && data[0] == MSGID_REQUEST_DEV_DEP_MSG_IN {
            state.last_request_tag = data[1];
        }
        Ok(data.len())
    }

    fn bulk_in(
        &mut self,
        endpoint: u8,
        max_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let mut state = self.lock();
        state.calls.push(UsbCall::BulkIn { endpoint, max_len });
        require_claimed(&state)?;
        let reply = state.bulk_in_queue.pop_front();
        match reply {
            Some(BulkInReply::Raw(data)) => Ok(data),
            Some(BulkInReply::Response {
                payload,
                end_of_message,
            }) => {
                let header = Envelope::new(
                    MessageKind::DevDepMsgIn,
                    state.last_request_tag,
                    payload.len() as u32,
                    end_of_message,
                );
                Ok(header.frame(&payload))
            }
            Some(BulkInReply::Error(error)) => Err(error),
            None => Err(TransportError::timeout(timeout)),
        }
    }

    fn interrupt_in(
        &mut self,
        endpoint: u8,
        max_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let mut state = self.lock();
        state.calls.push(UsbCall::InterruptIn { endpoint, max_len });
        require_claimed(&state)?;
        state
            .interrupt_queue
            .pop_front()
            .unwrap_or(Err(TransportError::timeout(timeout)))
    }

    fn clear_halt(&mut self, endpoint: u8) -> Result<(), TransportError> {
        self.lock().calls.push(UsbCall::ClearHalt(endpoint));
        Ok(())
    }
}

/// Mock bus holding a fixed set of devices.
#[derive(Clone, Default)]
pub struct MockBus {
    devices: Vec<(DeviceInfo, MockDevice)>,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a device. An empty bus location is filled in, and an empty
    /// interface summary is derived from the device's descriptors.
    pub fn attach(&mut self, mut info: DeviceInfo, device: MockDevice) -> DeviceInfo {
        if info.bus_id.is_empty() {
            info = info.with_location("mock", self.devices.len() as u8 + 1);
        }
        if info.interfaces.is_empty() {
            for config in device.configurations() {
                for iface in config.interfaces {
                    info = info.with_interface(
                        iface.number,
                        iface.class,
                        iface.subclass,
                        iface.protocol,
                    );
                }
            }
        }
        self.devices.push((info.clone(), device));
        info
    }
}

impl UsbBus for MockBus {
    type Device = MockDevice;

    fn devices(&self) -> Result<Vec<DeviceInfo>, TransportError> {
        Ok(self.devices.iter().map(|(info, _)| info.clone()).collect())
    }

    fn open(&self, info: &DeviceInfo) -> Result<MockDevice, TransportError> {
        self.devices
            .iter()
            .find(|(candidate, _)| candidate.same_location(info))
            .map(|(_, device)| device.clone())
            .ok_or(TransportError::DeviceNotFound {
                vid: info.vendor_id,
                pid: info.product_id,
            })
    }
}
