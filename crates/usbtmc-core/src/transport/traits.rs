//! USB host binding abstraction.
//!
//! Defines the `UsbBus` and `UsbDevice` traits the driver runs on,
//! allowing different implementations (nusb, mock, etc.).

use std::time::Duration;
use thiserror::Error;

/// Bus-level failures. These are never rewritten into protocol errors.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Device not found: VID={vid:04X} PID={pid:04X}")]
    DeviceNotFound { vid: u16, pid: u16 },

    #[error("Failed to open device: {0}")]
    OpenFailed(String),

    #[error("Failed to claim interface {interface}: {message}")]
    ClaimInterfaceFailed { interface: u8, message: String },

    #[error("Endpoint 0x{endpoint:02X} stalled")]
    Stall { endpoint: u8 },

    #[error("Transfer failed: {0}")]
    Transfer(String),

    #[error("Device disconnected")]
    Disconnected,

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    pub fn timeout(timeout: Duration) -> Self {
        Self::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Direction of an endpoint, from the host's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointInfo {
    pub address: u8,
    pub kind: EndpointKind,
    pub direction: Direction,
    pub max_packet_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub number: u8,
    pub alt_setting: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub endpoints: Vec<EndpointInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigurationInfo {
    pub value: u8,
    pub interfaces: Vec<InterfaceInfo>,
}

/// Class triple of one interface, as reported during enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceClass {
    pub number: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
}

/// An attached device as seen during enumeration, before it is opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial_number: Option<String>,
    pub bus_id: String,
    pub device_address: u8,
    pub interfaces: Vec<InterfaceClass>,
}

impl DeviceInfo {
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
            serial_number: None,
            bus_id: String::new(),
            device_address: 0,
            interfaces: Vec::new(),
        }
    }

    pub fn with_serial(mut self, serial: impl Into<String>) -> Self {
        self.serial_number = Some(serial.into());
        self
    }

    pub fn with_location(mut self, bus_id: impl Into<String>, device_address: u8) -> Self {
        self.bus_id = bus_id.into();
        self.device_address = device_address;
        self
    }

    pub fn with_interface(mut self, number: u8, class: u8, subclass: u8, protocol: u8) -> Self {
        self.interfaces.push(InterfaceClass {
            number,
            class,
            subclass,
            protocol,
        });
        self
    }

    /// Same physical device (bus and address).
    pub fn same_location(&self, other: &DeviceInfo) -> bool {
        self.bus_id == other.bus_id && self.device_address == other.device_address
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    Class,
    Vendor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipient {
    Interface,
    Endpoint,
}

/// Setup packet fields other than direction and length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlSetup {
    pub request_type: RequestType,
    pub recipient: Recipient,
    pub request: u8,
    pub value: u16,
    pub index: u16,
}

impl ControlSetup {
    /// Class request addressed to an interface.
    pub fn interface(request: u8, value: u16, interface: u8) -> Self {
        Self {
            request_type: RequestType::Class,
            recipient: Recipient::Interface,
            request,
            value,
            index: u16::from(interface),
        }
    }

    /// Class request addressed to an endpoint.
    pub fn endpoint(request: u8, value: u16, endpoint: u8) -> Self {
        Self {
            request_type: RequestType::Class,
            recipient: Recipient::Endpoint,
            request,
            value,
            index: u16::from(endpoint),
        }
    }

    /// Vendor request addressed to an interface.
    pub fn vendor(request: u8, value: u16, index: u16) -> Self {
        Self {
            request_type: RequestType::Vendor,
            recipient: Recipient::Interface,
            request,
            value,
            index,
        }
    }
}

/// Enumerates and opens devices.
pub trait UsbBus {
    type Device: UsbDevice;

    /// All attached devices.
    fn devices(&self) -> Result<Vec<DeviceInfo>, TransportError>;

    /// Open a previously enumerated device.
    fn open(&self, info: &DeviceInfo) -> Result<Self::Device, TransportError>;
}

/// An opened device.
///
/// This trait enables:
/// - Production implementation using nusb
/// - Mock implementation for unit testing
pub trait UsbDevice: Send {
    /// Configuration descriptors.
    fn configurations(&self) -> Vec<ConfigurationInfo>;

    /// `bConfigurationValue` of the active configuration, `None` when unconfigured.
    fn active_configuration(&self) -> Option<u8>;

    fn set_configuration(&mut self, value: u8) -> Result<(), TransportError>;

    /// Detach the OS driver bound to `interface`. Returns `true` if one was detached.
    fn detach_kernel_driver(&mut self, interface: u8) -> Result<bool, TransportError>;

    fn attach_kernel_driver(&mut self, interface: u8) -> Result<(), TransportError>;

    fn claim_interface(&mut self, interface: u8, alt_setting: u8) -> Result<(), TransportError>;

    fn release_interface(&mut self, interface: u8) -> Result<(), TransportError>;

    fn control_in(
        &mut self,
        setup: ControlSetup,
        length: u16,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError>;

    /// Write raw bytes to a bulk OUT endpoint.
    fn bulk_out(&mut self, endpoint: u8, data: &[u8], timeout: Duration)
    -> Result<usize, TransportError>;

    /// Read one bulk IN transfer of at most `max_len` bytes.
    fn bulk_in(
        &mut self,
        endpoint: u8,
        max_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError>;

    fn interrupt_in(
        &mut self,
        endpoint: u8,
        max_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError>;

    fn clear_halt(&mut self, endpoint: u8) -> Result<(), TransportError>;
}
