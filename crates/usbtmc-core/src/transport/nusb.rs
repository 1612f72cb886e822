//! nusb-based USB host binding.

use std::time::Duration;

use nusb::descriptors::TransferType;
use nusb::transfer::{
    Buffer, Bulk, ControlIn, ControlType, EndpointDirection, EndpointType, In, Interrupt, Out,
    TransferError,
};
use nusb::{Endpoint, Interface, MaybeFuture, list_devices};
use tracing::{debug, info, instrument};

use super::traits::*;

/// The system USB bus.
#[derive(Debug, Default, Clone, Copy)]
pub struct NusbBus;

impl NusbBus {
    pub fn new() -> Self {
        Self
    }
}

fn describe(device_info: &nusb::DeviceInfo) -> DeviceInfo {
    let mut info = DeviceInfo::new(device_info.vendor_id(), device_info.product_id())
        .with_location(device_info.bus_id(), device_info.device_address());
    if let Some(serial) = device_info.serial_number() {
        info = info.with_serial(serial);
    }
    for iface in device_info.interfaces() {
        info = info.with_interface(
            iface.interface_number(),
            iface.class(),
            iface.subclass(),
            iface.protocol(),
        );
    }
    info
}

impl UsbBus for NusbBus {
    type Device = NusbDevice;

    fn devices(&self) -> Result<Vec<DeviceInfo>, TransportError> {
        let devices = list_devices()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;
        Ok(devices.map(|d| describe(&d)).collect())
    }

    #[instrument(level = "info", skip(self), fields(vid = format!("{:04X}", info.vendor_id), pid = format!("{:04X}", info.product_id)))]
    fn open(&self, info: &DeviceInfo) -> Result<NusbDevice, TransportError> {
        let device_info = list_devices()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?
            .find(|d| d.bus_id() == info.bus_id && d.device_address() == info.device_address)
            .ok_or(TransportError::DeviceNotFound {
                vid: info.vendor_id,
                pid: info.product_id,
            })?;

        let device = device_info
            .open()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        info!(
            bus = %info.bus_id,
            address = info.device_address,
            "Device opened"
        );

        Ok(NusbDevice {
            device,
            interface: None,
            bulk_out: None,
            bulk_in: None,
            interrupt_in: None,
        })
    }
}

/// An opened device. Endpoints are claimed lazily on first use.
pub struct NusbDevice {
    device: nusb::Device,
    interface: Option<Interface>,
    bulk_out: Option<(u8, Endpoint<Bulk, Out>)>,
    bulk_in: Option<(u8, Endpoint<Bulk, In>)>,
    interrupt_in: Option<(u8, Endpoint<Interrupt, In>)>,
}

fn not_claimed() -> TransportError {
    TransportError::Transfer("interface not claimed".into())
}

fn map_transfer_error(error: TransferError, endpoint: u8, timeout: Duration) -> TransportError {
    match error {
        // transfer_blocking cancels on timeout
        TransferError::Cancelled => TransportError::timeout(timeout),
        TransferError::Stall => TransportError::Stall { endpoint },
        TransferError::Disconnected => TransportError::Disconnected,
        other => TransportError::Transfer(other.to_string()),
    }
}

fn endpoint_slot<'a, T, D>(
    interface: &Option<Interface>,
    slot: &'a mut Option<(u8, Endpoint<T, D>)>,
    address: u8,
) -> Result<&'a mut Endpoint<T, D>, TransportError>
where
    T: EndpointType,
    D: EndpointDirection,
{
    if !matches!(slot, Some((current, _)) if *current == address) {
        let interface = interface.as_ref().ok_or_else(not_claimed)?;
        let endpoint = interface
            .endpoint::<T, D>(address)
            .map_err(|e| TransportError::Transfer(e.to_string()))?;
        *slot = Some((address, endpoint));
    }
    match slot {
        Some((_, endpoint)) => Ok(endpoint),
        None => Err(not_claimed()),
    }
}

/// IN transfers must be a whole number of packets.
fn round_to_packets(len: usize, max_packet_size: usize) -> usize {
    let packet = max_packet_size.max(1);
    len.max(1).div_ceil(packet) * packet
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn detach(device: &nusb::Device, interface: u8) -> Result<bool, TransportError> {
    match device.detach_kernel_driver(interface) {
        Ok(()) => Ok(true),
        Err(e) => {
            debug!(interface, error = %e, "No kernel driver detached");
            Ok(false)
        }
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn detach(_device: &nusb::Device, _interface: u8) -> Result<bool, TransportError> {
    Ok(false)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn attach(device: &nusb::Device, interface: u8) -> Result<(), TransportError> {
    device
        .attach_kernel_driver(interface)
        .map_err(|e| TransportError::Transfer(e.to_string()))
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn attach(_device: &nusb::Device, _interface: u8) -> Result<(), TransportError> {
    Ok(())
}

impl UsbDevice for NusbDevice {
    fn configurations(&self) -> Vec<ConfigurationInfo> {
        self.device
            .configurations()
            .map(|config| {
                let mut interfaces = Vec::new();
                for group in config.interfaces() {
                    for alt in group.alt_settings() {
                        let endpoints = alt
                            .endpoints()
                            .map(|ep| EndpointInfo {
                                address: ep.address(),
                                kind: match ep.transfer_type() {
                                    TransferType::Control => EndpointKind::Control,
                                    TransferType::Isochronous => EndpointKind::Isochronous,
                                    TransferType::Bulk => EndpointKind::Bulk,
                                    TransferType::Interrupt => EndpointKind::Interrupt,
                                },
                                direction: match ep.direction() {
                                    nusb::transfer::Direction::In => Direction::In,
                                    nusb::transfer::Direction::Out => Direction::Out,
                                },
                                max_packet_size: ep.max_packet_size(),
                            })
                            .collect();
                        interfaces.push(InterfaceInfo {
                            number: alt.interface_number(),
                            alt_setting: alt.alternate_setting(),
                            class: alt.class(),
                            subclass: alt.subclass(),
                            protocol: alt.protocol(),
                            endpoints,
                        });
                    }
                }
                ConfigurationInfo {
                    value: config.configuration_value(),
                    interfaces,
                }
            })
            .collect()
    }

    fn active_configuration(&self) -> Option<u8> {
        self.device
            .active_configuration()
            .ok()
            .map(|config| config.configuration_value())
    }

    fn set_configuration(&mut self, value: u8) -> Result<(), TransportError> {
        self.device
            .set_configuration(value)
            .wait()
            .map_err(|e| TransportError::Transfer(e.to_string()))
    }

    fn detach_kernel_driver(&mut self, interface: u8) -> Result<bool, TransportError> {
        detach(&self.device, interface)
    }

    fn attach_kernel_driver(&mut self, interface: u8) -> Result<(), TransportError> {
        attach(&self.device, interface)
    }

    fn claim_interface(&mut self, interface: u8, alt_setting: u8) -> Result<(), TransportError> {
        let claimed = self
            .device
            .claim_interface(interface)
            .wait()
            .map_err(|e| TransportError::ClaimInterfaceFailed {
                interface,
                message: e.to_string(),
            })?;
        if alt_setting != 0 {
            claimed
                .set_alt_setting(alt_setting)
                .wait()
                .map_err(|e| TransportError::ClaimInterfaceFailed {
                    interface,
                    message: e.to_string(),
                })?;
        }
        self.interface = Some(claimed);
        Ok(())
    }

    fn release_interface(&mut self, _interface: u8) -> Result<(), TransportError> {
        // Endpoints hold the interface open.
        self.bulk_out = None;
        self.bulk_in = None;
        self.interrupt_in = None;
        self.interface = None;
        Ok(())
    }

    fn control_in(
        &mut self,
        setup: ControlSetup,
        length: u16,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let interface = self.interface.as_ref().ok_or_else(not_claimed)?;
        let request = ControlIn {
            control_type: match setup.request_type {
                RequestType::Class => ControlType::Class,
                RequestType::Vendor => ControlType::Vendor,
            },
            recipient: match setup.recipient {
                Recipient::Interface => nusb::transfer::Recipient::Interface,
                Recipient::Endpoint => nusb::transfer::Recipient::Endpoint,
            },
            request: setup.request,
            value: setup.value,
            index: setup.index,
            length,
        };
        interface
            .control_in(request, timeout)
            .wait()
            .map_err(|e| map_transfer_error(e, 0, timeout))
    }

    fn bulk_out(
        &mut self,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        let ep = endpoint_slot(&self.interface, &mut self.bulk_out, endpoint)?;
        let mut buf = Buffer::new(data.len());
        buf.extend_from_slice(data);

        let completion = ep.transfer_blocking(buf, timeout);
        completion
            .status
            .map_err(|e| map_transfer_error(e, endpoint, timeout))?;
        debug!(bytes_written = completion.actual_len, "Bulk OUT complete");
        Ok(completion.actual_len)
    }

    fn bulk_in(
        &mut self,
        endpoint: u8,
        max_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let ep = endpoint_slot(&self.interface, &mut self.bulk_in, endpoint)?;
        let buf = Buffer::new(round_to_packets(max_len, ep.max_packet_size()));

        let completion = ep.transfer_blocking(buf, timeout);
        completion
            .status
            .map_err(|e| map_transfer_error(e, endpoint, timeout))?;
        let mut data = completion.buffer.into_vec();
        data.truncate(completion.actual_len);
        debug!(bytes_read = data.len(), "Bulk IN complete");
        Ok(data)
    }

    fn interrupt_in(
        &mut self,
        endpoint: u8,
        max_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let ep = endpoint_slot(&self.interface, &mut self.interrupt_in, endpoint)?;
        let buf = Buffer::new(round_to_packets(max_len, ep.max_packet_size()));

        let completion = ep.transfer_blocking(buf, timeout);
        completion
            .status
            .map_err(|e| map_transfer_error(e, endpoint, timeout))?;
        let mut data = completion.buffer.into_vec();
        data.truncate(completion.actual_len);
        Ok(data)
    }

    fn clear_halt(&mut self, endpoint: u8) -> Result<(), TransportError> {
        let result = if endpoint & 0x80 == 0 {
            endpoint_slot(&self.interface, &mut self.bulk_out, endpoint)?
                .clear_halt()
                .wait()
        } else {
            endpoint_slot(&self.interface, &mut self.bulk_in, endpoint)?
                .clear_halt()
                .wait()
        };
        result.map_err(|e| TransportError::Transfer(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_to_packets() {
        assert_eq!(round_to_packets(1, 512), 512);
        assert_eq!(round_to_packets(512, 512), 512);
        assert_eq!(round_to_packets(1039, 512), 1536);
        assert_eq!(round_to_packets(0, 64), 64);
        assert_eq!(round_to_packets(10, 0), 10);
    }
}
