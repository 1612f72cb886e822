//! Opening a device: configuration, interface and endpoint discovery,
//! claiming, capability query and remote-control handover.

use tracing::{info, instrument, warn};

use crate::error::{Result, UsbtmcError};
use crate::link::{EndpointSet, Link, StatusMode, Timing};
use crate::protocol::constants::*;
use crate::protocol::{CapabilitySet, StatusTagCounter, TagCounter};
use crate::quirks::{QuirkProfile, is_class_allow_listed};
use crate::session::SessionConfig;
use crate::transport::{
    ConfigurationInfo, ControlSetup, DeviceInfo, Direction, EndpointKind, InterfaceInfo,
    UsbDevice,
};

fn is_usbtmc(iface: &InterfaceInfo) -> bool {
    iface.class == USBTMC_INTERFACE_CLASS && iface.subclass == USBTMC_INTERFACE_SUBCLASS
}

/// Make sure a configuration is active and return it. The device is only
/// reconfigured when nothing is active or `force` is set.
fn select_configuration<D: UsbDevice>(
    device: &mut D,
    force: bool,
) -> Result<ConfigurationInfo> {
    let configurations = device.configurations();
    let active = device.active_configuration();

    let value = match active {
        Some(value) if !force => value,
        _ => {
            let value = active
                .or_else(|| configurations.first().map(|c| c.value))
                .ok_or_else(|| UsbtmcError::NotSupported("device has no configurations".into()))?;
            info!(configuration = value, "Setting configuration");
            device.set_configuration(value)?;
            value
        }
    };

    configurations
        .into_iter()
        .find(|c| c.value == value)
        .ok_or_else(|| UsbtmcError::NotSupported(format!("configuration {value} not described")))
}

/// The USBTMC interface, or for allow-listed devices the first interface.
fn select_interface(info: &DeviceInfo, config: &ConfigurationInfo) -> Result<InterfaceInfo> {
    let primary = config
        .interfaces
        .iter()
        .filter(|iface| iface.alt_setting == 0)
        .find(|iface| is_usbtmc(iface));
    let fallback = || {
        is_class_allow_listed(info.vendor_id, info.product_id)
            .then(|| config.interfaces.iter().find(|iface| iface.alt_setting == 0))
            .flatten()
    };

    primary.or_else(fallback).cloned().ok_or_else(|| {
        UsbtmcError::NotSupported(format!(
            "{:04X}:{:04X} has no USBTMC interface",
            info.vendor_id, info.product_id
        ))
    })
}

fn find_endpoints(iface: &InterfaceInfo) -> Result<EndpointSet> {
    let find = |kind: EndpointKind, direction: Direction| {
        iface
            .endpoints
            .iter()
            .find(|ep| ep.kind == kind && ep.direction == direction)
            .map(|ep| ep.address)
    };

    let bulk_out = find(EndpointKind::Bulk, Direction::Out).ok_or(UsbtmcError::InvalidEndpoints {
        interface: iface.number,
        direction: "OUT",
    })?;
    let bulk_in = find(EndpointKind::Bulk, Direction::In).ok_or(UsbtmcError::InvalidEndpoints {
        interface: iface.number,
        direction: "IN",
    })?;

    Ok(EndpointSet {
        bulk_out,
        bulk_in,
        interrupt_in: find(EndpointKind::Interrupt, Direction::In),
    })
}

impl<D: UsbDevice> Link<D> {
    /// Negotiate an opened device into a ready link. On failure everything
    /// acquired so far is handed back before the error is returned.
    #[instrument(level = "info", skip_all, fields(vid = format!("{:04X}", info.vendor_id), pid = format!("{:04X}", info.product_id)))]
    pub fn open(mut device: D, info: DeviceInfo, config: &SessionConfig) -> Result<Self> {
        let configuration = select_configuration(&mut device, config.force_reconfigure)?;
        let iface = select_interface(&info, &configuration)?;
        let endpoints = find_endpoints(&iface)?;
        info!(
            interface = iface.number,
            bulk_out = format!("0x{:02X}", endpoints.bulk_out),
            bulk_in = format!("0x{:02X}", endpoints.bulk_in),
            interrupt_in = ?endpoints.interrupt_in,
            "Endpoints resolved"
        );

        let kernel_driver_detached = device.detach_kernel_driver(iface.number)?;
        if let Err(e) = device.claim_interface(iface.number, iface.alt_setting) {
            if kernel_driver_detached {
                if let Err(attach) = device.attach_kernel_driver(iface.number) {
                    warn!(error = %attach, "Failed to reattach kernel driver");
                }
            }
            return Err(e.into());
        }

        let quirk = QuirkProfile::for_vendor(info.vendor_id);
        info!(quirk = %quirk, "Quirk profile selected");

        let mut link = Link {
            device,
            info,
            interface: iface.number,
            endpoints,
            capabilities: CapabilitySet::default(),
            quirk,
            status_mode: StatusMode::Basic,
            tags: TagCounter::new(),
            status_tags: StatusTagCounter::new(),
            timing: Timing::from(config),
            max_transfer_size: config.max_transfer_size.max(1),
            term_char: config.term_char,
            kernel_driver_detached,
            remote: false,
            locked: false,
        };

        let usb488 = iface.protocol == USB488_PROTOCOL;
        if let Err(e) = link.negotiate(usb488, config.local_lockout) {
            // Best effort: the negotiation error is the one reported.
            let _ = link.teardown();
            return Err(e);
        }
        Ok(link)
    }

    fn negotiate(&mut self, usb488: bool, local_lockout: bool) -> Result<()> {
        let setup = ControlSetup::interface(GET_CAPABILITIES, 0, self.interface);
        let response = self.control_in(setup, CAPABILITIES_SIZE, self.timing.timeout)?;
        self.capabilities =
            CapabilitySet::from_response(&response, usb488).map_err(UsbtmcError::capabilities)?;

        // READ_STATUS_BYTE belongs to USB488.2 devices; everything else
        // answers *STB?.
        let extended_status = self.capabilities.is_extended() && self.capabilities.supports_488_2;
        self.status_mode = match (extended_status, self.endpoints.interrupt_in) {
            (true, Some(endpoint)) => StatusMode::ExtendedInterrupt(endpoint),
            (true, None) => StatusMode::ExtendedControl,
            (false, _) => StatusMode::Basic,
        };
        info!(
            version = format!("{:04X}", self.capabilities.protocol_version),
            status_mode = ?self.status_mode,
            pulse = self.capabilities.supports_pulse,
            term_char = self.capabilities.supports_term_char,
            trigger = self.capabilities.supports_trigger,
            remote_local = self.capabilities.supports_remote_local,
            "Capabilities"
        );

        if self.capabilities.supports_remote_local {
            match self.remote_control(true) {
                Ok(()) if local_lockout => {
                    if let Err(e) = self.local_lockout() {
                        warn!(error = %e, "Local lockout failed");
                    }
                }
                Ok(()) => {}
                Err(e) => warn!(error = %e, "Remote control not granted"),
            }
        }
        Ok(())
    }
}
