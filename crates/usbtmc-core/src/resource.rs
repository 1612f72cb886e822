//! Resource Locator: instrument addresses and device discovery.
//!
//! Instruments are named by VISA-style address strings,
//! `USB[board]::<vendor>::<product>[::<serial>]::INSTR`, by a
//! `vendor:product[:serial]` shorthand (hex, as printed by `lsusb`), by id
//! tuples, or by an already enumerated [`DeviceInfo`].

use std::fmt;
use std::str::FromStr;

use tracing::debug;

use crate::error::{Result, UsbtmcError};
use crate::protocol::constants::*;
use crate::quirks::{is_class_allow_listed, normal_mode_product_id};
use crate::transport::{DeviceInfo, UsbBus};

/// A parsed instrument address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAddress {
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial: Option<String>,
}

impl DeviceAddress {
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
            serial: None,
        }
    }

    pub fn with_serial(mut self, serial: impl Into<String>) -> Self {
        self.serial = Some(serial.into());
        self
    }

    /// Address of an enumerated device, using its normal-mode product id.
    pub fn for_device(info: &DeviceInfo) -> Self {
        Self {
            vendor_id: info.vendor_id,
            product_id: normal_mode_product_id(info.vendor_id, info.product_id),
            serial: info.serial_number.clone(),
        }
    }

    /// Vendor and product agree (either id of a firmware-update pair
    /// matches), and the serial agrees when one is given.
    pub fn matches(&self, info: &DeviceInfo) -> bool {
        Selector::from(self.clone()).matches(info)
    }
}

fn parse_id(text: &str, radix_hex_default: bool) -> Option<u16> {
    let text = text.trim();
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u16::from_str_radix(hex, 16).ok()
    } else if radix_hex_default {
        u16::from_str_radix(text, 16).ok()
    } else {
        text.parse().ok()
    }
}

impl FromStr for DeviceAddress {
    type Err = UsbtmcError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || UsbtmcError::InvalidSpec(s.to_string());
        let parts: Vec<&str> = s.trim().split("::").collect();
        if !(4..=5).contains(&parts.len()) {
            return Err(invalid());
        }

        let prefix = parts[0].to_ascii_uppercase();
        let board = prefix.strip_prefix("USB").ok_or_else(invalid)?;
        if !board.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid());
        }
        if !parts[parts.len() - 1].eq_ignore_ascii_case("INSTR") {
            return Err(invalid());
        }

        let vendor_id = parse_id(parts[1], false).ok_or_else(invalid)?;
        let product_id = parse_id(parts[2], false).ok_or_else(invalid)?;
        let serial = match parts.len() {
            5 if !parts[3].is_empty() => Some(parts[3].to_string()),
            5 => return Err(invalid()),
            _ => None,
        };

        Ok(Self {
            vendor_id,
            product_id,
            serial,
        })
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "USB::0x{:04X}::0x{:04X}", self.vendor_id, self.product_id)?;
        if let Some(serial) = &self.serial {
            write!(f, "::{serial}")?;
        }
        write!(f, "::INSTR")
    }
}

/// Anything an instrument can be opened from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceSpec {
    Ids {
        vendor_id: Option<u16>,
        product_id: Option<u16>,
        serial: Option<String>,
    },
    /// Address string or `vendor:product[:serial]` shorthand.
    Address(String),
    Device(DeviceInfo),
}

impl From<&str> for ResourceSpec {
    fn from(s: &str) -> Self {
        Self::Address(s.to_string())
    }
}

impl From<String> for ResourceSpec {
    fn from(s: String) -> Self {
        Self::Address(s)
    }
}

impl From<DeviceInfo> for ResourceSpec {
    fn from(info: DeviceInfo) -> Self {
        Self::Device(info)
    }
}

impl From<DeviceAddress> for ResourceSpec {
    fn from(address: DeviceAddress) -> Self {
        Self::Ids {
            vendor_id: Some(address.vendor_id),
            product_id: Some(address.product_id),
            serial: address.serial,
        }
    }
}

impl From<(u16, u16)> for ResourceSpec {
    fn from((vendor_id, product_id): (u16, u16)) -> Self {
        DeviceAddress::new(vendor_id, product_id).into()
    }
}

impl From<(u16, u16, &str)> for ResourceSpec {
    fn from((vendor_id, product_id, serial): (u16, u16, &str)) -> Self {
        DeviceAddress::new(vendor_id, product_id)
            .with_serial(serial)
            .into()
    }
}

impl fmt::Display for ResourceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceSpec::Ids {
                vendor_id,
                product_id,
                serial,
            } => {
                match vendor_id {
                    Some(v) => write!(f, "{v:04x}")?,
                    None => write!(f, "*")?,
                }
                match product_id {
                    Some(p) => write!(f, ":{p:04x}")?,
                    None => write!(f, ":*")?,
                }
                if let Some(serial) = serial {
                    write!(f, ":{serial}")?;
                }
                Ok(())
            }
            ResourceSpec::Address(address) => write!(f, "{address}"),
            ResourceSpec::Device(info) => write!(f, "{}", DeviceAddress::for_device(info)),
        }
    }
}

/// What enumeration results are filtered by.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Selector {
    vendor_id: u16,
    product_id: Option<u16>,
    serial: Option<String>,
}

impl From<DeviceAddress> for Selector {
    fn from(address: DeviceAddress) -> Self {
        Self {
            vendor_id: address.vendor_id,
            product_id: Some(address.product_id),
            serial: address.serial,
        }
    }
}

impl Selector {
    fn parse(text: &str) -> Result<Self> {
        if text.contains("::") {
            return text.parse::<DeviceAddress>().map(Self::from);
        }

        let invalid = || UsbtmcError::InvalidSpec(text.to_string());
        let parts: Vec<&str> = text.trim().split(':').collect();
        if !(2..=3).contains(&parts.len()) {
            return Err(invalid());
        }
        Ok(Self {
            vendor_id: parse_id(parts[0], true).ok_or_else(invalid)?,
            product_id: Some(parse_id(parts[1], true).ok_or_else(invalid)?),
            serial: parts
                .get(2)
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string()),
        })
    }

    fn matches(&self, info: &DeviceInfo) -> bool {
        if info.vendor_id != self.vendor_id {
            return false;
        }
        if let Some(wanted) = self.product_id {
            let normal = normal_mode_product_id(info.vendor_id, info.product_id);
            if normal != normal_mode_product_id(self.vendor_id, wanted) {
                return false;
            }
        }
        match &self.serial {
            Some(serial) => info.serial_number.as_deref() == Some(serial.as_str()),
            None => true,
        }
    }
}

/// Whether an enumerated device looks like an instrument.
pub fn is_instrument(info: &DeviceInfo) -> bool {
    info.interfaces.iter().any(|iface| {
        iface.class == USBTMC_INTERFACE_CLASS && iface.subclass == USBTMC_INTERFACE_SUBCLASS
    }) || is_class_allow_listed(info.vendor_id, info.product_id)
}

/// All attached instruments.
pub fn list_devices<B: UsbBus>(bus: &B) -> Result<Vec<DeviceInfo>> {
    Ok(bus.devices()?.into_iter().filter(is_instrument).collect())
}

/// Address strings of all attached instruments.
pub fn list_resources<B: UsbBus>(bus: &B) -> Result<Vec<String>> {
    Ok(list_devices(bus)?
        .iter()
        .map(|info| DeviceAddress::for_device(info).to_string())
        .collect())
}

/// Find the single device `spec` names.
pub fn resolve<B: UsbBus>(bus: &B, spec: &ResourceSpec) -> Result<DeviceInfo> {
    let selector = match spec {
        ResourceSpec::Device(info) => return Ok(info.clone()),
        ResourceSpec::Address(text) => Selector::parse(text)?,
        ResourceSpec::Ids {
            vendor_id: Some(vendor_id),
            product_id,
            serial,
        } => Selector {
            vendor_id: *vendor_id,
            product_id: *product_id,
            serial: serial.clone(),
        },
        ResourceSpec::Ids { vendor_id: None, .. } => {
            return Err(UsbtmcError::InvalidSpec(
                "a vendor id or a device is required".into(),
            ));
        }
    };

    let mut matches: Vec<DeviceInfo> = bus
        .devices()?
        .into_iter()
        .filter(|info| selector.matches(info))
        .collect();
    debug!(spec = %spec, count = matches.len(), "Resolved resource");

    match matches.len() {
        0 => Err(UsbtmcError::NotFound(spec.to_string())),
        1 => Ok(matches.remove(0)),
        count => Err(UsbtmcError::Ambiguous {
            spec: spec.to_string(),
            count,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MockBus, MockDevice};

    #[test]
    fn test_parse_address_string() {
        let address: DeviceAddress = "USB0::0x1AB1::0x04CE::DS1ZA1234::INSTR".parse().unwrap();
        assert_eq!(
            address,
            DeviceAddress::new(0x1AB1, 0x04CE).with_serial("DS1ZA1234")
        );

        let address: DeviceAddress = "usb::6833::1230::instr".parse().unwrap();
        assert_eq!(address, DeviceAddress::new(6833, 1230));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for text in [
            "",
            "GPIB0::12::INSTR",
            "USB::0x1AB1::INSTR",
            "USB::0x1AB1::0x04CE::SN::INSTR::EXTRA",
            "USB::0xZZZZ::0x04CE::INSTR",
            "USB::0x1AB1::0x04CE::RAW",
            "USBX::0x1AB1::0x04CE::INSTR",
            "USB::0x1AB1::0x04CE::::INSTR",
        ] {
            assert!(
                matches!(text.parse::<DeviceAddress>(), Err(UsbtmcError::InvalidSpec(_))),
                "{text}"
            );
        }
    }

    #[test]
    fn test_address_display() {
        let address = DeviceAddress::new(0x0957, 0x1755).with_serial("MY123");
        assert_eq!(address.to_string(), "USB::0x0957::0x1755::MY123::INSTR");
        assert_eq!(
            DeviceAddress::new(0x0957, 0x1755).to_string(),
            "USB::0x0957::0x1755::INSTR"
        );
    }

    fn bus_with(devices: &[DeviceInfo]) -> MockBus {
        let mut bus = MockBus::new();
        for info in devices {
            bus.attach(info.clone(), MockDevice::usbtmc());
        }
        bus
    }

    #[test]
    fn test_resolve_by_string_and_tuple() {
        let bus = bus_with(&[
            DeviceInfo::new(0x0957, 0x1755).with_serial("A"),
            DeviceInfo::new(0x0957, 0x1755).with_serial("B"),
            DeviceInfo::new(0x1AB1, 0x04CE),
        ]);

        let info = resolve(&bus, &"USB::0x1AB1::0x04CE::INSTR".into()).unwrap();
        assert_eq!(info.product_id, 0x04CE);

        let info = resolve(&bus, &(0x0957, 0x1755, "B").into()).unwrap();
        assert_eq!(info.serial_number.as_deref(), Some("B"));

        let info = resolve(&bus, &"0957:1755:A".into()).unwrap();
        assert_eq!(info.serial_number.as_deref(), Some("A"));
    }

    #[test]
    fn test_resolve_failures() {
        let bus = bus_with(&[
            DeviceInfo::new(0x0957, 0x1755).with_serial("A"),
            DeviceInfo::new(0x0957, 0x1755).with_serial("B"),
        ]);

        assert!(matches!(
            resolve(&bus, &(0x0957, 0x1755).into()),
            Err(UsbtmcError::Ambiguous { count: 2, .. })
        ));
        assert!(matches!(
            resolve(&bus, &(0x1234, 0x5678).into()),
            Err(UsbtmcError::NotFound(_))
        ));
        assert!(matches!(
            resolve(&bus, &"not an address".into()),
            Err(UsbtmcError::InvalidSpec(_))
        ));
        let no_vendor = ResourceSpec::Ids {
            vendor_id: None,
            product_id: Some(0x1755),
            serial: None,
        };
        assert!(matches!(
            resolve(&bus, &no_vendor),
            Err(UsbtmcError::InvalidSpec(_))
        ));
    }

    #[test]
    fn test_resolve_device_handle_directly() {
        let bus = MockBus::new();
        let info = DeviceInfo::new(0x0957, 0x1755).with_location("1-2", 4);
        assert_eq!(resolve(&bus, &info.clone().into()).unwrap(), info);
    }

    #[test]
    fn test_list_resources_filters_and_remaps() {
        let mut bus = MockBus::new();
        bus.attach(
            DeviceInfo::new(0x0957, 0x2818).with_serial("MY5"),
            MockDevice::new(Vec::new()),
        );
        bus.attach(
            DeviceInfo::new(0x046D, 0xC52B).with_interface(0, 0x03, 0x01, 0x02),
            MockDevice::new(Vec::new()),
        );
        bus.attach(
            DeviceInfo::new(0x1334, 0x0001).with_interface(0, 0xFF, 0x00, 0x00),
            MockDevice::new(Vec::new()),
        );
        bus.attach(DeviceInfo::new(0x1AB1, 0x04CE), MockDevice::usbtmc());

        let resources = list_resources(&bus).unwrap();
        assert_eq!(
            resources,
            vec![
                "USB::0x0957::0x2918::MY5::INSTR".to_string(),
                "USB::0x1334::0x0001::INSTR".to_string(),
                "USB::0x1AB1::0x04CE::INSTR".to_string(),
            ]
        );
    }

    #[test]
    fn test_remapped_address_resolves_update_mode_device() {
        let mut bus = MockBus::new();
        bus.attach(DeviceInfo::new(0x0957, 0x2818), MockDevice::usbtmc());

        let info = resolve(&bus, &"USB::0x0957::0x2918::INSTR".into()).unwrap();
        assert_eq!(info.product_id, 0x2818);
        let info = resolve(&bus, &(0x0957, 0x2818).into()).unwrap();
        assert_eq!(info.product_id, 0x2818);
        assert!(DeviceAddress::new(0x0957, 0x2918).matches(&info));
        assert!(!DeviceAddress::new(0x0957, 0x4118).matches(&info));
    }
}
