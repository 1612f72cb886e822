//! Vendor deviations from the USBTMC standard.

use std::fmt;

use crate::protocol::constants::*;

/// Per-session vendor behaviour, fixed at open from the vendor id.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum QuirkProfile {
    #[default]
    Standard,
    /// Responses arrive as IEEE 488.2 blocks whose envelopes understate the
    /// real size, and split messages confuse the device.
    IeeeBlock,
    /// Front panel lock and a diagnostic id, both via vendor requests.
    Lockable,
}

impl QuirkProfile {
    pub fn for_vendor(vendor_id: u16) -> Self {
        match vendor_id {
            RIGOL_VENDOR_ID => Self::IeeeBlock,
            ADVANTEST_VENDOR_ID => Self::Lockable,
            _ => Self::Standard,
        }
    }

    /// Whether long writes may be split across several envelopes.
    pub fn fragments_writes(self) -> bool {
        !matches!(self, Self::IeeeBlock)
    }

    pub fn reads_ieee_blocks(self) -> bool {
        matches!(self, Self::IeeeBlock)
    }

    pub fn is_lockable(self) -> bool {
        matches!(self, Self::Lockable)
    }
}

impl fmt::Display for QuirkProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuirkProfile::Standard => write!(f, "standard"),
            QuirkProfile::IeeeBlock => write!(f, "ieee-block"),
            QuirkProfile::Lockable => write!(f, "lockable"),
        }
    }
}

/// Product id a device answers to in normal mode. Agilent U27xx modules in
/// firmware update mode map to their normal id; everything else is unchanged.
pub fn normal_mode_product_id(vendor_id: u16, product_id: u16) -> u16 {
    if vendor_id != AGILENT_VENDOR_ID {
        return product_id;
    }
    AGILENT_FIRMWARE_UPDATE_PIDS
        .iter()
        .find(|(update, _)| *update == product_id)
        .map(|(_, normal)| *normal)
        .unwrap_or(product_id)
}

pub fn is_firmware_update_mode(vendor_id: u16, product_id: u16) -> bool {
    normal_mode_product_id(vendor_id, product_id) != product_id
}

/// Devices accepted even though no interface advertises the USBTMC class.
pub fn is_class_allow_listed(vendor_id: u16, product_id: u16) -> bool {
    CLASS_ALLOW_LIST.contains(&vendor_id) || is_firmware_update_mode(vendor_id, product_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profiles_by_vendor() {
        assert_eq!(QuirkProfile::for_vendor(0x1AB1), QuirkProfile::IeeeBlock);
        assert_eq!(QuirkProfile::for_vendor(0x1334), QuirkProfile::Lockable);
        assert_eq!(QuirkProfile::for_vendor(0x0957), QuirkProfile::Standard);
        assert!(!QuirkProfile::IeeeBlock.fragments_writes());
        assert!(QuirkProfile::Lockable.fragments_writes());
    }

    #[test]
    fn test_firmware_update_remap() {
        assert_eq!(normal_mode_product_id(0x0957, 0x2818), 0x2918);
        assert_eq!(normal_mode_product_id(0x0957, 0x4218), 0x4118);
        assert_eq!(normal_mode_product_id(0x0957, 0x4418), 0x4318);
        assert_eq!(normal_mode_product_id(0x0957, 0x2918), 0x2918);
        assert_eq!(normal_mode_product_id(0x1234, 0x2818), 0x2818);
        assert!(is_firmware_update_mode(0x0957, 0x2818));
        assert!(!is_firmware_update_mode(0x0957, 0x1755));
    }

    #[test]
    fn test_class_allow_list() {
        assert!(is_class_allow_listed(0x1334, 0x0001));
        assert!(is_class_allow_listed(0x0957, 0x4418));
        assert!(!is_class_allow_listed(0x0957, 0x1755));
    }
}
