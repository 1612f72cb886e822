//! GET_CAPABILITIES response decoding.

use super::status::UsbtmcStatus;

/// Capabilities advertised by an interface, fixed for the life of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapabilitySet {
    /// bcdUSBTMC.
    pub protocol_version: u16,
    /// bcdUSB488, present on USB488 interfaces.
    pub extended_protocol_version: Option<u16>,
    pub supports_pulse: bool,
    pub supports_talk_only: bool,
    pub supports_listen_only: bool,
    pub supports_term_char: bool,
    pub supports_488_2: bool,
    /// REN_CONTROL, GO_TO_LOCAL and LOCAL_LOCKOUT are accepted.
    pub supports_remote_local: bool,
    /// The TRIGGER bulk message is accepted.
    pub supports_trigger: bool,
    pub supports_scpi: bool,
    pub supports_sr1: bool,
    pub supports_rl1: bool,
    pub supports_dt1: bool,
}

/// Why a capability response could not be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityError {
    Truncated(usize),
    Status(UsbtmcStatus),
}

impl CapabilitySet {
    /// Decode a GET_CAPABILITIES response. USB488 fields are only read when
    /// `usb488` is set.
    pub fn from_response(data: &[u8], usb488: bool) -> Result<Self, CapabilityError> {
        let status = UsbtmcStatus::from_byte(*data.first().ok_or(CapabilityError::Truncated(0))?);
        if !status.is_success() {
            return Err(CapabilityError::Status(status));
        }
        if data.len() < 6 {
            return Err(CapabilityError::Truncated(data.len()));
        }

        let mut caps = Self {
            protocol_version: u16::from_le_bytes([data[2], data[3]]),
            supports_pulse: data[4] & 0x04 != 0,
            supports_talk_only: data[4] & 0x02 != 0,
            supports_listen_only: data[4] & 0x01 != 0,
            supports_term_char: data[5] & 0x01 != 0,
            ..Self::default()
        };

        if usb488 {
            if data.len() < 16 {
                return Err(CapabilityError::Truncated(data.len()));
            }
            caps.extended_protocol_version = Some(u16::from_le_bytes([data[12], data[13]]));
            caps.supports_488_2 = data[14] & 0x04 != 0;
            caps.supports_remote_local = data[14] & 0x02 != 0;
            caps.supports_trigger = data[14] & 0x01 != 0;
            caps.supports_scpi = data[15] & 0x08 != 0;
            caps.supports_sr1 = data[15] & 0x04 != 0;
            caps.supports_rl1 = data[15] & 0x02 != 0;
            caps.supports_dt1 = data[15] & 0x01 != 0;
        }

        Ok(caps)
    }

    pub fn is_extended(&self) -> bool {
        self.extended_protocol_version.is_some()
    }
}
