//! Protocol-level errors.

use thiserror::Error;

use crate::protocol::{CapabilityError, EnvelopeError};
use crate::transport::TransportError;

/// Everything the driver can reject. Bus failures pass through untouched
/// in [`UsbtmcError::Transport`].
#[derive(Error, Debug)]
pub enum UsbtmcError {
    #[error("Invalid resource: {0}")]
    InvalidSpec(String),

    #[error("No device matches {0}")]
    NotFound(String),

    #[error("{count} devices match {spec}; add a serial number")]
    Ambiguous { spec: String, count: usize },

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Interface {interface} has no bulk {direction} endpoint")]
    InvalidEndpoints {
        interface: u8,
        direction: &'static str,
    },

    #[error("Bad envelope: {0}")]
    BadEnvelope(#[from] EnvelopeError),

    #[error("Tag mismatch: expected 0x{expected:02X}, got 0x{actual:02X}")]
    TagMismatch { expected: u8, actual: u8 },

    #[error("Read status byte failed: status 0x{code:02X}")]
    StatusReadFailed { code: u8 },

    #[error("Clear failed: status 0x{code:02X}")]
    ClearFailed { code: u8 },

    #[error("{request} failed: status 0x{code:02X}")]
    RequestFailed { request: &'static str, code: u8 },

    #[error("{operation} still pending after {polls} polls")]
    Unfinished { operation: &'static str, polls: u32 },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Session is not open")]
    NotOpen,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl UsbtmcError {
    /// Raw USBTMC status code, for status/abort/clear failures.
    pub fn code(&self) -> Option<u8> {
        match self {
            Self::StatusReadFailed { code }
            | Self::ClearFailed { code }
            | Self::RequestFailed { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// The bus-level error, if this is one.
    pub fn transport(&self) -> Option<&TransportError> {
        match self {
            Self::Transport(inner) => Some(inner),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.transport().is_some_and(TransportError::is_timeout)
    }

    pub(crate) fn capabilities(error: CapabilityError) -> Self {
        match error {
            CapabilityError::Status(status) => Self::RequestFailed {
                request: "GET_CAPABILITIES",
                code: status.code(),
            },
            CapabilityError::Truncated(len) => {
                Self::InvalidResponse(format!("GET_CAPABILITIES returned {len} bytes"))
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, UsbtmcError>;
