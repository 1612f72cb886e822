//! USBTMC_status values returned in the first byte of class request responses.

use std::fmt;

use super::constants::*;

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum UsbtmcStatus {
    Success,
    /// Request still being processed; poll again.
    Pending,
    Failed,
    TransferNotInProgress,
    SplitNotInProgress,
    SplitInProgress,
    /// Any other (reserved or vendor) code.
    Other(u8),
}

impl UsbtmcStatus {
    pub fn from_byte(code: u8) -> Self {
        match code {
            STATUS_SUCCESS => Self::Success,
            STATUS_PENDING => Self::Pending,
            STATUS_FAILED => Self::Failed,
            STATUS_TRANSFER_NOT_IN_PROGRESS => Self::TransferNotInProgress,
            STATUS_SPLIT_NOT_IN_PROGRESS => Self::SplitNotInProgress,
            STATUS_SPLIT_IN_PROGRESS => Self::SplitInProgress,
            other => Self::Other(other),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Self::Success => STATUS_SUCCESS,
            Self::Pending => STATUS_PENDING,
            Self::Failed => STATUS_FAILED,
            Self::TransferNotInProgress => STATUS_TRANSFER_NOT_IN_PROGRESS,
            Self::SplitNotInProgress => STATUS_SPLIT_NOT_IN_PROGRESS,
            Self::SplitInProgress => STATUS_SPLIT_IN_PROGRESS,
            Self::Other(code) => code,
        }
    }

    pub fn is_success(self) -> bool {
        self == Self::Success
    }

    pub fn is_pending(self) -> bool {
        self == Self::Pending
    }
}

impl fmt::Debug for UsbtmcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UsbtmcStatus({} 0x{:02X})", self, self.code())
    }
}

impl fmt::Display for UsbtmcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "SUCCESS"),
            Self::Pending => write!(f, "PENDING"),
            Self::Failed => write!(f, "FAILED"),
            Self::TransferNotInProgress => write!(f, "TRANSFER_NOT_IN_PROGRESS"),
            Self::SplitNotInProgress => write!(f, "SPLIT_NOT_IN_PROGRESS"),
            Self::SplitInProgress => write!(f, "SPLIT_IN_PROGRESS"),
            Self::Other(_) => write!(f, "RESERVED"),
        }
    }
}
