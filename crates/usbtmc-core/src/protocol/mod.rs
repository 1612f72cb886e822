//! Protocol module - USBTMC/USB488 wire definitions.

pub mod block;
pub mod capabilities;
pub mod constants;
pub mod envelope;
pub mod status;

pub use block::{BlockHeader, is_pending_marker};
pub use capabilities::{CapabilityError, CapabilitySet};
pub use constants::*;
pub use envelope::{Envelope, EnvelopeError, MessageKind, StatusTagCounter, TagCounter};
pub use status::UsbtmcStatus;
