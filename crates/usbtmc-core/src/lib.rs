//! USBTMC-Core: USB Test & Measurement Class driver in Rust.
//!
//! This crate talks to instruments (oscilloscopes, multimeters, power
//! supplies...) over the USBTMC bulk protocol and its USB488 extension,
//! exposing the byte-level `write`/`read`/`ask` contract that ASCII command
//! layers program against.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: Constants, transfer envelopes, status codes, capabilities, IEEE blocks
//! - **Transport**: USB host abstraction (nusb, mock)
//! - **Resource**: Address strings and device discovery
//! - **Quirks**: Vendor deviations resolved at open
//! - **Session**: Open/close lifecycle, message exchange, status and control
//!
//! # Example
//!
//! ```no_run
//! use usbtmc_core::{MessageTransport, SessionConfig, UsbtmcSession};
//!
//! let mut session = UsbtmcSession::system("USB::0x0957::0x1755::INSTR", SessionConfig::default());
//! session.open()?;
//! println!("{}", session.ask("*IDN?")?);
//! session.close()?;
//! # Ok::<(), usbtmc_core::UsbtmcError>(())
//! ```

mod control;
pub mod error;
mod exchange;
mod link;
mod negotiate;
pub mod protocol;
pub mod quirks;
pub mod resource;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use error::{Result, UsbtmcError};
pub use exchange::{MessageTransport, decode_response};
pub use link::{EndpointSet, StatusMode};
pub use protocol::{CapabilitySet, Envelope, MessageKind, UsbtmcStatus};
pub use quirks::QuirkProfile;
pub use resource::{DeviceAddress, ResourceSpec, list_devices, list_resources, resolve};
pub use session::{SessionConfig, UsbtmcSession};
pub use transport::{
    DeviceInfo, MockBus, MockDevice, NusbBus, NusbDevice, TransportError, UsbBus, UsbDevice,
};
