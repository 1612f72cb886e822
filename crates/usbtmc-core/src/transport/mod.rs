//! Transport layer module.

pub mod mock;
pub mod nusb;
pub mod traits;

pub use mock::{MockBus, MockDevice, UsbCall};
pub use nusb::{NusbBus, NusbDevice};
pub use traits::{
    ConfigurationInfo, ControlSetup, DeviceInfo, Direction, EndpointInfo, EndpointKind,
    InterfaceClass, InterfaceInfo, Recipient, RequestType, TransportError, UsbBus, UsbDevice,
};
