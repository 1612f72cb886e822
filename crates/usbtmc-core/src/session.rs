//! USBTMC session: configuration, open/close lifecycle and the public
//! instrument operations.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::error::{Result, UsbtmcError};
use crate::exchange::MessageTransport;
use crate::link::{EndpointSet, Link, StatusMode};
use crate::protocol::CapabilitySet;
use crate::protocol::constants::*;
use crate::quirks::QuirkProfile;
use crate::resource::{ResourceSpec, resolve};
use crate::transport::{DeviceInfo, NusbBus, UsbBus};

/// Configuration for a USBTMC session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Bulk transfer timeout in milliseconds.
    pub timeout_ms: u64,
    /// Timeout of abort and clear requests in milliseconds.
    pub abort_timeout_ms: u64,
    /// Delay between abort/clear status polls in milliseconds.
    pub poll_interval_ms: u64,
    /// Status polls before an abort or clear gives up.
    pub max_status_polls: u32,
    /// Largest payload per envelope.
    pub max_transfer_size: u32,
    /// Read termination character, used when the device supports it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub term_char: Option<u8>,
    /// Call set-configuration even when a configuration is active.
    pub force_reconfigure: bool,
    /// Assert local lockout after taking remote control.
    pub local_lockout: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT.as_millis() as u64,
            abort_timeout_ms: DEFAULT_ABORT_TIMEOUT.as_millis() as u64,
            poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
            max_status_polls: DEFAULT_MAX_STATUS_POLLS,
            max_transfer_size: DEFAULT_MAX_TRANSFER_SIZE,
            term_char: None,
            force_reconfigure: false,
            local_lockout: false,
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SessionConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn abort_timeout(&self) -> Duration {
        Duration::from_millis(self.abort_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// A session with one instrument.
///
/// Created closed. [`open`](Self::open) resolves the resource and
/// negotiates the device, or leaves the session closed on any failure.
/// Transfers on a closed session fail with [`UsbtmcError::NotOpen`].
/// Dropping an open session closes it.
pub struct UsbtmcSession<B: UsbBus = NusbBus> {
    bus: B,
    resource: ResourceSpec,
    config: SessionConfig,
    link: Option<Link<B::Device>>,
}

impl UsbtmcSession<NusbBus> {
    /// Session on the system USB bus.
    pub fn system(resource: impl Into<ResourceSpec>, config: SessionConfig) -> Self {
        Self::new(NusbBus::new(), resource, config)
    }
}

impl<B: UsbBus> UsbtmcSession<B> {
    pub fn new(bus: B, resource: impl Into<ResourceSpec>, config: SessionConfig) -> Self {
        Self {
            bus,
            resource: resource.into(),
            config,
            link: None,
        }
    }

    /// Open the instrument. Does nothing if already open.
    #[instrument(level = "info", skip(self), fields(resource = %self.resource))]
    pub fn open(&mut self) -> Result<()> {
        if self.link.is_some() {
            return Ok(());
        }
        let info = resolve(&self.bus, &self.resource)?;
        info!(
            vid = format!("{:04X}", info.vendor_id),
            pid = format!("{:04X}", info.product_id),
            serial = info.serial_number.as_deref().unwrap_or(""),
            "Device found"
        );
        let device = self.bus.open(&info)?;
        self.link = Some(Link::open(device, info, &self.config)?);
        Ok(())
    }

    /// Return the instrument to local control and release it. Safe to call
    /// on a closed session.
    pub fn close(&mut self) -> Result<()> {
        match self.link.take() {
            Some(mut link) => link.teardown(),
            None => Ok(()),
        }
    }

    pub fn is_open(&self) -> bool {
        self.link.is_some()
    }

    fn link(&mut self) -> Result<&mut Link<B::Device>> {
        self.link.as_mut().ok_or(UsbtmcError::NotOpen)
    }

    pub fn resource(&self) -> &ResourceSpec {
        &self.resource
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn device_info(&self) -> Option<&DeviceInfo> {
        self.link.as_ref().map(|link| &link.info)
    }

    pub fn capabilities(&self) -> Option<&CapabilitySet> {
        self.link.as_ref().map(|link| &link.capabilities)
    }

    pub fn endpoints(&self) -> Option<EndpointSet> {
        self.link.as_ref().map(|link| link.endpoints)
    }

    pub fn quirk(&self) -> Option<QuirkProfile> {
        self.link.as_ref().map(|link| link.quirk)
    }

    pub fn status_mode(&self) -> Option<StatusMode> {
        self.link.as_ref().map(|link| link.status_mode)
    }

    /// Tag of the most recent bulk transfer.
    pub fn current_tag(&self) -> Option<u8> {
        self.link.as_ref().map(|link| link.tags.current())
    }

    pub fn is_locked(&self) -> bool {
        self.link.as_ref().is_some_and(|link| link.locked)
    }

    pub fn is_remote(&self) -> bool {
        self.link.as_ref().is_some_and(|link| link.remote)
    }

    pub fn timeout(&self) -> Duration {
        self.config.timeout()
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.config.timeout_ms = timeout.as_millis() as u64;
        if let Some(link) = self.link.as_mut() {
            link.timing.timeout = timeout;
        }
    }

    pub fn clear(&mut self) -> Result<()> {
        self.link()?.clear()
    }

    pub fn trigger(&mut self) -> Result<()> {
        self.link()?.trigger()
    }

    /// Returns `false` when the device has no indicator to pulse.
    pub fn pulse(&mut self) -> Result<bool> {
        self.link()?.pulse()
    }

    pub fn remote_control(&mut self, enable: bool) -> Result<()> {
        self.link()?.remote_control(enable)
    }

    pub fn go_to_local(&mut self) -> Result<()> {
        self.link()?.go_to_local()
    }

    pub fn local_lockout(&mut self) -> Result<()> {
        self.link()?.local_lockout()
    }

    pub fn lock(&mut self) -> Result<()> {
        self.link()?.lock()
    }

    pub fn unlock(&mut self) -> Result<()> {
        self.link()?.unlock()
    }

    /// Diagnostic id of lockable instruments; `None` if the device did not
    /// answer.
    pub fn read_vendor_id(&mut self) -> Result<Option<u8>> {
        self.link()?.read_vendor_id()
    }
}

impl<B: UsbBus> MessageTransport for UsbtmcSession<B> {
    fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        self.link()?.write_message(data)
    }

    fn read_raw(&mut self) -> Result<Vec<u8>> {
        self.link()?.read_message()
    }

    fn read_status_byte(&mut self) -> Result<u8> {
        self.link()?.read_status_byte()
    }
}

impl<B: UsbBus> Drop for UsbtmcSession<B> {
    fn drop(&mut self) {
        // Teardown already logs each failed step.
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::negotiate::tests::test_config;
    use crate::transport::{MockBus, MockDevice, UsbCall};

    fn session_with(vendor_id: u16, device: MockDevice) -> UsbtmcSession<MockBus> {
        let mut bus = MockBus::new();
        let info = bus.attach(DeviceInfo::new(vendor_id, 0x0001), device);
        UsbtmcSession::new(bus, info, test_config())
    }

    #[test]
    fn test_config_defaults_and_toml() {
        let config: SessionConfig = toml::from_str("timeout_ms = 250\nterm_char = 10\n").unwrap();
        assert_eq!(config.timeout(), Duration::from_millis(250));
        assert_eq!(config.term_char, Some(b'\n'));
        assert_eq!(config.max_status_polls, DEFAULT_MAX_STATUS_POLLS);
        assert_eq!(config.abort_timeout(), DEFAULT_ABORT_TIMEOUT);
    }

    #[test]
    fn test_config_file_round_trip() {
        let path = std::env::temp_dir().join(format!("usbtmc-config-{}.toml", std::process::id()));
        let config = SessionConfig {
            max_transfer_size: 4096,
            local_lockout: true,
            ..SessionConfig::default()
        };
        config.save_to_file(&path).unwrap();
        let loaded = SessionConfig::load_from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_open_unknown_address_stays_closed() {
        let mut session = UsbtmcSession::new(
            MockBus::new(),
            "USB::0x0957::0x1755::INSTR",
            test_config(),
        );
        assert!(matches!(session.open(), Err(UsbtmcError::NotFound(_))));
        assert!(!session.is_open());

        let mut session = UsbtmcSession::new(MockBus::new(), "USB::nonsense", test_config());
        assert!(matches!(session.open(), Err(UsbtmcError::InvalidSpec(_))));
        assert!(!session.is_open());
    }

    #[test]
    fn test_closed_session_refuses_transfers() {
        let device = MockDevice::usbtmc();
        let mut session = session_with(0x0957, device.clone());
        assert!(matches!(session.write("*RST"), Err(UsbtmcError::NotOpen)));
        assert!(matches!(session.read_raw(), Err(UsbtmcError::NotOpen)));
        assert!(matches!(session.clear(), Err(UsbtmcError::NotOpen)));
        assert!(device.calls().is_empty());
    }

    #[test]
    fn test_open_is_idempotent() {
        let device = MockDevice::usbtmc();
        let mut session = session_with(0x0957, device.clone());
        session.open().unwrap();
        device.clear_calls();
        session.open().unwrap();
        assert!(device.calls().is_empty());
        assert_eq!(session.quirk(), Some(QuirkProfile::Standard));
        assert_eq!(session.current_tag(), Some(0));
    }

    #[test]
    fn test_ask_and_ask_many() {
        let device = MockDevice::usbtmc();
        let mut session = session_with(0x0957, device.clone());
        session.open().unwrap();

        device.queue_response(b"AGILENT,34401A,0,1.0\r\n", true);
        assert_eq!(session.ask("*IDN?").unwrap(), "AGILENT,34401A,0,1.0");

        device.queue_response(b"1\n", true);
        device.queue_response(b"2\n", true);
        assert_eq!(
            session.ask_many(&["A?", "B?"]).unwrap(),
            vec!["1".to_string(), "2".to_string()]
        );
        // Three write/read pairs so far: tags 1..=6.
        assert_eq!(session.current_tag(), Some(6));
        assert_eq!(device.bulk_writes().len(), 6);

        device.queue_response(&[0x00, 0xFF], true);
        assert_eq!(session.ask_raw(b"DATA?").unwrap(), vec![0x00, 0xFF]);
    }

    #[test]
    fn test_ieee_block_scenario() {
        let device = MockDevice::usbtmc();
        let mut session = session_with(0x1AB1, device.clone());
        session.open().unwrap();
        assert_eq!(session.quirk(), Some(QuirkProfile::IeeeBlock));

        device.queue_response(b"#00", true);
        device.queue_bulk_in(b"#212000321000321");
        assert_eq!(
            session.ask_raw(b":WAV:DATA?").unwrap(),
            b"000321000321".to_vec()
        );
    }

    #[test]
    fn test_lock_scenario() {
        let device = MockDevice::usbtmc();
        let mut session = session_with(0x0957, device);
        session.open().unwrap();
        assert!(matches!(session.lock(), Err(UsbtmcError::NotSupported(_))));
        assert!(matches!(session.unlock(), Err(UsbtmcError::NotSupported(_))));

        let device = MockDevice::usbtmc();
        device.set_control_default(ADVANTEST_LOCK, &[STATUS_SUCCESS]);
        let mut session = session_with(0x1334, device);
        session.open().unwrap();
        session.lock().unwrap();
        assert!(session.is_locked());
        session.unlock().unwrap();
        assert!(!session.is_locked());
    }

    #[test]
    fn test_close_restores_everything() {
        let device = MockDevice::usb488(false);
        device.set_kernel_driver_active(true);
        device.set_capabilities(0, 0, 0x02, 0);
        device.set_control_default(REN_CONTROL, &[STATUS_SUCCESS]);
        device.set_control_default(GO_TO_LOCAL, &[STATUS_SUCCESS]);

        let mut session = session_with(0x0957, device.clone());
        session.open().unwrap();
        assert!(session.is_remote());
        device.clear_calls();

        session.close().unwrap();
        assert!(!session.is_open());
        assert_eq!(
            device.calls(),
            vec![
                UsbCall::ControlIn {
                    setup: crate::transport::ControlSetup::interface(GO_TO_LOCAL, 0, 0),
                    length: 1
                },
                UsbCall::ControlIn {
                    setup: crate::transport::ControlSetup::interface(REN_CONTROL, 0, 0),
                    length: 1
                },
                UsbCall::ReleaseInterface(0),
                UsbCall::AttachKernelDriver(0),
            ]
        );
        assert!(device.kernel_driver_active());

        device.clear_calls();
        session.close().unwrap();
        assert!(device.calls().is_empty());
    }

    #[test]
    fn test_close_unlocks_locked_instrument() {
        let device = MockDevice::usbtmc();
        device.set_control_default(ADVANTEST_LOCK, &[STATUS_SUCCESS]);
        let mut session = session_with(0x1334, device.clone());
        session.open().unwrap();
        session.lock().unwrap();
        device.clear_calls();

        session.close().unwrap();
        assert_eq!(
            device.calls()[0],
            UsbCall::ControlIn {
                setup: crate::transport::ControlSetup::interface(ADVANTEST_LOCK, 0, 0),
                length: 1
            }
        );
    }

    #[test]
    fn test_drop_releases_interface() {
        let device = MockDevice::usbtmc();
        {
            let mut session = session_with(0x0957, device.clone());
            session.open().unwrap();
            assert_eq!(device.claimed_interface(), Some(0));
        }
        assert_eq!(device.claimed_interface(), None);
    }

    #[test]
    fn test_set_timeout_applies_to_open_session() {
        let device = MockDevice::usbtmc();
        let mut session = session_with(0x0957, device);
        session.open().unwrap();
        session.set_timeout(Duration::from_millis(1234));
        assert_eq!(session.timeout(), Duration::from_millis(1234));
        assert_eq!(session.config().timeout_ms, 1234);
    }
}
