//! Status byte, device clear, trigger, indicator pulse, remote/local and
//! the vendor lock requests.

use tracing::{debug, info, instrument, warn};

use crate::error::{Result, UsbtmcError};
use crate::exchange::decode_response;
use crate::link::{Link, StatusMode, response_status};
use crate::protocol::constants::*;
use crate::protocol::{Envelope, MessageKind};
use crate::transport::{ControlSetup, UsbDevice};

impl<D: UsbDevice> Link<D> {
    pub fn read_status_byte(&mut self) -> Result<u8> {
        let endpoint = match self.status_mode {
            StatusMode::Basic => return self.query_status_byte(),
            StatusMode::ExtendedInterrupt(endpoint) => Some(endpoint),
            StatusMode::ExtendedControl => None,
        };

        let tag = self.status_tags.next_tag();
        let setup = ControlSetup::interface(READ_STATUS_BYTE, u16::from(tag), self.interface);
        let response = self.control_in(setup, 3, self.timing.timeout)?;
        let status = response_status(&response, "READ_STATUS_BYTE")?;
        if !status.is_success() {
            return Err(UsbtmcError::StatusReadFailed {
                code: status.code(),
            });
        }
        let echoed = *response.get(1).ok_or_else(|| short("READ_STATUS_BYTE", 2))?;
        if echoed != tag {
            return Err(UsbtmcError::TagMismatch {
                expected: tag,
                actual: echoed,
            });
        }

        let stb = match endpoint {
            Some(endpoint) => {
                let notification = self.device.interrupt_in(
                    endpoint,
                    INTERRUPT_NOTIFICATION_SIZE,
                    self.timing.timeout,
                )?;
                if notification.len() < INTERRUPT_NOTIFICATION_SIZE {
                    return Err(short("interrupt notification", INTERRUPT_NOTIFICATION_SIZE));
                }
                let expected = 0x80 | tag;
                if notification[0] != expected {
                    return Err(UsbtmcError::TagMismatch {
                        expected,
                        actual: notification[0],
                    });
                }
                notification[1]
            }
            None => *response.get(2).ok_or_else(|| short("READ_STATUS_BYTE", 3))?,
        };
        debug!(tag, stb = format!("0x{stb:02X}"), "Status byte");
        Ok(stb)
    }

    fn query_status_byte(&mut self) -> Result<u8> {
        self.write_message(STATUS_BYTE_QUERY.as_bytes())?;
        let text = decode_response(&self.read_message()?);
        text.trim()
            .parse()
            .map_err(|_| UsbtmcError::InvalidResponse(format!("{STATUS_BYTE_QUERY} returned {text:?}")))
    }

    /// Device clear: INITIATE_CLEAR, poll CHECK_CLEAR_STATUS, then clear
    /// the bulk OUT halt.
    #[instrument(level = "info", skip_all)]
    pub fn clear(&mut self) -> Result<()> {
        let setup = ControlSetup::interface(INITIATE_CLEAR, 0, self.interface);
        let response = self.control_in(setup, 1, self.timing.abort_timeout)?;
        let status = response_status(&response, "INITIATE_CLEAR")?;
        if !status.is_success() {
            return Err(UsbtmcError::ClearFailed {
                code: status.code(),
            });
        }

        let setup = ControlSetup::interface(CHECK_CLEAR_STATUS, 0, self.interface);
        let response = self.poll_status("CLEAR", setup, 2, |link, response| {
            // bmClear D0: the device still has data for the host.
            if response.get(1).is_some_and(|flags| flags & 0x01 != 0) {
                link.drain_bulk_in();
            }
        })?;
        let status = response_status(&response, "CHECK_CLEAR_STATUS")?;
        if !status.is_success() {
            return Err(UsbtmcError::ClearFailed {
                code: status.code(),
            });
        }

        self.device.clear_halt(self.endpoints.bulk_out)?;
        info!("Device cleared");
        Ok(())
    }

    pub fn trigger(&mut self) -> Result<()> {
        if self.capabilities.is_extended() && self.capabilities.supports_trigger {
            let tag = self.tags.next_tag();
            let message = Envelope::new(MessageKind::Trigger, tag, 0, false).to_bytes();
            self.send(tag, &message)
        } else {
            self.write_message(TRIGGER_COMMAND.as_bytes())
        }
    }

    /// Blink the activity indicator. Returns `false` without touching the
    /// device when it cannot pulse.
    pub fn pulse(&mut self) -> Result<bool> {
        if !self.capabilities.supports_pulse {
            debug!("Indicator pulse not supported");
            return Ok(false);
        }
        let setup = ControlSetup::interface(INDICATOR_PULSE, 0, self.interface);
        self.request_ok("INDICATOR_PULSE", setup, 1)?;
        Ok(true)
    }

    fn require_remote_local(&self) -> Result<()> {
        if self.capabilities.supports_remote_local {
            Ok(())
        } else {
            Err(UsbtmcError::NotSupported("remote/local control".into()))
        }
    }

    /// Assert (or deassert) remote enable.
    pub fn remote_control(&mut self, enable: bool) -> Result<()> {
        self.require_remote_local()?;
        let setup = ControlSetup::interface(REN_CONTROL, u16::from(enable), self.interface);
        self.request_ok("REN_CONTROL", setup, 1)?;
        self.remote = enable;
        Ok(())
    }

    pub fn go_to_local(&mut self) -> Result<()> {
        self.require_remote_local()?;
        let setup = ControlSetup::interface(GO_TO_LOCAL, 0, self.interface);
        self.request_ok("GO_TO_LOCAL", setup, 1)?;
        Ok(())
    }

    pub fn local_lockout(&mut self) -> Result<()> {
        self.require_remote_local()?;
        let setup = ControlSetup::interface(LOCAL_LOCKOUT, 0, self.interface);
        self.request_ok("LOCAL_LOCKOUT", setup, 1)?;
        Ok(())
    }

    fn require_lockable(&self, operation: &str) -> Result<()> {
        if self.quirk.is_lockable() {
            Ok(())
        } else {
            Err(UsbtmcError::NotSupported(format!(
                "{operation} on {:04X}:{:04X}",
                self.info.vendor_id, self.info.product_id
            )))
        }
    }

    fn set_front_panel_lock(&mut self, locked: bool) -> Result<()> {
        let setup = ControlSetup::interface(ADVANTEST_LOCK, u16::from(locked), self.interface);
        self.control_in(setup, 1, self.timing.timeout)?;
        self.locked = locked;
        info!(locked, "Front panel lock");
        Ok(())
    }

    pub fn lock(&mut self) -> Result<()> {
        self.require_lockable("lock")?;
        self.set_front_panel_lock(true)
    }

    pub fn unlock(&mut self) -> Result<()> {
        self.require_lockable("unlock")?;
        self.set_front_panel_lock(false)
    }

    /// Diagnostic id of a lockable instrument. Transfer failures give `None`.
    pub fn read_vendor_id(&mut self) -> Result<Option<u8>> {
        self.require_lockable("read_vendor_id")?;
        let setup = ControlSetup::vendor(ADVANTEST_READ_MYID, 0, u16::from(self.interface));
        match self.control_in(setup, 1, self.timing.timeout) {
            Ok(response) => Ok(response.first().copied()),
            Err(e) => {
                warn!(error = %e, "Reading vendor id failed");
                Ok(None)
            }
        }
    }
}

fn short(what: &str, expected: usize) -> UsbtmcError {
    UsbtmcError::InvalidResponse(format!("{what} shorter than {expected} bytes"))
}
