//! State of an open USBTMC connection.
//!
//! A [`Link`] exists only while a session is open, so nothing here can run
//! against a closed device. Opening lives in `negotiate`, message transfers
//! in `exchange` and status/control requests in `control`.

use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{Result, UsbtmcError};
use crate::protocol::{CapabilitySet, StatusTagCounter, TagCounter, UsbtmcStatus};
use crate::quirks::QuirkProfile;
use crate::session::SessionConfig;
use crate::transport::{ControlSetup, DeviceInfo, UsbDevice};

/// Endpoints of the claimed interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointSet {
    pub bulk_out: u8,
    pub bulk_in: u8,
    pub interrupt_in: Option<u8>,
}

/// How the status byte is obtained, fixed at open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusMode {
    /// USB488 READ_STATUS_BYTE, answered on the interrupt endpoint.
    ExtendedInterrupt(u8),
    /// USB488 READ_STATUS_BYTE, answered in the control response.
    ExtendedControl,
    /// `*STB?` query.
    Basic,
}

impl StatusMode {
    pub fn is_extended(self) -> bool {
        !matches!(self, Self::Basic)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Timing {
    pub timeout: Duration,
    pub abort_timeout: Duration,
    pub poll_interval: Duration,
    pub max_polls: u32,
}

impl From<&SessionConfig> for Timing {
    fn from(config: &SessionConfig) -> Self {
        Self {
            timeout: config.timeout(),
            abort_timeout: config.abort_timeout(),
            poll_interval: config.poll_interval(),
            max_polls: config.max_status_polls.max(1),
        }
    }
}

pub(crate) struct Link<D: UsbDevice> {
    pub device: D,
    pub info: DeviceInfo,
    pub interface: u8,
    pub endpoints: EndpointSet,
    pub capabilities: CapabilitySet,
    pub quirk: QuirkProfile,
    pub status_mode: StatusMode,
    pub tags: TagCounter,
    pub status_tags: StatusTagCounter,
    pub timing: Timing,
    pub max_transfer_size: u32,
    pub term_char: Option<u8>,
    /// The OS driver was detached at open and goes back at close.
    pub kernel_driver_detached: bool,
    pub remote: bool,
    pub locked: bool,
}

/// First byte of a control response, as a status.
pub(crate) fn response_status(response: &[u8], request: &'static str) -> Result<UsbtmcStatus> {
    response
        .first()
        .map(|&code| UsbtmcStatus::from_byte(code))
        .ok_or_else(|| UsbtmcError::InvalidResponse(format!("{request} returned no data")))
}

impl<D: UsbDevice> Link<D> {
    pub fn control_in(
        &mut self,
        setup: ControlSetup,
        length: u16,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        debug!(
            request = setup.request,
            value = setup.value,
            index = setup.index,
            "Control request"
        );
        Ok(self.device.control_in(setup, length, timeout)?)
    }

    /// Issue a request whose response starts with a status byte that must
    /// be success.
    pub fn request_ok(
        &mut self,
        request: &'static str,
        setup: ControlSetup,
        length: u16,
    ) -> Result<Vec<u8>> {
        let response = self.control_in(setup, length, self.timing.timeout)?;
        let status = response_status(&response, request)?;
        if !status.is_success() {
            return Err(UsbtmcError::RequestFailed {
                request,
                code: status.code(),
            });
        }
        Ok(response)
    }

    /// Poll a CHECK_*_STATUS request until it stops reporting pending and
    /// return that response. `on_pending` runs between polls.
    pub fn poll_status<F>(
        &mut self,
        operation: &'static str,
        setup: ControlSetup,
        length: u16,
        mut on_pending: F,
    ) -> Result<Vec<u8>>
    where
        F: FnMut(&mut Self, &[u8]),
    {
        for _ in 0..self.timing.max_polls {
            if !self.timing.poll_interval.is_zero() {
                thread::sleep(self.timing.poll_interval);
            }
            let response = self.control_in(setup, length, self.timing.abort_timeout)?;
            if !response_status(&response, operation)?.is_pending() {
                return Ok(response);
            }
            debug!(operation, "Status pending");
            on_pending(self, &response);
        }
        Err(UsbtmcError::Unfinished {
            operation,
            polls: self.timing.max_polls,
        })
    }

    /// Read and drop one bulk IN transfer left over from an aborted or
    /// cleared message.
    pub fn drain_bulk_in(&mut self) {
        let len = self.max_transfer_size as usize + crate::protocol::HEADER_SIZE;
        match self
            .device
            .bulk_in(self.endpoints.bulk_in, len, self.timing.abort_timeout)
        {
            Ok(data) => warn!(bytes = data.len(), "Dropped stale bulk IN data"),
            Err(e) => debug!(error = %e, "Nothing to drain"),
        }
    }

    /// Hand the device back: local control, unlock, release the interface
    /// and reattach the kernel driver. Every step runs even if an earlier
    /// one fails; the first failure is returned.
    pub fn teardown(&mut self) -> Result<()> {
        let mut first_error: Option<UsbtmcError> = None;
        let mut note = |step: &'static str, result: Result<()>| {
            if let Err(e) = result {
                warn!(step, error = %e, "Teardown step failed");
                first_error.get_or_insert(e);
            }
        };

        if self.remote {
            note("go_to_local", self.go_to_local());
            note("remote_control", self.remote_control(false));
            self.remote = false;
        }
        if self.locked {
            note("unlock", self.unlock());
            self.locked = false;
        }

        let interface = self.interface;
        note(
            "release_interface",
            self.device
                .release_interface(interface)
                .map_err(UsbtmcError::from),
        );
        if self.kernel_driver_detached {
            note(
                "attach_kernel_driver",
                self.device
                    .attach_kernel_driver(interface)
                    .map_err(UsbtmcError::from),
            );
            self.kernel_driver_detached = false;
        }

        info!(
            vid = format!("{:04X}", self.info.vendor_id),
            pid = format!("{:04X}", self.info.product_id),
            "Device closed"
        );
        first_error.map_or(Ok(()), Err)
    }
}
