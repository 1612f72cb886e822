//! Message exchange over the bulk endpoints, with abort recovery on timeout.

use tracing::{debug, instrument, warn};

use crate::error::{Result, UsbtmcError};
use crate::link::{Link, response_status};
use crate::protocol::constants::*;
use crate::protocol::{BlockHeader, Envelope, MessageKind, is_pending_marker};
use crate::transport::{ControlSetup, UsbDevice};

/// Byte-level contract shared by every instrument transport. Text helpers
/// are provided on top of the three required methods.
pub trait MessageTransport {
    fn write_raw(&mut self, data: &[u8]) -> Result<()>;

    /// Read one complete response message.
    fn read_raw(&mut self) -> Result<Vec<u8>>;

    fn read_status_byte(&mut self) -> Result<u8>;

    fn ask_raw(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        self.write_raw(data)?;
        self.read_raw()
    }

    fn write(&mut self, command: &str) -> Result<()> {
        self.write_raw(command.as_bytes())
    }

    fn read(&mut self) -> Result<String> {
        Ok(decode_response(&self.read_raw()?))
    }

    fn ask(&mut self, command: &str) -> Result<String> {
        self.write(command)?;
        self.read()
    }

    /// One write/read pair per command, in order.
    fn ask_many<S: AsRef<str>>(&mut self, commands: &[S]) -> Result<Vec<String>>
    where
        Self: Sized,
    {
        commands
            .iter()
            .map(|command| self.ask(command.as_ref()))
            .collect()
    }
}

/// Response text without the trailing line terminator.
pub fn decode_response(data: &[u8]) -> String {
    String::from_utf8_lossy(data)
        .trim_end_matches(['\r', '\n'])
        .to_string()
}

impl<D: UsbDevice> Link<D> {
    fn read_len(&self) -> usize {
        // Header plus room for alignment padding.
        self.max_transfer_size as usize + HEADER_SIZE + 3
    }

    /// Term char for data-in requests, if configured and supported.
    fn request_term_char(&self) -> Option<u8> {
        self.term_char
            .filter(|_| self.capabilities.supports_term_char)
    }

    /// One bulk OUT transfer. A timeout aborts the transfer tagged `tag`
    /// before the timeout is returned.
    pub fn send(&mut self, tag: u8, message: &[u8]) -> Result<()> {
        let endpoint = self.endpoints.bulk_out;
        match self.device.bulk_out(endpoint, message, self.timing.timeout) {
            Ok(written) => {
                debug!(tag, bytes = written, "Bulk OUT");
                Ok(())
            }
            Err(e) if e.is_timeout() => {
                self.abort_bulk_out(tag);
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// One bulk IN transfer, aborting `tag` on timeout.
    fn receive(&mut self, tag: u8) -> Result<Vec<u8>> {
        let endpoint = self.endpoints.bulk_in;
        let len = self.read_len();
        match self.device.bulk_in(endpoint, len, self.timing.timeout) {
            Ok(data) => {
                debug!(tag, bytes = data.len(), "Bulk IN");
                Ok(data)
            }
            Err(e) if e.is_timeout() => {
                self.abort_bulk_in(tag);
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Request a response message and return its first transfer's envelope
    /// and the bytes after it.
    fn request_response(&mut self) -> Result<(Envelope, Vec<u8>, u8)> {
        let tag = self.tags.next_tag();
        let request =
            Envelope::request_in(tag, self.max_transfer_size, self.request_term_char()).to_bytes();
        self.send(tag, &request)?;

        let mut raw = self.receive(tag)?;
        let header = Envelope::from_bytes(&raw, MessageKind::DevDepMsgIn)?;
        if header.tag != tag {
            return Err(UsbtmcError::TagMismatch {
                expected: tag,
                actual: header.tag,
            });
        }
        Ok((header, raw.split_off(HEADER_SIZE), tag))
    }

    /// Keep reading bulk IN transfers onto `data` until it holds `len` bytes.
    fn read_until(&mut self, tag: u8, data: &mut Vec<u8>, len: usize) -> Result<()> {
        while data.len() < len {
            let more = self.receive(tag)?;
            if more.is_empty() {
                return Err(UsbtmcError::InvalidResponse(format!(
                    "message ended after {} of {len} bytes",
                    data.len()
                )));
            }
            data.extend_from_slice(&more);
        }
        Ok(())
    }

    /// Send `data` as one message. Long messages are split into several
    /// envelopes unless the quirk profile forbids it.
    #[instrument(level = "debug", skip_all, fields(len = data.len()))]
    pub fn write_message(&mut self, data: &[u8]) -> Result<()> {
        let max = self.max_transfer_size as usize;
        let fragments: Vec<&[u8]> = if self.quirk.fragments_writes() && data.len() > max {
            data.chunks(max).collect()
        } else {
            vec![data]
        };

        let last = fragments.len() - 1;
        for (i, fragment) in fragments.into_iter().enumerate() {
            let tag = self.tags.next_tag();
            let message = Envelope::new(
                MessageKind::DevDepMsgOut,
                tag,
                fragment.len() as u32,
                i == last,
            )
            .frame(fragment);
            self.send(tag, &message)?;
        }
        Ok(())
    }

    /// Read one complete response message.
    #[instrument(level = "debug", skip_all)]
    pub fn read_message(&mut self) -> Result<Vec<u8>> {
        if self.quirk.reads_ieee_blocks() {
            return self.read_block_message();
        }

        let mut message = Vec::new();
        loop {
            let (header, mut data, tag) = self.request_response()?;
            let size = header.transfer_size as usize;
            self.read_until(tag, &mut data, size)?;
            data.truncate(size);
            message.extend_from_slice(&data);
            if header.end_of_message {
                break;
            }
        }
        debug!(bytes = message.len(), "Message read");
        Ok(message)
    }

    /// Read under the IEEE-block profile. Only the first transfer carries
    /// an envelope, whose size cannot be trusted for block data; the block
    /// prefix decides how much follows and is stripped from the result.
    fn read_block_message(&mut self) -> Result<Vec<u8>> {
        let (header, mut data, tag) = self.request_response()?;
        let mut size = header.transfer_size as usize;
        data.truncate(size);

        if is_pending_marker(&data) {
            debug!("Block pending, reading again");
            data = self.receive(tag)?;
            size = data.len();
        }

        match BlockHeader::parse(&data) {
            Some(block) if !block.indefinite => {
                let total = block.header_len + block.length;
                self.read_until(tag, &mut data, total)?;
                data.truncate(total);
                Ok(data.split_off(block.header_len))
            }
            // Indefinite block: the data runs to the end of the transfer.
            Some(block) => {
                self.read_until(tag, &mut data, size)?;
                data.truncate(size);
                Ok(data.split_off(block.header_len))
            }
            None => {
                self.read_until(tag, &mut data, size)?;
                data.truncate(size);
                Ok(data)
            }
        }
    }

    /// Abort the bulk OUT transfer `tag` and, once the abort has reached a
    /// terminal status, clear the endpoint halt. Failures are logged; the
    /// caller reports the original timeout.
    pub fn abort_bulk_out(&mut self, tag: u8) {
        let endpoint = self.endpoints.bulk_out;
        warn!(tag, endpoint = format!("0x{endpoint:02X}"), "Bulk OUT timed out, aborting");
        let finished = self.abort_transfer(
            "ABORT_BULK_OUT",
            INITIATE_ABORT_BULK_OUT,
            CHECK_ABORT_BULK_OUT_STATUS,
            tag,
            endpoint,
        );
        if finished {
            if let Err(e) = self.device.clear_halt(endpoint) {
                warn!(error = %e, "Clear halt failed");
            }
        }
    }

    /// Abort the bulk IN transfer `tag`. Failures are logged.
    pub fn abort_bulk_in(&mut self, tag: u8) {
        let endpoint = self.endpoints.bulk_in;
        warn!(tag, endpoint = format!("0x{endpoint:02X}"), "Bulk IN timed out, aborting");
        self.abort_transfer(
            "ABORT_BULK_IN",
            INITIATE_ABORT_BULK_IN,
            CHECK_ABORT_BULK_IN_STATUS,
            tag,
            endpoint,
        );
    }

    /// INITIATE_ABORT then CHECK_ABORT_STATUS until terminal. Returns whether
    /// polling reached a terminal status, successful or not.
    fn abort_transfer(
        &mut self,
        operation: &'static str,
        initiate: u8,
        check: u8,
        tag: u8,
        endpoint: u8,
    ) -> bool {
        let timeout = self.timing.abort_timeout;
        let setup = ControlSetup::endpoint(initiate, u16::from(tag), endpoint);
        let status = self
            .control_in(setup, 2, timeout)
            .and_then(|response| response_status(&response, operation));
        match status {
            Ok(status) if status.is_success() => {}
            Ok(status) => {
                warn!(operation, status = %status, "Abort not started");
                return false;
            }
            Err(e) => {
                warn!(operation, error = %e, "Abort request failed");
                return false;
            }
        }

        let drains = check == CHECK_ABORT_BULK_IN_STATUS;
        let setup = ControlSetup::endpoint(check, 0, endpoint);
        let result = self.poll_status(operation, setup, 8, |link, response| {
            // bmAbortBulkIn D0: data is still queued on the IN endpoint.
            if drains && response.get(1).is_some_and(|flags| flags & 0x01 != 0) {
                link.drain_bulk_in();
            }
        });
        match result.and_then(|response| response_status(&response, operation)) {
            Ok(status) if status.is_success() => {
                debug!(operation, "Abort complete");
                true
            }
            Ok(status) => {
                warn!(operation, status = %status, "Abort failed");
                true
            }
            Err(e) => {
                warn!(operation, error = %e, "Abort did not finish");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::negotiate::tests::open_link;
    use crate::transport::{MockDevice, TransportError, UsbCall};

    fn data_out(tag: u8, payload: &[u8], eom: bool) -> Vec<u8> {
        Envelope::new(MessageKind::DevDepMsgOut, tag, payload.len() as u32, eom).frame(payload)
    }

    #[test]
    fn test_write_single_envelope() {
        let device = MockDevice::usbtmc();
        let mut link = open_link(&device, 0x0957);
        link.write_message(b"*IDN?\n").unwrap();

        assert_eq!(device.bulk_writes(), vec![data_out(1, b"*IDN?\n", true)]);
        assert_eq!(link.tags.current(), 1);
    }

    #[test]
    fn test_write_fragments_long_messages() {
        let device = MockDevice::usbtmc();
        let mut link = open_link(&device, 0x0957);
        link.max_transfer_size = 4;
        link.write_message(b"ABCDEFGHIJ").unwrap();

        assert_eq!(
            device.bulk_writes(),
            vec![
                data_out(1, b"ABCD", false),
                data_out(2, b"EFGH", false),
                data_out(3, b"IJ", true),
            ]
        );
    }

    #[test]
    fn test_ieee_block_profile_never_fragments() {
        let device = MockDevice::usbtmc();
        let mut link = open_link(&device, 0x1AB1);
        link.max_transfer_size = 4;
        link.write_message(b"ABCDEFGHIJ").unwrap();
        assert_eq!(device.bulk_writes(), vec![data_out(1, b"ABCDEFGHIJ", true)]);
    }

    #[test]
    fn test_read_single_transfer() {
        let device = MockDevice::usbtmc();
        let mut link = open_link(&device, 0x0957);
        device.queue_response(b"KEYSIGHT,34461A\n", true);

        assert_eq!(link.read_message().unwrap(), b"KEYSIGHT,34461A\n");
        let request = Envelope::request_in(1, DEFAULT_MAX_TRANSFER_SIZE, None).to_bytes();
        assert_eq!(device.bulk_writes(), vec![request]);
    }

    #[test]
    fn test_read_concatenates_until_end_of_message() {
        let device = MockDevice::usbtmc();
        let mut link = open_link(&device, 0x0957);
        device.queue_response(b"1,2,", false);
        device.queue_response(b"3\n", true);

        assert_eq!(link.read_message().unwrap(), b"1,2,3\n");
        // One data-in request per response envelope.
        assert_eq!(device.bulk_writes().len(), 2);
    }

    #[test]
    fn test_read_follows_declared_size_across_transfers() {
        let device = MockDevice::usbtmc();
        let mut link = open_link(&device, 0x0957);
        let mut first = Envelope::new(MessageKind::DevDepMsgIn, 1, 10, true).to_bytes();
        first.extend_from_slice(b"01234");
        device.queue_bulk_in(&first);
        device.queue_bulk_in(b"56789\0\0");

        assert_eq!(link.read_message().unwrap(), b"0123456789");
    }

    #[test]
    fn test_read_sends_supported_term_char() {
        let device = MockDevice::usbtmc();
        device.set_capabilities(0, 0x01, 0, 0);
        let mut link = open_link(&device, 0x0957);
        link.term_char = Some(b'\n');
        device.queue_response(b"OK\n", true);
        link.read_message().unwrap();

        let request = &device.bulk_writes()[0];
        assert_eq!(request[8], 0x02);
        assert_eq!(request[9], b'\n');
    }

    #[test]
    fn test_read_rejects_wrong_tag() {
        let device = MockDevice::usbtmc();
        let mut link = open_link(&device, 0x0957);
        device.queue_bulk_in(&Envelope::new(MessageKind::DevDepMsgIn, 9, 2, true).frame(b"OK"));

        assert!(matches!(
            link.read_message(),
            Err(UsbtmcError::TagMismatch {
                expected: 1,
                actual: 9
            })
        ));
    }

    #[test]
    fn test_read_rejects_corrupt_envelope() {
        let device = MockDevice::usbtmc();
        let mut link = open_link(&device, 0x0957);
        let mut raw = Envelope::new(MessageKind::DevDepMsgIn, 1, 2, true).frame(b"OK");
        raw[2] = 0x00;
        device.queue_bulk_in(&raw);

        assert!(matches!(
            link.read_message(),
            Err(UsbtmcError::BadEnvelope(_))
        ));
    }

    #[test]
    fn test_ieee_block_with_pending_marker() {
        let device = MockDevice::usbtmc();
        let mut link = open_link(&device, 0x1AB1);
        device.queue_response(b"#00", true);
        device.queue_bulk_in(b"#212000321000321");

        assert_eq!(link.read_message().unwrap(), b"000321000321");
        // The follow-up transfer needs no new request.
        assert_eq!(device.bulk_writes().len(), 1);
    }

    #[test]
    fn test_ieee_indefinite_block_keeps_its_data() {
        let device = MockDevice::usbtmc();
        let mut link = open_link(&device, 0x1AB1);
        device.queue_response(b"#0ABCDEF\n", true);

        assert_eq!(link.read_message().unwrap(), b"ABCDEF\n");
        assert_eq!(device.bulk_writes().len(), 1);
    }

    #[test]
    fn test_ieee_block_with_bare_indefinite_marker() {
        let device = MockDevice::usbtmc();
        let mut link = open_link(&device, 0x1AB1);
        device.queue_response(b"#0", true);
        device.queue_bulk_in(b"#15hello");

        assert_eq!(link.read_message().unwrap(), b"hello");
    }

    #[test]
    fn test_ieee_block_reads_until_declared_length() {
        let device = MockDevice::usbtmc();
        let mut link = open_link(&device, 0x1AB1);
        // The envelope understates the block.
        let mut first = Envelope::new(MessageKind::DevDepMsgIn, 1, 8, true).to_bytes();
        first.extend_from_slice(b"#210ABCD");
        device.queue_bulk_in(&first);
        device.queue_bulk_in(b"EFGHIJ\n");

        assert_eq!(link.read_message().unwrap(), b"ABCDEFGHIJ");
    }

    #[test]
    fn test_ieee_block_profile_plain_response() {
        let device = MockDevice::usbtmc();
        let mut link = open_link(&device, 0x1AB1);
        device.queue_response(b"RIGOL,DS1104Z\n", true);
        assert_eq!(link.read_message().unwrap(), b"RIGOL,DS1104Z\n");
    }

    #[test]
    fn test_write_timeout_aborts_then_reraises() {
        let device = MockDevice::usbtmc();
        let mut link = open_link(&device, 0x0957);
        device.queue_bulk_out_error(TransportError::Timeout { timeout_ms: 50 });
        device.queue_control(INITIATE_ABORT_BULK_OUT, &[STATUS_SUCCESS, 1]);
        device.queue_control(CHECK_ABORT_BULK_OUT_STATUS, &[STATUS_PENDING, 0, 0, 0, 0, 0, 0, 0]);
        device.queue_control(CHECK_ABORT_BULK_OUT_STATUS, &[STATUS_SUCCESS, 0, 0, 0, 6, 0, 0, 0]);
        device.clear_calls();

        let error = link.write_message(b"*RST\n").unwrap_err();
        assert!(error.is_timeout());

        let calls = device.calls();
        assert_eq!(
            calls[1],
            UsbCall::ControlIn {
                setup: ControlSetup::endpoint(INITIATE_ABORT_BULK_OUT, 1, 0x02),
                length: 2
            }
        );
        assert_eq!(
            device.control_requests(),
            vec![
                INITIATE_ABORT_BULK_OUT,
                CHECK_ABORT_BULK_OUT_STATUS,
                CHECK_ABORT_BULK_OUT_STATUS
            ]
        );
        assert_eq!(calls.last(), Some(&UsbCall::ClearHalt(0x02)));
    }

    #[test]
    fn test_write_timeout_without_transfer_skips_clear_halt() {
        let device = MockDevice::usbtmc();
        let mut link = open_link(&device, 0x0957);
        device.queue_bulk_out_error(TransportError::Timeout { timeout_ms: 50 });
        device.queue_control(INITIATE_ABORT_BULK_OUT, &[STATUS_FAILED, 0]);

        assert!(link.write_message(b"*RST\n").unwrap_err().is_timeout());
        assert!(!device.calls().contains(&UsbCall::ClearHalt(0x02)));
    }

    #[test]
    fn test_write_timeout_clears_halt_after_failed_abort() {
        let device = MockDevice::usbtmc();
        let mut link = open_link(&device, 0x0957);
        device.queue_bulk_out_error(TransportError::Timeout { timeout_ms: 50 });
        device.queue_control(INITIATE_ABORT_BULK_OUT, &[STATUS_SUCCESS, 1]);
        device.queue_control(CHECK_ABORT_BULK_OUT_STATUS, &[STATUS_FAILED, 0, 0, 0, 0, 0, 0, 0]);
        device.clear_calls();

        assert!(link.write_message(b"*RST\n").unwrap_err().is_timeout());
        assert_eq!(device.calls().last(), Some(&UsbCall::ClearHalt(0x02)));
    }

    #[test]
    fn test_write_timeout_unfinished_abort_skips_clear_halt() {
        let device = MockDevice::usbtmc();
        let mut link = open_link(&device, 0x0957);
        device.queue_bulk_out_error(TransportError::Timeout { timeout_ms: 50 });
        device.queue_control(INITIATE_ABORT_BULK_OUT, &[STATUS_SUCCESS, 1]);
        device.set_control_default(CHECK_ABORT_BULK_OUT_STATUS, &[STATUS_PENDING, 0]);

        assert!(link.write_message(b"*RST\n").unwrap_err().is_timeout());
        assert!(!device.calls().contains(&UsbCall::ClearHalt(0x02)));
    }

    #[test]
    fn test_read_timeout_aborts_then_reraises() {
        let device = MockDevice::usbtmc();
        let mut link = open_link(&device, 0x0957);
        device.queue_bulk_in_error(TransportError::Timeout { timeout_ms: 50 });
        device.queue_control(INITIATE_ABORT_BULK_IN, &[STATUS_SUCCESS, 1]);
        device.queue_control(CHECK_ABORT_BULK_IN_STATUS, &[STATUS_SUCCESS, 0, 0, 0, 0, 0, 0, 0]);
        device.clear_calls();

        let error = link.read_message().unwrap_err();
        assert!(matches!(
            error.transport(),
            Some(TransportError::Timeout { timeout_ms: 50 })
        ));
        assert_eq!(
            device.control_requests(),
            vec![INITIATE_ABORT_BULK_IN, CHECK_ABORT_BULK_IN_STATUS]
        );
        assert!(
            !device
                .calls()
                .iter()
                .any(|c| matches!(c, UsbCall::ClearHalt(_)))
        );
    }

    #[test]
    fn test_unfinished_abort_still_reports_timeout() {
        let device = MockDevice::usbtmc();
        let mut link = open_link(&device, 0x0957);
        device.queue_bulk_in_error(TransportError::Timeout { timeout_ms: 50 });
        device.queue_control(INITIATE_ABORT_BULK_IN, &[STATUS_SUCCESS, 1]);
        device.set_control_default(CHECK_ABORT_BULK_IN_STATUS, &[STATUS_PENDING, 0]);

        assert!(link.read_message().unwrap_err().is_timeout());
        let polls = device
            .control_requests()
            .iter()
            .filter(|&&r| r == CHECK_ABORT_BULK_IN_STATUS)
            .count();
        assert_eq!(polls, 5);
    }

    #[test]
    fn test_other_bus_errors_skip_recovery() {
        let device = MockDevice::usbtmc();
        let mut link = open_link(&device, 0x0957);
        device.queue_bulk_out_error(TransportError::Stall { endpoint: 0x02 });
        device.clear_calls();

        assert!(matches!(
            link.write_message(b"X"),
            Err(UsbtmcError::Transport(TransportError::Stall { endpoint: 0x02 }))
        ));
        assert!(device.control_requests().is_empty());
    }

    #[test]
    fn test_decode_response() {
        assert_eq!(decode_response(b"+1.000E+00\r\n"), "+1.000E+00");
        assert_eq!(decode_response(b"A\nB\n"), "A\nB");
        assert_eq!(decode_response(b""), "");
    }
}
