//! Bulk transfer envelope (the 12-byte USBTMC header).
//!
//! Layout, little-endian:
//!
//! | offset | field                                        |
//! |--------|----------------------------------------------|
//! | 0      | MsgID                                        |
//! | 1      | bTag                                         |
//! | 2      | bTagInverse (`!bTag`)                        |
//! | 3      | reserved                                     |
//! | 4..8   | TransferSize                                 |
//! | 8      | bmTransferAttributes (bit 0 EOM, bit 1 TermCharEnabled) |
//! | 9      | TermChar (request-in only)                   |
//! | 10..12 | reserved                                     |

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fmt;
use std::io::Cursor;
use thiserror::Error;

use super::constants::*;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("Buffer too small: expected {expected}, got {actual}")]
    BufferTooSmall { expected: usize, actual: usize },
    #[error("Unexpected message id: expected {expected}, got {actual}")]
    UnexpectedKind { expected: u8, actual: u8 },
    #[error("Tag complement mismatch: tag {tag}, complement 0x{complement:02X}")]
    BadComplement { tag: u8, complement: u8 },
}

/// Bulk message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Host -> device data.
    DevDepMsgOut,
    /// Host asks the device to send a response.
    RequestDevDepMsgIn,
    /// Device -> host response data.
    DevDepMsgIn,
    VendorSpecificOut,
    RequestVendorSpecificIn,
    VendorSpecificIn,
    /// USB488 trigger.
    Trigger,
}

impl MessageKind {
    pub fn id(self) -> u8 {
        match self {
            MessageKind::DevDepMsgOut => MSGID_DEV_DEP_MSG_OUT,
            MessageKind::RequestDevDepMsgIn => MSGID_REQUEST_DEV_DEP_MSG_IN,
            MessageKind::DevDepMsgIn => MSGID_DEV_DEP_MSG_IN,
            MessageKind::VendorSpecificOut => MSGID_VENDOR_SPECIFIC_OUT,
            MessageKind::RequestVendorSpecificIn => MSGID_REQUEST_VENDOR_SPECIFIC_IN,
            MessageKind::VendorSpecificIn => MSGID_VENDOR_SPECIFIC_IN,
            MessageKind::Trigger => MSGID_TRIGGER,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::DevDepMsgOut => write!(f, "DEV_DEP_MSG_OUT"),
            MessageKind::RequestDevDepMsgIn => write!(f, "REQUEST_DEV_DEP_MSG_IN"),
            MessageKind::DevDepMsgIn => write!(f, "DEV_DEP_MSG_IN"),
            MessageKind::VendorSpecificOut => write!(f, "VENDOR_SPECIFIC_OUT"),
            MessageKind::RequestVendorSpecificIn => write!(f, "REQUEST_VENDOR_SPECIFIC_IN"),
            MessageKind::VendorSpecificIn => write!(f, "VENDOR_SPECIFIC_IN"),
            MessageKind::Trigger => write!(f, "TRIGGER"),
        }
    }
}

const ATTR_END_OF_MESSAGE: u8 = 0x01;
const ATTR_TERM_CHAR_ENABLED: u8 = 0x02;

/// Parsed or to-be-sent bulk envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope {
    pub kind: MessageKind,
    pub tag: u8,
    pub transfer_size: u32,
    /// Last fragment of the logical message.
    pub end_of_message: bool,
    /// Only meaningful on `RequestDevDepMsgIn`.
    pub term_char: Option<u8>,
}

impl Envelope {
    pub const SIZE: usize = HEADER_SIZE;

    pub fn new(kind: MessageKind, tag: u8, transfer_size: u32, end_of_message: bool) -> Self {
        Self {
            kind,
            tag,
            transfer_size,
            end_of_message,
            term_char: None,
        }
    }

    /// Envelope asking the device for up to `max_size` bytes.
    pub fn request_in(tag: u8, max_size: u32, term_char: Option<u8>) -> Self {
        Self {
            kind: MessageKind::RequestDevDepMsgIn,
            tag,
            transfer_size: max_size,
            end_of_message: false,
            term_char,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut attributes = 0u8;
        if self.end_of_message {
            attributes |= ATTR_END_OF_MESSAGE;
        }
        if self.term_char.is_some() {
            attributes |= ATTR_TERM_CHAR_ENABLED;
        }

        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.push(self.kind.id());
        buf.push(self.tag);
        buf.push(!self.tag);
        buf.push(0);
        // Writes into a Vec cannot fail.
        let _ = buf.write_u32::<LittleEndian>(self.transfer_size);
        buf.push(attributes);
        buf.push(self.term_char.unwrap_or(0));
        buf.extend_from_slice(&[0, 0]);
        buf
    }

    /// Parse an envelope, requiring it to be of kind `expected`.
    pub fn from_bytes(data: &[u8], expected: MessageKind) -> Result<Self, EnvelopeError> {
        if data.len() < Self::SIZE {
            return Err(EnvelopeError::BufferTooSmall {
                expected: Self::SIZE,
                actual: data.len(),
            });
        }
        if data[0] != expected.id() {
            return Err(EnvelopeError::UnexpectedKind {
                expected: expected.id(),
                actual: data[0],
            });
        }
        let tag = data[1];
        if data[2] != !tag {
            return Err(EnvelopeError::BadComplement {
                tag,
                complement: data[2],
            });
        }

        let mut cursor = Cursor::new(&data[4..8]);
        let transfer_size = cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| EnvelopeError::BufferTooSmall {
                expected: Self::SIZE,
                actual: data.len(),
            })?;
        let attributes = data[8];

        Ok(Self {
            kind: expected,
            tag,
            transfer_size,
            end_of_message: attributes & ATTR_END_OF_MESSAGE != 0,
            term_char: (attributes & ATTR_TERM_CHAR_ENABLED != 0).then_some(data[9]),
        })
    }

    /// Header, payload, then zero padding up to a 4-byte boundary.
    pub fn frame(&self, payload: &[u8]) -> Vec<u8> {
        let mut message = self.to_bytes();
        message.extend_from_slice(payload);
        let padding = (4 - message.len() % 4) % 4;
        message.resize(message.len() + padding, 0);
        message
    }
}

/// Rolling bTag for bulk transfers: 1..=255, never 0.
#[derive(Debug, Default, Clone)]
pub struct TagCounter {
    last: u8,
}

impl TagCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_tag(&mut self) -> u8 {
        self.last = (self.last % 255) + 1;
        self.last
    }

    /// Most recently issued tag (0 before the first transfer).
    pub fn current(&self) -> u8 {
        self.last
    }
}

/// bTag for USB488 READ_STATUS_BYTE: 2..=127.
#[derive(Debug, Default, Clone)]
pub struct StatusTagCounter {
    last: u8,
}

impl StatusTagCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_tag(&mut self) -> u8 {
        self.last = ((self.last % 127) + 1).max(2);
        self.last
    }

    pub fn current(&self) -> u8 {
        self.last
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let bytes = Envelope::new(MessageKind::DevDepMsgOut, 0x05, 0x0102_0304, true).to_bytes();
        assert_eq!(
            bytes,
            [0x01, 0x05, 0xFA, 0x00, 0x04, 0x03, 0x02, 0x01, 0x01, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_every_tag_survives_parse() {
        for tag in 1..=255u8 {
            for (kind, last) in [
                (MessageKind::DevDepMsgOut, true),
                (MessageKind::DevDepMsgIn, false),
                (MessageKind::Trigger, false),
            ] {
                let size = u32::from(tag) * 7;
                let bytes = Envelope::new(kind, tag, size, last).to_bytes();
                assert_eq!(bytes[2], 0xFF - tag);

                let parsed = Envelope::from_bytes(&bytes, kind).unwrap();
                assert_eq!(parsed.kind, kind);
                assert_eq!(parsed.tag, tag);
                assert_eq!(parsed.transfer_size, size);
                assert_eq!(parsed.end_of_message, last);
            }
        }
    }

    #[test]
    fn test_request_in_carries_term_char() {
        let bytes = Envelope::request_in(9, 512, Some(b'\n')).to_bytes();
        assert_eq!(bytes[0], MSGID_REQUEST_DEV_DEP_MSG_IN);
        assert_eq!(bytes[8], ATTR_TERM_CHAR_ENABLED);
        assert_eq!(bytes[9], b'\n');

        let parsed = Envelope::from_bytes(&bytes, MessageKind::RequestDevDepMsgIn).unwrap();
        assert_eq!(parsed.term_char, Some(b'\n'));
    }

    #[test]
    fn test_bad_complement_rejected() {
        let mut bytes = Envelope::new(MessageKind::DevDepMsgIn, 7, 3, true).to_bytes();
        bytes[2] = 0x00;
        assert_eq!(
            Envelope::from_bytes(&bytes, MessageKind::DevDepMsgIn),
            Err(EnvelopeError::BadComplement {
                tag: 7,
                complement: 0
            })
        );
    }

    #[test]
    fn test_unexpected_kind_rejected() {
        let bytes = Envelope::new(MessageKind::VendorSpecificIn, 7, 3, true).to_bytes();
        assert!(matches!(
            Envelope::from_bytes(&bytes, MessageKind::DevDepMsgIn),
            Err(EnvelopeError::UnexpectedKind { expected: 2, actual: 127 })
        ));
    }

    #[test]
    fn test_short_buffer_rejected() {
        assert!(matches!(
            Envelope::from_bytes(&[2, 1, 0xFE], MessageKind::DevDepMsgIn),
            Err(EnvelopeError::BufferTooSmall { .. })
        ));
    }

    #[test]
    fn test_frame_pads_to_four_bytes() {
        let header = Envelope::new(MessageKind::DevDepMsgOut, 1, 5, true);
        let message = header.frame(b"*IDN?");
        assert_eq!(message.len(), 20);
        assert_eq!(&message[12..17], b"*IDN?");
        assert_eq!(&message[17..], &[0, 0, 0]);

        assert_eq!(header.frame(b"ABCD").len(), 16);
    }

    #[test]
    fn test_tag_counter_wraps_past_zero() {
        let mut tags = TagCounter::new();
        let mut previous = 0u8;
        for i in 0..600 {
            let tag = tags.next_tag();
            assert_ne!(tag, 0);
            if i > 0 {
                assert_eq!(tag, if previous == 255 { 1 } else { previous + 1 });
            }
            previous = tag;
        }
        assert_eq!(tags.current(), previous);
    }

    #[test]
    fn test_status_tag_range() {
        let mut tags = StatusTagCounter::new();
        assert_eq!(tags.next_tag(), 2);
        for _ in 0..400 {
            let tag = tags.next_tag();
            assert!((2..=127).contains(&tag));
        }
    }
}
