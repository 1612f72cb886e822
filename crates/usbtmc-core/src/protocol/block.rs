//! IEEE 488.2 arbitrary block headers (`#<n><length>` and `#0`).

/// A parsed block prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// Bytes taken by the prefix itself.
    pub header_len: usize,
    /// Declared payload length. Always zero for an indefinite block.
    pub length: usize,
    /// `#0`: the payload runs until the end of the message.
    pub indefinite: bool,
}

impl BlockHeader {
    /// Parse a block prefix at the start of `data`.
    ///
    /// Returns `None` when `data` does not start with a complete, well-formed
    /// prefix.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 2 || data[0] != b'#' || !data[1].is_ascii_digit() {
            return None;
        }
        let digits = usize::from(data[1] - b'0');
        let header_len = 2 + digits;
        if digits == 0 {
            return Some(Self {
                header_len,
                length: 0,
                indefinite: true,
            });
        }
        let field = data.get(2..header_len)?;
        if !field.iter().all(u8::is_ascii_digit) {
            return None;
        }
        let length = field
            .iter()
            .fold(0usize, |acc, &d| acc * 10 + usize::from(d - b'0'));
        Some(Self {
            header_len,
            length,
            indefinite: false,
        })
    }
}

/// Whether `data` is nothing but a zero-length block (`#0`, `#00`, `#10`,
/// `#200`...), which the device sends while the real block is not ready.
pub fn is_pending_marker(data: &[u8]) -> bool {
    let Some(header) = BlockHeader::parse(data) else {
        return false;
    };
    let rest = &data[header.header_len..];
    if header.indefinite {
        rest.is_empty() || rest == b"0"
    } else {
        header.length == 0 && rest.is_empty()
    }
}
