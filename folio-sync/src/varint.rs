//! Variable-length unsigned integer codec.
//!
//! Wire format (7 data bits per byte, low group first):
//! ```text
//! ┌────────────┬────────────┬─────┬────────────┐
//! │ 1xxxxxxx   │ 1xxxxxxx   │ ... │ 0xxxxxxx   │
//! │ bits 0..7  │ bits 7..14 │     │ last group │
//! └────────────┴────────────┴─────┴────────────┘
//! ```
//!
//! Strings and byte blobs are a varuint length followed by the raw payload.
//!
//! Integer decoding never fails: end of input acts as a terminator and bits
//! beyond 64 are dropped. A decoded length is therefore untrusted until it is
//! checked against the bytes actually remaining, which `read_bytes` and
//! `read_string` do.

/// Continuation flag on every byte but the last.
const CONTINUATION: u8 = 0x80;
/// Data bits per byte.
const DATA_MASK: u8 = 0x7F;

/// Codec errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("truncated input: needed {needed} bytes, {available} available")]
    Truncated { needed: u64, available: usize },

    #[error("length-prefixed string is not valid UTF-8")]
    InvalidUtf8,

    #[error("declared element count {0} exceeds remaining input")]
    LengthOverflow(u64),

    #[error("expected a single-struct update, found {0} structs")]
    UnexpectedStructCount(u64),
}

/// Append `value` as a varuint.
pub fn encode_var_uint(value: u64, out: &mut Vec<u8>) {
    let mut remaining = value;
    while remaining > DATA_MASK as u64 {
        out.push((remaining as u8 & DATA_MASK) | CONTINUATION);
        remaining >>= 7;
    }
    out.push(remaining as u8);
}

/// Encode `value` into a fresh buffer.
pub fn var_uint_bytes(value: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(10);
    encode_var_uint(value, &mut out);
    out
}

/// Append a varuint length prefix followed by `bytes`.
pub fn encode_bytes(bytes: &[u8], out: &mut Vec<u8>) {
    encode_var_uint(bytes.len() as u64, out);
    out.extend_from_slice(bytes);
}

/// Append a length-prefixed UTF-8 string.
pub fn encode_string(value: &str, out: &mut Vec<u8>) {
    encode_bytes(value.as_bytes(), out);
}

/// Cursor over a byte slice for sequential varuint-framed reads.
#[derive(Debug, Clone)]
pub struct VarReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> VarReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Current offset into the underlying slice.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Read a single raw byte, `None` at end of input.
    pub fn read_u8(&mut self) -> Option<u8> {
        let byte = *self.data.get(self.pos)?;
        self.pos += 1;
        Some(byte)
    }

    /// Read a varuint. Stops at end of input and returns what was accumulated.
    pub fn read_var_uint(&mut self) -> u64 {
        let mut value: u64 = 0;
        let mut shift: u32 = 0;
        while let Some(byte) = self.read_u8() {
            if shift < 64 {
                value |= ((byte & DATA_MASK) as u64) << shift;
            }
            if byte & CONTINUATION == 0 {
                break;
            }
            shift += 7;
        }
        value
    }

    /// Read a length-prefixed byte slice, bounded by the remaining input.
    pub fn read_bytes(&mut self) -> Result<&'a [u8], CodecError> {
        let len = self.read_var_uint();
        self.take(len)
    }

    /// Read a length-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> Result<String, CodecError> {
        let bytes = self.read_bytes()?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| CodecError::InvalidUtf8)
    }

    /// Take exactly `len` raw bytes.
    pub fn take(&mut self, len: u64) -> Result<&'a [u8], CodecError> {
        let available = self.remaining();
        if len > available as u64 {
            return Err(CodecError::Truncated {
                needed: len,
                available,
            });
        }
        let start = self.pos;
        self.pos += len as usize;
        Ok(&self.data[start..self.pos])
    }

    /// Consume and return everything left.
    pub fn rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos..];
        self.pos = self.data.len();
        rest
    }
}

/// Decode one varuint from the start of `data`, returning `(value, bytes consumed)`.
pub fn decode_var_uint(data: &[u8]) -> (u64, usize) {
    let mut reader = VarReader::new(data);
    let value = reader.read_var_uint();
    (value, reader.position())
}
