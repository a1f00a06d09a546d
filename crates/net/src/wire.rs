//! Binary cursor used by every message kind to write and read its own payload.
//!
//! Integers are little-endian, counts are LEB128 varints, strings are
//! `[varint len][utf8]`. Readers never panic on short or garbage input.

use thiserror::Error;

/// Longest varint accepted for a `u64` (ceil(64 / 7)).
const MAX_VARINT_BYTES: usize = 10;

/// Decoding failure on a wire payload.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    /// The payload ended before a field could be read.
    #[error("unexpected end of payload: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEof {
        /// Bytes required by the field.
        needed: usize,
        /// Bytes left in the cursor.
        remaining: usize,
    },

    /// A varint ran past ten bytes.
    #[error("varint exceeds 64 bits")]
    VarintOverflow,

    /// A declared count exceeds the configured limit.
    #[error("declared length {len} exceeds limit {limit}")]
    LengthLimit {
        /// Declared length.
        len: u64,
        /// Maximum allowed.
        limit: usize,
    },

    /// String bytes were not UTF-8.
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,

    /// An enum discriminant outside the known set.
    #[error("unknown {what} tag {tag}")]
    UnknownTag {
        /// Field being decoded.
        what: &'static str,
        /// Raw tag value.
        tag: u8,
    },

    /// Bytes remained after the message was fully decoded.
    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),
}

/// Append-only payload writer.
#[derive(Debug, Default, Clone)]
pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    /// Create an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a writer with a preallocated buffer.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    /// Write one byte.
    pub fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    /// Write a little-endian `u16`.
    pub fn put_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Write a little-endian `u32`.
    pub fn put_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Write a little-endian `u64`.
    pub fn put_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Write a little-endian `i32`.
    pub fn put_i32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Write a little-endian IEEE-754 `f32`.
    pub fn put_f32(&mut self, value: f32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Write an unsigned LEB128 varint.
    pub fn put_varint(&mut self, mut value: u64) {
        loop {
            let byte = (value & 0x7F) as u8;
            value >>= 7;
            if value == 0 {
                self.buf.push(byte);
                return;
            }
            self.buf.push(byte | 0x80);
        }
    }

    /// Write raw bytes with no length prefix.
    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Write a length-prefixed UTF-8 string.
    pub fn put_str(&mut self, value: &str) {
        self.put_varint(value.len() as u64);
        self.buf.extend_from_slice(value.as_bytes());
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Consume the writer.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Bounds-checked payload reader.
#[derive(Debug, Clone)]
pub struct WireReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    /// Wrap a payload.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, needed: usize) -> Result<&'a [u8], WireError> {
        let remaining = self.remaining();
        if needed > remaining {
            return Err(WireError::UnexpectedEof { needed, remaining });
        }
        let slice = &self.data[self.pos..self.pos + needed];
        self.pos += needed;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    /// Read one byte.
    pub fn get_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    /// Read a little-endian `u16`.
    pub fn get_u16(&mut self) -> Result<u16, WireError> {
        self.take_array().map(u16::from_le_bytes)
    }

    /// Read a little-endian `u32`.
    pub fn get_u32(&mut self) -> Result<u32, WireError> {
        self.take_array().map(u32::from_le_bytes)
    }

    /// Read a little-endian `u64`.
    pub fn get_u64(&mut self) -> Result<u64, WireError> {
        self.take_array().map(u64::from_le_bytes)
    }

    /// Read a little-endian `i32`.
    pub fn get_i32(&mut self) -> Result<i32, WireError> {
        self.take_array().map(i32::from_le_bytes)
    }

    /// Read a little-endian `f32`.
    pub fn get_f32(&mut self) -> Result<f32, WireError> {
        self.take_array().map(f32::from_le_bytes)
    }

    /// Read an unsigned LEB128 varint.
    pub fn get_varint(&mut self) -> Result<u64, WireError> {
        let mut value = 0u64;
        for i in 0..MAX_VARINT_BYTES {
            let byte = self.get_u8()?;
            let bits = (byte & 0x7F) as u64;
            if i == MAX_VARINT_BYTES - 1 && bits > 1 {
                return Err(WireError::VarintOverflow);
            }
            value |= bits << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(WireError::VarintOverflow)
    }

    /// Read a varint count and reject it if larger than `limit`.
    pub fn get_count(&mut self, limit: usize) -> Result<usize, WireError> {
        let len = self.get_varint()?;
        if len > limit as u64 {
            return Err(WireError::LengthLimit { len, limit });
        }
        Ok(len as usize)
    }

    /// Read `len` raw bytes.
    pub fn get_bytes(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        self.take(len)
    }

    /// Read a length-prefixed UTF-8 string of at most `limit` bytes.
    pub fn get_str(&mut self, limit: usize) -> Result<String, WireError> {
        let len = self.get_count(limit)?;
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| WireError::InvalidUtf8)
    }

    /// Assert the payload was consumed exactly.
    pub fn finish(self) -> Result<(), WireError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(WireError::TrailingBytes(n)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_width_fields() {
        let mut w = WireWriter::new();
        w.put_u8(7);
        w.put_u16(0xBEEF);
        w.put_u32(0xDEAD_BEEF);
        w.put_u64(u64::MAX - 1);
        w.put_i32(-5);
        w.put_f32(1.5);
        let bytes = w.into_bytes();
        assert_eq!(bytes.len(), 1 + 2 + 4 + 8 + 4 + 4);

        let mut r = WireReader::new(&bytes);
        assert_eq!(r.get_u8().unwrap(), 7);
        assert_eq!(r.get_u16().unwrap(), 0xBEEF);
        assert_eq!(r.get_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(r.get_u64().unwrap(), u64::MAX - 1);
        assert_eq!(r.get_i32().unwrap(), -5);
        assert_eq!(r.get_f32().unwrap(), 1.5);
        r.finish().unwrap();
    }

    #[test]
    fn test_varint_encoding_sizes() {
        let mut w = WireWriter::new();
        w.put_varint(0);
        w.put_varint(127);
        w.put_varint(128);
        assert_eq!(w.into_bytes(), vec![0x00, 0x7F, 0x80, 0x01]);

        let mut w = WireWriter::new();
        w.put_varint(u64::MAX);
        let bytes = w.into_bytes();
        assert_eq!(bytes.len(), MAX_VARINT_BYTES);
        assert_eq!(WireReader::new(&bytes).get_varint().unwrap(), u64::MAX);
    }

    #[test]
    fn test_varint_overflow_rejected() {
        let bytes = [0xFF; 11];
        assert_eq!(
            WireReader::new(&bytes).get_varint(),
            Err(WireError::VarintOverflow)
        );
    }

    #[test]
    fn test_short_payload_is_an_error() {
        let mut r = WireReader::new(&[1, 2]);
        assert_eq!(
            r.get_u32(),
            Err(WireError::UnexpectedEof {
                needed: 4,
                remaining: 2
            })
        );
    }

    #[test]
    fn test_string_limits() {
        let mut w = WireWriter::new();
        w.put_str("hello");
        let bytes = w.into_bytes();

        assert_eq!(WireReader::new(&bytes).get_str(16).unwrap(), "hello");
        assert!(matches!(
            WireReader::new(&bytes).get_str(3),
            Err(WireError::LengthLimit { len: 5, limit: 3 })
        ));
        assert_eq!(
            WireReader::new(&[2, 0xC3, 0x28]).get_str(16),
            Err(WireError::InvalidUtf8)
        );
    }

    #[test]
    fn test_trailing_bytes_detected() {
        let mut r = WireReader::new(&[1, 2, 3]);
        r.get_u8().unwrap();
        assert_eq!(r.finish(), Err(WireError::TrailingBytes(2)));
    }
}
