//! Low-level binary primitives shared by the value codec and the awareness
//! update format.
//!
//! Wire rules:
//! ```text
//! unsigned int  → LEB128 varint (7 bits per byte, MSB = continuation)
//! signed int    → zigzag(n) then LEB128 varint
//! f32 / f64     → IEEE-754, big-endian
//! i64 (bigint)  → two's complement, big-endian
//! string/bytes  → varint length + raw bytes
//! ```
//!
//! Every read is bounds-checked; truncated input surfaces as
//! [`DecodeError::UnexpectedEof`] instead of a panic.

use thiserror::Error;

/// Maximum number of bytes a LEB128-encoded `u64` may occupy.
const MAX_VARINT_LEN: usize = 10;

/// Errors produced while decoding awareness bytes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unexpected end of input: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEof { needed: usize, remaining: usize },

    #[error("varint does not fit in 64 bits")]
    VarintOverflow,

    #[error("length field {0} exceeds the addressable range")]
    LengthOverflow(u64),

    #[error("string is not valid UTF-8")]
    InvalidUtf8,

    #[error("value nesting exceeds {0} levels")]
    TooDeep(usize),
}

/// Append-only byte writer.
#[derive(Debug, Default, Clone)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    #[inline]
    pub fn write_u8(&mut self, byte: u8) {
        self.buf.push(byte);
    }

    /// Write an unsigned LEB128 varint.
    #[inline]
    pub fn write_var_u64(&mut self, mut value: u64) {
        while value >= 0x80 {
            self.buf.push((value as u8 & 0x7f) | 0x80);
            value >>= 7;
        }
        self.buf.push(value as u8);
    }

    /// Write a signed integer as zigzag + LEB128.
    #[inline]
    pub fn write_var_i64(&mut self, value: i64) {
        self.write_var_u64(zigzag_encode(value));
    }

    pub fn write_f32(&mut self, value: f32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_f64(&mut self, value: f64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_i64(&mut self, value: i64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    /// Length-prefixed raw bytes.
    pub fn write_buf(&mut self, bytes: &[u8]) {
        self.write_var_u64(bytes.len() as u64);
        self.buf.extend_from_slice(bytes);
    }

    /// Length-prefixed UTF-8 string.
    pub fn write_string(&mut self, value: &str) {
        self.write_buf(value.as_bytes());
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor over a borrowed byte slice.
#[derive(Debug, Clone)]
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes left to read.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn has_content(&self) -> bool {
        self.remaining() > 0
    }

    #[inline]
    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        let byte = *self.buf.get(self.pos).ok_or(DecodeError::UnexpectedEof {
            needed: 1,
            remaining: 0,
        })?;
        self.pos += 1;
        Ok(byte)
    }

    /// Borrow the next `len` bytes.
    pub fn read_exact(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let remaining = self.remaining();
        if len > remaining {
            return Err(DecodeError::UnexpectedEof {
                needed: len,
                remaining,
            });
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_exact(N)?);
        Ok(out)
    }

    pub fn read_var_u64(&mut self) -> Result<u64, DecodeError> {
        let mut result: u64 = 0;
        for i in 0..MAX_VARINT_LEN {
            let byte = self.read_u8()?;
            let shift = 7 * i as u32;
            // The tenth byte only has room for the top bit of a u64.
            if i == MAX_VARINT_LEN - 1 && byte > 1 {
                return Err(DecodeError::VarintOverflow);
            }
            result |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
        }
        Err(DecodeError::VarintOverflow)
    }

    pub fn read_var_i64(&mut self) -> Result<i64, DecodeError> {
        self.read_var_u64().map(zigzag_decode)
    }

    /// Read a varint used as a length or element count.
    ///
    /// Counts are checked against the bytes still available: every element
    /// occupies at least one byte, so a larger count is necessarily truncated.
    pub fn read_len(&mut self) -> Result<usize, DecodeError> {
        let len = self.read_var_u64()?;
        let len = usize::try_from(len).map_err(|_| DecodeError::LengthOverflow(len))?;
        let remaining = self.remaining();
        if len > remaining {
            return Err(DecodeError::UnexpectedEof {
                needed: len,
                remaining,
            });
        }
        Ok(len)
    }

    pub fn read_f32(&mut self) -> Result<f32, DecodeError> {
        self.read_array::<4>().map(f32::from_be_bytes)
    }

    pub fn read_f64(&mut self) -> Result<f64, DecodeError> {
        self.read_array::<8>().map(f64::from_be_bytes)
    }

    pub fn read_i64(&mut self) -> Result<i64, DecodeError> {
        self.read_array::<8>().map(i64::from_be_bytes)
    }

    pub fn read_buf(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = self.read_len()?;
        self.read_exact(len)
    }

    pub fn read_string(&mut self) -> Result<String, DecodeError> {
        let bytes = self.read_buf()?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| DecodeError::InvalidUtf8)
    }
}

#[inline]
pub fn zigzag_encode(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

#[inline]
pub fn zigzag_decode(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn varint_bytes(value: u64) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.write_var_u64(value);
        enc.into_inner()
    }

    #[test]
    fn test_varint_single_byte() {
        assert_eq!(varint_bytes(0), vec![0]);
        assert_eq!(varint_bytes(42), vec![42]);
        assert_eq!(varint_bytes(127), vec![127]);
    }

    #[test]
    fn test_varint_multi_byte() {
        assert_eq!(varint_bytes(128), vec![0x80, 0x01]);
        assert_eq!(varint_bytes(300), vec![0xAC, 0x02]);
        assert_eq!(varint_bytes(u64::MAX).len(), MAX_VARINT_LEN);
    }

    #[test]
    fn test_varint_decode_max() {
        let bytes = varint_bytes(u64::MAX);
        let mut dec = Decoder::new(&bytes);
        assert_eq!(dec.read_var_u64().unwrap(), u64::MAX);
        assert!(!dec.has_content());
    }

    #[test]
    fn test_varint_overflow() {
        // Eleven continuation bytes can never be a valid u64.
        let bytes = [0xFFu8; 11];
        let mut dec = Decoder::new(&bytes);
        assert_eq!(dec.read_var_u64(), Err(DecodeError::VarintOverflow));

        // Tenth byte carrying more than the top bit.
        let mut bytes = vec![0xFFu8; 9];
        bytes.push(0x02);
        let mut dec = Decoder::new(&bytes);
        assert_eq!(dec.read_var_u64(), Err(DecodeError::VarintOverflow));
    }

    #[test]
    fn test_varint_truncated() {
        let mut dec = Decoder::new(&[0x80, 0x80]);
        assert!(matches!(
            dec.read_var_u64(),
            Err(DecodeError::UnexpectedEof { .. })
        ));
    }

    #[test]
    fn test_zigzag_mapping() {
        assert_eq!(zigzag_encode(0), 0);
        assert_eq!(zigzag_encode(-1), 1);
        assert_eq!(zigzag_encode(1), 2);
        assert_eq!(zigzag_encode(-2), 3);
        assert_eq!(zigzag_encode(i64::MAX), u64::MAX - 1);
        assert_eq!(zigzag_encode(i64::MIN), u64::MAX);

        for n in [0, 1, -1, 63, -64, 1 << 40, i64::MIN, i64::MAX] {
            assert_eq!(zigzag_decode(zigzag_encode(n)), n);
        }
    }

    #[test]
    fn test_string_roundtrip() {
        let mut enc = Encoder::new();
        enc.write_string("héllo");
        let bytes = enc.into_inner();
        assert_eq!(bytes[0], 6); // UTF-8 byte length, not char count

        let mut dec = Decoder::new(&bytes);
        assert_eq!(dec.read_string().unwrap(), "héllo");
    }

    #[test]
    fn test_string_invalid_utf8() {
        let bytes = [2u8, 0xC3, 0x28];
        let mut dec = Decoder::new(&bytes);
        assert_eq!(dec.read_string(), Err(DecodeError::InvalidUtf8));
    }

    #[test]
    fn test_length_longer_than_input() {
        let bytes = [10u8, 1, 2, 3];
        let mut dec = Decoder::new(&bytes);
        assert_eq!(
            dec.read_buf(),
            Err(DecodeError::UnexpectedEof {
                needed: 10,
                remaining: 3
            })
        );
    }

    #[test]
    fn test_floats_are_big_endian() {
        let mut enc = Encoder::new();
        enc.write_f32(1.0);
        enc.write_f64(-2.5);
        let bytes = enc.into_inner();
        assert_eq!(&bytes[..4], &[0x3F, 0x80, 0x00, 0x00]);

        let mut dec = Decoder::new(&bytes);
        assert_eq!(dec.read_f32().unwrap(), 1.0);
        assert_eq!(dec.read_f64().unwrap(), -2.5);
    }

    #[test]
    fn test_truncated_fixed_width() {
        let mut dec = Decoder::new(&[0x3F, 0x80]);
        assert_eq!(
            dec.read_f32(),
            Err(DecodeError::UnexpectedEof {
                needed: 4,
                remaining: 2
            })
        );
    }
}
