//! Self-describing values carried inside awareness updates.
//!
//! Each value starts with one marker byte:
//! ```text
//! 127 undefined   126 null      125 varint (zigzag)   124 f32
//! 123 f64         122 bigint    121 false             120 true
//! 119 string      118 object    117 array             116 bytes
//! ```
//! Objects and arrays carry their element count first. Object keys are plain
//! length-prefixed strings (no marker). Unknown markers decode as
//! [`Any::Undefined`] so that newer peers can add types without breaking
//! older ones.

use std::collections::BTreeMap;

use crate::encoding::{DecodeError, Decoder, Encoder};

pub const MARKER_UNDEFINED: u8 = 127;
pub const MARKER_NULL: u8 = 126;
pub const MARKER_INTEGER: u8 = 125;
pub const MARKER_FLOAT32: u8 = 124;
pub const MARKER_FLOAT64: u8 = 123;
pub const MARKER_BIGINT: u8 = 122;
pub const MARKER_FALSE: u8 = 121;
pub const MARKER_TRUE: u8 = 120;
pub const MARKER_STRING: u8 = 119;
pub const MARKER_OBJECT: u8 = 118;
pub const MARKER_ARRAY: u8 = 117;
pub const MARKER_BUFFER: u8 = 116;

/// Nesting limit for objects and arrays while decoding.
pub const MAX_DEPTH: usize = 64;

/// A dynamically typed presence value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Any {
    #[default]
    Undefined,
    Null,
    Integer(i64),
    Float32(f32),
    Float64(f64),
    BigInt(i64),
    Bool(bool),
    String(String),
    Object(BTreeMap<String, Any>),
    Array(Vec<Any>),
    Buffer(Vec<u8>),
}

impl Any {
    /// Build an object from key/value pairs.
    pub fn object<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Any)>,
    {
        Any::Object(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Any::Null)
    }

    /// Marker byte this value is written with.
    pub fn marker(&self) -> u8 {
        match self {
            Any::Undefined => MARKER_UNDEFINED,
            Any::Null => MARKER_NULL,
            Any::Integer(_) => MARKER_INTEGER,
            Any::Float32(_) => MARKER_FLOAT32,
            Any::Float64(_) => MARKER_FLOAT64,
            Any::BigInt(_) => MARKER_BIGINT,
            Any::Bool(false) => MARKER_FALSE,
            Any::Bool(true) => MARKER_TRUE,
            Any::String(_) => MARKER_STRING,
            Any::Object(_) => MARKER_OBJECT,
            Any::Array(_) => MARKER_ARRAY,
            Any::Buffer(_) => MARKER_BUFFER,
        }
    }

    /// Look up a key on an object value.
    pub fn get(&self, key: &str) -> Option<&Any> {
        match self {
            Any::Object(map) => map.get(key),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Any::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn encode(&self, enc: &mut Encoder) {
        enc.write_u8(self.marker());
        match self {
            Any::Undefined | Any::Null | Any::Bool(_) => {}
            Any::Integer(n) => enc.write_var_i64(*n),
            Any::Float32(f) => enc.write_f32(*f),
            Any::Float64(f) => enc.write_f64(*f),
            Any::BigInt(n) => enc.write_i64(*n),
            Any::String(s) => enc.write_string(s),
            Any::Object(map) => {
                enc.write_var_u64(map.len() as u64);
                for (key, value) in map {
                    enc.write_string(key);
                    value.encode(enc);
                }
            }
            Any::Array(items) => {
                enc.write_var_u64(items.len() as u64);
                for item in items {
                    item.encode(enc);
                }
            }
            Any::Buffer(bytes) => enc.write_buf(bytes),
        }
    }

    /// Encode a standalone value.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        self.encode(&mut enc);
        enc.into_inner()
    }

    pub fn decode(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Self::decode_at(dec, 0)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        Self::decode(&mut Decoder::new(bytes))
    }

    fn decode_at(dec: &mut Decoder<'_>, depth: usize) -> Result<Self, DecodeError> {
        if depth > MAX_DEPTH {
            return Err(DecodeError::TooDeep(MAX_DEPTH));
        }
        let value = match dec.read_u8()? {
            MARKER_NULL => Any::Null,
            MARKER_INTEGER => Any::Integer(dec.read_var_i64()?),
            MARKER_FLOAT32 => Any::Float32(dec.read_f32()?),
            MARKER_FLOAT64 => Any::Float64(dec.read_f64()?),
            MARKER_BIGINT => Any::BigInt(dec.read_i64()?),
            MARKER_FALSE => Any::Bool(false),
            MARKER_TRUE => Any::Bool(true),
            MARKER_STRING => Any::String(dec.read_string()?),
            MARKER_OBJECT => {
                let len = dec.read_len()?;
                let mut map = BTreeMap::new();
                for _ in 0..len {
                    let key = dec.read_string()?;
                    let value = Self::decode_at(dec, depth + 1)?;
                    map.insert(key, value);
                }
                Any::Object(map)
            }
            MARKER_ARRAY => {
                let len = dec.read_len()?;
                let mut items = Vec::with_capacity(len);
                for _ in 0..len {
                    items.push(Self::decode_at(dec, depth + 1)?);
                }
                Any::Array(items)
            }
            MARKER_BUFFER => Any::Buffer(dec.read_buf()?.to_vec()),
            // MARKER_UNDEFINED and anything we don't recognise.
            _ => Any::Undefined,
        };
        Ok(value)
    }
}

impl From<&str> for Any {
    fn from(value: &str) -> Self {
        Any::String(value.to_owned())
    }
}

impl From<String> for Any {
    fn from(value: String) -> Self {
        Any::String(value)
    }
}

impl From<bool> for Any {
    fn from(value: bool) -> Self {
        Any::Bool(value)
    }
}

impl From<i64> for Any {
    fn from(value: i64) -> Self {
        Any::Integer(value)
    }
}

impl From<i32> for Any {
    fn from(value: i32) -> Self {
        Any::Integer(i64::from(value))
    }
}

impl From<f64> for Any {
    fn from(value: f64) -> Self {
        Any::Float64(value)
    }
}

impl From<f32> for Any {
    fn from(value: f32) -> Self {
        Any::Float32(value)
    }
}

impl From<Vec<u8>> for Any {
    fn from(value: Vec<u8>) -> Self {
        Any::Buffer(value)
    }
}

impl From<Vec<Any>> for Any {
    fn from(value: Vec<Any>) -> Self {
        Any::Array(value)
    }
}

impl From<BTreeMap<String, Any>> for Any {
    fn from(value: BTreeMap<String, Any>) -> Self {
        Any::Object(value)
    }
}

impl<T: Into<Any>> From<Option<T>> for Any {
    fn from(value: Option<T>) -> Self {
        value.map_or(Any::Null, Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(value: Any) {
        let bytes = value.to_bytes();
        let decoded = Any::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, value, "bytes: {bytes:?}");
    }

    #[test]
    fn test_scalar_roundtrips() {
        roundtrip(Any::Null);
        roundtrip(Any::Undefined);
        roundtrip(Any::Bool(true));
        roundtrip(Any::Bool(false));
        roundtrip(Any::Integer(0));
        roundtrip(Any::Integer(-12345));
        roundtrip(Any::Integer(i64::MAX));
        roundtrip(Any::Float32(1.5));
        roundtrip(Any::Float64(-0.125));
        roundtrip(Any::BigInt(i64::MIN));
        roundtrip(Any::from("cursor"));
        roundtrip(Any::Buffer(vec![0, 1, 2, 255]));
    }

    #[test]
    fn test_nested_roundtrip() {
        let value = Any::object([
            ("user", Any::object([("name", Any::from("Alice")), ("color", Any::from("#ff0"))])),
            (
                "cursor",
                Any::object([("anchor", Any::Integer(12)), ("head", Any::Integer(40))]),
            ),
            (
                "selection",
                Any::Array(vec![Any::Integer(1), Any::Null, Any::Array(vec![Any::Bool(true)])]),
            ),
            ("avatar", Any::Buffer(vec![9; 16])),
        ]);
        roundtrip(value);
    }

    #[test]
    fn test_marker_bytes() {
        assert_eq!(Any::Null.to_bytes(), vec![126]);
        assert_eq!(Any::Bool(true).to_bytes(), vec![120]);
        assert_eq!(Any::Bool(false).to_bytes(), vec![121]);
        assert_eq!(Any::Integer(-1).to_bytes(), vec![125, 1]);
        assert_eq!(Any::from("hi").to_bytes(), vec![119, 2, b'h', b'i']);
        assert_eq!(Any::Array(vec![]).to_bytes(), vec![117, 0]);
    }

    #[test]
    fn test_object_encoding_layout() {
        let value = Any::object([("a", Any::Integer(1))]);
        // marker, count, key len, key, value marker, value
        assert_eq!(value.to_bytes(), vec![118, 1, 1, b'a', 125, 2]);
    }

    #[test]
    fn test_unknown_marker_is_undefined() {
        assert_eq!(Any::from_bytes(&[3]).unwrap(), Any::Undefined);
        assert_eq!(Any::from_bytes(&[200]).unwrap(), Any::Undefined);

        // An unknown marker inside an array does not poison the rest.
        let bytes = [117, 2, 42, 120];
        assert_eq!(
            Any::from_bytes(&bytes).unwrap(),
            Any::Array(vec![Any::Undefined, Any::Bool(true)])
        );
    }

    #[test]
    fn test_truncated_inputs_error() {
        let value = Any::object([
            ("name", Any::from("Alice")),
            ("pos", Any::Float64(3.25)),
            ("blob", Any::Buffer(vec![1, 2, 3])),
        ]);
        let bytes = value.to_bytes();
        for cut in 0..bytes.len() {
            assert!(
                Any::from_bytes(&bytes[..cut]).is_err(),
                "prefix of length {cut} should not decode"
            );
        }
    }

    #[test]
    fn test_huge_count_does_not_allocate() {
        // Claims 2^32 array elements with nothing behind it.
        let bytes = [117, 0x80, 0x80, 0x80, 0x80, 0x10];
        assert!(matches!(
            Any::from_bytes(&bytes),
            Err(DecodeError::UnexpectedEof { .. })
        ));
    }

    #[test]
    fn test_depth_limit() {
        let mut bytes = vec![117u8, 1].repeat(MAX_DEPTH + 2);
        bytes.push(126);
        assert_eq!(Any::from_bytes(&bytes), Err(DecodeError::TooDeep(MAX_DEPTH)));
    }

    #[test]
    fn test_option_conversion() {
        assert_eq!(Any::from(None::<&str>), Any::Null);
        assert_eq!(Any::from(Some("x")), Any::from("x"));
    }
}
