//! # Tagged Value Model
//!
//! Purpose: Describe how keys, values and auto-serialized objects cross the
//! wire so the client and the grid node agree without a schema exchange.
//!
//! ## Design Principles
//! 1. **Tag Carries Identity**: Every value is `(tag, bytes)`; the receiver picks
//!    a decoder from the tag alone.
//! 2. **Self-Describing Objects**: Object payloads list field names and kinds,
//!    so the node can project fields it has never seen declared.
//! 3. **Deterministic Encoding**: Fields keep declaration order and integers are
//!    big-endian, so re-encoding a decoded payload yields the same bytes.
//!
//! ## Object Field Stream
//!
//! ```text
//! +----------------+-------------------------------------------------+
//! | field_count:2B | field*                                          |
//! +----------------+-------------------------------------------------+
//! field: | name_len:2B | name | kind:1B | payload |
//! kind:  0 null | 1 string (len:4B + utf8) | 2 int (4B) | 3 long (8B)
//!        4 double (8B) | 5 boolean (1B) | 6 bytes (len:4B + raw)
//! ```

use std::fmt;

use bytes::{Buf, BufMut};

use crate::error::{CodecError, CodecResult};

/// Tag for UTF-8 strings.
pub const TAG_STRING: &str = "string";
/// Tag for 32-bit signed integers (big-endian).
pub const TAG_INT: &str = "int";
/// Tag for 64-bit signed integers (big-endian).
pub const TAG_LONG: &str = "long";
/// Tag for 64-bit floats (big-endian IEEE-754 bits).
pub const TAG_DOUBLE: &str = "double";
/// Tag for booleans (one byte, 0 or 1).
pub const TAG_BOOLEAN: &str = "boolean";
/// Tag for raw byte arrays.
pub const TAG_BYTES: &str = "bytes";

const KIND_NULL: u8 = 0;
const KIND_STRING: u8 = 1;
const KIND_INT: u8 = 2;
const KIND_LONG: u8 = 3;
const KIND_DOUBLE: u8 = 4;
const KIND_BOOLEAN: u8 = 5;
const KIND_BYTES: u8 = 6;

/// Returns true for tags that need no registration to decode.
pub fn is_builtin_tag(tag: &str) -> bool {
    matches!(
        tag,
        TAG_STRING | TAG_INT | TAG_LONG | TAG_DOUBLE | TAG_BOOLEAN | TAG_BYTES
    )
}

/// A key or value in wire form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WireValue {
    /// Built-in tag or type name.
    pub tag: String,
    /// Encoded payload.
    pub bytes: Vec<u8>,
}

impl WireValue {
    pub fn new(tag: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        WireValue {
            tag: tag.into(),
            bytes: bytes.into(),
        }
    }

    pub fn string(value: &str) -> Self {
        WireValue::new(TAG_STRING, value.as_bytes())
    }

    pub fn int(value: i32) -> Self {
        WireValue::new(TAG_INT, value.to_be_bytes())
    }

    pub fn long(value: i64) -> Self {
        WireValue::new(TAG_LONG, value.to_be_bytes())
    }

    pub fn double(value: f64) -> Self {
        WireValue::new(TAG_DOUBLE, value.to_bits().to_be_bytes())
    }

    pub fn boolean(value: bool) -> Self {
        WireValue::new(TAG_BOOLEAN, [value as u8])
    }

    pub fn bytes(value: Vec<u8>) -> Self {
        WireValue::new(TAG_BYTES, value)
    }

    /// Returns true when the tag is not one of the built-in primitive tags.
    pub fn is_object(&self) -> bool {
        !is_builtin_tag(&self.tag)
    }

    fn expect_tag(&self, tag: &str) -> CodecResult<()> {
        if self.tag == tag {
            Ok(())
        } else {
            Err(CodecError::TypeMismatch {
                expected: tag.to_string(),
                found: self.tag.clone(),
            })
        }
    }

    pub fn as_string(&self) -> CodecResult<String> {
        self.expect_tag(TAG_STRING)?;
        String::from_utf8(self.bytes.clone()).map_err(|_| CodecError::malformed("string is not utf-8"))
    }

    pub fn as_int(&self) -> CodecResult<i32> {
        self.expect_tag(TAG_INT)?;
        let raw: [u8; 4] = self
            .bytes
            .as_slice()
            .try_into()
            .map_err(|_| CodecError::malformed("int must be 4 bytes"))?;
        Ok(i32::from_be_bytes(raw))
    }

    pub fn as_long(&self) -> CodecResult<i64> {
        self.expect_tag(TAG_LONG)?;
        let raw: [u8; 8] = self
            .bytes
            .as_slice()
            .try_into()
            .map_err(|_| CodecError::malformed("long must be 8 bytes"))?;
        Ok(i64::from_be_bytes(raw))
    }

    pub fn as_double(&self) -> CodecResult<f64> {
        self.expect_tag(TAG_DOUBLE)?;
        let raw: [u8; 8] = self
            .bytes
            .as_slice()
            .try_into()
            .map_err(|_| CodecError::malformed("double must be 8 bytes"))?;
        Ok(f64::from_bits(u64::from_be_bytes(raw)))
    }

    pub fn as_boolean(&self) -> CodecResult<bool> {
        self.expect_tag(TAG_BOOLEAN)?;
        match self.bytes.as_slice() {
            [0] => Ok(false),
            [1] => Ok(true),
            _ => Err(CodecError::malformed("boolean must be a single 0/1 byte")),
        }
    }

    pub fn into_bytes(self) -> CodecResult<Vec<u8>> {
        self.expect_tag(TAG_BYTES)?;
        Ok(self.bytes)
    }

    /// Converts a built-in value into a field value.
    ///
    /// Objects have no scalar form and yield `TypeMismatch`.
    pub fn to_field(&self) -> CodecResult<FieldValue> {
        match self.tag.as_str() {
            TAG_STRING => self.as_string().map(FieldValue::String),
            TAG_INT => self.as_int().map(FieldValue::Int),
            TAG_LONG => self.as_long().map(FieldValue::Long),
            TAG_DOUBLE => self.as_double().map(FieldValue::Double),
            TAG_BOOLEAN => self.as_boolean().map(FieldValue::Bool),
            TAG_BYTES => Ok(FieldValue::Bytes(self.bytes.clone())),
            other => Err(CodecError::TypeMismatch {
                expected: "built-in value".to_string(),
                found: other.to_string(),
            }),
        }
    }
}

/// A single field of an auto-serialized object.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    String(String),
    Int(i32),
    Long(i64),
    Double(f64),
    Bool(bool),
    Bytes(Vec<u8>),
}

impl FieldValue {
    /// Human-readable kind, used in shape mismatch reports.
    pub fn kind_name(&self) -> &'static str {
        match self {
            FieldValue::Null => "null",
            FieldValue::String(_) => TAG_STRING,
            FieldValue::Int(_) => TAG_INT,
            FieldValue::Long(_) => TAG_LONG,
            FieldValue::Double(_) => TAG_DOUBLE,
            FieldValue::Bool(_) => TAG_BOOLEAN,
            FieldValue::Bytes(_) => TAG_BYTES,
        }
    }

    /// Wire form of a scalar field; `None` for null.
    pub fn to_wire(&self) -> Option<WireValue> {
        match self {
            FieldValue::Null => None,
            FieldValue::String(value) => Some(WireValue::string(value)),
            FieldValue::Int(value) => Some(WireValue::int(*value)),
            FieldValue::Long(value) => Some(WireValue::long(*value)),
            FieldValue::Double(value) => Some(WireValue::double(*value)),
            FieldValue::Bool(value) => Some(WireValue::boolean(*value)),
            FieldValue::Bytes(value) => Some(WireValue::bytes(value.clone())),
        }
    }

    fn kind(&self) -> u8 {
        match self {
            FieldValue::Null => KIND_NULL,
            FieldValue::String(_) => KIND_STRING,
            FieldValue::Int(_) => KIND_INT,
            FieldValue::Long(_) => KIND_LONG,
            FieldValue::Double(_) => KIND_DOUBLE,
            FieldValue::Bool(_) => KIND_BOOLEAN,
            FieldValue::Bytes(_) => KIND_BYTES,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Null => write!(f, "null"),
            FieldValue::String(value) => write!(f, "{}", value),
            FieldValue::Int(value) => write!(f, "{}", value),
            FieldValue::Long(value) => write!(f, "{}", value),
            FieldValue::Double(value) => write!(f, "{}", value),
            FieldValue::Bool(value) => write!(f, "{}", value),
            FieldValue::Bytes(value) => write!(f, "{:?}", value),
        }
    }
}

/// A decoded auto-serialized object: its type name and ordered fields.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectInstance {
    type_name: String,
    fields: Vec<(String, FieldValue)>,
}

impl ObjectInstance {
    pub fn new(type_name: impl Into<String>) -> Self {
        ObjectInstance {
            type_name: type_name.into(),
            fields: Vec::new(),
        }
    }

    /// Appends a field; order of calls is the encoding order.
    pub fn push(&mut self, name: impl Into<String>, value: FieldValue) {
        self.fields.push((name.into(), value));
    }

    /// Builder-style variant of [`ObjectInstance::push`].
    pub fn with_field(mut self, name: impl Into<String>, value: FieldValue) -> Self {
        self.push(name, value);
        self
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn fields(&self) -> &[(String, FieldValue)] {
        &self.fields
    }

    /// Looks a field up by name.
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value)
    }

    /// Encodes the field stream (the type name travels as the tag).
    pub fn encode(&self) -> CodecResult<Vec<u8>> {
        let count = u16::try_from(self.fields.len())
            .map_err(|_| self.shape_error("more than 65535 fields"))?;
        let mut out = Vec::with_capacity(16 * self.fields.len() + 2);
        out.put_u16(count);
        for (name, value) in &self.fields {
            let name_len = u16::try_from(name.len())
                .map_err(|_| self.shape_error(format!("field name `{}` too long", name)))?;
            out.put_u16(name_len);
            out.put_slice(name.as_bytes());
            out.put_u8(value.kind());
            match value {
                FieldValue::Null => {}
                FieldValue::String(text) => put_len_prefixed(&mut out, text.as_bytes()),
                FieldValue::Int(v) => out.put_i32(*v),
                FieldValue::Long(v) => out.put_i64(*v),
                FieldValue::Double(v) => out.put_u64(v.to_bits()),
                FieldValue::Bool(v) => out.put_u8(*v as u8),
                FieldValue::Bytes(data) => put_len_prefixed(&mut out, data),
            }
        }
        Ok(out)
    }

    /// Decodes a field stream produced by [`ObjectInstance::encode`].
    pub fn decode(type_name: &str, bytes: &[u8]) -> CodecResult<Self> {
        let mut buf = bytes;
        ensure(&buf, 2)?;
        let count = buf.get_u16() as usize;
        let mut instance = ObjectInstance::new(type_name);
        for _ in 0..count {
            ensure(&buf, 2)?;
            let name_len = buf.get_u16() as usize;
            ensure(&buf, name_len)?;
            let name = String::from_utf8(buf[..name_len].to_vec())
                .map_err(|_| CodecError::malformed("field name is not utf-8"))?;
            buf.advance(name_len);
            ensure(&buf, 1)?;
            let value = match buf.get_u8() {
                KIND_NULL => FieldValue::Null,
                KIND_STRING => {
                    let data = take_len_prefixed(&mut buf)?;
                    FieldValue::String(
                        String::from_utf8(data)
                            .map_err(|_| CodecError::malformed("string field is not utf-8"))?,
                    )
                }
                KIND_INT => {
                    ensure(&buf, 4)?;
                    FieldValue::Int(buf.get_i32())
                }
                KIND_LONG => {
                    ensure(&buf, 8)?;
                    FieldValue::Long(buf.get_i64())
                }
                KIND_DOUBLE => {
                    ensure(&buf, 8)?;
                    FieldValue::Double(f64::from_bits(buf.get_u64()))
                }
                KIND_BOOLEAN => {
                    ensure(&buf, 1)?;
                    match buf.get_u8() {
                        0 => FieldValue::Bool(false),
                        1 => FieldValue::Bool(true),
                        _ => return Err(CodecError::malformed("boolean field must be 0/1")),
                    }
                }
                KIND_BYTES => FieldValue::Bytes(take_len_prefixed(&mut buf)?),
                other => {
                    return Err(CodecError::malformed(format!("unknown field kind {}", other)))
                }
            };
            instance.fields.push((name, value));
        }
        if buf.has_remaining() {
            return Err(CodecError::malformed("trailing bytes after last field"));
        }
        Ok(instance)
    }

    /// Wire form: the type name as tag, the field stream as payload.
    pub fn to_wire(&self) -> CodecResult<WireValue> {
        Ok(WireValue::new(self.type_name.clone(), self.encode()?))
    }

    fn shape_error(&self, detail: impl Into<String>) -> CodecError {
        CodecError::ShapeMismatch {
            type_name: self.type_name.clone(),
            detail: detail.into(),
        }
    }
}

impl fmt::Display for ObjectInstance {
    /// Renders `Type{field=value, ...}`; this is also the node's `toString()`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{{", self.type_name)?;
        for (idx, (name, value)) in self.fields.iter().enumerate() {
            if idx > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={}", name, value)?;
        }
        write!(f, "}}")
    }
}

fn put_len_prefixed(out: &mut Vec<u8>, data: &[u8]) {
    out.put_u32(data.len() as u32);
    out.put_slice(data);
}

fn take_len_prefixed(buf: &mut &[u8]) -> CodecResult<Vec<u8>> {
    ensure(buf, 4)?;
    let len = buf.get_u32() as usize;
    ensure(buf, len)?;
    let data = buf[..len].to_vec();
    buf.advance(len);
    Ok(data)
}

fn ensure(buf: &&[u8], needed: usize) -> CodecResult<()> {
    if buf.remaining() < needed {
        return Err(CodecError::malformed("payload ended early"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ObjectInstance {
        ObjectInstance::new("example.Greeting")
            .with_field("value", FieldValue::String("hello".to_string()))
            .with_field("count", FieldValue::Int(3))
            .with_field("score", FieldValue::Double(2.5))
            .with_field("tag", FieldValue::Null)
    }

    #[test]
    fn object_stream_is_deterministic() {
        let original = sample();
        let bytes = original.encode().unwrap();
        let decoded = ObjectInstance::decode("example.Greeting", &bytes).unwrap();
        assert_eq!(decoded, original);
        assert_eq!(decoded.encode().unwrap(), bytes);
    }

    #[test]
    fn object_lookup_and_display() {
        let object = sample();
        assert_eq!(object.field("count"), Some(&FieldValue::Int(3)));
        assert_eq!(object.field("missing"), None);
        assert_eq!(
            object.to_string(),
            "example.Greeting{value=hello, count=3, score=2.5, tag=null}"
        );
    }

    #[test]
    fn truncated_stream_is_malformed() {
        let bytes = sample().encode().unwrap();
        let err = ObjectInstance::decode("example.Greeting", &bytes[..bytes.len() - 3]).unwrap_err();
        assert!(matches!(err, CodecError::Malformed(_)));
    }

    #[test]
    fn primitive_tags_check_kind() {
        assert_eq!(WireValue::long(-9).as_long().unwrap(), -9);
        assert_eq!(WireValue::string("x").to_field().unwrap(), FieldValue::String("x".into()));
        let err = WireValue::int(1).as_string().unwrap_err();
        assert_eq!(
            err,
            CodecError::TypeMismatch {
                expected: TAG_STRING.to_string(),
                found: TAG_INT.to_string()
            }
        );
        assert!(WireValue::new("example.Greeting", Vec::new()).is_object());
        assert!(!WireValue::boolean(true).is_object());
    }
}
