//! # Serialization Codec
//!
//! Purpose: Turn application keys and values into tagged wire values and
//! back, either through explicitly supplied byte codecs or through a
//! declared field list (auto-serialization).
//!
//! ## Design Principles
//! 1. **Explicit Schemas**: Auto-serialized types list their fields in code
//!    (`AutoSerializable`); nothing is discovered at runtime.
//! 2. **Tag Table**: Which tags this client may decode is decided by a
//!    read-mostly table plus the optional auto-serialization pattern.
//! 3. **Strict Shapes**: Decoding checks every field name and kind in order;
//!    a renamed, missing or extra field is a shape mismatch.
//!
//! ## Usage
//!
//! ```rust,ignore
//! struct Greeting { value: String }
//!
//! impl AutoSerializable for Greeting {
//!     const TYPE_NAME: &'static str = "example.Greeting";
//!     fn write_fields(&self, writer: &mut FieldWriter) {
//!         writer.write_string("value", &self.value);
//!     }
//!     fn read_fields(reader: &mut FieldReader<'_>) -> CodecResult<Self> {
//!         Ok(Greeting { value: reader.read_string("value")? })
//!     }
//! }
//! gkv_client::auto_region_value!(Greeting);
//! ```

use std::collections::HashMap;
use std::fmt;

use parking_lot::RwLock;
use regex::Regex;
use tracing::debug;

use gkv_common::{
    is_builtin_tag, CodecError, CodecResult, FieldValue, ObjectInstance, WireValue, TAG_BOOLEAN,
    TAG_BYTES, TAG_DOUBLE, TAG_INT, TAG_LONG, TAG_STRING,
};

use crate::client::{ClientError, ClientResult};
use crate::config::SerializationStrategy;

/// A type whose wire form is its declared field list.
pub trait AutoSerializable: Sized {
    /// Type name carried as the wire tag.
    const TYPE_NAME: &'static str;

    /// Writes every field, always in the same order.
    fn write_fields(&self, writer: &mut FieldWriter);

    /// Reads the fields back in the order `write_fields` wrote them.
    fn read_fields(reader: &mut FieldReader<'_>) -> CodecResult<Self>;
}

/// A type that supplies its own byte encoding.
pub trait DataSerializable: Sized {
    /// Type name carried as the wire tag.
    const TYPE_NAME: &'static str;

    fn to_bytes(&self, out: &mut Vec<u8>);

    fn from_bytes(bytes: &[u8]) -> CodecResult<Self>;
}

/// Collects fields in declaration order.
pub struct FieldWriter {
    instance: ObjectInstance,
}

impl FieldWriter {
    fn new(type_name: &str) -> Self {
        FieldWriter {
            instance: ObjectInstance::new(type_name),
        }
    }

    pub fn write(&mut self, name: &str, value: FieldValue) {
        self.instance.push(name, value);
    }

    pub fn write_string(&mut self, name: &str, value: &str) {
        self.write(name, FieldValue::String(value.to_string()));
    }

    pub fn write_opt_string(&mut self, name: &str, value: Option<&str>) {
        match value {
            Some(value) => self.write_string(name, value),
            None => self.write(name, FieldValue::Null),
        }
    }

    pub fn write_int(&mut self, name: &str, value: i32) {
        self.write(name, FieldValue::Int(value));
    }

    pub fn write_long(&mut self, name: &str, value: i64) {
        self.write(name, FieldValue::Long(value));
    }

    pub fn write_double(&mut self, name: &str, value: f64) {
        self.write(name, FieldValue::Double(value));
    }

    pub fn write_bool(&mut self, name: &str, value: bool) {
        self.write(name, FieldValue::Bool(value));
    }

    pub fn write_bytes(&mut self, name: &str, value: &[u8]) {
        self.write(name, FieldValue::Bytes(value.to_vec()));
    }

    fn finish(self) -> ObjectInstance {
        self.instance
    }
}

/// Reads fields back in declaration order, checking names and kinds.
pub struct FieldReader<'a> {
    instance: &'a ObjectInstance,
    position: usize,
}

impl<'a> FieldReader<'a> {
    fn new(instance: &'a ObjectInstance) -> Self {
        FieldReader {
            instance,
            position: 0,
        }
    }

    /// Returns the next field, which must be called `name`.
    pub fn read(&mut self, name: &str) -> CodecResult<&'a FieldValue> {
        let fields = self.instance.fields();
        let (found, value) = fields.get(self.position).ok_or_else(|| {
            self.mismatch(format!("missing field `{}` at position {}", name, self.position))
        })?;
        if found != name {
            return Err(self.mismatch(format!(
                "expected field `{}` at position {}, found `{}`",
                name, self.position, found
            )));
        }
        self.position += 1;
        Ok(value)
    }

    pub fn read_string(&mut self, name: &str) -> CodecResult<String> {
        match self.read(name)? {
            FieldValue::String(value) => Ok(value.clone()),
            other => Err(self.wrong_kind(name, TAG_STRING, other)),
        }
    }

    pub fn read_opt_string(&mut self, name: &str) -> CodecResult<Option<String>> {
        match self.read(name)? {
            FieldValue::String(value) => Ok(Some(value.clone())),
            FieldValue::Null => Ok(None),
            other => Err(self.wrong_kind(name, TAG_STRING, other)),
        }
    }

    pub fn read_int(&mut self, name: &str) -> CodecResult<i32> {
        match self.read(name)? {
            FieldValue::Int(value) => Ok(*value),
            other => Err(self.wrong_kind(name, TAG_INT, other)),
        }
    }

    pub fn read_long(&mut self, name: &str) -> CodecResult<i64> {
        match self.read(name)? {
            FieldValue::Long(value) => Ok(*value),
            other => Err(self.wrong_kind(name, TAG_LONG, other)),
        }
    }

    pub fn read_double(&mut self, name: &str) -> CodecResult<f64> {
        match self.read(name)? {
            FieldValue::Double(value) => Ok(*value),
            other => Err(self.wrong_kind(name, TAG_DOUBLE, other)),
        }
    }

    pub fn read_bool(&mut self, name: &str) -> CodecResult<bool> {
        match self.read(name)? {
            FieldValue::Bool(value) => Ok(*value),
            other => Err(self.wrong_kind(name, TAG_BOOLEAN, other)),
        }
    }

    pub fn read_bytes(&mut self, name: &str) -> CodecResult<Vec<u8>> {
        match self.read(name)? {
            FieldValue::Bytes(value) => Ok(value.clone()),
            other => Err(self.wrong_kind(name, TAG_BYTES, other)),
        }
    }

    fn finish(&self) -> CodecResult<()> {
        let fields = self.instance.fields();
        if self.position < fields.len() {
            return Err(self.mismatch(format!(
                "unexpected extra field `{}`",
                fields[self.position].0
            )));
        }
        Ok(())
    }

    fn wrong_kind(&self, name: &str, expected: &str, found: &FieldValue) -> CodecError {
        self.mismatch(format!(
            "field `{}` should be {}, found {}",
            name,
            expected,
            found.kind_name()
        ))
    }

    fn mismatch(&self, detail: String) -> CodecError {
        CodecError::ShapeMismatch {
            type_name: self.instance.type_name().to_string(),
            detail,
        }
    }
}

/// How a registered tag is decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeKind {
    /// Object field stream.
    Auto,
    /// Application-defined bytes.
    Data,
}

/// Per-client codec: serialization mode plus the tag table.
pub struct Codec {
    pattern: Option<Regex>,
    types: RwLock<HashMap<String, TypeKind>>,
}

impl Codec {
    /// Builds a codec for the configured strategy.
    pub fn new(strategy: &SerializationStrategy) -> ClientResult<Self> {
        let pattern = match strategy {
            SerializationStrategy::Manual => None,
            SerializationStrategy::Auto { pattern } => {
                // Whole-name match, like an anchored class-name pattern.
                let anchored = format!("^(?:{})$", pattern);
                let regex = Regex::new(&anchored).map_err(|err| {
                    ClientError::Config(format!("invalid auto-serialization pattern: {}", err))
                })?;
                Some(regex)
            }
        };
        Ok(Codec {
            pattern,
            types: RwLock::new(HashMap::new()),
        })
    }

    /// Registers an auto-serialized type regardless of the pattern.
    pub fn register_auto<T: AutoSerializable>(&self) {
        self.register(T::TYPE_NAME, TypeKind::Auto);
    }

    /// Registers a type with an application-defined byte encoding.
    pub fn register_data<T: DataSerializable>(&self) {
        self.register(T::TYPE_NAME, TypeKind::Data);
    }

    fn register(&self, type_name: &str, kind: TypeKind) {
        let previous = self.types.write().insert(type_name.to_string(), kind);
        if previous.is_some_and(|previous| previous != kind) {
            debug!(type_name, ?kind, "type re-registered with a different kind");
        }
    }

    /// How `tag` decodes on this client, if at all.
    ///
    /// Names matched by the pattern are remembered so later lookups only
    /// take the read lock.
    pub fn kind_of(&self, tag: &str) -> Option<TypeKind> {
        if let Some(kind) = self.types.read().get(tag) {
            return Some(*kind);
        }
        let pattern = self.pattern.as_ref()?;
        if is_builtin_tag(tag) || !pattern.is_match(tag) {
            return None;
        }
        self.types.write().insert(tag.to_string(), TypeKind::Auto);
        Some(TypeKind::Auto)
    }

    fn require(&self, tag: &str, kind: TypeKind) -> CodecResult<()> {
        match self.kind_of(tag) {
            Some(found) if found == kind => Ok(()),
            _ => Err(CodecError::Unregistered(tag.to_string())),
        }
    }

    fn expect_tag(wire: &WireValue, expected: &str) -> CodecResult<()> {
        if wire.tag == expected {
            return Ok(());
        }
        Err(CodecError::TypeMismatch {
            expected: expected.to_string(),
            found: wire.tag.clone(),
        })
    }

    /// Encodes an auto-serializable value as an object field stream.
    pub fn encode_auto<T: AutoSerializable>(&self, value: &T) -> CodecResult<WireValue> {
        self.require(T::TYPE_NAME, TypeKind::Auto)?;
        to_instance(value).to_wire()
    }

    /// Decodes an object field stream into `T`.
    pub fn decode_auto<T: AutoSerializable>(&self, wire: &WireValue) -> CodecResult<T> {
        Self::expect_tag(wire, T::TYPE_NAME)?;
        if self.kind_of(&wire.tag) != Some(TypeKind::Auto) {
            return Err(CodecError::UnknownTag(wire.tag.clone()));
        }
        let instance = ObjectInstance::decode(&wire.tag, &wire.bytes)?;
        from_instance(&instance)
    }

    /// Encodes a value with its own byte codec.
    pub fn encode_data<T: DataSerializable>(&self, value: &T) -> CodecResult<WireValue> {
        self.require(T::TYPE_NAME, TypeKind::Data)?;
        let mut bytes = Vec::new();
        value.to_bytes(&mut bytes);
        Ok(WireValue::new(T::TYPE_NAME, bytes))
    }

    /// Decodes a value with its own byte codec.
    pub fn decode_data<T: DataSerializable>(&self, wire: &WireValue) -> CodecResult<T> {
        Self::expect_tag(wire, T::TYPE_NAME)?;
        if self.kind_of(&wire.tag) != Some(TypeKind::Data) {
            return Err(CodecError::UnknownTag(wire.tag.clone()));
        }
        T::from_bytes(&wire.bytes)
    }

    /// Decodes any value this client understands into a [`Value`].
    pub fn decode_value(&self, wire: WireValue) -> CodecResult<Value> {
        match wire.tag.as_str() {
            TAG_STRING => wire.as_string().map(Value::String),
            TAG_INT => wire.as_int().map(Value::Int),
            TAG_LONG => wire.as_long().map(Value::Long),
            TAG_DOUBLE => wire.as_double().map(Value::Double),
            TAG_BOOLEAN => wire.as_boolean().map(Value::Bool),
            TAG_BYTES => wire.into_bytes().map(Value::Bytes),
            tag => match self.kind_of(tag) {
                Some(TypeKind::Auto) => {
                    ObjectInstance::decode(tag, &wire.bytes).map(Value::Object)
                }
                Some(TypeKind::Data) => Ok(Value::Opaque(wire)),
                None => Err(CodecError::UnknownTag(tag.to_string())),
            },
        }
    }

    /// Encodes a [`Value`], checking that object tags are known here.
    pub fn encode_value(&self, value: &Value) -> CodecResult<WireValue> {
        match value {
            Value::String(value) => Ok(WireValue::string(value)),
            Value::Int(value) => Ok(WireValue::int(*value)),
            Value::Long(value) => Ok(WireValue::long(*value)),
            Value::Double(value) => Ok(WireValue::double(*value)),
            Value::Bool(value) => Ok(WireValue::boolean(*value)),
            Value::Bytes(value) => Ok(WireValue::bytes(value.clone())),
            Value::Object(instance) => {
                self.require(instance.type_name(), TypeKind::Auto)?;
                instance.to_wire()
            }
            Value::Opaque(wire) => {
                self.require(&wire.tag, TypeKind::Data)?;
                Ok(wire.clone())
            }
        }
    }
}

impl fmt::Debug for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Codec")
            .field("pattern", &self.pattern.as_ref().map(Regex::as_str))
            .field("types", &self.types.read().len())
            .finish()
    }
}

fn to_instance<T: AutoSerializable>(value: &T) -> ObjectInstance {
    let mut writer = FieldWriter::new(T::TYPE_NAME);
    value.write_fields(&mut writer);
    writer.finish()
}

fn from_instance<T: AutoSerializable>(instance: &ObjectInstance) -> CodecResult<T> {
    if instance.type_name() != T::TYPE_NAME {
        return Err(CodecError::TypeMismatch {
            expected: T::TYPE_NAME.to_string(),
            found: instance.type_name().to_string(),
        });
    }
    let mut reader = FieldReader::new(instance);
    let value = T::read_fields(&mut reader)?;
    reader.finish()?;
    Ok(value)
}

/// A dynamically typed region value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    Int(i32),
    Long(i64),
    Double(f64),
    Bool(bool),
    Bytes(Vec<u8>),
    /// Auto-serialized object, kept as its field list.
    Object(ObjectInstance),
    /// Value of a registered `DataSerializable` type, still encoded.
    Opaque(WireValue),
}

impl Value {
    /// Captures an auto-serializable value as an object.
    pub fn auto<T: AutoSerializable>(value: &T) -> Self {
        Value::Object(to_instance(value))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectInstance> {
        match self {
            Value::Object(instance) => Some(instance),
            _ => None,
        }
    }

    /// Converts an object value into its typed form.
    pub fn to_auto<T: AutoSerializable>(&self) -> CodecResult<T> {
        match self {
            Value::Object(instance) => from_instance(instance),
            other => Err(CodecError::TypeMismatch {
                expected: T::TYPE_NAME.to_string(),
                found: other.tag().to_string(),
            }),
        }
    }

    /// Decodes an opaque value with its own byte codec.
    pub fn to_data<T: DataSerializable>(&self) -> CodecResult<T> {
        match self {
            Value::Opaque(wire) if wire.tag == T::TYPE_NAME => T::from_bytes(&wire.bytes),
            other => Err(CodecError::TypeMismatch {
                expected: T::TYPE_NAME.to_string(),
                found: other.tag().to_string(),
            }),
        }
    }

    /// Tag this value travels under.
    pub fn tag(&self) -> &str {
        match self {
            Value::String(_) => TAG_STRING,
            Value::Int(_) => TAG_INT,
            Value::Long(_) => TAG_LONG,
            Value::Double(_) => TAG_DOUBLE,
            Value::Bool(_) => TAG_BOOLEAN,
            Value::Bytes(_) => TAG_BYTES,
            Value::Object(instance) => instance.type_name(),
            Value::Opaque(wire) => &wire.tag,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(value) => write!(f, "{}", value),
            Value::Int(value) => write!(f, "{}", value),
            Value::Long(value) => write!(f, "{}", value),
            Value::Double(value) => write!(f, "{}", value),
            Value::Bool(value) => write!(f, "{}", value),
            Value::Bytes(value) => write!(f, "{:?}", value),
            Value::Object(instance) => write!(f, "{}", instance),
            Value::Opaque(wire) => write!(f, "<{}: {} bytes>", wire.tag, wire.bytes.len()),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Long(value)
    }
}

/// A region key: built-in scalar with a stable wire form.
pub trait RegionKey: Sized + Clone + Send + 'static {
    fn to_wire(&self) -> WireValue;

    fn from_wire(wire: &WireValue) -> CodecResult<Self>;
}

impl RegionKey for i32 {
    fn to_wire(&self) -> WireValue {
        WireValue::int(*self)
    }

    fn from_wire(wire: &WireValue) -> CodecResult<Self> {
        wire.as_int()
    }
}

impl RegionKey for i64 {
    fn to_wire(&self) -> WireValue {
        WireValue::long(*self)
    }

    fn from_wire(wire: &WireValue) -> CodecResult<Self> {
        wire.as_long()
    }
}

impl RegionKey for String {
    fn to_wire(&self) -> WireValue {
        WireValue::string(self)
    }

    fn from_wire(wire: &WireValue) -> CodecResult<Self> {
        wire.as_string()
    }
}

/// A region value; application types usually implement this through
/// [`auto_region_value!`](crate::auto_region_value) or
/// [`data_region_value!`](crate::data_region_value).
pub trait RegionValue: Sized + Send + 'static {
    fn encode(&self, codec: &Codec) -> CodecResult<WireValue>;

    fn decode(wire: WireValue, codec: &Codec) -> CodecResult<Self>;
}

impl RegionValue for Value {
    fn encode(&self, codec: &Codec) -> CodecResult<WireValue> {
        codec.encode_value(self)
    }

    fn decode(wire: WireValue, codec: &Codec) -> CodecResult<Self> {
        codec.decode_value(wire)
    }
}

impl RegionValue for String {
    fn encode(&self, _codec: &Codec) -> CodecResult<WireValue> {
        Ok(WireValue::string(self))
    }

    fn decode(wire: WireValue, _codec: &Codec) -> CodecResult<Self> {
        wire.as_string()
    }
}

impl RegionValue for i32 {
    fn encode(&self, _codec: &Codec) -> CodecResult<WireValue> {
        Ok(WireValue::int(*self))
    }

    fn decode(wire: WireValue, _codec: &Codec) -> CodecResult<Self> {
        wire.as_int()
    }
}

impl RegionValue for i64 {
    fn encode(&self, _codec: &Codec) -> CodecResult<WireValue> {
        Ok(WireValue::long(*self))
    }

    fn decode(wire: WireValue, _codec: &Codec) -> CodecResult<Self> {
        wire.as_long()
    }
}

impl RegionValue for f64 {
    fn encode(&self, _codec: &Codec) -> CodecResult<WireValue> {
        Ok(WireValue::double(*self))
    }

    fn decode(wire: WireValue, _codec: &Codec) -> CodecResult<Self> {
        wire.as_double()
    }
}

impl RegionValue for bool {
    fn encode(&self, _codec: &Codec) -> CodecResult<WireValue> {
        Ok(WireValue::boolean(*self))
    }

    fn decode(wire: WireValue, _codec: &Codec) -> CodecResult<Self> {
        wire.as_boolean()
    }
}

impl RegionValue for Vec<u8> {
    fn encode(&self, _codec: &Codec) -> CodecResult<WireValue> {
        Ok(WireValue::bytes(self.clone()))
    }

    fn decode(wire: WireValue, _codec: &Codec) -> CodecResult<Self> {
        wire.into_bytes()
    }
}

/// Implements [`RegionValue`] for types implementing [`AutoSerializable`].
#[macro_export]
macro_rules! auto_region_value {
    ($($ty:ty),+ $(,)?) => {$(
        impl $crate::RegionValue for $ty {
            fn encode(&self, codec: &$crate::Codec) -> $crate::CodecResult<$crate::WireValue> {
                codec.encode_auto(self)
            }

            fn decode(wire: $crate::WireValue, codec: &$crate::Codec) -> $crate::CodecResult<Self> {
                codec.decode_auto(&wire)
            }
        }
    )+};
}

/// Implements [`RegionValue`] for types implementing [`DataSerializable`].
#[macro_export]
macro_rules! data_region_value {
    ($($ty:ty),+ $(,)?) => {$(
        impl $crate::RegionValue for $ty {
            fn encode(&self, codec: &$crate::Codec) -> $crate::CodecResult<$crate::WireValue> {
                codec.encode_data(self)
            }

            fn decode(wire: $crate::WireValue, codec: &$crate::Codec) -> $crate::CodecResult<Self> {
                codec.decode_data(&wire)
            }
        }
    )+};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Greeting {
        value: String,
        count: i32,
        note: Option<String>,
    }

    impl AutoSerializable for Greeting {
        const TYPE_NAME: &'static str = "example.Greeting";

        fn write_fields(&self, writer: &mut FieldWriter) {
            writer.write_string("value", &self.value);
            writer.write_int("count", self.count);
            writer.write_opt_string("note", self.note.as_deref());
        }

        fn read_fields(reader: &mut FieldReader<'_>) -> CodecResult<Self> {
            Ok(Greeting {
                value: reader.read_string("value")?,
                count: reader.read_int("count")?,
                note: reader.read_opt_string("note")?,
            })
        }
    }

    #[derive(Debug, PartialEq)]
    struct Point(i32, i32);

    impl DataSerializable for Point {
        const TYPE_NAME: &'static str = "geo.Point";

        fn to_bytes(&self, out: &mut Vec<u8>) {
            out.extend_from_slice(&self.0.to_be_bytes());
            out.extend_from_slice(&self.1.to_be_bytes());
        }

        fn from_bytes(bytes: &[u8]) -> CodecResult<Self> {
            if bytes.len() != 8 {
                return Err(CodecError::Malformed("point must be 8 bytes".into()));
            }
            let x = i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            let y = i32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
            Ok(Point(x, y))
        }
    }

    crate::auto_region_value!(Greeting);
    crate::data_region_value!(Point);

    fn auto_codec() -> Codec {
        Codec::new(&SerializationStrategy::Auto {
            pattern: "example\\..*".to_string(),
        })
        .unwrap()
    }

    fn greeting() -> Greeting {
        Greeting {
            value: "hello".to_string(),
            count: 2,
            note: None,
        }
    }

    #[test]
    fn auto_values_roundtrip_field_by_field() {
        let codec = auto_codec();
        let wire = greeting().encode(&codec).unwrap();
        assert_eq!(wire.tag, "example.Greeting");

        let decoded = Greeting::decode(wire.clone(), &codec).unwrap();
        assert_eq!(decoded, greeting());
        assert_eq!(decoded.encode(&codec).unwrap(), wire);
    }

    #[test]
    fn pattern_must_match_whole_name() {
        let codec = Codec::new(&SerializationStrategy::Auto {
            pattern: "example".to_string(),
        })
        .unwrap();
        let err = greeting().encode(&codec).unwrap_err();
        assert_eq!(err, CodecError::Unregistered("example.Greeting".to_string()));

        codec.register_auto::<Greeting>();
        assert!(greeting().encode(&codec).is_ok());
    }

    #[test]
    fn manual_mode_requires_registration() {
        let codec = Codec::new(&SerializationStrategy::Manual).unwrap();
        assert!(Point(1, 2).encode(&codec).is_err());

        codec.register_data::<Point>();
        let wire = Point(1, -2).encode(&codec).unwrap();
        assert_eq!(Point::decode(wire.clone(), &codec).unwrap(), Point(1, -2));

        let dynamic = codec.decode_value(wire).unwrap();
        assert_eq!(dynamic.to_data::<Point>().unwrap(), Point(1, -2));
    }

    #[test]
    fn unknown_tags_are_rejected() {
        let codec = Codec::new(&SerializationStrategy::Manual).unwrap();
        let err = codec
            .decode_value(WireValue::new("other.Thing", vec![0, 0]))
            .unwrap_err();
        assert_eq!(err, CodecError::UnknownTag("other.Thing".to_string()));
    }

    #[test]
    fn dynamic_objects_convert_to_typed() {
        let codec = auto_codec();
        let wire = codec.encode_value(&Value::auto(&greeting())).unwrap();
        let value = codec.decode_value(wire).unwrap();
        assert_eq!(
            value.as_object().and_then(|object| object.field("value")),
            Some(&FieldValue::String("hello".to_string()))
        );
        assert_eq!(value.to_auto::<Greeting>().unwrap(), greeting());
        assert_eq!(value.to_string(), "example.Greeting{value=hello, count=2, note=null}");
    }

    #[test]
    fn shape_mismatch_is_reported() {
        let codec = auto_codec();
        let renamed = ObjectInstance::new("example.Greeting")
            .with_field("text", FieldValue::String("hello".into()))
            .with_field("count", FieldValue::Int(2))
            .with_field("note", FieldValue::Null);
        let err = Greeting::decode(renamed.to_wire().unwrap(), &codec).unwrap_err();
        assert!(matches!(err, CodecError::ShapeMismatch { .. }));

        let extra = ObjectInstance::new("example.Greeting")
            .with_field("value", FieldValue::String("hello".into()))
            .with_field("count", FieldValue::Int(2))
            .with_field("note", FieldValue::Null)
            .with_field("more", FieldValue::Bool(true));
        let err = Greeting::decode(extra.to_wire().unwrap(), &codec).unwrap_err();
        assert!(matches!(err, CodecError::ShapeMismatch { .. }));

        let wrong_kind = ObjectInstance::new("example.Greeting")
            .with_field("value", FieldValue::Long(1))
            .with_field("count", FieldValue::Int(2))
            .with_field("note", FieldValue::Null);
        let err = Greeting::decode(wrong_kind.to_wire().unwrap(), &codec).unwrap_err();
        assert!(matches!(err, CodecError::ShapeMismatch { .. }));
    }

    #[test]
    fn concurrent_lookups_share_the_table() {
        let codec = std::sync::Arc::new(auto_codec());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let codec = codec.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        assert_eq!(codec.kind_of("example.Greeting"), Some(TypeKind::Auto));
                        assert_eq!(codec.kind_of("string"), None);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn invalid_pattern_is_a_config_error() {
        let err = Codec::new(&SerializationStrategy::Auto {
            pattern: "(".to_string(),
        })
        .unwrap_err();
        assert!(matches!(err, ClientError::Config(_)));
    }
}
