//! Type registry
//!
//! Maps Rust scalar types onto [`TypeTag`]s and implements the value codec.
//!
//! Fixed-width values are stored little-endian at their natural width;
//! strings and byte vectors are prefixed with a `u32` length. Every stored
//! value is wrapped in a one-byte presence marker, so null never shares a bit
//! pattern with a real value.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use super::types::TypeTag;
use crate::error::{Error, Result};
use crate::storage::record::EntityId;
use crate::storage::value::Value;

/// Marker byte for an absent value
pub const NULL_MARKER: u8 = 0x00;

/// Marker byte preceding a present value
pub const PRESENT_MARKER: u8 = 0x01;

/// A point in time with millisecond precision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Date(pub i64);

impl Date {
    /// Create a date from milliseconds since the Unix epoch
    pub fn from_millis(millis: i64) -> Self {
        Date(millis)
    }

    /// Milliseconds since the Unix epoch
    pub fn millis(&self) -> i64 {
        self.0
    }

    /// The current time
    pub fn now() -> Self {
        Date::from(SystemTime::now())
    }
}

impl From<SystemTime> for Date {
    fn from(time: SystemTime) -> Self {
        match time.duration_since(UNIX_EPOCH) {
            Ok(after) => Date(after.as_millis() as i64),
            Err(before) => Date(-(before.duration().as_millis() as i64)),
        }
    }
}

impl From<Date> for SystemTime {
    fn from(date: Date) -> Self {
        if date.0 >= 0 {
            UNIX_EPOCH + Duration::from_millis(date.0 as u64)
        } else {
            UNIX_EPOCH - Duration::from_millis(date.0.unsigned_abs())
        }
    }
}

/// A Rust type that can be stored as an entity property.
///
/// `Option<T>` maps to the same tag as `T` and is stored as nullable.
pub trait PropertyType: Sized {
    /// Tag this type is stored as
    const TYPE_TAG: TypeTag;

    /// Whether the property may hold null
    const NULLABLE: bool = false;

    /// Convert into a property value
    fn into_value(self) -> Value;

    /// Convert back from a property value
    fn from_value(value: Value) -> Result<Self>;
}

fn mismatch<T>(expected: TypeTag, value: &Value) -> Result<T> {
    Err(Error::type_mismatch("<value>", expected, value.type_name()))
}

macro_rules! property_type {
    ($ty:ty, $tag:ident, $variant:ident) => {
        impl PropertyType for $ty {
            const TYPE_TAG: TypeTag = TypeTag::$tag;

            fn into_value(self) -> Value {
                Value::$variant(self)
            }

            fn from_value(value: Value) -> Result<Self> {
                match value {
                    Value::$variant(v) => Ok(v),
                    other => mismatch(TypeTag::$tag, &other),
                }
            }
        }
    };
}

property_type!(bool, Bool, Bool);
property_type!(i8, Byte, Byte);
property_type!(i16, Short, Short);
property_type!(i32, Int, Int);
property_type!(i64, Long, Long);
property_type!(f32, Float, Float);
property_type!(f64, Double, Double);
property_type!(String, String, String);
property_type!(Vec<u8>, ByteVector, Bytes);

impl PropertyType for u8 {
    const TYPE_TAG: TypeTag = TypeTag::Byte;

    fn into_value(self) -> Value {
        Value::Byte(self as i8)
    }

    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Byte(v) => Ok(v as u8),
            other => mismatch(TypeTag::Byte, &other),
        }
    }
}

impl PropertyType for EntityId {
    const TYPE_TAG: TypeTag = TypeTag::Long;

    fn into_value(self) -> Value {
        Value::Long(self.get() as i64)
    }

    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Long(v) => Ok(EntityId::new(v as u64)),
            other => mismatch(TypeTag::Long, &other),
        }
    }
}

impl PropertyType for Date {
    const TYPE_TAG: TypeTag = TypeTag::Date;

    fn into_value(self) -> Value {
        Value::Date(self.0)
    }

    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Date(v) => Ok(Date(v)),
            other => mismatch(TypeTag::Date, &other),
        }
    }
}

impl PropertyType for SystemTime {
    const TYPE_TAG: TypeTag = TypeTag::Date;

    fn into_value(self) -> Value {
        Date::from(self).into_value()
    }

    fn from_value(value: Value) -> Result<Self> {
        Date::from_value(value).map(SystemTime::from)
    }
}

impl<T: PropertyType> PropertyType for Option<T> {
    const TYPE_TAG: TypeTag = T::TYPE_TAG;
    const NULLABLE: bool = true;

    fn into_value(self) -> Value {
        match self {
            Some(v) => v.into_value(),
            None => Value::Null,
        }
    }

    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

impl<T: PropertyType> From<T> for Value {
    fn from(v: T) -> Self {
        v.into_value()
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

/// Tag of a runtime value, `None` for null
pub fn type_of(value: &Value) -> Option<TypeTag> {
    value.type_tag()
}

/// Encode a value with its presence marker
pub fn encode(value: &Value) -> Vec<u8> {
    let mut buf = BytesMut::new();
    encode_into(value, &mut buf);
    buf.to_vec()
}

/// Decode a value previously produced by [`encode`]
pub fn decode(bytes: &[u8], tag: TypeTag) -> Result<Value> {
    let mut buf = bytes;
    let value = decode_from(&mut buf, tag)?;
    if buf.has_remaining() {
        return Err(Error::Serialization(format!(
            "{} trailing bytes after {} value",
            buf.remaining(),
            tag
        )));
    }
    Ok(value)
}

/// Append a marked value to `buf`
pub fn encode_into(value: &Value, buf: &mut BytesMut) {
    match value {
        Value::Null => buf.put_u8(NULL_MARKER),
        present => {
            buf.put_u8(PRESENT_MARKER);
            encode_payload(present, buf);
        }
    }
}

/// Append a value checked against the declared tag of `property`
pub fn encode_checked(
    property: &str,
    tag: TypeTag,
    nullable: bool,
    value: &Value,
    buf: &mut BytesMut,
) -> Result<()> {
    match value.type_tag() {
        None if !nullable => return Err(Error::NullNotAllowed(property.to_string())),
        Some(found) if found != tag => {
            return Err(Error::type_mismatch(property, tag, found));
        }
        _ => {}
    }
    encode_into(value, buf);
    Ok(())
}

fn encode_payload(value: &Value, buf: &mut BytesMut) {
    match value {
        Value::Null => {}
        Value::Bool(b) => buf.put_u8(u8::from(*b)),
        Value::Byte(v) => buf.put_i8(*v),
        Value::Short(v) => buf.put_i16_le(*v),
        Value::Int(v) => buf.put_i32_le(*v),
        Value::Long(v) | Value::Date(v) => buf.put_i64_le(*v),
        Value::Float(v) => buf.put_f32_le(*v),
        Value::Double(v) => buf.put_f64_le(*v),
        Value::String(s) => {
            buf.put_u32_le(s.len() as u32);
            buf.put_slice(s.as_bytes());
        }
        Value::Bytes(b) => {
            buf.put_u32_le(b.len() as u32);
            buf.put_slice(b);
        }
    }
}

fn need(buf: &[u8], n: usize, what: TypeTag) -> Result<()> {
    if buf.remaining() < n {
        return Err(Error::Serialization(format!(
            "truncated {} value: need {} bytes, have {}",
            what,
            n,
            buf.remaining()
        )));
    }
    Ok(())
}

/// Read one marked value of type `tag` from the front of `buf`
pub fn decode_from(buf: &mut &[u8], tag: TypeTag) -> Result<Value> {
    need(*buf, 1, tag)?;
    match buf.get_u8() {
        NULL_MARKER => Ok(Value::Null),
        PRESENT_MARKER => decode_payload(buf, tag),
        marker => Err(Error::Serialization(format!(
            "invalid presence marker 0x{:02x}",
            marker
        ))),
    }
}

fn decode_payload(buf: &mut &[u8], tag: TypeTag) -> Result<Value> {
    if let Some(width) = tag.size() {
        need(*buf, width, tag)?;
    }
    let value = match tag {
        TypeTag::Bool => match buf.get_u8() {
            0 => Value::Bool(false),
            1 => Value::Bool(true),
            other => {
                return Err(Error::Serialization(format!("invalid bool byte {}", other)))
            }
        },
        TypeTag::Byte => Value::Byte(buf.get_i8()),
        TypeTag::Short => Value::Short(buf.get_i16_le()),
        TypeTag::Int => Value::Int(buf.get_i32_le()),
        TypeTag::Long => Value::Long(buf.get_i64_le()),
        TypeTag::Date => Value::Date(buf.get_i64_le()),
        TypeTag::Float => Value::Float(buf.get_f32_le()),
        TypeTag::Double => Value::Double(buf.get_f64_le()),
        TypeTag::String | TypeTag::ByteVector => {
            need(*buf, 4, tag)?;
            let len = buf.get_u32_le() as usize;
            need(*buf, len, tag)?;
            let data = buf[..len].to_vec();
            buf.advance(len);
            if tag == TypeTag::String {
                Value::String(
                    String::from_utf8(data).map_err(|e| Error::Serialization(e.to_string()))?,
                )
            } else {
                Value::Bytes(data)
            }
        }
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn arb_value() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i8>().prop_map(Value::Byte),
            any::<i16>().prop_map(Value::Short),
            any::<i32>().prop_map(Value::Int),
            any::<i64>().prop_map(Value::Long),
            any::<f32>().prop_map(Value::Float),
            any::<f64>().prop_map(Value::Double),
            ".*".prop_map(Value::String),
            prop::collection::vec(any::<u8>(), 0..64).prop_map(Value::Bytes),
            any::<i64>().prop_map(Value::Date),
        ]
    }

    proptest! {
        #[test]
        fn prop_decode_inverts_encode(value in arb_value()) {
            let tag = type_of(&value).unwrap_or(TypeTag::Long);
            let decoded = decode(&encode(&value), tag).unwrap();
            prop_assert_eq!(decoded, value);
        }
    }

    #[test]
    fn test_fixed_widths() {
        assert_eq!(encode(&Value::Int(1)), vec![1, 1, 0, 0, 0]);
        assert_eq!(encode(&Value::Short(-1)), vec![1, 0xff, 0xff]);
        assert_eq!(encode(&Value::Date(0)).len(), 9);
        assert_eq!(encode(&Value::String("ab".into())), vec![1, 2, 0, 0, 0, b'a', b'b']);
    }

    #[test]
    fn test_null_marker_is_distinct() {
        assert_eq!(encode(&Value::Null), vec![NULL_MARKER]);
        // A present zero still carries the presence marker.
        assert_eq!(encode(&Value::Byte(0)), vec![PRESENT_MARKER, 0]);
        assert_eq!(decode(&[NULL_MARKER], TypeTag::Int).unwrap(), Value::Null);
    }

    #[test]
    fn test_checked_encoding() {
        let mut buf = BytesMut::new();
        let err = encode_checked("age", TypeTag::Int, true, &Value::Long(3), &mut buf).unwrap_err();
        assert!(matches!(err, Error::TypeMismatch { .. }));

        let err = encode_checked("name", TypeTag::String, false, &Value::Null, &mut buf).unwrap_err();
        assert!(matches!(err, Error::NullNotAllowed(_)));

        encode_checked("age", TypeTag::Int, true, &Value::Null, &mut buf).unwrap();
        assert_eq!(&buf[..], &[NULL_MARKER]);
    }

    #[test]
    fn test_truncated_input() {
        assert!(decode(&[PRESENT_MARKER, 1, 2], TypeTag::Int).is_err());
        assert!(decode(&[PRESENT_MARKER, 9, 0, 0, 0, b'x'], TypeTag::String).is_err());
        assert!(decode(&[7], TypeTag::Int).is_err());
    }

    #[test]
    fn test_property_type_mapping() {
        assert_eq!(<i32 as PropertyType>::TYPE_TAG, TypeTag::Int);
        assert_eq!(<Option<String> as PropertyType>::TYPE_TAG, TypeTag::String);
        assert_eq!(<EntityId as PropertyType>::TYPE_TAG, TypeTag::Long);
        assert_eq!(<SystemTime as PropertyType>::TYPE_TAG, TypeTag::Date);

        assert_eq!(Option::<i16>::None.into_value(), Value::Null);
        assert_eq!(Option::<i16>::from_value(Value::Short(4)).unwrap(), Some(4));
        assert!(i32::from_value(Value::Long(4)).is_err());
    }

    #[test]
    fn test_date_conversion() {
        let date = Date::from_millis(-1500);
        let time: SystemTime = date.into();
        assert_eq!(Date::from(time), date);
    }
}
