//! Property values for boxdb
//!
//! This module defines how property values are represented in memory and how
//! they compare.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use crate::catalog::TypeTag;

/// A property value
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    /// Absent value
    Null,
    /// Boolean value
    Bool(bool),
    /// 8-bit integer
    Byte(i8),
    /// 16-bit integer
    Short(i16),
    /// 32-bit integer
    Int(i32),
    /// 64-bit integer
    Long(i64),
    /// 32-bit float
    Float(f32),
    /// 64-bit float
    Double(f64),
    /// String value
    String(String),
    /// Binary data
    Bytes(Vec<u8>),
    /// Milliseconds since the Unix epoch
    Date(i64),
}

// Floats compare by bit pattern so that values can be used as index keys.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Byte(a), Value::Byte(b)) => a == b,
            (Value::Short(a), Value::Short(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Long(a), Value::Long(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Double(a), Value::Double(b)) => a.to_bits() == b.to_bits(),
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Date(a), Value::Date(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl std::hash::Hash for Value {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Null => {}
            Value::Bool(v) => v.hash(state),
            Value::Byte(v) => v.hash(state),
            Value::Short(v) => v.hash(state),
            Value::Int(v) => v.hash(state),
            Value::Long(v) => v.hash(state),
            Value::Float(v) => v.to_bits().hash(state),
            Value::Double(v) => v.to_bits().hash(state),
            Value::String(v) => v.hash(state),
            Value::Bytes(v) => v.hash(state),
            Value::Date(v) => v.hash(state),
        }
    }
}

impl Value {
    /// Check if this value is null
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The type tag of this value, `None` for null
    pub fn type_tag(&self) -> Option<TypeTag> {
        match self {
            Value::Null => None,
            Value::Bool(_) => Some(TypeTag::Bool),
            Value::Byte(_) => Some(TypeTag::Byte),
            Value::Short(_) => Some(TypeTag::Short),
            Value::Int(_) => Some(TypeTag::Int),
            Value::Long(_) => Some(TypeTag::Long),
            Value::Float(_) => Some(TypeTag::Float),
            Value::Double(_) => Some(TypeTag::Double),
            Value::String(_) => Some(TypeTag::String),
            Value::Bytes(_) => Some(TypeTag::ByteVector),
            Value::Date(_) => Some(TypeTag::Date),
        }
    }

    /// Get the type name of this value
    pub fn type_name(&self) -> &'static str {
        match self.type_tag() {
            Some(tag) => tag.name(),
            None => "null",
        }
    }

    /// Try to convert to bool
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Integer view of integral and date values
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Byte(v) => Some(*v as i64),
            Value::Short(v) => Some(*v as i64),
            Value::Int(v) => Some(*v as i64),
            Value::Long(v) | Value::Date(v) => Some(*v),
            _ => None,
        }
    }

    /// Floating point view of numeric values
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v as f64),
            Value::Double(v) => Some(*v),
            Value::Byte(_) | Value::Short(_) | Value::Int(_) | Value::Long(_) => {
                self.as_i64().map(|i| i as f64)
            }
            _ => None,
        }
    }

    /// Try to view as string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Try to view as bytes
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Convert a comparison operand to the representation of `tag`.
    ///
    /// Integers convert between integer widths when in range and into float
    /// and date types; floats convert between float widths. Returns `None`
    /// when the value cannot represent a `tag` value.
    pub fn coerce_to(&self, tag: TypeTag) -> Option<Value> {
        if self.type_tag() == Some(tag) {
            return Some(self.clone());
        }
        match (self, tag) {
            (Value::Null, _) => None,
            (v, TypeTag::Byte) if v.is_integral() => {
                v.as_i64().and_then(|i| i8::try_from(i).ok()).map(Value::Byte)
            }
            (v, TypeTag::Short) if v.is_integral() => {
                v.as_i64().and_then(|i| i16::try_from(i).ok()).map(Value::Short)
            }
            (v, TypeTag::Int) if v.is_integral() => {
                v.as_i64().and_then(|i| i32::try_from(i).ok()).map(Value::Int)
            }
            (v, TypeTag::Long) if v.is_integral() || matches!(v, Value::Date(_)) => {
                v.as_i64().map(Value::Long)
            }
            (v, TypeTag::Date) if v.is_integral() => v.as_i64().map(Value::Date),
            (v, TypeTag::Float) if v.is_integral() || v.is_floating() => {
                v.as_f64().map(|f| Value::Float(f as f32))
            }
            (v, TypeTag::Double) if v.is_integral() || v.is_floating() => {
                v.as_f64().map(Value::Double)
            }
            _ => None,
        }
    }

    fn is_integral(&self) -> bool {
        matches!(
            self,
            Value::Byte(_) | Value::Short(_) | Value::Int(_) | Value::Long(_)
        )
    }

    fn is_floating(&self) -> bool {
        matches!(self, Value::Float(_) | Value::Double(_))
    }

    /// Compare two values for predicates.
    ///
    /// Numbers compare across widths; null and incompatible types yield `None`.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Null, _) | (_, Value::Null) => None,
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::String(a), Value::String(b)) => Some(a.as_bytes().cmp(b.as_bytes())),
            (Value::Bytes(a), Value::Bytes(b)) => Some(a.cmp(b)),
            (Value::Date(a), Value::Date(b)) => Some(a.cmp(b)),
            (a, b) if a.is_integral() && b.is_integral() => {
                Some(a.as_i64()?.cmp(&b.as_i64()?))
            }
            (a, b) if (a.is_integral() || a.is_floating()) && (b.is_integral() || b.is_floating()) => {
                Some(a.as_f64()?.total_cmp(&b.as_f64()?))
            }
            _ => None,
        }
    }

    /// Total order over all values, used for sorting and index keys.
    ///
    /// Null sorts first, then values are grouped by type tag; within a type
    /// the natural order applies (floats by IEEE total order, strings by byte
    /// value, dates as timestamps).
    pub fn total_cmp(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Null, _) => Ordering::Less,
            (_, Value::Null) => Ordering::Greater,
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::Double(a), Value::Double(b)) => a.total_cmp(b),
            (a, b) => match a.compare(b) {
                Some(ord) if a.type_tag() == b.type_tag() => ord,
                _ => a.type_tag().cmp(&b.type_tag()),
            },
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Byte(i) => write!(f, "{}", i),
            Value::Short(i) => write!(f, "{}", i),
            Value::Int(i) => write!(f, "{}", i),
            Value::Long(i) => write!(f, "{}", i),
            Value::Float(n) => write!(f, "{}", n),
            Value::Double(n) => write!(f, "{}", n),
            Value::String(s) => write!(f, "{:?}", s),
            Value::Bytes(b) => write!(f, "bytes[{}]", b.len()),
            Value::Date(d) => write!(f, "date({})", d),
        }
    }
}
