//! Property type tags for boxdb
//!
//! This module defines the closed set of property types an entity can store.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Property type tag
///
/// The discriminants are the codes persisted in the catalog.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TypeTag {
    /// Boolean
    Bool = 1,
    /// Signed 8-bit integer
    Byte = 2,
    /// Signed 16-bit integer
    Short = 3,
    /// Signed 32-bit integer
    Int = 5,
    /// Signed 64-bit integer
    Long = 6,
    /// 32-bit float
    Float = 7,
    /// 64-bit float
    Double = 8,
    /// UTF-8 string
    String = 9,
    /// Milliseconds since the Unix epoch
    Date = 10,
    /// Raw bytes
    ByteVector = 23,
}

impl TypeTag {
    /// All tags, in code order
    pub const ALL: [TypeTag; 10] = [
        TypeTag::Bool,
        TypeTag::Byte,
        TypeTag::Short,
        TypeTag::Int,
        TypeTag::Long,
        TypeTag::Float,
        TypeTag::Double,
        TypeTag::String,
        TypeTag::Date,
        TypeTag::ByteVector,
    ];

    /// Persisted code of this tag
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Tag for a persisted code
    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.code() == code)
    }

    /// Encoded width in bytes for fixed-width types
    pub fn size(&self) -> Option<usize> {
        match self {
            TypeTag::Bool | TypeTag::Byte => Some(1),
            TypeTag::Short => Some(2),
            TypeTag::Int | TypeTag::Float => Some(4),
            TypeTag::Long | TypeTag::Double | TypeTag::Date => Some(8),
            TypeTag::String | TypeTag::ByteVector => None,
        }
    }

    /// Check if this type is an integer type
    pub fn is_integral(&self) -> bool {
        matches!(
            self,
            TypeTag::Byte | TypeTag::Short | TypeTag::Int | TypeTag::Long
        )
    }

    /// Check if this type is a floating point type
    pub fn is_floating(&self) -> bool {
        matches!(self, TypeTag::Float | TypeTag::Double)
    }

    /// Check if this type is numeric
    pub fn is_numeric(&self) -> bool {
        self.is_integral() || self.is_floating()
    }

    /// Lowercase name, as used in schema files
    pub fn name(&self) -> &'static str {
        match self {
            TypeTag::Bool => "bool",
            TypeTag::Byte => "byte",
            TypeTag::Short => "short",
            TypeTag::Int => "int",
            TypeTag::Long => "long",
            TypeTag::Float => "float",
            TypeTag::Double => "double",
            TypeTag::String => "string",
            TypeTag::Date => "date",
            TypeTag::ByteVector => "bytes",
        }
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeTag::Bool => write!(f, "BOOL"),
            TypeTag::Byte => write!(f, "BYTE"),
            TypeTag::Short => write!(f, "SHORT"),
            TypeTag::Int => write!(f, "INT"),
            TypeTag::Long => write!(f, "LONG"),
            TypeTag::Float => write!(f, "FLOAT"),
            TypeTag::Double => write!(f, "DOUBLE"),
            TypeTag::String => write!(f, "STRING"),
            TypeTag::Date => write!(f, "DATE"),
            TypeTag::ByteVector => write!(f, "BYTE_VECTOR"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_size() {
        assert_eq!(TypeTag::Int.size(), Some(4));
        assert_eq!(TypeTag::Date.size(), Some(8));
        assert_eq!(TypeTag::String.size(), None);
    }

    #[test]
    fn test_codes_round_trip() {
        for tag in TypeTag::ALL {
            assert_eq!(TypeTag::from_code(tag.code()), Some(tag));
        }
        assert_eq!(TypeTag::from_code(4), None);
        assert_eq!(TypeTag::ByteVector.code(), 23);
    }
}
