//! Strict decoding of protocol values
//!
//! Devices answer with plist values. The kind of a decoded value is authoritative:
//! asking for a string and getting a boolean is a protocol violation, never a cue
//! to fall back to a default.

use std::fmt;

use plist::Value;

use crate::ProtocolError;

/// The kind of a plist value as it appeared on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VariantKind {
    Boolean,
    /// A non-negative integer
    UnsignedInt,
    /// A negative integer
    SignedInt,
    Real,
    String,
    Mapping,
    Array,
    Binary,
    Date,
    Uid,
    Unknown,
}

impl VariantKind {
    /// Classifies a value
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Boolean(_) => Self::Boolean,
            Value::Integer(i) => {
                if i.as_unsigned().is_some() {
                    Self::UnsignedInt
                } else {
                    Self::SignedInt
                }
            }
            Value::Real(_) => Self::Real,
            Value::String(_) => Self::String,
            Value::Dictionary(_) => Self::Mapping,
            Value::Array(_) => Self::Array,
            Value::Data(_) => Self::Binary,
            Value::Date(_) => Self::Date,
            Value::Uid(_) => Self::Uid,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for VariantKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Boolean => "boolean",
            Self::UnsignedInt => "unsigned integer",
            Self::SignedInt => "signed integer",
            Self::Real => "real",
            Self::String => "string",
            Self::Mapping => "mapping",
            Self::Array => "array",
            Self::Binary => "binary data",
            Self::Date => "date",
            Self::Uid => "uid",
            Self::Unknown => "unknown value",
        };
        f.write_str(name)
    }
}

/// Types that can be decoded from exactly one plist kind
pub trait FromVariant: Sized {
    /// The only kind this type decodes from
    const KIND: VariantKind;

    /// Decodes `value`, failing with `KindMismatch` if it has another kind
    fn from_variant(value: &Value) -> Result<Self, ProtocolError>;
}

fn mismatch(expected: VariantKind, value: &Value) -> ProtocolError {
    ProtocolError::KindMismatch {
        expected,
        found: VariantKind::of(value),
    }
}

impl FromVariant for String {
    const KIND: VariantKind = VariantKind::String;

    fn from_variant(value: &Value) -> Result<Self, ProtocolError> {
        match value {
            Value::String(s) => Ok(s.clone()),
            other => Err(mismatch(Self::KIND, other)),
        }
    }
}

impl FromVariant for bool {
    const KIND: VariantKind = VariantKind::Boolean;

    fn from_variant(value: &Value) -> Result<Self, ProtocolError> {
        match value {
            Value::Boolean(b) => Ok(*b),
            other => Err(mismatch(Self::KIND, other)),
        }
    }
}

impl FromVariant for u64 {
    const KIND: VariantKind = VariantKind::UnsignedInt;

    fn from_variant(value: &Value) -> Result<Self, ProtocolError> {
        match value {
            Value::Integer(i) => i.as_unsigned().ok_or_else(|| mismatch(Self::KIND, value)),
            other => Err(mismatch(Self::KIND, other)),
        }
    }
}

impl FromVariant for Vec<u8> {
    const KIND: VariantKind = VariantKind::Binary;

    fn from_variant(value: &Value) -> Result<Self, ProtocolError> {
        match value {
            Value::Data(d) => Ok(d.clone()),
            other => Err(mismatch(Self::KIND, other)),
        }
    }
}

impl FromVariant for plist::Dictionary {
    const KIND: VariantKind = VariantKind::Mapping;

    fn from_variant(value: &Value) -> Result<Self, ProtocolError> {
        match value {
            Value::Dictionary(d) => Ok(d.clone()),
            other => Err(mismatch(Self::KIND, other)),
        }
    }
}

impl FromVariant for Vec<Value> {
    const KIND: VariantKind = VariantKind::Array;

    fn from_variant(value: &Value) -> Result<Self, ProtocolError> {
        match value {
            Value::Array(a) => Ok(a.clone()),
            other => Err(mismatch(Self::KIND, other)),
        }
    }
}

/// Decodes an optional field of a response mapping
///
/// An absent key is `Ok(None)`; a present key of the wrong kind is an error.
pub fn field<T: FromVariant>(
    dict: &plist::Dictionary,
    key: &str,
) -> Result<Option<T>, ProtocolError> {
    dict.get(key).map(T::from_variant).transpose()
}

/// Decodes a field that the protocol requires to be present
pub fn required_field<T: FromVariant>(
    dict: &plist::Dictionary,
    key: &'static str,
) -> Result<T, ProtocolError> {
    field(dict, key)?.ok_or(ProtocolError::MissingField(key))
}
