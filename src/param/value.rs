//! Typed parameter values and their canonical byte encoding.
//!
//! The canonical encoding is what the lookup cache hashes. It is
//! type-tagged and length-prefixed, so:
//! - `Int(5)` and `Float(5.0)` never encode the same way
//! - `Text("ab")` followed by `Text("c")` never collides with `"a"` + `"bc"`
//! - `-0.0` and `0.0` encode identically, as do all NaN payloads
//!
//! Equality on [`ParamValue`] follows the canonical encoding rather than
//! IEEE float comparison, which makes it a proper `Eq`.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A parameter value. Exactly the types that can be stored and hashed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
    Timestamp(DateTime<Utc>),
    /// Opaque bytes, compared and hashed byte-for-byte.
    Blob(Vec<u8>),
}

/// The kind of a [`ParamValue`], without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueKind {
    Int,
    Float,
    Bool,
    Text,
    Timestamp,
    Blob,
}

impl ValueKind {
    /// Numeric kinds can carry bounds and be optimized.
    pub fn is_numeric(self) -> bool {
        matches!(self, ValueKind::Int | ValueKind::Float)
    }

    fn tag(self) -> u8 {
        match self {
            ValueKind::Int => 0x01,
            ValueKind::Float => 0x02,
            ValueKind::Bool => 0x03,
            ValueKind::Text => 0x04,
            ValueKind::Timestamp => 0x05,
            ValueKind::Blob => 0x06,
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Int => "int",
            ValueKind::Float => "float",
            ValueKind::Bool => "bool",
            ValueKind::Text => "text",
            ValueKind::Timestamp => "timestamp",
            ValueKind::Blob => "blob",
        };
        f.write_str(name)
    }
}

/// Collapse float representations that compare equal (or are all NaN)
/// onto a single bit pattern.
fn canonical_float_bits(value: f64) -> u64 {
    if value.is_nan() {
        f64::NAN.to_bits()
    } else if value == 0.0 {
        0.0f64.to_bits()
    } else {
        value.to_bits()
    }
}

impl ParamValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            ParamValue::Int(_) => ValueKind::Int,
            ParamValue::Float(_) => ValueKind::Float,
            ParamValue::Bool(_) => ValueKind::Bool,
            ParamValue::Text(_) => ValueKind::Text,
            ParamValue::Timestamp(_) => ValueKind::Timestamp,
            ParamValue::Blob(_) => ValueKind::Blob,
        }
    }

    /// Numeric view, for bounds checks and the optimizer.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Int(v) => Some(*v as f64),
            ParamValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Build a value of `kind` from a float, rounding integers.
    ///
    /// Returns `None` for non-numeric kinds.
    pub fn from_f64(kind: ValueKind, value: f64) -> Option<Self> {
        match kind {
            ValueKind::Int => Some(ParamValue::Int(value.round() as i64)),
            ValueKind::Float => Some(ParamValue::Float(value)),
            _ => None,
        }
    }

    /// Append the canonical encoding of this value to `out`.
    pub fn write_canonical(&self, out: &mut Vec<u8>) {
        out.push(self.kind().tag());
        match self {
            ParamValue::Int(v) => out.extend_from_slice(&v.to_le_bytes()),
            ParamValue::Float(v) => out.extend_from_slice(&canonical_float_bits(*v).to_le_bytes()),
            ParamValue::Bool(v) => out.push(u8::from(*v)),
            ParamValue::Text(s) => write_bytes(out, s.as_bytes()),
            ParamValue::Timestamp(t) => {
                out.extend_from_slice(&t.timestamp().to_le_bytes());
                out.extend_from_slice(&t.timestamp_subsec_nanos().to_le_bytes());
            }
            ParamValue::Blob(bytes) => write_bytes(out, bytes),
        }
    }

    /// Canonical encoding as an owned buffer.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16);
        self.write_canonical(&mut out);
        out
    }
}

/// Length-prefixed byte string.
pub(crate) fn write_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
    out.extend_from_slice(bytes);
}

impl PartialEq for ParamValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ParamValue::Int(a), ParamValue::Int(b)) => a == b,
            (ParamValue::Float(a), ParamValue::Float(b)) => {
                canonical_float_bits(*a) == canonical_float_bits(*b)
            }
            (ParamValue::Bool(a), ParamValue::Bool(b)) => a == b,
            (ParamValue::Text(a), ParamValue::Text(b)) => a == b,
            (ParamValue::Timestamp(a), ParamValue::Timestamp(b)) => a == b,
            (ParamValue::Blob(a), ParamValue::Blob(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for ParamValue {}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Int(v) => write!(f, "{v}"),
            ParamValue::Float(v) => write!(f, "{v}"),
            ParamValue::Bool(v) => write!(f, "{v}"),
            ParamValue::Text(s) => write!(f, "{s:?}"),
            ParamValue::Timestamp(t) => write!(f, "{}", t.to_rfc3339()),
            ParamValue::Blob(bytes) => write!(f, "<blob {} bytes>", bytes.len()),
        }
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<i32> for ParamValue {
    fn from(v: i32) -> Self {
        ParamValue::Int(v.into())
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Text(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Text(v)
    }
}

impl From<DateTime<Utc>> for ParamValue {
    fn from(v: DateTime<Utc>) -> Self {
        ParamValue::Timestamp(v)
    }
}

impl From<Vec<u8>> for ParamValue {
    fn from(v: Vec<u8>) -> Self {
        ParamValue::Blob(v)
    }
}
