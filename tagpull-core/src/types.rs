use std::fmt;

use crate::error::{Error, Result};

/// A decoded scalar held by a data point and pushed to the sink.
///
/// Equality is by numeric value across representations: a transform that
/// turns an integer counter into a float must not defeat deduplication, so
/// `Int(1)`, `UInt(1)`, `Float(1.0)` and `Bool(true)` all compare equal.
#[derive(Debug, Clone)]
pub enum Value {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Str(String),
}

impl Value {
    /// Truthiness in the usual scripting sense; used by the bit/int
    /// coercion transforms.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::UInt(u) => *u != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
        }
    }

    /// Unsigned counter reading, for the rate-of-change transform.
    pub fn as_counter(&self) -> Result<u64> {
        match self {
            Value::UInt(u) => Ok(*u),
            Value::Int(i) if *i >= 0 => Ok(*i as u64),
            other => Err(Error::process(format!(
                "counter value expected, got {other}"
            ))),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Bool(b) => serde_json::Value::from(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::UInt(u) => serde_json::Value::from(*u),
            Value::Float(f) => serde_json::Value::from(*f),
            Value::Str(s) => serde_json::Value::from(s.as_str()),
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Int(i) => Some(*i as f64),
            Value::UInt(u) => Some(*u as f64),
            Value::Float(f) => Some(*f),
            Value::Str(_) => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Str(_), _) | (_, Value::Str(_)) => false,
            // Exact comparison where both sides are integers, to stay
            // correct beyond the f64 mantissa.
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::UInt(a), Value::UInt(b)) => a == b,
            (Value::Int(a), Value::UInt(b)) | (Value::UInt(b), Value::Int(a)) => {
                *a >= 0 && *a as u64 == *b
            }
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x == y,
                _ => false,
            },
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", if *b { 1 } else { 0 }),
            Value::Int(i) => write!(f, "{i}"),
            Value::UInt(u) => write!(f, "{u}"),
            // Integral floats keep their decimal point so a float-typed
            // data point is distinguishable from an integer one.
            Value::Float(v) if v.is_finite() && v.fract() == 0.0 && v.abs() < 1e15 => {
                write!(f, "{v:.1}")
            }
            Value::Float(v) => write!(f, "{v}"),
            Value::Str(s) => write!(f, "{s}"),
        }
    }
}

/// Width and signedness of a decoded quantity. Drives two's-complement
/// recovery in the decoders and the wrap-around modulus of the speed
/// transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Bit,
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Real32,
    Real64,
}

impl DataType {
    /// Wrap-around modulus for unsigned counters (`2^N - 1`), `None` for
    /// every type a rate-of-change cannot be computed over.
    pub fn counter_max(self) -> Option<u64> {
        match self {
            DataType::UInt8 => Some(u8::MAX as u64),
            DataType::UInt16 => Some(u16::MAX as u64),
            DataType::UInt32 => Some(u32::MAX as u64),
            DataType::UInt64 => Some(u64::MAX),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DataType::Bit => "bit",
            DataType::Int8 => "int8",
            DataType::UInt8 => "uint8",
            DataType::Int16 => "int16",
            DataType::UInt16 => "uint16",
            DataType::Int32 => "int32",
            DataType::UInt32 => "uint32",
            DataType::Int64 => "int64",
            DataType::UInt64 => "uint64",
            DataType::Real32 => "real32",
            DataType::Real64 => "real64",
        }
    }
}

/// Parse an integer literal the way pull configurations write them:
/// decimal, or hex when the text contains an `x` (`0x1A`, `x1A`).
pub fn parse_int_literal(s: &str) -> Result<i64> {
    let s = s.trim();
    let parsed = if let Some(pos) = s.find(['x', 'X']) {
        i64::from_str_radix(&s[pos + 1..], 16)
    } else {
        s.parse::<i64>()
    };
    parsed.map_err(|_| Error::config(format!("invalid integer literal: {s:?}")))
}
