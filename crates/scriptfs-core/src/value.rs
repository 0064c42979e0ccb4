// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Language-neutral values exchanged with script handlers
//!
//! Every argument tuple handed to a handler and every value a handler
//! resolves with is a [`Value`]. 64-bit quantities travel as
//! [`Value::BigInt`] so that the full `[0, 2^64)` range survives the trip.

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::error::CodecError;

/// Largest integer an IEEE-754 double represents exactly.
pub const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

#[derive(Clone, Debug, Default, PartialEq)]
pub enum Value {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    BigInt(i128),
    String(String),
    Buffer(Bytes),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
}

impl Value {
    /// Empty object record.
    pub fn object() -> Value {
        Value::Object(BTreeMap::new())
    }

    /// Builder-style insert; a no-op on non-objects.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Value {
        if let Value::Object(map) = &mut self {
            map.insert(key.to_string(), value.into());
        }
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<Value>) {
        if let Value::Object(map) = self {
            map.insert(key.to_string(), value.into());
        }
    }

    /// Field lookup. Fields holding `undefined` read as absent.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Object(map) => map.get(key).filter(|v| !matches!(v, Value::Undefined)),
            _ => None,
        }
    }

    pub fn is_nullish(&self) -> bool {
        matches!(self, Value::Undefined | Value::Null)
    }

    pub fn is_object(&self) -> bool {
        matches!(self, Value::Object(_))
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::BigInt(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Buffer(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::BigInt(_) => "bigint",
            Value::String(_) => "string",
            Value::Buffer(_) => "buffer",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }

    /// Lossless conversion to an unsigned 64-bit integer.
    ///
    /// Numbers must be finite, integral, non-negative and no larger than
    /// [`MAX_SAFE_INTEGER`]; big integers must fit in `u64`.
    pub fn to_u64_lossless(&self, field: &str) -> Result<u64, CodecError> {
        match self {
            Value::Number(n) => {
                if n.is_finite() && n.fract() == 0.0 && *n >= 0.0 && *n <= MAX_SAFE_INTEGER {
                    Ok(*n as u64)
                } else {
                    Err(CodecError::Lossy(field.to_string()))
                }
            }
            Value::BigInt(n) => u64::try_from(*n).map_err(|_| CodecError::Lossy(field.to_string())),
            _ => Err(CodecError::WrongType {
                field: field.to_string(),
                expected: "integer",
            }),
        }
    }

    /// Lossless conversion to a signed 64-bit integer.
    pub fn to_i64_lossless(&self, field: &str) -> Result<i64, CodecError> {
        match self {
            Value::Number(n) => {
                if n.is_finite() && n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER {
                    Ok(*n as i64)
                } else {
                    Err(CodecError::Lossy(field.to_string()))
                }
            }
            Value::BigInt(n) => i64::try_from(*n).map_err(|_| CodecError::Lossy(field.to_string())),
            _ => Err(CodecError::WrongType {
                field: field.to_string(),
                expected: "integer",
            }),
        }
    }

    pub fn to_u32(&self, field: &str) -> Result<u32, CodecError> {
        let wide = self.to_u64_lossless(field)?;
        u32::try_from(wide).map_err(|_| CodecError::Lossy(field.to_string()))
    }

    /// Reads an optional unsigned field, treating absence as zero.
    pub fn field_u64(&self, key: &str) -> Result<u64, CodecError> {
        match self.get(key) {
            None | Some(Value::Null) => Ok(0),
            Some(v) => v.to_u64_lossless(key),
        }
    }

    pub fn field_u32(&self, key: &str) -> Result<u32, CodecError> {
        match self.get(key) {
            None | Some(Value::Null) => Ok(0),
            Some(v) => v.to_u32(key),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Number(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Number(f64::from(v))
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Number(f64::from(v))
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::BigInt(i128::from(v))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::BigInt(i128::from(v))
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Bytes> for Value {
    fn from(v: Bytes) -> Self {
        Value::Buffer(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Buffer(Bytes::from(v))
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::Array(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Converts a JSON document into a value; used for configuration records
/// coming from the script side.
impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_u64() {
                Some(u) if u as f64 > MAX_SAFE_INTEGER => Value::BigInt(i128::from(u)),
                _ => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => {
                Value::Object(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}
