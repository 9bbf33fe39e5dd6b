//! Canonical byte encoding for hashed records.
//!
//! Every digest in the system is taken over the output of this module, so the
//! format is fixed and documented in every export:
//!
//! - JSON objects with keys sorted by UTF-8 byte order
//! - `,` and `:` separators, no whitespace
//! - strings escaped exactly as `serde_json` escapes them (UTF-8 passthrough)
//! - integers in plain decimal
//! - floats in shortest round-trip decimal, never in exponent form, always
//!   carrying a fractional part (`1.0`, `0.85`); `-0.0` is written as `0.0`
//! - `null` for absent optional fields
//!
//! Non-finite floats cannot be represented and are rejected with
//! [`VerdictError::EncodingError`] when they enter a [`CanonicalRecord`].

use crate::core::error::VerdictError;
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;

/// Identifier embedded in exports so independent verifiers know which rules to apply.
pub const CANONICAL_FORMAT: &str = "verdict-canonical-json/1";

/// A flat-or-nested record built field by field before hashing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CanonicalRecord {
    fields: BTreeMap<String, Value>,
}

impl CanonicalRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(mut self, key: &str, value: &str) -> Self {
        self.fields
            .insert(key.to_string(), Value::String(value.to_string()));
        self
    }

    pub fn optional_text(mut self, key: &str, value: Option<&str>) -> Self {
        let v = value.map_or(Value::Null, |s| Value::String(s.to_string()));
        self.fields.insert(key.to_string(), v);
        self
    }

    pub fn integer(mut self, key: &str, value: i64) -> Self {
        self.fields
            .insert(key.to_string(), Value::Number(Number::from(value)));
        self
    }

    pub fn float(mut self, key: &str, value: f64) -> Result<Self, VerdictError> {
        self.fields.insert(key.to_string(), finite(key, value)?);
        Ok(self)
    }

    pub fn optional_float(mut self, key: &str, value: Option<f64>) -> Result<Self, VerdictError> {
        let v = match value {
            Some(f) => finite(key, f)?,
            None => Value::Null,
        };
        self.fields.insert(key.to_string(), v);
        Ok(self)
    }

    pub fn text_list(mut self, key: &str, values: &[String]) -> Self {
        let list = values.iter().cloned().map(Value::String).collect();
        self.fields.insert(key.to_string(), Value::Array(list));
        self
    }

    pub fn value(mut self, key: &str, value: Value) -> Self {
        self.fields.insert(key.to_string(), value);
        self
    }

    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        for (k, v) in &self.fields {
            map.insert(k.clone(), v.clone());
        }
        Value::Object(map)
    }

    pub fn encode(&self) -> Result<Vec<u8>, VerdictError> {
        encode_value(&self.to_value())
    }
}

/// Convert a float into a JSON number, refusing NaN and infinities.
pub fn finite(key: &str, value: f64) -> Result<Value, VerdictError> {
    if !value.is_finite() {
        return Err(VerdictError::EncodingError(format!(
            "field '{}' holds non-finite float {}",
            key, value
        )));
    }
    let normalized = if value == 0.0 { 0.0 } else { value };
    Number::from_f64(normalized)
        .map(Value::Number)
        .ok_or_else(|| VerdictError::EncodingError(format!("field '{}' is not encodable", key)))
}

/// Encode an arbitrary JSON value canonically.
pub fn encode_value(value: &Value) -> Result<Vec<u8>, VerdictError> {
    let mut out = Vec::with_capacity(256);
    write_value(&mut out, value)?;
    Ok(out)
}

fn write_value(out: &mut Vec<u8>, value: &Value) -> Result<(), VerdictError> {
    match value {
        Value::Null => out.extend_from_slice(b"null"),
        Value::Bool(true) => out.extend_from_slice(b"true"),
        Value::Bool(false) => out.extend_from_slice(b"false"),
        Value::Number(n) => write_number(out, n)?,
        Value::String(s) => write_string(out, s)?,
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_value(out, item)?;
            }
            out.push(b']');
        }
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));
            out.push(b'{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_string(out, key)?;
                out.push(b':');
                write_value(out, item)?;
            }
            out.push(b'}');
        }
    }
    Ok(())
}

fn write_string(out: &mut Vec<u8>, s: &str) -> Result<(), VerdictError> {
    serde_json::to_writer(&mut *out, s).map_err(|e| VerdictError::EncodingError(e.to_string()))
}

fn write_number(out: &mut Vec<u8>, n: &Number) -> Result<(), VerdictError> {
    if let Some(i) = n.as_i64() {
        out.extend_from_slice(i.to_string().as_bytes());
    } else if let Some(u) = n.as_u64() {
        out.extend_from_slice(u.to_string().as_bytes());
    } else {
        let f = n
            .as_f64()
            .ok_or_else(|| VerdictError::EncodingError(format!("unrepresentable number {}", n)))?;
        out.extend_from_slice(format_float(f)?.as_bytes());
    }
    Ok(())
}

/// Shortest round-trip decimal with a mandatory fractional part.
pub fn format_float(value: f64) -> Result<String, VerdictError> {
    if !value.is_finite() {
        return Err(VerdictError::EncodingError(format!(
            "non-finite float {}",
            value
        )));
    }
    let value = if value == 0.0 { 0.0 } else { value };
    let mut s = format!("{}", value);
    if !s.contains('.') {
        s.push_str(".0");
    }
    Ok(s)
}
