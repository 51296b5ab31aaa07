//! Content fingerprints for oracle submissions.
//!
//! A fingerprint is the SHA-256 hex digest of the canonical JSON form of a
//! value: object keys sorted by UTF-16 code units, integer-valued floats
//! written as integers, NaN/Infinity rejected. Two payloads with the same
//! content always hash the same regardless of field order.

use crate::domain::error::{QalError, Result};
use serde::Serialize;
use serde_json::{Map, Number, Value};
use sha2::{Digest, Sha256};

fn canonicalize(value: &Value) -> Result<Value> {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_by(|a, b| a.encode_utf16().cmp(b.encode_utf16()));

            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key.as_str()])?);
            }
            Ok(Value::Object(sorted))
        }
        Value::Array(items) => Ok(Value::Array(
            items.iter().map(canonicalize).collect::<Result<Vec<_>>>()?,
        )),
        Value::Number(n) => canonical_number(n).map(Value::Number),
        other => Ok(other.clone()),
    }
}

fn canonical_number(n: &Number) -> Result<Number> {
    if n.is_i64() || n.is_u64() {
        return Ok(n.clone());
    }
    let Some(f) = n.as_f64() else {
        return Ok(n.clone());
    };
    if !f.is_finite() {
        return Err(QalError::Digest(
            "NaN/Infinity not permitted in fingerprinted payloads".to_string(),
        ));
    }
    if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
        Ok(Number::from(f as i64))
    } else {
        Ok(n.clone())
    }
}

/// Render a JSON value in canonical compact form.
pub fn canonical_json(value: &Value) -> Result<String> {
    let canonical = canonicalize(value)?;
    serde_json::to_string(&canonical).map_err(|e| QalError::Digest(e.to_string()))
}

/// SHA-256 hex digest of the canonical form of `value`.
pub fn fingerprint_value(value: &Value) -> Result<String> {
    let canonical = canonical_json(value)?;
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

/// Fingerprint any serializable value.
pub fn fingerprint<T: Serialize>(value: &T) -> Result<String> {
    let json = serde_json::to_value(value).map_err(|e| QalError::Digest(e.to_string()))?;
    fingerprint_value(&json)
}
