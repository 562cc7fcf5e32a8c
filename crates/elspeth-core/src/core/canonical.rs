// elspeth-core/src/core/canonical.rs
// ============================================================================
// Module: ELSPETH Canonical Serialization
// Description: RFC 8785 canonical JSON and SHA-256 stable hashing.
// Purpose: Provide the single serialization basis for every hash in ELSPETH.
// Dependencies: serde_json, serde_jcs, sha2, base64, time
// ============================================================================

//! ## Overview
//! Every hash, fingerprint, and content address in ELSPETH goes through this
//! module: values are normalized (non-finite numbers rejected, datetimes
//! coerced to UTC RFC 3339, bytes wrapped as base64, decimals and wide
//! integers emitted in exact string form), serialized as RFC 8785 canonical
//! JSON, and hashed with SHA-256. The algorithm is versioned via
//! [`CANONICAL_VERSION`], which is recorded on every run so a future format
//! change is detectable rather than silent.

// ============================================================================
// SECTION: Imports
// ============================================================================

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::Map as JsonMap;
use serde_json::Number as JsonNumber;
use serde_json::Value as JsonValue;
use sha2::Digest;
use sha2::Sha256;
use thiserror::Error;
use time::UtcOffset;
use time::macros::format_description;

use crate::core::value::RowData;
use crate::core::value::Value;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Canonicalization algorithm version recorded on every run.
pub const CANONICAL_VERSION: &str = "sha256-rfc8785-v1";

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised while canonicalizing a value.
#[derive(Debug, Error)]
pub enum CanonicalError {
    /// A float was NaN or infinite. Non-finite numbers are rejected, never
    /// coerced, because they have no canonical JSON form.
    #[error("non-finite number at '{path}' cannot be canonicalized")]
    NonFinite {
        /// Dotted path of the offending value within the input.
        path: String,
    },
    /// Formatting a date or datetime failed.
    #[error("failed to format temporal value at '{path}': {message}")]
    TemporalFormat {
        /// Dotted path of the offending value within the input.
        path: String,
        /// Formatter error text.
        message: String,
    },
    /// Canonical JSON serialization failed.
    #[error("failed to serialize canonical json: {0}")]
    Serialization(String),
}

// ============================================================================
// SECTION: Normalization
// ============================================================================

/// Normalizes a row value into plain JSON suitable for RFC 8785 output.
///
/// # Errors
///
/// Returns [`CanonicalError::NonFinite`] when a NaN or infinite float is
/// found at any depth, and [`CanonicalError::TemporalFormat`] when a
/// date/datetime cannot be formatted.
pub fn normalize_value(value: &Value) -> Result<JsonValue, CanonicalError> {
    normalize_at(value, "$")
}

/// Normalizes a whole row into a JSON object keyed by field name.
///
/// # Errors
///
/// Returns [`CanonicalError`] under the same conditions as
/// [`normalize_value`].
pub fn normalize_row(row: &RowData) -> Result<JsonValue, CanonicalError> {
    let mut object = JsonMap::with_capacity(row.len());
    for (name, value) in row {
        object.insert(name.clone(), normalize_at(value, name)?);
    }
    Ok(JsonValue::Object(object))
}

/// Recursive normalizer carrying the dotted path for diagnostics.
fn normalize_at(value: &Value, path: &str) -> Result<JsonValue, CanonicalError> {
    match value {
        Value::Null => Ok(JsonValue::Null),
        Value::Bool(flag) => Ok(JsonValue::Bool(*flag)),
        Value::Int(number) => Ok(JsonValue::Number(JsonNumber::from(*number))),
        // Exact string form; integers beyond 64-bit range stay lossless.
        Value::BigInt(number) => Ok(JsonValue::String(number.to_string())),
        Value::Float(number) => JsonNumber::from_f64(*number).map(JsonValue::Number).ok_or_else(
            || CanonicalError::NonFinite {
                path: path.to_string(),
            },
        ),
        // Exact string form; BigDecimal cannot represent NaN or infinity.
        Value::Decimal(decimal) => Ok(JsonValue::String(decimal.to_string())),
        Value::Text(text) => Ok(JsonValue::String(text.clone())),
        Value::Bytes(bytes) => {
            let mut wrapper = JsonMap::with_capacity(1);
            wrapper.insert("__bytes__".to_string(), JsonValue::String(BASE64.encode(bytes)));
            Ok(JsonValue::Object(wrapper))
        }
        Value::Date(date) => {
            let formatted = date
                .format(format_description!("[year]-[month]-[day]"))
                .map_err(|err| CanonicalError::TemporalFormat {
                    path: path.to_string(),
                    message: err.to_string(),
                })?;
            Ok(JsonValue::String(formatted))
        }
        Value::DateTime(instant) => Ok(JsonValue::String(format_rfc3339_utc(instant, path)?)),
        Value::Array(items) => {
            let mut normalized = Vec::with_capacity(items.len());
            for (index, item) in items.iter().enumerate() {
                normalized.push(normalize_at(item, &format!("{path}[{index}]"))?);
            }
            Ok(JsonValue::Array(normalized))
        }
        Value::Map(entries) => {
            let mut object = JsonMap::with_capacity(entries.len());
            for (key, item) in entries {
                object.insert(key.clone(), normalize_at(item, &format!("{path}.{key}"))?);
            }
            Ok(JsonValue::Object(object))
        }
    }
}

/// Formats an instant as RFC 3339 in UTC with an explicit `+00:00` offset.
///
/// Sub-second precision is emitted only when present, as six fractional
/// digits, so values round-trip byte-identically with the audit trail.
fn format_rfc3339_utc(instant: &time::OffsetDateTime, path: &str) -> Result<String, CanonicalError> {
    let utc = instant.to_offset(UtcOffset::UTC);
    let base = utc
        .format(format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]"))
        .map_err(|err| CanonicalError::TemporalFormat {
            path: path.to_string(),
            message: err.to_string(),
        })?;
    let micros = utc.microsecond();
    if micros == 0 {
        Ok(format!("{base}+00:00"))
    } else {
        Ok(format!("{base}.{micros:06}+00:00"))
    }
}

// ============================================================================
// SECTION: Canonical JSON
// ============================================================================

/// Serializes a row value as RFC 8785 canonical JSON.
///
/// # Errors
///
/// Returns [`CanonicalError`] when normalization or serialization fails.
pub fn canonical_json(value: &Value) -> Result<String, CanonicalError> {
    canonical_json_raw(&normalize_value(value)?)
}

/// Serializes a row value as RFC 8785 canonical JSON bytes.
///
/// # Errors
///
/// Returns [`CanonicalError`] when normalization or serialization fails.
pub fn canonical_json_bytes(value: &Value) -> Result<Vec<u8>, CanonicalError> {
    Ok(canonical_json(value)?.into_bytes())
}

/// Serializes pre-normalized JSON as RFC 8785 canonical JSON.
///
/// `serde_json::Value` cannot hold non-finite numbers, so no further
/// finiteness check is required here.
///
/// # Errors
///
/// Returns [`CanonicalError::Serialization`] when serialization fails.
pub fn canonical_json_raw(value: &JsonValue) -> Result<String, CanonicalError> {
    serde_jcs::to_string(value).map_err(|err| CanonicalError::Serialization(err.to_string()))
}

// ============================================================================
// SECTION: Stable Hashing
// ============================================================================

/// Hashes a row value as 64-hex SHA-256 of its canonical JSON.
///
/// # Errors
///
/// Returns [`CanonicalError`] when canonicalization fails.
pub fn stable_hash(value: &Value) -> Result<String, CanonicalError> {
    Ok(sha256_hex(canonical_json(value)?.as_bytes()))
}

/// Hashes a whole row as 64-hex SHA-256 of its canonical JSON object.
///
/// # Errors
///
/// Returns [`CanonicalError`] when canonicalization fails.
pub fn stable_hash_row(row: &RowData) -> Result<String, CanonicalError> {
    Ok(sha256_hex(canonical_json_raw(&normalize_row(row)?)?.as_bytes()))
}

/// Hashes pre-normalized JSON as 64-hex SHA-256 of its canonical form.
///
/// # Errors
///
/// Returns [`CanonicalError::Serialization`] when serialization fails.
pub fn stable_hash_raw(value: &JsonValue) -> Result<String, CanonicalError> {
    Ok(sha256_hex(canonical_json_raw(value)?.as_bytes()))
}

/// Hashes raw bytes as lowercase 64-hex SHA-256.
///
/// Used directly for artifact content hashes, where the bytes themselves are
/// the canonical form.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex_encode(&hasher.finalize())
}

// ============================================================================
// SECTION: Hex Encoding
// ============================================================================

/// Encodes bytes as a lowercase hex string.
fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(HEX[(byte >> 4) as usize] as char);
        out.push(HEX[(byte & 0x0f) as usize] as char);
    }
    out
}
