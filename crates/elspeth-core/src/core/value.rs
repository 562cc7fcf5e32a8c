// elspeth-core/src/core/value.rs
// ============================================================================
// Module: ELSPETH Row Value Model
// Description: Typed values carried by pipeline rows.
// Purpose: Provide an explicit, canonicalizable value model for row data.
// Dependencies: bigdecimal, time
// ============================================================================

//! ## Overview
//! Pipeline rows carry [`Value`]s rather than raw JSON so that the engine can
//! enforce typed contracts and reject non-canonicalizable data (NaN and
//! infinity) before anything is hashed or persisted. Decimals and wide
//! integers are exact ([`bigdecimal::BigDecimal`] has no non-finite values by
//! construction) and datetimes are explicit [`time`] values. Integers beyond
//! 64-bit range live in the `BigInt` variant and canonicalize to their exact
//! string form rather than losing precision.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;

use bigdecimal::BigDecimal;
use time::Date;
use time::OffsetDateTime;

// ============================================================================
// SECTION: Value
// ============================================================================

/// Row data keyed by normalized field name.
pub type RowData = BTreeMap<String, Value>;

/// A single typed value inside a pipeline row.
///
/// # Invariants
/// - `Float` may hold NaN or infinity transiently; canonicalization rejects
///   such values rather than coercing them.
/// - `Decimal` is always finite (the representation has no NaN/infinity).
/// - `DateTime` values without explicit zone information are treated as UTC
///   at construction time by sources.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Explicit null (also the normalized form of missing-value sentinels).
    Null,
    /// Boolean.
    Bool(bool),
    /// 64-bit signed integer.
    Int(i64),
    /// Integer beyond 64-bit range, canonicalized as its exact string form.
    BigInt(BigDecimal),
    /// IEEE 754 double. Must be finite to canonicalize.
    Float(f64),
    /// Exact decimal, serialized to its exact string form.
    Decimal(BigDecimal),
    /// UTF-8 text.
    Text(String),
    /// Raw bytes, canonicalized as a base64 wrapper object.
    Bytes(Vec<u8>),
    /// Calendar date, canonicalized as `YYYY-MM-DD`.
    Date(Date),
    /// Instant in time, canonicalized as RFC 3339 in UTC.
    DateTime(OffsetDateTime),
    /// Ordered list of values.
    Array(Vec<Value>),
    /// String-keyed mapping with code-point key ordering.
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Returns a stable name for the value's kind, used in diagnostics.
    #[must_use]
    pub const fn kind_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::BigInt(_) => "bigint",
            Self::Float(_) => "float",
            Self::Decimal(_) => "decimal",
            Self::Text(_) => "text",
            Self::Bytes(_) => "bytes",
            Self::Date(_) => "date",
            Self::DateTime(_) => "datetime",
            Self::Array(_) => "array",
            Self::Map(_) => "map",
        }
    }

    /// Returns true when the value is [`Value::Null`].
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Converts an untyped JSON value into the row value model.
    ///
    /// JSON numbers become `Int` when they fit 64 bits, `BigInt` when they
    /// are wider integers, and `Float` otherwise. This is the inverse of
    /// normalization for round-tripping payloads out of the payload store;
    /// dates and bytes read back as the plain JSON shapes they were
    /// canonicalized to.
    #[must_use]
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(flag) => Self::Bool(*flag),
            serde_json::Value::Number(number) => number
                .as_i64()
                .map(Self::Int)
                .or_else(|| number.as_u64().map(|wide| Self::BigInt(BigDecimal::from(wide))))
                .unwrap_or_else(|| Self::Float(number.as_f64().unwrap_or(0.0))),
            serde_json::Value::String(text) => Self::Text(text.clone()),
            serde_json::Value::Array(items) => {
                Self::Array(items.iter().map(Self::from_json).collect())
            }
            serde_json::Value::Object(entries) => Self::Map(
                entries.iter().map(|(key, item)| (key.clone(), Self::from_json(item))).collect(),
            ),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}
