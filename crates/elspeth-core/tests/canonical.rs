// elspeth-core/tests/canonical.rs
// ============================================================================
// Module: Canonical Serialization Tests
// Description: Tests for canonical JSON and stable hashing.
// ============================================================================
//! ## Overview
//! Validates RFC 8785 output, non-finite rejection, temporal formatting, and
//! the cross-process golden hash vector.

#![allow(
    clippy::panic,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    clippy::dbg_macro,
    clippy::panic_in_result_fn,
    clippy::unwrap_in_result,
    reason = "Test-only output and panic-based assertions are permitted."
)]

use std::str::FromStr;

use bigdecimal::BigDecimal;
use elspeth_core::CANONICAL_VERSION;
use elspeth_core::CanonicalError;
use elspeth_core::Value;
use elspeth_core::canonical_json;
use elspeth_core::normalize_value;
use elspeth_core::stable_hash;
use elspeth_core::stable_hash_raw;
use serde_json::json;
use time::macros::datetime;

/// Builds a map value from pairs.
fn map(pairs: Vec<(&str, Value)>) -> Value {
    Value::Map(pairs.into_iter().map(|(key, value)| (key.to_string(), value)).collect())
}

// ============================================================================
// SECTION: Golden Vector
// ============================================================================

/// Tests the golden hash vector that pins canonicalization across releases.
#[test]
fn test_golden_hash_stability() {
    let data = map(vec![
        ("string", Value::from("hello")),
        ("int", Value::Int(42)),
        ("float", Value::Float(3.14)),
        ("bool", Value::Bool(true)),
        ("null", Value::Null),
        ("list", Value::Array(vec![Value::Int(1), Value::Int(2), Value::Int(3)])),
        ("nested", map(vec![("a", Value::Int(1))])),
    ]);

    let canonical = canonical_json(&data).unwrap();
    assert_eq!(
        canonical,
        r#"{"bool":true,"float":3.14,"int":42,"list":[1,2,3],"nested":{"a":1},"null":null,"string":"hello"}"#
    );

    let golden = "aed53055632a45e17618f46527c07dba463b2ae719e2f6832b2735308a3bf2e1";
    assert_eq!(stable_hash(&data).unwrap(), golden);
}

/// Tests that the canonical version constant is pinned.
#[test]
fn test_version_constant() {
    assert_eq!(CANONICAL_VERSION, "sha256-rfc8785-v1");
}

// ============================================================================
// SECTION: Key Ordering
// ============================================================================

/// Tests that key order does not affect the hash.
#[test]
fn test_stable_hash_key_order_independent() {
    let hash_a = stable_hash_raw(&json!({"b": 1, "a": 2})).unwrap();
    let hash_b = stable_hash_raw(&json!({"a": 2, "b": 1})).unwrap();
    assert_eq!(hash_a, hash_b);
}

/// Tests that canonical output carries no whitespace and sorted keys.
#[test]
fn test_canonical_json_minimized_and_sorted() {
    let data = map(vec![
        ("z", Value::Int(1)),
        ("a", Value::Int(2)),
        ("m", Value::Int(3)),
    ]);
    assert_eq!(canonical_json(&data).unwrap(), r#"{"a":2,"m":3,"z":1}"#);
}

// ============================================================================
// SECTION: Non-Finite Rejection
// ============================================================================

/// Tests that NaN is rejected rather than coerced.
#[test]
fn test_nan_rejected() {
    let err = normalize_value(&Value::Float(f64::NAN)).unwrap_err();
    assert!(matches!(err, CanonicalError::NonFinite { .. }));
}

/// Tests that infinity nested inside arrays and maps is rejected.
#[test]
fn test_nested_infinity_rejected() {
    let data = map(vec![(
        "values",
        Value::Array(vec![Value::Float(1.0), Value::Float(f64::INFINITY), Value::Float(3.0)]),
    )]);
    let err = canonical_json(&data).unwrap_err();
    let CanonicalError::NonFinite { path } = err else {
        panic!("expected NonFinite, got {err:?}");
    };
    assert!(path.contains("values"));
}

// ============================================================================
// SECTION: Type Normalization
// ============================================================================

/// Tests that decimals serialize to their exact string form.
#[test]
fn test_decimal_exact_string() {
    let decimal = BigDecimal::from_str("123.456789012345678901234567890").unwrap();
    let normalized = normalize_value(&Value::Decimal(decimal)).unwrap();
    assert_eq!(normalized, json!("123.456789012345678901234567890"));
}

/// Tests that integers beyond 64-bit range serialize to their exact string
/// form instead of losing precision.
#[test]
fn test_wide_integer_exact_string() {
    let wide = BigDecimal::from_str("99999999999999999999").unwrap();
    let normalized = normalize_value(&Value::BigInt(wide)).unwrap();
    assert_eq!(normalized, json!("99999999999999999999"));

    // 64-bit integers stay JSON numbers.
    let narrow = normalize_value(&Value::Int(i64::MAX)).unwrap();
    assert_eq!(narrow, json!(i64::MAX));
}

/// Tests that datetimes normalize to RFC 3339 UTC with an explicit offset.
#[test]
fn test_datetime_utc_offset_form() {
    let instant = datetime!(2026-01-12 10:30:00 UTC);
    let normalized = normalize_value(&Value::DateTime(instant)).unwrap();
    assert_eq!(normalized, json!("2026-01-12T10:30:00+00:00"));
}

/// Tests that zoned datetimes are coerced to UTC.
#[test]
fn test_datetime_zone_coerced_to_utc() {
    let instant = datetime!(2026-01-12 10:30:00 -5);
    let normalized = normalize_value(&Value::DateTime(instant)).unwrap();
    assert_eq!(normalized, json!("2026-01-12T15:30:00+00:00"));
}

/// Tests that dates normalize to `YYYY-MM-DD`.
#[test]
fn test_date_form() {
    let date = time::macros::date!(2026 - 01 - 12);
    let normalized = normalize_value(&Value::Date(date)).unwrap();
    assert_eq!(normalized, json!("2026-01-12"));
}

/// Tests that bytes normalize to the base64 wrapper object.
#[test]
fn test_bytes_wrapper() {
    let normalized = normalize_value(&Value::Bytes(b"hello world".to_vec())).unwrap();
    assert_eq!(normalized, json!({"__bytes__": "aGVsbG8gd29ybGQ="}));
}

/// Tests that the hash is reproducible across calls.
#[test]
fn test_stable_hash_deterministic() {
    let data = map(vec![
        ("a", Value::Int(1)),
        ("b", Value::Array(vec![Value::Int(2), Value::Int(3)])),
    ]);
    assert_eq!(stable_hash(&data).unwrap(), stable_hash(&data).unwrap());
    assert_eq!(stable_hash(&data).unwrap().len(), 64);
}
