// elspeth-core/tests/contract.rs
// ============================================================================
// Module: Schema Contract Tests
// Description: Tests for contract inference, locking, and validation.
// ============================================================================
//! ## Overview
//! Validates first-row locking, post-lock validation, merge behavior, and
//! integrity verification of the embedded version hash.

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

use std::collections::BTreeMap;
use std::str::FromStr;

use elspeth_core::ContractAuditRecord;
use elspeth_core::ContractBuilder;
use elspeth_core::ContractError;
use elspeth_core::ContractViolation;
use elspeth_core::FieldContract;
use elspeth_core::FieldSource;
use elspeth_core::FieldType;
use elspeth_core::RowData;
use elspeth_core::SchemaContract;
use elspeth_core::SchemaMode;
use elspeth_core::Value;

/// Builds row data from pairs.
fn row(pairs: Vec<(&str, Value)>) -> RowData {
    pairs.into_iter().map(|(key, value)| (key.to_string(), value)).collect()
}

/// Identity resolution map over the given names.
fn identity_resolution(names: &[&str]) -> BTreeMap<String, String> {
    names.iter().map(|name| ((*name).to_string(), (*name).to_string())).collect()
}

// ============================================================================
// SECTION: First-Row Locking
// ============================================================================

/// Tests that an observed contract infers every field from the first row.
#[test]
fn test_observed_contract_locks_from_first_row() {
    let contract = SchemaContract::new(SchemaMode::Observed, Vec::new(), false).unwrap();
    let first = row(vec![
        ("id", Value::Int(1)),
        ("name", Value::from("Alice")),
        ("score", Value::Float(0.5)),
    ]);
    let resolution = identity_resolution(&["id", "name", "score"]);

    let locked = ContractBuilder::lock_from_first_row(&contract, &first, &resolution).unwrap();

    assert!(locked.locked);
    assert_eq!(locked.fields.len(), 3);
    let id_field = locked.field("id").unwrap();
    assert_eq!(id_field.field_type, FieldType::Int);
    assert_eq!(id_field.source, FieldSource::Inferred);
    assert!(!id_field.required);
}

/// Tests that re-inference of the same first row reproduces the version hash.
#[test]
fn test_reinference_reproduces_version_hash() {
    let contract = SchemaContract::new(SchemaMode::Observed, Vec::new(), false).unwrap();
    let first = row(vec![("id", Value::Int(1)), ("name", Value::from("Alice"))]);
    let resolution = identity_resolution(&["id", "name"]);

    let locked_a = ContractBuilder::lock_from_first_row(&contract, &first, &resolution).unwrap();
    let locked_b = ContractBuilder::lock_from_first_row(&contract, &first, &resolution).unwrap();

    assert_eq!(locked_a.version_hash, locked_b.version_hash);
}

/// Tests that a locked contract passes through the builder unchanged.
#[test]
fn test_locked_contract_unchanged() {
    let fields = vec![FieldContract::declared("id", FieldType::Int)];
    let contract = SchemaContract::new(SchemaMode::Fixed, fields, true).unwrap();
    let extra = row(vec![("surprise", Value::Int(9))]);

    let out =
        ContractBuilder::lock_from_first_row(&contract, &extra, &identity_resolution(&["surprise"]))
            .unwrap();

    assert_eq!(out, contract);
}

/// Tests that a row field missing from the resolution map is a source bug.
#[test]
fn test_unresolvable_field_raises() {
    let contract = SchemaContract::new(SchemaMode::Observed, Vec::new(), false).unwrap();
    let first = row(vec![("mystery", Value::Int(1))]);

    let err = ContractBuilder::lock_from_first_row(&contract, &first, &BTreeMap::new());
    assert!(err.is_err());
}

/// Tests that flexible contracts keep declared types and infer extras.
#[test]
fn test_flexible_contract_keeps_declared_and_infers_extras() {
    let declared = vec![FieldContract::declared("id", FieldType::Int)];
    let contract = SchemaContract::new(SchemaMode::Flexible, declared, false).unwrap();
    let first = row(vec![("id", Value::Int(1)), ("comment", Value::from("hi"))]);
    let resolution = identity_resolution(&["id", "comment"]);

    let locked = ContractBuilder::lock_from_first_row(&contract, &first, &resolution).unwrap();

    assert_eq!(locked.field("id").unwrap().source, FieldSource::Declared);
    assert!(locked.field("id").unwrap().required);
    assert_eq!(locked.field("comment").unwrap().source, FieldSource::Inferred);
    assert_eq!(locked.field("comment").unwrap().field_type, FieldType::Text);
}

// ============================================================================
// SECTION: Post-Lock Validation
// ============================================================================

/// Tests missing-field and type-mismatch violations.
#[test]
fn test_validate_row_violations() {
    let fields = vec![
        FieldContract::declared("id", FieldType::Int),
        FieldContract::declared("name", FieldType::Text),
    ];
    let contract = SchemaContract::new(SchemaMode::Fixed, fields, true).unwrap();

    let bad = row(vec![("id", Value::from("two"))]);
    let violations = contract.validate_row(&bad);

    assert!(violations.contains(&ContractViolation::MissingField {
        field: "name".to_string()
    }));
    assert!(violations.iter().any(|violation| matches!(
        violation,
        ContractViolation::TypeMismatch { field, .. } if field == "id"
    )));
}

/// Tests that fixed contracts reject undeclared fields.
#[test]
fn test_fixed_mode_rejects_extras() {
    let fields = vec![FieldContract::declared("id", FieldType::Int)];
    let contract = SchemaContract::new(SchemaMode::Fixed, fields, true).unwrap();

    let extra = row(vec![("id", Value::Int(1)), ("rogue", Value::Int(2))]);
    let violations = contract.validate_row(&extra);

    assert_eq!(
        violations,
        vec![ContractViolation::UnexpectedField {
            field: "rogue".to_string()
        }]
    );
}

/// Tests that null is accepted for non-required fields only.
#[test]
fn test_nullability() {
    let mut optional = FieldContract::declared("note", FieldType::Text);
    optional.required = false;
    let fields = vec![FieldContract::declared("id", FieldType::Int), optional];
    let contract = SchemaContract::new(SchemaMode::Fixed, fields, true).unwrap();

    let ok = row(vec![("id", Value::Int(1)), ("note", Value::Null)]);
    assert!(contract.validate_row(&ok).is_empty());

    let bad = row(vec![("id", Value::Null), ("note", Value::Null)]);
    assert_eq!(contract.validate_row(&bad).len(), 1);
}

/// Tests that int fields accept both 64-bit and wide integers.
#[test]
fn test_int_fields_accept_wide_integers() {
    let fields = vec![FieldContract::declared("id", FieldType::Int)];
    let contract = SchemaContract::new(SchemaMode::Fixed, fields, true).unwrap();

    let wide = Value::BigInt(bigdecimal::BigDecimal::from_str("99999999999999999999").unwrap());
    assert_eq!(FieldType::infer(&wide), FieldType::Int);
    let data = row(vec![("id", wide)]);
    assert!(contract.validate_row(&data).is_empty());
}

/// Tests that the `any` type accepts every value kind.
#[test]
fn test_any_type_accepts_everything() {
    let fields = vec![FieldContract::declared("payload", FieldType::Any)];
    let contract = SchemaContract::new(SchemaMode::Fixed, fields, true).unwrap();

    for value in [Value::Null, Value::Int(1), Value::from("x"), Value::Bool(true)] {
        let data = row(vec![("payload", value)]);
        assert!(contract.validate_row(&data).is_empty());
    }
}

// ============================================================================
// SECTION: Integrity & Round-Trip
// ============================================================================

/// Tests that tampering with the version hash is detected.
#[test]
fn test_tampered_version_hash_detected() {
    let fields = vec![
        FieldContract::declared("id", FieldType::Int),
        FieldContract::declared("value", FieldType::Text),
    ];
    let mut contract = SchemaContract::new(SchemaMode::Fixed, fields, true).unwrap();
    assert!(contract.verify_integrity().is_ok());

    contract.version_hash = "corrupted_hash_value".to_string();
    let err = contract.verify_integrity().unwrap_err();
    assert!(matches!(err, ContractError::IntegrityMismatch { .. }));
}

/// Tests the audit-record round trip preserves fields and hash.
#[test]
fn test_audit_record_round_trip() {
    let fields = vec![FieldContract::declared("id", FieldType::Int)];
    let contract = SchemaContract::new(SchemaMode::Flexible, fields, true).unwrap();

    let encoded = ContractAuditRecord::from_contract(&contract).to_json().unwrap();
    let decoded = ContractAuditRecord::from_json(&encoded).unwrap().to_contract().unwrap();

    assert_eq!(decoded, contract);
    assert!(decoded.verify_integrity().is_ok());
}

/// Tests that unknown stored literals are refused.
#[test]
fn test_unknown_literals_refused() {
    let raw = r#"{"mode":"WILD","locked":true,"fields":[],"version_hash":"x"}"#;
    let record = ContractAuditRecord::from_json(raw).unwrap();
    assert!(matches!(record.to_contract(), Err(ContractError::UnknownLiteral { .. })));
}

/// Tests merge widening on type conflicts.
#[test]
fn test_merge_widens_conflicts() {
    let left = SchemaContract::new(
        SchemaMode::Flexible,
        vec![FieldContract::declared("id", FieldType::Int)],
        true,
    )
    .unwrap();
    let right = SchemaContract::new(
        SchemaMode::Flexible,
        vec![
            FieldContract::declared("id", FieldType::Text),
            FieldContract::declared("extra", FieldType::Bool),
        ],
        true,
    )
    .unwrap();

    let merged = left.merge(&right).unwrap();

    assert_eq!(merged.field("id").unwrap().field_type, FieldType::Any);
    assert!(merged.field("extra").is_some());
    assert!(merged.verify_integrity().is_ok());
}
