// elspeth-plugins/tests/sinks.rs
// ============================================================================
// Module: Sink Tests
// Description: Tests for CSV/JSONL/JSON sink behavior and resume checks.
// ============================================================================
//! ## Overview
//! Validates header handling, append-mode validation per schema mode,
//! content hashing over final bytes, formula sanitization, JSON-array
//! append refusal, and the field-mapper's schema evolution.

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

use std::sync::Arc;

use elspeth_core::FieldContract;
use elspeth_core::FieldType;
use elspeth_core::PipelineRow;
use elspeth_core::PluginContext;
use elspeth_core::RowData;
use elspeth_core::RunId;
use elspeth_core::SchemaContract;
use elspeth_core::SchemaMode;
use elspeth_core::SinkPlugin;
use elspeth_core::TransformPlugin;
use elspeth_core::TransformResult;
use elspeth_core::Value;
use elspeth_core::sha256_hex;
use elspeth_plugins::CsvSink;
use elspeth_plugins::FieldMapper;
use elspeth_plugins::JsonArraySink;
use elspeth_plugins::JsonlSink;
use serde_json::json;

/// Builds row data from pairs.
fn row(pairs: Vec<(&str, Value)>) -> RowData {
    pairs.into_iter().map(|(key, value)| (key.to_string(), value)).collect()
}

/// Plugin context for sink tests.
fn ctx() -> PluginContext {
    PluginContext::new(RunId::new("test-run"), json!({}))
}

// ============================================================================
// SECTION: CSV Sink
// ============================================================================

/// Tests header writing and artifact hashing over the final bytes.
#[test]
fn test_csv_sink_writes_header_and_hashes_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.csv");
    let mut sink = CsvSink::from_config(&json!({
        "path": path.display().to_string(),
        "schema": {"mode": "fixed", "fields": ["id: int", "name: str"]},
    }))
    .unwrap();

    let rows = vec![
        row(vec![("id", Value::Int(1)), ("name", Value::from("Alice"))]),
        row(vec![("id", Value::Int(2)), ("name", Value::from("Bob"))]),
    ];
    let descriptor = sink.write(&rows, &ctx()).unwrap();
    sink.flush().unwrap();
    sink.close();

    let content = std::fs::read_to_string(&path).unwrap();
    assert_eq!(content, "id,name\n1,Alice\n2,Bob\n");
    assert_eq!(descriptor.content_hash, sha256_hex(content.as_bytes()));
    assert_eq!(descriptor.artifact_type, "csv");
}

/// Tests that cells containing the delimiter are quoted.
#[test]
fn test_csv_sink_quotes_delimiter_cells() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.csv");
    let mut sink = CsvSink::from_config(&json!({
        "path": path.display().to_string(),
        "schema": {"mode": "fixed", "fields": ["note: str"]},
    }))
    .unwrap();

    sink.write(&[row(vec![("note", Value::from("hello, world"))])], &ctx()).unwrap();
    sink.flush().unwrap();
    let content = std::fs::read_to_string(&path).unwrap();
    assert_eq!(content, "note\n\"hello, world\"\n");
}

/// Tests formula sanitization of executable cell prefixes.
#[test]
fn test_csv_sink_sanitizes_formulas() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.csv");
    let mut sink = CsvSink::from_config(&json!({
        "path": path.display().to_string(),
        "schema": {"mode": "fixed", "fields": ["cell: str"]},
        "sanitize_formulas": true,
    }))
    .unwrap();

    sink.write(&[row(vec![("cell", Value::from("=SUM(A1:A9)"))])], &ctx()).unwrap();
    sink.flush().unwrap();
    let content = std::fs::read_to_string(&path).unwrap();
    assert!(content.contains("'=SUM(A1:A9)"));
}

/// Tests append-mode resume validation: exact match passes in fixed mode.
#[test]
fn test_csv_sink_resume_validation_fixed_match() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.csv");
    std::fs::write(&path, "id,name\n1,Alice\n").unwrap();

    let mut sink = CsvSink::from_config(&json!({
        "path": path.display().to_string(),
        "schema": {"mode": "fixed", "fields": ["id: int", "name: str"]},
    }))
    .unwrap();
    sink.configure_for_resume();
    assert!(sink.validate_output_target().unwrap().valid);

    sink.write(&[row(vec![("id", Value::Int(2)), ("name", Value::from("Bob"))])], &ctx())
        .unwrap();
    sink.flush().unwrap();
    let content = std::fs::read_to_string(&path).unwrap();
    assert_eq!(content, "id,name\n1,Alice\n2,Bob\n");
}

/// Tests append-mode resume validation: drifted headers fail in fixed mode.
#[test]
fn test_csv_sink_resume_validation_fixed_drift() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.csv");
    std::fs::write(&path, "id,unexpected\n1,x\n").unwrap();

    let mut sink = CsvSink::from_config(&json!({
        "path": path.display().to_string(),
        "schema": {"mode": "fixed", "fields": ["id: int", "name: str"]},
    }))
    .unwrap();
    sink.configure_for_resume();
    let validation = sink.validate_output_target().unwrap();
    assert!(!validation.valid);
    assert_eq!(validation.missing_fields, vec!["name".to_string()]);
    assert_eq!(validation.extra_fields, vec!["unexpected".to_string()]);
}

/// Tests that order mismatches are flagged distinctly in fixed mode.
#[test]
fn test_csv_sink_resume_validation_order_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.csv");
    std::fs::write(&path, "name,id\nAlice,1\n").unwrap();

    let sink = CsvSink::from_config(&json!({
        "path": path.display().to_string(),
        "schema": {"mode": "fixed", "fields": ["id: int", "name: str"]},
    }))
    .unwrap();
    let validation = sink.validate_output_target().unwrap();
    assert!(!validation.valid);
    assert!(validation.order_mismatch);
    assert!(validation.missing_fields.is_empty());
}

/// Tests that flexible schemas are rejected at configuration time.
#[test]
fn test_csv_sink_rejects_flexible_schema() {
    let err = CsvSink::from_config(&json!({
        "path": "out.csv",
        "schema": {"mode": "flexible", "fields": ["id: int"]},
    }))
    .unwrap_err();
    assert!(err.to_string().contains("fixed column structure"));
}

// ============================================================================
// SECTION: JSONL Sink
// ============================================================================

/// Tests canonical line output and append-safe resume.
#[test]
fn test_jsonl_sink_canonical_lines() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.jsonl");
    let mut sink = JsonlSink::from_config(&json!({
        "path": path.display().to_string(),
    }))
    .unwrap();

    let descriptor = sink
        .write(
            &[row(vec![("b", Value::Int(2)), ("a", Value::Int(1))])],
            &ctx(),
        )
        .unwrap();
    sink.flush().unwrap();
    sink.close();

    let content = std::fs::read_to_string(&path).unwrap();
    assert_eq!(content, "{\"a\":1,\"b\":2}\n");
    assert_eq!(descriptor.content_hash, sha256_hex(content.as_bytes()));
    assert!(sink.validate_output_target().unwrap().valid);
}

// ============================================================================
// SECTION: JSON Array Sink
// ============================================================================

/// Tests that append mode is rejected at configuration time.
#[test]
fn test_json_array_sink_append_forbidden() {
    let err = JsonArraySink::from_config(&json!({
        "path": "out.json",
        "mode": "append",
    }))
    .unwrap_err();
    assert!(err.to_string().contains("append"));
}

/// Tests that the document accumulates across writes as one array.
#[test]
fn test_json_array_sink_single_document() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.json");
    let mut sink = JsonArraySink::from_config(&json!({
        "path": path.display().to_string(),
    }))
    .unwrap();

    sink.write(&[row(vec![("id", Value::Int(1))])], &ctx()).unwrap();
    sink.write(&[row(vec![("id", Value::Int(2))])], &ctx()).unwrap();
    sink.flush().unwrap();

    let parsed: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(parsed, json!([{"id": 1}, {"id": 2}]));
}

/// Tests that resuming into an existing JSON array target is refused.
#[test]
fn test_json_array_sink_resume_refused() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.json");
    std::fs::write(&path, "[]").unwrap();
    let mut sink = JsonArraySink::from_config(&json!({
        "path": path.display().to_string(),
    }))
    .unwrap();
    sink.configure_for_resume();
    assert!(!sink.validate_output_target().unwrap().valid);
}

// ============================================================================
// SECTION: Field Mapper
// ============================================================================

/// Tests field renaming with contract evolution.
#[test]
fn test_field_mapper_renames_and_evolves_contract() {
    let contract = Arc::new(
        SchemaContract::new(
            SchemaMode::Fixed,
            vec![
                FieldContract::declared("id", FieldType::Int),
                FieldContract::declared("name", FieldType::Text),
            ],
            true,
        )
        .unwrap(),
    );
    let mapper = FieldMapper::from_config(&json!({
        "mapping": {"name": "display_name"},
    }))
    .unwrap();

    let pipeline_row = PipelineRow::new(
        row(vec![("id", Value::Int(1)), ("name", Value::from("Alice"))]),
        Arc::clone(&contract),
    );
    let result = mapper.apply(&pipeline_row, &ctx()).unwrap();
    let TransformResult::Success {
        data, ..
    } = result
    else {
        panic!("expected success");
    };
    assert!(data.get("name").is_none());
    assert_eq!(data.get("display_name"), Some(&Value::from("Alice")));

    let evolved = mapper.output_contract(&contract).unwrap();
    assert!(evolved.field("display_name").is_some());
    assert!(evolved.field("name").is_none());
    assert_ne!(evolved.version_hash, contract.version_hash);
}
