// elspeth-plugins/src/sinks/mod.rs
// ============================================================================
// Module: Sink Plugins
// Description: Reference sink implementations.
// Purpose: Group the sinks the engine ships with.
// Dependencies: crate::sinks::{csv, json, jsonl}
// ============================================================================

//! ## Overview
//! Sinks write rows durably and describe the artifact they produced. All
//! file sinks here hash the final bytes with SHA-256 and implement `flush`
//! as flush-plus-fsync, because the orchestrator checkpoints only after a
//! sink's flush has succeeded.

// ============================================================================
// SECTION: Submodules
// ============================================================================

pub mod csv;
pub mod json;
pub mod jsonl;

// ============================================================================
// SECTION: Shared Helpers
// ============================================================================

use elspeth_core::PluginError;
use elspeth_core::Value;

/// Renders a row value as sink-facing text.
///
/// Nulls render empty; composite values render as canonical JSON.
pub(crate) fn render_value(value: &Value) -> Result<String, PluginError> {
    match value {
        Value::Null => Ok(String::new()),
        Value::Bool(flag) => Ok(flag.to_string()),
        Value::Int(number) => Ok(number.to_string()),
        Value::BigInt(number) => Ok(number.to_string()),
        Value::Float(number) => Ok(number.to_string()),
        Value::Decimal(decimal) => Ok(decimal.to_string()),
        Value::Text(text) => Ok(text.clone()),
        Value::Bytes(_)
        | Value::Date(_)
        | Value::DateTime(_)
        | Value::Array(_)
        | Value::Map(_) => {
            let normalized = elspeth_core::normalize_value(value)
                .map_err(|err| PluginError::permanent("CanonicalError", err.to_string()))?;
            match normalized {
                serde_json::Value::String(text) => Ok(text),
                other => serde_json::to_string(&other)
                    .map_err(|err| PluginError::permanent("CanonicalError", err.to_string())),
            }
        }
    }
}

/// Reads a file's bytes, tolerating absence as empty.
pub(crate) fn read_file_bytes(path: &std::path::Path) -> Result<Vec<u8>, PluginError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    std::fs::read(path).map_err(|err| PluginError::permanent("IoError", err.to_string()))
}
