// elspeth-plugins/src/sinks/json.rs
// ============================================================================
// Module: JSON Array Sink
// Description: Whole-file JSON array sink; append mode is rejected.
// Purpose: Write runs whose consumers want a single JSON document.
// Dependencies: elspeth-core, crate::sinks
// ============================================================================

//! ## Overview
//! Accumulates rows and rewrites the whole file as one JSON array on every
//! write. A single array cannot be appended to safely, so append mode is a
//! configuration error, and resume refuses a target that already exists:
//! resuming into a JSON array would silently drop the prior document.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fs::File;
use std::io::Write as _;
use std::path::PathBuf;

use elspeth_core::ArtifactDescriptor;
use elspeth_core::OutputValidationResult;
use elspeth_core::PluginConfigError;
use elspeth_core::PluginContext;
use elspeth_core::PluginError;
use elspeth_core::RowData;
use elspeth_core::SinkPlugin;
use elspeth_core::normalize_row;
use elspeth_core::sha256_hex;
use serde_json::Value as JsonValue;

use crate::sinks::read_file_bytes;

// ============================================================================
// SECTION: JSON Array Sink
// ============================================================================

/// Single-document JSON array sink.
#[derive(Debug)]
pub struct JsonArraySink {
    /// Path of the output file.
    path: PathBuf,
    /// All rows written so far (the file is rewritten per write).
    collected: Vec<JsonValue>,
    /// Open handle kept for durable flush.
    file: Option<File>,
    /// Set once resume has been requested; the sink must then refuse an
    /// existing target.
    resuming: bool,
}

impl JsonArraySink {
    /// Creates a JSON array sink from plugin configuration.
    ///
    /// # Errors
    ///
    /// Returns [`PluginConfigError`] when the path is missing or append mode
    /// is requested: a JSON array is not an appendable format.
    pub fn from_config(config: &JsonValue) -> Result<Self, PluginConfigError> {
        let path = config.get("path").and_then(JsonValue::as_str).ok_or_else(|| {
            PluginConfigError::new("json", "missing required 'path' configuration")
        })?;
        if config.get("mode").and_then(JsonValue::as_str) == Some("append") {
            return Err(PluginConfigError::new(
                "json",
                "append mode is not supported: a JSON array is a single document",
            ));
        }
        Ok(Self {
            path: PathBuf::from(path),
            collected: Vec::new(),
            file: None,
            resuming: false,
        })
    }
}

impl SinkPlugin for JsonArraySink {
    fn name(&self) -> &str {
        "json"
    }

    fn plugin_version(&self) -> &str {
        "1.0.0"
    }

    fn write(
        &mut self,
        rows: &[RowData],
        _ctx: &PluginContext,
    ) -> Result<ArtifactDescriptor, PluginError> {
        for data in rows {
            let normalized = normalize_row(data)
                .map_err(|err| PluginError::permanent("CanonicalError", err.to_string()))?;
            self.collected.push(normalized);
        }

        let document = serde_json::to_string_pretty(&JsonValue::Array(self.collected.clone()))
            .map_err(|err| PluginError::permanent("CanonicalError", err.to_string()))?;
        let mut file = File::create(&self.path)
            .map_err(|err| PluginError::permanent("IoError", err.to_string()))?;
        file.write_all(document.as_bytes())
            .map_err(|err| PluginError::permanent("IoError", err.to_string()))?;
        file.write_all(b"\n")
            .map_err(|err| PluginError::permanent("IoError", err.to_string()))?;
        file.flush().map_err(|err| PluginError::permanent("IoError", err.to_string()))?;
        self.file = Some(file);

        let bytes = read_file_bytes(&self.path)?;
        Ok(ArtifactDescriptor::for_file(
            self.path.display().to_string(),
            "json",
            sha256_hex(&bytes),
            i64::try_from(bytes.len()).unwrap_or(i64::MAX),
        ))
    }

    fn flush(&mut self) -> Result<(), PluginError> {
        if let Some(file) = self.file.as_mut() {
            file.flush().map_err(|err| PluginError::permanent("IoError", err.to_string()))?;
            file.sync_all()
                .map_err(|err| PluginError::permanent("IoError", err.to_string()))?;
        }
        Ok(())
    }

    fn close(&mut self) {
        self.file = None;
    }

    fn configure_for_resume(&mut self) {
        self.resuming = true;
    }

    fn validate_output_target(&self) -> Result<OutputValidationResult, PluginError> {
        if self.resuming && self.path.exists() {
            return Ok(OutputValidationResult::failure(
                "json array targets cannot be resumed into: the document would be replaced",
            ));
        }
        Ok(OutputValidationResult::success(Vec::new()))
    }
}
