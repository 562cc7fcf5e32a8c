// elspeth-plugins/src/sinks/jsonl.rs
// ============================================================================
// Module: JSONL Sink
// Description: Append-safe newline-delimited JSON sink.
// Purpose: Write one JSON object per row with durable flush semantics.
// Dependencies: elspeth-core, crate::sinks
// ============================================================================

//! ## Overview
//! One JSON object per line, in canonical (sorted-key) form. JSONL is
//! append-safe by construction, so resume simply keeps appending; there is
//! no header state to validate.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fs::File;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::PathBuf;

use elspeth_core::ArtifactDescriptor;
use elspeth_core::OutputValidationResult;
use elspeth_core::PluginConfigError;
use elspeth_core::PluginContext;
use elspeth_core::PluginError;
use elspeth_core::RowData;
use elspeth_core::SinkPlugin;
use elspeth_core::canonical_json_raw;
use elspeth_core::normalize_row;
use elspeth_core::sha256_hex;
use serde_json::Value as JsonValue;

use crate::sinks::read_file_bytes;

// ============================================================================
// SECTION: JSONL Sink
// ============================================================================

/// Newline-delimited JSON file sink.
pub struct JsonlSink {
    /// Path of the output file.
    path: PathBuf,
    /// Open handle, once writing has begun.
    file: Option<File>,
}

impl JsonlSink {
    /// Creates a JSONL sink from plugin configuration.
    ///
    /// # Errors
    ///
    /// Returns [`PluginConfigError`] when the path is missing.
    pub fn from_config(config: &JsonValue) -> Result<Self, PluginConfigError> {
        let path = config.get("path").and_then(JsonValue::as_str).ok_or_else(|| {
            PluginConfigError::new("jsonl", "missing required 'path' configuration")
        })?;
        Ok(Self {
            path: PathBuf::from(path),
            file: None,
        })
    }
}

impl SinkPlugin for JsonlSink {
    fn name(&self) -> &str {
        "jsonl"
    }

    fn plugin_version(&self) -> &str {
        "1.0.0"
    }

    fn write(
        &mut self,
        rows: &[RowData],
        _ctx: &PluginContext,
    ) -> Result<ArtifactDescriptor, PluginError> {
        if self.file.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .map_err(|err| PluginError::permanent("IoError", err.to_string()))?;
            self.file = Some(file);
        }
        let Some(file) = self.file.as_mut() else {
            return Err(PluginError::permanent("IoError", "jsonl writer not initialized"));
        };
        for data in rows {
            let normalized = normalize_row(data)
                .map_err(|err| PluginError::permanent("CanonicalError", err.to_string()))?;
            let line = canonical_json_raw(&normalized)
                .map_err(|err| PluginError::permanent("CanonicalError", err.to_string()))?;
            writeln!(file, "{line}")
                .map_err(|err| PluginError::permanent("IoError", err.to_string()))?;
        }
        file.flush().map_err(|err| PluginError::permanent("IoError", err.to_string()))?;

        let bytes = read_file_bytes(&self.path)?;
        Ok(ArtifactDescriptor::for_file(
            self.path.display().to_string(),
            "jsonl",
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

    fn validate_output_target(&self) -> Result<OutputValidationResult, PluginError> {
        // Append-safe format: any existing file is compatible.
        Ok(OutputValidationResult::success(Vec::new()))
    }
}
