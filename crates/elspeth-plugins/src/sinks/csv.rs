// elspeth-plugins/src/sinks/csv.rs
// ============================================================================
// Module: CSV Sink
// Description: Delimited file sink with durable flush and resume validation.
// Purpose: Write rows to CSV with audit-grade content hashing.
// Dependencies: elspeth-core, crate::{csv_text, schema_config, sinks}
// ============================================================================

//! ## Overview
//! Writes rows to a delimited UTF-8 file. Headers come from the declared
//! schema (so optional fields are always present) or from the first row
//! under a dynamic schema. Append mode reuses the existing header row and,
//! on resume, validates it against the schema: fixed schemas demand an exact
//! ordered match, flexible schemas a superset, dynamic schemas adopt the
//! file's headers. `flush` is flush-plus-fsync; the content hash is the
//! SHA-256 of the final file bytes. Optional formula sanitization neutralizes
//! spreadsheet-executable cell prefixes.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::fs;
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
use elspeth_core::SchemaMode;
use elspeth_core::SinkPlugin;
use elspeth_core::sha256_hex;
use serde_json::Value as JsonValue;

use crate::csv_text::format_line;
use crate::csv_text::parse_line;
use crate::schema_config::SchemaConfig;
use crate::sinks::read_file_bytes;
use crate::sinks::render_value;
use crate::sources::csv::parse_delimiter;

// ============================================================================
// SECTION: Configuration
// ============================================================================

/// Write mode for the CSV sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsvWriteMode {
    /// Truncate and write a fresh header.
    Write,
    /// Append to an existing file, reusing its header.
    Append,
}

/// Configuration for the CSV sink.
#[derive(Debug, Clone)]
pub struct CsvSinkConfig {
    /// Path of the output file.
    pub path: PathBuf,
    /// Field delimiter.
    pub delimiter: char,
    /// Schema declaration.
    pub schema: SchemaConfig,
    /// Truncate or append.
    pub mode: CsvWriteMode,
    /// Restore original header names instead of normalized ones.
    pub restore_original_headers: bool,
    /// Neutralize spreadsheet-executable cell prefixes.
    pub sanitize_formulas: bool,
}

impl CsvSinkConfig {
    /// Parses the sink configuration.
    ///
    /// CSV needs a fixed column structure, so schemas that discover extra
    /// fields at run time are rejected here.
    ///
    /// # Errors
    ///
    /// Returns [`PluginConfigError`] for malformed configuration.
    pub fn from_config(config: &JsonValue) -> Result<Self, PluginConfigError> {
        let path = config.get("path").and_then(JsonValue::as_str).ok_or_else(|| {
            PluginConfigError::new("csv", "missing required 'path' configuration")
        })?;
        let schema = SchemaConfig::from_config("csv", config)?;
        if schema.mode == SchemaMode::Flexible {
            return Err(PluginConfigError::new(
                "csv",
                "csv requires a fixed column structure; flexible schemas belong in json sinks",
            ));
        }
        let mode = match config.get("mode").and_then(JsonValue::as_str) {
            None | Some("write") => CsvWriteMode::Write,
            Some("append") => CsvWriteMode::Append,
            Some(other) => {
                return Err(PluginConfigError::new(
                    "csv",
                    format!("unknown write mode '{other}'"),
                ));
            }
        };
        Ok(Self {
            path: PathBuf::from(path),
            delimiter: parse_delimiter("csv", config)?,
            schema,
            mode,
            restore_original_headers: config
                .get("headers")
                .and_then(JsonValue::as_str)
                .is_some_and(|value| value == "original"),
            sanitize_formulas: config
                .get("sanitize_formulas")
                .and_then(JsonValue::as_bool)
                .unwrap_or(false),
        })
    }
}

// ============================================================================
// SECTION: CSV Sink
// ============================================================================

/// Delimited file sink.
#[derive(Debug)]
pub struct CsvSink {
    /// Parsed configuration.
    config: CsvSinkConfig,
    /// Current write mode (resume flips write to append).
    mode: CsvWriteMode,
    /// Open handle, once writing has begun.
    file: Option<File>,
    /// Header names in column order, fixed at first write.
    fieldnames: Option<Vec<String>>,
    /// Normalized-to-original header mapping supplied before resume.
    resume_resolution: BTreeMap<String, String>,
}

impl CsvSink {
    /// Creates a CSV sink from plugin configuration.
    ///
    /// # Errors
    ///
    /// Returns [`PluginConfigError`] for malformed configuration.
    pub fn from_config(config: &JsonValue) -> Result<Self, PluginConfigError> {
        let parsed = CsvSinkConfig::from_config(config)?;
        Ok(Self {
            mode: parsed.mode,
            config: parsed,
            file: None,
            fieldnames: None,
            resume_resolution: BTreeMap::new(),
        })
    }

    /// Headers already present in the output file, when any.
    fn existing_headers(&self) -> Result<Option<Vec<String>>, PluginError> {
        if !self.config.path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&self.config.path)
            .map_err(|err| PluginError::permanent("IoError", err.to_string()))?;
        let Some(header_line) = raw.lines().next() else {
            return Ok(None);
        };
        if header_line.is_empty() {
            return Ok(None);
        }
        Ok(Some(parse_line(header_line, self.config.delimiter)))
    }

    /// Column names from the schema or the first row.
    fn resolve_fieldnames(&self, first_row: &RowData) -> Vec<String> {
        if self.config.schema.is_observed() {
            first_row.keys().cloned().collect()
        } else {
            self.config.schema.field_names()
        }
    }

    /// Display form of a header, honoring original-header restoration.
    fn display_header(&self, normalized: &str) -> String {
        if !self.config.restore_original_headers {
            return normalized.to_string();
        }
        self.resume_resolution.get(normalized).cloned().unwrap_or_else(|| {
            self.config
                .schema
                .fields
                .iter()
                .find(|field| field.normalized_name == normalized)
                .map_or_else(|| normalized.to_string(), |field| field.original_name.clone())
        })
    }

    /// Opens the file, writing or adopting the header as the mode demands.
    fn open_file(&mut self, first_row: &RowData) -> Result<(), PluginError> {
        if self.mode == CsvWriteMode::Append
            && let Some(existing) = self.existing_headers()?
        {
            if !self.config.schema.is_observed() {
                let validation = self.validate_output_target()?;
                if !validation.valid {
                    return Err(PluginError::permanent(
                        "SchemaMismatch",
                        validation
                            .error_message
                            .unwrap_or_else(|| "csv header mismatch".to_string()),
                    ));
                }
            }
            self.fieldnames = Some(existing);
            let file = OpenOptions::new()
                .append(true)
                .open(&self.config.path)
                .map_err(|err| PluginError::permanent("IoError", err.to_string()))?;
            self.file = Some(file);
            return Ok(());
        }

        let fieldnames = self.resolve_fieldnames(first_row);
        let mut file = File::create(&self.config.path)
            .map_err(|err| PluginError::permanent("IoError", err.to_string()))?;
        let display: Vec<String> =
            fieldnames.iter().map(|name| self.display_header(name)).collect();
        writeln!(file, "{}", format_line(&display, self.config.delimiter))
            .map_err(|err| PluginError::permanent("IoError", err.to_string()))?;
        self.fieldnames = Some(fieldnames);
        self.file = Some(file);
        Ok(())
    }

    /// Renders one cell, applying formula sanitization when configured.
    fn render_cell(&self, data: &RowData, name: &str) -> Result<String, PluginError> {
        let rendered = match data.get(name) {
            None => String::new(),
            Some(value) => render_value(value)?,
        };
        if self.config.sanitize_formulas
            && rendered.starts_with(['=', '+', '-', '@'])
        {
            return Ok(format!("'{rendered}"));
        }
        Ok(rendered)
    }
}

impl SinkPlugin for CsvSink {
    fn name(&self) -> &str {
        "csv"
    }

    fn plugin_version(&self) -> &str {
        "1.0.0"
    }

    fn write(
        &mut self,
        rows: &[RowData],
        _ctx: &PluginContext,
    ) -> Result<ArtifactDescriptor, PluginError> {
        if rows.is_empty() {
            return Ok(ArtifactDescriptor::for_file(
                self.config.path.display().to_string(),
                "csv",
                sha256_hex(b""),
                0,
            ));
        }
        if self.file.is_none() {
            self.open_file(&rows[0])?;
        }
        let Some(fieldnames) = self.fieldnames.clone() else {
            return Err(PluginError::permanent("IoError", "csv writer not initialized"));
        };
        let mut lines = Vec::with_capacity(rows.len());
        for data in rows {
            let mut cells = Vec::with_capacity(fieldnames.len());
            for name in &fieldnames {
                cells.push(self.render_cell(data, name)?);
            }
            lines.push(format_line(&cells, self.config.delimiter));
        }
        let Some(file) = self.file.as_mut() else {
            return Err(PluginError::permanent("IoError", "csv writer not initialized"));
        };
        for line in lines {
            writeln!(file, "{line}")
                .map_err(|err| PluginError::permanent("IoError", err.to_string()))?;
        }
        file.flush().map_err(|err| PluginError::permanent("IoError", err.to_string()))?;

        let bytes = read_file_bytes(&self.config.path)?;
        Ok(ArtifactDescriptor::for_file(
            self.config.path.display().to_string(),
            "csv",
            sha256_hex(&bytes),
            i64::try_from(bytes.len()).unwrap_or(i64::MAX),
        ))
    }

    fn flush(&mut self) -> Result<(), PluginError> {
        if let Some(file) = self.file.as_mut() {
            file.flush().map_err(|err| PluginError::permanent("IoError", err.to_string()))?;
            // Durability means the bytes survive a crash, not just a close.
            file.sync_all()
                .map_err(|err| PluginError::permanent("IoError", err.to_string()))?;
        }
        Ok(())
    }

    fn close(&mut self) {
        self.file = None;
        self.fieldnames = None;
    }

    fn configure_for_resume(&mut self) {
        self.mode = CsvWriteMode::Append;
    }

    fn validate_output_target(&self) -> Result<OutputValidationResult, PluginError> {
        let Some(existing) = self.existing_headers()? else {
            // No file or empty file: the first write creates the header.
            return Ok(OutputValidationResult::success(Vec::new()));
        };
        if self.config.schema.is_observed() {
            return Ok(OutputValidationResult::success(existing));
        }

        let expected: Vec<String> = self
            .config
            .schema
            .field_names()
            .iter()
            .map(|name| self.display_header(name))
            .collect();
        let existing_set: std::collections::BTreeSet<&String> = existing.iter().collect();
        let expected_set: std::collections::BTreeSet<&String> = expected.iter().collect();

        match self.config.schema.mode {
            SchemaMode::Fixed => {
                if existing == expected {
                    Ok(OutputValidationResult::success(existing))
                } else {
                    let mut failure = OutputValidationResult::failure(
                        "csv headers do not match the fixed schema",
                    );
                    failure.schema_fields = expected.clone();
                    failure.missing_fields = expected_set
                        .difference(&existing_set)
                        .map(|name| (*name).clone())
                        .collect();
                    failure.extra_fields = existing_set
                        .difference(&expected_set)
                        .map(|name| (*name).clone())
                        .collect();
                    failure.order_mismatch = existing_set == expected_set;
                    failure.target_fields = existing;
                    Ok(failure)
                }
            }
            SchemaMode::Flexible | SchemaMode::Observed => {
                let missing: Vec<String> = expected_set
                    .difference(&existing_set)
                    .map(|name| (*name).clone())
                    .collect();
                if missing.is_empty() {
                    Ok(OutputValidationResult::success(existing))
                } else {
                    let mut failure = OutputValidationResult::failure(
                        "csv is missing schema fields required by the contract",
                    );
                    failure.schema_fields = expected;
                    failure.missing_fields = missing;
                    failure.target_fields = existing;
                    Ok(failure)
                }
            }
        }
    }

    fn set_resume_field_resolution(&mut self, resolution: BTreeMap<String, String>) {
        self.resume_resolution = resolution;
    }
}
