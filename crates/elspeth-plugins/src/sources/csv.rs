// elspeth-plugins/src/sources/csv.rs
// ============================================================================
// Module: CSV Source
// Description: Typed CSV source with contract locking and quarantine.
// Purpose: Read delimited files into contract-bearing pipeline rows.
// Dependencies: elspeth-core, crate::{csv_text, schema_config}
// ============================================================================

//! ## Overview
//! Reads a delimited UTF-8 file, resolves header names to normalized field
//! names, and emits typed rows. Declared fields parse into their declared
//! types; a parse or validation failure quarantines the row with its
//! violations. `FLEXIBLE` and `OBSERVED` schemas lock their contract from
//! the first valid row (undeclared columns infer as optional text).

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use bigdecimal::BigDecimal;
use elspeth_core::ContractViolation;
use elspeth_core::FieldType;
use elspeth_core::PipelineRow;
use elspeth_core::PluginConfigError;
use elspeth_core::PluginContext;
use elspeth_core::PluginError;
use elspeth_core::QuarantinedRow;
use elspeth_core::RowData;
use elspeth_core::SchemaContract;
use elspeth_core::SchemaMode;
use elspeth_core::SourcePlugin;
use elspeth_core::SourceRow;
use elspeth_core::Value;
use serde_json::Value as JsonValue;

use crate::csv_text::parse_line;
use crate::schema_config::SchemaConfig;
use crate::schema_config::normalize_name;

// ============================================================================
// SECTION: Configuration
// ============================================================================

/// Configuration for the CSV source.
#[derive(Debug, Clone)]
pub struct CsvSourceConfig {
    /// Path of the input file.
    pub path: PathBuf,
    /// Field delimiter.
    pub delimiter: char,
    /// Schema declaration.
    pub schema: SchemaConfig,
    /// Quarantine destination label for invalid rows.
    pub quarantine_destination: String,
}

impl CsvSourceConfig {
    /// Parses the source configuration.
    ///
    /// # Errors
    ///
    /// Returns [`PluginConfigError`] for missing paths or malformed schema.
    pub fn from_config(config: &JsonValue) -> Result<Self, PluginConfigError> {
        let path = config.get("path").and_then(JsonValue::as_str).ok_or_else(|| {
            PluginConfigError::new("csv", "missing required 'path' configuration")
        })?;
        let delimiter = parse_delimiter("csv", config)?;
        let schema = SchemaConfig::from_config("csv", config)?;
        let quarantine_destination = config
            .get("quarantine_destination")
            .and_then(JsonValue::as_str)
            .unwrap_or("__quarantine__")
            .to_string();
        Ok(Self {
            path: PathBuf::from(path),
            delimiter,
            schema,
            quarantine_destination,
        })
    }
}

/// Parses the optional single-character delimiter setting.
pub(crate) fn parse_delimiter(
    plugin: &str,
    config: &JsonValue,
) -> Result<char, PluginConfigError> {
    match config.get("delimiter").and_then(JsonValue::as_str) {
        None => Ok(','),
        Some(text) => {
            let mut chars = text.chars();
            match (chars.next(), chars.next()) {
                (Some(ch), None) => Ok(ch),
                _ => Err(PluginConfigError::new(
                    plugin,
                    format!("delimiter must be a single character, got '{text}'"),
                )),
            }
        }
    }
}

// ============================================================================
// SECTION: CSV Source
// ============================================================================

/// CSV file source.
pub struct CsvSource {
    /// Parsed configuration.
    config: CsvSourceConfig,
    /// Current contract; locks on the first valid row.
    contract: SchemaContract,
    /// Whether close() has run.
    closed: bool,
}

impl CsvSource {
    /// Creates a CSV source from plugin configuration.
    ///
    /// # Errors
    ///
    /// Returns [`PluginConfigError`] for malformed configuration.
    pub fn from_config(config: &JsonValue) -> Result<Self, PluginConfigError> {
        let parsed = CsvSourceConfig::from_config(config)?;
        let contract = parsed.schema.initial_contract("csv")?;
        Ok(Self {
            config: parsed,
            contract,
            closed: false,
        })
    }

    /// Parses one raw cell into the declared type.
    ///
    /// Empty cells are null. Failures produce a type-mismatch violation.
    fn parse_cell(
        field_type: FieldType,
        normalized_name: &str,
        raw: &str,
    ) -> Result<Value, ContractViolation> {
        if raw.is_empty() {
            return Ok(Value::Null);
        }
        let mismatch = || ContractViolation::TypeMismatch {
            field: normalized_name.to_string(),
            expected: field_type.as_str().to_string(),
            actual: "str".to_string(),
        };
        match field_type {
            FieldType::Int => {
                let trimmed = raw.trim();
                if let Ok(number) = trimmed.parse::<i64>() {
                    return Ok(Value::Int(number));
                }
                // Integers beyond 64-bit range keep their exact form.
                BigDecimal::from_str(trimmed)
                    .ok()
                    .filter(BigDecimal::is_integer)
                    .map(Value::BigInt)
                    .ok_or_else(mismatch)
            }
            FieldType::Float => {
                raw.trim().parse::<f64>().map(Value::Float).map_err(|_| mismatch())
            }
            FieldType::Bool => match raw.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Ok(Value::Bool(true)),
                "false" | "0" | "no" => Ok(Value::Bool(false)),
                _ => Err(mismatch()),
            },
            FieldType::Decimal => BigDecimal::from_str(raw.trim())
                .map(Value::Decimal)
                .map_err(|_| mismatch()),
            FieldType::Date => time::Date::parse(
                raw.trim(),
                time::macros::format_description!("[year]-[month]-[day]"),
            )
            .map(Value::Date)
            .map_err(|_| mismatch()),
            FieldType::DateTime => {
                time::OffsetDateTime::parse(
                    raw.trim(),
                    &time::format_description::well_known::Rfc3339,
                )
                .map(Value::DateTime)
                .map_err(|_| mismatch())
            }
            FieldType::Text
            | FieldType::Any
            | FieldType::Null
            | FieldType::Bytes
            | FieldType::Array
            | FieldType::Map => Ok(Value::Text(raw.to_string())),
        }
    }

    /// Converts one parsed record into a source row.
    fn build_row(
        &mut self,
        headers: &[String],
        resolution: &BTreeMap<String, String>,
        cells: &[String],
    ) -> SourceRow {
        let mut data = RowData::new();
        let mut violations: Vec<ContractViolation> = Vec::new();

        for (position, header) in headers.iter().enumerate() {
            let raw = cells.get(position).map_or("", String::as_str);
            let normalized = resolution
                .get(header)
                .cloned()
                .unwrap_or_else(|| normalize_name(header));
            let declared = self.contract.field(&normalized).map(|field| field.field_type);
            match declared {
                Some(field_type) => match Self::parse_cell(field_type, &normalized, raw) {
                    Ok(value) => {
                        data.insert(normalized, value);
                    }
                    Err(violation) => {
                        data.insert(normalized, Value::Text(raw.to_string()));
                        violations.push(violation);
                    }
                },
                None => {
                    // Undeclared column: text under flexible/observed,
                    // rejected under fixed.
                    data.insert(normalized.clone(), Value::Text(raw.to_string()));
                    if self.contract.mode == SchemaMode::Fixed {
                        violations.push(ContractViolation::UnexpectedField {
                            field: normalized,
                        });
                    }
                }
            }
        }

        if violations.is_empty() {
            // Lock the contract on the first valid row, then validate.
            if !self.contract.locked {
                // Row data is keyed by normalized names; the resolution map
                // carries normalized -> normalized entries for exactly this.
                match elspeth_core::ContractBuilder::lock_from_first_row(
                    &self.contract,
                    &data,
                    resolution,
                ) {
                    Ok(locked) => self.contract = locked,
                    Err(err) => {
                        return SourceRow::Quarantined(QuarantinedRow {
                            row_data: data,
                            error_message: err.to_string(),
                            violations: Vec::new(),
                            destination: self.config.quarantine_destination.clone(),
                        });
                    }
                }
            }
            violations = self.contract.validate_row(&data);
        }

        if violations.is_empty() {
            SourceRow::Valid(PipelineRow::new(data, Arc::new(self.contract.clone())))
        } else {
            let message = violations
                .iter()
                .map(ContractViolation::message)
                .collect::<Vec<_>>()
                .join("; ");
            SourceRow::Quarantined(QuarantinedRow {
                row_data: data,
                error_message: message,
                violations,
                destination: self.config.quarantine_destination.clone(),
            })
        }
    }
}

impl SourcePlugin for CsvSource {
    fn name(&self) -> &str {
        "csv"
    }

    fn plugin_version(&self) -> &str {
        "1.0.0"
    }

    fn output_contract(&self) -> &SchemaContract {
        &self.contract
    }

    fn load<'a>(
        &'a mut self,
        _ctx: &PluginContext,
    ) -> Result<elspeth_core::SourceRowIter<'a>, PluginError> {
        let raw = fs::read_to_string(&self.config.path)
            .map_err(|err| PluginError::permanent("IoError", err.to_string()))?;
        let mut lines = raw.lines();
        let Some(header_line) = lines.next() else {
            return Ok(Box::new(std::iter::empty()));
        };
        let headers: Vec<String> = parse_line(header_line, self.config.delimiter)
            .into_iter()
            .map(|header| header.trim().to_string())
            .collect();

        // Resolution covers both original headers and their normalized
        // forms, so first-row locking can resolve normalized row keys.
        let mut resolution: BTreeMap<String, String> = BTreeMap::new();
        for header in &headers {
            let normalized = normalize_name(header);
            resolution.insert(header.clone(), normalized.clone());
            resolution.insert(normalized.clone(), normalized);
        }

        let records: Vec<SourceRow> = lines
            .filter(|line| !line.is_empty())
            .map(|line| parse_line(line, self.config.delimiter))
            .collect::<Vec<_>>()
            .into_iter()
            .map(|cells| self.build_row(&headers, &resolution, &cells))
            .collect();
        Ok(Box::new(records.into_iter().map(Ok)))
    }

    fn close(&mut self) {
        self.closed = true;
    }
}
