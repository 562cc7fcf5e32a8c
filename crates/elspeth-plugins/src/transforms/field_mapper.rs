// elspeth-plugins/src/transforms/field_mapper.rs
// ============================================================================
// Module: Field Mapper Transform
// Description: Deterministic field renaming and copying.
// Purpose: Reshape rows and exercise transform-driven schema evolution.
// Dependencies: elspeth-core
// ============================================================================

//! ## Overview
//! Renames or copies fields according to a configured mapping. The output
//! contract replaces mapped field names while preserving types, so the
//! evolved contract flows through the audit trail like any other
//! transform-driven schema change.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;

use elspeth_core::PipelineRow;
use elspeth_core::PluginConfigError;
use elspeth_core::PluginContext;
use elspeth_core::PluginError;
use elspeth_core::SchemaContract;
use elspeth_core::TransformPlugin;
use elspeth_core::TransformResult;
use serde_json::Map as JsonMap;
use serde_json::Value as JsonValue;

// ============================================================================
// SECTION: Field Mapper
// ============================================================================

/// Field renaming/copying transform.
pub struct FieldMapper {
    /// Source field to target field.
    mapping: BTreeMap<String, String>,
    /// When true, the source field is kept alongside the target.
    keep_source: bool,
}

impl FieldMapper {
    /// Creates a field mapper from plugin configuration.
    ///
    /// Expected shape: `{"mapping": {"from": "to"}, "keep_source": false}`.
    ///
    /// # Errors
    ///
    /// Returns [`PluginConfigError`] when the mapping is missing or empty.
    pub fn from_config(config: &JsonValue) -> Result<Self, PluginConfigError> {
        let mapping_obj =
            config.get("mapping").and_then(JsonValue::as_object).ok_or_else(|| {
                PluginConfigError::new("field-mapper", "missing required 'mapping' object")
            })?;
        if mapping_obj.is_empty() {
            return Err(PluginConfigError::new("field-mapper", "'mapping' must not be empty"));
        }
        let mut mapping = BTreeMap::new();
        for (from, to) in mapping_obj {
            let Some(to) = to.as_str() else {
                return Err(PluginConfigError::new(
                    "field-mapper",
                    "mapping targets must be strings",
                ));
            };
            mapping.insert(from.clone(), to.to_string());
        }
        Ok(Self {
            mapping,
            keep_source: config
                .get("keep_source")
                .and_then(JsonValue::as_bool)
                .unwrap_or(false),
        })
    }
}

impl TransformPlugin for FieldMapper {
    fn name(&self) -> &str {
        "field-mapper"
    }

    fn plugin_version(&self) -> &str {
        "1.0.0"
    }

    fn apply(
        &self,
        row: &PipelineRow,
        _ctx: &PluginContext,
    ) -> Result<TransformResult, PluginError> {
        let mut data = row.data().clone();
        let mut mapped = Vec::new();
        for (from, to) in &self.mapping {
            let Some(value) = data.get(from).cloned() else {
                continue;
            };
            if !self.keep_source {
                data.remove(from);
            }
            data.insert(to.clone(), value);
            mapped.push(JsonValue::from(format!("{from} -> {to}")));
        }
        let mut reason = JsonMap::new();
        reason.insert("mapped".to_string(), JsonValue::Array(mapped));
        Ok(TransformResult::success(data, reason))
    }

    fn output_contract(&self, input: &SchemaContract) -> Result<SchemaContract, PluginError> {
        let mut fields = input.fields.clone();
        for (from, to) in &self.mapping {
            let Some(position) =
                fields.iter().position(|field| &field.normalized_name == from)
            else {
                continue;
            };
            if self.keep_source {
                let mut copied = fields[position].clone();
                copied.normalized_name = to.clone();
                copied.original_name = to.clone();
                copied.required = false;
                fields.push(copied);
            } else {
                fields[position].normalized_name = to.clone();
                fields[position].original_name = to.clone();
            }
        }
        SchemaContract::new(input.mode, fields, input.locked)
            .map_err(|err| PluginError::permanent("ContractError", err.to_string()))
    }
}
