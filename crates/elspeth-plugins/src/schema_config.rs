// elspeth-plugins/src/schema_config.rs
// ============================================================================
// Module: Plugin Schema Configuration
// Description: Typed schema declarations parsed from plugin config.
// Purpose: Turn "name: type" field specs into contract field sets.
// Dependencies: elspeth-core, serde_json
// ============================================================================

//! ## Overview
//! Data plugins declare their row shape in configuration: `fixed` declares
//! every field and rejects extras, `flexible` declares some and discovers
//! the rest from the first row, `observed` declares nothing. Field specs are
//! `"name: type"` strings; parsing failures are configuration errors raised
//! at plugin construction, never at run time.

// ============================================================================
// SECTION: Imports
// ============================================================================

use elspeth_core::FieldContract;
use elspeth_core::FieldSource;
use elspeth_core::FieldType;
use elspeth_core::PluginConfigError;
use elspeth_core::SchemaContract;
use elspeth_core::SchemaMode;
use serde_json::Value as JsonValue;

// ============================================================================
// SECTION: Schema Config
// ============================================================================

/// Parsed schema declaration for a data plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaConfig {
    /// Contract discovery mode.
    pub mode: SchemaMode,
    /// Declared fields (empty for observed schemas).
    pub fields: Vec<FieldContract>,
}

impl SchemaConfig {
    /// Parses the `schema` object from plugin configuration.
    ///
    /// Accepted shapes:
    /// - `{"fields": "dynamic"}` (observed);
    /// - `{"mode": "fixed", "fields": ["id: int", "name: str"]}`;
    /// - `{"mode": "flexible", "fields": ["id: int"]}`.
    ///
    /// # Errors
    ///
    /// Returns [`PluginConfigError`] for missing or malformed declarations.
    pub fn from_config(plugin: &str, config: &JsonValue) -> Result<Self, PluginConfigError> {
        let schema = config.get("schema").ok_or_else(|| {
            PluginConfigError::new(plugin, "missing required 'schema' configuration")
        })?;

        if schema.get("fields").and_then(JsonValue::as_str) == Some("dynamic") {
            return Ok(Self {
                mode: SchemaMode::Observed,
                fields: Vec::new(),
            });
        }

        let mode = match schema.get("mode").and_then(JsonValue::as_str) {
            Some("fixed") | None => SchemaMode::Fixed,
            Some("flexible") => SchemaMode::Flexible,
            Some("observed") => SchemaMode::Observed,
            Some(other) => {
                return Err(PluginConfigError::new(
                    plugin,
                    format!("unknown schema mode '{other}'"),
                ));
            }
        };

        let specs = schema.get("fields").and_then(JsonValue::as_array).ok_or_else(|| {
            PluginConfigError::new(plugin, "'schema.fields' must be a list of 'name: type' specs")
        })?;
        let mut fields = Vec::with_capacity(specs.len());
        for spec in specs {
            let Some(spec) = spec.as_str() else {
                return Err(PluginConfigError::new(plugin, "field specs must be strings"));
            };
            fields.push(parse_field_spec(plugin, spec)?);
        }
        Ok(Self {
            mode,
            fields,
        })
    }

    /// Whether the schema discovers extra fields from data.
    #[must_use]
    pub const fn allows_extra_fields(&self) -> bool {
        matches!(self.mode, SchemaMode::Flexible | SchemaMode::Observed)
    }

    /// Whether the schema declares no fields at all.
    #[must_use]
    pub const fn is_observed(&self) -> bool {
        matches!(self.mode, SchemaMode::Observed)
    }

    /// Builds the initial (unlocked where applicable) contract.
    ///
    /// # Errors
    ///
    /// Returns [`PluginConfigError`] when the contract cannot be hashed.
    pub fn initial_contract(&self, plugin: &str) -> Result<SchemaContract, PluginConfigError> {
        let locked = self.mode == SchemaMode::Fixed;
        SchemaContract::new(self.mode, self.fields.clone(), locked)
            .map_err(|err| PluginConfigError::new(plugin, err.to_string()))
    }

    /// Declared header names in declaration order.
    #[must_use]
    pub fn field_names(&self) -> Vec<String> {
        self.fields.iter().map(|field| field.normalized_name.clone()).collect()
    }
}

/// Parses one `"name: type"` field spec.
fn parse_field_spec(plugin: &str, spec: &str) -> Result<FieldContract, PluginConfigError> {
    let (name, type_literal) = spec.split_once(':').ok_or_else(|| {
        PluginConfigError::new(plugin, format!("field spec '{spec}' must be 'name: type'"))
    })?;
    let name = name.trim();
    if name.is_empty() {
        return Err(PluginConfigError::new(plugin, format!("field spec '{spec}' has no name")));
    }
    let field_type = FieldType::parse(type_literal.trim())
        .map_err(|err| PluginConfigError::new(plugin, err.to_string()))?;
    Ok(FieldContract {
        normalized_name: normalize_name(name),
        original_name: name.to_string(),
        field_type,
        required: true,
        source: FieldSource::Declared,
    })
}

/// Normalizes a field name: lowercase, non-alphanumerics to underscores.
#[must_use]
pub fn normalize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for ch in name.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push('_');
        }
    }
    out
}
