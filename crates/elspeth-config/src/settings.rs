// elspeth-config/src/settings.rs
// ============================================================================
// Module: ELSPETH Settings
// Description: YAML settings document model and validation.
// Purpose: Resolve pipeline, store, pool, and security configuration.
// Dependencies: serde, serde_yaml, serde_json, elspeth-core
// ============================================================================

//! ## Overview
//! The settings document names the stores, the pipeline's plugins and
//! policies, checkpoint cadence, pool limits, and the security posture.
//! Validation happens at load: unknown plugins, empty pipelines, or
//! nonsensical limits are [`SettingsError`]s before a run starts. The
//! resolved document canonicalizes to the run's `config_hash`.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;

use elspeth_core::CanonicalError;
use elspeth_core::stable_hash_raw;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised while loading or validating settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The settings file could not be read.
    #[error("failed to read settings file '{path}': {message}")]
    Io {
        /// Offending path.
        path: String,
        /// I/O error text.
        message: String,
    },
    /// The document is not valid YAML for the settings model.
    #[error("malformed settings document: {0}")]
    Malformed(String),
    /// The document parsed but violates a semantic rule.
    #[error("invalid settings: {0}")]
    Invalid(String),
    /// Canonicalization of the resolved settings failed.
    #[error(transparent)]
    Canonical(#[from] CanonicalError),
}

// ============================================================================
// SECTION: Settings Model
// ============================================================================

/// Checkpoint cadence settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CheckpointSettings {
    /// Whether checkpoints are written at all.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Checkpoint every Nth durable token.
    #[serde(default = "default_one")]
    pub every_n: usize,
}

impl Default for CheckpointSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            every_n: 1,
        }
    }
}

/// Pooled-executor settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PoolSettings {
    /// Number of parallel workers.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Total retry budget per row, in seconds.
    #[serde(default = "default_retry_seconds")]
    pub max_capacity_retry_seconds: f64,
    /// Minimum gap between any two dispatches, in milliseconds.
    #[serde(default)]
    pub min_dispatch_delay_ms: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            max_capacity_retry_seconds: default_retry_seconds(),
            min_dispatch_delay_ms: 0,
        }
    }
}

/// Security posture settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SecuritySettings {
    /// Security mode literal: `development`, `standard`, or `strict`.
    #[serde(default = "default_security_mode")]
    pub mode: String,
    /// Regex allowlist for outbound endpoints.
    #[serde(default)]
    pub approved_endpoints: Vec<String>,
    /// Environment variable that may override the allowlist.
    #[serde(default)]
    pub endpoint_allowlist_env: Option<String>,
}

impl Default for SecuritySettings {
    fn default() -> Self {
        Self {
            mode: default_security_mode(),
            approved_endpoints: Vec::new(),
            endpoint_allowlist_env: None,
        }
    }
}

/// One plugin node in the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct NodeSettings {
    /// Plugin name to instantiate.
    pub plugin: String,
    /// Plugin configuration, passed through verbatim.
    #[serde(default)]
    pub config: JsonValue,
    /// Failure policy literal: `route:<label>`, `discard`, or `fail`.
    #[serde(default)]
    pub on_error: Option<String>,
}

/// The resolved settings document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ElspethSettings {
    /// Path of the SQLite audit store.
    pub landscape_path: PathBuf,
    /// Root of the content-addressed payload store.
    pub payload_store_path: PathBuf,
    /// Checkpoint cadence.
    #[serde(default)]
    pub checkpoints: CheckpointSettings,
    /// Pooled-executor limits.
    #[serde(default)]
    pub pool: PoolSettings,
    /// Security posture.
    #[serde(default)]
    pub security: SecuritySettings,
    /// The source node.
    pub source: NodeSettings,
    /// Processing stages in order.
    #[serde(default)]
    pub transforms: Vec<NodeSettings>,
    /// Optional external-call client for transforms that make LLM calls.
    #[serde(default)]
    pub llm: Option<NodeSettings>,
    /// Sinks by label; `default` is required.
    pub sinks: BTreeMap<String, NodeSettings>,
    /// When set, export the audit trail here at end of run.
    #[serde(default)]
    pub export_path: Option<PathBuf>,
}

impl ElspethSettings {
    /// Semantic validation beyond the serde model.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::Invalid`] for rule violations.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if !self.sinks.contains_key("default") {
            return Err(SettingsError::Invalid(
                "sinks must include a 'default' entry".to_string(),
            ));
        }
        if self.checkpoints.every_n == 0 {
            return Err(SettingsError::Invalid(
                "checkpoints.every_n must be at least 1".to_string(),
            ));
        }
        if self.pool.pool_size == 0 {
            return Err(SettingsError::Invalid("pool.pool_size must be at least 1".to_string()));
        }
        if self.pool.max_capacity_retry_seconds < 0.0 {
            return Err(SettingsError::Invalid(
                "pool.max_capacity_retry_seconds must not be negative".to_string(),
            ));
        }
        match self.security.mode.as_str() {
            "development" | "standard" | "strict" => {}
            other => {
                return Err(SettingsError::Invalid(format!("unknown security mode '{other}'")));
            }
        }
        for (label, sink) in &self.sinks {
            if sink.plugin.is_empty() {
                return Err(SettingsError::Invalid(format!(
                    "sink '{label}' names no plugin"
                )));
            }
        }
        if let Some(llm) = &self.llm
            && llm.plugin.is_empty()
        {
            return Err(SettingsError::Invalid("llm names no plugin".to_string()));
        }
        for node in &self.transforms {
            if let Some(policy) = &node.on_error {
                let valid = policy == "discard"
                    || policy == "fail"
                    || policy.strip_prefix("route:").is_some_and(|label| !label.is_empty());
                if !valid {
                    return Err(SettingsError::Invalid(format!(
                        "unknown on_error policy '{policy}' (expected route:<label>, discard, or fail)"
                    )));
                }
            }
        }
        Ok(())
    }

    /// The resolved settings as canonical-JSON-ready data.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::Malformed`] when serialization fails.
    pub fn to_json(&self) -> Result<JsonValue, SettingsError> {
        serde_json::to_value(self).map_err(|err| SettingsError::Malformed(err.to_string()))
    }

    /// Stable hash of the resolved settings.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError`] when serialization or hashing fails.
    pub fn config_hash(&self) -> Result<String, SettingsError> {
        Ok(stable_hash_raw(&self.to_json()?)?)
    }
}

// ============================================================================
// SECTION: Loading
// ============================================================================

/// Loads and validates a settings document from a YAML file.
///
/// # Errors
///
/// Returns [`SettingsError`] for I/O, parse, and validation failures.
pub fn load_settings(path: &Path) -> Result<ElspethSettings, SettingsError> {
    let raw = std::fs::read_to_string(path).map_err(|err| SettingsError::Io {
        path: path.display().to_string(),
        message: err.to_string(),
    })?;
    parse_settings(&raw)
}

/// Parses and validates a settings document from YAML text.
///
/// # Errors
///
/// Returns [`SettingsError`] for parse and validation failures.
pub fn parse_settings(raw: &str) -> Result<ElspethSettings, SettingsError> {
    let settings: ElspethSettings =
        serde_yaml::from_str(raw).map_err(|err| SettingsError::Malformed(err.to_string()))?;
    settings.validate()?;
    Ok(settings)
}

// ============================================================================
// SECTION: Defaults
// ============================================================================

/// Serde default: true.
const fn default_true() -> bool {
    true
}

/// Serde default: one.
const fn default_one() -> usize {
    1
}

/// Serde default pool size.
const fn default_pool_size() -> usize {
    4
}

/// Serde default retry budget.
const fn default_retry_seconds() -> f64 {
    60.0
}

/// Serde default security mode.
fn default_security_mode() -> String {
    "standard".to_string()
}
