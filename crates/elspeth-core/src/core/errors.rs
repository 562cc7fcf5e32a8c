// elspeth-core/src/core/errors.rs
// ============================================================================
// Module: ELSPETH Core Errors
// Description: Cross-cutting error types for orchestration and audit integrity.
// Purpose: Give every failure class a typed, non-coercible representation.
// Dependencies: thiserror
// ============================================================================

//! ## Overview
//! ELSPETH discriminates failures by type, never by message matching. The
//! errors here are the tiers that cross module boundaries: orchestration
//! invariant violations and audit-integrity violations crash, checkpoint
//! corruption refuses resume, and config/source-field errors surface at
//! construction time.

// ============================================================================
// SECTION: Imports
// ============================================================================

use thiserror::Error;

// ============================================================================
// SECTION: Error Types
// ============================================================================

/// A bug in the orchestrator's own sequencing, such as executing a sink
/// before assigning its node id. Never handled; the run crashes.
#[derive(Debug, Error)]
#[error("orchestration invariant violated: {message}")]
pub struct OrchestrationInvariantError {
    /// Description of the violated invariant.
    pub message: String,
}

impl OrchestrationInvariantError {
    /// Creates a new invariant error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Durable audit state violated its own schema (for example a COMPLETED
/// node state without an output hash). Readers crash rather than coerce.
#[derive(Debug, Error)]
#[error("audit integrity violation: {message}")]
pub struct AuditIntegrityError {
    /// Description of the corrupt state.
    pub message: String,
}

impl AuditIntegrityError {
    /// Creates a new audit-integrity error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Stored checkpoint or contract state failed integrity verification on
/// resume. Resume is refused; the run must be re-run from scratch.
#[derive(Debug, Error)]
#[error("checkpoint integrity verification failed for run {run_id}: {message}")]
pub struct CheckpointCorruptionError {
    /// Run whose stored state is corrupted or tampered.
    pub run_id: String,
    /// Description of the mismatch.
    pub message: String,
}

impl CheckpointCorruptionError {
    /// Creates a new corruption error.
    #[must_use]
    pub fn new(run_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            message: message.into(),
        }
    }
}

/// Plugin configuration failed validation at construction time.
#[derive(Debug, Error)]
#[error("invalid configuration for plugin '{plugin}': {message}")]
pub struct PluginConfigError {
    /// Plugin name.
    pub plugin: String,
    /// Validation failure description.
    pub message: String,
}

impl PluginConfigError {
    /// Creates a new configuration error.
    #[must_use]
    pub fn new(plugin: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            plugin: plugin.into(),
            message: message.into(),
        }
    }
}

/// A source emitted a row field absent from its own resolution map. This is
/// a source-plugin bug, not bad data, so it is raised rather than quarantined.
#[derive(Debug, Error)]
#[error("source emitted field '{field}' with no resolution map entry")]
pub struct SourceFieldError {
    /// The unresolvable original field name.
    pub field: String,
}
