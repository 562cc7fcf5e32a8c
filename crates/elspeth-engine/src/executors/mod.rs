// elspeth-engine/src/executors/mod.rs
// ============================================================================
// Module: ELSPETH Executors
// Description: Per-node-kind execution wrappers with shared audit discipline.
// Purpose: Enforce audit-before-effect around every plugin invocation.
// Dependencies: elspeth-core, elspeth-landscape
// ============================================================================

//! ## Overview
//! One executor per node kind, all upholding the same contract: open a node
//! state per input token before the plugin runs, time the plugin with the
//! monotonic clock inside a span, close every opened state (COMPLETED or
//! FAILED, durations amortized across the batch) before anything else
//! proceeds, and re-raise plugin failures for the orchestrator's `on_error`
//! policy. The sink executor additionally owns artifact registration,
//! terminal outcome recording, and the post-durability checkpoint callback.

// ============================================================================
// SECTION: Submodules
// ============================================================================

pub mod aggregation;
pub mod coalesce;
pub mod gate;
pub mod sink;
pub mod source;
pub mod transform;

// ============================================================================
// SECTION: Imports
// ============================================================================

use elspeth_core::CanonicalError;
use elspeth_core::ContractError;
use elspeth_core::ContractLockError;
use elspeth_core::GraphValidationError;
use elspeth_core::OrchestrationInvariantError;
use elspeth_core::PipelineRow;
use elspeth_core::PluginError;
use elspeth_core::TokenId;
use elspeth_core::normalize_row;
use elspeth_landscape::checkpoint::RecoveryError;
use elspeth_landscape::recorder::LandscapeError;
use serde_json::Value as JsonValue;
use thiserror::Error;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use aggregation::AggregationBatchState;
pub use aggregation::AggregationExecutor;
pub use coalesce::CoalesceExecutor;
pub use gate::GateExecution;
pub use gate::GateExecutor;
pub use gate::GateOutcome;
pub use sink::SinkExecutor;
pub use sink::TokenWrittenCallback;
pub use source::SourceExecutor;
pub use source::SourceItem;
pub use source::ValidationFailurePolicy;
pub use transform::TransformExecution;
pub use transform::TransformExecutor;

// ============================================================================
// SECTION: Engine Error
// ============================================================================

/// Errors raised by executors and the orchestrator.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Audit store failure.
    #[error(transparent)]
    Landscape(#[from] LandscapeError),
    /// Orchestrator sequencing bug; crashes the run.
    #[error(transparent)]
    Orchestration(#[from] OrchestrationInvariantError),
    /// Graph construction or fingerprinting failure.
    #[error(transparent)]
    Graph(#[from] GraphValidationError),
    /// Canonicalization failure.
    #[error(transparent)]
    Canonical(#[from] CanonicalError),
    /// Contract construction or verification failure.
    #[error(transparent)]
    Contract(#[from] ContractError),
    /// First-row contract locking failure.
    #[error(transparent)]
    ContractLock(#[from] ContractLockError),
    /// Resume verification failure.
    #[error(transparent)]
    Recovery(#[from] RecoveryError),
    /// A plugin failed and the failure was re-raised after audit closure.
    #[error("plugin '{plugin}' failed: {error}")]
    Plugin {
        /// Plugin name.
        plugin: String,
        /// The plugin's typed error.
        error: PluginError,
    },
}

// ============================================================================
// SECTION: Token Info
// ============================================================================

/// A token paired with its in-flight row.
#[derive(Debug, Clone)]
pub struct TokenInfo {
    /// Token identity.
    pub token_id: TokenId,
    /// Row carried by the token.
    pub row: PipelineRow,
}

impl TokenInfo {
    /// Creates a token/row pair.
    #[must_use]
    pub const fn new(token_id: TokenId, row: PipelineRow) -> Self {
        Self {
            token_id,
            row,
        }
    }
}

// ============================================================================
// SECTION: Shared Helpers
// ============================================================================

/// Normalizes a pipeline row's data to JSON for hashing and storage.
///
/// # Errors
///
/// Returns [`CanonicalError`] for non-canonicalizable values.
pub(crate) fn row_json(row: &PipelineRow) -> Result<JsonValue, CanonicalError> {
    normalize_row(row.data())
}

/// Amortizes a batch duration across its tokens.
#[allow(clippy::cast_precision_loss, reason = "Token counts are far below 2^52.")]
pub(crate) fn per_token_ms(total_ms: f64, token_count: usize) -> f64 {
    if token_count == 0 {
        total_ms
    } else {
        total_ms / token_count as f64
    }
}
