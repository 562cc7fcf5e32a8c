// elspeth-core/src/interfaces/mod.rs
// ============================================================================
// Module: ELSPETH Interfaces
// Description: Plugin, payload-store, telemetry, and client trait seams.
// Purpose: Define the contract surfaces the engine consumes and exposes.
// Dependencies: crate::core
// ============================================================================

//! ## Overview
//! Interfaces define how the engine integrates with sources, transforms,
//! gates, aggregations, coalesces, sinks, payload stores, telemetry, and
//! external-call clients without embedding any concrete backend. There is no
//! global mutable state: everything a plugin may touch arrives through an
//! explicit [`PluginContext`].

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Map as JsonMap;
use serde_json::Value as JsonValue;
use serde_json::json;
use thiserror::Error;

use crate::core::contract::SchemaContract;
use crate::core::identifiers::NodeId;
use crate::core::identifiers::OperationId;
use crate::core::identifiers::RunId;
use crate::core::identifiers::StateId;
use crate::core::records::CallStatus;
use crate::core::records::CallType;
use crate::core::records::Determinism;
use crate::core::records::TriggerType;
use crate::core::results::ArtifactDescriptor;
use crate::core::results::GateResult;
use crate::core::results::OutputValidationResult;
use crate::core::results::TransformResult;
use crate::core::row::PipelineRow;
use crate::core::row::SourceRow;
use crate::core::value::RowData;

// ============================================================================
// SECTION: Plugin Context
// ============================================================================

/// Context handed to every plugin invocation.
///
/// # Invariants
/// - `state_id` and `operation_id` are never both set: call attribution is
///   exclusive (the XOR constraint on the calls table).
/// - `node_id` is set by the orchestrator before any execution; executors
///   treat a missing id as an orchestration bug.
#[derive(Debug, Clone)]
pub struct PluginContext {
    /// Run scope.
    pub run_id: RunId,
    /// Node being executed, once assigned by the orchestrator.
    pub node_id: Option<NodeId>,
    /// Node state for per-token call attribution.
    pub state_id: Option<StateId>,
    /// Operation for batch-level call attribution.
    pub operation_id: Option<OperationId>,
    /// Contract in force for the current rows.
    pub contract: Option<Arc<SchemaContract>>,
    /// Plugin configuration as resolved JSON.
    pub config: JsonValue,
}

impl PluginContext {
    /// Creates a context scoped to a run with the given plugin config.
    #[must_use]
    pub const fn new(run_id: RunId, config: JsonValue) -> Self {
        Self {
            run_id,
            node_id: None,
            state_id: None,
            operation_id: None,
            contract: None,
            config,
        }
    }
}

// ============================================================================
// SECTION: Plugin Error
// ============================================================================

/// Typed failure raised by a plugin invocation.
///
/// Retry discrimination inspects `retryable` and `status_code`; it never
/// matches on message text.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{error_type}: {message}")]
pub struct PluginError {
    /// Error type name for taxonomy queries and audit records.
    pub error_type: String,
    /// Human-readable failure text.
    pub message: String,
    /// Whether the pooled executor may retry the row.
    pub retryable: bool,
    /// Upstream status code for capacity-style errors (429, 5xx).
    pub status_code: Option<u16>,
}

impl PluginError {
    /// Creates a permanent (non-retryable) error.
    #[must_use]
    pub fn permanent(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
            retryable: false,
            status_code: None,
        }
    }

    /// Creates a retryable error.
    #[must_use]
    pub fn retryable(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
            retryable: true,
            status_code: None,
        }
    }

    /// Creates a capacity error carrying the upstream status code.
    #[must_use]
    pub fn capacity(status_code: u16, message: impl Into<String>) -> Self {
        Self {
            error_type: "CapacityError".to_string(),
            message: message.into(),
            retryable: true,
            status_code: Some(status_code),
        }
    }
}

// ============================================================================
// SECTION: Plugin Traits
// ============================================================================

/// Boxed record iterator returned by [`SourcePlugin::load`].
pub type SourceRowIter<'a> = Box<dyn Iterator<Item = Result<SourceRow, PluginError>> + 'a>;

/// A source plugin: emits rows into the pipeline.
pub trait SourcePlugin {
    /// Stable plugin name.
    fn name(&self) -> &str;

    /// Plugin version string.
    fn plugin_version(&self) -> &str;

    /// Determinism classification; sources read external state.
    fn determinism(&self) -> Determinism {
        Determinism::IoRead
    }

    /// The source's output contract (unlocked until the first row for
    /// `FLEXIBLE`/`OBSERVED` modes).
    fn output_contract(&self) -> &SchemaContract;

    /// Called before loading begins; may read resume state from the context.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError`] when startup fails.
    fn on_start(&mut self, _ctx: &PluginContext) -> Result<(), PluginError> {
        Ok(())
    }

    /// Opens the source and returns its row iterator.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError`] when the source cannot be opened.
    fn load<'a>(&'a mut self, ctx: &PluginContext) -> Result<SourceRowIter<'a>, PluginError>;

    /// Releases source resources. Idempotent.
    fn close(&mut self);
}

/// A transform plugin: rewrites one row at a time.
pub trait TransformPlugin: Send + Sync {
    /// Stable plugin name.
    fn name(&self) -> &str;

    /// Plugin version string.
    fn plugin_version(&self) -> &str;

    /// Determinism classification.
    fn determinism(&self) -> Determinism {
        Determinism::Deterministic
    }

    /// Applies the transform to one row.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError`] for infrastructure failures; data-level
    /// failures are [`TransformResult::Error`] values.
    fn apply(&self, row: &PipelineRow, ctx: &PluginContext) -> Result<TransformResult, PluginError>;

    /// The transform's output contract given its input contract.
    ///
    /// The default is shape-preserving; schema-evolving transforms override.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError`] when the input contract is unacceptable.
    fn output_contract(&self, input: &SchemaContract) -> Result<SchemaContract, PluginError> {
        Ok(input.clone())
    }
}

/// A gate plugin: routes tokens between paths.
pub trait GatePlugin: Send + Sync {
    /// Stable plugin name.
    fn name(&self) -> &str;

    /// Plugin version string.
    fn plugin_version(&self) -> &str;

    /// Determinism classification.
    fn determinism(&self) -> Determinism {
        Determinism::Deterministic
    }

    /// Evaluates the gate for one row.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError`] when evaluation fails.
    fn evaluate(&self, row: &PipelineRow, ctx: &PluginContext) -> Result<GateResult, PluginError>;
}

/// An aggregation plugin: collects rows and flushes batches.
pub trait AggregationPlugin: Send {
    /// Stable plugin name.
    fn name(&self) -> &str;

    /// Plugin version string.
    fn plugin_version(&self) -> &str;

    /// Determinism classification.
    fn determinism(&self) -> Determinism {
        Determinism::Deterministic
    }

    /// Accumulates one row into the pending batch.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError`] when accumulation fails.
    fn accumulate(&mut self, row: &PipelineRow, ctx: &PluginContext) -> Result<(), PluginError>;

    /// Whether the pending batch should flush now, and why.
    fn should_flush(&self) -> Option<TriggerType>;

    /// Flushes the pending batch into one output row.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError`] when the flush fails.
    fn flush(&mut self, ctx: &PluginContext) -> Result<TransformResult, PluginError>;

    /// Number of rows currently accumulated.
    fn pending_len(&self) -> usize;
}

/// A coalesce plugin: merges forked paths back into one row stream.
pub trait CoalescePlugin: Send + Sync {
    /// Stable plugin name.
    fn name(&self) -> &str;

    /// Plugin version string.
    fn plugin_version(&self) -> &str;

    /// Merges the rows arriving from forked paths for one token family.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError`] when the merge policy cannot combine the rows.
    fn merge(&self, rows: &[PipelineRow], ctx: &PluginContext) -> Result<RowData, PluginError>;
}

/// A sink plugin: writes rows durably and describes the artifact produced.
pub trait SinkPlugin {
    /// Stable plugin name.
    fn name(&self) -> &str;

    /// Plugin version string.
    fn plugin_version(&self) -> &str;

    /// Determinism classification; sinks write external state.
    fn determinism(&self) -> Determinism {
        Determinism::IoWrite
    }

    /// Writes a batch of rows, returning the artifact descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError`] when the write fails.
    fn write(
        &mut self,
        rows: &[RowData],
        ctx: &PluginContext,
    ) -> Result<ArtifactDescriptor, PluginError>;

    /// Forces written data to durable storage (flush plus fsync).
    ///
    /// # Errors
    ///
    /// Returns [`PluginError`] when durability cannot be guaranteed.
    fn flush(&mut self) -> Result<(), PluginError>;

    /// Releases sink resources. Idempotent.
    fn close(&mut self);

    /// Switches the sink into append mode ahead of a resume.
    fn configure_for_resume(&mut self) {}

    /// Inspects the external target for contract compatibility.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError`] when the target cannot be inspected.
    fn validate_output_target(&self) -> Result<OutputValidationResult, PluginError> {
        Ok(OutputValidationResult::success(Vec::new()))
    }

    /// Supplies the normalized-to-original header mapping before resume
    /// validation, for sinks that restore display headers.
    fn set_resume_field_resolution(&mut self, _resolution: BTreeMap<String, String>) {}
}

// ============================================================================
// SECTION: Payload Store
// ============================================================================

/// Payload store errors.
#[derive(Debug, Error)]
pub enum PayloadStoreError {
    /// Underlying I/O failed.
    #[error("payload store io error: {0}")]
    Io(String),
}

/// Content-addressed store for full request/response and row payloads.
///
/// Writes are idempotent: the same hash always maps to the same bytes.
/// Purging payloads never deletes the referencing hash in the audit row.
pub trait PayloadStore: Send + Sync {
    /// Stores bytes under their stable hash.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadStoreError`] when the write fails.
    fn put(&self, hash: &str, bytes: &[u8]) -> Result<(), PayloadStoreError>;

    /// Fetches bytes by hash; `None` when absent or purged.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadStoreError`] when the read fails.
    fn get(&self, hash: &str) -> Result<Option<Vec<u8>>, PayloadStoreError>;

    /// Whether a payload is currently present.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadStoreError`] when the check fails.
    fn contains(&self, hash: &str) -> Result<bool, PayloadStoreError>;
}

// ============================================================================
// SECTION: Telemetry
// ============================================================================

/// Telemetry sink errors. Failures are logged by callers, never re-raised
/// into the audit path.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Exporter reported an error.
    #[error("telemetry sink error: {0}")]
    Sink(String),
}

/// Event emitted after an external call has been durably recorded.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalCallCompleted {
    /// Run scope.
    pub run_id: RunId,
    /// Node state or operation the call was attributed to.
    pub state_id: StateId,
    /// Per-state call index.
    pub call_index: i64,
    /// Kind of call.
    pub call_type: CallType,
    /// Outcome.
    pub status: CallStatus,
    /// Wall latency in milliseconds.
    pub latency_ms: f64,
}

/// Telemetry events the core emits.
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryEvent {
    /// An external call completed and was recorded.
    ExternalCallCompleted(ExternalCallCompleted),
}

/// Dependency-light telemetry sink; exporters plug in downstream.
pub trait TelemetrySink: Send + Sync {
    /// Records a telemetry event.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError`] when the exporter fails; callers log and
    /// continue because the audit record has precedence.
    fn record(&self, event: &TelemetryEvent) -> Result<(), TelemetryError>;
}

/// Telemetry sink that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTelemetrySink;

impl TelemetrySink for NoopTelemetrySink {
    fn record(&self, _event: &TelemetryEvent) -> Result<(), TelemetryError> {
        Ok(())
    }
}

// ============================================================================
// SECTION: LLM Client
// ============================================================================

/// Canonical request to an LLM-style external service.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmRequest {
    /// Model identifier.
    pub model: String,
    /// Prompt text.
    pub prompt: String,
    /// Additional request parameters.
    pub params: JsonMap<String, JsonValue>,
}

impl LlmRequest {
    /// Creates a request with no extra parameters.
    #[must_use]
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            prompt: prompt.into(),
            params: JsonMap::new(),
        }
    }

    /// Canonical JSON object for hashing and replay lookup.
    #[must_use]
    pub fn to_canonical(&self) -> JsonValue {
        json!({
            "model": self.model,
            "prompt": self.prompt,
            "params": JsonValue::Object(self.params.clone()),
        })
    }
}

/// Response from an LLM-style external service.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmResponse {
    /// Generated content.
    pub content: String,
    /// Model that answered.
    pub model: String,
    /// Token usage counters.
    pub usage: BTreeMap<String, i64>,
    /// Wall latency in milliseconds as measured by the caller.
    pub latency_ms: f64,
}

impl LlmResponse {
    /// Total tokens across prompt and completion, zero when unreported.
    #[must_use]
    pub fn total_tokens(&self) -> i64 {
        self.usage.get("prompt_tokens").copied().unwrap_or(0)
            + self.usage.get("completion_tokens").copied().unwrap_or(0)
    }

    /// Canonical JSON object for hashing and payload storage.
    #[must_use]
    pub fn to_canonical(&self) -> JsonValue {
        json!({
            "content": self.content,
            "model": self.model,
            "usage": self.usage,
        })
    }
}

/// An external-call client the audited wrapper can decorate.
pub trait LlmClient: Send + Sync {
    /// Stable client name for diagnostics.
    fn client_name(&self) -> &str;

    /// Performs one completion call.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError`] with retryability classified by the concrete
    /// client's taxonomy.
    fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, PluginError>;
}
