// elspeth-core/src/core/records.rs
// ============================================================================
// Module: ELSPETH Audit Records
// Description: Typed audit entities stored in the landscape.
// Purpose: Model runs, tokens, node states, calls, and outcomes with strict enums.
// Dependencies: serde, time, crate::core::{errors, identifiers}
// ============================================================================

//! ## Overview
//! Every durable entity of the audit trail is a typed record here. Enums are
//! stored as string literals at the database boundary, but readers always
//! reconstruct the enum and refuse unknown literals; a string where an enum
//! is expected is a caller bug. [`NodeState`] is a tagged sum so the
//! required-by-status field table is enforced by construction, not by
//! convention.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Deserialize;
use serde::Serialize;
use time::OffsetDateTime;

use crate::core::errors::AuditIntegrityError;
use crate::core::identifiers::ArtifactId;
use crate::core::identifiers::BatchId;
use crate::core::identifiers::CallId;
use crate::core::identifiers::CheckpointId;
use crate::core::identifiers::EdgeId;
use crate::core::identifiers::ErrorId;
use crate::core::identifiers::NodeId;
use crate::core::identifiers::OperationId;
use crate::core::identifiers::RowId;
use crate::core::identifiers::RunId;
use crate::core::identifiers::StateId;
use crate::core::identifiers::TokenId;

// ============================================================================
// SECTION: Status Enums
// ============================================================================

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    /// Run is executing.
    Running,
    /// Run finished with all tokens resolved.
    Completed,
    /// Run stopped on an unhandled error.
    Failed,
    /// Run was cancelled by the operator.
    Cancelled,
}

impl RunStatus {
    /// Returns the stable storage literal.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// Parses a stored literal, failing closed on unknown values.
    ///
    /// # Errors
    ///
    /// Returns [`AuditIntegrityError`] for unknown literals.
    pub fn parse(literal: &str) -> Result<Self, AuditIntegrityError> {
        match literal {
            "RUNNING" => Ok(Self::Running),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(AuditIntegrityError::new(format!("unknown run status literal '{other}'"))),
        }
    }
}

/// Kind of a node in the execution graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeType {
    /// Emits rows into the pipeline.
    Source,
    /// Rewrites row data.
    Transform,
    /// Routes tokens between paths.
    Gate,
    /// Collects tokens into batches.
    Aggregation,
    /// Merges forked paths back together.
    Coalesce,
    /// Writes durable artifacts.
    Sink,
}

impl NodeType {
    /// Returns the stable storage literal.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Source => "SOURCE",
            Self::Transform => "TRANSFORM",
            Self::Gate => "GATE",
            Self::Aggregation => "AGGREGATION",
            Self::Coalesce => "COALESCE",
            Self::Sink => "SINK",
        }
    }

    /// Parses a stored literal, failing closed on unknown values.
    ///
    /// # Errors
    ///
    /// Returns [`AuditIntegrityError`] for unknown literals.
    pub fn parse(literal: &str) -> Result<Self, AuditIntegrityError> {
        match literal {
            "SOURCE" => Ok(Self::Source),
            "TRANSFORM" => Ok(Self::Transform),
            "GATE" => Ok(Self::Gate),
            "AGGREGATION" => Ok(Self::Aggregation),
            "COALESCE" => Ok(Self::Coalesce),
            "SINK" => Ok(Self::Sink),
            other => Err(AuditIntegrityError::new(format!("unknown node type literal '{other}'"))),
        }
    }
}

/// Determinism classification of a plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Determinism {
    /// Same input always yields the same output.
    Deterministic,
    /// Output may vary between invocations.
    Nondeterministic,
    /// Reads external state.
    IoRead,
    /// Writes external state.
    IoWrite,
}

impl Determinism {
    /// Returns the stable storage literal.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Deterministic => "DETERMINISTIC",
            Self::Nondeterministic => "NONDETERMINISTIC",
            Self::IoRead => "IO_READ",
            Self::IoWrite => "IO_WRITE",
        }
    }

    /// Parses a stored literal, failing closed on unknown values.
    ///
    /// # Errors
    ///
    /// Returns [`AuditIntegrityError`] for unknown literals.
    pub fn parse(literal: &str) -> Result<Self, AuditIntegrityError> {
        match literal {
            "DETERMINISTIC" => Ok(Self::Deterministic),
            "NONDETERMINISTIC" => Ok(Self::Nondeterministic),
            "IO_READ" => Ok(Self::IoRead),
            "IO_WRITE" => Ok(Self::IoWrite),
            other => {
                Err(AuditIntegrityError::new(format!("unknown determinism literal '{other}'")))
            }
        }
    }
}

/// Status of one node-state attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStateStatus {
    /// State opened; plugin not yet finished.
    Open,
    /// Plugin finished; output not yet durable (batch members awaiting flush).
    Pending,
    /// State completed with an output hash.
    Completed,
    /// State failed with a structured error.
    Failed,
}

impl NodeStateStatus {
    /// Returns the stable storage literal.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Pending => "PENDING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    /// Parses a stored literal, failing closed on unknown values.
    ///
    /// # Errors
    ///
    /// Returns [`AuditIntegrityError`] for unknown literals.
    pub fn parse(literal: &str) -> Result<Self, AuditIntegrityError> {
        match literal {
            "OPEN" => Ok(Self::Open),
            "PENDING" => Ok(Self::Pending),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            other => {
                Err(AuditIntegrityError::new(format!("unknown node state literal '{other}'")))
            }
        }
    }
}

/// Mode of an edge traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoutingMode {
    /// Token leaves the predecessor and arrives at the successor.
    Move,
    /// Token is duplicated down multiple paths.
    Copy,
    /// Token leaves the main path into an error or quarantine sink.
    Divert,
}

impl RoutingMode {
    /// Returns the stable storage literal.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Move => "MOVE",
            Self::Copy => "COPY",
            Self::Divert => "DIVERT",
        }
    }

    /// Parses a stored literal, failing closed on unknown values.
    ///
    /// # Errors
    ///
    /// Returns [`AuditIntegrityError`] for unknown literals.
    pub fn parse(literal: &str) -> Result<Self, AuditIntegrityError> {
        match literal {
            "MOVE" => Ok(Self::Move),
            "COPY" => Ok(Self::Copy),
            "DIVERT" => Ok(Self::Divert),
            other => {
                Err(AuditIntegrityError::new(format!("unknown routing mode literal '{other}'")))
            }
        }
    }
}

/// Outcome of an external call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallStatus {
    /// Call succeeded with a recorded response.
    Success,
    /// Call failed with a structured error.
    Error,
}

impl CallStatus {
    /// Returns the stable storage literal.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Error => "ERROR",
        }
    }

    /// Parses a stored literal, failing closed on unknown values.
    ///
    /// # Errors
    ///
    /// Returns [`AuditIntegrityError`] for unknown literals.
    pub fn parse(literal: &str) -> Result<Self, AuditIntegrityError> {
        match literal {
            "SUCCESS" => Ok(Self::Success),
            "ERROR" => Ok(Self::Error),
            other => {
                Err(AuditIntegrityError::new(format!("unknown call status literal '{other}'")))
            }
        }
    }
}

/// Kind of external call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallType {
    /// Large-language-model invocation.
    Llm,
    /// Plain HTTP call.
    Http,
}

impl CallType {
    /// Returns the stable storage literal.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Llm => "LLM",
            Self::Http => "HTTP",
        }
    }

    /// Parses a stored literal, failing closed on unknown values.
    ///
    /// # Errors
    ///
    /// Returns [`AuditIntegrityError`] for unknown literals.
    pub fn parse(literal: &str) -> Result<Self, AuditIntegrityError> {
        match literal {
            "LLM" => Ok(Self::Llm),
            "HTTP" => Ok(Self::Http),
            other => Err(AuditIntegrityError::new(format!("unknown call type literal '{other}'"))),
        }
    }
}

/// Terminal disposition of a token. Exactly one per token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenOutcomeKind {
    /// Token reached a sink and its data is durable.
    Completed,
    /// Token was diverted to a named sink.
    Routed,
    /// Token forked into children; the parent identity ends here.
    Forked,
    /// Token was consumed into an aggregation batch.
    ConsumedInBatch,
    /// Token was merged away by a coalesce node.
    Coalesced,
    /// Token was quarantined with an error hash.
    Quarantined,
    /// Token failed terminally.
    Failed,
}

impl TokenOutcomeKind {
    /// Returns the stable storage literal.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "COMPLETED",
            Self::Routed => "ROUTED",
            Self::Forked => "FORKED",
            Self::ConsumedInBatch => "CONSUMED_IN_BATCH",
            Self::Coalesced => "COALESCED",
            Self::Quarantined => "QUARANTINED",
            Self::Failed => "FAILED",
        }
    }

    /// Parses a stored literal, failing closed on unknown values.
    ///
    /// # Errors
    ///
    /// Returns [`AuditIntegrityError`] for unknown literals.
    pub fn parse(literal: &str) -> Result<Self, AuditIntegrityError> {
        match literal {
            "COMPLETED" => Ok(Self::Completed),
            "ROUTED" => Ok(Self::Routed),
            "FORKED" => Ok(Self::Forked),
            "CONSUMED_IN_BATCH" => Ok(Self::ConsumedInBatch),
            "COALESCED" => Ok(Self::Coalesced),
            "QUARANTINED" => Ok(Self::Quarantined),
            "FAILED" => Ok(Self::Failed),
            other => {
                Err(AuditIntegrityError::new(format!("unknown token outcome literal '{other}'")))
            }
        }
    }
}

/// Lifecycle status of an aggregation batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchStatus {
    /// Still collecting members.
    Draft,
    /// Flush in progress.
    Executing,
    /// Flush completed.
    Completed,
    /// Flush failed; eligible for retry.
    Failed,
}

impl BatchStatus {
    /// Returns the stable storage literal.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "DRAFT",
            Self::Executing => "EXECUTING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    /// Parses a stored literal, failing closed on unknown values.
    ///
    /// # Errors
    ///
    /// Returns [`AuditIntegrityError`] for unknown literals.
    pub fn parse(literal: &str) -> Result<Self, AuditIntegrityError> {
        match literal {
            "DRAFT" => Ok(Self::Draft),
            "EXECUTING" => Ok(Self::Executing),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            other => {
                Err(AuditIntegrityError::new(format!("unknown batch status literal '{other}'")))
            }
        }
    }
}

/// What triggered an aggregation flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerType {
    /// Batch reached its configured size.
    Count,
    /// Batch aged out.
    Timeout,
    /// Source exhausted; final flush.
    EndOfInput,
}

impl TriggerType {
    /// Returns the stable storage literal.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Count => "COUNT",
            Self::Timeout => "TIMEOUT",
            Self::EndOfInput => "END_OF_INPUT",
        }
    }

    /// Parses a stored literal, failing closed on unknown values.
    ///
    /// # Errors
    ///
    /// Returns [`AuditIntegrityError`] for unknown literals.
    pub fn parse(literal: &str) -> Result<Self, AuditIntegrityError> {
        match literal {
            "COUNT" => Ok(Self::Count),
            "TIMEOUT" => Ok(Self::Timeout),
            "END_OF_INPUT" => Ok(Self::EndOfInput),
            other => {
                Err(AuditIntegrityError::new(format!("unknown trigger type literal '{other}'")))
            }
        }
    }
}

/// Export state of a run's audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExportStatus {
    /// Export has not been attempted.
    Pending,
    /// Export completed.
    Exported,
    /// Export failed; the run row carries the error.
    Failed,
}

impl ExportStatus {
    /// Returns the stable storage literal.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Exported => "EXPORTED",
            Self::Failed => "FAILED",
        }
    }

    /// Parses a stored literal, failing closed on unknown values.
    ///
    /// # Errors
    ///
    /// Returns [`AuditIntegrityError`] for unknown literals.
    pub fn parse(literal: &str) -> Result<Self, AuditIntegrityError> {
        match literal {
            "PENDING" => Ok(Self::Pending),
            "EXPORTED" => Ok(Self::Exported),
            "FAILED" => Ok(Self::Failed),
            other => {
                Err(AuditIntegrityError::new(format!("unknown export status literal '{other}'")))
            }
        }
    }
}

// ============================================================================
// SECTION: Run / Graph Records
// ============================================================================

/// One invocation of the engine end-to-end. Owns everything transitively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Run {
    /// Run identifier.
    pub run_id: RunId,
    /// When the run started (UTC).
    pub started_at: OffsetDateTime,
    /// When the run completed, if it has.
    pub completed_at: Option<OffsetDateTime>,
    /// Stable hash of the resolved configuration.
    pub config_hash: String,
    /// Canonical JSON of the resolved settings.
    pub settings_json: String,
    /// Canonicalization algorithm version in force for this run.
    pub canonical_version: String,
    /// Lifecycle status.
    pub status: RunStatus,
    /// Embedded run-level schema contract, once locked.
    pub schema_contract_json: Option<String>,
    /// Export state, once export has been attempted.
    pub export_status: Option<ExportStatus>,
    /// Export error, present only while `export_status` is FAILED.
    pub export_error: Option<String>,
}

/// A registered plugin instance in a run's execution graph.
///
/// Composite key `(node_id, run_id)`: the same node id may exist in many
/// runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    /// Node identifier.
    pub node_id: NodeId,
    /// Run this node belongs to.
    pub run_id: RunId,
    /// Plugin name.
    pub plugin_name: String,
    /// Node kind.
    pub node_type: NodeType,
    /// Plugin version string.
    pub plugin_version: String,
    /// Determinism classification.
    pub determinism: Determinism,
    /// Stable hash of the node configuration.
    pub config_hash: String,
    /// Canonical JSON of the node configuration.
    pub config_json: String,
    /// Optional declared schema hash.
    pub schema_hash: Option<String>,
    /// Position in the pipeline, when topologically assigned.
    pub sequence_in_pipeline: Option<i64>,
    /// Schema mode literal recorded for audit.
    pub schema_mode: String,
    /// Declared schema fields, when not observed.
    pub schema_fields_json: Option<String>,
    /// Input contract audit JSON, when declared.
    pub input_contract_json: Option<String>,
    /// Output contract audit JSON; mutable via first-row inference and
    /// transform-driven evolution only.
    pub output_contract_json: Option<String>,
    /// Registration time (UTC).
    pub registered_at: OffsetDateTime,
}

/// A directed edge in a run's execution graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    /// Edge identifier.
    pub edge_id: EdgeId,
    /// Run this edge belongs to.
    pub run_id: RunId,
    /// Source node.
    pub from_node_id: NodeId,
    /// Destination node.
    pub to_node_id: NodeId,
    /// Edge label: `continue`, a route name, or a divert label.
    pub label: String,
    /// Default traversal mode.
    pub default_mode: RoutingMode,
    /// Registration time (UTC).
    pub created_at: OffsetDateTime,
}

// ============================================================================
// SECTION: Row / Token Records
// ============================================================================

/// A source-originated record. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowRecord {
    /// Row identifier.
    pub row_id: RowId,
    /// Run this row belongs to.
    pub run_id: RunId,
    /// Source node that emitted the row.
    pub source_node_id: NodeId,
    /// Zero-based index in source order.
    pub row_index: i64,
    /// Stable hash of the normalized row payload.
    pub source_data_hash: String,
    /// Creation time (UTC).
    pub created_at: OffsetDateTime,
}

/// The in-flight identity of one row at one DAG position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    /// Token identifier.
    pub token_id: TokenId,
    /// Row this token descends from.
    pub row_id: RowId,
    /// Creation time (UTC).
    pub created_at: OffsetDateTime,
    /// Current step in the pipeline, when assigned.
    pub step_in_pipeline: Option<i64>,
}

// ============================================================================
// SECTION: Node State
// ============================================================================

/// Fields shared by every node-state status.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeStateCore {
    /// State identifier.
    pub state_id: StateId,
    /// Token being executed.
    pub token_id: TokenId,
    /// Node being executed.
    pub node_id: NodeId,
    /// Run scope.
    pub run_id: RunId,
    /// Step index recorded for this execution.
    pub step_index: i64,
    /// Attempt number, starting at zero.
    pub attempt: i64,
    /// Stable hash of the input payload.
    pub input_hash: String,
    /// When the state was opened (UTC).
    pub started_at: OffsetDateTime,
    /// Optional context snapshot before execution.
    pub context_before_json: Option<String>,
}

/// The execution record of one token entering one node, one attempt.
///
/// The variant enforces the required-by-status field table: a reader that
/// finds a stored row violating it must crash with an audit-integrity error
/// rather than coerce.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeState {
    /// State opened; plugin still running.
    Open {
        /// Shared fields.
        core: NodeStateCore,
    },
    /// Plugin finished; durability pending (aggregation members).
    Pending {
        /// Shared fields.
        core: NodeStateCore,
        /// Elapsed milliseconds attributed to this token.
        duration_ms: f64,
        /// When the state left OPEN (UTC).
        completed_at: OffsetDateTime,
    },
    /// Completed with a durable output.
    Completed {
        /// Shared fields.
        core: NodeStateCore,
        /// Stable hash of the output payload.
        output_hash: String,
        /// Elapsed milliseconds attributed to this token.
        duration_ms: f64,
        /// When the state completed (UTC).
        completed_at: OffsetDateTime,
        /// Optional context snapshot after execution.
        context_after_json: Option<String>,
        /// Optional structured success reason.
        success_reason_json: Option<String>,
    },
    /// Failed with a structured error.
    Failed {
        /// Shared fields.
        core: NodeStateCore,
        /// Partial output hash, when any output was produced.
        output_hash: Option<String>,
        /// Elapsed milliseconds attributed to this token.
        duration_ms: f64,
        /// When the state failed (UTC).
        completed_at: OffsetDateTime,
        /// Structured execution error JSON.
        error_json: String,
    },
}

impl NodeState {
    /// Shared fields regardless of status.
    #[must_use]
    pub const fn core(&self) -> &NodeStateCore {
        match self {
            Self::Open { core }
            | Self::Pending { core, .. }
            | Self::Completed { core, .. }
            | Self::Failed { core, .. } => core,
        }
    }

    /// The state identifier.
    #[must_use]
    pub const fn state_id(&self) -> &StateId {
        &self.core().state_id
    }

    /// The status discriminant.
    #[must_use]
    pub const fn status(&self) -> NodeStateStatus {
        match self {
            Self::Open { .. } => NodeStateStatus::Open,
            Self::Pending { .. } => NodeStateStatus::Pending,
            Self::Completed { .. } => NodeStateStatus::Completed,
            Self::Failed { .. } => NodeStateStatus::Failed,
        }
    }

    /// Output hash for completed states, partial hash for failed ones.
    #[must_use]
    pub fn output_hash(&self) -> Option<&str> {
        match self {
            Self::Open { .. } | Self::Pending { .. } => None,
            Self::Completed { output_hash, .. } => Some(output_hash),
            Self::Failed { output_hash, .. } => output_hash.as_deref(),
        }
    }
}

// ============================================================================
// SECTION: Routing / Call Records
// ============================================================================

/// One recorded edge traversal by a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingEvent {
    /// Node state during which the traversal happened.
    pub state_id: StateId,
    /// Edge traversed.
    pub edge_id: EdgeId,
    /// Traversal mode.
    pub mode: RoutingMode,
    /// Stable hash of the routing reason, for DIVERT edges.
    pub reason_hash: Option<String>,
    /// Event time (UTC).
    pub created_at: OffsetDateTime,
}

/// One recorded external side effect.
///
/// Payloads live in the content-addressed payload store; the row stores only
/// hashes. Attribution is exclusive: exactly one of `state_id` and
/// `operation_id` is set, never both.
#[derive(Debug, Clone, PartialEq)]
pub struct CallRecord {
    /// Call identifier.
    pub call_id: CallId,
    /// Node state the call is attributed to, for per-token calls.
    pub state_id: Option<StateId>,
    /// Operation the call is attributed to, for batch-level calls.
    pub operation_id: Option<OperationId>,
    /// Monotonic per-state index allocated by the recorder.
    pub call_index: i64,
    /// Kind of call.
    pub call_type: CallType,
    /// Outcome.
    pub status: CallStatus,
    /// Stable hash of the canonical request.
    pub request_hash: String,
    /// Stable hash of the canonical response, on success.
    pub response_hash: Option<String>,
    /// Wall latency in milliseconds, measured monotonically.
    pub latency_ms: f64,
    /// Record time (UTC).
    pub created_at: OffsetDateTime,
    /// Structured error JSON, on failure.
    pub error_json: Option<String>,
}

/// An operation record grouping calls made during a node-level operation
/// such as a sink write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationRecord {
    /// Operation identifier.
    pub operation_id: OperationId,
    /// Run scope.
    pub run_id: RunId,
    /// Node performing the operation.
    pub node_id: NodeId,
    /// Operation type literal (for example `sink_write`).
    pub operation_type: String,
    /// Stable hash of the operation input summary.
    pub input_hash: String,
    /// Stable hash of the operation output summary, when finished.
    pub output_hash: Option<String>,
    /// Start time (UTC).
    pub started_at: OffsetDateTime,
    /// Completion time (UTC), when finished.
    pub completed_at: Option<OffsetDateTime>,
}

// ============================================================================
// SECTION: Artifact / Outcome Records
// ============================================================================

/// A durable, content-hashed output written by a sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// Artifact identifier.
    pub artifact_id: ArtifactId,
    /// Run scope.
    pub run_id: RunId,
    /// First node state of the write that produced the artifact.
    pub produced_by_state_id: StateId,
    /// Sink node that wrote it.
    pub sink_node_id: NodeId,
    /// Artifact type literal (for example `csv`).
    pub artifact_type: String,
    /// Path or URI of the artifact.
    pub path_or_uri: String,
    /// SHA-256 of the final bytes.
    pub content_hash: String,
    /// Size in bytes.
    pub size_bytes: i64,
    /// Optional retry-deduplication key.
    pub idempotency_key: Option<String>,
    /// Registration time (UTC), after durable flush.
    pub created_at: OffsetDateTime,
}

/// The single terminal disposition of a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenOutcome {
    /// Token identifier.
    pub token_id: TokenId,
    /// Run scope.
    pub run_id: RunId,
    /// Terminal disposition.
    pub outcome: TokenOutcomeKind,
    /// Sink name for COMPLETED/ROUTED/QUARANTINED outcomes.
    pub sink_name: Option<String>,
    /// Stable hash of the terminal error, when present.
    pub error_hash: Option<String>,
    /// Record time (UTC).
    pub created_at: OffsetDateTime,
}

// ============================================================================
// SECTION: Batch Records
// ============================================================================

/// One aggregation batch attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    /// Batch identifier.
    pub batch_id: BatchId,
    /// Run scope.
    pub run_id: RunId,
    /// Aggregation node collecting the batch.
    pub aggregation_node_id: NodeId,
    /// Attempt number; retries copy members into a fresh batch.
    pub attempt: i64,
    /// Lifecycle status.
    pub status: BatchStatus,
    /// What triggered the flush, once triggered.
    pub trigger_type: Option<TriggerType>,
    /// Human-readable trigger reason.
    pub trigger_reason: Option<String>,
    /// Node state recorded for the flush, once executing.
    pub aggregation_state_id: Option<StateId>,
    /// Creation time (UTC).
    pub created_at: OffsetDateTime,
    /// Completion time (UTC), once terminal.
    pub completed_at: Option<OffsetDateTime>,
}

/// Membership of a token in a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchMember {
    /// Batch identifier.
    pub batch_id: BatchId,
    /// Member token.
    pub token_id: TokenId,
    /// Order within the batch.
    pub ordinal: i64,
}

// ============================================================================
// SECTION: Error Event Records
// ============================================================================

/// An append-only record of a quarantined row's validation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationErrorRecord {
    /// Hash-derived error identifier.
    pub error_id: ErrorId,
    /// Run scope.
    pub run_id: RunId,
    /// Token the error refers to; must exist.
    pub token_id: TokenId,
    /// Node where validation failed; must exist.
    pub node_id: NodeId,
    /// Serialized violations.
    pub violations_json: String,
    /// Stable hash of the violation payload.
    pub error_hash: String,
    /// Record time (UTC).
    pub created_at: OffsetDateTime,
}

/// An append-only record of a transform-level failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformErrorRecord {
    /// Hash-derived error identifier.
    pub error_id: ErrorId,
    /// Run scope.
    pub run_id: RunId,
    /// Token the error refers to; must exist.
    pub token_id: TokenId,
    /// Node where the transform failed; must exist.
    pub node_id: NodeId,
    /// Node state of the failing attempt, when one was opened.
    pub state_id: Option<StateId>,
    /// Structured execution error JSON.
    pub error_json: String,
    /// Stable hash of the error payload.
    pub error_hash: String,
    /// Record time (UTC).
    pub created_at: OffsetDateTime,
}

// ============================================================================
// SECTION: Checkpoint Record
// ============================================================================

/// A durability marker: token T has been through sink node N and the sink's
/// effects are durable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    /// Checkpoint identifier (`cp-` + 32 hex).
    pub checkpoint_id: CheckpointId,
    /// Run scope.
    pub run_id: RunId,
    /// Durable token.
    pub token_id: TokenId,
    /// Sink node the token passed through.
    pub node_id: NodeId,
    /// Strictly increasing sequence within the run.
    pub sequence_number: i64,
    /// Fingerprint of the graph in force when the checkpoint was written.
    pub graph_fingerprint: String,
    /// Record time (UTC).
    pub created_at: OffsetDateTime,
}
