// elspeth-core/src/core/results.rs
// ============================================================================
// Module: ELSPETH Plugin Results
// Description: Typed results returned by transforms, gates, and sinks.
// Purpose: Carry success/error reasons and routing actions without coercion.
// Dependencies: serde, serde_json, crate::core
// ============================================================================

//! ## Overview
//! Plugins answer with typed results: a transform says what it produced and
//! why, a gate additionally says where the token goes next, a sink describes
//! the artifact it wrote. Reasons are plain JSON maps so they canonicalize
//! and hash like any other payload; routing reasons are deep-copied at
//! construction so later mutation cannot leak into recorded events.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Deserialize;
use serde::Serialize;
use serde_json::Map as JsonMap;
use serde_json::Value as JsonValue;

use crate::core::records::RoutingMode;
use crate::core::records::TokenOutcomeKind;
use crate::core::value::RowData;

// ============================================================================
// SECTION: Execution Error
// ============================================================================

/// Structured error recorded when a plugin invocation fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionError {
    /// Human-readable failure text.
    pub message: String,
    /// Error type name for taxonomy queries.
    pub error_type: String,
    /// Execution phase when distinct from the plugin call itself
    /// (for example `flush` or `contract_merge`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
}

impl ExecutionError {
    /// Creates an error for the plugin-call phase.
    #[must_use]
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: error_type.into(),
            phase: None,
        }
    }

    /// Creates an error attributed to a named phase.
    #[must_use]
    pub fn in_phase(
        error_type: impl Into<String>,
        message: impl Into<String>,
        phase: impl Into<String>,
    ) -> Self {
        Self {
            message: message.into(),
            error_type: error_type.into(),
            phase: Some(phase.into()),
        }
    }

    /// Serializes the error for audit storage.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!("{{\"error_type\":\"{}\",\"message\":\"unserializable\"}}", self.error_type)
        })
    }
}

// ============================================================================
// SECTION: Transform Result
// ============================================================================

/// Result of one transform invocation for one row.
#[derive(Debug, Clone, PartialEq)]
pub enum TransformResult {
    /// Transform produced an output row.
    Success {
        /// Output row data.
        data: RowData,
        /// What the transform did, for the audit trail.
        success_reason: JsonMap<String, JsonValue>,
    },
    /// Transform failed for this row.
    Error {
        /// Why it failed, as a canonicalizable map.
        reason: JsonMap<String, JsonValue>,
    },
}

impl TransformResult {
    /// Creates a success result.
    #[must_use]
    pub fn success(data: RowData, success_reason: JsonMap<String, JsonValue>) -> Self {
        Self::Success {
            data,
            success_reason,
        }
    }

    /// Creates an error result.
    #[must_use]
    pub fn error(reason: JsonMap<String, JsonValue>) -> Self {
        Self::Error {
            reason,
        }
    }

    /// Returns true for success results.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// The error reason, when this is an error result.
    #[must_use]
    pub const fn reason(&self) -> Option<&JsonMap<String, JsonValue>> {
        match self {
            Self::Success { .. } => None,
            Self::Error { reason } => Some(reason),
        }
    }
}

// ============================================================================
// SECTION: Routing Action
// ============================================================================

/// What a gate decided to do with a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingActionKind {
    /// Continue along the default `continue` edge.
    Continue,
    /// Leave along one named route.
    Route,
    /// Duplicate down several named paths.
    ForkToPaths,
}

/// A gate's routing decision.
///
/// # Invariants
/// - `Continue` carries no destinations; `Route` exactly one;
///   `ForkToPaths` at least one.
/// - The reason map is deep-copied at construction; callers cannot mutate a
///   recorded reason afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingAction {
    /// Decision kind.
    pub kind: RoutingActionKind,
    /// Traversal mode for the chosen edges.
    pub mode: RoutingMode,
    /// Destination labels, empty for `Continue`.
    destinations: Vec<String>,
    /// Optional routing reason.
    reason: Option<JsonMap<String, JsonValue>>,
}

impl RoutingAction {
    /// Continue along the default edge.
    #[must_use]
    pub const fn continue_flow() -> Self {
        Self {
            kind: RoutingActionKind::Continue,
            mode: RoutingMode::Move,
            destinations: Vec::new(),
            reason: None,
        }
    }

    /// Route to a single named destination.
    #[must_use]
    pub fn route(
        destination: impl Into<String>,
        reason: Option<&JsonMap<String, JsonValue>>,
    ) -> Self {
        Self {
            kind: RoutingActionKind::Route,
            mode: RoutingMode::Move,
            destinations: vec![destination.into()],
            reason: reason.cloned(),
        }
    }

    /// Fork down multiple named paths as copies.
    #[must_use]
    pub fn fork_to_paths(
        destinations: Vec<String>,
        reason: Option<&JsonMap<String, JsonValue>>,
    ) -> Self {
        Self {
            kind: RoutingActionKind::ForkToPaths,
            mode: RoutingMode::Copy,
            destinations,
            reason: reason.cloned(),
        }
    }

    /// Destination labels in decision order.
    #[must_use]
    pub fn destinations(&self) -> &[String] {
        &self.destinations
    }

    /// The routing reason, when one was given.
    #[must_use]
    pub const fn reason(&self) -> Option<&JsonMap<String, JsonValue>> {
        self.reason.as_ref()
    }
}

/// Result of one gate invocation for one row.
#[derive(Debug, Clone, PartialEq)]
pub struct GateResult {
    /// Row data leaving the gate (gates may annotate but not drop rows).
    pub data: RowData,
    /// Routing decision for the token.
    pub action: RoutingAction,
}

// ============================================================================
// SECTION: Pending Outcome
// ============================================================================

/// The terminal outcome a token will receive once its sink write is durable.
///
/// The orchestrator computes the outcome before the write (a quarantined
/// token is quarantined no matter what the sink does), but only the sink
/// executor records it, strictly after flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingOutcome {
    /// Terminal disposition to record.
    pub outcome: TokenOutcomeKind,
    /// Error hash carried through for quarantined tokens.
    pub error_hash: Option<String>,
}

impl PendingOutcome {
    /// A normal completion.
    #[must_use]
    pub const fn completed() -> Self {
        Self {
            outcome: TokenOutcomeKind::Completed,
            error_hash: None,
        }
    }

    /// A diverted completion at a named sink.
    #[must_use]
    pub const fn routed() -> Self {
        Self {
            outcome: TokenOutcomeKind::Routed,
            error_hash: None,
        }
    }

    /// A quarantined completion with the quarantine error hash.
    #[must_use]
    pub fn quarantined(error_hash: String) -> Self {
        Self {
            outcome: TokenOutcomeKind::Quarantined,
            error_hash: Some(error_hash),
        }
    }
}

// ============================================================================
// SECTION: Artifact Descriptor
// ============================================================================

/// A sink's description of the artifact it wrote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactDescriptor {
    /// Path or URI of the artifact.
    pub path_or_uri: String,
    /// Artifact type literal (for example `csv`).
    pub artifact_type: String,
    /// SHA-256 of the artifact bytes at descriptor time.
    pub content_hash: String,
    /// Size in bytes at descriptor time.
    pub size_bytes: i64,
}

impl ArtifactDescriptor {
    /// Describes a file artifact.
    #[must_use]
    pub fn for_file(
        path: impl Into<String>,
        artifact_type: impl Into<String>,
        content_hash: impl Into<String>,
        size_bytes: i64,
    ) -> Self {
        Self {
            path_or_uri: path.into(),
            artifact_type: artifact_type.into(),
            content_hash: content_hash.into(),
            size_bytes,
        }
    }
}

// ============================================================================
// SECTION: Output Validation
// ============================================================================

/// Result of a sink inspecting its external target before resume.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OutputValidationResult {
    /// Whether the target is compatible with the expected contract.
    pub valid: bool,
    /// Failure description when invalid.
    pub error_message: Option<String>,
    /// Fields found on the target.
    pub target_fields: Vec<String>,
    /// Fields the contract expects.
    pub schema_fields: Vec<String>,
    /// Expected fields missing from the target.
    pub missing_fields: Vec<String>,
    /// Target fields outside the contract.
    pub extra_fields: Vec<String>,
    /// Set when the field sets match but the order differs (FIXED mode).
    pub order_mismatch: bool,
}

impl OutputValidationResult {
    /// A compatible target.
    #[must_use]
    pub fn success(target_fields: Vec<String>) -> Self {
        Self {
            valid: true,
            target_fields,
            ..Self::default()
        }
    }

    /// An incompatible target.
    #[must_use]
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            valid: false,
            error_message: Some(message.into()),
            ..Self::default()
        }
    }
}
