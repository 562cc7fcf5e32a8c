// elspeth-engine/src/executors/gate.rs
// ============================================================================
// Module: Gate Executor
// Description: Wraps gate evaluation with state and routing audit.
// Purpose: Record every routing decision against the evaluating state.
// Dependencies: elspeth-core, elspeth-landscape
// ============================================================================

//! ## Overview
//! A gate's answer carries both the (possibly annotated) row and a routing
//! action: continue, route to a named path, or fork to several. The executor
//! records the evaluation as a node state; the orchestrator resolves the
//! action's labels to edges and records the traversals against the same
//! state.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;
use std::time::Instant;

use elspeth_core::ExecutionError;
use elspeth_core::GatePlugin;
use elspeth_core::NodeId;
use elspeth_core::OrchestrationInvariantError;
use elspeth_core::PipelineRow;
use elspeth_core::PluginContext;
use elspeth_core::RoutingAction;
use elspeth_core::RunId;
use elspeth_core::StateId;
use elspeth_core::elapsed_ms;
use elspeth_core::normalize_row;
use elspeth_landscape::LandscapeRecorder;
use serde_json::Map as JsonMap;
use serde_json::Value as JsonValue;
use tracing::info_span;

use crate::executors::EngineError;
use crate::executors::TokenInfo;
use crate::executors::row_json;

// ============================================================================
// SECTION: Execution Result
// ============================================================================

/// Outcome of one gate evaluation.
#[derive(Debug, Clone)]
pub struct GateExecution {
    /// Row leaving the gate.
    pub row: PipelineRow,
    /// The gate's routing decision.
    pub action: RoutingAction,
    /// Node state recorded for the evaluation.
    pub state_id: StateId,
}

/// Result of driving one token through a gate.
#[derive(Debug, Clone)]
pub enum GateOutcome {
    /// The gate evaluated and decided a route.
    Evaluated(GateExecution),
    /// The plugin itself failed; the state is closed FAILED and the
    /// orchestrator applies the node's `on_error` policy.
    PluginFailure {
        /// The plugin's typed error.
        error: elspeth_core::PluginError,
        /// Node state recorded for the attempt.
        state_id: StateId,
    },
}

// ============================================================================
// SECTION: Gate Executor
// ============================================================================

/// Executes gates with routing-decision audit.
pub struct GateExecutor {
    /// Recorder for the audit trail.
    recorder: LandscapeRecorder,
    /// Run scope.
    run_id: RunId,
}

impl GateExecutor {
    /// Creates a gate executor for a run.
    #[must_use]
    pub const fn new(recorder: LandscapeRecorder, run_id: RunId) -> Self {
        Self {
            recorder,
            run_id,
        }
    }

    /// Evaluates a gate for one token.
    ///
    /// Plugin failures close the state FAILED and come back as
    /// [`GateOutcome::PluginFailure`] for the node's `on_error` policy.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Orchestration`] when the node id is unset and
    /// [`EngineError::Landscape`] on audit failures.
    pub fn execute(
        &self,
        gate: &dyn GatePlugin,
        token: &TokenInfo,
        ctx: &mut PluginContext,
        step_index: i64,
    ) -> Result<GateOutcome, EngineError> {
        let node_id: NodeId = ctx.node_id.clone().ok_or_else(|| {
            OrchestrationInvariantError::new(format!(
                "gate '{}' executed without node_id",
                gate.name()
            ))
        })?;

        let input = row_json(&token.row)?;
        let state = self.recorder.begin_node_state(
            &token.token_id,
            &node_id,
            &self.run_id,
            step_index,
            0,
            &input,
        )?;
        let state_id = state.state_id().clone();
        ctx.state_id = Some(state_id.clone());
        ctx.operation_id = None;
        ctx.contract = Some(Arc::clone(token.row.contract()));

        let span = info_span!("gate", gate = gate.name(), token_id = %token.token_id);
        let _guard = span.enter();

        let start = Instant::now();
        let outcome = gate.evaluate(&token.row, ctx);
        let duration_ms = elapsed_ms(start);
        ctx.state_id = None;

        match outcome {
            Err(error) => {
                let execution_error =
                    ExecutionError::new(error.error_type.clone(), error.message.clone());
                self.recorder.complete_state_failed(
                    &state_id,
                    &execution_error,
                    duration_ms,
                    None,
                )?;
                Ok(GateOutcome::PluginFailure {
                    error,
                    state_id,
                })
            }
            Ok(result) => {
                let row = token.row.with_data(result.data);
                let output = normalize_row(row.data())?;
                let mut success_reason: JsonMap<String, JsonValue> = JsonMap::new();
                success_reason.insert(
                    "routing".to_string(),
                    JsonValue::from(match result.action.kind {
                        elspeth_core::RoutingActionKind::Continue => "continue",
                        elspeth_core::RoutingActionKind::Route => "route",
                        elspeth_core::RoutingActionKind::ForkToPaths => "fork_to_paths",
                    }),
                );
                if !result.action.destinations().is_empty() {
                    success_reason.insert(
                        "destinations".to_string(),
                        JsonValue::from(result.action.destinations().to_vec()),
                    );
                }
                self.recorder.complete_state_success(
                    &state_id,
                    &output,
                    duration_ms,
                    Some(&success_reason),
                )?;
                Ok(GateOutcome::Evaluated(GateExecution {
                    row,
                    action: result.action,
                    state_id,
                }))
            }
        }
    }
}
