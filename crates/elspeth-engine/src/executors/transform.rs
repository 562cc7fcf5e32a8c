// elspeth-engine/src/executors/transform.rs
// ============================================================================
// Module: Transform Executor
// Description: Wraps transform invocations with state and error recording.
// Purpose: Audit every transform attempt, single-row or pooled.
// Dependencies: elspeth-core, elspeth-landscape, crate::pool
// ============================================================================

//! ## Overview
//! A transform answers with a typed result: success carries the output row
//! and a "what did I add" reason, error carries a "why did I fail" reason
//! map. Infrastructure failures (the plugin itself erroring) close the state
//! FAILED and re-raise so the orchestrator can apply the node's `on_error`
//! policy; data-level error results close the state FAILED but stay values,
//! becoming failed token outcomes. The pooled path runs a batch through the
//! retry executor while keeping one node state per row.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;
use std::time::Instant;

use elspeth_core::ExecutionError;
use elspeth_core::NodeId;
use elspeth_core::OrchestrationInvariantError;
use elspeth_core::PipelineRow;
use elspeth_core::PluginContext;
use elspeth_core::RunId;
use elspeth_core::StateId;
use elspeth_core::TransformPlugin;
use elspeth_core::TransformResult;
use elspeth_core::elapsed_ms;
use elspeth_core::normalize_row;
use elspeth_core::stable_hash_raw;
use elspeth_landscape::LandscapeRecorder;
use serde_json::Map as JsonMap;
use serde_json::Value as JsonValue;
use tracing::info_span;

use crate::executors::EngineError;
use crate::executors::TokenInfo;
use crate::executors::per_token_ms;
use crate::executors::row_json;
use crate::pool::PooledExecutor;
use crate::pool::RowContext;

// ============================================================================
// SECTION: Execution Result
// ============================================================================

/// Outcome of one transform attempt for one token.
#[derive(Debug, Clone)]
pub enum TransformExecution {
    /// The transform produced an output row.
    Success {
        /// Output row, carrying the (possibly evolved) contract.
        row: PipelineRow,
        /// Node state recorded for the attempt.
        state_id: StateId,
    },
    /// The transform answered with a data-level error for this row.
    RowError {
        /// The typed reason map.
        reason: JsonMap<String, JsonValue>,
        /// Node state recorded for the attempt.
        state_id: StateId,
        /// Stable hash of the reason, for the failed outcome.
        error_hash: String,
    },
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
// SECTION: Transform Executor
// ============================================================================

/// Executes transforms with per-attempt audit states.
pub struct TransformExecutor {
    /// Recorder for the audit trail.
    recorder: LandscapeRecorder,
    /// Run scope.
    run_id: RunId,
}

impl TransformExecutor {
    /// Creates a transform executor for a run.
    #[must_use]
    pub const fn new(recorder: LandscapeRecorder, run_id: RunId) -> Self {
        Self {
            recorder,
            run_id,
        }
    }

    /// Executes a transform for one token.
    ///
    /// Plugin failures close the state FAILED, record a transform error
    /// event, and come back as [`TransformExecution::PluginFailure`] so the
    /// orchestrator can apply the node's `on_error` policy.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Orchestration`] when the node id is unset and
    /// [`EngineError::Landscape`] on audit failures.
    pub fn execute(
        &self,
        transform: &dyn TransformPlugin,
        token: &TokenInfo,
        ctx: &mut PluginContext,
        step_index: i64,
    ) -> Result<TransformExecution, EngineError> {
        let node_id: NodeId = ctx.node_id.clone().ok_or_else(|| {
            OrchestrationInvariantError::new(format!(
                "transform '{}' executed without node_id",
                transform.name()
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

        let span =
            info_span!("transform", transform = transform.name(), token_id = %token.token_id);
        let _guard = span.enter();

        let start = Instant::now();
        let outcome = transform.apply(&token.row, ctx);
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
                self.recorder.record_transform_error(
                    &self.run_id,
                    &token.token_id,
                    &node_id,
                    Some(&state_id),
                    &execution_error,
                )?;
                Ok(TransformExecution::PluginFailure {
                    error,
                    state_id,
                })
            }
            Ok(TransformResult::Success {
                data,
                success_reason,
            }) => {
                let row = self.evolved_row(transform, token, &node_id, data)?;
                let output = normalize_row(row.data())?;
                self.recorder.complete_state_success(
                    &state_id,
                    &output,
                    duration_ms,
                    Some(&success_reason),
                )?;
                Ok(TransformExecution::Success {
                    row,
                    state_id,
                })
            }
            Ok(TransformResult::Error {
                reason,
            }) => self.close_row_error(token, &node_id, &state_id, reason, duration_ms),
        }
    }

    /// Executes a batch of tokens through the pooled retry executor.
    ///
    /// One node state per row; calls made by the plugin attribute to that
    /// row's state. Results come back in input order.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Orchestration`] when the node id is unset.
    pub fn execute_pooled(
        &self,
        transform: &(dyn TransformPlugin),
        pool: &PooledExecutor,
        tokens: &[TokenInfo],
        ctx: &PluginContext,
        step_index: i64,
    ) -> Result<Vec<TransformExecution>, EngineError> {
        let node_id: NodeId = ctx.node_id.clone().ok_or_else(|| {
            OrchestrationInvariantError::new(format!(
                "transform '{}' executed without node_id",
                transform.name()
            ))
        })?;

        let mut contexts = Vec::with_capacity(tokens.len());
        let mut state_ids = Vec::with_capacity(tokens.len());
        for (row_index, token) in tokens.iter().enumerate() {
            let input = row_json(&token.row)?;
            let state = self.recorder.begin_node_state(
                &token.token_id,
                &node_id,
                &self.run_id,
                step_index,
                0,
                &input,
            )?;
            state_ids.push(state.state_id().clone());
            contexts.push(RowContext {
                row: token.row.data().clone(),
                state_id: state.state_id().clone(),
                row_index,
            });
        }

        let span = info_span!("transform_pooled", transform = transform.name());
        let _guard = span.enter();
        let start = Instant::now();

        let results = pool.execute_batch(contexts, |row_context| {
            let mut row_ctx = ctx.clone();
            row_ctx.state_id = Some(row_context.state_id.clone());
            row_ctx.operation_id = None;
            let Some(token) = tokens.get(row_context.row_index) else {
                return Err(elspeth_core::PluginError::permanent(
                    "PoolIndexError",
                    format!("row index {} out of range", row_context.row_index),
                ));
            };
            transform.apply(&token.row, &row_ctx)
        });

        let amortized = per_token_ms(elapsed_ms(start), tokens.len());
        let mut executions = Vec::with_capacity(results.len());
        for pooled in results {
            let Some(token) = tokens.get(pooled.row_index) else {
                continue;
            };
            let Some(state_id) = state_ids.get(pooled.row_index) else {
                continue;
            };
            match pooled.result {
                TransformResult::Success {
                    data,
                    success_reason,
                } => {
                    let row = self.evolved_row(transform, token, &node_id, data)?;
                    let output = normalize_row(row.data())?;
                    self.recorder.complete_state_success(
                        state_id,
                        &output,
                        amortized,
                        Some(&success_reason),
                    )?;
                    executions.push(TransformExecution::Success {
                        row,
                        state_id: state_id.clone(),
                    });
                }
                TransformResult::Error {
                    reason,
                } => {
                    executions.push(self.close_row_error(
                        token,
                        &node_id,
                        state_id,
                        reason,
                        amortized,
                    )?);
                }
            }
        }
        Ok(executions)
    }

    /// Applies transform-driven contract evolution to the output row.
    fn evolved_row(
        &self,
        transform: &dyn TransformPlugin,
        token: &TokenInfo,
        node_id: &NodeId,
        data: elspeth_core::RowData,
    ) -> Result<PipelineRow, EngineError> {
        let input_contract = token.row.contract();
        match transform.output_contract(input_contract) {
            Ok(evolved) if evolved.version_hash != input_contract.version_hash => {
                self.recorder.update_node_output_contract(&self.run_id, node_id, &evolved)?;
                Ok(PipelineRow::new(data, Arc::new(evolved)))
            }
            Ok(_) => Ok(token.row.with_data(data)),
            Err(error) => Err(EngineError::Plugin {
                plugin: transform.name().to_string(),
                error,
            }),
        }
    }

    /// Closes a data-level error result: FAILED state plus error event.
    fn close_row_error(
        &self,
        token: &TokenInfo,
        node_id: &NodeId,
        state_id: &StateId,
        reason: JsonMap<String, JsonValue>,
        duration_ms: f64,
    ) -> Result<TransformExecution, EngineError> {
        let reason_value = JsonValue::Object(reason.clone());
        let error_hash = stable_hash_raw(&reason_value)?;
        let error_type = reason
            .get("error_type")
            .and_then(JsonValue::as_str)
            .unwrap_or("TransformRowError");
        let execution_error = ExecutionError::new(error_type, reason_value.to_string());
        self.recorder.complete_state_failed(state_id, &execution_error, duration_ms, None)?;
        self.recorder.record_transform_error(
            &self.run_id,
            &token.token_id,
            node_id,
            Some(state_id),
            &execution_error,
        )?;
        Ok(TransformExecution::RowError {
            reason,
            state_id: state_id.clone(),
            error_hash,
        })
    }
}
