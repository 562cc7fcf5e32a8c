// elspeth-engine/src/executors/aggregation.rs
// ============================================================================
// Module: Aggregation Executor
// Description: Wraps batch accumulation and flush with batch audit records.
// Purpose: Track batch membership and consume member tokens on flush.
// Dependencies: elspeth-core, elspeth-landscape
// ============================================================================

//! ## Overview
//! Tokens entering an aggregation node are recorded as batch members and
//! their node states close PENDING: the plugin has seen them, but durability
//! belongs to the eventual flush. On trigger, the flush executes against a
//! node state attributed to the first member token (external calls made
//! during the flush attribute there), the batch transitions through
//! EXECUTING to COMPLETED or FAILED, and member tokens receive their
//! consumed-in-batch outcomes only once the batch closes. Retrying a failed
//! batch copies its members into a fresh attempt.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;
use std::time::Instant;

use elspeth_core::AggregationPlugin;
use elspeth_core::BatchId;
use elspeth_core::BatchStatus;
use elspeth_core::ExecutionError;
use elspeth_core::NodeId;
use elspeth_core::OrchestrationInvariantError;
use elspeth_core::PipelineRow;
use elspeth_core::PluginContext;
use elspeth_core::RunId;
use elspeth_core::StateId;
use elspeth_core::TokenOutcomeKind;
use elspeth_core::TransformResult;
use elspeth_core::TriggerType;
use elspeth_core::elapsed_ms;
use elspeth_core::normalize_row;
use elspeth_core::stable_hash_raw;
use elspeth_landscape::LandscapeRecorder;
use serde_json::Value as JsonValue;
use tracing::info_span;

use crate::executors::EngineError;
use crate::executors::TokenInfo;
use crate::executors::per_token_ms;
use crate::executors::row_json;

// ============================================================================
// SECTION: Batch State
// ============================================================================

/// Orchestrator-owned state of one aggregation node's open batch.
#[derive(Debug, Default)]
pub struct AggregationBatchState {
    /// The draft batch collecting members, once one exists.
    batch_id: Option<BatchId>,
    /// Current batch attempt number.
    attempt: i64,
    /// Member tokens in accumulation order.
    members: Vec<TokenInfo>,
}

impl AggregationBatchState {
    /// Number of tokens in the open batch.
    #[must_use]
    pub fn member_count(&self) -> usize {
        self.members.len()
    }
}

// ============================================================================
// SECTION: Aggregation Executor
// ============================================================================

/// Executes aggregation nodes with batch audit records.
pub struct AggregationExecutor {
    /// Recorder for the audit trail.
    recorder: LandscapeRecorder,
    /// Run scope.
    run_id: RunId,
}

impl AggregationExecutor {
    /// Creates an aggregation executor for a run.
    #[must_use]
    pub const fn new(recorder: LandscapeRecorder, run_id: RunId) -> Self {
        Self {
            recorder,
            run_id,
        }
    }

    /// Accumulates one token into the node's open batch.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Orchestration`] when the node id is unset and
    /// re-raises plugin failures after closing the state FAILED.
    pub fn accumulate(
        &self,
        plugin: &mut dyn AggregationPlugin,
        batch_state: &mut AggregationBatchState,
        token: &TokenInfo,
        ctx: &mut PluginContext,
        step_index: i64,
    ) -> Result<(), EngineError> {
        let node_id: NodeId = ctx.node_id.clone().ok_or_else(|| {
            OrchestrationInvariantError::new(format!(
                "aggregation '{}' executed without node_id",
                plugin.name()
            ))
        })?;

        let batch_id = match &batch_state.batch_id {
            Some(batch_id) => batch_id.clone(),
            None => {
                let batch =
                    self.recorder.create_batch(&self.run_id, &node_id, batch_state.attempt)?;
                batch_state.batch_id = Some(batch.batch_id.clone());
                batch.batch_id
            }
        };
        let ordinal = i64::try_from(batch_state.members.len()).unwrap_or(i64::MAX);
        self.recorder.add_batch_member(&batch_id, &token.token_id, ordinal)?;

        let input = row_json(&token.row)?;
        let state = self.recorder.begin_node_state(
            &token.token_id,
            &node_id,
            &self.run_id,
            step_index,
            batch_state.attempt,
            &input,
        )?;
        let state_id = state.state_id().clone();
        ctx.state_id = Some(state_id.clone());
        ctx.contract = Some(Arc::clone(token.row.contract()));

        let start = Instant::now();
        let outcome = plugin.accumulate(&token.row, ctx);
        let duration_ms = elapsed_ms(start);
        ctx.state_id = None;

        match outcome {
            Err(error) => {
                self.recorder.complete_state_failed(
                    &state_id,
                    &ExecutionError::new(error.error_type.clone(), error.message.clone()),
                    duration_ms,
                    None,
                )?;
                Err(EngineError::Plugin {
                    plugin: plugin.name().to_string(),
                    error,
                })
            }
            Ok(()) => {
                // Durability belongs to the flush; the member state is
                // PENDING until then.
                self.recorder.complete_state_pending(&state_id, duration_ms)?;
                batch_state.members.push(token.clone());
                Ok(())
            }
        }
    }

    /// Flushes the open batch, consuming its members.
    ///
    /// Returns the aggregated output token (created on the first member's
    /// row) and the flush state, or `None` when no batch is open.
    ///
    /// # Errors
    ///
    /// Re-raises plugin failures after failing the batch and recording
    /// failed outcomes for its members.
    pub fn flush(
        &self,
        plugin: &mut dyn AggregationPlugin,
        batch_state: &mut AggregationBatchState,
        trigger: TriggerType,
        ctx: &mut PluginContext,
        step_index: i64,
    ) -> Result<Option<(TokenInfo, StateId)>, EngineError> {
        let node_id: NodeId = ctx.node_id.clone().ok_or_else(|| {
            OrchestrationInvariantError::new(format!(
                "aggregation '{}' flushed without node_id",
                plugin.name()
            ))
        })?;
        let Some(batch_id) = batch_state.batch_id.take() else {
            return Ok(None);
        };
        let members = std::mem::take(&mut batch_state.members);
        if members.is_empty() {
            return Ok(None);
        }

        self.recorder.complete_batch(&batch_id, BatchStatus::Executing, None, None, None)?;

        // The flush state is recorded against the first member token; calls
        // made by the plugin during the flush attribute there.
        let first = &members[0];
        let input = normalize_row(first.row.data())?;
        let state = self.recorder.begin_node_state(
            &first.token_id,
            &node_id,
            &self.run_id,
            step_index,
            batch_state.attempt,
            &input,
        )?;
        let state_id = state.state_id().clone();
        ctx.state_id = Some(state_id.clone());
        ctx.contract = Some(Arc::clone(first.row.contract()));

        let span = info_span!("aggregation_flush", aggregation = plugin.name(), batch_id = %batch_id);
        let _guard = span.enter();

        let start = Instant::now();
        let outcome = plugin.flush(ctx);
        let duration_ms = elapsed_ms(start);
        ctx.state_id = None;

        match outcome {
            Err(error) => {
                self.fail_flush(
                    &batch_id,
                    &state_id,
                    &members,
                    trigger,
                    &ExecutionError::new(error.error_type.clone(), error.message.clone()),
                    duration_ms,
                )?;
                batch_state.attempt += 1;
                Err(EngineError::Plugin {
                    plugin: plugin.name().to_string(),
                    error,
                })
            }
            Ok(TransformResult::Error {
                reason,
            }) => {
                let reason_value = JsonValue::Object(reason);
                self.fail_flush(
                    &batch_id,
                    &state_id,
                    &members,
                    trigger,
                    &ExecutionError::new("AggregationFlushError", reason_value.to_string()),
                    duration_ms,
                )?;
                batch_state.attempt += 1;
                Ok(None)
            }
            Ok(TransformResult::Success {
                data,
                success_reason,
            }) => {
                let output = normalize_row(&data)?;
                self.recorder.complete_state_success(
                    &state_id,
                    &output,
                    duration_ms,
                    Some(&success_reason),
                )?;
                self.recorder.complete_batch(
                    &batch_id,
                    BatchStatus::Completed,
                    Some(trigger),
                    Some(trigger_reason(trigger)),
                    Some(&state_id),
                )?;

                // Members are consumed only once the batch has closed.
                for member in &members {
                    self.recorder.record_token_outcome(
                        &self.run_id,
                        &member.token_id,
                        TokenOutcomeKind::ConsumedInBatch,
                        None,
                        None,
                    )?;
                }

                // The aggregated output continues as a fresh token on the
                // first member's row lineage.
                let output_token = self.recorder.create_token(&self.first_row_id(first)?)?;
                let output_row = PipelineRow::new(data, Arc::clone(first.row.contract()));
                Ok(Some((TokenInfo::new(output_token.token_id, output_row), state_id)))
            }
        }
    }

    /// Fails the batch and records failed outcomes for its members.
    fn fail_flush(
        &self,
        batch_id: &BatchId,
        state_id: &StateId,
        members: &[TokenInfo],
        trigger: TriggerType,
        error: &ExecutionError,
        duration_ms: f64,
    ) -> Result<(), EngineError> {
        self.recorder.complete_state_failed(
            state_id,
            error,
            per_token_ms(duration_ms, members.len()),
            None,
        )?;
        self.recorder.complete_batch(
            batch_id,
            BatchStatus::Failed,
            Some(trigger),
            Some(trigger_reason(trigger)),
            Some(state_id),
        )?;
        let error_hash = stable_hash_raw(&serde_json::json!({
            "error_type": error.error_type,
            "message": error.message,
        }))?;
        for member in members {
            self.recorder.record_token_outcome(
                &self.run_id,
                &member.token_id,
                TokenOutcomeKind::Failed,
                None,
                Some(&error_hash),
            )?;
        }
        Ok(())
    }

    /// The row id behind a member token.
    fn first_row_id(&self, member: &TokenInfo) -> Result<elspeth_core::RowId, EngineError> {
        self.recorder
            .get_token(&member.token_id)?
            .map(|token| token.row_id)
            .ok_or_else(|| {
                EngineError::Landscape(
                    elspeth_core::AuditIntegrityError::new(format!(
                        "token '{}' has no row record",
                        member.token_id
                    ))
                    .into(),
                )
            })
    }
}

/// Stable human-readable reason literal for a trigger.
const fn trigger_reason(trigger: TriggerType) -> &'static str {
    match trigger {
        TriggerType::Count => "batch reached configured size",
        TriggerType::Timeout => "batch aged out",
        TriggerType::EndOfInput => "source exhausted",
    }
}
