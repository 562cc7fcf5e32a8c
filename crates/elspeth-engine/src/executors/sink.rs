// elspeth-engine/src/executors/sink.rs
// ============================================================================
// Module: Sink Executor
// Description: Wraps sink writes with artifact and outcome recording.
// Purpose: Uphold durable-before-checkpoint and audit-before-effect ordering.
// Dependencies: elspeth-core, elspeth-landscape
// ============================================================================

//! ## Overview
//! Every token reaching a sink gets a node state; that completed state is
//! the audit proof the row reached its terminal position. Artifact and
//! outcome rows are written only after `sink.flush()` has succeeded, so they
//! exist only when the data is durable. The checkpoint callback runs last:
//! a sink write cannot be rolled back, so a checkpoint failure after flush
//! is logged and execution continues (resume re-delivers the row,
//! at-least-once).

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;
use std::time::Instant;

use elspeth_core::Artifact;
use elspeth_core::ExecutionError;
use elspeth_core::NodeId;
use elspeth_core::OrchestrationInvariantError;
use elspeth_core::PendingOutcome;
use elspeth_core::PluginContext;
use elspeth_core::RunId;
use elspeth_core::SchemaContract;
use elspeth_core::SinkPlugin;
use elspeth_core::StateId;
use elspeth_core::elapsed_ms;
use elspeth_landscape::LandscapeRecorder;
use serde_json::json;
use tracing::error;
use tracing::info_span;

use crate::executors::EngineError;
use crate::executors::TokenInfo;
use crate::executors::per_token_ms;
use crate::executors::row_json;

// ============================================================================
// SECTION: Callback
// ============================================================================

/// Callback invoked per token after a durable sink write, for checkpointing.
pub type TokenWrittenCallback<'a> = &'a mut dyn FnMut(&TokenInfo) -> Result<(), EngineError>;

// ============================================================================
// SECTION: Sink Executor
// ============================================================================

/// Executes sinks with artifact recording.
pub struct SinkExecutor {
    /// Recorder for the audit trail.
    recorder: LandscapeRecorder,
    /// Run scope.
    run_id: RunId,
}

impl SinkExecutor {
    /// Creates a sink executor for a run.
    #[must_use]
    pub const fn new(recorder: LandscapeRecorder, run_id: RunId) -> Self {
        Self {
            recorder,
            run_id,
        }
    }

    /// Writes tokens to a sink with full audit recording.
    ///
    /// This is the only place terminal outcomes are recorded for sink-bound
    /// tokens: after write, after flush, after the states are COMPLETED and
    /// the artifact is registered.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Orchestration`] when the sink has no node id,
    /// and re-raises write/flush failures after closing every opened state
    /// as FAILED.
    #[allow(clippy::too_many_arguments, reason = "Mirrors the sink write contract surface.")]
    pub fn write(
        &self,
        sink: &mut dyn SinkPlugin,
        tokens: &[TokenInfo],
        ctx: &mut PluginContext,
        step_in_pipeline: i64,
        sink_name: &str,
        pending_outcome: &PendingOutcome,
        mut on_token_written: Option<TokenWrittenCallback<'_>>,
    ) -> Result<Option<Artifact>, EngineError> {
        if tokens.is_empty() {
            return Ok(None);
        }
        let sink_node_id: NodeId = ctx.node_id.clone().ok_or_else(|| {
            OrchestrationInvariantError::new(format!(
                "sink '{}' executed without node_id",
                sink.name()
            ))
        })?;

        // Every token reaching a sink gets a node state.
        let mut states: Vec<(&TokenInfo, StateId)> = Vec::with_capacity(tokens.len());
        for token in tokens {
            let input = row_json(&token.row)?;
            let state = self.recorder.begin_node_state(
                &token.token_id,
                &sink_node_id,
                &self.run_id,
                step_in_pipeline,
                0,
                &input,
            )?;
            states.push((token, state.state_id().clone()));
        }

        // Synchronize the context contract to the sink-bound tokens. Sinks
        // that restore display headers capture it lazily during write, and a
        // mixed batch needs the union of its header lineage.
        let merge_start = Instant::now();
        let mut batch_contract: SchemaContract = tokens[0].row.contract().as_ref().clone();
        for token in &tokens[1..] {
            match batch_contract.merge(token.row.contract()) {
                Ok(merged) => batch_contract = merged,
                Err(err) => {
                    let merge_error = ExecutionError::in_phase(
                        "ContractMergeError",
                        err.to_string(),
                        "contract_merge",
                    );
                    self.fail_states(&states, elapsed_ms(merge_start), &merge_error)?;
                    return Err(err.into());
                }
            }
        }
        ctx.contract = Some(Arc::new(batch_contract));

        // Clear any stale per-token attribution before the operation opens;
        // sink calls attribute to the operation, and state_id plus
        // operation_id together violate the exclusive-attribution rule.
        ctx.state_id = None;
        let operation = self.recorder.begin_operation(
            &self.run_id,
            &sink_node_id,
            "sink_write",
            &json!({"sink_plugin": sink.name(), "row_count": tokens.len()}),
        )?;
        ctx.operation_id = Some(operation.operation_id.clone());

        let rows: Vec<_> = tokens.iter().map(|token| token.row.data().clone()).collect();
        let span = info_span!("sink_write", sink = sink.name(), node_id = %sink_node_id);
        let _guard = span.enter();

        let start = Instant::now();
        let artifact_info = match sink.write(&rows, ctx) {
            Ok(descriptor) => descriptor,
            Err(err) => {
                let duration = elapsed_ms(start);
                let execution_error = ExecutionError::new(err.error_type.clone(), err.message.clone());
                self.fail_states(&states, duration, &execution_error)?;
                ctx.operation_id = None;
                return Err(EngineError::Plugin {
                    plugin: sink.name().to_string(),
                    error: err,
                });
            }
        };
        let duration_ms = elapsed_ms(start);

        // Durability before any audit closure: if flush fails the states
        // must close FAILED, because nothing downstream may trust the write.
        if let Err(err) = sink.flush() {
            let flush_error =
                ExecutionError::in_phase(err.error_type.clone(), err.message.clone(), "flush");
            self.fail_states(&states, elapsed_ms(start), &flush_error)?;
            ctx.operation_id = None;
            return Err(EngineError::Plugin {
                plugin: sink.name().to_string(),
                error: err,
            });
        }

        self.recorder.complete_operation(
            &operation.operation_id,
            Some(&json!({
                "artifact_path": artifact_info.path_or_uri,
                "content_hash": artifact_info.content_hash,
            })),
        )?;
        ctx.operation_id = None;

        // Close every token state COMPLETED with the batch time amortized so
        // the per-token durations sum to the actual batch time.
        let amortized = per_token_ms(duration_ms, tokens.len());
        for (token, state_id) in &states {
            let output = json!({
                "row": row_json(&token.row)?,
                "artifact_path": artifact_info.path_or_uri,
                "content_hash": artifact_info.content_hash,
            });
            self.recorder.complete_state_success(state_id, &output, amortized, None)?;
        }

        // Artifact lineage links to the first state of the write.
        let first_state = &states[0].1;
        let artifact = self.recorder.register_artifact(
            &self.run_id,
            first_state,
            &sink_node_id,
            &artifact_info.artifact_type,
            &artifact_info.path_or_uri,
            &artifact_info.content_hash,
            artifact_info.size_bytes,
            None,
        )?;

        // Terminal outcomes, strictly after durability.
        for (token, _) in &states {
            self.recorder.record_token_outcome(
                &self.run_id,
                &token.token_id,
                pending_outcome.outcome,
                Some(sink_name),
                pending_outcome.error_hash.as_deref(),
            )?;
        }

        // Checkpoint last. The sink write cannot be rolled back, so a
        // checkpoint failure here is logged and execution continues; resume
        // re-delivers the affected rows.
        if let Some(callback) = on_token_written.as_mut() {
            for token in tokens {
                if let Err(err) = callback(token) {
                    error!(
                        token_id = %token.token_id,
                        error = %err,
                        "checkpoint failed after durable sink write; artifact exists without a \
                         checkpoint record, resume will re-deliver this row"
                    );
                }
            }
        }

        Ok(Some(artifact))
    }

    /// Closes every opened sink state as FAILED with amortized duration.
    fn fail_states(
        &self,
        states: &[(&TokenInfo, StateId)],
        duration_ms: f64,
        error: &ExecutionError,
    ) -> Result<(), EngineError> {
        let amortized = per_token_ms(duration_ms, states.len());
        for (_, state_id) in states {
            self.recorder.complete_state_failed(state_id, error, amortized, None)?;
        }
        Ok(())
    }
}
