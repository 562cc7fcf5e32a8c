// elspeth-engine/src/executors/coalesce.rs
// ============================================================================
// Module: Coalesce Executor
// Description: Merges forked token families back into one stream.
// Purpose: Record the merge and retire the forked tokens.
// Dependencies: elspeth-core, elspeth-landscape
// ============================================================================

//! ## Overview
//! When a fork's branches converge, the coalesce executor opens a node state
//! per arriving token, asks the policy plugin to merge their rows, closes
//! every state with the merged output, retires the forked tokens with
//! coalesced outcomes, and emits one fresh token carrying the merged row
//! onward.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;
use std::time::Instant;

use elspeth_core::CoalescePlugin;
use elspeth_core::ExecutionError;
use elspeth_core::NodeId;
use elspeth_core::OrchestrationInvariantError;
use elspeth_core::PipelineRow;
use elspeth_core::PluginContext;
use elspeth_core::RunId;
use elspeth_core::SchemaContract;
use elspeth_core::StateId;
use elspeth_core::TokenOutcomeKind;
use elspeth_core::elapsed_ms;
use elspeth_core::normalize_row;
use elspeth_landscape::LandscapeRecorder;
use tracing::info_span;

use crate::executors::EngineError;
use crate::executors::TokenInfo;
use crate::executors::per_token_ms;
use crate::executors::row_json;

// ============================================================================
// SECTION: Coalesce Executor
// ============================================================================

/// Executes coalesce nodes over forked token families.
pub struct CoalesceExecutor {
    /// Recorder for the audit trail.
    recorder: LandscapeRecorder,
    /// Run scope.
    run_id: RunId,
}

impl CoalesceExecutor {
    /// Creates a coalesce executor for a run.
    #[must_use]
    pub const fn new(recorder: LandscapeRecorder, run_id: RunId) -> Self {
        Self {
            recorder,
            run_id,
        }
    }

    /// Merges a family of forked tokens into one fresh token.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Orchestration`] when the node id is unset and
    /// re-raises plugin failures after closing every opened state FAILED.
    pub fn merge(
        &self,
        plugin: &dyn CoalescePlugin,
        tokens: &[TokenInfo],
        ctx: &mut PluginContext,
        step_index: i64,
    ) -> Result<Option<TokenInfo>, EngineError> {
        if tokens.is_empty() {
            return Ok(None);
        }
        let node_id: NodeId = ctx.node_id.clone().ok_or_else(|| {
            OrchestrationInvariantError::new(format!(
                "coalesce '{}' executed without node_id",
                plugin.name()
            ))
        })?;

        let mut state_ids: Vec<StateId> = Vec::with_capacity(tokens.len());
        for token in tokens {
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
        }

        // The merged row validates against the union of the branch contracts.
        let mut merged_contract: SchemaContract = tokens[0].row.contract().as_ref().clone();
        for token in &tokens[1..] {
            merged_contract = merged_contract.merge(token.row.contract())?;
        }
        ctx.contract = Some(Arc::new(merged_contract.clone()));

        let rows: Vec<PipelineRow> = tokens.iter().map(|token| token.row.clone()).collect();
        let span = info_span!("coalesce", coalesce = plugin.name(), family = tokens.len());
        let _guard = span.enter();

        let start = Instant::now();
        let outcome = plugin.merge(&rows, ctx);
        let duration_ms = elapsed_ms(start);

        match outcome {
            Err(error) => {
                let execution_error =
                    ExecutionError::new(error.error_type.clone(), error.message.clone());
                let amortized = per_token_ms(duration_ms, state_ids.len());
                for state_id in &state_ids {
                    self.recorder.complete_state_failed(
                        state_id,
                        &execution_error,
                        amortized,
                        None,
                    )?;
                }
                Err(EngineError::Plugin {
                    plugin: plugin.name().to_string(),
                    error,
                })
            }
            Ok(merged_data) => {
                let output = normalize_row(&merged_data)?;
                let amortized = per_token_ms(duration_ms, state_ids.len());
                for state_id in &state_ids {
                    self.recorder.complete_state_success(state_id, &output, amortized, None)?;
                }

                // Retire the forked tokens; the merged row continues as a
                // fresh token on the first member's row lineage.
                for token in tokens {
                    self.recorder.record_token_outcome(
                        &self.run_id,
                        &token.token_id,
                        TokenOutcomeKind::Coalesced,
                        None,
                        None,
                    )?;
                }
                let first_row_id = self
                    .recorder
                    .get_token(&tokens[0].token_id)?
                    .map(|token| token.row_id)
                    .ok_or_else(|| {
                        EngineError::Landscape(
                            elspeth_core::AuditIntegrityError::new(format!(
                                "token '{}' has no row record",
                                tokens[0].token_id
                            ))
                            .into(),
                        )
                    })?;
                let merged_token = self.recorder.create_token(&first_row_id)?;
                let merged_row = PipelineRow::new(merged_data, Arc::new(merged_contract));
                Ok(Some(TokenInfo::new(merged_token.token_id, merged_row)))
            }
        }
    }
}
