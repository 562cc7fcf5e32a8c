// elspeth-engine/src/executors/source.rs
// ============================================================================
// Module: Source Executor
// Description: Wraps source loading with row/token creation and quarantine.
// Purpose: Give every emitted record an audited row, token, and node state.
// Dependencies: elspeth-core, elspeth-landscape
// ============================================================================

//! ## Overview
//! The source executor is the only creator of row and token records. Each
//! emitted record gets a row (with its source data hash), a token, and a
//! completed node state at the source node. Valid rows carry a contract-
//! bearing [`elspeth_core::PipelineRow`]; quarantined rows get a validation
//! error event and are either routed to their quarantine destination as
//! normal tokens with a pre-computed quarantined outcome, discarded with an
//! immediate failed outcome, or escalated per the configured policy. After
//! the first valid row locks the contract, the locked contract is written
//! back to the node and the run.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;
use std::time::Instant;

use elspeth_core::ExecutionError;
use elspeth_core::NodeId;
use elspeth_core::OrchestrationInvariantError;
use elspeth_core::PendingOutcome;
use elspeth_core::PipelineRow;
use elspeth_core::PluginContext;
use elspeth_core::RunId;
use elspeth_core::SchemaContract;
use elspeth_core::SourcePlugin;
use elspeth_core::SourceRow;
use elspeth_core::StateId;
use elspeth_core::TokenOutcomeKind;
use elspeth_core::elapsed_ms;
use elspeth_core::normalize_row;
use elspeth_landscape::LandscapeRecorder;
use tracing::info_span;
use tracing::warn;

use crate::executors::EngineError;
use crate::executors::TokenInfo;
use crate::executors::row_json;

// ============================================================================
// SECTION: Policy & Output
// ============================================================================

/// What to do with rows that fail source validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationFailurePolicy {
    /// Route the row to its quarantine destination sink.
    Quarantine,
    /// Drop the row, recording the validation error and a failed outcome.
    Discard,
    /// Fail the run on the first invalid row.
    Fail,
}

/// One record emitted by the source executor.
#[derive(Debug, Clone)]
pub struct SourceItem {
    /// Token and row entering the pipeline.
    pub token: TokenInfo,
    /// The source node state recorded for the record.
    pub state_id: StateId,
    /// Pre-computed terminal outcome carried to the destination sink.
    pub pending_outcome: PendingOutcome,
    /// Quarantine destination label, for quarantined records only.
    pub quarantine_destination: Option<String>,
}

/// Everything the orchestrator needs after loading the source.
#[derive(Debug)]
pub struct SourceRunOutput {
    /// Records to drive through the DAG, in source order.
    pub items: Vec<SourceItem>,
    /// The locked run contract, once the first valid row locked it.
    pub contract: Option<Arc<SchemaContract>>,
}

// ============================================================================
// SECTION: Source Executor
// ============================================================================

/// Executes sources with row and token creation.
pub struct SourceExecutor {
    /// Recorder for the audit trail.
    recorder: LandscapeRecorder,
    /// Run scope.
    run_id: RunId,
}

impl SourceExecutor {
    /// Creates a source executor for a run.
    #[must_use]
    pub const fn new(recorder: LandscapeRecorder, run_id: RunId) -> Self {
        Self {
            recorder,
            run_id,
        }
    }

    /// Loads the source starting from a row index (zero for a fresh run).
    ///
    /// Records before `start_at_index` were made durable by a prior run's
    /// checkpoints; they are skipped without creating any audit records,
    /// though their indices still count so re-delivered rows keep their
    /// original positions.
    ///
    /// # Errors
    ///
    /// See [`SourceExecutor::run`].
    pub fn run_from(
        &self,
        source: &mut dyn SourcePlugin,
        ctx: &mut PluginContext,
        policy: ValidationFailurePolicy,
        start_at_index: i64,
    ) -> Result<SourceRunOutput, EngineError> {
        self.run_inner(source, ctx, policy, start_at_index)
    }

    /// Loads the source from the beginning.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Orchestration`] when the source has no node
    /// id, re-raises source plugin failures, and fails the run on invalid
    /// rows under [`ValidationFailurePolicy::Fail`].
    pub fn run(
        &self,
        source: &mut dyn SourcePlugin,
        ctx: &mut PluginContext,
        policy: ValidationFailurePolicy,
    ) -> Result<SourceRunOutput, EngineError> {
        self.run_inner(source, ctx, policy, 0)
    }

    /// Shared loading loop.
    fn run_inner(
        &self,
        source: &mut dyn SourcePlugin,
        ctx: &mut PluginContext,
        policy: ValidationFailurePolicy,
        start_at_index: i64,
    ) -> Result<SourceRunOutput, EngineError> {
        let source_node_id: NodeId = ctx.node_id.clone().ok_or_else(|| {
            OrchestrationInvariantError::new(format!(
                "source '{}' executed without node_id",
                source.name()
            ))
        })?;

        let span = info_span!("source_load", source = source.name(), node_id = %source_node_id);
        let _guard = span.enter();

        let plugin_name = source.name().to_string();
        source.on_start(ctx).map_err(|error| EngineError::Plugin {
            plugin: plugin_name.clone(),
            error,
        })?;

        let mut items = Vec::new();
        let mut locked_contract: Option<Arc<SchemaContract>> = None;
        let mut row_index: i64 = 0;

        let records = {
            let iterator = source.load(ctx).map_err(|error| EngineError::Plugin {
                plugin: plugin_name.clone(),
                error,
            })?;
            let mut collected = Vec::new();
            for record in iterator {
                collected.push(record.map_err(|error| EngineError::Plugin {
                    plugin: plugin_name.clone(),
                    error,
                })?);
            }
            collected
        };

        for record in records {
            if row_index < start_at_index {
                // Durable in a prior run; skip without new audit records.
                row_index += 1;
                continue;
            }
            let record_start = Instant::now();
            match record {
                SourceRow::Valid(pipeline_row) => {
                    let item = self.emit_valid(
                        &source_node_id,
                        row_index,
                        &pipeline_row,
                        record_start,
                    )?;
                    if locked_contract.is_none() && pipeline_row.contract().locked {
                        let contract = Arc::clone(pipeline_row.contract());
                        self.recorder.update_node_output_contract(
                            &self.run_id,
                            &source_node_id,
                            &contract,
                        )?;
                        self.recorder.update_run_contract(&self.run_id, &contract)?;
                        locked_contract = Some(contract);
                    }
                    items.push(item);
                }
                SourceRow::Quarantined(quarantined) => {
                    let item = self.emit_quarantined(
                        &source_node_id,
                        row_index,
                        &quarantined,
                        policy,
                        record_start,
                    )?;
                    if let Some(item) = item {
                        items.push(item);
                    }
                }
            }
            row_index += 1;
        }

        source.close();
        Ok(SourceRunOutput {
            items,
            contract: locked_contract,
        })
    }

    /// Creates the audit records for one valid row.
    fn emit_valid(
        &self,
        source_node_id: &NodeId,
        row_index: i64,
        pipeline_row: &PipelineRow,
        record_start: Instant,
    ) -> Result<SourceItem, EngineError> {
        let row_record =
            self.recorder.create_row(&self.run_id, source_node_id, row_index, pipeline_row.data())?;
        let token = self.recorder.create_token(&row_record.row_id)?;
        let payload = row_json(pipeline_row)?;
        let state = self.recorder.begin_node_state(
            &token.token_id,
            source_node_id,
            &self.run_id,
            0,
            0,
            &payload,
        )?;
        self.recorder.complete_state_success(
            state.state_id(),
            &payload,
            elapsed_ms(record_start),
            None,
        )?;
        Ok(SourceItem {
            token: TokenInfo::new(token.token_id, pipeline_row.clone()),
            state_id: state.state_id().clone(),
            pending_outcome: PendingOutcome::completed(),
            quarantine_destination: None,
        })
    }

    /// Creates the audit records for one quarantined row, honoring policy.
    fn emit_quarantined(
        &self,
        source_node_id: &NodeId,
        row_index: i64,
        quarantined: &elspeth_core::QuarantinedRow,
        policy: ValidationFailurePolicy,
        record_start: Instant,
    ) -> Result<Option<SourceItem>, EngineError> {
        let raw_data: elspeth_core::RowData = quarantined
            .row_data
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        let row_record =
            self.recorder.create_row(&self.run_id, source_node_id, row_index, &raw_data)?;
        let token = self.recorder.create_token(&row_record.row_id)?;
        let payload = normalize_row(&raw_data)?;
        let state = self.recorder.begin_node_state(
            &token.token_id,
            source_node_id,
            &self.run_id,
            0,
            0,
            &payload,
        )?;

        let validation = self.recorder.record_validation_error(
            &self.run_id,
            &token.token_id,
            source_node_id,
            &quarantined.violations,
        )?;

        match policy {
            ValidationFailurePolicy::Quarantine => {
                self.recorder.complete_state_success(
                    state.state_id(),
                    &payload,
                    elapsed_ms(record_start),
                    None,
                )?;
                Ok(Some(SourceItem {
                    token: TokenInfo::new(
                        token.token_id,
                        quarantine_row_carrier(&raw_data),
                    ),
                    state_id: state.state_id().clone(),
                    pending_outcome: PendingOutcome::quarantined(validation.error_hash),
                    quarantine_destination: Some(quarantined.destination.clone()),
                }))
            }
            ValidationFailurePolicy::Discard => {
                self.recorder.complete_state_failed(
                    state.state_id(),
                    &ExecutionError::new("ValidationError", quarantined.error_message.clone()),
                    elapsed_ms(record_start),
                    Some(&payload),
                )?;
                self.recorder.record_token_outcome(
                    &self.run_id,
                    &token.token_id,
                    TokenOutcomeKind::Failed,
                    None,
                    Some(&validation.error_hash),
                )?;
                warn!(
                    token_id = %token.token_id,
                    row_index,
                    "row discarded after validation failure"
                );
                Ok(None)
            }
            ValidationFailurePolicy::Fail => {
                self.recorder.complete_state_failed(
                    state.state_id(),
                    &ExecutionError::new("ValidationError", quarantined.error_message.clone()),
                    elapsed_ms(record_start),
                    Some(&payload),
                )?;
                self.recorder.record_token_outcome(
                    &self.run_id,
                    &token.token_id,
                    TokenOutcomeKind::Failed,
                    None,
                    Some(&validation.error_hash),
                )?;
                Err(EngineError::Plugin {
                    plugin: "source".to_string(),
                    error: elspeth_core::PluginError::permanent(
                        "ValidationError",
                        quarantined.error_message.clone(),
                    ),
                })
            }
        }
    }
}

/// Wraps quarantined raw data in a contract-less carrier row.
///
/// Quarantined rows never regain a contract; the carrier uses an empty
/// observed contract purely so the sink write path can treat the batch
/// uniformly.
fn quarantine_row_carrier(data: &elspeth_core::RowData) -> PipelineRow {
    let contract = SchemaContract {
        mode: elspeth_core::SchemaMode::Observed,
        locked: false,
        fields: Vec::new(),
        version_hash: String::new(),
    };
    PipelineRow::new(data.clone(), Arc::new(contract))
}
