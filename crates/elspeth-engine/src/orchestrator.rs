// elspeth-engine/src/orchestrator.rs
// ============================================================================
// Module: Orchestrator
// Description: Drives tokens through the DAG one node at a time.
// Purpose: Own step assignment, routing, on-error policy, and run lifecycle.
// Dependencies: elspeth-core, elspeth-landscape, crate::executors
// ============================================================================

//! ## Overview
//! One run executes on one logical driver: the orchestrator is single-
//! threaded, registering the graph, wrapping source output into tokens, and
//! advancing each token through the stages in step order. Parallelism lives
//! only inside pooled executors and aggregation flush I/O, which keeps the
//! audit stream linearizable per token. Plugin failures are resolved by the
//! failing node's `on_error` policy: divert along an error edge, discard
//! with a failed outcome, or fail the run. Sink-bound tokens receive their
//! terminal outcomes inside the sink executor, strictly after durability;
//! checkpoints follow and their failures are logged, never raised.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::path::PathBuf;

use elspeth_core::CANONICAL_VERSION;
use elspeth_core::Determinism;
use elspeth_core::EdgeId;
use elspeth_core::ExecutionGraph;
use elspeth_core::NodeId;
use elspeth_core::NodeType;
use elspeth_core::PendingOutcome;
use elspeth_core::PluginContext;
use elspeth_core::RoutingActionKind;
use elspeth_core::RoutingMode;
use elspeth_core::RunId;
use elspeth_core::RunStatus;
use elspeth_core::SchemaContract;
use elspeth_core::StateId;
use elspeth_core::TokenOutcomeKind;
use elspeth_core::TriggerType;
use elspeth_core::stable_hash_raw;
use elspeth_landscape::CheckpointManager;
use elspeth_landscape::LandscapeRecorder;
use elspeth_landscape::export_run;
use elspeth_landscape::recorder::NodeRegistration;
use serde_json::Map as JsonMap;
use serde_json::Value as JsonValue;
use serde_json::json;
use tracing::info;
use tracing::warn;

use crate::executors::AggregationBatchState;
use crate::executors::AggregationExecutor;
use crate::executors::CoalesceExecutor;
use crate::executors::EngineError;
use crate::executors::GateExecutor;
use crate::executors::GateOutcome;
use crate::executors::SinkExecutor;
use crate::executors::SourceExecutor;
use crate::executors::SourceItem;
use crate::executors::TokenInfo;
use crate::executors::TransformExecution;
use crate::executors::TransformExecutor;
use crate::pipeline::CONTINUE_LABEL;
use crate::pipeline::OnErrorPolicy;
use crate::pipeline::Pipeline;
use crate::pipeline::SinkSpec;
use crate::pipeline::StagePlugin;
use crate::pipeline::error_label;
use crate::pool::PooledExecutor;

// ============================================================================
// SECTION: Options & Report
// ============================================================================

/// Orchestrator run options.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Whether to write checkpoints after durable sink writes.
    pub checkpoints_enabled: bool,
    /// Checkpoint every Nth durable token (at least one; the final token of
    /// a run is always checkpointed by cadence).
    pub checkpoint_every_n: usize,
    /// When set, export the audit trail here at end of run.
    pub export_path: Option<PathBuf>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            checkpoints_enabled: true,
            checkpoint_every_n: 1,
            export_path: None,
        }
    }
}

/// Summary of a completed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    /// The run identifier.
    pub run_id: RunId,
    /// Final run status.
    pub status: RunStatus,
    /// Number of source records that entered the pipeline.
    pub records_emitted: usize,
    /// Number of artifacts registered.
    pub artifacts: usize,
}

// ============================================================================
// SECTION: Delivery
// ============================================================================

/// Where a token ended up after the processing chain.
enum Delivery {
    /// Continue to the default sink with a completed outcome.
    Default(TokenInfo),
    /// Deliver to a named route sink with the given outcome.
    Route {
        /// Route sink label.
        label: String,
        /// Token to deliver.
        token: TokenInfo,
        /// Outcome to record after durability.
        outcome: PendingOutcome,
    },
}

// ============================================================================
// SECTION: Orchestrator
// ============================================================================

/// Drives a pipeline through one run.
pub struct Orchestrator {
    /// Recorder for all durable writes.
    recorder: LandscapeRecorder,
    /// Checkpoint writer.
    checkpoints: CheckpointManager,
    /// Run options.
    options: RunOptions,
}

impl Orchestrator {
    /// Creates an orchestrator.
    #[must_use]
    pub const fn new(
        recorder: LandscapeRecorder,
        checkpoints: CheckpointManager,
        options: RunOptions,
    ) -> Self {
        Self {
            recorder,
            checkpoints,
            options,
        }
    }

    /// Executes a fresh run of the pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] on unrecoverable failures; the run row is
    /// marked FAILED before the error propagates.
    pub fn run(
        &self,
        pipeline: &mut Pipeline,
        settings: &JsonValue,
    ) -> Result<RunReport, EngineError> {
        let run = self.recorder.begin_run(settings, CANONICAL_VERSION)?;
        let run_id = run.run_id.clone();
        info!(run_id = %run_id, "run started");
        self.execute(pipeline, &run_id, 0)
    }

    /// Resumes a prior run from its latest checkpoint.
    ///
    /// Rows up to and including the checkpointed token are durable and are
    /// skipped; everything after is re-delivered (at-least-once against the
    /// sink, and the operator is warned).
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Recovery`] when resume is refused (graph
    /// drift, missing checkpoint, or contract corruption).
    pub fn resume(
        &self,
        pipeline: &mut Pipeline,
        run_id: &RunId,
    ) -> Result<RunReport, EngineError> {
        let graph = pipeline.build_graph()?;
        let recovery = elspeth_landscape::RecoveryManager::new(
            self.recorder.clone(),
            self.checkpoints.clone(),
        );
        let resume_point = recovery.get_resume_point(run_id, &graph)?;
        warn!(
            run_id = %run_id,
            resume_from_row_index = resume_point.resume_from_row_index,
            "resuming; rows after the last checkpoint will be re-delivered (at-least-once)"
        );

        let resolution = resume_point
            .contract
            .as_ref()
            .map(SchemaContract::name_resolution)
            .unwrap_or_default();
        for sink in std::iter::once(&mut pipeline.default_sink)
            .chain(pipeline.route_sinks.values_mut())
        {
            sink.plugin.set_resume_field_resolution(resolution.clone());
            sink.plugin.configure_for_resume();
            let validation = sink.plugin.validate_output_target().map_err(|error| {
                EngineError::Plugin {
                    plugin: sink.name.clone(),
                    error,
                }
            })?;
            if !validation.valid {
                return Err(EngineError::Recovery(
                    elspeth_landscape::checkpoint::RecoveryError::Refused {
                        run_id: run_id.as_str().to_string(),
                        reason: validation
                            .error_message
                            .unwrap_or_else(|| "output target validation failed".to_string()),
                    },
                ));
            }
        }

        self.recorder.reopen_run(run_id)?;
        self.execute(pipeline, run_id, resume_point.resume_from_row_index)
    }

    /// Shared run body: register, drive, finalize, export.
    fn execute(
        &self,
        pipeline: &mut Pipeline,
        run_id: &RunId,
        start_at_index: i64,
    ) -> Result<RunReport, EngineError> {
        let graph = pipeline.build_graph()?;
        let steps = graph.assign_steps()?;
        // A resumed run already carries its graph; re-registering would
        // violate the node and edge uniqueness constraints.
        let edge_map = if self.recorder.get_nodes(run_id)?.is_empty() {
            self.register_graph(pipeline, run_id, &graph, &steps)?
        } else {
            self.recorder.get_edge_map(run_id)?
        };

        let outcome = self.drive(pipeline, run_id, &graph, &steps, &edge_map, start_at_index);
        match outcome {
            Ok(records_emitted) => {
                self.recorder.complete_run(run_id, RunStatus::Completed)?;
                if let Some(path) = &self.options.export_path {
                    export_run(&self.recorder, run_id, path)?;
                }
                let artifacts = self.recorder.get_artifacts(run_id, None)?.len();
                info!(run_id = %run_id, records_emitted, artifacts, "run completed");
                Ok(RunReport {
                    run_id: run_id.clone(),
                    status: RunStatus::Completed,
                    records_emitted,
                    artifacts,
                })
            }
            Err(err) => {
                self.recorder.complete_run(run_id, RunStatus::Failed)?;
                warn!(run_id = %run_id, error = %err, "run failed");
                Err(err)
            }
        }
    }

    /// Registers the pipeline's nodes and edges in the landscape.
    fn register_graph(
        &self,
        pipeline: &Pipeline,
        run_id: &RunId,
        graph: &ExecutionGraph,
        steps: &BTreeMap<NodeId, i64>,
    ) -> Result<BTreeMap<(NodeId, String), EdgeId>, EngineError> {
        let source_mode = pipeline.source.plugin.output_contract().mode.as_str().to_string();
        self.register_node(
            run_id,
            &pipeline.source.node_id,
            pipeline.source.plugin.name(),
            NodeType::Source,
            pipeline.source.plugin.plugin_version(),
            pipeline.source.plugin.determinism(),
            &pipeline.source.config,
            steps,
            &source_mode,
        )?;

        for stage in &pipeline.stages {
            match &stage.plugin {
                StagePlugin::Transform(plugin)
                | StagePlugin::PooledTransform {
                    plugin, ..
                } => {
                    self.register_node(
                        run_id,
                        &stage.node_id,
                        plugin.name(),
                        NodeType::Transform,
                        plugin.plugin_version(),
                        plugin.determinism(),
                        &stage.config,
                        steps,
                        "OBSERVED",
                    )?;
                }
                StagePlugin::Gate {
                    plugin,
                    fork,
                } => {
                    self.register_node(
                        run_id,
                        &stage.node_id,
                        plugin.name(),
                        NodeType::Gate,
                        plugin.plugin_version(),
                        plugin.determinism(),
                        &stage.config,
                        steps,
                        "OBSERVED",
                    )?;
                    if let Some(fork) = fork {
                        for branch in fork.branches.values() {
                            for branch_stage in branch {
                                self.register_node(
                                    run_id,
                                    &branch_stage.node_id,
                                    branch_stage.plugin.name(),
                                    NodeType::Transform,
                                    branch_stage.plugin.plugin_version(),
                                    branch_stage.plugin.determinism(),
                                    &branch_stage.config,
                                    steps,
                                    "OBSERVED",
                                )?;
                            }
                        }
                        self.register_node(
                            run_id,
                            &fork.coalesce.node_id,
                            fork.coalesce.plugin.name(),
                            NodeType::Coalesce,
                            fork.coalesce.plugin.plugin_version(),
                            Determinism::Deterministic,
                            &fork.coalesce.config,
                            steps,
                            "OBSERVED",
                        )?;
                    }
                }
                StagePlugin::Aggregation(plugin) => {
                    self.register_node(
                        run_id,
                        &stage.node_id,
                        plugin.name(),
                        NodeType::Aggregation,
                        plugin.plugin_version(),
                        plugin.determinism(),
                        &stage.config,
                        steps,
                        "OBSERVED",
                    )?;
                }
            }
        }

        for sink in
            std::iter::once(&pipeline.default_sink).chain(pipeline.route_sinks.values())
        {
            self.register_node(
                run_id,
                &sink.node_id,
                sink.plugin.name(),
                NodeType::Sink,
                sink.plugin.plugin_version(),
                sink.plugin.determinism(),
                &sink.config,
                steps,
                "OBSERVED",
            )?;
        }

        let mut edge_map = BTreeMap::new();
        for edge in graph.edges() {
            let recorded = self.recorder.register_edge(
                run_id,
                &edge.from,
                &edge.to,
                &edge.label,
                edge.default_mode,
            )?;
            edge_map.insert((edge.from.clone(), edge.label.clone()), recorded.edge_id);
        }
        Ok(edge_map)
    }

    /// Registers one node with its step as the pipeline sequence.
    #[allow(clippy::too_many_arguments, reason = "Mirrors the node registration column set.")]
    fn register_node(
        &self,
        run_id: &RunId,
        node_id: &NodeId,
        plugin_name: &str,
        node_type: NodeType,
        plugin_version: &str,
        determinism: Determinism,
        config: &JsonValue,
        steps: &BTreeMap<NodeId, i64>,
        schema_mode: &str,
    ) -> Result<(), EngineError> {
        self.recorder.register_node(
            run_id,
            NodeRegistration {
                node_id: Some(node_id.clone()),
                plugin_name: plugin_name.to_string(),
                node_type,
                plugin_version: plugin_version.to_string(),
                determinism,
                config: config.clone(),
                sequence: steps.get(node_id).copied(),
                schema_hash: None,
                schema_mode: schema_mode.to_string(),
                schema_fields_json: None,
                input_contract: None,
                output_contract: None,
            },
        )?;
        Ok(())
    }

    /// Drives every token from source to terminal outcome.
    #[allow(clippy::too_many_lines, reason = "The single-threaded drive loop reads best whole.")]
    fn drive(
        &self,
        pipeline: &mut Pipeline,
        run_id: &RunId,
        graph: &ExecutionGraph,
        steps: &BTreeMap<NodeId, i64>,
        edge_map: &BTreeMap<(NodeId, String), EdgeId>,
        start_at_index: i64,
    ) -> Result<usize, EngineError> {
        let source_executor = SourceExecutor::new(self.recorder.clone(), run_id.clone());
        let mut source_ctx =
            PluginContext::new(run_id.clone(), pipeline.source.config.clone());
        source_ctx.node_id = Some(pipeline.source.node_id.clone());
        let source_output = source_executor.run_from(
            &mut *pipeline.source.plugin,
            &mut source_ctx,
            pipeline.source.on_validation_failure,
            start_at_index,
        )?;
        let records_emitted = source_output.items.len();

        let mut agg_states: BTreeMap<NodeId, AggregationBatchState> = BTreeMap::new();
        let mut default_batch: Vec<TokenInfo> = Vec::new();
        let mut route_deliveries: Vec<(String, TokenInfo, PendingOutcome)> = Vec::new();

        for item in source_output.items {
            let SourceItem {
                token,
                state_id,
                pending_outcome,
                quarantine_destination,
            } = item;
            if let Some(destination) = quarantine_destination {
                self.record_divert(
                    &state_id,
                    edge_map,
                    &pipeline.source.node_id,
                    &destination,
                    Some(&quarantine_reason(&pending_outcome)),
                )?;
                route_deliveries.push((destination, token, pending_outcome));
                continue;
            }

            let deliveries = self.process_token(
                pipeline,
                run_id,
                steps,
                edge_map,
                &mut agg_states,
                token,
                0,
            )?;
            for delivery in deliveries {
                match delivery {
                    Delivery::Default(token) => default_batch.push(token),
                    Delivery::Route {
                        label,
                        token,
                        outcome,
                    } => route_deliveries.push((label, token, outcome)),
                }
            }
        }

        // End of input: flush every aggregation stage in step order; each
        // flush output continues through the stages after its own.
        for index in 0..pipeline.stages.len() {
            let node_id = pipeline.stages[index].node_id.clone();
            let is_aggregation =
                matches!(pipeline.stages[index].plugin, StagePlugin::Aggregation(_));
            if !is_aggregation {
                continue;
            }
            let flushed = {
                let stage = &mut pipeline.stages[index];
                let StagePlugin::Aggregation(plugin) = &mut stage.plugin else {
                    continue;
                };
                let step = steps.get(&node_id).copied().unwrap_or(0);
                let mut ctx = PluginContext::new(run_id.clone(), stage.config.clone());
                ctx.node_id = Some(node_id.clone());
                let executor = AggregationExecutor::new(self.recorder.clone(), run_id.clone());
                let batch_state = agg_states.entry(node_id.clone()).or_default();
                executor.flush(
                    &mut **plugin,
                    batch_state,
                    TriggerType::EndOfInput,
                    &mut ctx,
                    step,
                )?
            };
            if let Some((output_token, _)) = flushed {
                let deliveries = self.process_token(
                    pipeline,
                    run_id,
                    steps,
                    edge_map,
                    &mut agg_states,
                    output_token,
                    index + 1,
                )?;
                for delivery in deliveries {
                    match delivery {
                        Delivery::Default(token) => default_batch.push(token),
                        Delivery::Route {
                            label,
                            token,
                            outcome,
                        } => route_deliveries.push((label, token, outcome)),
                    }
                }
            }
        }

        // Deliver to sinks: the default batch in one write, routed tokens
        // one write each so per-token outcomes keep their error hashes.
        let sink_step = graph.sink_step()?;
        let mut checkpoint_counter = 0_usize;
        if !default_batch.is_empty() {
            self.write_sink(
                run_id,
                graph,
                &mut pipeline.default_sink,
                &default_batch,
                sink_step,
                &PendingOutcome::completed(),
                &mut checkpoint_counter,
            )?;
        }
        for (label, token, outcome) in route_deliveries {
            let sink = pipeline.route_sinks.get_mut(&label).ok_or_else(|| {
                elspeth_core::OrchestrationInvariantError::new(format!(
                    "no route sink registered for label '{label}'"
                ))
            })?;
            let tokens = vec![token];
            self.write_sink(
                run_id,
                graph,
                sink,
                &tokens,
                sink_step,
                &outcome,
                &mut checkpoint_counter,
            )?;
        }

        // Close sinks; close() is idempotent.
        pipeline.default_sink.plugin.close();
        for sink in pipeline.route_sinks.values_mut() {
            sink.plugin.close();
        }
        pipeline.source.plugin.close();

        Ok(records_emitted)
    }

    /// Advances one token through the stages from the given index.
    #[allow(clippy::too_many_lines, reason = "Stage dispatch reads best as one match.")]
    fn process_token(
        &self,
        pipeline: &mut Pipeline,
        run_id: &RunId,
        steps: &BTreeMap<NodeId, i64>,
        edge_map: &BTreeMap<(NodeId, String), EdgeId>,
        agg_states: &mut BTreeMap<NodeId, AggregationBatchState>,
        token: TokenInfo,
        from_stage: usize,
    ) -> Result<Vec<Delivery>, EngineError> {
        let transform_executor = TransformExecutor::new(self.recorder.clone(), run_id.clone());
        let gate_executor = GateExecutor::new(self.recorder.clone(), run_id.clone());
        let aggregation_executor =
            AggregationExecutor::new(self.recorder.clone(), run_id.clone());
        let coalesce_executor = CoalesceExecutor::new(self.recorder.clone(), run_id.clone());

        let mut current = token;
        let mut index = from_stage;
        while index < pipeline.stages.len() {
            let node_id = pipeline.stages[index].node_id.clone();
            let step = steps.get(&node_id).copied().unwrap_or(0);
            self.recorder.set_token_step(&current.token_id, step)?;

            let stage = &mut pipeline.stages[index];
            let mut ctx = PluginContext::new(run_id.clone(), stage.config.clone());
            ctx.node_id = Some(node_id.clone());

            match &mut stage.plugin {
                StagePlugin::Transform(plugin) => {
                    let execution =
                        transform_executor.execute(plugin.as_ref(), &current, &mut ctx, step)?;
                    match execution {
                        TransformExecution::Success {
                            row, ..
                        } => {
                            current = TokenInfo::new(current.token_id.clone(), row);
                        }
                        TransformExecution::RowError {
                            error_hash, ..
                        } => {
                            self.recorder.record_token_outcome(
                                run_id,
                                &current.token_id,
                                TokenOutcomeKind::Failed,
                                None,
                                Some(&error_hash),
                            )?;
                            return Ok(Vec::new());
                        }
                        TransformExecution::PluginFailure {
                            error,
                            state_id,
                        } => {
                            return self.apply_on_error(
                                run_id,
                                edge_map,
                                &stage.on_error,
                                &node_id,
                                step,
                                plugin.name(),
                                error,
                                &state_id,
                                current,
                            );
                        }
                    }
                }
                StagePlugin::PooledTransform {
                    plugin,
                    pool,
                } => {
                    let executor_pool = PooledExecutor::new(*pool);
                    let tokens = vec![current.clone()];
                    let mut executions = transform_executor.execute_pooled(
                        plugin.as_ref(),
                        &executor_pool,
                        &tokens,
                        &ctx,
                        step,
                    )?;
                    let Some(execution) = executions.pop() else {
                        return Ok(Vec::new());
                    };
                    match execution {
                        TransformExecution::Success {
                            row, ..
                        } => {
                            current = TokenInfo::new(current.token_id.clone(), row);
                        }
                        TransformExecution::RowError {
                            error_hash, ..
                        } => {
                            self.recorder.record_token_outcome(
                                run_id,
                                &current.token_id,
                                TokenOutcomeKind::Failed,
                                None,
                                Some(&error_hash),
                            )?;
                            return Ok(Vec::new());
                        }
                        TransformExecution::PluginFailure {
                            error,
                            state_id,
                        } => {
                            return self.apply_on_error(
                                run_id,
                                edge_map,
                                &stage.on_error,
                                &node_id,
                                step,
                                plugin.name(),
                                error,
                                &state_id,
                                current,
                            );
                        }
                    }
                }
                StagePlugin::Gate {
                    plugin, ..
                } => {
                    let outcome =
                        gate_executor.execute(plugin.as_ref(), &current, &mut ctx, step)?;
                    match outcome {
                        GateOutcome::PluginFailure {
                            error,
                            state_id,
                        } => {
                            return self.apply_on_error(
                                run_id,
                                edge_map,
                                &stage.on_error,
                                &node_id,
                                step,
                                plugin.name(),
                                error,
                                &state_id,
                                current,
                            );
                        }
                        GateOutcome::Evaluated(execution) => {
                            match execution.action.kind {
                                RoutingActionKind::Continue => {
                                    self.record_traversal(
                                        &execution.state_id,
                                        edge_map,
                                        &node_id,
                                        CONTINUE_LABEL,
                                        RoutingMode::Move,
                                        execution.action.reason(),
                                    )?;
                                    current = TokenInfo::new(
                                        current.token_id.clone(),
                                        execution.row,
                                    );
                                }
                                RoutingActionKind::Route => {
                                    let Some(label) =
                                        execution.action.destinations().first().cloned()
                                    else {
                                        return Err(
                                            elspeth_core::OrchestrationInvariantError::new(
                                                "route action carried no destination",
                                            )
                                            .into(),
                                        );
                                    };
                                    let mode = if label.starts_with("__") {
                                        RoutingMode::Divert
                                    } else {
                                        RoutingMode::Move
                                    };
                                    self.record_traversal(
                                        &execution.state_id,
                                        edge_map,
                                        &node_id,
                                        &label,
                                        mode,
                                        execution.action.reason(),
                                    )?;
                                    return Ok(vec![Delivery::Route {
                                        label,
                                        token: TokenInfo::new(
                                            current.token_id.clone(),
                                            execution.row,
                                        ),
                                        outcome: PendingOutcome::routed(),
                                    }]);
                                }
                                RoutingActionKind::ForkToPaths => {
                                    return self.fork_token(
                                        pipeline,
                                        run_id,
                                        steps,
                                        edge_map,
                                        agg_states,
                                        index,
                                        execution,
                                        current,
                                        &coalesce_executor,
                                        &transform_executor,
                                    );
                                }
                            }
                        }
                    }
                }
                StagePlugin::Aggregation(plugin) => {
                    let batch_state = agg_states.entry(node_id.clone()).or_default();
                    aggregation_executor.accumulate(
                        &mut **plugin,
                        batch_state,
                        &current,
                        &mut ctx,
                        step,
                    )?;
                    let Some(trigger) = plugin.should_flush() else {
                        // Consumed into the batch; its outcome arrives when
                        // the batch closes.
                        return Ok(Vec::new());
                    };
                    let flushed = aggregation_executor.flush(
                        &mut **plugin,
                        batch_state,
                        trigger,
                        &mut ctx,
                        step,
                    )?;
                    let Some((output_token, _)) = flushed else {
                        return Ok(Vec::new());
                    };
                    current = output_token;
                }
            }
            index += 1;
        }

        Ok(vec![Delivery::Default(current)])
    }

    /// Forks a token down branch chains and coalesces the results.
    #[allow(clippy::too_many_arguments, reason = "Fork handling spans the drive context.")]
    fn fork_token(
        &self,
        pipeline: &mut Pipeline,
        run_id: &RunId,
        steps: &BTreeMap<NodeId, i64>,
        edge_map: &BTreeMap<(NodeId, String), EdgeId>,
        agg_states: &mut BTreeMap<NodeId, AggregationBatchState>,
        gate_index: usize,
        execution: crate::executors::GateExecution,
        parent: TokenInfo,
        coalesce_executor: &CoalesceExecutor,
        transform_executor: &TransformExecutor,
    ) -> Result<Vec<Delivery>, EngineError> {
        let gate_node_id = pipeline.stages[gate_index].node_id.clone();
        let destinations: Vec<String> = execution.action.destinations().to_vec();
        let parent_row_id = self
            .recorder
            .get_token(&parent.token_id)?
            .map(|token| token.row_id)
            .ok_or_else(|| {
                elspeth_core::OrchestrationInvariantError::new(format!(
                    "token '{}' has no row record",
                    parent.token_id
                ))
            })?;

        // The parent identity ends at the fork.
        self.recorder.record_token_outcome(
            run_id,
            &parent.token_id,
            TokenOutcomeKind::Forked,
            None,
            None,
        )?;

        let has_branches = matches!(
            &pipeline.stages[gate_index].plugin,
            StagePlugin::Gate { fork: Some(_), .. }
        );

        if has_branches {
            // Run each branch chain on a child copy, then coalesce.
            let mut branch_outputs: Vec<TokenInfo> = Vec::new();
            for label in &destinations {
                let child = self.recorder.create_token(&parent_row_id)?;
                let mut child_token =
                    TokenInfo::new(child.token_id, execution.row.clone());
                self.record_traversal(
                    &execution.state_id,
                    edge_map,
                    &gate_node_id,
                    label,
                    RoutingMode::Copy,
                    execution.action.reason(),
                )?;

                let StagePlugin::Gate {
                    fork: Some(fork), ..
                } = &pipeline.stages[gate_index].plugin
                else {
                    continue;
                };
                let Some(branch) = fork.branches.get(label) else {
                    return Err(elspeth_core::OrchestrationInvariantError::new(format!(
                        "fork destination '{label}' has no branch chain"
                    ))
                    .into());
                };
                for branch_stage in branch {
                    let branch_step =
                        steps.get(&branch_stage.node_id).copied().unwrap_or(0);
                    self.recorder.set_token_step(&child_token.token_id, branch_step)?;
                    let mut branch_ctx =
                        PluginContext::new(run_id.clone(), branch_stage.config.clone());
                    branch_ctx.node_id = Some(branch_stage.node_id.clone());
                    let branch_execution = transform_executor.execute(
                        branch_stage.plugin.as_ref(),
                        &child_token,
                        &mut branch_ctx,
                        branch_step,
                    )?;
                    match branch_execution {
                        TransformExecution::Success {
                            row, ..
                        } => {
                            child_token =
                                TokenInfo::new(child_token.token_id.clone(), row);
                        }
                        TransformExecution::RowError {
                            ..
                        }
                        | TransformExecution::PluginFailure {
                            ..
                        } => {
                            // A partial fork family cannot be coalesced;
                            // branch failures fail the run.
                            return Err(EngineError::Plugin {
                                plugin: branch_stage.plugin.name().to_string(),
                                error: elspeth_core::PluginError::permanent(
                                    "ForkBranchFailure",
                                    format!(
                                        "branch '{label}' failed at node '{}'",
                                        branch_stage.node_id
                                    ),
                                ),
                            });
                        }
                    }
                }
                branch_outputs.push(child_token);
            }

            let StagePlugin::Gate {
                fork: Some(fork), ..
            } = &pipeline.stages[gate_index].plugin
            else {
                return Ok(Vec::new());
            };
            let coalesce_step = steps.get(&fork.coalesce.node_id).copied().unwrap_or(0);
            let mut coalesce_ctx =
                PluginContext::new(run_id.clone(), fork.coalesce.config.clone());
            coalesce_ctx.node_id = Some(fork.coalesce.node_id.clone());
            let merged = coalesce_executor.merge(
                &*fork.coalesce.plugin,
                &branch_outputs,
                &mut coalesce_ctx,
                coalesce_step,
            )?;
            let Some(merged_token) = merged else {
                return Ok(Vec::new());
            };
            return self.process_token(
                pipeline,
                run_id,
                steps,
                edge_map,
                agg_states,
                merged_token,
                gate_index + 1,
            );
        }

        // No branch chains: every destination is a route sink.
        let mut deliveries = Vec::new();
        for label in &destinations {
            let child = self.recorder.create_token(&parent_row_id)?;
            self.record_traversal(
                &execution.state_id,
                edge_map,
                &gate_node_id,
                label,
                RoutingMode::Copy,
                execution.action.reason(),
            )?;
            deliveries.push(Delivery::Route {
                label: label.clone(),
                token: TokenInfo::new(child.token_id, execution.row.clone()),
                outcome: PendingOutcome::completed(),
            });
        }
        Ok(deliveries)
    }

    /// Applies a stage's `on_error` policy to a plugin failure.
    #[allow(clippy::too_many_arguments, reason = "Policy handling spans the drive context.")]
    fn apply_on_error(
        &self,
        run_id: &RunId,
        edge_map: &BTreeMap<(NodeId, String), EdgeId>,
        policy: &OnErrorPolicy,
        node_id: &NodeId,
        step: i64,
        plugin_name: &str,
        error: elspeth_core::PluginError,
        state_id: &StateId,
        token: TokenInfo,
    ) -> Result<Vec<Delivery>, EngineError> {
        match policy {
            OnErrorPolicy::Fail => Err(EngineError::Plugin {
                plugin: plugin_name.to_string(),
                error,
            }),
            OnErrorPolicy::Discard => {
                let error_hash = stable_hash_raw(&json!({
                    "error_type": error.error_type,
                    "message": error.message,
                }))?;
                self.recorder.record_token_outcome(
                    run_id,
                    &token.token_id,
                    TokenOutcomeKind::Failed,
                    None,
                    Some(&error_hash),
                )?;
                warn!(
                    token_id = %token.token_id,
                    plugin = plugin_name,
                    "token discarded after plugin failure"
                );
                Ok(Vec::new())
            }
            OnErrorPolicy::Route {
                label,
            } => {
                let mut reason = JsonMap::new();
                reason.insert("error_type".to_string(), JsonValue::from(error.error_type));
                reason.insert("message".to_string(), JsonValue::from(error.message));
                let divert = error_label(step);
                self.record_divert(state_id, edge_map, node_id, &divert, Some(&reason))?;
                Ok(vec![Delivery::Route {
                    label: label.clone(),
                    token,
                    outcome: PendingOutcome::routed(),
                }])
            }
        }
    }

    /// Writes a batch to a sink, wiring the checkpoint callback.
    #[allow(clippy::too_many_arguments, reason = "Sink delivery spans the drive context.")]
    fn write_sink(
        &self,
        run_id: &RunId,
        graph: &ExecutionGraph,
        sink: &mut SinkSpec,
        tokens: &[TokenInfo],
        sink_step: i64,
        outcome: &PendingOutcome,
        checkpoint_counter: &mut usize,
    ) -> Result<(), EngineError> {
        let sink_executor = SinkExecutor::new(self.recorder.clone(), run_id.clone());
        let mut ctx = PluginContext::new(run_id.clone(), sink.config.clone());
        ctx.node_id = Some(sink.node_id.clone());
        for token in tokens {
            self.recorder.set_token_step(&token.token_id, sink_step)?;
        }

        let checkpoints = &self.checkpoints;
        let recorder_run_id = run_id.clone();
        let node_id = sink.node_id.clone();
        let every_n = self.options.checkpoint_every_n.max(1);
        let enabled = self.options.checkpoints_enabled;
        let mut callback = move |token: &TokenInfo| -> Result<(), EngineError> {
            if !enabled {
                return Ok(());
            }
            *checkpoint_counter += 1;
            if *checkpoint_counter % every_n != 0 {
                return Ok(());
            }
            checkpoints
                .create_checkpoint(&recorder_run_id, &token.token_id, &node_id, graph)
                .map(|_| ())
                .map_err(EngineError::Recovery)
        };

        sink_executor.write(
            &mut *sink.plugin,
            tokens,
            &mut ctx,
            sink_step,
            &sink.name,
            outcome,
            Some(&mut callback),
        )?;
        Ok(())
    }

    /// Records a DIVERT traversal with its reason.
    fn record_divert(
        &self,
        state_id: &StateId,
        edge_map: &BTreeMap<(NodeId, String), EdgeId>,
        from: &NodeId,
        label: &str,
        reason: Option<&JsonMap<String, JsonValue>>,
    ) -> Result<(), EngineError> {
        let edge_id = edge_map.get(&(from.clone(), label.to_string())).ok_or_else(|| {
            elspeth_core::OrchestrationInvariantError::new(format!(
                "no edge registered for ('{from}', '{label}')"
            ))
        })?;
        self.recorder.record_routing_event(state_id, edge_id, RoutingMode::Divert, reason)?;
        Ok(())
    }

    /// Records a traversal along a labeled edge with an explicit mode.
    fn record_traversal(
        &self,
        state_id: &StateId,
        edge_map: &BTreeMap<(NodeId, String), EdgeId>,
        from: &NodeId,
        label: &str,
        mode: RoutingMode,
        reason: Option<&JsonMap<String, JsonValue>>,
    ) -> Result<(), EngineError> {
        let edge_id = edge_map.get(&(from.clone(), label.to_string())).ok_or_else(|| {
            elspeth_core::OrchestrationInvariantError::new(format!(
                "no edge registered for ('{from}', '{label}')"
            ))
        })?;
        self.recorder.record_routing_event(state_id, edge_id, mode, reason)?;
        Ok(())
    }
}

/// Reason payload for a quarantine divert.
fn quarantine_reason(outcome: &PendingOutcome) -> JsonMap<String, JsonValue> {
    let mut reason = JsonMap::new();
    reason.insert("reason".to_string(), JsonValue::from("validation_failure"));
    if let Some(error_hash) = &outcome.error_hash {
        reason.insert("error_hash".to_string(), JsonValue::from(error_hash.clone()));
    }
    reason
}
