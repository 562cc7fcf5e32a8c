// elspeth-engine/src/pipeline.rs
// ============================================================================
// Module: Pipeline Model
// Description: The assembled pipeline a run executes.
// Purpose: Bind plugin instances, policies, and routes into a typed DAG.
// Dependencies: elspeth-core
// ============================================================================

//! ## Overview
//! A pipeline is a source, a main chain of processing stages, a default
//! sink, and a set of named route sinks (quarantine, error, and gate
//! routes). Gates may additionally carry fork branches that re-join at a
//! coalesce node. The orchestrator materializes this model into the
//! execution graph, registers it in the landscape, and drives tokens
//! through it.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;

use elspeth_core::AggregationPlugin;
use elspeth_core::CoalescePlugin;
use elspeth_core::EdgeMode;
use elspeth_core::ExecutionGraph;
use elspeth_core::GatePlugin;
use elspeth_core::GraphEdge;
use elspeth_core::GraphNode;
use elspeth_core::GraphValidationError;
use elspeth_core::NodeId;
use elspeth_core::NodeKind;
use elspeth_core::SinkPlugin;
use elspeth_core::SourcePlugin;
use elspeth_core::TransformPlugin;
use elspeth_core::stable_hash_raw;
use serde_json::Value as JsonValue;

use crate::executors::ValidationFailurePolicy;
use crate::pool::PoolConfig;

// ============================================================================
// SECTION: Labels
// ============================================================================

/// Default-flow edge label.
pub const CONTINUE_LABEL: &str = "continue";
/// Divert label for quarantined rows.
pub const QUARANTINE_LABEL: &str = "__quarantine__";

/// Divert label for a failing node at the given step.
#[must_use]
pub fn error_label(step_index: i64) -> String {
    format!("__error_{step_index}__")
}

// ============================================================================
// SECTION: Policies
// ============================================================================

/// Per-node policy for plugin failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OnErrorPolicy {
    /// Divert the token to the named route sink.
    Route {
        /// Route sink label.
        label: String,
    },
    /// Drop the token with a failed outcome; the error event remains.
    Discard,
    /// Fail the run.
    Fail,
}

// ============================================================================
// SECTION: Pipeline Nodes
// ============================================================================

/// The source node of a pipeline.
pub struct SourceSpec {
    /// Node identifier.
    pub node_id: NodeId,
    /// Source plugin instance.
    pub plugin: Box<dyn SourcePlugin>,
    /// Resolved plugin configuration.
    pub config: JsonValue,
    /// Policy for rows failing source validation.
    pub on_validation_failure: ValidationFailurePolicy,
}

/// A transform branch stage inside a fork.
pub struct BranchStage {
    /// Node identifier.
    pub node_id: NodeId,
    /// Transform plugin instance.
    pub plugin: Arc<dyn TransformPlugin>,
    /// Resolved plugin configuration.
    pub config: JsonValue,
}

/// The coalesce node terminating a fork.
pub struct CoalesceSpec {
    /// Node identifier.
    pub node_id: NodeId,
    /// Coalesce policy plugin.
    pub plugin: Box<dyn CoalescePlugin>,
    /// Resolved plugin configuration.
    pub config: JsonValue,
}

/// Fork branches re-joining at a coalesce node.
pub struct ForkJoin {
    /// Branch chains by fork label.
    pub branches: BTreeMap<String, Vec<BranchStage>>,
    /// The coalesce node every branch feeds.
    pub coalesce: CoalesceSpec,
}

/// The plugin behind a main-chain stage.
pub enum StagePlugin {
    /// Row-at-a-time transform.
    Transform(Arc<dyn TransformPlugin>),
    /// Transform dispatched through the pooled retry executor.
    PooledTransform {
        /// Transform plugin instance.
        plugin: Arc<dyn TransformPlugin>,
        /// Pool configuration for this stage.
        pool: PoolConfig,
    },
    /// Routing gate, optionally carrying fork branches.
    Gate {
        /// Gate plugin instance.
        plugin: Box<dyn GatePlugin>,
        /// Fork branches, when the gate forks to re-joining paths.
        fork: Option<ForkJoin>,
    },
    /// Batch aggregation.
    Aggregation(Box<dyn AggregationPlugin>),
}

/// One main-chain processing stage.
pub struct StageSpec {
    /// Node identifier.
    pub node_id: NodeId,
    /// The stage plugin.
    pub plugin: StagePlugin,
    /// Resolved plugin configuration.
    pub config: JsonValue,
    /// Policy for plugin failures at this stage.
    pub on_error: OnErrorPolicy,
}

/// A sink node.
pub struct SinkSpec {
    /// Node identifier.
    pub node_id: NodeId,
    /// Sink name used in outcomes and reports.
    pub name: String,
    /// Sink plugin instance.
    pub plugin: Box<dyn SinkPlugin>,
    /// Resolved plugin configuration.
    pub config: JsonValue,
}

/// The assembled pipeline.
pub struct Pipeline {
    /// The source.
    pub source: SourceSpec,
    /// Main-chain stages in order.
    pub stages: Vec<StageSpec>,
    /// The default sink for tokens completing the chain.
    pub default_sink: SinkSpec,
    /// Named route sinks: quarantine, error, and gate routes.
    pub route_sinks: BTreeMap<String, SinkSpec>,
}

impl Pipeline {
    /// Materializes the execution graph for this pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`GraphValidationError`] for malformed topologies.
    pub fn build_graph(&self) -> Result<ExecutionGraph, GraphValidationError> {
        let mut graph = ExecutionGraph::new();

        graph.add_node(GraphNode {
            node_id: self.source.node_id.clone(),
            kind: NodeKind::Source,
            plugin_name: self.source.plugin.name().to_string(),
            plugin_version: self.source.plugin.plugin_version().to_string(),
            config_hash: config_hash(&self.source.config)?,
        })?;

        for stage in &self.stages {
            let (kind, plugin_name, plugin_version) = match &stage.plugin {
                StagePlugin::Transform(plugin)
                | StagePlugin::PooledTransform {
                    plugin, ..
                } => (
                    NodeKind::Transform,
                    plugin.name().to_string(),
                    plugin.plugin_version().to_string(),
                ),
                StagePlugin::Gate {
                    plugin, ..
                } => {
                    (NodeKind::Gate, plugin.name().to_string(), plugin.plugin_version().to_string())
                }
                StagePlugin::Aggregation(plugin) => (
                    NodeKind::Aggregation,
                    plugin.name().to_string(),
                    plugin.plugin_version().to_string(),
                ),
            };
            graph.add_node(GraphNode {
                node_id: stage.node_id.clone(),
                kind,
                plugin_name,
                plugin_version,
                config_hash: config_hash(&stage.config)?,
            })?;

            if let StagePlugin::Gate {
                fork: Some(fork), ..
            } = &stage.plugin
            {
                for branch in fork.branches.values() {
                    for branch_stage in branch {
                        graph.add_node(GraphNode {
                            node_id: branch_stage.node_id.clone(),
                            kind: NodeKind::Transform,
                            plugin_name: branch_stage.plugin.name().to_string(),
                            plugin_version: branch_stage.plugin.plugin_version().to_string(),
                            config_hash: config_hash(&branch_stage.config)?,
                        })?;
                    }
                }
                graph.add_node(GraphNode {
                    node_id: fork.coalesce.node_id.clone(),
                    kind: NodeKind::Coalesce,
                    plugin_name: fork.coalesce.plugin.name().to_string(),
                    plugin_version: fork.coalesce.plugin.plugin_version().to_string(),
                    config_hash: config_hash(&fork.coalesce.config)?,
                })?;
            }
        }

        for sink in std::iter::once(&self.default_sink).chain(self.route_sinks.values()) {
            graph.add_node(GraphNode {
                node_id: sink.node_id.clone(),
                kind: NodeKind::Sink,
                plugin_name: sink.plugin.name().to_string(),
                plugin_version: sink.plugin.plugin_version().to_string(),
                config_hash: config_hash(&sink.config)?,
            })?;
        }

        // Main chain: source through stages to the default sink, with fork
        // branches spliced between their gate and the following stage.
        let mut previous: NodeId = self.source.node_id.clone();
        for stage in &self.stages {
            graph.add_edge(GraphEdge {
                from: previous.clone(),
                to: stage.node_id.clone(),
                label: CONTINUE_LABEL.to_string(),
                default_mode: EdgeMode::Move,
            })?;
            previous = stage.node_id.clone();

            if let StagePlugin::Gate {
                fork: Some(fork), ..
            } = &stage.plugin
            {
                for (label, branch) in &fork.branches {
                    let mut branch_previous = stage.node_id.clone();
                    let mut branch_label = label.clone();
                    for branch_stage in branch {
                        graph.add_edge(GraphEdge {
                            from: branch_previous.clone(),
                            to: branch_stage.node_id.clone(),
                            label: branch_label.clone(),
                            default_mode: if branch_previous == stage.node_id {
                                EdgeMode::Copy
                            } else {
                                EdgeMode::Move
                            },
                        })?;
                        branch_previous = branch_stage.node_id.clone();
                        branch_label = CONTINUE_LABEL.to_string();
                    }
                    graph.add_edge(GraphEdge {
                        from: branch_previous,
                        to: fork.coalesce.node_id.clone(),
                        label: branch_label,
                        default_mode: EdgeMode::Move,
                    })?;
                }
                previous = fork.coalesce.node_id.clone();
            }
        }
        graph.add_edge(GraphEdge {
            from: previous,
            to: self.default_sink.node_id.clone(),
            label: CONTINUE_LABEL.to_string(),
            default_mode: EdgeMode::Move,
        })?;

        // Quarantine divert from the source.
        if let Some(quarantine) = self.route_sinks.get(QUARANTINE_LABEL) {
            graph.add_edge(GraphEdge {
                from: self.source.node_id.clone(),
                to: quarantine.node_id.clone(),
                label: QUARANTINE_LABEL.to_string(),
                default_mode: EdgeMode::Divert,
            })?;
        }

        // Gate routes and per-stage error diverts.
        let steps = graph.assign_steps()?;
        for stage in &self.stages {
            if let StagePlugin::Gate {
                ..
            } = &stage.plugin
            {
                for (label, sink) in &self.route_sinks {
                    if label == QUARANTINE_LABEL || graph.edge(&stage.node_id, label).is_some() {
                        continue;
                    }
                    let mode = if label.starts_with("__") {
                        EdgeMode::Divert
                    } else {
                        EdgeMode::Move
                    };
                    graph.add_edge(GraphEdge {
                        from: stage.node_id.clone(),
                        to: sink.node_id.clone(),
                        label: label.clone(),
                        default_mode: mode,
                    })?;
                }
            }
            if let OnErrorPolicy::Route {
                label,
            } = &stage.on_error
            {
                let sink = self.route_sinks.get(label).ok_or_else(|| {
                    GraphValidationError::UnknownNode {
                        node_id: NodeId::new(label.as_str()),
                    }
                })?;
                let step = steps.get(&stage.node_id).copied().unwrap_or(0);
                graph.add_edge(GraphEdge {
                    from: stage.node_id.clone(),
                    to: sink.node_id.clone(),
                    label: error_label(step),
                    default_mode: EdgeMode::Divert,
                })?;
            }
        }

        Ok(graph)
    }
}

/// Stable hash of a node's resolved configuration.
fn config_hash(config: &JsonValue) -> Result<String, GraphValidationError> {
    Ok(stable_hash_raw(config)?)
}
