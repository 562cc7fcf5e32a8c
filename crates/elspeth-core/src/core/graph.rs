// elspeth-core/src/core/graph.rs
// ============================================================================
// Module: ELSPETH Execution Graph
// Description: Typed node and edge registry with topological step assignment.
// Purpose: Model the DAG a run executes and fingerprint it for resume checks.
// Dependencies: serde_json, crate::core::{canonical, identifiers, records}
// ============================================================================

//! ## Overview
//! The execution graph is the in-memory DAG built from node and edge
//! registration. Step indices are assigned topologically (source at zero,
//! each downstream node one past its furthest predecessor, sinks last), and
//! the graph fingerprint is a stable hash over the sorted node and edge
//! tuples. Resume refuses to proceed when the fingerprint differs from the
//! one stored with the checkpoint.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use serde_json::json;
use thiserror::Error;

use crate::core::canonical::CanonicalError;
use crate::core::canonical::stable_hash_raw;
use crate::core::identifiers::NodeId;
use crate::core::records::NodeType;
use crate::core::records::RoutingMode;

// ============================================================================
// SECTION: Node & Edge
// ============================================================================

/// Node kind alias used by the graph; identical to the audit node type.
pub type NodeKind = NodeType;

/// Edge mode alias used by the graph; identical to the audit routing mode.
pub type EdgeMode = RoutingMode;

/// A node registered in the execution graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphNode {
    /// Node identifier.
    pub node_id: NodeId,
    /// Node kind.
    pub kind: NodeKind,
    /// Plugin name.
    pub plugin_name: String,
    /// Plugin version string.
    pub plugin_version: String,
    /// Stable hash of the node configuration.
    pub config_hash: String,
}

/// An edge registered in the execution graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphEdge {
    /// Source node.
    pub from: NodeId,
    /// Destination node.
    pub to: NodeId,
    /// Edge label: `continue`, a route name, or a divert label.
    pub label: String,
    /// Default traversal mode.
    pub default_mode: EdgeMode,
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised while building or validating the execution graph.
#[derive(Debug, Error)]
pub enum GraphValidationError {
    /// A node id was registered twice.
    #[error("node '{node_id}' registered twice")]
    DuplicateNode {
        /// The duplicated node id.
        node_id: NodeId,
    },
    /// Two edges share the same `(from, label)` pair.
    #[error("edge from '{from}' with label '{label}' registered twice")]
    DuplicateEdge {
        /// Source node of the duplicated edge.
        from: NodeId,
        /// Duplicated label.
        label: String,
    },
    /// An edge referenced an unregistered node.
    #[error("edge references unknown node '{node_id}'")]
    UnknownNode {
        /// The unknown node id.
        node_id: NodeId,
    },
    /// The graph contains a cycle and cannot be stepped.
    #[error("execution graph contains a cycle involving node '{node_id}'")]
    Cycle {
        /// A node on the detected cycle.
        node_id: NodeId,
    },
    /// The graph has no source node.
    #[error("execution graph has no source node")]
    MissingSource,
    /// Fingerprinting the graph failed.
    #[error(transparent)]
    Canonical(#[from] CanonicalError),
}

// ============================================================================
// SECTION: Execution Graph
// ============================================================================

/// In-memory DAG of a run.
#[derive(Debug, Clone, Default)]
pub struct ExecutionGraph {
    /// Registered nodes by id.
    nodes: BTreeMap<NodeId, GraphNode>,
    /// Registered edges keyed by `(from, label)`.
    edges: BTreeMap<(NodeId, String), GraphEdge>,
}

impl ExecutionGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a node.
    ///
    /// # Errors
    ///
    /// Returns [`GraphValidationError::DuplicateNode`] when the id is taken.
    pub fn add_node(&mut self, node: GraphNode) -> Result<(), GraphValidationError> {
        if self.nodes.contains_key(&node.node_id) {
            return Err(GraphValidationError::DuplicateNode {
                node_id: node.node_id,
            });
        }
        self.nodes.insert(node.node_id.clone(), node);
        Ok(())
    }

    /// Registers an edge.
    ///
    /// # Errors
    ///
    /// Returns [`GraphValidationError::UnknownNode`] when either endpoint is
    /// unregistered and [`GraphValidationError::DuplicateEdge`] when the
    /// `(from, label)` pair is taken.
    pub fn add_edge(&mut self, edge: GraphEdge) -> Result<(), GraphValidationError> {
        if !self.nodes.contains_key(&edge.from) {
            return Err(GraphValidationError::UnknownNode {
                node_id: edge.from,
            });
        }
        if !self.nodes.contains_key(&edge.to) {
            return Err(GraphValidationError::UnknownNode {
                node_id: edge.to,
            });
        }
        let key = (edge.from.clone(), edge.label.clone());
        if self.edges.contains_key(&key) {
            return Err(GraphValidationError::DuplicateEdge {
                from: key.0,
                label: key.1,
            });
        }
        self.edges.insert(key, edge);
        Ok(())
    }

    /// Looks up a node.
    #[must_use]
    pub fn node(&self, node_id: &NodeId) -> Option<&GraphNode> {
        self.nodes.get(node_id)
    }

    /// All nodes in id order.
    pub fn nodes(&self) -> impl Iterator<Item = &GraphNode> {
        self.nodes.values()
    }

    /// All edges in `(from, label)` order.
    pub fn edges(&self) -> impl Iterator<Item = &GraphEdge> {
        self.edges.values()
    }

    /// Resolves the edge leaving `from` under `label`.
    #[must_use]
    pub fn edge(&self, from: &NodeId, label: &str) -> Option<&GraphEdge> {
        self.edges.get(&(from.clone(), label.to_string()))
    }

    /// Outgoing edges of a node, in label order.
    pub fn outgoing(&self, from: &NodeId) -> impl Iterator<Item = &GraphEdge> {
        self.edges.values().filter(move |edge| &edge.from == from)
    }

    /// Assigns topological step indices.
    ///
    /// The source takes step zero; every downstream processing node takes
    /// `max(predecessor steps) + 1`; every sink takes the deterministic last
    /// step `max(processing steps) + 1`.
    ///
    /// # Errors
    ///
    /// Returns [`GraphValidationError::MissingSource`] when no source exists
    /// and [`GraphValidationError::Cycle`] when the graph is not acyclic.
    pub fn assign_steps(&self) -> Result<BTreeMap<NodeId, i64>, GraphValidationError> {
        if !self.nodes.values().any(|node| node.kind == NodeKind::Source) {
            return Err(GraphValidationError::MissingSource);
        }

        // Kahn's algorithm over non-sink nodes; sinks are pinned afterwards.
        let mut indegree: BTreeMap<&NodeId, usize> = self
            .nodes
            .keys()
            .map(|node_id| (node_id, 0))
            .collect();
        for edge in self.edges.values() {
            if let Some(count) = indegree.get_mut(&edge.to) {
                *count += 1;
            }
        }

        let mut ready: Vec<&NodeId> = indegree
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(node_id, _)| *node_id)
            .collect();
        let mut steps: BTreeMap<NodeId, i64> = BTreeMap::new();
        let mut visited: BTreeSet<&NodeId> = BTreeSet::new();

        while let Some(node_id) = ready.pop() {
            visited.insert(node_id);
            let step = self
                .edges
                .values()
                .filter(|edge| &edge.to == node_id)
                .filter_map(|edge| steps.get(&edge.from))
                .max()
                .map_or(0, |max_pred| max_pred + 1);
            steps.insert(node_id.clone(), step);

            for edge in self.edges.values().filter(|edge| &edge.from == node_id) {
                if let Some(count) = indegree.get_mut(&edge.to) {
                    *count -= 1;
                    if *count == 0 {
                        ready.push(&edge.to);
                    }
                }
            }
        }

        if let Some(unvisited) = self.nodes.keys().find(|node_id| !visited.contains(node_id)) {
            return Err(GraphValidationError::Cycle {
                node_id: unvisited.clone(),
            });
        }

        // Sinks take a deterministic last step past every processing node.
        let processing_max = self
            .nodes
            .values()
            .filter(|node| node.kind != NodeKind::Sink)
            .filter_map(|node| steps.get(&node.node_id))
            .max()
            .copied()
            .unwrap_or(0);
        for node in self.nodes.values() {
            if node.kind == NodeKind::Sink {
                steps.insert(node.node_id.clone(), processing_max + 1);
            }
        }

        Ok(steps)
    }

    /// The deterministic sink step: one past the furthest processing node.
    ///
    /// # Errors
    ///
    /// Propagates [`GraphValidationError`] from step assignment.
    pub fn sink_step(&self) -> Result<i64, GraphValidationError> {
        let steps = self.assign_steps()?;
        Ok(self
            .nodes
            .values()
            .filter(|node| node.kind != NodeKind::Sink)
            .filter_map(|node| steps.get(&node.node_id))
            .max()
            .copied()
            .unwrap_or(0)
            + 1)
    }

    /// Stable fingerprint over the sorted node and edge tuples.
    ///
    /// Nodes contribute `(id, kind, plugin_name, plugin_version,
    /// config_hash)`; edges contribute `(from, to, label, default_mode)`.
    ///
    /// # Errors
    ///
    /// Returns [`GraphValidationError::Canonical`] when hashing fails.
    pub fn fingerprint(&self) -> Result<String, GraphValidationError> {
        let nodes: Vec<serde_json::Value> = self
            .nodes
            .values()
            .map(|node| {
                json!([
                    node.node_id.as_str(),
                    node.kind.as_str(),
                    node.plugin_name,
                    node.plugin_version,
                    node.config_hash,
                ])
            })
            .collect();
        let edges: Vec<serde_json::Value> = self
            .edges
            .values()
            .map(|edge| {
                json!([
                    edge.from.as_str(),
                    edge.to.as_str(),
                    edge.label,
                    edge.default_mode.as_str(),
                ])
            })
            .collect();
        Ok(stable_hash_raw(&json!({
            "nodes": nodes,
            "edges": edges,
        }))?)
    }
}
