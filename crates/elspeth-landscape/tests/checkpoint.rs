// elspeth-landscape/tests/checkpoint.rs
// ============================================================================
// Module: Checkpoint & Recovery Tests
// Description: Tests for checkpoint sequencing and resume integrity gates.
// ============================================================================
//! ## Overview
//! Validates checkpoint id shape, per-run sequence monotonicity, latest
//! lookup scoping, graph drift refusal, and contract tamper detection.

#![allow(
    clippy::panic,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    clippy::dbg_macro,
    clippy::panic_in_result_fn,
    clippy::unwrap_in_result,
    reason = "Test-only output and panic-based assertions are permitted."
)]

use std::sync::Arc;

use elspeth_core::EdgeMode;
use elspeth_core::ExecutionGraph;
use elspeth_core::FieldContract;
use elspeth_core::FieldType;
use elspeth_core::GraphEdge;
use elspeth_core::GraphNode;
use elspeth_core::NodeId;
use elspeth_core::NodeKind;
use elspeth_core::NodeType;
use elspeth_core::Determinism;
use elspeth_core::RowData;
use elspeth_core::RunId;
use elspeth_core::SchemaContract;
use elspeth_core::SchemaMode;
use elspeth_core::TokenId;
use elspeth_core::Value;
use elspeth_landscape::CheckpointManager;
use elspeth_landscape::FilesystemPayloadStore;
use elspeth_landscape::RecoveryManager;
use elspeth_landscape::checkpoint::RecoveryError;
use elspeth_landscape::recorder::LandscapeDb;
use elspeth_landscape::recorder::LandscapeRecorder;
use elspeth_landscape::recorder::NodeRegistration;
use serde_json::json;

/// Builds a recorder backed by a temporary payload store.
fn build_recorder(dir: &tempfile::TempDir) -> LandscapeRecorder {
    let db = LandscapeDb::in_memory().unwrap();
    let payloads = FilesystemPayloadStore::open(dir.path().join("payloads")).unwrap();
    LandscapeRecorder::new(db, Arc::new(payloads))
}

/// Builds the canonical source -> transform -> sink test graph.
fn test_graph() -> ExecutionGraph {
    let mut graph = ExecutionGraph::new();
    for (id, kind) in [
        ("source-node", NodeKind::Source),
        ("transform-node", NodeKind::Transform),
        ("sink-node", NodeKind::Sink),
    ] {
        graph
            .add_node(GraphNode {
                node_id: NodeId::new(id),
                kind,
                plugin_name: format!("test-{id}"),
                plugin_version: "1.0".to_string(),
                config_hash: "cfg".to_string(),
            })
            .unwrap();
    }
    graph
        .add_edge(GraphEdge {
            from: NodeId::new("source-node"),
            to: NodeId::new("transform-node"),
            label: "continue".to_string(),
            default_mode: EdgeMode::Move,
        })
        .unwrap();
    graph
        .add_edge(GraphEdge {
            from: NodeId::new("transform-node"),
            to: NodeId::new("sink-node"),
            label: "continue".to_string(),
            default_mode: EdgeMode::Move,
        })
        .unwrap();
    graph
}

/// Seeds a run with one row and token, returning `(run_id, token_id)`.
fn seed_run(recorder: &LandscapeRecorder) -> (RunId, TokenId) {
    let run = recorder.begin_run(&json!({"pipeline": "cp"}), "sha256-rfc8785-v1").unwrap();
    let source = recorder
        .register_node(
            &run.run_id,
            NodeRegistration {
                node_id: Some(NodeId::new("source-node")),
                plugin_name: "test-source".to_string(),
                node_type: NodeType::Source,
                plugin_version: "1.0".to_string(),
                determinism: Determinism::IoRead,
                config: json!({}),
                sequence: Some(0),
                schema_hash: None,
                schema_mode: "OBSERVED".to_string(),
                schema_fields_json: None,
                input_contract: None,
                output_contract: None,
            },
        )
        .unwrap();
    let mut data = RowData::new();
    data.insert("id".to_string(), Value::Int(1));
    let row = recorder.create_row(&run.run_id, &source.node_id, 0, &data).unwrap();
    let token = recorder.create_token(&row.row_id).unwrap();
    (run.run_id, token.token_id)
}

/// The FIXED contract used by tamper tests.
fn stored_contract() -> SchemaContract {
    SchemaContract::new(
        SchemaMode::Fixed,
        vec![
            FieldContract::declared("id", FieldType::Int),
            FieldContract::declared("value", FieldType::Text),
        ],
        true,
    )
    .unwrap()
}

// ============================================================================
// SECTION: Checkpoint Sequencing
// ============================================================================

/// Tests checkpoint id shape and strictly increasing sequence numbers.
#[test]
fn test_checkpoint_ids_and_sequences() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = build_recorder(&dir);
    let manager = CheckpointManager::new(recorder.db().clone());
    let graph = test_graph();
    let (run_id, token_id) = seed_run(&recorder);

    let mut previous = 0;
    let mut seen = std::collections::BTreeSet::new();
    for _ in 0..3 {
        let checkpoint = manager
            .create_checkpoint(&run_id, &token_id, &NodeId::new("sink-node"), &graph)
            .unwrap();
        let id = checkpoint.checkpoint_id.as_str();
        assert!(id.starts_with("cp-"));
        assert_eq!(id.len(), 35);
        assert!(id[3..].chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert!(seen.insert(id.to_string()));
        assert!(checkpoint.sequence_number > previous);
        previous = checkpoint.sequence_number;
    }
}

/// Tests that the latest checkpoint never mixes runs.
#[test]
fn test_latest_checkpoint_scoped_to_run() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = build_recorder(&dir);
    let manager = CheckpointManager::new(recorder.db().clone());
    let graph = test_graph();

    let (run_a, token_a) = seed_run(&recorder);
    let (run_b, token_b) = seed_run(&recorder);

    manager.create_checkpoint(&run_a, &token_a, &NodeId::new("sink-node"), &graph).unwrap();
    manager.create_checkpoint(&run_a, &token_a, &NodeId::new("sink-node"), &graph).unwrap();
    manager.create_checkpoint(&run_b, &token_b, &NodeId::new("sink-node"), &graph).unwrap();

    let latest_a = manager.get_latest_checkpoint(&run_a).unwrap().unwrap();
    let latest_b = manager.get_latest_checkpoint(&run_b).unwrap().unwrap();
    assert_eq!(latest_a.run_id, run_a);
    assert_eq!(latest_a.sequence_number, 2);
    assert_eq!(latest_b.run_id, run_b);
    assert_eq!(latest_b.sequence_number, 1);
}

// ============================================================================
// SECTION: Resume Gates
// ============================================================================

/// Tests that a valid contract resumes cleanly.
#[test]
fn test_resume_with_valid_contract() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = build_recorder(&dir);
    let manager = CheckpointManager::new(recorder.db().clone());
    let graph = test_graph();
    let (run_id, token_id) = seed_run(&recorder);

    manager.create_checkpoint(&run_id, &token_id, &NodeId::new("sink-node"), &graph).unwrap();
    recorder.update_run_contract(&run_id, &stored_contract()).unwrap();

    let recovery = RecoveryManager::new(recorder, manager);
    let check = recovery.can_resume(&run_id, &graph).unwrap();
    assert!(check.can_resume);
    assert!(check.reason.is_none());

    let point = recovery.get_resume_point(&run_id, &graph).unwrap();
    assert_eq!(point.resume_from_row_index, 1);
    assert!(point.contract.is_some());
}

/// Tests that runs without a stored contract resume as legacy.
#[test]
fn test_resume_without_contract() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = build_recorder(&dir);
    let manager = CheckpointManager::new(recorder.db().clone());
    let graph = test_graph();
    let (run_id, token_id) = seed_run(&recorder);
    manager.create_checkpoint(&run_id, &token_id, &NodeId::new("sink-node"), &graph).unwrap();

    let recovery = RecoveryManager::new(recorder, manager);
    assert!(recovery.can_resume(&run_id, &graph).unwrap().can_resume);
    assert!(recovery.verify_contract_integrity(&run_id).unwrap().is_none());
}

/// Tests that a tampered contract hash refuses resume with a corruption
/// error naming the run and mentioning integrity.
#[test]
fn test_resume_with_tampered_contract_raises() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = build_recorder(&dir);
    let manager = CheckpointManager::new(recorder.db().clone());
    let graph = test_graph();
    let (run_id, token_id) = seed_run(&recorder);
    manager.create_checkpoint(&run_id, &token_id, &NodeId::new("sink-node"), &graph).unwrap();

    let mut tampered = stored_contract();
    tampered.version_hash = "corrupted_hash_value".to_string();
    recorder.update_run_contract(&run_id, &tampered).unwrap();

    let recovery = RecoveryManager::new(recorder, manager);
    let err = recovery.can_resume(&run_id, &graph).unwrap_err();
    let RecoveryError::Corruption(corruption) = err else {
        panic!("expected corruption error, got {err:?}");
    };
    let message = corruption.to_string();
    assert!(message.to_lowercase().contains("integrity"));
    assert!(message.contains(run_id.as_str()));

    let recovery_err = recovery.get_resume_point(&run_id, &graph).unwrap_err();
    assert!(matches!(recovery_err, RecoveryError::Corruption(_)));
}

/// Tests that graph drift refuses resume without raising.
#[test]
fn test_graph_drift_refuses_resume() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = build_recorder(&dir);
    let manager = CheckpointManager::new(recorder.db().clone());
    let graph = test_graph();
    let (run_id, token_id) = seed_run(&recorder);
    manager.create_checkpoint(&run_id, &token_id, &NodeId::new("sink-node"), &graph).unwrap();

    let mut drifted = ExecutionGraph::new();
    drifted
        .add_node(GraphNode {
            node_id: NodeId::new("source-node"),
            kind: NodeKind::Source,
            plugin_name: "test-source-node".to_string(),
            plugin_version: "2.0".to_string(),
            config_hash: "changed".to_string(),
        })
        .unwrap();

    let recovery = RecoveryManager::new(recorder, manager);
    let check = recovery.can_resume(&run_id, &drifted).unwrap();
    assert!(!check.can_resume);
    assert!(check.reason.unwrap().contains("fingerprint"));

    let err = recovery.get_resume_point(&run_id, &drifted).unwrap_err();
    assert!(matches!(err, RecoveryError::Refused { .. }));
}

/// Tests that a run with no checkpoint is not resumable.
#[test]
fn test_no_checkpoint_not_resumable() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = build_recorder(&dir);
    let manager = CheckpointManager::new(recorder.db().clone());
    let graph = test_graph();
    let (run_id, _) = seed_run(&recorder);

    let recovery = RecoveryManager::new(recorder, manager);
    let check = recovery.can_resume(&run_id, &graph).unwrap();
    assert!(!check.can_resume);
    assert!(check.reason.unwrap().contains("checkpoint"));
}
