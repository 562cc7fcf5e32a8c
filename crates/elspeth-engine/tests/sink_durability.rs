// elspeth-engine/tests/sink_durability.rs
// ============================================================================
// Module: Sink Durability Tests
// Description: Tests for durable-before-checkpoint and flush-failure audit.
// ============================================================================
//! ## Overview
//! Exercises the sink executor directly: checkpoint failures after a durable
//! flush are logged and swallowed (at-least-once on resume), and flush
//! failures close every opened state FAILED with the flush phase recorded.

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

mod common;

use common::JsonlFileSink;
use common::StaticSource;
use common::build_recorder;
use elspeth_core::NodeId;
use elspeth_core::NodeStateStatus;
use elspeth_core::PendingOutcome;
use elspeth_core::PluginContext;
use elspeth_core::NodeType;
use elspeth_core::Determinism;
use elspeth_core::SourcePlugin as _;
use elspeth_core::TokenOutcomeKind;
use elspeth_engine::EngineError;
use elspeth_engine::SinkExecutor;
use elspeth_engine::SourceExecutor;
use elspeth_engine::TokenInfo;
use elspeth_engine::ValidationFailurePolicy;
use elspeth_landscape::CheckpointManager;
use elspeth_landscape::recorder::LandscapeRecorder;
use elspeth_landscape::recorder::NodeRegistration;
use serde_json::json;

/// Seeds a run with three source tokens and a registered sink node.
fn seed(
    dir: &tempfile::TempDir,
) -> (LandscapeRecorder, elspeth_core::RunId, NodeId, Vec<TokenInfo>) {
    let recorder = build_recorder(dir);
    let run = recorder.begin_run(&json!({"pipeline": "durability"}), "sha256-rfc8785-v1").unwrap();
    let run_id = run.run_id;

    let register = |node_id: &str, node_type: NodeType, determinism: Determinism| {
        recorder
            .register_node(
                &run_id,
                NodeRegistration {
                    node_id: Some(NodeId::new(node_id)),
                    plugin_name: node_id.to_string(),
                    node_type,
                    plugin_version: "1.0.0".to_string(),
                    determinism,
                    config: json!({}),
                    sequence: None,
                    schema_hash: None,
                    schema_mode: "FIXED".to_string(),
                    schema_fields_json: None,
                    input_contract: None,
                    output_contract: None,
                },
            )
            .unwrap()
    };
    register("source", NodeType::Source, Determinism::IoRead);
    let sink_node = register("sink", NodeType::Sink, Determinism::IoWrite);

    let mut source = StaticSource::happy_three();
    let mut ctx = PluginContext::new(run_id.clone(), json!({}));
    ctx.node_id = Some(NodeId::new("source"));
    let executor = SourceExecutor::new(recorder.clone(), run_id.clone());
    let output = executor
        .run(&mut source, &mut ctx, ValidationFailurePolicy::Quarantine)
        .unwrap();
    source.close();

    let tokens = output.items.into_iter().map(|item| item.token).collect();
    (recorder, run_id, sink_node.node_id, tokens)
}

// ============================================================================
// SECTION: Checkpoint After Durability
// ============================================================================

/// Tests at-least-once semantics: a checkpoint failure after flush leaves
/// the artifact, states, and outcomes intact and no checkpoint row.
#[test]
fn test_checkpoint_failure_after_flush_is_swallowed() {
    let dir = tempfile::tempdir().unwrap();
    let (recorder, run_id, sink_node_id, tokens) = seed(&dir);

    let mut sink = JsonlFileSink::new(dir.path().join("out.jsonl"));
    let executor = SinkExecutor::new(recorder.clone(), run_id.clone());
    let mut ctx = PluginContext::new(run_id.clone(), json!({}));
    ctx.node_id = Some(sink_node_id.clone());

    let mut callback = |token: &TokenInfo| -> Result<(), EngineError> {
        Err(EngineError::Landscape(elspeth_landscape::LandscapeError::Store(format!(
            "database unavailable while checkpointing token {}",
            token.token_id
        ))))
    };

    let artifact = executor
        .write(
            &mut sink,
            &tokens,
            &mut ctx,
            2,
            "output",
            &PendingOutcome::completed(),
            Some(&mut callback),
        )
        .unwrap();

    // The write survived: artifact registered, states completed, outcomes
    // recorded.
    assert!(artifact.is_some());
    assert_eq!(recorder.get_artifacts(&run_id, None).unwrap().len(), 1);
    let states = recorder.get_node_states_for_node(&run_id, &sink_node_id).unwrap();
    assert_eq!(states.len(), 3);
    assert!(states.iter().all(|s| s.status() == NodeStateStatus::Completed));
    let outcomes = recorder.get_token_outcomes(&run_id).unwrap();
    assert_eq!(outcomes.len(), 3);
    assert!(outcomes.iter().all(|o| o.outcome == TokenOutcomeKind::Completed));

    // But no checkpoint exists: resume will re-deliver these rows.
    let manager = CheckpointManager::new(recorder.db().clone());
    assert!(manager.get_latest_checkpoint(&run_id).unwrap().is_none());
}

// ============================================================================
// SECTION: Flush Failure
// ============================================================================

/// Tests that a flush failure closes every opened state FAILED with the
/// flush phase, and records nothing downstream of durability.
#[test]
fn test_flush_failure_fails_all_states() {
    let dir = tempfile::tempdir().unwrap();
    let (recorder, run_id, sink_node_id, tokens) = seed(&dir);

    let mut sink = JsonlFileSink::new(dir.path().join("out.jsonl"));
    sink.fail_flush = Some("fsync failed".to_string());
    let executor = SinkExecutor::new(recorder.clone(), run_id.clone());
    let mut ctx = PluginContext::new(run_id.clone(), json!({}));
    ctx.node_id = Some(sink_node_id.clone());

    let err = executor
        .write(
            &mut sink,
            &tokens,
            &mut ctx,
            2,
            "output",
            &PendingOutcome::completed(),
            None,
        )
        .unwrap_err();
    assert!(matches!(err, EngineError::Plugin { .. }));

    let states = recorder.get_node_states_for_node(&run_id, &sink_node_id).unwrap();
    assert_eq!(states.len(), 3);
    for state in &states {
        let elspeth_core::NodeState::Failed {
            error_json, ..
        } = state
        else {
            panic!("expected FAILED state, got {:?}", state.status());
        };
        assert!(error_json.contains("\"phase\":\"flush\""));
    }

    // No artifact, no outcomes, no checkpoints: durability never happened.
    assert!(recorder.get_artifacts(&run_id, None).unwrap().is_empty());
    assert!(recorder.get_token_outcomes(&run_id).unwrap().is_empty());
}

// ============================================================================
// SECTION: Missing Node Id
// ============================================================================

/// Tests that executing a sink without a node id is an orchestration bug.
#[test]
fn test_sink_without_node_id_is_invariant_error() {
    let dir = tempfile::tempdir().unwrap();
    let (recorder, run_id, _, tokens) = seed(&dir);

    let mut sink = JsonlFileSink::new(dir.path().join("out.jsonl"));
    let executor = SinkExecutor::new(recorder, run_id.clone());
    let mut ctx = PluginContext::new(run_id, json!({}));

    let err = executor
        .write(
            &mut sink,
            &tokens,
            &mut ctx,
            2,
            "output",
            &PendingOutcome::completed(),
            None,
        )
        .unwrap_err();
    assert!(matches!(err, EngineError::Orchestration(_)));
}
