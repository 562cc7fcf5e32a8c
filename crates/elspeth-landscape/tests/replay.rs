// elspeth-landscape/tests/replay.rs
// ============================================================================
// Module: Call Replay Tests
// Description: Tests for content-addressed replay of recorded calls.
// ============================================================================
//! ## Overview
//! Validates replay hits, misses, purged-payload errors, error-call replay,
//! and the per-run cache.

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

use elspeth_core::CallStatus;
use elspeth_core::CallType;
use elspeth_core::Determinism;
use elspeth_core::NodeType;
use elspeth_core::RowData;
use elspeth_core::RunId;
use elspeth_core::StateId;
use elspeth_core::Value;
use elspeth_core::stable_hash_raw;
use elspeth_landscape::FilesystemPayloadStore;
use elspeth_landscape::recorder::LandscapeDb;
use elspeth_landscape::recorder::LandscapeRecorder;
use elspeth_landscape::recorder::NodeRegistration;
use elspeth_landscape::replay::CallReplayer;
use elspeth_landscape::replay::ReplayError;
use serde_json::json;

/// Seeds a run with one open state and returns the recorder and ids.
fn seed(dir: &tempfile::TempDir) -> (LandscapeRecorder, RunId, StateId, FilesystemPayloadStore) {
    let db = LandscapeDb::in_memory().unwrap();
    let payloads = FilesystemPayloadStore::open(dir.path().join("payloads")).unwrap();
    let recorder = LandscapeRecorder::new(db, Arc::new(payloads.clone()));

    let run = recorder.begin_run(&json!({"pipeline": "replay"}), "sha256-rfc8785-v1").unwrap();
    let node = recorder
        .register_node(
            &run.run_id,
            NodeRegistration {
                node_id: None,
                plugin_name: "llm".to_string(),
                node_type: NodeType::Transform,
                plugin_version: "1.0".to_string(),
                determinism: Determinism::Nondeterministic,
                config: json!({}),
                sequence: Some(1),
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
    let row = recorder.create_row(&run.run_id, &node.node_id, 0, &data).unwrap();
    let token = recorder.create_token(&row.row_id).unwrap();
    let state = recorder
        .begin_node_state(&token.token_id, &node.node_id, &run.run_id, 1, 0, &json!({"id": 1}))
        .unwrap();
    (recorder, run.run_id, state.state_id().clone(), payloads)
}

// ============================================================================
// SECTION: Replay
// ============================================================================

/// Tests that replay returns the recorded response and latency.
#[test]
fn test_replay_returns_recorded_response() {
    let dir = tempfile::tempdir().unwrap();
    let (recorder, run_id, state_id, _) = seed(&dir);
    let request = json!({"model": "m1", "prompt": "Hello"});
    let response = json!({"content": "Hello, world!", "model": "m1"});
    let index = recorder.allocate_call_index(state_id.as_str()).unwrap();
    recorder
        .record_call(
            &state_id,
            index,
            CallType::Llm,
            CallStatus::Success,
            &request,
            Some(&response),
            None,
            150.0,
        )
        .unwrap();

    let replayer = CallReplayer::new(recorder, run_id);
    let replayed = replayer.replay(CallType::Llm, &request).unwrap();

    assert_eq!(replayed.response_data, response);
    assert!((replayed.original_latency_ms - 150.0).abs() < f64::EPSILON);
    assert_eq!(replayed.request_hash, stable_hash_raw(&request).unwrap());
    assert!(!replayed.was_error);
    assert!(replayed.error_data.is_none());
}

/// Tests that an unrecorded request is a replay miss.
#[test]
fn test_replay_miss() {
    let dir = tempfile::tempdir().unwrap();
    let (recorder, run_id, _, _) = seed(&dir);
    let replayer = CallReplayer::new(recorder, run_id);

    let err = replayer.replay(CallType::Llm, &json!({"model": "m1", "prompt": "new"})).unwrap_err();
    let ReplayError::Miss { request_hash, .. } = err else {
        panic!("expected replay miss, got {err:?}");
    };
    assert_eq!(request_hash.len(), 64);
}

/// Tests that a purged payload is surfaced, never fabricated.
#[test]
fn test_replay_purged_payload() {
    let dir = tempfile::tempdir().unwrap();
    let (recorder, run_id, state_id, payloads) = seed(&dir);
    let request = json!({"model": "m1", "prompt": "purge me"});
    let response = json!({"content": "ephemeral"});
    let index = recorder.allocate_call_index(state_id.as_str()).unwrap();
    recorder
        .record_call(
            &state_id,
            index,
            CallType::Llm,
            CallStatus::Success,
            &request,
            Some(&response),
            None,
            10.0,
        )
        .unwrap();

    // Purge everything: the audit row keeps its hash, the bytes go away.
    let removed = payloads
        .purge_older_than(std::time::SystemTime::now() + std::time::Duration::from_secs(60))
        .unwrap();
    assert!(removed > 0);

    let replayer = CallReplayer::new(recorder, run_id);
    let err = replayer.replay(CallType::Llm, &request).unwrap_err();
    assert!(matches!(err, ReplayError::PayloadMissing { .. }));
}

/// Tests that recorded error calls replay as errors.
#[test]
fn test_replay_error_call() {
    let dir = tempfile::tempdir().unwrap();
    let (recorder, run_id, state_id, _) = seed(&dir);
    let request = json!({"model": "m1", "prompt": "fails"});
    let index = recorder.allocate_call_index(state_id.as_str()).unwrap();
    recorder
        .record_call(
            &state_id,
            index,
            CallType::Llm,
            CallStatus::Error,
            &request,
            None,
            Some(&json!({"type": "RateLimitError", "message": "too many requests"})),
            50.0,
        )
        .unwrap();

    let replayer = CallReplayer::new(recorder, run_id);
    let replayed = replayer.replay(CallType::Llm, &request).unwrap();

    assert!(replayed.was_error);
    assert_eq!(
        replayed.error_data,
        Some(json!({"type": "RateLimitError", "message": "too many requests"}))
    );
}

/// Tests that repeated replays are served from the per-run cache.
#[test]
fn test_replay_cached() {
    let dir = tempfile::tempdir().unwrap();
    let (recorder, run_id, state_id, payloads) = seed(&dir);
    let request = json!({"model": "m1", "prompt": "cache me"});
    let response = json!({"content": "cached"});
    let index = recorder.allocate_call_index(state_id.as_str()).unwrap();
    recorder
        .record_call(
            &state_id,
            index,
            CallType::Llm,
            CallStatus::Success,
            &request,
            Some(&response),
            None,
            5.0,
        )
        .unwrap();

    let replayer = CallReplayer::new(recorder, run_id);
    assert_eq!(replayer.replay(CallType::Llm, &request).unwrap().response_data, response);

    // Purge the payload; the cached result must still answer.
    payloads
        .purge_older_than(std::time::SystemTime::now() + std::time::Duration::from_secs(60))
        .unwrap();
    assert_eq!(replayer.replay(CallType::Llm, &request).unwrap().response_data, response);
}
