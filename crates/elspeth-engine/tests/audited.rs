// elspeth-engine/tests/audited.rs
// ============================================================================
// Module: Audited Client Tests
// Description: Tests for record-then-telemetry ordering on external calls.
// ============================================================================
//! ## Overview
//! Validates that successful calls are recorded before telemetry, that
//! telemetry failures never corrupt the call record, that failed calls are
//! recorded without telemetry, and that missing batch results are recorded
//! as data.

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

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;

use common::build_recorder;
use elspeth_core::CallStatus;
use elspeth_core::Determinism;
use elspeth_core::LlmClient;
use elspeth_core::LlmRequest;
use elspeth_core::LlmResponse;
use elspeth_core::NodeType;
use elspeth_core::PluginError;
use elspeth_core::RowData;
use elspeth_core::StateId;
use elspeth_core::TelemetryError;
use elspeth_core::TelemetryEvent;
use elspeth_core::TelemetrySink;
use elspeth_core::Value;
use elspeth_engine::AuditedLlmClient;
use elspeth_engine::CallAttribution;
use elspeth_landscape::recorder::LandscapeRecorder;
use elspeth_landscape::recorder::NodeRegistration;
use serde_json::json;

/// Client answering with a fixed completion.
struct EchoClient;

impl LlmClient for EchoClient {
    fn client_name(&self) -> &str {
        "echo"
    }

    fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, PluginError> {
        let mut usage = BTreeMap::new();
        usage.insert("prompt_tokens".to_string(), 10);
        usage.insert("completion_tokens".to_string(), 5);
        Ok(LlmResponse {
            content: format!("echo: {}", request.prompt),
            model: request.model.clone(),
            usage,
            latency_ms: 0.0,
        })
    }
}

/// Client that always rate-limits.
struct RateLimitedClient;

impl LlmClient for RateLimitedClient {
    fn client_name(&self) -> &str {
        "rate-limited"
    }

    fn complete(&self, _request: &LlmRequest) -> Result<LlmResponse, PluginError> {
        Err(PluginError::capacity(429, "too many requests"))
    }
}

/// Telemetry sink capturing events, optionally failing.
#[derive(Default)]
struct CapturingTelemetry {
    /// Captured events.
    events: Mutex<Vec<TelemetryEvent>>,
    /// When set, record() fails with this message.
    fail_with: Option<String>,
}

impl TelemetrySink for CapturingTelemetry {
    fn record(&self, event: &TelemetryEvent) -> Result<(), TelemetryError> {
        if let Some(message) = &self.fail_with {
            return Err(TelemetryError::Sink(message.clone()));
        }
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
        Ok(())
    }
}

/// Seeds a run with one open node state for call attribution.
fn seed(dir: &tempfile::TempDir) -> (LandscapeRecorder, elspeth_core::RunId, StateId) {
    let recorder = build_recorder(dir);
    let run = recorder.begin_run(&json!({"pipeline": "audited"}), "sha256-rfc8785-v1").unwrap();
    let node = recorder
        .register_node(
            &run.run_id,
            NodeRegistration {
                node_id: None,
                plugin_name: "llm-transform".to_string(),
                node_type: NodeType::Transform,
                plugin_version: "1.0.0".to_string(),
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
    (recorder, run.run_id, state.state_id().clone())
}

// ============================================================================
// SECTION: Success Path
// ============================================================================

/// Tests that a successful call records SUCCESS then emits telemetry.
#[test]
fn test_success_records_then_emits_telemetry() {
    let dir = tempfile::tempdir().unwrap();
    let (recorder, run_id, state_id) = seed(&dir);
    let telemetry = Arc::new(CapturingTelemetry::default());
    let client = AuditedLlmClient::new(
        Arc::new(EchoClient),
        recorder.clone(),
        Arc::clone(&telemetry) as Arc<dyn TelemetrySink>,
        run_id,
    );

    let request = LlmRequest::new("m1", "Hello");
    let response =
        client.complete(&CallAttribution::State(state_id.clone()), &request).unwrap();
    assert_eq!(response.content, "echo: Hello");
    assert_eq!(response.total_tokens(), 15);

    let calls = recorder.get_calls_for_state(&state_id).unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].status, CallStatus::Success);
    assert_eq!(calls[0].call_index, 0);
    assert!(calls[0].response_hash.is_some());

    let events = telemetry.events.lock().unwrap();
    assert_eq!(events.len(), 1);
    let TelemetryEvent::ExternalCallCompleted(event) = &events[0];
    assert_eq!(event.status, CallStatus::Success);
    assert_eq!(event.call_index, 0);
}

/// Tests that a telemetry failure is swallowed; the record survives.
#[test]
fn test_telemetry_failure_does_not_corrupt_record() {
    let dir = tempfile::tempdir().unwrap();
    let (recorder, run_id, state_id) = seed(&dir);
    let telemetry = Arc::new(CapturingTelemetry {
        events: Mutex::new(Vec::new()),
        fail_with: Some("exporter unreachable".to_string()),
    });
    let client = AuditedLlmClient::new(
        Arc::new(EchoClient),
        recorder.clone(),
        telemetry,
        run_id,
    );

    let request = LlmRequest::new("m1", "Hello");
    let response = client.complete(&CallAttribution::State(state_id.clone()), &request);
    assert!(response.is_ok());

    let calls = recorder.get_calls_for_state(&state_id).unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].status, CallStatus::Success);
}

// ============================================================================
// SECTION: Failure Path
// ============================================================================

/// Tests that a failed call records ERROR, emits no telemetry, and
/// re-raises the typed error for retry discrimination.
#[test]
fn test_failure_records_error_without_telemetry() {
    let dir = tempfile::tempdir().unwrap();
    let (recorder, run_id, state_id) = seed(&dir);
    let telemetry = Arc::new(CapturingTelemetry::default());
    let client = AuditedLlmClient::new(
        Arc::new(RateLimitedClient),
        recorder.clone(),
        Arc::clone(&telemetry) as Arc<dyn TelemetrySink>,
        run_id,
    );

    let request = LlmRequest::new("m1", "Hello");
    let err = client.complete(&CallAttribution::State(state_id.clone()), &request).unwrap_err();
    assert!(err.retryable);
    assert_eq!(err.status_code, Some(429));

    let calls = recorder.get_calls_for_state(&state_id).unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].status, CallStatus::Error);
    assert!(calls[0].response_hash.is_none());
    assert!(calls[0].error_json.as_deref().unwrap().contains("CapacityError"));

    assert!(telemetry.events.lock().unwrap().is_empty());
}

/// Tests that call indices stay monotonic across mixed outcomes.
#[test]
fn test_call_indices_monotonic_across_calls() {
    let dir = tempfile::tempdir().unwrap();
    let (recorder, run_id, state_id) = seed(&dir);
    let telemetry = Arc::new(CapturingTelemetry::default());
    let ok_client = AuditedLlmClient::new(
        Arc::new(EchoClient),
        recorder.clone(),
        Arc::clone(&telemetry) as Arc<dyn TelemetrySink>,
        run_id.clone(),
    );
    let failing_client = AuditedLlmClient::new(
        Arc::new(RateLimitedClient),
        recorder.clone(),
        telemetry,
        run_id,
    );

    let attribution = CallAttribution::State(state_id.clone());
    ok_client.complete(&attribution, &LlmRequest::new("m1", "one")).unwrap();
    let _ = failing_client.complete(&attribution, &LlmRequest::new("m1", "two"));
    ok_client.complete(&attribution, &LlmRequest::new("m1", "three")).unwrap();

    let calls = recorder.get_calls_for_state(&state_id).unwrap();
    let indices: Vec<i64> = calls.iter().map(|call| call.call_index).collect();
    assert_eq!(indices, vec![0, 1, 2]);
}

// ============================================================================
// SECTION: Missing Batch Results
// ============================================================================

/// Tests that absence of a batch result is recorded as data.
#[test]
fn test_missing_batch_result_recorded() {
    let dir = tempfile::tempdir().unwrap();
    let (recorder, run_id, state_id) = seed(&dir);
    let client = AuditedLlmClient::new(
        Arc::new(EchoClient),
        recorder.clone(),
        Arc::new(elspeth_core::NoopTelemetrySink),
        run_id,
    );

    client
        .record_missing_result(&CallAttribution::State(state_id.clone()), "row-42")
        .unwrap();

    let calls = recorder.get_calls_for_state(&state_id).unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].status, CallStatus::Error);
    let error = calls[0].error_json.as_deref().unwrap();
    assert!(error.contains("result_not_found"));
    assert!(error.contains("row-42"));
}
