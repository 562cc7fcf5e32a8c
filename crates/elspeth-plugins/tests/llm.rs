// elspeth-plugins/tests/llm.rs
// ============================================================================
// Module: LLM Client Tests
// Description: Tests for the error taxonomy and deterministic clients.
// ============================================================================
//! ## Overview
//! Validates the retryability classification of the client error taxonomy
//! and the behavior of the static and mock clients.

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

use elspeth_core::LlmClient;
use elspeth_core::LlmRequest;
use elspeth_plugins::MockLlmClient;
use elspeth_plugins::StaticLlmClient;
use elspeth_plugins::authentication_error;
use elspeth_plugins::content_policy_error;
use elspeth_plugins::network_error;
use elspeth_plugins::rate_limit_error;
use elspeth_plugins::server_error;
use serde_json::json;

// ============================================================================
// SECTION: Error Taxonomy
// ============================================================================

/// Tests retryability classification across the taxonomy.
#[test]
fn test_taxonomy_retryability() {
    assert!(network_error("connection reset").retryable);
    assert!(server_error(503, "unavailable").retryable);
    assert_eq!(server_error(503, "unavailable").status_code, Some(503));
    assert!(rate_limit_error("too many requests").retryable);
    assert_eq!(rate_limit_error("too many requests").status_code, Some(429));
    assert!(!content_policy_error("rejected").retryable);
    assert!(!authentication_error(401, "bad key").retryable);
}

// ============================================================================
// SECTION: Static Client
// ============================================================================

/// Tests template substitution and usage estimation.
#[test]
fn test_static_client_template() {
    let client = StaticLlmClient::new("echo: {prompt}");
    let response = client.complete(&LlmRequest::new("m1", "Hello")).unwrap();
    assert_eq!(response.content, "echo: Hello");
    assert_eq!(response.model, "m1");
    assert_eq!(client.client_name(), "static");
}

// ============================================================================
// SECTION: Mock Client
// ============================================================================

/// Tests that the mock client cycles its canned responses.
#[test]
fn test_mock_client_cycles_responses() {
    let client = MockLlmClient::from_config(&json!({
        "responses": ["first", "second"],
    }))
    .unwrap();
    let request = LlmRequest::new("m1", "ignored");

    assert_eq!(client.complete(&request).unwrap().content, "first");
    assert_eq!(client.complete(&request).unwrap().content, "second");
    assert_eq!(client.complete(&request).unwrap().content, "first");
    assert_eq!(client.client_name(), "mock");
}

/// Tests injected capacity failures on every Nth call.
#[test]
fn test_mock_client_injects_failures() {
    let client = MockLlmClient::from_config(&json!({
        "responses": ["ok"],
        "fail_every": 3,
    }))
    .unwrap();
    let request = LlmRequest::new("m1", "ignored");

    assert!(client.complete(&request).is_ok());
    assert!(client.complete(&request).is_ok());
    let err = client.complete(&request).unwrap_err();
    assert!(err.retryable);
    assert_eq!(err.status_code, Some(429));
    assert!(client.complete(&request).is_ok());
}

/// Tests configuration validation.
#[test]
fn test_mock_client_config_validation() {
    assert!(MockLlmClient::from_config(&json!({})).is_ok());
    assert!(MockLlmClient::from_config(&json!({"responses": []})).is_err());
    assert!(MockLlmClient::from_config(&json!({"responses": [1]})).is_err());
    assert!(MockLlmClient::from_config(&json!({"fail_every": 0})).is_err());
    assert!(MockLlmClient::from_config(&json!({"fail_every": "often"})).is_err());
}
