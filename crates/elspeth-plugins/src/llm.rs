// elspeth-plugins/src/llm.rs
// ============================================================================
// Module: LLM Client Taxonomy
// Description: Typed client error constructors and a static client.
// Purpose: Classify external-call failures for retry discrimination.
// Dependencies: elspeth-core
// ============================================================================

//! ## Overview
//! Retry discrimination inspects the error taxonomy, never message text.
//! These constructors give every failure class a stable `error_type` and the
//! right retryability: network faults, 5xx, and 429 are retryable; content
//! policy violations, context-length overruns, and authentication failures
//! are permanent. [`StaticLlmClient`] and [`MockLlmClient`] are the
//! deterministic clients used in development and tests; strict security mode
//! refuses both.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::sync::Mutex;

use elspeth_core::LlmClient;
use elspeth_core::LlmRequest;
use elspeth_core::LlmResponse;
use elspeth_core::PluginConfigError;
use elspeth_core::PluginError;
use serde_json::Value as JsonValue;

// ============================================================================
// SECTION: Error Taxonomy
// ============================================================================

/// A transport-level failure; retryable.
#[must_use]
pub fn network_error(message: impl Into<String>) -> PluginError {
    PluginError::retryable("NetworkError", message)
}

/// An upstream 5xx; retryable with its status code.
#[must_use]
pub fn server_error(status_code: u16, message: impl Into<String>) -> PluginError {
    let mut error = PluginError::retryable("ServerError", message);
    error.status_code = Some(status_code);
    error
}

/// An upstream 429; retryable with its status code.
#[must_use]
pub fn rate_limit_error(message: impl Into<String>) -> PluginError {
    let mut error = PluginError::retryable("RateLimitError", message);
    error.status_code = Some(429);
    error
}

/// A content-policy rejection; permanent.
#[must_use]
pub fn content_policy_error(message: impl Into<String>) -> PluginError {
    PluginError::permanent("ContentPolicyError", message)
}

/// A context-length overrun; permanent.
#[must_use]
pub fn context_length_error(message: impl Into<String>) -> PluginError {
    PluginError::permanent("ContextLengthError", message)
}

/// An authentication failure (4xx); permanent.
#[must_use]
pub fn authentication_error(status_code: u16, message: impl Into<String>) -> PluginError {
    let mut error = PluginError::permanent("AuthenticationError", message);
    error.status_code = Some(status_code);
    error
}

// ============================================================================
// SECTION: Static Client
// ============================================================================

/// Deterministic client answering from a fixed template.
///
/// Intended for development runs and tests; strict security mode disallows
/// non-live clients.
pub struct StaticLlmClient {
    /// Template; `{prompt}` is replaced with the request prompt.
    template: String,
}

impl StaticLlmClient {
    /// Creates a static client with a response template.
    #[must_use]
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }
}

impl LlmClient for StaticLlmClient {
    fn client_name(&self) -> &str {
        "static"
    }

    fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, PluginError> {
        let content = self.template.replace("{prompt}", &request.prompt);
        Ok(response_for(request, content))
    }
}

// ============================================================================
// SECTION: Mock Client
// ============================================================================

/// Scripted client cycling through canned responses, optionally injecting
/// capacity failures to exercise retry paths.
///
/// Intended for development runs and tests; strict security mode disallows
/// non-live clients.
pub struct MockLlmClient {
    /// Canned responses, cycled in order.
    responses: Vec<String>,
    /// When set, every Nth call fails with an injected rate limit.
    fail_every: Option<usize>,
    /// Calls served so far.
    calls: Mutex<usize>,
}

impl MockLlmClient {
    /// Creates a mock client from plugin configuration.
    ///
    /// Accepted shape: `{"responses": ["a", "b"], "fail_every": 3}`; both
    /// keys are optional.
    ///
    /// # Errors
    ///
    /// Returns [`PluginConfigError`] for malformed configuration.
    pub fn from_config(config: &JsonValue) -> Result<Self, PluginConfigError> {
        let responses = match config.get("responses") {
            None => vec!["mock response".to_string()],
            Some(JsonValue::Array(items)) => {
                let mut responses = Vec::with_capacity(items.len());
                for item in items {
                    let Some(text) = item.as_str() else {
                        return Err(PluginConfigError::new(
                            "mock",
                            "'responses' must be a list of strings",
                        ));
                    };
                    responses.push(text.to_string());
                }
                if responses.is_empty() {
                    return Err(PluginConfigError::new("mock", "'responses' must not be empty"));
                }
                responses
            }
            Some(_) => {
                return Err(PluginConfigError::new(
                    "mock",
                    "'responses' must be a list of strings",
                ));
            }
        };
        let fail_every = match config.get("fail_every") {
            None => None,
            Some(value) => Some(
                value
                    .as_u64()
                    .filter(|every| *every > 0)
                    .and_then(|every| usize::try_from(every).ok())
                    .ok_or_else(|| {
                        PluginConfigError::new("mock", "'fail_every' must be a positive integer")
                    })?,
            ),
        };
        Ok(Self {
            responses,
            fail_every,
            calls: Mutex::new(0),
        })
    }
}

impl LlmClient for MockLlmClient {
    fn client_name(&self) -> &str {
        "mock"
    }

    fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, PluginError> {
        let call_number = {
            let mut calls = self.calls.lock().map_err(|_| {
                PluginError::permanent("MockClientError", "call counter mutex poisoned")
            })?;
            *calls += 1;
            *calls
        };
        if let Some(every) = self.fail_every
            && call_number % every == 0
        {
            return Err(rate_limit_error("injected rate limit"));
        }
        let content = self
            .responses
            .get((call_number - 1) % self.responses.len())
            .cloned()
            .unwrap_or_default();
        Ok(response_for(request, content))
    }
}

// ============================================================================
// SECTION: Shared Response Shape
// ============================================================================

/// Builds a response with usage estimated from text lengths.
fn response_for(request: &LlmRequest, content: String) -> LlmResponse {
    let mut usage = BTreeMap::new();
    usage.insert(
        "prompt_tokens".to_string(),
        i64::try_from(request.prompt.len() / 4).unwrap_or(0),
    );
    usage.insert(
        "completion_tokens".to_string(),
        i64::try_from(content.len() / 4).unwrap_or(0),
    );
    LlmResponse {
        content,
        model: request.model.clone(),
        usage,
        latency_ms: 0.0,
    }
}
