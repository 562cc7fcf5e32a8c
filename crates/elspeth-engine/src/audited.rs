// elspeth-engine/src/audited.rs
// ============================================================================
// Module: Audited External-Call Client
// Description: Decorator recording every external call in the landscape.
// Purpose: Guarantee the legal record precedes any telemetry or retry.
// Dependencies: elspeth-core, elspeth-landscape
// ============================================================================

//! ## Overview
//! Wraps any [`LlmClient`]: each call hashes the canonical request, takes a
//! recorder-allocated call index, times the dispatch with the monotonic
//! clock, and records a call row before anything else observes the result.
//! Telemetry is emitted only after a successful record, and a telemetry
//! failure is logged rather than raised; if recording itself fails the
//! telemetry is skipped entirely. Errors re-raise to the pooled executor,
//! which applies retry discrimination.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;
use std::time::Instant;

use elspeth_core::CallStatus;
use elspeth_core::CallType;
use elspeth_core::ExternalCallCompleted;
use elspeth_core::LlmClient;
use elspeth_core::LlmRequest;
use elspeth_core::LlmResponse;
use elspeth_core::OperationId;
use elspeth_core::PluginError;
use elspeth_core::RunId;
use elspeth_core::StateId;
use elspeth_core::TelemetryEvent;
use elspeth_core::TelemetrySink;
use elspeth_landscape::LandscapeRecorder;
use serde_json::json;
use tracing::error;
use tracing::warn;

// ============================================================================
// SECTION: Attribution
// ============================================================================

/// Exclusive attribution of a call: a node state or an operation.
#[derive(Debug, Clone)]
pub enum CallAttribution {
    /// Per-token call recorded against a node state.
    State(StateId),
    /// Batch-level call recorded against an operation.
    Operation(OperationId),
}

impl CallAttribution {
    /// The id string used for call-index allocation.
    #[must_use]
    pub fn owner_id(&self) -> &str {
        match self {
            Self::State(state_id) => state_id.as_str(),
            Self::Operation(operation_id) => operation_id.as_str(),
        }
    }
}

// ============================================================================
// SECTION: Audited Client
// ============================================================================

/// Audited decorator around an external-call client.
pub struct AuditedLlmClient {
    /// The wrapped client.
    inner: Arc<dyn LlmClient>,
    /// Recorder for call rows and payloads.
    recorder: LandscapeRecorder,
    /// Telemetry sink; failures are logged, never raised.
    telemetry: Arc<dyn TelemetrySink>,
    /// Run scope for telemetry events.
    run_id: RunId,
}

impl AuditedLlmClient {
    /// Creates an audited client.
    #[must_use]
    pub fn new(
        inner: Arc<dyn LlmClient>,
        recorder: LandscapeRecorder,
        telemetry: Arc<dyn TelemetrySink>,
        run_id: RunId,
    ) -> Self {
        Self {
            inner,
            recorder,
            telemetry,
            run_id,
        }
    }

    /// Performs one audited completion call.
    ///
    /// # Errors
    ///
    /// Returns the wrapped client's [`PluginError`] after recording it, or a
    /// permanent error when the audit record itself cannot be written (the
    /// legal record has precedence over the call result).
    pub fn complete(
        &self,
        attribution: &CallAttribution,
        request: &LlmRequest,
    ) -> Result<LlmResponse, PluginError> {
        let canonical_request = request.to_canonical();
        let call_index =
            self.recorder.allocate_call_index(attribution.owner_id()).map_err(|err| {
                PluginError::permanent("AuditRecordError", err.to_string())
            })?;

        let start = Instant::now();
        let outcome = self.inner.complete(request);
        let latency_ms = start.elapsed().as_secs_f64() * 1_000.0;

        match outcome {
            Ok(mut response) => {
                response.latency_ms = latency_ms;
                let canonical_response = response.to_canonical();
                let recorded = self.record(
                    attribution,
                    call_index,
                    CallStatus::Success,
                    &canonical_request,
                    Some(&canonical_response),
                    None,
                    latency_ms,
                );
                match recorded {
                    Ok(()) => {
                        self.emit_telemetry(attribution, call_index, CallStatus::Success, latency_ms);
                        Ok(response)
                    }
                    Err(record_err) => {
                        // No telemetry when the legal record failed.
                        error!(
                            call_index,
                            error = %record_err,
                            "failed to record successful external call"
                        );
                        Err(PluginError::permanent("AuditRecordError", record_err.to_string()))
                    }
                }
            }
            Err(call_err) => {
                let error_payload = json!({
                    "type": call_err.error_type,
                    "message": call_err.message,
                    "retryable": call_err.retryable,
                    "status_code": call_err.status_code,
                });
                if let Err(record_err) = self.record(
                    attribution,
                    call_index,
                    CallStatus::Error,
                    &canonical_request,
                    None,
                    Some(&error_payload),
                    latency_ms,
                ) {
                    error!(
                        call_index,
                        error = %record_err,
                        "failed to record failed external call"
                    );
                }
                Err(call_err)
            }
        }
    }

    /// Records the absence of a row's result in a batch response file.
    ///
    /// Absence of data is data: the call row carries `result_not_found` and
    /// the custom id that was missing.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError`] when the record cannot be written.
    pub fn record_missing_result(
        &self,
        attribution: &CallAttribution,
        custom_id: &str,
    ) -> Result<(), PluginError> {
        let call_index =
            self.recorder.allocate_call_index(attribution.owner_id()).map_err(|err| {
                PluginError::permanent("AuditRecordError", err.to_string())
            })?;
        self.record(
            attribution,
            call_index,
            CallStatus::Error,
            &json!({"custom_id": custom_id}),
            None,
            Some(&json!({"reason": "result_not_found", "custom_id": custom_id})),
            0.0,
        )
        .map_err(|err| PluginError::permanent("AuditRecordError", err.to_string()))
    }

    /// Writes the call row under the given attribution.
    #[allow(clippy::too_many_arguments, reason = "Mirrors the audited call row column set.")]
    fn record(
        &self,
        attribution: &CallAttribution,
        call_index: i64,
        status: CallStatus,
        request: &serde_json::Value,
        response: Option<&serde_json::Value>,
        error_payload: Option<&serde_json::Value>,
        latency_ms: f64,
    ) -> Result<(), elspeth_landscape::LandscapeError> {
        match attribution {
            CallAttribution::State(state_id) => self
                .recorder
                .record_call(
                    state_id,
                    call_index,
                    CallType::Llm,
                    status,
                    request,
                    response,
                    error_payload,
                    latency_ms,
                )
                .map(|_| ()),
            CallAttribution::Operation(operation_id) => self
                .recorder
                .record_operation_call(
                    operation_id,
                    call_index,
                    CallType::Llm,
                    status,
                    request,
                    response,
                    error_payload,
                    latency_ms,
                )
                .map(|_| ()),
        }
    }

    /// Emits the post-record telemetry event; failures are logged only.
    fn emit_telemetry(
        &self,
        attribution: &CallAttribution,
        call_index: i64,
        status: CallStatus,
        latency_ms: f64,
    ) {
        let state_id = match attribution {
            CallAttribution::State(state_id) => state_id.clone(),
            CallAttribution::Operation(operation_id) => StateId::new(operation_id.as_str()),
        };
        let event = TelemetryEvent::ExternalCallCompleted(ExternalCallCompleted {
            run_id: self.run_id.clone(),
            state_id,
            call_index,
            call_type: CallType::Llm,
            status,
            latency_ms,
        });
        if let Err(err) = self.telemetry.record(&event) {
            warn!(error = %err, "telemetry sink failed; audit record already durable");
        }
    }
}
