// elspeth-landscape/src/replay.rs
// ============================================================================
// Module: Landscape Call Replay
// Description: Content-addressed lookup of prior external calls.
// Purpose: Deterministic replay of recorded responses; never fabricate.
// Dependencies: elspeth-core, serde_json, crate::recorder
// ============================================================================

//! ## Overview
//! The replayer answers a new in-flight request with the response recorded
//! for the same canonical request in a prior run. A request with no recorded
//! call is a replay miss; a recorded call whose payload was purged under
//! retention is a typed payload-missing error. Results are cached per
//! `(call type, request hash)` within the replaying run to avoid re-reads.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::sync::Mutex;

use elspeth_core::CallStatus;
use elspeth_core::CallType;
use elspeth_core::RunId;
use elspeth_core::stable_hash_raw;
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::recorder::LandscapeError;
use crate::recorder::LandscapeRecorder;

// ============================================================================
// SECTION: Types
// ============================================================================

/// A replayed prior call.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayedCall {
    /// Recorded response payload; empty object for error calls.
    pub response_data: JsonValue,
    /// Latency the original call observed, in milliseconds.
    pub original_latency_ms: f64,
    /// Canonical hash of the request.
    pub request_hash: String,
    /// True when the recorded call failed.
    pub was_error: bool,
    /// Recorded structured error, for failed calls.
    pub error_data: Option<JsonValue>,
}

/// Errors raised during replay.
#[derive(Debug, Error)]
pub enum ReplayError {
    /// No prior call matches the request hash.
    #[error("no recorded call for request hash {request_hash} in source run")]
    Miss {
        /// Canonical hash of the unmatched request.
        request_hash: String,
        /// The request itself, for debugging.
        request_data: JsonValue,
    },
    /// A prior call exists but its response payload was purged.
    #[error("recorded response payload for request hash {request_hash} has been purged")]
    PayloadMissing {
        /// Canonical hash of the request whose payload is gone.
        request_hash: String,
    },
    /// Underlying store failure.
    #[error(transparent)]
    Landscape(#[from] LandscapeError),
}

// ============================================================================
// SECTION: Replayer
// ============================================================================

/// Replays prior calls from a source run's audit trail.
pub struct CallReplayer {
    /// Recorder over the landscape holding the source run.
    recorder: LandscapeRecorder,
    /// Run whose calls are being replayed.
    source_run_id: RunId,
    /// Per-run result cache keyed by `(call type, request hash)`.
    cache: Mutex<BTreeMap<(String, String), ReplayedCall>>,
}

impl CallReplayer {
    /// Creates a replayer for a source run.
    #[must_use]
    pub fn new(recorder: LandscapeRecorder, source_run_id: RunId) -> Self {
        Self {
            recorder,
            source_run_id,
            cache: Mutex::new(BTreeMap::new()),
        }
    }

    /// Replays the recorded call for a canonical request.
    ///
    /// # Errors
    ///
    /// Returns [`ReplayError::Miss`] when no call matches,
    /// [`ReplayError::PayloadMissing`] when the recorded response payload was
    /// purged, and [`ReplayError::Landscape`] on store failure.
    pub fn replay(
        &self,
        call_type: CallType,
        request: &JsonValue,
    ) -> Result<ReplayedCall, ReplayError> {
        let request_hash = stable_hash_raw(request).map_err(LandscapeError::from)?;
        let cache_key = (call_type.as_str().to_string(), request_hash.clone());

        if let Ok(cache) = self.cache.lock()
            && let Some(hit) = cache.get(&cache_key)
        {
            return Ok(hit.clone());
        }

        let call = self
            .recorder
            .find_call_by_request_hash(&self.source_run_id, call_type, &request_hash)?
            .ok_or_else(|| ReplayError::Miss {
                request_hash: request_hash.clone(),
                request_data: request.clone(),
            })?;

        let replayed = if call.status == CallStatus::Error {
            let error_data = call
                .error_json
                .as_deref()
                .and_then(|raw| serde_json::from_str(raw).ok());
            ReplayedCall {
                response_data: JsonValue::Object(serde_json::Map::new()),
                original_latency_ms: call.latency_ms,
                request_hash: request_hash.clone(),
                was_error: true,
                error_data,
            }
        } else {
            let response_data = self
                .recorder
                .get_call_response_data(&call)?
                .ok_or(ReplayError::PayloadMissing {
                    request_hash: request_hash.clone(),
                })?;
            ReplayedCall {
                response_data,
                original_latency_ms: call.latency_ms,
                request_hash: request_hash.clone(),
                was_error: false,
                error_data: None,
            }
        };

        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(cache_key, replayed.clone());
        }
        Ok(replayed)
    }
}
