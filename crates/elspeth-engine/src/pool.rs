// elspeth-engine/src/pool.rs
// ============================================================================
// Module: Pooled Retry Executor
// Description: Bounded-parallel dispatch with typed retry discrimination.
// Purpose: Run external-call transforms under pacing and retry limits.
// Dependencies: elspeth-core, std::thread
// ============================================================================

//! ## Overview
//! A fixed-size worker pool processes row contexts in parallel. Every
//! dispatch, including post-retry dispatches, passes a global dispatch gate:
//! a monotonic-clock check under a mutex that enforces the configured
//! minimum gap between any two consecutive dispatches across all workers.
//! Errors are discriminated by the plugin error taxonomy, never by message:
//! retryable errors back off exponentially until the retry budget is spent
//! (result `retry_timeout`); permanent errors fail the row immediately
//! (result `permanent_error`). Results return in row-index order regardless
//! of worker completion order.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::VecDeque;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use elspeth_core::PluginError;
use elspeth_core::StateId;
use elspeth_core::TransformResult;
use elspeth_core::value::RowData;
use serde_json::Map as JsonMap;
use serde_json::Value as JsonValue;
use tracing::debug;

// ============================================================================
// SECTION: Configuration
// ============================================================================

/// Pool configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoolConfig {
    /// Number of parallel workers.
    pub pool_size: usize,
    /// Total retry budget per row, in seconds.
    pub max_capacity_retry_seconds: f64,
    /// Minimum gap between any two consecutive dispatches, in milliseconds.
    pub min_dispatch_delay_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            max_capacity_retry_seconds: 60.0,
            min_dispatch_delay_ms: 0,
        }
    }
}

/// Initial backoff after a retryable error.
const INITIAL_BACKOFF: Duration = Duration::from_millis(50);
/// Ceiling for exponential backoff growth.
const MAX_BACKOFF: Duration = Duration::from_secs(2);

// ============================================================================
// SECTION: Row Context & Result
// ============================================================================

/// Per-row input to the pool.
#[derive(Debug, Clone)]
pub struct RowContext {
    /// Row data to process.
    pub row: RowData,
    /// Node state the row's calls are attributed to.
    pub state_id: StateId,
    /// Position in the input batch; results return in this order.
    pub row_index: usize,
}

/// Per-row output of the pool.
#[derive(Debug, Clone)]
pub struct PooledRowResult {
    /// Position in the input batch.
    pub row_index: usize,
    /// Typed transform result; retry/permanent failures carry reason maps.
    pub result: TransformResult,
    /// Number of plugin invocations made for this row.
    pub attempts: u32,
}

// ============================================================================
// SECTION: Dispatch Gate
// ============================================================================

/// Global pacing gate shared by every worker.
struct DispatchGate {
    /// Last dispatch instant, under a mutex.
    last: Mutex<Option<Instant>>,
    /// Minimum gap between dispatches.
    min_gap: Duration,
}

impl DispatchGate {
    /// Creates a gate with the configured minimum gap.
    fn new(min_dispatch_delay_ms: u64) -> Self {
        Self {
            last: Mutex::new(None),
            min_gap: Duration::from_millis(min_dispatch_delay_ms),
        }
    }

    /// Blocks until this dispatch may proceed, then records it.
    ///
    /// Holding the lock through the sleep is deliberate: the gap applies
    /// between any two dispatches across all workers, including a retry that
    /// just finished its backoff sleep.
    fn pass(&self) {
        let Ok(mut last) = self.last.lock() else {
            return;
        };
        if self.min_gap > Duration::ZERO
            && let Some(previous) = *last
        {
            let target = previous + self.min_gap;
            let now = Instant::now();
            if now < target {
                thread::sleep(target - now);
            }
        }
        *last = Some(Instant::now());
    }
}

// ============================================================================
// SECTION: Pooled Executor
// ============================================================================

/// Bounded-parallel executor with retry discrimination.
#[derive(Debug, Clone)]
pub struct PooledExecutor {
    /// Pool configuration.
    config: PoolConfig,
}

impl PooledExecutor {
    /// Creates an executor with the given configuration.
    #[must_use]
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config: PoolConfig {
                pool_size: config.pool_size.max(1),
                ..config
            },
        }
    }

    /// Processes a batch of rows, returning results in row-index order.
    ///
    /// The process function is invoked once per attempt; retryable errors
    /// re-dispatch (through the gate) until the per-row retry budget is
    /// exhausted.
    pub fn execute_batch<F>(&self, contexts: Vec<RowContext>, process: F) -> Vec<PooledRowResult>
    where
        F: Fn(&RowContext) -> Result<TransformResult, PluginError> + Send + Sync,
    {
        let total = contexts.len();
        if total == 0 {
            return Vec::new();
        }

        let queue: Mutex<VecDeque<RowContext>> = Mutex::new(contexts.into());
        let results: Mutex<Vec<Option<PooledRowResult>>> =
            Mutex::new((0..total).map(|_| None).collect());
        let gate = DispatchGate::new(self.config.min_dispatch_delay_ms);
        let workers = self.config.pool_size.min(total);

        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    loop {
                        let Some(context) = pop_next(&queue) else {
                            break;
                        };
                        let outcome = self.process_row(&context, &gate, &process);
                        if let Ok(mut slots) = results.lock()
                            && let Some(slot) = slots.get_mut(context.row_index)
                        {
                            *slot = Some(outcome);
                        }
                    }
                });
            }
        });

        results
            .into_inner()
            .map_or_else(|_| Vec::new(), |slots| {
                slots
                    .into_iter()
                    .enumerate()
                    .map(|(row_index, slot)| {
                        slot.unwrap_or_else(|| PooledRowResult {
                            row_index,
                            result: TransformResult::error(reason_map(vec![
                                ("reason", JsonValue::from("worker_lost")),
                            ])),
                            attempts: 0,
                        })
                    })
                    .collect()
            })
    }

    /// Runs one row through dispatch, retry, and discrimination.
    fn process_row<F>(
        &self,
        context: &RowContext,
        gate: &DispatchGate,
        process: &F,
    ) -> PooledRowResult
    where
        F: Fn(&RowContext) -> Result<TransformResult, PluginError>,
    {
        let deadline =
            Instant::now() + Duration::from_secs_f64(self.config.max_capacity_retry_seconds.max(0.0));
        let mut backoff = INITIAL_BACKOFF;
        let mut attempts = 0_u32;

        loop {
            gate.pass();
            attempts += 1;
            match process(context) {
                Ok(result) => {
                    return PooledRowResult {
                        row_index: context.row_index,
                        result,
                        attempts,
                    };
                }
                Err(error) if !error.retryable => {
                    return PooledRowResult {
                        row_index: context.row_index,
                        result: TransformResult::error(reason_map(vec![
                            ("reason", JsonValue::from("permanent_error")),
                            ("error_type", JsonValue::from(error.error_type.clone())),
                            ("error", JsonValue::from(error.message.clone())),
                        ])),
                        attempts,
                    };
                }
                Err(error) => {
                    if Instant::now() >= deadline {
                        return PooledRowResult {
                            row_index: context.row_index,
                            result: TransformResult::error(timeout_reason(&error)),
                            attempts,
                        };
                    }
                    debug!(
                        state_id = %context.state_id,
                        error_type = %error.error_type,
                        backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                        "retryable error, backing off"
                    );
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    thread::sleep(backoff.min(remaining));
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    if Instant::now() >= deadline {
                        return PooledRowResult {
                            row_index: context.row_index,
                            result: TransformResult::error(timeout_reason(&error)),
                            attempts,
                        };
                    }
                }
            }
        }
    }
}

/// Pops the next queued row context.
fn pop_next(queue: &Mutex<VecDeque<RowContext>>) -> Option<RowContext> {
    queue.lock().ok()?.pop_front()
}

/// Builds a reason map from key/value pairs.
fn reason_map(pairs: Vec<(&str, JsonValue)>) -> JsonMap<String, JsonValue> {
    pairs.into_iter().map(|(key, value)| (key.to_string(), value)).collect()
}

/// The `retry_timeout` reason; capacity errors carry their status code.
fn timeout_reason(error: &PluginError) -> JsonMap<String, JsonValue> {
    let mut pairs = vec![
        ("reason", JsonValue::from("retry_timeout")),
        ("error_type", JsonValue::from(error.error_type.clone())),
    ];
    if let Some(status_code) = error.status_code {
        pairs.push(("status_code", JsonValue::from(status_code)));
    }
    reason_map(pairs)
}
