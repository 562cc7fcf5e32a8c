// elspeth-engine/src/reorder.rs
// ============================================================================
// Module: Row Reorder Buffer
// Description: FIFO-release buffer over out-of-order worker completions.
// Purpose: Preserve source order across parallel row processing.
// Dependencies: std::sync
// ============================================================================

//! ## Overview
//! Pipelined transforms complete rows out of order; this buffer accepts those
//! completions and releases them in strict submission order. Submission
//! blocks when `max_pending` rows are in flight (backpressure); the release
//! side blocks until the next sequence is complete. Eviction removes a slot
//! that will never complete (a timed-out attempt being retried under a new
//! ticket) and skips the release cursor over the gap.
//!
//! One lock protects all state, with two condition variables: one for
//! submit-space, one for release-readiness. Slot events use `notify_one`
//! (only one waiter can be next in sequence); shutdown is the only
//! `notify_all`.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;
use std::time::Instant;

use thiserror::Error;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised by buffer operations.
#[derive(Debug, Error)]
pub enum ReorderError {
    /// The buffer was shut down while waiting or operating.
    #[error("buffer '{name}' is shut down")]
    Shutdown {
        /// Buffer name.
        name: String,
    },
    /// A timed wait expired.
    #[error("timeout {0}")]
    Timeout(String),
    /// A ticket was completed that was never submitted (or already
    /// released or evicted).
    #[error("ticket {sequence} (row_id={row_id}) was never submitted")]
    UnknownTicket {
        /// Sequence of the unknown ticket.
        sequence: u64,
        /// Row id the ticket carried.
        row_id: String,
    },
    /// A ticket was completed twice.
    #[error("ticket {sequence} (row_id={row_id}) already completed")]
    AlreadyCompleted {
        /// Sequence of the duplicated completion.
        sequence: u64,
        /// Row id the ticket carried.
        row_id: String,
    },
    /// The buffer lock was poisoned by a panicking worker.
    #[error("buffer '{name}' lock poisoned")]
    Poisoned {
        /// Buffer name.
        name: String,
    },
}

// ============================================================================
// SECTION: Tickets & Entries
// ============================================================================

/// Handle for a submitted row; pass to [`RowReorderBuffer::complete`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowTicket {
    /// Release-order sequence assigned at submission.
    pub sequence: u64,
    /// Caller's row identity (for example a token id).
    pub row_id: String,
}

/// Entry emitted by the buffer in FIFO order.
#[derive(Debug)]
pub struct RowBufferEntry<T> {
    /// Release-order sequence.
    pub sequence: u64,
    /// Caller's row identity.
    pub row_id: String,
    /// The worker's result.
    pub result: T,
    /// Milliseconds the completed result waited for its turn.
    pub buffer_wait_ms: f64,
}

/// Metrics snapshot for observability.
#[derive(Debug, Clone, PartialEq)]
pub struct ReorderMetrics {
    /// Buffer name.
    pub name: String,
    /// Configured backpressure limit.
    pub max_pending: usize,
    /// Rows currently in flight.
    pub current_pending: usize,
    /// Completed rows waiting for predecessors.
    pub completed_waiting: usize,
    /// Next sequence to release.
    pub next_release_seq: u64,
    /// Total rows submitted.
    pub total_submitted: u64,
    /// Total rows released.
    pub total_released: u64,
    /// High-water mark of in-flight rows.
    pub max_observed_pending: usize,
    /// Mean wait between completion and release.
    pub avg_buffer_wait_ms: f64,
}

/// Internal slot for a pending row.
#[derive(Debug)]
struct PendingEntry<T> {
    /// Caller's row identity.
    row_id: String,
    /// When the worker finished, once complete.
    completed_at: Option<Instant>,
    /// The result, once complete.
    result: Option<T>,
}

/// State behind the buffer lock.
#[derive(Debug)]
struct BufferState<T> {
    /// Next sequence to hand out.
    next_submit_seq: u64,
    /// Next sequence to release.
    next_release_seq: u64,
    /// In-flight slots by sequence.
    pending: BTreeMap<u64, PendingEntry<T>>,
    /// Shutdown flag; wakes all waiters.
    shutdown: bool,
    /// Total rows submitted.
    total_submitted: u64,
    /// Total rows released.
    total_released: u64,
    /// High-water mark of in-flight rows.
    max_observed_pending: usize,
    /// Accumulated completion-to-release wait.
    total_wait_ms: f64,
}

// ============================================================================
// SECTION: Buffer
// ============================================================================

/// Thread-safe FIFO-release buffer for row-level pipelining.
///
/// # Invariants
/// - `next_release_seq <= next_submit_seq`.
/// - `pending.len() <= max_pending`.
/// - Emission order equals submission order.
#[derive(Debug)]
pub struct RowReorderBuffer<T> {
    /// Buffer name for diagnostics.
    name: String,
    /// Backpressure limit.
    max_pending: usize,
    /// Single lock protecting all state.
    state: Mutex<BufferState<T>>,
    /// Waiters for submit space.
    submit_ready: Condvar,
    /// Waiters for FIFO release.
    release_ready: Condvar,
}

impl<T> RowReorderBuffer<T> {
    /// Creates a buffer with a backpressure limit (clamped to at least one).
    #[must_use]
    pub fn new(max_pending: usize, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_pending: max_pending.max(1),
            state: Mutex::new(BufferState {
                next_submit_seq: 0,
                next_release_seq: 0,
                pending: BTreeMap::new(),
                shutdown: false,
                total_submitted: 0,
                total_released: 0,
                max_observed_pending: 0,
                total_wait_ms: 0.0,
            }),
            submit_ready: Condvar::new(),
            release_ready: Condvar::new(),
        }
    }

    /// Locks the state, mapping poisoning to a typed error.
    fn lock(&self) -> Result<MutexGuard<'_, BufferState<T>>, ReorderError> {
        self.state.lock().map_err(|_| ReorderError::Poisoned {
            name: self.name.clone(),
        })
    }

    /// Submits a row, blocking while the buffer is full.
    ///
    /// # Errors
    ///
    /// Returns [`ReorderError::Shutdown`] when shut down and
    /// [`ReorderError::Timeout`] when `timeout` expires waiting for space.
    pub fn submit(
        &self,
        row_id: &str,
        timeout: Option<Duration>,
    ) -> Result<RowTicket, ReorderError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.lock()?;
        while state.pending.len() >= self.max_pending {
            if state.shutdown {
                return Err(ReorderError::Shutdown {
                    name: self.name.clone(),
                });
            }
            state = self.wait_on(&self.submit_ready, state, deadline, || {
                format!(
                    "waiting for buffer space (pending={}, max={})",
                    self.max_pending, self.max_pending
                )
            })?;
        }
        if state.shutdown {
            return Err(ReorderError::Shutdown {
                name: self.name.clone(),
            });
        }

        let sequence = state.next_submit_seq;
        state.next_submit_seq += 1;
        state.pending.insert(
            sequence,
            PendingEntry {
                row_id: row_id.to_string(),
                completed_at: None,
                result: None,
            },
        );
        state.total_submitted += 1;
        state.max_observed_pending = state.max_observed_pending.max(state.pending.len());

        Ok(RowTicket {
            sequence,
            row_id: row_id.to_string(),
        })
    }

    /// Marks a row complete; it releases once all predecessors have.
    ///
    /// # Errors
    ///
    /// Returns [`ReorderError::UnknownTicket`] for never-submitted (or
    /// already released/evicted) tickets and
    /// [`ReorderError::AlreadyCompleted`] for duplicates.
    pub fn complete(&self, ticket: &RowTicket, result: T) -> Result<(), ReorderError> {
        let mut state = self.lock()?;
        let entry =
            state.pending.get_mut(&ticket.sequence).ok_or_else(|| ReorderError::UnknownTicket {
                sequence: ticket.sequence,
                row_id: ticket.row_id.clone(),
            })?;
        if entry.result.is_some() {
            return Err(ReorderError::AlreadyCompleted {
                sequence: ticket.sequence,
                row_id: ticket.row_id.clone(),
            });
        }
        entry.result = Some(result);
        entry.completed_at = Some(Instant::now());
        // Only one waiter can be next in sequence.
        self.release_ready.notify_one();
        Ok(())
    }

    /// Blocks until the next FIFO-ordered result is ready, then emits it.
    ///
    /// # Errors
    ///
    /// Returns [`ReorderError::Shutdown`] when shut down and
    /// [`ReorderError::Timeout`] when `timeout` expires.
    pub fn wait_for_next_release(
        &self,
        timeout: Option<Duration>,
    ) -> Result<RowBufferEntry<T>, ReorderError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.lock()?;
        loop {
            if state.shutdown {
                return Err(ReorderError::Shutdown {
                    name: self.name.clone(),
                });
            }

            let next_seq = state.next_release_seq;
            let ready = state
                .pending
                .get(&next_seq)
                .is_some_and(|entry| entry.result.is_some());
            if ready {
                let Some(entry) = state.pending.remove(&next_seq) else {
                    continue;
                };
                let (Some(result), Some(completed_at)) = (entry.result, entry.completed_at) else {
                    return Err(ReorderError::Poisoned {
                        name: self.name.clone(),
                    });
                };
                let buffer_wait_ms = completed_at.elapsed().as_secs_f64() * 1_000.0;
                state.next_release_seq = next_seq + 1;
                state.total_released += 1;
                state.total_wait_ms += buffer_wait_ms;
                // One slot freed; wake one submitter.
                self.submit_ready.notify_one();
                return Ok(RowBufferEntry {
                    sequence: next_seq,
                    row_id: entry.row_id,
                    result,
                    buffer_wait_ms,
                });
            }

            let waiting_for = state.next_release_seq;
            state = self.wait_on(&self.release_ready, state, deadline, || {
                format!("waiting for sequence {waiting_for}")
            })?;
        }
    }

    /// Evicts a slot that will never complete, skipping the release cursor
    /// over any contiguous gap. Returns false when the ticket is unknown or
    /// already complete.
    ///
    /// # Errors
    ///
    /// Returns [`ReorderError::Poisoned`] when the lock is poisoned.
    pub fn evict(&self, ticket: &RowTicket) -> Result<bool, ReorderError> {
        let mut state = self.lock()?;
        let Some(entry) = state.pending.get(&ticket.sequence) else {
            return Ok(false);
        };
        if entry.result.is_some() {
            // Already complete; it will be released shortly.
            return Ok(false);
        }
        state.pending.remove(&ticket.sequence);

        // Skip forward over this and any other evicted sequences.
        while state.next_release_seq < state.next_submit_seq
            && !state.pending.contains_key(&state.next_release_seq)
        {
            state.next_release_seq += 1;
        }

        // The next sequence may now be ready, and a slot was freed.
        self.release_ready.notify_one();
        self.submit_ready.notify_one();
        Ok(true)
    }

    /// Signals shutdown, waking every waiter with a shutdown error.
    pub fn shutdown(&self) {
        if let Ok(mut state) = self.lock() {
            state.shutdown = true;
            // Shutdown is the one event every waiter must see.
            self.submit_ready.notify_all();
            self.release_ready.notify_all();
        }
    }

    /// Number of rows currently in flight.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.lock().map_or(0, |state| state.pending.len())
    }

    /// Whether the buffer has been shut down.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.lock().is_ok_and(|state| state.shutdown)
    }

    /// Metrics snapshot for observability.
    ///
    /// # Errors
    ///
    /// Returns [`ReorderError::Poisoned`] when the lock is poisoned.
    pub fn metrics(&self) -> Result<ReorderMetrics, ReorderError> {
        let state = self.lock()?;
        let completed_waiting =
            state.pending.values().filter(|entry| entry.result.is_some()).count();
        let avg_buffer_wait_ms = if state.total_released == 0 {
            0.0
        } else {
            #[allow(clippy::cast_precision_loss, reason = "Metrics average only.")]
            let released = state.total_released as f64;
            state.total_wait_ms / released
        };
        Ok(ReorderMetrics {
            name: self.name.clone(),
            max_pending: self.max_pending,
            current_pending: state.pending.len(),
            completed_waiting,
            next_release_seq: state.next_release_seq,
            total_submitted: state.total_submitted,
            total_released: state.total_released,
            max_observed_pending: state.max_observed_pending,
            avg_buffer_wait_ms,
        })
    }

    /// Condvar wait with optional deadline, re-checking on wake.
    fn wait_on<'a>(
        &self,
        condvar: &Condvar,
        guard: MutexGuard<'a, BufferState<T>>,
        deadline: Option<Instant>,
        describe: impl Fn() -> String,
    ) -> Result<MutexGuard<'a, BufferState<T>>, ReorderError> {
        match deadline {
            None => condvar.wait(guard).map_err(|_| ReorderError::Poisoned {
                name: self.name.clone(),
            }),
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(ReorderError::Timeout(describe()));
                }
                let (guard, result) = condvar
                    .wait_timeout(guard, deadline - now)
                    .map_err(|_| ReorderError::Poisoned {
                        name: self.name.clone(),
                    })?;
                if result.timed_out() && Instant::now() >= deadline {
                    return Err(ReorderError::Timeout(describe()));
                }
                Ok(guard)
            }
        }
    }
}
