// elspeth-landscape/src/checkpoint.rs
// ============================================================================
// Module: Landscape Checkpointing
// Description: Checkpoint creation and resume integrity verification.
// Purpose: Prove sink durability per token and gate resume on integrity.
// Dependencies: elspeth-core, rusqlite, crate::recorder
// ============================================================================

//! ## Overview
//! A checkpoint is written only after a sink's write-plus-flush has succeeded
//! for a token; it proves "this token's effects are durable". On resume, the
//! recovery manager verifies that the current graph fingerprint matches the
//! checkpointed one and that the run's stored schema contract still hashes to
//! its embedded `version_hash`. Either mismatch refuses resume; contract
//! tampering is a [`CheckpointCorruptionError`]. Runs recorded before
//! contracts were embedded resume as legacy.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;

use elspeth_core::Checkpoint;
use elspeth_core::CheckpointCorruptionError;
use elspeth_core::CheckpointId;
use elspeth_core::Clock;
use elspeth_core::ExecutionGraph;
use elspeth_core::NodeId;
use elspeth_core::RunId;
use elspeth_core::SchemaContract;
use elspeth_core::SystemClock;
use elspeth_core::TokenId;
use elspeth_core::format_utc;
use elspeth_core::parse_utc;
use rusqlite::OptionalExtension;
use rusqlite::params;
use thiserror::Error;

use crate::recorder::LandscapeDb;
use crate::recorder::LandscapeError;
use crate::recorder::LandscapeRecorder;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised during checkpointing and resume.
#[derive(Debug, Error)]
pub enum RecoveryError {
    /// Stored contract or checkpoint state failed integrity verification.
    #[error(transparent)]
    Corruption(#[from] CheckpointCorruptionError),
    /// Resume was refused for a stated reason (no checkpoint, graph drift).
    #[error("resume refused for run {run_id}: {reason}")]
    Refused {
        /// Run whose resume was refused.
        run_id: String,
        /// Why resume is not possible.
        reason: String,
    },
    /// Underlying store failure.
    #[error(transparent)]
    Landscape(#[from] LandscapeError),
    /// Graph validation failed while fingerprinting.
    #[error("graph fingerprint failed: {0}")]
    Graph(String),
}

// ============================================================================
// SECTION: Checkpoint Manager
// ============================================================================

/// Writes and reads checkpoint rows.
#[derive(Clone)]
pub struct CheckpointManager {
    /// Shared database handle.
    db: LandscapeDb,
    /// Wall-clock source.
    clock: Arc<dyn Clock>,
}

impl CheckpointManager {
    /// Creates a manager over the audit database.
    #[must_use]
    pub fn new(db: LandscapeDb) -> Self {
        Self {
            db,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replaces the clock (tests).
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Writes a checkpoint for a token that has durably passed a sink.
    ///
    /// The sequence number is the next integer for the run, so checkpoints
    /// emitted in order carry strictly increasing sequence numbers.
    ///
    /// # Errors
    ///
    /// Returns [`RecoveryError`] when fingerprinting or the insert fails.
    pub fn create_checkpoint(
        &self,
        run_id: &RunId,
        token_id: &TokenId,
        node_id: &NodeId,
        graph: &ExecutionGraph,
    ) -> Result<Checkpoint, RecoveryError> {
        let fingerprint = graph.fingerprint().map_err(|err| RecoveryError::Graph(err.to_string()))?;
        let created_at = self.clock.now();
        let checkpoint_id = CheckpointId::generate();
        let sequence_number = self.db.with_conn(|conn| {
            let next: i64 = conn.query_row(
                "SELECT COALESCE(MAX(sequence_number), 0) + 1 FROM checkpoints WHERE run_id = ?1",
                params![run_id.as_str()],
                |row| row.get(0),
            )?;
            conn.execute(
                "INSERT INTO checkpoints (checkpoint_id, run_id, token_id, node_id, \
                 sequence_number, graph_fingerprint, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    checkpoint_id.as_str(),
                    run_id.as_str(),
                    token_id.as_str(),
                    node_id.as_str(),
                    next,
                    fingerprint,
                    format_utc(created_at),
                ],
            )?;
            Ok(next)
        })?;
        Ok(Checkpoint {
            checkpoint_id,
            run_id: run_id.clone(),
            token_id: token_id.clone(),
            node_id: node_id.clone(),
            sequence_number,
            graph_fingerprint: fingerprint,
            created_at,
        })
    }

    /// Loads the latest checkpoint for a run (maximum sequence number,
    /// filtered to that run only).
    ///
    /// # Errors
    ///
    /// Returns [`RecoveryError::Landscape`] on store failure.
    pub fn get_latest_checkpoint(
        &self,
        run_id: &RunId,
    ) -> Result<Option<Checkpoint>, RecoveryError> {
        Ok(self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT checkpoint_id, run_id, token_id, node_id, sequence_number, \
                 graph_fingerprint, created_at FROM checkpoints WHERE run_id = ?1 \
                 ORDER BY sequence_number DESC LIMIT 1",
                params![run_id.as_str()],
                map_checkpoint,
            )
            .optional()?
            .transpose()
        })?)
    }

    /// Loads all checkpoints for a run in sequence order.
    ///
    /// # Errors
    ///
    /// Returns [`RecoveryError::Landscape`] on store failure.
    pub fn get_checkpoints(&self, run_id: &RunId) -> Result<Vec<Checkpoint>, RecoveryError> {
        Ok(self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT checkpoint_id, run_id, token_id, node_id, sequence_number, \
                 graph_fingerprint, created_at FROM checkpoints WHERE run_id = ?1 \
                 ORDER BY sequence_number",
            )?;
            let rows = stmt.query_map(params![run_id.as_str()], map_checkpoint)?;
            let mut checkpoints = Vec::new();
            for row in rows {
                checkpoints.push(row??);
            }
            Ok(checkpoints)
        })?)
    }
}

/// Maps a checkpoints row.
fn map_checkpoint(
    row: &rusqlite::Row<'_>,
) -> rusqlite::Result<Result<Checkpoint, LandscapeError>> {
    let checkpoint_id: String = row.get(0)?;
    let run_id: String = row.get(1)?;
    let token_id: String = row.get(2)?;
    let node_id: String = row.get(3)?;
    let sequence_number: i64 = row.get(4)?;
    let graph_fingerprint: String = row.get(5)?;
    let created_at: String = row.get(6)?;
    Ok((|| {
        Ok(Checkpoint {
            checkpoint_id: CheckpointId::new(checkpoint_id),
            run_id: RunId::new(run_id),
            token_id: TokenId::new(token_id),
            node_id: NodeId::new(node_id),
            sequence_number,
            graph_fingerprint,
            created_at: parse_utc(&created_at).map_err(LandscapeError::Timestamp)?,
        })
    })())
}

// ============================================================================
// SECTION: Resume Types
// ============================================================================

/// Whether a run can be resumed, with the reason when it cannot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeCheck {
    /// True when resume may proceed.
    pub can_resume: bool,
    /// Why resume is refused, when it is.
    pub reason: Option<String>,
}

/// The computed resume position for a run.
///
/// Tokens up to and including the checkpointed one are durable; every row
/// with a later source index must be re-delivered. Re-delivery may rewrite
/// rows the sink already holds from after the last checkpoint; semantics
/// against the sink are at-least-once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumePoint {
    /// The checkpoint resume starts from.
    pub checkpoint: Checkpoint,
    /// First source row index that must be re-delivered.
    pub resume_from_row_index: i64,
    /// Run-level contract restored from the landscape, when one was stored.
    pub contract: Option<SchemaContract>,
}

// ============================================================================
// SECTION: Recovery Manager
// ============================================================================

/// Verifies integrity and computes resume points.
#[derive(Clone)]
pub struct RecoveryManager {
    /// Recorder for contract and row lookups.
    recorder: LandscapeRecorder,
    /// Checkpoint reader.
    checkpoints: CheckpointManager,
}

impl RecoveryManager {
    /// Creates a recovery manager over the recorder and checkpoint manager.
    #[must_use]
    pub const fn new(recorder: LandscapeRecorder, checkpoints: CheckpointManager) -> Self {
        Self {
            recorder,
            checkpoints,
        }
    }

    /// Verifies the run's stored contract against its embedded hash.
    ///
    /// Returns the contract when valid, `None` when the run stored no
    /// contract (legacy runs resume without this check).
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointCorruptionError`] when the stored hash does not
    /// match a recomputation; the message names the run and the mismatch.
    pub fn verify_contract_integrity(
        &self,
        run_id: &RunId,
    ) -> Result<Option<SchemaContract>, RecoveryError> {
        let Some(contract) = self.recorder.get_run_contract(run_id)? else {
            return Ok(None);
        };
        contract.verify_integrity().map_err(|err| {
            CheckpointCorruptionError::new(
                run_id.as_str(),
                format!("stored schema contract failed integrity verification (tampered or corrupted): {err}"),
            )
        })?;
        Ok(Some(contract))
    }

    /// Checks whether a run can resume under the given graph.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointCorruptionError`] on contract tampering and
    /// [`RecoveryError::Landscape`] on store failure. Graph drift and a
    /// missing checkpoint are reported in the returned check, not raised.
    pub fn can_resume(
        &self,
        run_id: &RunId,
        graph: &ExecutionGraph,
    ) -> Result<ResumeCheck, RecoveryError> {
        let Some(checkpoint) = self.checkpoints.get_latest_checkpoint(run_id)? else {
            return Ok(ResumeCheck {
                can_resume: false,
                reason: Some("run has no checkpoint".to_string()),
            });
        };
        let fingerprint =
            graph.fingerprint().map_err(|err| RecoveryError::Graph(err.to_string()))?;
        if fingerprint != checkpoint.graph_fingerprint {
            return Ok(ResumeCheck {
                can_resume: false,
                reason: Some(format!(
                    "graph fingerprint {fingerprint} does not match checkpointed {}",
                    checkpoint.graph_fingerprint
                )),
            });
        }
        self.verify_contract_integrity(run_id)?;
        Ok(ResumeCheck {
            can_resume: true,
            reason: None,
        })
    }

    /// Computes the resume point for a run.
    ///
    /// # Errors
    ///
    /// Returns [`RecoveryError::Refused`] when the run cannot resume,
    /// [`CheckpointCorruptionError`] on contract tampering, and
    /// [`RecoveryError::Landscape`] on store failure.
    pub fn get_resume_point(
        &self,
        run_id: &RunId,
        graph: &ExecutionGraph,
    ) -> Result<ResumePoint, RecoveryError> {
        let check = self.can_resume(run_id, graph)?;
        if !check.can_resume {
            return Err(RecoveryError::Refused {
                run_id: run_id.as_str().to_string(),
                reason: check.reason.unwrap_or_else(|| "unknown".to_string()),
            });
        }
        let checkpoint = self.checkpoints.get_latest_checkpoint(run_id)?.ok_or_else(|| {
            RecoveryError::Refused {
                run_id: run_id.as_str().to_string(),
                reason: "checkpoint vanished between checks".to_string(),
            }
        })?;
        let contract = self.verify_contract_integrity(run_id)?;
        let resume_from_row_index = self.row_index_of_token(&checkpoint.token_id)? + 1;
        Ok(ResumePoint {
            checkpoint,
            resume_from_row_index,
            contract,
        })
    }

    /// Source row index behind a token.
    fn row_index_of_token(&self, token_id: &TokenId) -> Result<i64, RecoveryError> {
        Ok(self.recorder.db().with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT r.row_index FROM tokens t JOIN rows r ON t.row_id = r.row_id \
                 WHERE t.token_id = ?1",
                params![token_id.as_str()],
                |row| row.get(0),
            )?)
        })?)
    }
}
