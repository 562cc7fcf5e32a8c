// elspeth-landscape/src/recorder.rs
// ============================================================================
// Module: Landscape Recorder
// Description: Facade over the SQLite audit store.
// Purpose: Provide the mandatory durable-write operations for executors.
// Dependencies: elspeth-core, rusqlite, serde_json
// ============================================================================

//! ## Overview
//! The recorder is the only writer of the audit store. It hashes every
//! payload through the canonical serializer, writes full payloads to the
//! content-addressed payload store, allocates per-state call indices, and
//! enforces the narrow mutability rules of the schema. Reads reconstruct
//! strict enums and the node-state status table, failing closed with an
//! audit-integrity error on any violation.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;

use elspeth_core::Artifact;
use elspeth_core::ArtifactId;
use elspeth_core::AuditIntegrityError;
use elspeth_core::Batch;
use elspeth_core::BatchId;
use elspeth_core::BatchMember;
use elspeth_core::BatchStatus;
use elspeth_core::CallId;
use elspeth_core::CallRecord;
use elspeth_core::CallStatus;
use elspeth_core::CallType;
use elspeth_core::CanonicalError;
use elspeth_core::Clock;
use elspeth_core::ContractAuditRecord;
use elspeth_core::ContractError;
use elspeth_core::ContractViolation;
use elspeth_core::Determinism;
use elspeth_core::Edge;
use elspeth_core::EdgeId;
use elspeth_core::ErrorId;
use elspeth_core::ExecutionError;
use elspeth_core::ExportStatus;
use elspeth_core::Node;
use elspeth_core::NodeId;
use elspeth_core::NodeState;
use elspeth_core::NodeStateCore;
use elspeth_core::NodeStateStatus;
use elspeth_core::NodeType;
use elspeth_core::OperationId;
use elspeth_core::OperationRecord;
use elspeth_core::PayloadStore;
use elspeth_core::PayloadStoreError;
use elspeth_core::RoutingEvent;
use elspeth_core::RoutingMode;
use elspeth_core::RowData;
use elspeth_core::RowId;
use elspeth_core::RowRecord;
use elspeth_core::Run;
use elspeth_core::RunId;
use elspeth_core::RunStatus;
use elspeth_core::SchemaContract;
use elspeth_core::StateId;
use elspeth_core::SystemClock;
use elspeth_core::Token;
use elspeth_core::TokenId;
use elspeth_core::TokenOutcome;
use elspeth_core::TokenOutcomeKind;
use elspeth_core::TransformErrorRecord;
use elspeth_core::TriggerType;
use elspeth_core::ValidationErrorRecord;
use elspeth_core::canonical_json_raw;
use elspeth_core::format_utc;
use elspeth_core::normalize_row;
use elspeth_core::parse_utc;
use elspeth_core::stable_hash_raw;
use rusqlite::Connection;
use rusqlite::ErrorCode;
use rusqlite::OptionalExtension;
use rusqlite::Row as SqlRow;
use rusqlite::params;
use serde_json::Map as JsonMap;
use serde_json::Value as JsonValue;
use thiserror::Error;
use time::OffsetDateTime;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised by the landscape store.
#[derive(Debug, Error)]
pub enum LandscapeError {
    /// Underlying SQLite failure.
    #[error("landscape store error: {0}")]
    Store(String),
    /// A stored row violated the audit schema's own rules.
    #[error(transparent)]
    Integrity(#[from] AuditIntegrityError),
    /// Canonicalization failed while hashing a payload.
    #[error(transparent)]
    Canonical(#[from] CanonicalError),
    /// Stored contract JSON was malformed or failed verification.
    #[error(transparent)]
    Contract(#[from] ContractError),
    /// Payload store failure.
    #[error(transparent)]
    Payload(#[from] PayloadStoreError),
    /// A stored timestamp could not be parsed.
    #[error("malformed stored timestamp '{0}'")]
    Timestamp(String),
    /// An edge with the same `(from, label)` already exists in the run.
    #[error("edge from '{from}' with label '{label}' already registered for run")]
    DuplicateEdgeLabel {
        /// Source node of the duplicate edge.
        from: String,
        /// Duplicated label.
        label: String,
    },
}

impl From<rusqlite::Error> for LandscapeError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Store(err.to_string())
    }
}

// ============================================================================
// SECTION: Database Handle
// ============================================================================

/// Shared handle to the audit database connection.
#[derive(Clone)]
pub struct LandscapeDb {
    /// Serialized connection; ordinary transactional writes.
    conn: Arc<Mutex<Connection>>,
}

impl LandscapeDb {
    /// Opens (creating if needed) an audit database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the database cannot be opened or the
    /// schema cannot be applied.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LandscapeError> {
        let conn = Connection::open(path)?;
        crate::schema::initialize_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Opens an in-memory audit database for tests and dry runs.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the schema cannot be applied.
    pub fn in_memory() -> Result<Self, LandscapeError> {
        let conn = Connection::open_in_memory()?;
        crate::schema::initialize_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs a closure against the locked connection.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError::Store`] when the mutex is poisoned, plus
    /// whatever the closure returns.
    pub(crate) fn with_conn<T>(
        &self,
        body: impl FnOnce(&Connection) -> Result<T, LandscapeError>,
    ) -> Result<T, LandscapeError> {
        let guard = self
            .conn
            .lock()
            .map_err(|_| LandscapeError::Store("landscape connection mutex poisoned".to_string()))?;
        body(&guard)
    }
}

// ============================================================================
// SECTION: Node Registration Input
// ============================================================================

/// Inputs for registering a node in the audit graph.
#[derive(Debug, Clone)]
pub struct NodeRegistration {
    /// Node id; generated when absent.
    pub node_id: Option<NodeId>,
    /// Plugin name.
    pub plugin_name: String,
    /// Node kind.
    pub node_type: NodeType,
    /// Plugin version string.
    pub plugin_version: String,
    /// Determinism classification.
    pub determinism: Determinism,
    /// Resolved plugin configuration.
    pub config: JsonValue,
    /// Position in the pipeline, when known at registration time.
    pub sequence: Option<i64>,
    /// Optional declared schema hash.
    pub schema_hash: Option<String>,
    /// Schema mode literal for audit.
    pub schema_mode: String,
    /// Declared schema fields JSON, when not observed.
    pub schema_fields_json: Option<String>,
    /// Input contract, when declared.
    pub input_contract: Option<SchemaContract>,
    /// Output contract, when declared.
    pub output_contract: Option<SchemaContract>,
}

// ============================================================================
// SECTION: Divert Summary
// ============================================================================

/// Lineage classification of a token's divert, for external query surfaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DivertSummary {
    /// `error`, `quarantine`, `route`, or `none`.
    pub divert_type: String,
    /// Label of the divert edge, when one was taken.
    pub edge_label: Option<String>,
}

// ============================================================================
// SECTION: Recorder
// ============================================================================

/// The single writer of the audit store.
#[derive(Clone)]
pub struct LandscapeRecorder {
    /// Shared database handle.
    db: LandscapeDb,
    /// Content-addressed payload store.
    payloads: Arc<dyn PayloadStore>,
    /// Wall-clock source for record timestamps.
    clock: Arc<dyn Clock>,
}

impl LandscapeRecorder {
    /// Creates a recorder over a database and payload store.
    #[must_use]
    pub fn new(db: LandscapeDb, payloads: Arc<dyn PayloadStore>) -> Self {
        Self {
            db,
            payloads,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replaces the clock (tests and replay).
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The shared database handle.
    #[must_use]
    pub fn db(&self) -> &LandscapeDb {
        &self.db
    }

    /// The payload store behind the audit rows.
    #[must_use]
    pub fn payload_store(&self) -> &Arc<dyn PayloadStore> {
        &self.payloads
    }

    /// Current UTC timestamp from the recorder's clock.
    fn now(&self) -> OffsetDateTime {
        self.clock.now()
    }

    /// Hashes a JSON payload and writes the bytes to the payload store.
    fn hash_and_store(&self, payload: &JsonValue) -> Result<String, LandscapeError> {
        let canonical = canonical_json_raw(payload)?;
        let hash = stable_hash_raw(payload)?;
        self.payloads.put(&hash, canonical.as_bytes())?;
        Ok(hash)
    }

    // ========================================================================
    // SECTION: Runs
    // ========================================================================

    /// Begins a run, seeding its config hash and canonical version.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when hashing or the insert fails.
    pub fn begin_run(
        &self,
        settings: &JsonValue,
        canonical_version: &str,
    ) -> Result<Run, LandscapeError> {
        let run = Run {
            run_id: RunId::generate(),
            started_at: self.now(),
            completed_at: None,
            config_hash: stable_hash_raw(settings)?,
            settings_json: canonical_json_raw(settings)?,
            canonical_version: canonical_version.to_string(),
            status: RunStatus::Running,
            schema_contract_json: None,
            export_status: None,
            export_error: None,
        };
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO runs (run_id, started_at, config_hash, settings_json, \
                 canonical_version, status) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    run.run_id.as_str(),
                    format_utc(run.started_at),
                    run.config_hash,
                    run.settings_json,
                    run.canonical_version,
                    run.status.as_str(),
                ],
            )?;
            Ok(())
        })?;
        Ok(run)
    }

    /// Marks a run terminal with its completion time.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError::Integrity`] when the run does not exist.
    pub fn complete_run(&self, run_id: &RunId, status: RunStatus) -> Result<(), LandscapeError> {
        let now = format_utc(self.now());
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE runs SET status = ?1, completed_at = ?2 WHERE run_id = ?3",
                params![status.as_str(), now, run_id.as_str()],
            )?;
            if changed == 0 {
                return Err(AuditIntegrityError::new(format!(
                    "run '{run_id}' not found for completion"
                ))
                .into());
            }
            Ok(())
        })
    }

    /// Reopens a run for resume: status back to RUNNING, completion cleared.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError::Integrity`] when the run does not exist.
    pub fn reopen_run(&self, run_id: &RunId) -> Result<(), LandscapeError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE runs SET status = ?1, completed_at = NULL WHERE run_id = ?2",
                params![RunStatus::Running.as_str(), run_id.as_str()],
            )?;
            if changed == 0 {
                return Err(AuditIntegrityError::new(format!(
                    "run '{run_id}' not found for resume"
                ))
                .into());
            }
            Ok(())
        })
    }

    /// Loads a run by id.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] on store failure or corrupt literals.
    pub fn get_run(&self, run_id: &RunId) -> Result<Option<Run>, LandscapeError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT run_id, started_at, completed_at, config_hash, settings_json, \
                 canonical_version, status, schema_contract_json, export_status, export_error \
                 FROM runs WHERE run_id = ?1",
                params![run_id.as_str()],
                map_run,
            )
            .optional()?
            .transpose()
        })
    }

    /// Embeds (or replaces) the run-level schema contract.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when encoding or the update fails.
    pub fn update_run_contract(
        &self,
        run_id: &RunId,
        contract: &SchemaContract,
    ) -> Result<(), LandscapeError> {
        let encoded = ContractAuditRecord::from_contract(contract).to_json()?;
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE runs SET schema_contract_json = ?1 WHERE run_id = ?2",
                params![encoded, run_id.as_str()],
            )?;
            Ok(())
        })
    }

    /// Loads the run-level contract without verifying it; resume verifies.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when decoding fails.
    pub fn get_run_contract(
        &self,
        run_id: &RunId,
    ) -> Result<Option<SchemaContract>, LandscapeError> {
        let raw: Option<String> = self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT schema_contract_json FROM runs WHERE run_id = ?1",
                    params![run_id.as_str()],
                    |row| row.get(0),
                )
                .optional()?
                .flatten())
        })?;
        raw.map(|json| Ok(ContractAuditRecord::from_json(&json)?.to_contract()?)).transpose()
    }

    /// Records an export transition; FAILED stores the error, any other
    /// status clears it so stale diagnostics cannot survive.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the update fails.
    pub fn set_export_status(
        &self,
        run_id: &RunId,
        status: ExportStatus,
        error: Option<&str>,
    ) -> Result<(), LandscapeError> {
        let stored_error = match status {
            ExportStatus::Failed => error,
            ExportStatus::Pending | ExportStatus::Exported => None,
        };
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE runs SET export_status = ?1, export_error = ?2 WHERE run_id = ?3",
                params![status.as_str(), stored_error, run_id.as_str()],
            )?;
            Ok(())
        })
    }

    // ========================================================================
    // SECTION: Graph Registration
    // ========================================================================

    /// Registers a node, hashing its configuration.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when hashing or the insert fails.
    pub fn register_node(
        &self,
        run_id: &RunId,
        registration: NodeRegistration,
    ) -> Result<Node, LandscapeError> {
        let input_contract_json = registration
            .input_contract
            .as_ref()
            .map(|contract| ContractAuditRecord::from_contract(contract).to_json())
            .transpose()?;
        let output_contract_json = registration
            .output_contract
            .as_ref()
            .map(|contract| ContractAuditRecord::from_contract(contract).to_json())
            .transpose()?;
        let node = Node {
            node_id: registration.node_id.unwrap_or_else(NodeId::generate),
            run_id: run_id.clone(),
            plugin_name: registration.plugin_name,
            node_type: registration.node_type,
            plugin_version: registration.plugin_version,
            determinism: registration.determinism,
            config_hash: stable_hash_raw(&registration.config)?,
            config_json: canonical_json_raw(&registration.config)?,
            schema_hash: registration.schema_hash,
            sequence_in_pipeline: registration.sequence,
            schema_mode: registration.schema_mode,
            schema_fields_json: registration.schema_fields_json,
            input_contract_json,
            output_contract_json,
            registered_at: self.now(),
        };
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO nodes (node_id, run_id, plugin_name, node_type, plugin_version, \
                 determinism, config_hash, config_json, schema_hash, sequence_in_pipeline, \
                 schema_mode, schema_fields_json, input_contract_json, output_contract_json, \
                 registered_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                params![
                    node.node_id.as_str(),
                    node.run_id.as_str(),
                    node.plugin_name,
                    node.node_type.as_str(),
                    node.plugin_version,
                    node.determinism.as_str(),
                    node.config_hash,
                    node.config_json,
                    node.schema_hash,
                    node.sequence_in_pipeline,
                    node.schema_mode,
                    node.schema_fields_json,
                    node.input_contract_json,
                    node.output_contract_json,
                    format_utc(node.registered_at),
                ],
            )?;
            Ok(())
        })?;
        Ok(node)
    }

    /// Registers an edge, enforcing `(from, label)` uniqueness per run.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError::DuplicateEdgeLabel`] on a uniqueness
    /// violation.
    pub fn register_edge(
        &self,
        run_id: &RunId,
        from_node_id: &NodeId,
        to_node_id: &NodeId,
        label: &str,
        mode: RoutingMode,
    ) -> Result<Edge, LandscapeError> {
        let edge = Edge {
            edge_id: EdgeId::generate(),
            run_id: run_id.clone(),
            from_node_id: from_node_id.clone(),
            to_node_id: to_node_id.clone(),
            label: label.to_string(),
            default_mode: mode,
            created_at: self.now(),
        };
        let inserted = self.db.with_conn(|conn| {
            let outcome = conn.execute(
                "INSERT INTO edges (edge_id, run_id, from_node_id, to_node_id, label, \
                 default_mode, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    edge.edge_id.as_str(),
                    edge.run_id.as_str(),
                    edge.from_node_id.as_str(),
                    edge.to_node_id.as_str(),
                    edge.label,
                    edge.default_mode.as_str(),
                    format_utc(edge.created_at),
                ],
            );
            match outcome {
                Ok(_) => Ok(true),
                Err(err) if is_constraint_violation(&err) => Ok(false),
                Err(err) => Err(err.into()),
            }
        })?;
        if inserted {
            Ok(edge)
        } else {
            Err(LandscapeError::DuplicateEdgeLabel {
                from: from_node_id.as_str().to_string(),
                label: label.to_string(),
            })
        }
    }

    /// Loads all nodes for a run, ordered by sequence then registration.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] on store failure or corrupt literals.
    pub fn get_nodes(&self, run_id: &RunId) -> Result<Vec<Node>, LandscapeError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT node_id, run_id, plugin_name, node_type, plugin_version, determinism, \
                 config_hash, config_json, schema_hash, sequence_in_pipeline, schema_mode, \
                 schema_fields_json, input_contract_json, output_contract_json, registered_at \
                 FROM nodes WHERE run_id = ?1 \
                 ORDER BY sequence_in_pipeline IS NULL, sequence_in_pipeline, registered_at, node_id",
            )?;
            let rows = stmt.query_map(params![run_id.as_str()], map_node)?;
            let mut nodes = Vec::new();
            for row in rows {
                nodes.push(row??);
            }
            Ok(nodes)
        })
    }

    /// Loads all edges for a run, ordered by creation then id.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] on store failure or corrupt literals.
    pub fn get_edges(&self, run_id: &RunId) -> Result<Vec<Edge>, LandscapeError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT edge_id, run_id, from_node_id, to_node_id, label, default_mode, \
                 created_at FROM edges WHERE run_id = ?1 ORDER BY created_at, edge_id",
            )?;
            let rows = stmt.query_map(params![run_id.as_str()], map_edge)?;
            let mut edges = Vec::new();
            for row in rows {
                edges.push(row??);
            }
            Ok(edges)
        })
    }

    /// Loads a single edge; a missing edge referenced by our own routing
    /// events is audit corruption, so absence is an error.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError::Integrity`] when the edge does not exist.
    pub fn get_edge(&self, edge_id: &EdgeId) -> Result<Edge, LandscapeError> {
        self.db
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT edge_id, run_id, from_node_id, to_node_id, label, default_mode, \
                     created_at FROM edges WHERE edge_id = ?1",
                    params![edge_id.as_str()],
                    map_edge,
                )
                .optional()?
                .transpose()
            })?
            .ok_or_else(|| {
                AuditIntegrityError::new(format!(
                    "edge '{edge_id}' not found; a routing event references a non-existent edge"
                ))
                .into()
            })
    }

    /// Edge lookup map for routing: `(from_node_id, label)` to edge id.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] on store failure.
    pub fn get_edge_map(
        &self,
        run_id: &RunId,
    ) -> Result<std::collections::BTreeMap<(NodeId, String), EdgeId>, LandscapeError> {
        let edges = self.get_edges(run_id)?;
        Ok(edges
            .into_iter()
            .map(|edge| ((edge.from_node_id, edge.label), edge.edge_id))
            .collect())
    }

    /// Updates a node's output contract after first-row inference or
    /// transform-driven evolution.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when encoding or the update fails.
    pub fn update_node_output_contract(
        &self,
        run_id: &RunId,
        node_id: &NodeId,
        contract: &SchemaContract,
    ) -> Result<(), LandscapeError> {
        let encoded = ContractAuditRecord::from_contract(contract).to_json()?;
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE nodes SET output_contract_json = ?1 WHERE run_id = ?2 AND node_id = ?3",
                params![encoded, run_id.as_str(), node_id.as_str()],
            )?;
            Ok(())
        })
    }

    /// Loads a node's stored input and output contracts.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when decoding fails.
    pub fn get_node_contracts(
        &self,
        run_id: &RunId,
        node_id: &NodeId,
    ) -> Result<(Option<SchemaContract>, Option<SchemaContract>), LandscapeError> {
        let raw: Option<(Option<String>, Option<String>)> = self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT input_contract_json, output_contract_json FROM nodes \
                     WHERE run_id = ?1 AND node_id = ?2",
                    params![run_id.as_str(), node_id.as_str()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?)
        })?;
        let Some((input_json, output_json)) = raw else {
            return Ok((None, None));
        };
        let decode = |json: Option<String>| -> Result<Option<SchemaContract>, LandscapeError> {
            json.map(|raw| Ok::<_, LandscapeError>(ContractAuditRecord::from_json(&raw)?.to_contract()?))
                .transpose()
        };
        Ok((decode(input_json)?, decode(output_json)?))
    }

    // ========================================================================
    // SECTION: Rows & Tokens
    // ========================================================================

    /// Creates a row record, hashing and storing the normalized payload.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when hashing or the insert fails.
    pub fn create_row(
        &self,
        run_id: &RunId,
        source_node_id: &NodeId,
        row_index: i64,
        data: &RowData,
    ) -> Result<RowRecord, LandscapeError> {
        let normalized = normalize_row(data)?;
        let hash = self.hash_and_store(&normalized)?;
        let record = RowRecord {
            row_id: RowId::generate(),
            run_id: run_id.clone(),
            source_node_id: source_node_id.clone(),
            row_index,
            source_data_hash: hash,
            created_at: self.now(),
        };
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO rows (row_id, run_id, source_node_id, row_index, source_data_hash, \
                 created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.row_id.as_str(),
                    record.run_id.as_str(),
                    record.source_node_id.as_str(),
                    record.row_index,
                    record.source_data_hash,
                    format_utc(record.created_at),
                ],
            )?;
            Ok(())
        })?;
        Ok(record)
    }

    /// Creates a token for a row. A row may spawn several tokens via FORK.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the insert fails.
    pub fn create_token(&self, row_id: &RowId) -> Result<Token, LandscapeError> {
        let token = Token {
            token_id: TokenId::generate(),
            row_id: row_id.clone(),
            created_at: self.now(),
            step_in_pipeline: None,
        };
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO tokens (token_id, row_id, created_at) VALUES (?1, ?2, ?3)",
                params![token.token_id.as_str(), token.row_id.as_str(), format_utc(token.created_at)],
            )?;
            Ok(())
        })?;
        Ok(token)
    }

    /// Records a token's current step in the pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the update fails.
    pub fn set_token_step(&self, token_id: &TokenId, step: i64) -> Result<(), LandscapeError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE tokens SET step_in_pipeline = ?1 WHERE token_id = ?2",
                params![step, token_id.as_str()],
            )?;
            Ok(())
        })
    }

    /// Loads all rows for a run in source order.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] on store failure.
    pub fn get_rows(&self, run_id: &RunId) -> Result<Vec<RowRecord>, LandscapeError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT row_id, run_id, source_node_id, row_index, source_data_hash, created_at \
                 FROM rows WHERE run_id = ?1 ORDER BY row_index, row_id",
            )?;
            let rows = stmt.query_map(params![run_id.as_str()], map_row_record)?;
            let mut records = Vec::new();
            for row in rows {
                records.push(row??);
            }
            Ok(records)
        })
    }

    /// Loads a single token.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] on store failure.
    pub fn get_token(&self, token_id: &TokenId) -> Result<Option<Token>, LandscapeError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT token_id, row_id, created_at, step_in_pipeline FROM tokens \
                 WHERE token_id = ?1",
                params![token_id.as_str()],
                map_token,
            )
            .optional()?
            .transpose()
        })
    }

    /// Loads all tokens for a run ordered by creation then id.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] on store failure.
    pub fn get_tokens(&self, run_id: &RunId) -> Result<Vec<Token>, LandscapeError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT t.token_id, t.row_id, t.created_at, t.step_in_pipeline \
                 FROM tokens t JOIN rows r ON t.row_id = r.row_id \
                 WHERE r.run_id = ?1 ORDER BY t.created_at, t.token_id",
            )?;
            let rows = stmt.query_map(params![run_id.as_str()], map_token)?;
            let mut tokens = Vec::new();
            for row in rows {
                tokens.push(row??);
            }
            Ok(tokens)
        })
    }

    // ========================================================================
    // SECTION: Node States
    // ========================================================================

    /// Opens a node state for one token entering one node.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when hashing or the insert fails.
    pub fn begin_node_state(
        &self,
        token_id: &TokenId,
        node_id: &NodeId,
        run_id: &RunId,
        step_index: i64,
        attempt: i64,
        input: &JsonValue,
    ) -> Result<NodeState, LandscapeError> {
        let input_hash = self.hash_and_store(input)?;
        let core = NodeStateCore {
            state_id: StateId::generate(),
            token_id: token_id.clone(),
            node_id: node_id.clone(),
            run_id: run_id.clone(),
            step_index,
            attempt,
            input_hash,
            started_at: self.now(),
            context_before_json: None,
        };
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO node_states (state_id, token_id, node_id, run_id, step_index, \
                 attempt, status, input_hash, started_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    core.state_id.as_str(),
                    core.token_id.as_str(),
                    core.node_id.as_str(),
                    core.run_id.as_str(),
                    core.step_index,
                    core.attempt,
                    NodeStateStatus::Open.as_str(),
                    core.input_hash,
                    format_utc(core.started_at),
                ],
            )?;
            Ok(())
        })?;
        Ok(NodeState::Open {
            core,
        })
    }

    /// Completes an open state as COMPLETED with its output hash.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError::Integrity`] when the state is not open.
    pub fn complete_state_success(
        &self,
        state_id: &StateId,
        output: &JsonValue,
        duration_ms: f64,
        success_reason: Option<&JsonMap<String, JsonValue>>,
    ) -> Result<(), LandscapeError> {
        let output_hash = self.hash_and_store(output)?;
        let reason_json = success_reason
            .map(|reason| canonical_json_raw(&JsonValue::Object(reason.clone())))
            .transpose()?;
        let now = format_utc(self.now());
        self.close_state(
            state_id,
            NodeStateStatus::Completed,
            Some(output_hash),
            duration_ms,
            &now,
            None,
            reason_json,
        )
    }

    /// Completes an open state as PENDING (durability deferred to a batch).
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError::Integrity`] when the state is not open.
    pub fn complete_state_pending(
        &self,
        state_id: &StateId,
        duration_ms: f64,
    ) -> Result<(), LandscapeError> {
        let now = format_utc(self.now());
        self.close_state(state_id, NodeStateStatus::Pending, None, duration_ms, &now, None, None)
    }

    /// Completes an open state as FAILED with a structured error.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError::Integrity`] when the state is not open.
    pub fn complete_state_failed(
        &self,
        state_id: &StateId,
        error: &ExecutionError,
        duration_ms: f64,
        partial_output: Option<&JsonValue>,
    ) -> Result<(), LandscapeError> {
        let output_hash =
            partial_output.map(|output| self.hash_and_store(output)).transpose()?;
        let now = format_utc(self.now());
        self.close_state(
            state_id,
            NodeStateStatus::Failed,
            output_hash,
            duration_ms,
            &now,
            Some(error.to_json()),
            None,
        )
    }

    /// Shared state-closing update; refuses to close a non-open state.
    #[allow(clippy::too_many_arguments, reason = "Internal helper mirroring the column set.")]
    fn close_state(
        &self,
        state_id: &StateId,
        status: NodeStateStatus,
        output_hash: Option<String>,
        duration_ms: f64,
        completed_at: &str,
        error_json: Option<String>,
        success_reason_json: Option<String>,
    ) -> Result<(), LandscapeError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE node_states SET status = ?1, output_hash = ?2, duration_ms = ?3, \
                 completed_at = ?4, error_json = ?5, success_reason_json = ?6 \
                 WHERE state_id = ?7 AND status = 'OPEN'",
                params![
                    status.as_str(),
                    output_hash,
                    duration_ms,
                    completed_at,
                    error_json,
                    success_reason_json,
                    state_id.as_str(),
                ],
            )?;
            if changed == 0 {
                return Err(AuditIntegrityError::new(format!(
                    "state '{state_id}' is not open; cannot transition to {}",
                    status.as_str()
                ))
                .into());
            }
            Ok(())
        })
    }

    /// Loads one node state, enforcing the required-by-status field table.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError::Integrity`] for missing states and for rows
    /// violating the status table.
    pub fn get_node_state(&self, state_id: &StateId) -> Result<NodeState, LandscapeError> {
        self.db
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT state_id, token_id, node_id, run_id, step_index, attempt, status, \
                     input_hash, started_at, context_before_json, output_hash, duration_ms, \
                     completed_at, context_after_json, error_json, success_reason_json \
                     FROM node_states WHERE state_id = ?1",
                    params![state_id.as_str()],
                    map_node_state,
                )
                .optional()?
                .transpose()
            })?
            .ok_or_else(|| {
                AuditIntegrityError::new(format!("node state '{state_id}' not found")).into()
            })
    }

    /// Loads every state of a token in step order.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] on store failure or corrupt rows.
    pub fn get_node_states_for_token(
        &self,
        token_id: &TokenId,
    ) -> Result<Vec<NodeState>, LandscapeError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT state_id, token_id, node_id, run_id, step_index, attempt, status, \
                 input_hash, started_at, context_before_json, output_hash, duration_ms, \
                 completed_at, context_after_json, error_json, success_reason_json \
                 FROM node_states WHERE token_id = ?1 ORDER BY step_index, started_at, state_id",
            )?;
            let rows = stmt.query_map(params![token_id.as_str()], map_node_state)?;
            let mut states = Vec::new();
            for row in rows {
                states.push(row??);
            }
            Ok(states)
        })
    }

    /// Loads every state recorded at a node within a run.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] on store failure or corrupt rows.
    pub fn get_node_states_for_node(
        &self,
        run_id: &RunId,
        node_id: &NodeId,
    ) -> Result<Vec<NodeState>, LandscapeError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT state_id, token_id, node_id, run_id, step_index, attempt, status, \
                 input_hash, started_at, context_before_json, output_hash, duration_ms, \
                 completed_at, context_after_json, error_json, success_reason_json \
                 FROM node_states WHERE run_id = ?1 AND node_id = ?2 \
                 ORDER BY started_at, state_id",
            )?;
            let rows = stmt.query_map(params![run_id.as_str(), node_id.as_str()], map_node_state)?;
            let mut states = Vec::new();
            for row in rows {
                states.push(row??);
            }
            Ok(states)
        })
    }

    // ========================================================================
    // SECTION: Calls
    // ========================================================================

    /// Allocates the next monotonic call index for a state or operation id.
    ///
    /// The recorder is the only allocator; callers may not supply indices.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the counter update fails.
    pub fn allocate_call_index(&self, owner_id: &str) -> Result<i64, LandscapeError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO state_call_counters (state_id, next_index) VALUES (?1, 1) \
                 ON CONFLICT(state_id) DO UPDATE SET next_index = next_index + 1",
                params![owner_id],
            )?;
            let next: i64 = conn.query_row(
                "SELECT next_index FROM state_call_counters WHERE state_id = ?1",
                params![owner_id],
                |row| row.get(0),
            )?;
            Ok(next - 1)
        })
    }

    /// Records an external call attributed to a node state.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when hashing, payload storage, or the
    /// insert fails.
    #[allow(clippy::too_many_arguments, reason = "Mirrors the audited call row column set.")]
    pub fn record_call(
        &self,
        state_id: &StateId,
        call_index: i64,
        call_type: CallType,
        status: CallStatus,
        request: &JsonValue,
        response: Option<&JsonValue>,
        error: Option<&JsonValue>,
        latency_ms: f64,
    ) -> Result<CallRecord, LandscapeError> {
        self.insert_call(
            Some(state_id.clone()),
            None,
            call_index,
            call_type,
            status,
            request,
            response,
            error,
            latency_ms,
        )
    }

    /// Records an external call attributed to an operation.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when hashing, payload storage, or the
    /// insert fails.
    #[allow(clippy::too_many_arguments, reason = "Mirrors the audited call row column set.")]
    pub fn record_operation_call(
        &self,
        operation_id: &OperationId,
        call_index: i64,
        call_type: CallType,
        status: CallStatus,
        request: &JsonValue,
        response: Option<&JsonValue>,
        error: Option<&JsonValue>,
        latency_ms: f64,
    ) -> Result<CallRecord, LandscapeError> {
        self.insert_call(
            None,
            Some(operation_id.clone()),
            call_index,
            call_type,
            status,
            request,
            response,
            error,
            latency_ms,
        )
    }

    /// Shared call insert.
    #[allow(clippy::too_many_arguments, reason = "Internal helper mirroring the column set.")]
    fn insert_call(
        &self,
        state_id: Option<StateId>,
        operation_id: Option<OperationId>,
        call_index: i64,
        call_type: CallType,
        status: CallStatus,
        request: &JsonValue,
        response: Option<&JsonValue>,
        error: Option<&JsonValue>,
        latency_ms: f64,
    ) -> Result<CallRecord, LandscapeError> {
        let request_hash = self.hash_and_store(request)?;
        let response_hash =
            response.map(|payload| self.hash_and_store(payload)).transpose()?;
        let error_json = error.map(canonical_json_raw).transpose()?;
        let record = CallRecord {
            call_id: CallId::generate(),
            state_id,
            operation_id,
            call_index,
            call_type,
            status,
            request_hash,
            response_hash,
            latency_ms,
            created_at: self.now(),
            error_json,
        };
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO calls (call_id, state_id, operation_id, call_index, call_type, \
                 status, request_hash, response_hash, latency_ms, created_at, error_json) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    record.call_id.as_str(),
                    record.state_id.as_ref().map(StateId::as_str),
                    record.operation_id.as_ref().map(OperationId::as_str),
                    record.call_index,
                    record.call_type.as_str(),
                    record.status.as_str(),
                    record.request_hash,
                    record.response_hash,
                    record.latency_ms,
                    format_utc(record.created_at),
                    record.error_json,
                ],
            )?;
            Ok(())
        })?;
        Ok(record)
    }

    /// Loads every call attributed to a state in index order.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] on store failure or corrupt rows.
    pub fn get_calls_for_state(
        &self,
        state_id: &StateId,
    ) -> Result<Vec<CallRecord>, LandscapeError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT call_id, state_id, operation_id, call_index, call_type, status, \
                 request_hash, response_hash, latency_ms, created_at, error_json \
                 FROM calls WHERE state_id = ?1 ORDER BY call_index",
            )?;
            let rows = stmt.query_map(params![state_id.as_str()], map_call)?;
            let mut calls = Vec::new();
            for row in rows {
                calls.push(row??);
            }
            Ok(calls)
        })
    }

    /// Finds a prior call by run, type, and request hash, for replay.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] on store failure or corrupt rows.
    pub fn find_call_by_request_hash(
        &self,
        run_id: &RunId,
        call_type: CallType,
        request_hash: &str,
    ) -> Result<Option<CallRecord>, LandscapeError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT c.call_id, c.state_id, c.operation_id, c.call_index, c.call_type, \
                 c.status, c.request_hash, c.response_hash, c.latency_ms, c.created_at, \
                 c.error_json FROM calls c \
                 LEFT JOIN node_states s ON c.state_id = s.state_id \
                 LEFT JOIN operations o ON c.operation_id = o.operation_id \
                 WHERE (s.run_id = ?1 OR o.run_id = ?1) AND c.call_type = ?2 \
                 AND c.request_hash = ?3 ORDER BY c.created_at, c.call_id LIMIT 1",
                params![run_id.as_str(), call_type.as_str(), request_hash],
                map_call,
            )
            .optional()?
            .transpose()
        })
    }

    /// Fetches a call's recorded response payload from the payload store.
    ///
    /// `None` means the payload has been purged under retention.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the payload cannot be read or parsed.
    pub fn get_call_response_data(
        &self,
        call: &CallRecord,
    ) -> Result<Option<JsonValue>, LandscapeError> {
        let Some(hash) = call.response_hash.as_deref() else {
            return Ok(None);
        };
        let Some(bytes) = self.payloads.get(hash)? else {
            return Ok(None);
        };
        let parsed: JsonValue = serde_json::from_slice(&bytes).map_err(|err| {
            AuditIntegrityError::new(format!("stored payload '{hash}' is not valid json: {err}"))
        })?;
        Ok(Some(parsed))
    }

    // ========================================================================
    // SECTION: Operations
    // ========================================================================

    /// Opens an operation record for a node-level action such as a sink
    /// write.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when hashing or the insert fails.
    pub fn begin_operation(
        &self,
        run_id: &RunId,
        node_id: &NodeId,
        operation_type: &str,
        input: &JsonValue,
    ) -> Result<OperationRecord, LandscapeError> {
        let record = OperationRecord {
            operation_id: OperationId::generate(),
            run_id: run_id.clone(),
            node_id: node_id.clone(),
            operation_type: operation_type.to_string(),
            input_hash: self.hash_and_store(input)?,
            output_hash: None,
            started_at: self.now(),
            completed_at: None,
        };
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO operations (operation_id, run_id, node_id, operation_type, \
                 input_hash, started_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.operation_id.as_str(),
                    record.run_id.as_str(),
                    record.node_id.as_str(),
                    record.operation_type,
                    record.input_hash,
                    format_utc(record.started_at),
                ],
            )?;
            Ok(())
        })?;
        Ok(record)
    }

    /// Completes an operation with its output summary.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when hashing or the update fails.
    pub fn complete_operation(
        &self,
        operation_id: &OperationId,
        output: Option<&JsonValue>,
    ) -> Result<(), LandscapeError> {
        let output_hash = output.map(|payload| self.hash_and_store(payload)).transpose()?;
        let now = format_utc(self.now());
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE operations SET output_hash = ?1, completed_at = ?2 WHERE operation_id = ?3",
                params![output_hash, now, operation_id.as_str()],
            )?;
            Ok(())
        })
    }

    // ========================================================================
    // SECTION: Routing Events
    // ========================================================================

    /// Records an edge traversal, hashing and side-storing the reason.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when hashing or the insert fails.
    pub fn record_routing_event(
        &self,
        state_id: &StateId,
        edge_id: &EdgeId,
        mode: RoutingMode,
        reason: Option<&JsonMap<String, JsonValue>>,
    ) -> Result<RoutingEvent, LandscapeError> {
        let reason_payload = reason.map(|map| JsonValue::Object(map.clone()));
        let reason_hash =
            reason_payload.as_ref().map(stable_hash_raw).transpose()?;
        let reason_json =
            reason_payload.as_ref().map(canonical_json_raw).transpose()?;
        let event = RoutingEvent {
            state_id: state_id.clone(),
            edge_id: edge_id.clone(),
            mode,
            reason_hash,
            created_at: self.now(),
        };
        self.db.with_conn(|conn| {
            if let (Some(hash), Some(json)) = (&event.reason_hash, &reason_json) {
                conn.execute(
                    "INSERT OR IGNORE INTO routing_reasons (reason_hash, reason_json) \
                     VALUES (?1, ?2)",
                    params![hash, json],
                )?;
            }
            conn.execute(
                "INSERT INTO routing_events (state_id, edge_id, mode, reason_hash, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    event.state_id.as_str(),
                    event.edge_id.as_str(),
                    event.mode.as_str(),
                    event.reason_hash,
                    format_utc(event.created_at),
                ],
            )?;
            Ok(())
        })?;
        Ok(event)
    }

    /// Loads every routing event recorded for a run in event order.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] on store failure or corrupt rows.
    pub fn get_routing_events(&self, run_id: &RunId) -> Result<Vec<RoutingEvent>, LandscapeError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT e.state_id, e.edge_id, e.mode, e.reason_hash, e.created_at \
                 FROM routing_events e JOIN node_states s ON e.state_id = s.state_id \
                 WHERE s.run_id = ?1 ORDER BY e.created_at, e.edge_id",
            )?;
            let rows = stmt.query_map(params![run_id.as_str()], map_routing_event)?;
            let mut events = Vec::new();
            for row in rows {
                events.push(row??);
            }
            Ok(events)
        })
    }

    /// Classifies a token's divert for lineage queries.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] on store failure.
    pub fn divert_summary(&self, token_id: &TokenId) -> Result<DivertSummary, LandscapeError> {
        let label: Option<String> = self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT ed.label FROM routing_events e \
                     JOIN node_states s ON e.state_id = s.state_id \
                     JOIN edges ed ON e.edge_id = ed.edge_id \
                     WHERE s.token_id = ?1 AND e.mode = 'DIVERT' \
                     ORDER BY e.created_at LIMIT 1",
                    params![token_id.as_str()],
                    |row| row.get(0),
                )
                .optional()?)
        })?;
        Ok(label.map_or_else(
            || DivertSummary {
                divert_type: "none".to_string(),
                edge_label: None,
            },
            |label| {
                let divert_type = if label.starts_with("__error") {
                    "error"
                } else if label == "__quarantine__" {
                    "quarantine"
                } else {
                    "route"
                };
                DivertSummary {
                    divert_type: divert_type.to_string(),
                    edge_label: Some(label),
                }
            },
        ))
    }

    // ========================================================================
    // SECTION: Artifacts & Outcomes
    // ========================================================================

    /// Registers an artifact; called only after a durable flush.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the insert fails.
    #[allow(clippy::too_many_arguments, reason = "Mirrors the artifact row column set.")]
    pub fn register_artifact(
        &self,
        run_id: &RunId,
        state_id: &StateId,
        sink_node_id: &NodeId,
        artifact_type: &str,
        path_or_uri: &str,
        content_hash: &str,
        size_bytes: i64,
        idempotency_key: Option<&str>,
    ) -> Result<Artifact, LandscapeError> {
        let artifact = Artifact {
            artifact_id: ArtifactId::generate(),
            run_id: run_id.clone(),
            produced_by_state_id: state_id.clone(),
            sink_node_id: sink_node_id.clone(),
            artifact_type: artifact_type.to_string(),
            path_or_uri: path_or_uri.to_string(),
            content_hash: content_hash.to_string(),
            size_bytes,
            idempotency_key: idempotency_key.map(ToString::to_string),
            created_at: self.now(),
        };
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO artifacts (artifact_id, run_id, produced_by_state_id, sink_node_id, \
                 artifact_type, path_or_uri, content_hash, size_bytes, idempotency_key, \
                 created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    artifact.artifact_id.as_str(),
                    artifact.run_id.as_str(),
                    artifact.produced_by_state_id.as_str(),
                    artifact.sink_node_id.as_str(),
                    artifact.artifact_type,
                    artifact.path_or_uri,
                    artifact.content_hash,
                    artifact.size_bytes,
                    artifact.idempotency_key,
                    format_utc(artifact.created_at),
                ],
            )?;
            Ok(())
        })?;
        Ok(artifact)
    }

    /// Loads artifacts for a run, optionally filtered by sink.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] on store failure.
    pub fn get_artifacts(
        &self,
        run_id: &RunId,
        sink_node_id: Option<&NodeId>,
    ) -> Result<Vec<Artifact>, LandscapeError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT artifact_id, run_id, produced_by_state_id, sink_node_id, artifact_type, \
                 path_or_uri, content_hash, size_bytes, idempotency_key, created_at \
                 FROM artifacts WHERE run_id = ?1 \
                 AND (?2 IS NULL OR sink_node_id = ?2) ORDER BY created_at, artifact_id",
            )?;
            let rows = stmt.query_map(
                params![run_id.as_str(), sink_node_id.map(NodeId::as_str)],
                map_artifact,
            )?;
            let mut artifacts = Vec::new();
            for row in rows {
                artifacts.push(row??);
            }
            Ok(artifacts)
        })
    }

    /// Records a token's terminal outcome, exactly once per token.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError::Integrity`] when an outcome already exists.
    pub fn record_token_outcome(
        &self,
        run_id: &RunId,
        token_id: &TokenId,
        outcome: TokenOutcomeKind,
        sink_name: Option<&str>,
        error_hash: Option<&str>,
    ) -> Result<TokenOutcome, LandscapeError> {
        let record = TokenOutcome {
            token_id: token_id.clone(),
            run_id: run_id.clone(),
            outcome,
            sink_name: sink_name.map(ToString::to_string),
            error_hash: error_hash.map(ToString::to_string),
            created_at: self.now(),
        };
        self.db.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT INTO token_outcomes (token_id, run_id, outcome, sink_name, error_hash, \
                 created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.token_id.as_str(),
                    record.run_id.as_str(),
                    record.outcome.as_str(),
                    record.sink_name,
                    record.error_hash,
                    format_utc(record.created_at),
                ],
            );
            match inserted {
                Ok(_) => Ok(()),
                Err(err) if is_constraint_violation(&err) => Err(AuditIntegrityError::new(
                    format!("token '{token_id}' already has a terminal outcome"),
                )
                .into()),
                Err(err) => Err(err.into()),
            }
        })?;
        Ok(record)
    }

    /// Loads the terminal outcome of one token, when recorded.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] on store failure or corrupt rows.
    pub fn get_token_outcome(
        &self,
        token_id: &TokenId,
    ) -> Result<Option<TokenOutcome>, LandscapeError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT token_id, run_id, outcome, sink_name, error_hash, created_at \
                 FROM token_outcomes WHERE token_id = ?1",
                params![token_id.as_str()],
                map_outcome,
            )
            .optional()?
            .transpose()
        })
    }

    /// Loads all outcomes for a run in record order.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] on store failure or corrupt rows.
    pub fn get_token_outcomes(&self, run_id: &RunId) -> Result<Vec<TokenOutcome>, LandscapeError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT token_id, run_id, outcome, sink_name, error_hash, created_at \
                 FROM token_outcomes WHERE run_id = ?1 ORDER BY created_at, token_id",
            )?;
            let rows = stmt.query_map(params![run_id.as_str()], map_outcome)?;
            let mut outcomes = Vec::new();
            for row in rows {
                outcomes.push(row??);
            }
            Ok(outcomes)
        })
    }

    // ========================================================================
    // SECTION: Batches
    // ========================================================================

    /// Creates a draft batch for an aggregation node.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the insert fails.
    pub fn create_batch(
        &self,
        run_id: &RunId,
        aggregation_node_id: &NodeId,
        attempt: i64,
    ) -> Result<Batch, LandscapeError> {
        let batch = Batch {
            batch_id: BatchId::generate(),
            run_id: run_id.clone(),
            aggregation_node_id: aggregation_node_id.clone(),
            attempt,
            status: BatchStatus::Draft,
            trigger_type: None,
            trigger_reason: None,
            aggregation_state_id: None,
            created_at: self.now(),
            completed_at: None,
        };
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO batches (batch_id, run_id, aggregation_node_id, attempt, status, \
                 created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    batch.batch_id.as_str(),
                    batch.run_id.as_str(),
                    batch.aggregation_node_id.as_str(),
                    batch.attempt,
                    batch.status.as_str(),
                    format_utc(batch.created_at),
                ],
            )?;
            Ok(())
        })?;
        Ok(batch)
    }

    /// Adds a token to a batch at an ordinal position.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the insert fails.
    pub fn add_batch_member(
        &self,
        batch_id: &BatchId,
        token_id: &TokenId,
        ordinal: i64,
    ) -> Result<BatchMember, LandscapeError> {
        let member = BatchMember {
            batch_id: batch_id.clone(),
            token_id: token_id.clone(),
            ordinal,
        };
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO batch_members (batch_id, token_id, ordinal) VALUES (?1, ?2, ?3)",
                params![member.batch_id.as_str(), member.token_id.as_str(), member.ordinal],
            )?;
            Ok(())
        })?;
        Ok(member)
    }

    /// Transitions a batch, recording trigger metadata and completion time
    /// for terminal statuses.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError::Integrity`] when the batch does not exist.
    pub fn complete_batch(
        &self,
        batch_id: &BatchId,
        status: BatchStatus,
        trigger_type: Option<TriggerType>,
        trigger_reason: Option<&str>,
        state_id: Option<&StateId>,
    ) -> Result<Batch, LandscapeError> {
        let completed_at = match status {
            BatchStatus::Completed | BatchStatus::Failed => Some(format_utc(self.now())),
            BatchStatus::Draft | BatchStatus::Executing => None,
        };
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE batches SET status = ?1, trigger_type = ?2, trigger_reason = ?3, \
                 aggregation_state_id = ?4, completed_at = COALESCE(?5, completed_at) \
                 WHERE batch_id = ?6",
                params![
                    status.as_str(),
                    trigger_type.map(TriggerType::as_str),
                    trigger_reason,
                    state_id.map(StateId::as_str),
                    completed_at,
                    batch_id.as_str(),
                ],
            )?;
            if changed == 0 {
                return Err(
                    AuditIntegrityError::new(format!("batch '{batch_id}' not found")).into()
                );
            }
            Ok(())
        })?;
        self.get_batch(batch_id)?.ok_or_else(|| {
            AuditIntegrityError::new(format!("batch '{batch_id}' vanished after update")).into()
        })
    }

    /// Loads one batch.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] on store failure or corrupt rows.
    pub fn get_batch(&self, batch_id: &BatchId) -> Result<Option<Batch>, LandscapeError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT batch_id, run_id, aggregation_node_id, attempt, status, trigger_type, \
                 trigger_reason, aggregation_state_id, created_at, completed_at \
                 FROM batches WHERE batch_id = ?1",
                params![batch_id.as_str()],
                map_batch,
            )
            .optional()?
            .transpose()
        })
    }

    /// Loads a batch's members in ordinal order.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] on store failure.
    pub fn get_batch_members(
        &self,
        batch_id: &BatchId,
    ) -> Result<Vec<BatchMember>, LandscapeError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT batch_id, token_id, ordinal FROM batch_members WHERE batch_id = ?1 \
                 ORDER BY ordinal",
            )?;
            let rows = stmt.query_map(params![batch_id.as_str()], |row| {
                Ok(BatchMember {
                    batch_id: BatchId::new(row.get::<_, String>(0)?),
                    token_id: TokenId::new(row.get::<_, String>(1)?),
                    ordinal: row.get(2)?,
                })
            })?;
            let mut members = Vec::new();
            for row in rows {
                members.push(row?);
            }
            Ok(members)
        })
    }

    /// Loads batches needing recovery (draft, executing, failed), oldest
    /// first for deterministic recovery.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] on store failure or corrupt rows.
    pub fn get_incomplete_batches(&self, run_id: &RunId) -> Result<Vec<Batch>, LandscapeError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT batch_id, run_id, aggregation_node_id, attempt, status, trigger_type, \
                 trigger_reason, aggregation_state_id, created_at, completed_at \
                 FROM batches WHERE run_id = ?1 AND status IN ('DRAFT', 'EXECUTING', 'FAILED') \
                 ORDER BY created_at, batch_id",
            )?;
            let rows = stmt.query_map(params![run_id.as_str()], map_batch)?;
            let mut batches = Vec::new();
            for row in rows {
                batches.push(row??);
            }
            Ok(batches)
        })
    }

    /// Creates a fresh batch attempt from a failed batch, copying members.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError::Integrity`] when the batch is missing or not
    /// failed.
    pub fn retry_batch(&self, batch_id: &BatchId) -> Result<Batch, LandscapeError> {
        let original = self.get_batch(batch_id)?.ok_or_else(|| {
            LandscapeError::from(AuditIntegrityError::new(format!(
                "batch '{batch_id}' not found for retry"
            )))
        })?;
        if original.status != BatchStatus::Failed {
            return Err(AuditIntegrityError::new(format!(
                "batch '{batch_id}' is {}, only failed batches can be retried",
                original.status.as_str()
            ))
            .into());
        }
        let fresh =
            self.create_batch(&original.run_id, &original.aggregation_node_id, original.attempt + 1)?;
        for member in self.get_batch_members(batch_id)? {
            self.add_batch_member(&fresh.batch_id, &member.token_id, member.ordinal)?;
        }
        Ok(fresh)
    }

    // ========================================================================
    // SECTION: Error Events
    // ========================================================================

    /// Records the validation failure that quarantined a row.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when hashing or the insert fails.
    pub fn record_validation_error(
        &self,
        run_id: &RunId,
        token_id: &TokenId,
        node_id: &NodeId,
        violations: &[ContractViolation],
    ) -> Result<ValidationErrorRecord, LandscapeError> {
        let payload = serde_json::json!({
            "run_id": run_id.as_str(),
            "token_id": token_id.as_str(),
            "node_id": node_id.as_str(),
            "violations": violations,
        });
        let error_hash = stable_hash_raw(&payload)?;
        let violations_json = canonical_json_raw(&serde_json::json!(violations))?;
        let record = ValidationErrorRecord {
            error_id: ErrorId::new(error_hash.clone()),
            run_id: run_id.clone(),
            token_id: token_id.clone(),
            node_id: node_id.clone(),
            violations_json,
            error_hash,
            created_at: self.now(),
        };
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO validation_errors (error_id, run_id, token_id, node_id, \
                 violations_json, error_hash, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    record.error_id.as_str(),
                    record.run_id.as_str(),
                    record.token_id.as_str(),
                    record.node_id.as_str(),
                    record.violations_json,
                    record.error_hash,
                    format_utc(record.created_at),
                ],
            )?;
            Ok(())
        })?;
        Ok(record)
    }

    /// Records a transform-level failure event.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when hashing or the insert fails.
    pub fn record_transform_error(
        &self,
        run_id: &RunId,
        token_id: &TokenId,
        node_id: &NodeId,
        state_id: Option<&StateId>,
        error: &ExecutionError,
    ) -> Result<TransformErrorRecord, LandscapeError> {
        let payload = serde_json::json!({
            "run_id": run_id.as_str(),
            "token_id": token_id.as_str(),
            "node_id": node_id.as_str(),
            "error": error,
        });
        let error_hash = stable_hash_raw(&payload)?;
        let record = TransformErrorRecord {
            error_id: ErrorId::new(error_hash.clone()),
            run_id: run_id.clone(),
            token_id: token_id.clone(),
            node_id: node_id.clone(),
            state_id: state_id.cloned(),
            error_json: error.to_json(),
            error_hash,
            created_at: self.now(),
        };
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO transform_errors (error_id, run_id, token_id, node_id, \
                 state_id, error_json, error_hash, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    record.error_id.as_str(),
                    record.run_id.as_str(),
                    record.token_id.as_str(),
                    record.node_id.as_str(),
                    record.state_id.as_ref().map(StateId::as_str),
                    record.error_json,
                    record.error_hash,
                    format_utc(record.created_at),
                ],
            )?;
            Ok(())
        })?;
        Ok(record)
    }

    /// Loads validation error events for a run in record order.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] on store failure.
    pub fn get_validation_errors(
        &self,
        run_id: &RunId,
    ) -> Result<Vec<ValidationErrorRecord>, LandscapeError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT error_id, run_id, token_id, node_id, violations_json, error_hash, \
                 created_at FROM validation_errors WHERE run_id = ?1 ORDER BY created_at, error_id",
            )?;
            let rows = stmt.query_map(params![run_id.as_str()], map_validation_error)?;
            let mut records = Vec::new();
            for row in rows {
                records.push(row??);
            }
            Ok(records)
        })
    }

    /// Loads transform error events for a run in record order.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] on store failure.
    pub fn get_transform_errors(
        &self,
        run_id: &RunId,
    ) -> Result<Vec<TransformErrorRecord>, LandscapeError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT error_id, run_id, token_id, node_id, state_id, error_json, error_hash, \
                 created_at FROM transform_errors WHERE run_id = ?1 ORDER BY created_at, error_id",
            )?;
            let rows = stmt.query_map(params![run_id.as_str()], map_transform_error)?;
            let mut records = Vec::new();
            for row in rows {
                records.push(row??);
            }
            Ok(records)
        })
    }
}

// ============================================================================
// SECTION: Row Mappers
// ============================================================================

/// True when a SQLite error is a uniqueness/constraint violation.
fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    err.sqlite_error_code() == Some(ErrorCode::ConstraintViolation)
}

/// Parses a stored timestamp column.
fn parse_ts(raw: &str) -> Result<OffsetDateTime, LandscapeError> {
    parse_utc(raw).map_err(|_| LandscapeError::Timestamp(raw.to_string()))
}

/// Maps a runs row. Inner result carries literal/timestamp validation.
fn map_run(row: &SqlRow<'_>) -> rusqlite::Result<Result<Run, LandscapeError>> {
    let run_id: String = row.get(0)?;
    let started_at: String = row.get(1)?;
    let completed_at: Option<String> = row.get(2)?;
    let config_hash: String = row.get(3)?;
    let settings_json: String = row.get(4)?;
    let canonical_version: String = row.get(5)?;
    let status: String = row.get(6)?;
    let schema_contract_json: Option<String> = row.get(7)?;
    let export_status: Option<String> = row.get(8)?;
    let export_error: Option<String> = row.get(9)?;
    Ok((|| {
        Ok(Run {
            run_id: RunId::new(run_id),
            started_at: parse_ts(&started_at)?,
            completed_at: completed_at.as_deref().map(parse_ts).transpose()?,
            config_hash,
            settings_json,
            canonical_version,
            status: RunStatus::parse(&status)?,
            schema_contract_json,
            export_status: export_status.as_deref().map(ExportStatus::parse).transpose()?,
            export_error,
        })
    })())
}

/// Maps a nodes row.
fn map_node(row: &SqlRow<'_>) -> rusqlite::Result<Result<Node, LandscapeError>> {
    let node_id: String = row.get(0)?;
    let run_id: String = row.get(1)?;
    let plugin_name: String = row.get(2)?;
    let node_type: String = row.get(3)?;
    let plugin_version: String = row.get(4)?;
    let determinism: String = row.get(5)?;
    let config_hash: String = row.get(6)?;
    let config_json: String = row.get(7)?;
    let schema_hash: Option<String> = row.get(8)?;
    let sequence_in_pipeline: Option<i64> = row.get(9)?;
    let schema_mode: String = row.get(10)?;
    let schema_fields_json: Option<String> = row.get(11)?;
    let input_contract_json: Option<String> = row.get(12)?;
    let output_contract_json: Option<String> = row.get(13)?;
    let registered_at: String = row.get(14)?;
    Ok((|| {
        Ok(Node {
            node_id: NodeId::new(node_id),
            run_id: RunId::new(run_id),
            plugin_name,
            node_type: NodeType::parse(&node_type)?,
            plugin_version,
            determinism: Determinism::parse(&determinism)?,
            config_hash,
            config_json,
            schema_hash,
            sequence_in_pipeline,
            schema_mode,
            schema_fields_json,
            input_contract_json,
            output_contract_json,
            registered_at: parse_ts(&registered_at)?,
        })
    })())
}

/// Maps an edges row.
fn map_edge(row: &SqlRow<'_>) -> rusqlite::Result<Result<Edge, LandscapeError>> {
    let edge_id: String = row.get(0)?;
    let run_id: String = row.get(1)?;
    let from_node_id: String = row.get(2)?;
    let to_node_id: String = row.get(3)?;
    let label: String = row.get(4)?;
    let default_mode: String = row.get(5)?;
    let created_at: String = row.get(6)?;
    Ok((|| {
        Ok(Edge {
            edge_id: EdgeId::new(edge_id),
            run_id: RunId::new(run_id),
            from_node_id: NodeId::new(from_node_id),
            to_node_id: NodeId::new(to_node_id),
            label,
            default_mode: RoutingMode::parse(&default_mode)?,
            created_at: parse_ts(&created_at)?,
        })
    })())
}

/// Maps a rows row.
fn map_row_record(row: &SqlRow<'_>) -> rusqlite::Result<Result<RowRecord, LandscapeError>> {
    let row_id: String = row.get(0)?;
    let run_id: String = row.get(1)?;
    let source_node_id: String = row.get(2)?;
    let row_index: i64 = row.get(3)?;
    let source_data_hash: String = row.get(4)?;
    let created_at: String = row.get(5)?;
    Ok((|| {
        Ok(RowRecord {
            row_id: RowId::new(row_id),
            run_id: RunId::new(run_id),
            source_node_id: NodeId::new(source_node_id),
            row_index,
            source_data_hash,
            created_at: parse_ts(&created_at)?,
        })
    })())
}

/// Maps a tokens row.
fn map_token(row: &SqlRow<'_>) -> rusqlite::Result<Result<Token, LandscapeError>> {
    let token_id: String = row.get(0)?;
    let row_id: String = row.get(1)?;
    let created_at: String = row.get(2)?;
    let step_in_pipeline: Option<i64> = row.get(3)?;
    Ok((|| {
        Ok(Token {
            token_id: TokenId::new(token_id),
            row_id: RowId::new(row_id),
            created_at: parse_ts(&created_at)?,
            step_in_pipeline,
        })
    })())
}

/// Maps a node_states row, enforcing the required-by-status table.
fn map_node_state(row: &SqlRow<'_>) -> rusqlite::Result<Result<NodeState, LandscapeError>> {
    let state_id: String = row.get(0)?;
    let token_id: String = row.get(1)?;
    let node_id: String = row.get(2)?;
    let run_id: String = row.get(3)?;
    let step_index: i64 = row.get(4)?;
    let attempt: i64 = row.get(5)?;
    let status: String = row.get(6)?;
    let input_hash: String = row.get(7)?;
    let started_at: String = row.get(8)?;
    let context_before_json: Option<String> = row.get(9)?;
    let output_hash: Option<String> = row.get(10)?;
    let duration_ms: Option<f64> = row.get(11)?;
    let completed_at: Option<String> = row.get(12)?;
    let context_after_json: Option<String> = row.get(13)?;
    let error_json: Option<String> = row.get(14)?;
    let success_reason_json: Option<String> = row.get(15)?;
    Ok((|| {
        let parsed_status = NodeStateStatus::parse(&status)?;
        let core = NodeStateCore {
            state_id: StateId::new(state_id.clone()),
            token_id: TokenId::new(token_id),
            node_id: NodeId::new(node_id),
            run_id: RunId::new(run_id),
            step_index,
            attempt,
            input_hash,
            started_at: parse_ts(&started_at)?,
            context_before_json,
        };
        let require = |field: &str,
                       present: bool|
         -> Result<(), LandscapeError> {
            if present {
                Ok(())
            } else {
                Err(AuditIntegrityError::new(format!(
                    "node state '{state_id}' is {status} but missing {field}"
                ))
                .into())
            }
        };
        match parsed_status {
            NodeStateStatus::Open => Ok(NodeState::Open {
                core,
            }),
            NodeStateStatus::Pending => {
                require("duration_ms", duration_ms.is_some())?;
                require("completed_at", completed_at.is_some())?;
                Ok(NodeState::Pending {
                    core,
                    duration_ms: duration_ms.unwrap_or_default(),
                    completed_at: parse_ts(&completed_at.unwrap_or_default())?,
                })
            }
            NodeStateStatus::Completed => {
                require("output_hash", output_hash.is_some())?;
                require("duration_ms", duration_ms.is_some())?;
                require("completed_at", completed_at.is_some())?;
                Ok(NodeState::Completed {
                    core,
                    output_hash: output_hash.unwrap_or_default(),
                    duration_ms: duration_ms.unwrap_or_default(),
                    completed_at: parse_ts(&completed_at.unwrap_or_default())?,
                    context_after_json,
                    success_reason_json,
                })
            }
            NodeStateStatus::Failed => {
                require("duration_ms", duration_ms.is_some())?;
                require("completed_at", completed_at.is_some())?;
                require("error_json", error_json.is_some())?;
                Ok(NodeState::Failed {
                    core,
                    output_hash,
                    duration_ms: duration_ms.unwrap_or_default(),
                    completed_at: parse_ts(&completed_at.unwrap_or_default())?,
                    error_json: error_json.unwrap_or_default(),
                })
            }
        }
    })())
}

/// Maps a calls row.
fn map_call(row: &SqlRow<'_>) -> rusqlite::Result<Result<CallRecord, LandscapeError>> {
    let call_id: String = row.get(0)?;
    let state_id: Option<String> = row.get(1)?;
    let operation_id: Option<String> = row.get(2)?;
    let call_index: i64 = row.get(3)?;
    let call_type: String = row.get(4)?;
    let status: String = row.get(5)?;
    let request_hash: String = row.get(6)?;
    let response_hash: Option<String> = row.get(7)?;
    let latency_ms: f64 = row.get(8)?;
    let created_at: String = row.get(9)?;
    let error_json: Option<String> = row.get(10)?;
    Ok((|| {
        let parsed_status = CallStatus::parse(&status)?;
        if parsed_status == CallStatus::Success && response_hash.is_none() {
            return Err(AuditIntegrityError::new(format!(
                "call '{call_id}' is SUCCESS but has no response_hash"
            ))
            .into());
        }
        Ok(CallRecord {
            call_id: CallId::new(call_id),
            state_id: state_id.map(StateId::new),
            operation_id: operation_id.map(OperationId::new),
            call_index,
            call_type: CallType::parse(&call_type)?,
            status: parsed_status,
            request_hash,
            response_hash,
            latency_ms,
            created_at: parse_ts(&created_at)?,
            error_json,
        })
    })())
}

/// Maps a routing_events row.
fn map_routing_event(row: &SqlRow<'_>) -> rusqlite::Result<Result<RoutingEvent, LandscapeError>> {
    let state_id: String = row.get(0)?;
    let edge_id: String = row.get(1)?;
    let mode: String = row.get(2)?;
    let reason_hash: Option<String> = row.get(3)?;
    let created_at: String = row.get(4)?;
    Ok((|| {
        Ok(RoutingEvent {
            state_id: StateId::new(state_id),
            edge_id: EdgeId::new(edge_id),
            mode: RoutingMode::parse(&mode)?,
            reason_hash,
            created_at: parse_ts(&created_at)?,
        })
    })())
}

/// Maps an artifacts row.
fn map_artifact(row: &SqlRow<'_>) -> rusqlite::Result<Result<Artifact, LandscapeError>> {
    let artifact_id: String = row.get(0)?;
    let run_id: String = row.get(1)?;
    let produced_by_state_id: String = row.get(2)?;
    let sink_node_id: String = row.get(3)?;
    let artifact_type: String = row.get(4)?;
    let path_or_uri: String = row.get(5)?;
    let content_hash: String = row.get(6)?;
    let size_bytes: i64 = row.get(7)?;
    let idempotency_key: Option<String> = row.get(8)?;
    let created_at: String = row.get(9)?;
    Ok((|| {
        Ok(Artifact {
            artifact_id: ArtifactId::new(artifact_id),
            run_id: RunId::new(run_id),
            produced_by_state_id: StateId::new(produced_by_state_id),
            sink_node_id: NodeId::new(sink_node_id),
            artifact_type,
            path_or_uri,
            content_hash,
            size_bytes,
            idempotency_key,
            created_at: parse_ts(&created_at)?,
        })
    })())
}

/// Maps a token_outcomes row.
fn map_outcome(row: &SqlRow<'_>) -> rusqlite::Result<Result<TokenOutcome, LandscapeError>> {
    let token_id: String = row.get(0)?;
    let run_id: String = row.get(1)?;
    let outcome: String = row.get(2)?;
    let sink_name: Option<String> = row.get(3)?;
    let error_hash: Option<String> = row.get(4)?;
    let created_at: String = row.get(5)?;
    Ok((|| {
        Ok(TokenOutcome {
            token_id: TokenId::new(token_id),
            run_id: RunId::new(run_id),
            outcome: TokenOutcomeKind::parse(&outcome)?,
            sink_name,
            error_hash,
            created_at: parse_ts(&created_at)?,
        })
    })())
}

/// Maps a batches row.
fn map_batch(row: &SqlRow<'_>) -> rusqlite::Result<Result<Batch, LandscapeError>> {
    let batch_id: String = row.get(0)?;
    let run_id: String = row.get(1)?;
    let aggregation_node_id: String = row.get(2)?;
    let attempt: i64 = row.get(3)?;
    let status: String = row.get(4)?;
    let trigger_type: Option<String> = row.get(5)?;
    let trigger_reason: Option<String> = row.get(6)?;
    let aggregation_state_id: Option<String> = row.get(7)?;
    let created_at: String = row.get(8)?;
    let completed_at: Option<String> = row.get(9)?;
    Ok((|| {
        Ok(Batch {
            batch_id: BatchId::new(batch_id),
            run_id: RunId::new(run_id),
            aggregation_node_id: NodeId::new(aggregation_node_id),
            attempt,
            status: BatchStatus::parse(&status)?,
            trigger_type: trigger_type.as_deref().map(TriggerType::parse).transpose()?,
            trigger_reason,
            aggregation_state_id: aggregation_state_id.map(StateId::new),
            created_at: parse_ts(&created_at)?,
            completed_at: completed_at.as_deref().map(parse_ts).transpose()?,
        })
    })())
}

/// Maps a validation_errors row.
fn map_validation_error(
    row: &SqlRow<'_>,
) -> rusqlite::Result<Result<ValidationErrorRecord, LandscapeError>> {
    let error_id: String = row.get(0)?;
    let run_id: String = row.get(1)?;
    let token_id: String = row.get(2)?;
    let node_id: String = row.get(3)?;
    let violations_json: String = row.get(4)?;
    let error_hash: String = row.get(5)?;
    let created_at: String = row.get(6)?;
    Ok((|| {
        Ok(ValidationErrorRecord {
            error_id: ErrorId::new(error_id),
            run_id: RunId::new(run_id),
            token_id: TokenId::new(token_id),
            node_id: NodeId::new(node_id),
            violations_json,
            error_hash,
            created_at: parse_ts(&created_at)?,
        })
    })())
}

/// Maps a transform_errors row.
fn map_transform_error(
    row: &SqlRow<'_>,
) -> rusqlite::Result<Result<TransformErrorRecord, LandscapeError>> {
    let error_id: String = row.get(0)?;
    let run_id: String = row.get(1)?;
    let token_id: String = row.get(2)?;
    let node_id: String = row.get(3)?;
    let state_id: Option<String> = row.get(4)?;
    let error_json: String = row.get(5)?;
    let error_hash: String = row.get(6)?;
    let created_at: String = row.get(7)?;
    Ok((|| {
        Ok(TransformErrorRecord {
            error_id: ErrorId::new(error_id),
            run_id: RunId::new(run_id),
            token_id: TokenId::new(token_id),
            node_id: NodeId::new(node_id),
            state_id: state_id.map(StateId::new),
            error_json,
            error_hash,
            created_at: parse_ts(&created_at)?,
        })
    })())
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic_in_result_fn,
    clippy::unwrap_in_result,
    reason = "Test-only panic-based assertions are permitted."
)]
mod tests {
    use std::sync::Arc;

    use elspeth_core::Value;
    use serde_json::json;

    use super::*;

    /// In-memory payload store for recorder unit tests.
    #[derive(Default)]
    struct MemoryPayloads {
        /// Stored payloads by hash.
        inner: Mutex<std::collections::BTreeMap<String, Vec<u8>>>,
    }

    impl PayloadStore for MemoryPayloads {
        fn put(&self, hash: &str, bytes: &[u8]) -> Result<(), PayloadStoreError> {
            self.inner
                .lock()
                .map_err(|_| PayloadStoreError::Io("poisoned".to_string()))?
                .insert(hash.to_string(), bytes.to_vec());
            Ok(())
        }

        fn get(&self, hash: &str) -> Result<Option<Vec<u8>>, PayloadStoreError> {
            Ok(self
                .inner
                .lock()
                .map_err(|_| PayloadStoreError::Io("poisoned".to_string()))?
                .get(hash)
                .cloned())
        }

        fn contains(&self, hash: &str) -> Result<bool, PayloadStoreError> {
            Ok(self
                .inner
                .lock()
                .map_err(|_| PayloadStoreError::Io("poisoned".to_string()))?
                .contains_key(hash))
        }
    }

    /// Builds a recorder over an in-memory database.
    fn recorder() -> LandscapeRecorder {
        let db = LandscapeDb::in_memory().unwrap();
        LandscapeRecorder::new(db, Arc::new(MemoryPayloads::default()))
    }

    /// Opens a run, node, row, token, and state for state-table tests.
    fn open_state(rec: &LandscapeRecorder) -> (Run, NodeState) {
        let run = rec.begin_run(&json!({"pipeline": "t"}), "sha256-rfc8785-v1").unwrap();
        let node = rec
            .register_node(
                &run.run_id,
                NodeRegistration {
                    node_id: None,
                    plugin_name: "noop".to_string(),
                    node_type: NodeType::Transform,
                    plugin_version: "1.0.0".to_string(),
                    determinism: Determinism::Deterministic,
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
        let source = rec
            .register_node(
                &run.run_id,
                NodeRegistration {
                    node_id: None,
                    plugin_name: "src".to_string(),
                    node_type: NodeType::Source,
                    plugin_version: "1.0.0".to_string(),
                    determinism: Determinism::IoRead,
                    config: json!({}),
                    sequence: Some(0),
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
        let row = rec.create_row(&run.run_id, &source.node_id, 0, &data).unwrap();
        let token = rec.create_token(&row.row_id).unwrap();
        let state = rec
            .begin_node_state(&token.token_id, &node.node_id, &run.run_id, 1, 0, &json!({"id": 1}))
            .unwrap();
        (run, state)
    }

    /// Tests that a COMPLETED row stored without an output hash crashes the
    /// reader instead of being coerced.
    #[test]
    fn test_reader_rejects_completed_without_output_hash() {
        let rec = recorder();
        let (_, state) = open_state(&rec);
        rec.db
            .with_conn(|conn| {
                conn.execute(
                    "UPDATE node_states SET status = 'COMPLETED', duration_ms = 1.0, \
                     completed_at = '2026-01-01T00:00:00.000000Z' WHERE state_id = ?1",
                    params![state.state_id().as_str()],
                )?;
                Ok(())
            })
            .unwrap();

        let err = rec.get_node_state(state.state_id()).unwrap_err();
        assert!(matches!(err, LandscapeError::Integrity(_)));
        assert!(err.to_string().contains("output_hash"));
    }

    /// Tests that an unknown stored status literal crashes the reader.
    #[test]
    fn test_reader_rejects_unknown_status_literal() {
        let rec = recorder();
        let (_, state) = open_state(&rec);
        rec.db
            .with_conn(|conn| {
                conn.execute(
                    "UPDATE node_states SET status = 'HALF_DONE' WHERE state_id = ?1",
                    params![state.state_id().as_str()],
                )?;
                Ok(())
            })
            .unwrap();

        let err = rec.get_node_state(state.state_id()).unwrap_err();
        assert!(matches!(err, LandscapeError::Integrity(_)));
    }

    /// Tests that closing a state twice is an audit integrity error.
    #[test]
    fn test_double_close_rejected() {
        let rec = recorder();
        let (_, state) = open_state(&rec);
        rec.complete_state_success(state.state_id(), &json!({"out": 1}), 2.0, None).unwrap();

        let err = rec
            .complete_state_failed(
                state.state_id(),
                &ExecutionError::new("Boom", "late failure"),
                1.0,
                None,
            )
            .unwrap_err();
        assert!(matches!(err, LandscapeError::Integrity(_)));
    }

    /// Tests monotonic call-index allocation per state.
    #[test]
    fn test_call_index_monotonic() {
        let rec = recorder();
        let (_, state) = open_state(&rec);
        let owner = state.state_id().as_str();
        assert_eq!(rec.allocate_call_index(owner).unwrap(), 0);
        assert_eq!(rec.allocate_call_index(owner).unwrap(), 1);
        assert_eq!(rec.allocate_call_index(owner).unwrap(), 2);
        assert_eq!(rec.allocate_call_index("other-owner").unwrap(), 0);
    }

    /// Tests that a second terminal outcome for a token is rejected.
    #[test]
    fn test_outcome_exactly_once() {
        let rec = recorder();
        let (run, state) = open_state(&rec);
        let token_id = state.core().token_id.clone();
        rec.record_token_outcome(&run.run_id, &token_id, TokenOutcomeKind::Completed, Some("out"), None)
            .unwrap();

        let err = rec
            .record_token_outcome(&run.run_id, &token_id, TokenOutcomeKind::Failed, None, None)
            .unwrap_err();
        assert!(matches!(err, LandscapeError::Integrity(_)));
    }

    /// Tests export-status transition hygiene: leaving FAILED clears the error.
    #[test]
    fn test_export_status_clears_stale_error() {
        let rec = recorder();
        let (run, _) = open_state(&rec);
        rec.set_export_status(&run.run_id, ExportStatus::Failed, Some("disk full")).unwrap();
        let stored = rec.get_run(&run.run_id).unwrap().unwrap();
        assert_eq!(stored.export_error.as_deref(), Some("disk full"));

        rec.set_export_status(&run.run_id, ExportStatus::Exported, None).unwrap();
        let stored = rec.get_run(&run.run_id).unwrap().unwrap();
        assert_eq!(stored.export_status, Some(ExportStatus::Exported));
        assert!(stored.export_error.is_none());
    }

    /// Tests that retrying a failed batch copies members to a new attempt.
    #[test]
    fn test_retry_batch_copies_members() {
        let rec = recorder();
        let (run, state) = open_state(&rec);
        let node_id = state.core().node_id.clone();
        let token_id = state.core().token_id.clone();

        let batch = rec.create_batch(&run.run_id, &node_id, 0).unwrap();
        rec.add_batch_member(&batch.batch_id, &token_id, 0).unwrap();
        rec.complete_batch(
            &batch.batch_id,
            BatchStatus::Failed,
            Some(TriggerType::Count),
            Some("flush exploded"),
            None,
        )
        .unwrap();

        let fresh = rec.retry_batch(&batch.batch_id).unwrap();
        assert_eq!(fresh.attempt, 1);
        assert_eq!(fresh.status, BatchStatus::Draft);
        let members = rec.get_batch_members(&fresh.batch_id).unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].token_id, token_id);

        // Only failed batches can be retried.
        let err = rec.retry_batch(&fresh.batch_id).unwrap_err();
        assert!(matches!(err, LandscapeError::Integrity(_)));
    }

    /// Tests `(from, label)` uniqueness per run.
    #[test]
    fn test_duplicate_edge_label_rejected() {
        let rec = recorder();
        let (run, _) = open_state(&rec);
        let from = NodeId::new("a");
        rec.register_edge(&run.run_id, &from, &NodeId::new("b"), "continue", RoutingMode::Move)
            .unwrap();
        let err = rec
            .register_edge(&run.run_id, &from, &NodeId::new("c"), "continue", RoutingMode::Move)
            .unwrap_err();
        assert!(matches!(err, LandscapeError::DuplicateEdgeLabel { .. }));
    }
}
