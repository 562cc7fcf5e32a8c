// elspeth-landscape/src/schema.rs
// ============================================================================
// Module: Landscape Schema
// Description: Idempotent SQLite DDL for the audit store.
// Purpose: Define every audit table and its integrity constraints.
// Dependencies: rusqlite
// ============================================================================

//! ## Overview
//! The audit schema is append-mostly: nothing is deleted during a run and
//! updates are confined to the narrow set of mutable columns (run status and
//! completion, node output contracts, run contract, batch status, export
//! status). Uniqueness constraints enforce the core invariants at the store
//! boundary: one outcome per token, one edge per `(run, from, label)`, and
//! exclusive call attribution.

// ============================================================================
// SECTION: Imports
// ============================================================================

use rusqlite::Connection;

// ============================================================================
// SECTION: DDL
// ============================================================================

/// Audit schema version recorded in `landscape_meta`.
pub const LANDSCAPE_SCHEMA_VERSION: i64 = 1;

/// Idempotent schema DDL executed on every open.
const DDL: &str = "
CREATE TABLE IF NOT EXISTS landscape_meta (
    key                 TEXT PRIMARY KEY,
    value               TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS runs (
    run_id              TEXT PRIMARY KEY,
    started_at          TEXT NOT NULL,
    completed_at        TEXT,
    config_hash         TEXT NOT NULL,
    settings_json       TEXT NOT NULL,
    canonical_version   TEXT NOT NULL,
    status              TEXT NOT NULL,
    schema_contract_json TEXT,
    export_status       TEXT,
    export_error        TEXT
);

CREATE TABLE IF NOT EXISTS nodes (
    node_id             TEXT NOT NULL,
    run_id              TEXT NOT NULL REFERENCES runs(run_id),
    plugin_name         TEXT NOT NULL,
    node_type           TEXT NOT NULL,
    plugin_version      TEXT NOT NULL,
    determinism         TEXT NOT NULL,
    config_hash         TEXT NOT NULL,
    config_json         TEXT NOT NULL,
    schema_hash         TEXT,
    sequence_in_pipeline INTEGER,
    schema_mode         TEXT NOT NULL,
    schema_fields_json  TEXT,
    input_contract_json TEXT,
    output_contract_json TEXT,
    registered_at       TEXT NOT NULL,
    PRIMARY KEY (node_id, run_id)
);

CREATE TABLE IF NOT EXISTS edges (
    edge_id             TEXT PRIMARY KEY,
    run_id              TEXT NOT NULL REFERENCES runs(run_id),
    from_node_id        TEXT NOT NULL,
    to_node_id          TEXT NOT NULL,
    label               TEXT NOT NULL,
    default_mode        TEXT NOT NULL,
    created_at          TEXT NOT NULL,
    UNIQUE (run_id, from_node_id, label)
);

CREATE TABLE IF NOT EXISTS rows (
    row_id              TEXT PRIMARY KEY,
    run_id              TEXT NOT NULL REFERENCES runs(run_id),
    source_node_id      TEXT NOT NULL,
    row_index           INTEGER NOT NULL,
    source_data_hash    TEXT NOT NULL,
    created_at          TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS tokens (
    token_id            TEXT PRIMARY KEY,
    row_id              TEXT NOT NULL REFERENCES rows(row_id),
    created_at          TEXT NOT NULL,
    step_in_pipeline    INTEGER
);

CREATE TABLE IF NOT EXISTS node_states (
    state_id            TEXT PRIMARY KEY,
    token_id            TEXT NOT NULL REFERENCES tokens(token_id),
    node_id             TEXT NOT NULL,
    run_id              TEXT NOT NULL REFERENCES runs(run_id),
    step_index          INTEGER NOT NULL,
    attempt             INTEGER NOT NULL,
    status              TEXT NOT NULL,
    input_hash          TEXT NOT NULL,
    started_at          TEXT NOT NULL,
    context_before_json TEXT,
    output_hash         TEXT,
    duration_ms         REAL,
    completed_at        TEXT,
    context_after_json  TEXT,
    error_json          TEXT,
    success_reason_json TEXT
);

CREATE TABLE IF NOT EXISTS state_call_counters (
    state_id            TEXT PRIMARY KEY,
    next_index          INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS routing_events (
    state_id            TEXT NOT NULL REFERENCES node_states(state_id),
    edge_id             TEXT NOT NULL REFERENCES edges(edge_id),
    mode                TEXT NOT NULL,
    reason_hash         TEXT,
    created_at          TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS routing_reasons (
    reason_hash         TEXT PRIMARY KEY,
    reason_json         TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS operations (
    operation_id        TEXT PRIMARY KEY,
    run_id              TEXT NOT NULL REFERENCES runs(run_id),
    node_id             TEXT NOT NULL,
    operation_type      TEXT NOT NULL,
    input_hash          TEXT NOT NULL,
    output_hash         TEXT,
    started_at          TEXT NOT NULL,
    completed_at        TEXT
);

CREATE TABLE IF NOT EXISTS calls (
    call_id             TEXT PRIMARY KEY,
    state_id            TEXT,
    operation_id        TEXT,
    call_index          INTEGER NOT NULL,
    call_type           TEXT NOT NULL,
    status              TEXT NOT NULL,
    request_hash        TEXT NOT NULL,
    response_hash       TEXT,
    latency_ms          REAL NOT NULL,
    created_at          TEXT NOT NULL,
    error_json          TEXT,
    CHECK ((state_id IS NULL) != (operation_id IS NULL)),
    UNIQUE (state_id, call_index)
);

CREATE TABLE IF NOT EXISTS artifacts (
    artifact_id         TEXT PRIMARY KEY,
    run_id              TEXT NOT NULL REFERENCES runs(run_id),
    produced_by_state_id TEXT NOT NULL REFERENCES node_states(state_id),
    sink_node_id        TEXT NOT NULL,
    artifact_type       TEXT NOT NULL,
    path_or_uri         TEXT NOT NULL,
    content_hash        TEXT NOT NULL,
    size_bytes          INTEGER NOT NULL,
    idempotency_key     TEXT,
    created_at          TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS token_outcomes (
    token_id            TEXT PRIMARY KEY REFERENCES tokens(token_id),
    run_id              TEXT NOT NULL REFERENCES runs(run_id),
    outcome             TEXT NOT NULL,
    sink_name           TEXT,
    error_hash          TEXT,
    created_at          TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS batches (
    batch_id            TEXT PRIMARY KEY,
    run_id              TEXT NOT NULL REFERENCES runs(run_id),
    aggregation_node_id TEXT NOT NULL,
    attempt             INTEGER NOT NULL,
    status              TEXT NOT NULL,
    trigger_type        TEXT,
    trigger_reason      TEXT,
    aggregation_state_id TEXT,
    created_at          TEXT NOT NULL,
    completed_at        TEXT
);

CREATE TABLE IF NOT EXISTS batch_members (
    batch_id            TEXT NOT NULL REFERENCES batches(batch_id),
    token_id            TEXT NOT NULL REFERENCES tokens(token_id),
    ordinal             INTEGER NOT NULL,
    PRIMARY KEY (batch_id, token_id)
);

CREATE TABLE IF NOT EXISTS validation_errors (
    error_id            TEXT PRIMARY KEY,
    run_id              TEXT NOT NULL REFERENCES runs(run_id),
    token_id            TEXT NOT NULL REFERENCES tokens(token_id),
    node_id             TEXT NOT NULL,
    violations_json     TEXT NOT NULL,
    error_hash          TEXT NOT NULL,
    created_at          TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS transform_errors (
    error_id            TEXT PRIMARY KEY,
    run_id              TEXT NOT NULL REFERENCES runs(run_id),
    token_id            TEXT NOT NULL REFERENCES tokens(token_id),
    node_id             TEXT NOT NULL,
    state_id            TEXT,
    error_json          TEXT NOT NULL,
    error_hash          TEXT NOT NULL,
    created_at          TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS checkpoints (
    checkpoint_id       TEXT PRIMARY KEY,
    run_id              TEXT NOT NULL REFERENCES runs(run_id),
    token_id            TEXT NOT NULL REFERENCES tokens(token_id),
    node_id             TEXT NOT NULL,
    sequence_number     INTEGER NOT NULL,
    graph_fingerprint   TEXT NOT NULL,
    created_at          TEXT NOT NULL,
    UNIQUE (run_id, sequence_number)
);

CREATE INDEX IF NOT EXISTS idx_rows_run ON rows(run_id, row_index);
CREATE INDEX IF NOT EXISTS idx_states_token ON node_states(token_id, step_index);
CREATE INDEX IF NOT EXISTS idx_states_run ON node_states(run_id);
CREATE INDEX IF NOT EXISTS idx_calls_request ON calls(call_type, request_hash);
CREATE INDEX IF NOT EXISTS idx_outcomes_run ON token_outcomes(run_id);
CREATE INDEX IF NOT EXISTS idx_checkpoints_run ON checkpoints(run_id, sequence_number);
";

/// Applies pragmas and the idempotent schema to a connection.
///
/// # Errors
///
/// Returns [`rusqlite::Error`] when DDL execution fails.
pub fn initialize_schema(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = FULL;
         PRAGMA foreign_keys = ON;",
    )?;
    conn.execute_batch(DDL)?;
    conn.execute(
        "INSERT OR IGNORE INTO landscape_meta (key, value) VALUES ('schema_version', ?1)",
        [LANDSCAPE_SCHEMA_VERSION.to_string()],
    )?;
    Ok(())
}
