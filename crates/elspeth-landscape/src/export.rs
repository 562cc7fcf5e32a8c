// elspeth-landscape/src/export.rs
// ============================================================================
// Module: Landscape Export
// Description: Deterministic JSONL export of a run's audit trail.
// Purpose: Produce byte-stable exports and record export status transitions.
// Dependencies: elspeth-core, serde_json, crate::recorder
// ============================================================================

//! ## Overview
//! Exports a run's audit trail as one JSON object per line, section by
//! section, in the deterministic order the recorder's list queries
//! guarantee. Export status transitions are recorded on the run row; a
//! failed export stores its error and a later success clears it.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fs::File;
use std::io::BufWriter;
use std::io::Write as _;
use std::path::Path;

use elspeth_core::ExportStatus;
use elspeth_core::RunId;
use elspeth_core::format_utc;
use serde_json::json;
use tracing::info;

use crate::recorder::LandscapeError;
use crate::recorder::LandscapeRecorder;

// ============================================================================
// SECTION: Export
// ============================================================================

/// Exports a run's audit trail to a JSONL file.
///
/// Records `EXPORTED` on success and `FAILED` (with the error) on failure.
///
/// # Errors
///
/// Returns [`LandscapeError`] when the run is missing or the write fails;
/// the failure is also recorded on the run row before returning.
pub fn export_run(
    recorder: &LandscapeRecorder,
    run_id: &RunId,
    path: &Path,
) -> Result<u64, LandscapeError> {
    match write_export(recorder, run_id, path) {
        Ok(lines) => {
            recorder.set_export_status(run_id, ExportStatus::Exported, None)?;
            info!(run_id = %run_id, lines, path = %path.display(), "audit export complete");
            Ok(lines)
        }
        Err(err) => {
            recorder.set_export_status(run_id, ExportStatus::Failed, Some(&err.to_string()))?;
            Err(err)
        }
    }
}

/// Writes the export body, returning the number of lines emitted.
fn write_export(
    recorder: &LandscapeRecorder,
    run_id: &RunId,
    path: &Path,
) -> Result<u64, LandscapeError> {
    let run = recorder.get_run(run_id)?.ok_or_else(|| {
        LandscapeError::Store(format!("run '{run_id}' not found for export"))
    })?;

    let file = File::create(path).map_err(|err| LandscapeError::Store(err.to_string()))?;
    let mut out = BufWriter::new(file);
    let mut lines = 0_u64;
    let mut emit = |value: serde_json::Value| -> Result<(), LandscapeError> {
        serde_json::to_writer(&mut out, &value)
            .map_err(|err| LandscapeError::Store(err.to_string()))?;
        out.write_all(b"\n").map_err(|err| LandscapeError::Store(err.to_string()))?;
        lines += 1;
        Ok(())
    };

    emit(json!({
        "entity": "run",
        "run_id": run.run_id.as_str(),
        "started_at": format_utc(run.started_at),
        "completed_at": run.completed_at.map(format_utc),
        "config_hash": run.config_hash,
        "canonical_version": run.canonical_version,
        "status": run.status.as_str(),
    }))?;

    for node in recorder.get_nodes(run_id)? {
        emit(json!({
            "entity": "node",
            "node_id": node.node_id.as_str(),
            "plugin_name": node.plugin_name,
            "node_type": node.node_type.as_str(),
            "plugin_version": node.plugin_version,
            "determinism": node.determinism.as_str(),
            "config_hash": node.config_hash,
            "schema_mode": node.schema_mode,
            "sequence_in_pipeline": node.sequence_in_pipeline,
        }))?;
    }

    for edge in recorder.get_edges(run_id)? {
        emit(json!({
            "entity": "edge",
            "edge_id": edge.edge_id.as_str(),
            "from_node_id": edge.from_node_id.as_str(),
            "to_node_id": edge.to_node_id.as_str(),
            "label": edge.label,
            "default_mode": edge.default_mode.as_str(),
        }))?;
    }

    for row in recorder.get_rows(run_id)? {
        emit(json!({
            "entity": "row",
            "row_id": row.row_id.as_str(),
            "source_node_id": row.source_node_id.as_str(),
            "row_index": row.row_index,
            "source_data_hash": row.source_data_hash,
        }))?;
    }

    for token in recorder.get_tokens(run_id)? {
        emit(json!({
            "entity": "token",
            "token_id": token.token_id.as_str(),
            "row_id": token.row_id.as_str(),
            "step_in_pipeline": token.step_in_pipeline,
        }))?;
        for state in recorder.get_node_states_for_token(&token.token_id)? {
            let core = state.core();
            emit(json!({
                "entity": "node_state",
                "state_id": core.state_id.as_str(),
                "token_id": core.token_id.as_str(),
                "node_id": core.node_id.as_str(),
                "step_index": core.step_index,
                "attempt": core.attempt,
                "status": state.status().as_str(),
                "input_hash": core.input_hash,
                "output_hash": state.output_hash(),
            }))?;
            for call in recorder.get_calls_for_state(&core.state_id)? {
                emit(json!({
                    "entity": "call",
                    "call_id": call.call_id.as_str(),
                    "state_id": core.state_id.as_str(),
                    "call_index": call.call_index,
                    "call_type": call.call_type.as_str(),
                    "status": call.status.as_str(),
                    "request_hash": call.request_hash,
                    "response_hash": call.response_hash,
                }))?;
            }
        }
    }

    for event in recorder.get_routing_events(run_id)? {
        emit(json!({
            "entity": "routing_event",
            "state_id": event.state_id.as_str(),
            "edge_id": event.edge_id.as_str(),
            "mode": event.mode.as_str(),
            "reason_hash": event.reason_hash,
        }))?;
    }

    for artifact in recorder.get_artifacts(run_id, None)? {
        emit(json!({
            "entity": "artifact",
            "artifact_id": artifact.artifact_id.as_str(),
            "sink_node_id": artifact.sink_node_id.as_str(),
            "artifact_type": artifact.artifact_type,
            "path_or_uri": artifact.path_or_uri,
            "content_hash": artifact.content_hash,
            "size_bytes": artifact.size_bytes,
        }))?;
    }

    for outcome in recorder.get_token_outcomes(run_id)? {
        emit(json!({
            "entity": "token_outcome",
            "token_id": outcome.token_id.as_str(),
            "outcome": outcome.outcome.as_str(),
            "sink_name": outcome.sink_name,
            "error_hash": outcome.error_hash,
        }))?;
    }

    out.flush().map_err(|err| LandscapeError::Store(err.to_string()))?;
    Ok(lines)
}
