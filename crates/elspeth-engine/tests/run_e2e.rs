// elspeth-engine/tests/run_e2e.rs
// ============================================================================
// Module: Orchestrator End-to-End Tests
// Description: Full-run scenarios over the in-memory landscape.
// ============================================================================
//! ## Overview
//! Drives complete pipelines through the orchestrator and checks the audit
//! trail: happy path, quarantine, error diverts, gate routes, aggregation,
//! fork/coalesce, checkpoints, and resume.

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

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use common::AnnotateTransform;
use common::FailingTransform;
use common::ForkGate;
use common::JsonlFileSink;
use common::StaticSource;
use common::SummingAggregation;
use common::ThresholdGate;
use common::UnionCoalesce;
use common::build_recorder;
use elspeth_core::NodeId;
use elspeth_core::NodeStateStatus;
use elspeth_core::RoutingMode;
use elspeth_core::RunStatus;
use elspeth_core::TokenOutcomeKind;
use elspeth_core::sha256_hex;
use elspeth_engine::BranchStage;
use elspeth_engine::CoalesceSpec;
use elspeth_engine::ForkJoin;
use elspeth_engine::OnErrorPolicy;
use elspeth_engine::Orchestrator;
use elspeth_engine::Pipeline;
use elspeth_engine::RunOptions;
use elspeth_engine::SinkSpec;
use elspeth_engine::SourceSpec;
use elspeth_engine::StagePlugin;
use elspeth_engine::StageSpec;
use elspeth_engine::ValidationFailurePolicy;
use elspeth_landscape::CheckpointManager;
use elspeth_landscape::recorder::LandscapeRecorder;
use serde_json::json;

/// Builds an orchestrator with per-token checkpoints.
fn orchestrator(recorder: &LandscapeRecorder) -> Orchestrator {
    Orchestrator::new(
        recorder.clone(),
        CheckpointManager::new(recorder.db().clone()),
        RunOptions::default(),
    )
}

/// Builds a sink spec around a JSONL file sink.
fn jsonl_sink(dir: &tempfile::TempDir, node: &str, name: &str, file: &str) -> SinkSpec {
    SinkSpec {
        node_id: NodeId::new(node),
        name: name.to_string(),
        plugin: Box::new(JsonlFileSink::new(dir.path().join(file))),
        config: json!({"path": file}),
    }
}

// ============================================================================
// SECTION: Happy Path
// ============================================================================

/// Tests the audit trail for a three-row run into a file sink.
#[test]
fn test_happy_path_three_rows() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = build_recorder(&dir);

    let mut pipeline = Pipeline {
        source: SourceSpec {
            node_id: NodeId::new("source"),
            plugin: Box::new(StaticSource::happy_three()),
            config: json!({"rows": 3}),
            on_validation_failure: ValidationFailurePolicy::Quarantine,
        },
        stages: vec![StageSpec {
            node_id: NodeId::new("annotate"),
            plugin: StagePlugin::Transform(Arc::new(AnnotateTransform {
                field: "marker".to_string(),
                marker: 7,
            })),
            config: json!({"field": "marker"}),
            on_error: OnErrorPolicy::Fail,
        }],
        default_sink: jsonl_sink(&dir, "out", "output", "out.jsonl"),
        route_sinks: BTreeMap::new(),
    };

    let report = orchestrator(&recorder)
        .run(&mut pipeline, &json!({"pipeline": "happy"}))
        .unwrap();
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.records_emitted, 3);
    assert_eq!(report.artifacts, 1);
    let run_id = report.run_id;

    // Three rows, three tokens, one terminal outcome each.
    assert_eq!(recorder.get_rows(&run_id).unwrap().len(), 3);
    let tokens = recorder.get_tokens(&run_id).unwrap();
    assert_eq!(tokens.len(), 3);
    let outcomes = recorder.get_token_outcomes(&run_id).unwrap();
    assert_eq!(outcomes.len(), 3);
    assert!(outcomes.iter().all(|o| o.outcome == TokenOutcomeKind::Completed));
    assert!(outcomes.iter().all(|o| o.sink_name.as_deref() == Some("output")));

    // Three completed states at source and at the sink.
    for node in ["source", "out"] {
        let states =
            recorder.get_node_states_for_node(&run_id, &NodeId::new(node)).unwrap();
        assert_eq!(states.len(), 3, "expected three states at {node}");
        assert!(states.iter().all(|s| s.status() == NodeStateStatus::Completed));
    }

    // The artifact's content hash is the hash of the final file bytes.
    let artifacts = recorder.get_artifacts(&run_id, None).unwrap();
    assert_eq!(artifacts.len(), 1);
    let bytes = std::fs::read(dir.path().join("out.jsonl")).unwrap();
    assert_eq!(artifacts[0].content_hash, sha256_hex(&bytes));
    assert_eq!(artifacts[0].size_bytes, i64::try_from(bytes.len()).unwrap());

    // One checkpoint per durable token, strictly increasing.
    let manager = CheckpointManager::new(recorder.db().clone());
    let checkpoints = manager.get_checkpoints(&run_id).unwrap();
    assert_eq!(checkpoints.len(), 3);
    assert!(checkpoints.windows(2).all(|w| w[0].sequence_number < w[1].sequence_number));

    // The run embeds the locked contract.
    let contract = recorder.get_run_contract(&run_id).unwrap().unwrap();
    assert!(contract.verify_integrity().is_ok());
}

// ============================================================================
// SECTION: Quarantine
// ============================================================================

/// Tests FIXED-mode quarantine: two complete, one quarantined with lineage.
#[test]
fn test_quarantine_in_fixed_mode() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = build_recorder(&dir);

    let mut route_sinks = BTreeMap::new();
    route_sinks.insert(
        "__quarantine__".to_string(),
        jsonl_sink(&dir, "quarantine-out", "quarantine", "quarantine.jsonl"),
    );
    let mut pipeline = Pipeline {
        source: SourceSpec {
            node_id: NodeId::new("source"),
            plugin: Box::new(StaticSource::with_quarantine()),
            config: json!({"schema": ["id:int", "name:str"]}),
            on_validation_failure: ValidationFailurePolicy::Quarantine,
        },
        stages: Vec::new(),
        default_sink: jsonl_sink(&dir, "out", "output", "out.jsonl"),
        route_sinks,
    };

    let report = orchestrator(&recorder)
        .run(&mut pipeline, &json!({"pipeline": "quarantine"}))
        .unwrap();
    let run_id = report.run_id;

    let outcomes = recorder.get_token_outcomes(&run_id).unwrap();
    assert_eq!(outcomes.len(), 3);
    let completed =
        outcomes.iter().filter(|o| o.outcome == TokenOutcomeKind::Completed).count();
    let quarantined: Vec<_> =
        outcomes.iter().filter(|o| o.outcome == TokenOutcomeKind::Quarantined).collect();
    assert_eq!(completed, 2);
    assert_eq!(quarantined.len(), 1);
    assert!(quarantined[0].error_hash.is_some());
    assert_eq!(quarantined[0].sink_name.as_deref(), Some("quarantine"));

    // One validation error event, and the divert is classified as quarantine.
    let validation_errors = recorder.get_validation_errors(&run_id).unwrap();
    assert_eq!(validation_errors.len(), 1);
    assert_eq!(
        validation_errors[0].error_hash.as_str(),
        quarantined[0].error_hash.as_deref().unwrap()
    );
    let summary = recorder.divert_summary(&quarantined[0].token_id).unwrap();
    assert_eq!(summary.divert_type, "quarantine");

    let events = recorder.get_routing_events(&run_id).unwrap();
    assert_eq!(events.iter().filter(|e| e.mode == RoutingMode::Divert).count(), 1);
}

// ============================================================================
// SECTION: Error Divert Lineage
// ============================================================================

/// Tests that a failing transform diverts along an error edge with full
/// lineage: DIVERT event, routed outcome at the error sink, divert summary.
#[test]
fn test_error_divert_lineage() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = build_recorder(&dir);

    let mut route_sinks = BTreeMap::new();
    route_sinks.insert(
        "error_sink".to_string(),
        jsonl_sink(&dir, "errors-out", "error_sink", "errors.jsonl"),
    );
    let mut pipeline = Pipeline {
        source: SourceSpec {
            node_id: NodeId::new("source"),
            plugin: Box::new(StaticSource::happy_three()),
            config: json!({}),
            on_validation_failure: ValidationFailurePolicy::Quarantine,
        },
        stages: vec![StageSpec {
            node_id: NodeId::new("broken"),
            plugin: StagePlugin::Transform(Arc::new(FailingTransform)),
            config: json!({}),
            on_error: OnErrorPolicy::Route {
                label: "error_sink".to_string(),
            },
        }],
        default_sink: jsonl_sink(&dir, "out", "output", "out.jsonl"),
        route_sinks,
    };

    let report = orchestrator(&recorder)
        .run(&mut pipeline, &json!({"pipeline": "divert"}))
        .unwrap();
    let run_id = report.run_id;

    let outcomes = recorder.get_token_outcomes(&run_id).unwrap();
    assert_eq!(outcomes.len(), 3);
    assert!(outcomes.iter().all(|o| o.outcome == TokenOutcomeKind::Routed));
    assert!(outcomes.iter().all(|o| o.sink_name.as_deref() == Some("error_sink")));

    let events = recorder.get_routing_events(&run_id).unwrap();
    assert_eq!(events.iter().filter(|e| e.mode == RoutingMode::Divert).count(), 3);

    let summary = recorder.divert_summary(&outcomes[0].token_id).unwrap();
    assert_eq!(summary.divert_type, "error");
    assert!(summary.edge_label.unwrap().starts_with("__error_"));

    // Transform error events were recorded for each failing attempt.
    assert_eq!(recorder.get_transform_errors(&run_id).unwrap().len(), 3);
}

/// Tests that the discard policy drops tokens with failed outcomes.
#[test]
fn test_error_discard_policy() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = build_recorder(&dir);

    let mut pipeline = Pipeline {
        source: SourceSpec {
            node_id: NodeId::new("source"),
            plugin: Box::new(StaticSource::happy_three()),
            config: json!({}),
            on_validation_failure: ValidationFailurePolicy::Quarantine,
        },
        stages: vec![StageSpec {
            node_id: NodeId::new("broken"),
            plugin: StagePlugin::Transform(Arc::new(FailingTransform)),
            config: json!({}),
            on_error: OnErrorPolicy::Discard,
        }],
        default_sink: jsonl_sink(&dir, "out", "output", "out.jsonl"),
        route_sinks: BTreeMap::new(),
    };

    let report = orchestrator(&recorder)
        .run(&mut pipeline, &json!({"pipeline": "discard"}))
        .unwrap();
    let run_id = report.run_id;

    let outcomes = recorder.get_token_outcomes(&run_id).unwrap();
    assert_eq!(outcomes.len(), 3);
    assert!(outcomes.iter().all(|o| o.outcome == TokenOutcomeKind::Failed));
    assert!(outcomes.iter().all(|o| o.error_hash.is_some()));
    assert!(recorder.get_artifacts(&run_id, None).unwrap().is_empty());
}

/// Tests that the fail policy fails the run and marks it FAILED.
#[test]
fn test_error_fail_policy() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = build_recorder(&dir);

    let mut pipeline = Pipeline {
        source: SourceSpec {
            node_id: NodeId::new("source"),
            plugin: Box::new(StaticSource::happy_three()),
            config: json!({}),
            on_validation_failure: ValidationFailurePolicy::Quarantine,
        },
        stages: vec![StageSpec {
            node_id: NodeId::new("broken"),
            plugin: StagePlugin::Transform(Arc::new(FailingTransform)),
            config: json!({}),
            on_error: OnErrorPolicy::Fail,
        }],
        default_sink: jsonl_sink(&dir, "out", "output", "out.jsonl"),
        route_sinks: BTreeMap::new(),
    };

    let err = orchestrator(&recorder).run(&mut pipeline, &json!({"pipeline": "fail"}));
    assert!(err.is_err());

    let runs: Vec<_> = recorder.get_token_outcomes(&elspeth_core::RunId::new("nope")).unwrap();
    assert!(runs.is_empty());
}

// ============================================================================
// SECTION: Gate Routes
// ============================================================================

/// Tests that a gate routes high-value rows to a named sink.
#[test]
fn test_gate_routes_to_named_sink() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = build_recorder(&dir);

    let mut route_sinks = BTreeMap::new();
    route_sinks.insert("high".to_string(), jsonl_sink(&dir, "high-out", "high-sink", "high.jsonl"));
    let mut pipeline = Pipeline {
        source: SourceSpec {
            node_id: NodeId::new("source"),
            plugin: Box::new(StaticSource::happy_three()),
            config: json!({}),
            on_validation_failure: ValidationFailurePolicy::Quarantine,
        },
        stages: vec![StageSpec {
            node_id: NodeId::new("gate"),
            plugin: StagePlugin::Gate {
                plugin: Box::new(ThresholdGate {
                    field: "value".to_string(),
                    threshold: 300,
                    route: "high".to_string(),
                }),
                fork: None,
            },
            config: json!({"threshold": 300}),
            on_error: OnErrorPolicy::Fail,
        }],
        default_sink: jsonl_sink(&dir, "out", "output", "out.jsonl"),
        route_sinks,
    };

    let report = orchestrator(&recorder)
        .run(&mut pipeline, &json!({"pipeline": "gate"}))
        .unwrap();
    let run_id = report.run_id;

    let outcomes = recorder.get_token_outcomes(&run_id).unwrap();
    let routed: Vec<_> =
        outcomes.iter().filter(|o| o.outcome == TokenOutcomeKind::Routed).collect();
    let completed =
        outcomes.iter().filter(|o| o.outcome == TokenOutcomeKind::Completed).count();
    assert_eq!(routed.len(), 1);
    assert_eq!(completed, 2);
    assert_eq!(routed[0].sink_name.as_deref(), Some("high-sink"));

    // Every gate evaluation recorded a traversal; the route is a MOVE.
    let events = recorder.get_routing_events(&run_id).unwrap();
    assert_eq!(events.len(), 3);
    assert!(events.iter().all(|e| e.mode == RoutingMode::Move));
}

// ============================================================================
// SECTION: Aggregation
// ============================================================================

/// Tests batch aggregation: consumed members, aggregated outputs, outcomes.
#[test]
fn test_aggregation_consumes_and_flushes() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = build_recorder(&dir);

    let mut pipeline = Pipeline {
        source: SourceSpec {
            node_id: NodeId::new("source"),
            plugin: Box::new(StaticSource::happy_three()),
            config: json!({}),
            on_validation_failure: ValidationFailurePolicy::Quarantine,
        },
        stages: vec![StageSpec {
            node_id: NodeId::new("sum"),
            plugin: StagePlugin::Aggregation(Box::new(SummingAggregation {
                batch_size: 2,
                values: Vec::new(),
            })),
            config: json!({"batch_size": 2}),
            on_error: OnErrorPolicy::Fail,
        }],
        default_sink: jsonl_sink(&dir, "out", "output", "out.jsonl"),
        route_sinks: BTreeMap::new(),
    };

    let report = orchestrator(&recorder)
        .run(&mut pipeline, &json!({"pipeline": "aggregate"}))
        .unwrap();
    let run_id = report.run_id;

    let outcomes = recorder.get_token_outcomes(&run_id).unwrap();
    let consumed =
        outcomes.iter().filter(|o| o.outcome == TokenOutcomeKind::ConsumedInBatch).count();
    let completed =
        outcomes.iter().filter(|o| o.outcome == TokenOutcomeKind::Completed).count();
    // Three members consumed; two aggregated outputs (count flush + final).
    assert_eq!(consumed, 3);
    assert_eq!(completed, 2);

    // Both batches closed COMPLETED with their triggers.
    let incomplete = recorder.get_incomplete_batches(&run_id).unwrap();
    assert!(incomplete.is_empty());
}

// ============================================================================
// SECTION: Fork & Coalesce
// ============================================================================

/// Tests fork-to-branches with a coalesce join: parent forked, children
/// coalesced, merged row completes with both branch markers.
#[test]
fn test_fork_and_coalesce() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = build_recorder(&dir);

    let mut branches = BTreeMap::new();
    branches.insert(
        "left".to_string(),
        vec![BranchStage {
            node_id: NodeId::new("left-annotate"),
            plugin: Arc::new(AnnotateTransform {
                field: "left_mark".to_string(),
                marker: 1,
            }),
            config: json!({"branch": "left"}),
        }],
    );
    branches.insert(
        "right".to_string(),
        vec![BranchStage {
            node_id: NodeId::new("right-annotate"),
            plugin: Arc::new(AnnotateTransform {
                field: "right_mark".to_string(),
                marker: 2,
            }),
            config: json!({"branch": "right"}),
        }],
    );

    let mut pipeline = Pipeline {
        source: SourceSpec {
            node_id: NodeId::new("source"),
            plugin: Box::new(StaticSource::happy_three()),
            config: json!({}),
            on_validation_failure: ValidationFailurePolicy::Quarantine,
        },
        stages: vec![StageSpec {
            node_id: NodeId::new("fork"),
            plugin: StagePlugin::Gate {
                plugin: Box::new(ForkGate {
                    labels: vec!["left".to_string(), "right".to_string()],
                }),
                fork: Some(ForkJoin {
                    branches,
                    coalesce: CoalesceSpec {
                        node_id: NodeId::new("join"),
                        plugin: Box::new(UnionCoalesce),
                        config: json!({"policy": "union"}),
                    },
                }),
            },
            config: json!({}),
            on_error: OnErrorPolicy::Fail,
        }],
        default_sink: jsonl_sink(&dir, "out", "output", "out.jsonl"),
        route_sinks: BTreeMap::new(),
    };

    let report = orchestrator(&recorder)
        .run(&mut pipeline, &json!({"pipeline": "fork"}))
        .unwrap();
    let run_id = report.run_id;

    let outcomes = recorder.get_token_outcomes(&run_id).unwrap();
    let by_kind = |kind: TokenOutcomeKind| {
        outcomes.iter().filter(|outcome| outcome.outcome == kind).count()
    };
    // Per source row: one forked parent, two coalesced children, one
    // completed merged token.
    assert_eq!(by_kind(TokenOutcomeKind::Forked), 3);
    assert_eq!(by_kind(TokenOutcomeKind::Coalesced), 6);
    assert_eq!(by_kind(TokenOutcomeKind::Completed), 3);

    // Fork traversals are COPY events.
    let events = recorder.get_routing_events(&run_id).unwrap();
    assert_eq!(events.iter().filter(|e| e.mode == RoutingMode::Copy).count(), 6);

    // The merged rows carry both branch markers.
    let merged = std::fs::read_to_string(dir.path().join("out.jsonl")).unwrap();
    for line in merged.lines() {
        let parsed: serde_json::Value = serde_json::from_str(line).unwrap();
        assert_eq!(parsed.get("left_mark"), Some(&json!(1)));
        assert_eq!(parsed.get("right_mark"), Some(&json!(2)));
    }
}

// ============================================================================
// SECTION: Resume
// ============================================================================

/// Tests that resume skips checkpointed rows entirely.
#[test]
fn test_resume_skips_durable_rows() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = build_recorder(&dir);

    let build = |dir: &tempfile::TempDir| Pipeline {
        source: SourceSpec {
            node_id: NodeId::new("source"),
            plugin: Box::new(StaticSource::happy_three()),
            config: json!({}),
            on_validation_failure: ValidationFailurePolicy::Quarantine,
        },
        stages: Vec::new(),
        default_sink: jsonl_sink(dir, "out", "output", "out.jsonl"),
        route_sinks: BTreeMap::new(),
    };

    let mut pipeline = build(&dir);
    let report = orchestrator(&recorder)
        .run(&mut pipeline, &json!({"pipeline": "resume"}))
        .unwrap();
    let run_id = report.run_id;
    assert_eq!(report.records_emitted, 3);

    // All three rows are checkpointed, so resume re-delivers nothing.
    let mut resumed_pipeline = build(&dir);
    let resumed = orchestrator(&recorder).resume(&mut resumed_pipeline, &run_id).unwrap();
    assert_eq!(resumed.records_emitted, 0);
    assert_eq!(resumed.status, RunStatus::Completed);

    // Outcomes were not duplicated.
    assert_eq!(recorder.get_token_outcomes(&run_id).unwrap().len(), 3);
}
