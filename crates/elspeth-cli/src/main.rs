#![cfg_attr(
    test,
    allow(
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
    )
)]
// elspeth-cli/src/main.rs
// ============================================================================
// Module: ELSPETH CLI Entry Point
// Description: Command dispatcher for runs, resume, purge, and export.
// Purpose: Provide the operator surface over the pipeline engine.
// Dependencies: clap, elspeth-config, elspeth-engine, elspeth-landscape,
//               elspeth-plugins, tracing-subscriber
// ============================================================================

//! ## Overview
//! The `elspeth` binary loads a validated settings document, assembles the
//! pipeline from the plugin registry, and drives the orchestrator. Exit
//! codes are part of the operator contract: zero for success, one for
//! unrecoverable errors, and three when resume is refused because the graph
//! or the stored schema contract drifted.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::io::Write as _;
use std::path::Path;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use std::time::SystemTime;

use clap::Parser;
use clap::Subcommand;
use elspeth_config::ElspethSettings;
use elspeth_config::EndpointGuard;
use elspeth_config::NodeSettings;
use elspeth_config::SecurityMode;
use elspeth_config::enforce_strict_mode;
use elspeth_config::load_settings;
use elspeth_core::NodeId;
use elspeth_core::RunId;
use elspeth_engine::EngineError;
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
use elspeth_landscape::FilesystemPayloadStore;
use elspeth_landscape::checkpoint::RecoveryError;
use elspeth_landscape::export_run;
use elspeth_landscape::recorder::LandscapeDb;
use elspeth_landscape::recorder::LandscapeRecorder;
use serde_json::Value as JsonValue;
use thiserror::Error;

// ============================================================================
// SECTION: CLI Types
// ============================================================================

/// Top-level CLI definition.
#[derive(Parser, Debug)]
#[command(name = "elspeth", version, about = "Deterministic, auditable pipeline engine")]
struct Cli {
    /// Path of the settings document.
    #[arg(long, short = 's', default_value = "elspeth.yaml", global = true)]
    settings: PathBuf,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Execute a fresh run of the configured pipeline.
    Run,
    /// Resume a prior run from its latest checkpoint.
    Resume {
        /// Run identifier to resume.
        run_id: String,
    },
    /// Purge payload-store entries older than the retention window.
    Purge {
        /// Retention window in days.
        #[arg(long, default_value_t = 30)]
        older_than_days: u64,
    },
    /// Export a run's audit trail as JSONL.
    Export {
        /// Run identifier to export.
        run_id: String,
        /// Output path for the export.
        #[arg(long, short = 'o')]
        output: PathBuf,
    },
    /// Summarize a run's audit trail.
    Introspect {
        /// Run identifier to summarize.
        run_id: String,
    },
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Exit code for resume refused due to graph or contract drift.
const EXIT_RESUME_REFUSED: u8 = 3;

/// CLI-level errors, mapped to exit codes at the boundary.
#[derive(Debug, Error)]
enum CliError {
    /// Settings loading or validation failed.
    #[error(transparent)]
    Settings(#[from] elspeth_config::SettingsError),
    /// Security configuration failed.
    #[error(transparent)]
    Security(#[from] elspeth_config::SecurityError),
    /// Plugin construction failed.
    #[error(transparent)]
    PluginConfig(#[from] elspeth_core::PluginConfigError),
    /// Engine failure during the run.
    #[error(transparent)]
    Engine(#[from] EngineError),
    /// Audit store failure.
    #[error(transparent)]
    Landscape(#[from] elspeth_landscape::LandscapeError),
    /// Payload store failure.
    #[error(transparent)]
    Payload(#[from] elspeth_core::PayloadStoreError),
    /// An unknown plugin name was configured.
    #[error("unknown {role} plugin '{name}'")]
    UnknownPlugin {
        /// Plugin role: source, transform, or sink.
        role: &'static str,
        /// The unknown name.
        name: String,
    },
}

impl CliError {
    /// Maps the error to the CLI exit code contract.
    fn exit_code(&self) -> ExitCode {
        match self {
            Self::Engine(EngineError::Recovery(
                RecoveryError::Refused {
                    ..
                }
                | RecoveryError::Corruption(_),
            )) => ExitCode::from(EXIT_RESUME_REFUSED),
            _ => ExitCode::FAILURE,
        }
    }
}

// ============================================================================
// SECTION: Entry Point
// ============================================================================

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match dispatch(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            print_stderr(&format!("error: {err}"));
            err.exit_code()
        }
    }
}

/// Routes a parsed CLI invocation.
fn dispatch(cli: &Cli) -> Result<(), CliError> {
    let settings = load_settings(&cli.settings)?;
    match &cli.command {
        Command::Run => run_command(&settings),
        Command::Resume {
            run_id,
        } => resume_command(&settings, &RunId::new(run_id.as_str())),
        Command::Purge {
            older_than_days,
        } => purge_command(&settings, *older_than_days),
        Command::Export {
            run_id,
            output,
        } => export_command(&settings, &RunId::new(run_id.as_str()), output),
        Command::Introspect {
            run_id,
        } => introspect_command(&settings, &RunId::new(run_id.as_str())),
    }
}

// ============================================================================
// SECTION: Commands
// ============================================================================

/// Executes a fresh run.
fn run_command(settings: &ElspethSettings) -> Result<(), CliError> {
    verify_security(settings)?;
    let recorder = open_recorder(settings)?;
    let mut pipeline = build_pipeline(settings)?;
    let orchestrator = build_orchestrator(settings, &recorder);
    let report = orchestrator.run(&mut pipeline, &settings.to_json()?)?;
    print_stdout(&format!(
        "run {} completed: {} records, {} artifacts",
        report.run_id, report.records_emitted, report.artifacts
    ));
    Ok(())
}

/// Resumes a prior run from its latest checkpoint.
fn resume_command(settings: &ElspethSettings, run_id: &RunId) -> Result<(), CliError> {
    verify_security(settings)?;
    let recorder = open_recorder(settings)?;
    let mut pipeline = build_pipeline(settings)?;
    let orchestrator = build_orchestrator(settings, &recorder);
    print_stderr(
        "resume re-delivers rows written after the last checkpoint; duplicate sink \
         writes are possible (at-least-once)",
    );
    let report = orchestrator.resume(&mut pipeline, run_id)?;
    print_stdout(&format!(
        "run {} resumed: {} records re-delivered, {} artifacts",
        report.run_id, report.records_emitted, report.artifacts
    ));
    Ok(())
}

/// Purges old payload-store entries; audit rows keep their hashes.
fn purge_command(settings: &ElspethSettings, older_than_days: u64) -> Result<(), CliError> {
    let payloads = FilesystemPayloadStore::open(&settings.payload_store_path)?;
    let cutoff = SystemTime::now()
        .checked_sub(Duration::from_secs(older_than_days * 24 * 60 * 60))
        .unwrap_or(SystemTime::UNIX_EPOCH);
    let removed = payloads.purge_older_than(cutoff)?;
    print_stdout(&format!("purged {removed} payloads older than {older_than_days} days"));
    Ok(())
}

/// Exports a run's audit trail.
fn export_command(
    settings: &ElspethSettings,
    run_id: &RunId,
    output: &Path,
) -> Result<(), CliError> {
    let recorder = open_recorder(settings)?;
    let lines = export_run(&recorder, run_id, output)?;
    print_stdout(&format!("exported {lines} audit lines to {}", output.display()));
    Ok(())
}

/// Prints a run summary.
fn introspect_command(settings: &ElspethSettings, run_id: &RunId) -> Result<(), CliError> {
    let recorder = open_recorder(settings)?;
    let Some(run) = recorder.get_run(run_id)? else {
        print_stdout(&format!("run {run_id} not found"));
        return Ok(());
    };
    let rows = recorder.get_rows(run_id)?.len();
    let tokens = recorder.get_tokens(run_id)?.len();
    let outcomes = recorder.get_token_outcomes(run_id)?;
    let artifacts = recorder.get_artifacts(run_id, None)?.len();

    print_stdout(&format!("run:       {run_id}"));
    print_stdout(&format!("status:    {}", run.status.as_str()));
    print_stdout(&format!("canonical: {}", run.canonical_version));
    print_stdout(&format!("rows:      {rows}"));
    print_stdout(&format!("tokens:    {tokens}"));
    print_stdout(&format!("artifacts: {artifacts}"));
    let mut counts: BTreeMap<&'static str, usize> = BTreeMap::new();
    for outcome in &outcomes {
        *counts.entry(outcome.outcome.as_str()).or_default() += 1;
    }
    for (kind, count) in counts {
        print_stdout(&format!("outcome {kind}: {count}"));
    }
    Ok(())
}

// ============================================================================
// SECTION: Assembly
// ============================================================================

/// Opens the landscape recorder from settings.
fn open_recorder(settings: &ElspethSettings) -> Result<LandscapeRecorder, CliError> {
    let db = LandscapeDb::open(&settings.landscape_path)?;
    let payloads = FilesystemPayloadStore::open(&settings.payload_store_path)?;
    Ok(LandscapeRecorder::new(db, Arc::new(payloads)))
}

/// Builds the orchestrator with options from settings.
fn build_orchestrator(settings: &ElspethSettings, recorder: &LandscapeRecorder) -> Orchestrator {
    Orchestrator::new(
        recorder.clone(),
        CheckpointManager::new(recorder.db().clone()),
        RunOptions {
            checkpoints_enabled: settings.checkpoints.enabled,
            checkpoint_every_n: settings.checkpoints.every_n,
            export_path: settings.export_path.clone(),
        },
    )
}

/// Verifies the security posture before anything runs.
///
/// Compiles the endpoint guard so misconfigured allowlists fail fast,
/// resolves the configured LLM client so unknown names fail fast, and in
/// strict mode demands explicit security levels, formula sanitization on
/// spreadsheet-adjacent sinks, and live clients.
fn verify_security(settings: &ElspethSettings) -> Result<(), CliError> {
    let mode = SecurityMode::parse(&settings.security.mode)?;
    let _guard = EndpointGuard::new(
        mode,
        &settings.security.approved_endpoints,
        settings.security.endpoint_allowlist_env.as_deref(),
    )?;
    if let Some(llm) = &settings.llm {
        build_llm_client(llm)?;
    }
    if mode == SecurityMode::Strict {
        let mut plugins: Vec<(&str, &str, &JsonValue)> = Vec::new();
        plugins.push(("source", settings.source.plugin.as_str(), &settings.source.config));
        if let Some(llm) = &settings.llm {
            plugins.push(("llm", llm.plugin.as_str(), &llm.config));
        }
        for sink in settings.sinks.values() {
            plugins.push(("sink", sink.plugin.as_str(), &sink.config));
        }
        // CLI runs carry no telemetry sink; strict mode warns about that.
        enforce_strict_mode(&plugins, false)?;
    }
    Ok(())
}

/// Instantiates a source plugin by name.
fn build_source(node: &NodeSettings) -> Result<Box<dyn elspeth_core::SourcePlugin>, CliError> {
    match node.plugin.as_str() {
        "csv" => Ok(Box::new(elspeth_plugins::CsvSource::from_config(&node.config)?)),
        other => Err(CliError::UnknownPlugin {
            role: "source",
            name: other.to_string(),
        }),
    }
}

/// Instantiates a transform plugin by name.
fn build_transform(
    node: &NodeSettings,
) -> Result<Arc<dyn elspeth_core::TransformPlugin>, CliError> {
    match node.plugin.as_str() {
        "field-mapper" => Ok(Arc::new(elspeth_plugins::FieldMapper::from_config(&node.config)?)),
        other => Err(CliError::UnknownPlugin {
            role: "transform",
            name: other.to_string(),
        }),
    }
}

/// Instantiates the configured external-call client by name.
///
/// Resolved eagerly so an unknown client name or malformed client config
/// fails before the run starts; strict mode separately refuses non-live
/// clients.
fn build_llm_client(node: &NodeSettings) -> Result<Arc<dyn elspeth_core::LlmClient>, CliError> {
    match node.plugin.as_str() {
        "static" => {
            let template =
                node.config.get("template").and_then(JsonValue::as_str).unwrap_or("{prompt}");
            Ok(Arc::new(elspeth_plugins::StaticLlmClient::new(template)))
        }
        "mock" => Ok(Arc::new(elspeth_plugins::MockLlmClient::from_config(&node.config)?)),
        other => Err(CliError::UnknownPlugin {
            role: "llm",
            name: other.to_string(),
        }),
    }
}

/// Instantiates a sink plugin by name.
fn build_sink(node: &NodeSettings) -> Result<Box<dyn elspeth_core::SinkPlugin>, CliError> {
    match node.plugin.as_str() {
        "csv" => Ok(Box::new(elspeth_plugins::CsvSink::from_config(&node.config)?)),
        "jsonl" => Ok(Box::new(elspeth_plugins::JsonlSink::from_config(&node.config)?)),
        "json" => Ok(Box::new(elspeth_plugins::JsonArraySink::from_config(&node.config)?)),
        other => Err(CliError::UnknownPlugin {
            role: "sink",
            name: other.to_string(),
        }),
    }
}

/// Parses an `on_error` literal into a policy.
fn parse_on_error(literal: Option<&str>) -> OnErrorPolicy {
    match literal {
        Some("discard") => OnErrorPolicy::Discard,
        Some(other) => other.strip_prefix("route:").map_or(OnErrorPolicy::Fail, |label| {
            OnErrorPolicy::Route {
                label: label.to_string(),
            }
        }),
        None => OnErrorPolicy::Fail,
    }
}

/// Assembles the pipeline from validated settings.
fn build_pipeline(settings: &ElspethSettings) -> Result<Pipeline, CliError> {
    let source = SourceSpec {
        node_id: NodeId::new("source"),
        plugin: build_source(&settings.source)?,
        config: settings.source.config.clone(),
        on_validation_failure: ValidationFailurePolicy::Quarantine,
    };

    let mut stages = Vec::with_capacity(settings.transforms.len());
    for (index, node) in settings.transforms.iter().enumerate() {
        stages.push(StageSpec {
            node_id: NodeId::new(format!("transform-{index}")),
            plugin: StagePlugin::Transform(build_transform(node)?),
            config: node.config.clone(),
            on_error: parse_on_error(node.on_error.as_deref()),
        });
    }

    let mut default_sink = None;
    let mut route_sinks = BTreeMap::new();
    for (label, node) in &settings.sinks {
        let spec = SinkSpec {
            node_id: NodeId::new(format!("sink-{label}")),
            name: label.clone(),
            plugin: build_sink(node)?,
            config: node.config.clone(),
        };
        if label == "default" {
            default_sink = Some(spec);
        } else {
            route_sinks.insert(label.clone(), spec);
        }
    }
    let Some(default_sink) = default_sink else {
        return Err(CliError::UnknownPlugin {
            role: "sink",
            name: "default".to_string(),
        });
    };

    Ok(Pipeline {
        source,
        stages,
        default_sink,
        route_sinks,
    })
}

// ============================================================================
// SECTION: Output Helpers
// ============================================================================

/// Writes one line to stdout, ignoring broken pipes.
fn print_stdout(message: &str) {
    let mut stdout = std::io::stdout();
    let _ = writeln!(&mut stdout, "{message}");
}

/// Writes one line to stderr, ignoring broken pipes.
fn print_stderr(message: &str) {
    let mut stderr = std::io::stderr();
    let _ = writeln!(&mut stderr, "{message}");
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Tests on_error literal parsing.
    #[test]
    fn test_parse_on_error_literals() {
        assert_eq!(parse_on_error(None), OnErrorPolicy::Fail);
        assert_eq!(parse_on_error(Some("fail")), OnErrorPolicy::Fail);
        assert_eq!(parse_on_error(Some("discard")), OnErrorPolicy::Discard);
        assert_eq!(
            parse_on_error(Some("route:errors")),
            OnErrorPolicy::Route {
                label: "errors".to_string()
            }
        );
    }

    /// Tests that unknown plugins are typed errors.
    #[test]
    fn test_unknown_plugin_rejected() {
        let node = NodeSettings {
            plugin: "teleport".to_string(),
            config: serde_json::Value::Null,
            on_error: None,
        };
        assert!(matches!(
            build_source(&node).err().unwrap(),
            CliError::UnknownPlugin { role: "source", .. }
        ));
        assert!(matches!(
            build_sink(&node).err().unwrap(),
            CliError::UnknownPlugin { role: "sink", .. }
        ));
        assert!(matches!(
            build_llm_client(&node).err().unwrap(),
            CliError::UnknownPlugin { role: "llm", .. }
        ));
    }

    /// Tests the LLM client registry.
    #[test]
    fn test_build_llm_client_registry() {
        let mock = NodeSettings {
            plugin: "mock".to_string(),
            config: serde_json::json!({"responses": ["ok"]}),
            on_error: None,
        };
        assert!(build_llm_client(&mock).is_ok());
        let templated = NodeSettings {
            plugin: "static".to_string(),
            config: serde_json::json!({"template": "echo: {prompt}"}),
            on_error: None,
        };
        assert!(build_llm_client(&templated).is_ok());
    }

    /// A strict-mode settings document with compliant plugin configs.
    const STRICT: &str = "
landscape_path: ./audit.db
payload_store_path: ./payloads
security:
  mode: strict
source:
  plugin: csv
  config:
    path: ./input.csv
    security_level: restricted
    schema:
      fields: dynamic
sinks:
  default:
    plugin: jsonl
    config:
      path: ./out.jsonl
      security_level: restricted
";

    /// Tests that compliant strict-mode settings verify.
    #[test]
    fn test_verify_security_strict_compliant() {
        let settings = elspeth_config::parse_settings(STRICT).unwrap();
        assert!(verify_security(&settings).is_ok());
    }

    /// Tests that strict mode demands explicit security levels.
    #[test]
    fn test_verify_security_strict_missing_level() {
        let raw =
            STRICT.replace("    security_level: restricted\n    schema:", "    schema:");
        assert_ne!(raw, STRICT);
        let settings = elspeth_config::parse_settings(&raw).unwrap();
        let err = verify_security(&settings).unwrap_err();
        assert!(matches!(err, CliError::Security(_)));
        assert!(err.to_string().contains("security_level"));
    }

    /// Tests that strict mode refuses mock and static clients.
    #[test]
    fn test_verify_security_strict_refuses_mock_client() {
        let raw = format!(
            "{STRICT}llm:\n  plugin: mock\n  config:\n    security_level: restricted\n"
        );
        let settings = elspeth_config::parse_settings(&raw).unwrap();
        let err = verify_security(&settings).unwrap_err();
        assert!(matches!(err, CliError::Security(_)));
        assert!(err.to_string().contains("mock"));
    }

    /// Tests that standard mode accepts the same document without levels.
    #[test]
    fn test_verify_security_standard_mode_unaffected() {
        let raw = STRICT.replace("  mode: strict", "  mode: standard");
        let settings = elspeth_config::parse_settings(&raw).unwrap();
        assert!(verify_security(&settings).is_ok());
    }
}
