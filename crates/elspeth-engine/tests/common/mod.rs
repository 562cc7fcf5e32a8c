// elspeth-engine/tests/common/mod.rs
// ============================================================================
// Module: Engine Test Fixtures
// Description: In-memory plugins and recorder wiring for engine tests.
// ============================================================================
//! ## Overview
//! Small deterministic plugins used across the engine test suite: a static
//! source, annotating and failing transforms, a threshold gate, a counting
//! aggregation, a union coalesce, and a JSONL file sink with real fsync.

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
    dead_code,
    reason = "Test-only fixtures; each integration test uses a subset."
)]

use std::collections::BTreeMap;
use std::fs::File;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use elspeth_core::AggregationPlugin;
use elspeth_core::ArtifactDescriptor;
use elspeth_core::CoalescePlugin;
use elspeth_core::FieldContract;
use elspeth_core::FieldType;
use elspeth_core::GatePlugin;
use elspeth_core::GateResult;
use elspeth_core::PipelineRow;
use elspeth_core::PluginContext;
use elspeth_core::PluginError;
use elspeth_core::QuarantinedRow;
use elspeth_core::RoutingAction;
use elspeth_core::RowData;
use elspeth_core::SchemaContract;
use elspeth_core::SchemaMode;
use elspeth_core::SinkPlugin;
use elspeth_core::SourcePlugin;
use elspeth_core::SourceRow;
use elspeth_core::TransformPlugin;
use elspeth_core::TransformResult;
use elspeth_core::TriggerType;
use elspeth_core::Value;
use elspeth_core::sha256_hex;
use elspeth_landscape::FilesystemPayloadStore;
use elspeth_landscape::recorder::LandscapeDb;
use elspeth_landscape::recorder::LandscapeRecorder;
use serde_json::Map as JsonMap;
use serde_json::Value as JsonValue;

/// Builds a recorder over an in-memory database and temp payload store.
pub fn build_recorder(dir: &tempfile::TempDir) -> LandscapeRecorder {
    let db = LandscapeDb::in_memory().unwrap();
    let payloads = FilesystemPayloadStore::open(dir.path().join("payloads")).unwrap();
    LandscapeRecorder::new(db, Arc::new(payloads))
}

/// Builds row data from pairs.
pub fn row(pairs: Vec<(&str, Value)>) -> RowData {
    pairs.into_iter().map(|(key, value)| (key.to_string(), value)).collect()
}

/// A locked contract with `id:int, name:str, value:int`.
pub fn id_name_value_contract() -> Arc<SchemaContract> {
    Arc::new(
        SchemaContract::new(
            SchemaMode::Fixed,
            vec![
                FieldContract::declared("id", FieldType::Int),
                FieldContract::declared("name", FieldType::Text),
                FieldContract::declared("value", FieldType::Int),
            ],
            true,
        )
        .unwrap(),
    )
}

// ============================================================================
// SECTION: Static Source
// ============================================================================

/// Source emitting a fixed list of records.
pub struct StaticSource {
    /// Records to emit.
    pub records: Vec<SourceRow>,
    /// Contract reported before and after locking.
    pub contract: SchemaContract,
    /// Close-call counter (close must be idempotent).
    pub closed: usize,
}

impl StaticSource {
    /// Builds a source over three valid `id,name,value` rows.
    pub fn happy_three() -> Self {
        let contract = id_name_value_contract();
        let rows = vec![
            row(vec![
                ("id", Value::Int(1)),
                ("name", Value::from("Alice")),
                ("value", Value::Int(100)),
            ]),
            row(vec![
                ("id", Value::Int(2)),
                ("name", Value::from("Bob")),
                ("value", Value::Int(200)),
            ]),
            row(vec![
                ("id", Value::Int(3)),
                ("name", Value::from("Charlie")),
                ("value", Value::Int(300)),
            ]),
        ];
        let records = rows
            .into_iter()
            .map(|data| SourceRow::Valid(PipelineRow::new(data, Arc::clone(&contract))))
            .collect();
        Self {
            records,
            contract: contract.as_ref().clone(),
            closed: 0,
        }
    }

    /// Builds a source where row 1 fails FIXED validation (`id` not an int).
    pub fn with_quarantine() -> Self {
        let contract = Arc::new(
            SchemaContract::new(
                SchemaMode::Fixed,
                vec![
                    FieldContract::declared("id", FieldType::Int),
                    FieldContract::declared("name", FieldType::Text),
                ],
                true,
            )
            .unwrap(),
        );
        let good = |id: i64, name: &str| {
            SourceRow::Valid(PipelineRow::new(
                row(vec![("id", Value::Int(id)), ("name", Value::from(name))]),
                Arc::clone(&contract),
            ))
        };
        let bad_data = row(vec![("id", Value::from("two")), ("name", Value::from("Bob"))]);
        let violations = contract.validate_row(&bad_data);
        let bad = SourceRow::Quarantined(QuarantinedRow {
            row_data: bad_data,
            error_message: "field 'id' expected int, got text".to_string(),
            violations,
            destination: "__quarantine__".to_string(),
        });
        Self {
            records: vec![good(1, "Alice"), bad, good(3, "Charlie")],
            contract: contract.as_ref().clone(),
            closed: 0,
        }
    }
}

impl SourcePlugin for StaticSource {
    fn name(&self) -> &str {
        "static-source"
    }

    fn plugin_version(&self) -> &str {
        "1.0.0"
    }

    fn output_contract(&self) -> &SchemaContract {
        &self.contract
    }

    fn load<'a>(
        &'a mut self,
        _ctx: &PluginContext,
    ) -> Result<elspeth_core::SourceRowIter<'a>, PluginError> {
        let records = self.records.clone();
        Ok(Box::new(records.into_iter().map(Ok)))
    }

    fn close(&mut self) {
        self.closed += 1;
    }
}

// ============================================================================
// SECTION: Transforms
// ============================================================================

/// Transform annotating each row with a constant marker field.
pub struct AnnotateTransform {
    /// Field name to add.
    pub field: String,
    /// Value to store.
    pub marker: i64,
}

impl TransformPlugin for AnnotateTransform {
    fn name(&self) -> &str {
        "annotate"
    }

    fn plugin_version(&self) -> &str {
        "1.0.0"
    }

    fn apply(
        &self,
        row: &PipelineRow,
        _ctx: &PluginContext,
    ) -> Result<TransformResult, PluginError> {
        let mut data = row.data().clone();
        data.insert(self.field.clone(), Value::Int(self.marker));
        let mut reason = JsonMap::new();
        reason.insert("added".to_string(), JsonValue::from(self.field.clone()));
        Ok(TransformResult::success(data, reason))
    }

    fn output_contract(&self, input: &SchemaContract) -> Result<SchemaContract, PluginError> {
        let mut fields = input.fields.clone();
        if !fields.iter().any(|field| field.normalized_name == self.field) {
            let mut added = FieldContract::declared(self.field.clone(), FieldType::Int);
            added.required = false;
            fields.push(added);
        }
        SchemaContract::new(input.mode, fields, input.locked)
            .map_err(|err| PluginError::permanent("ContractError", err.to_string()))
    }
}

/// Transform that always fails with a permanent plugin error.
pub struct FailingTransform;

impl TransformPlugin for FailingTransform {
    fn name(&self) -> &str {
        "always-fails"
    }

    fn plugin_version(&self) -> &str {
        "1.0.0"
    }

    fn apply(
        &self,
        _row: &PipelineRow,
        _ctx: &PluginContext,
    ) -> Result<TransformResult, PluginError> {
        Err(PluginError::permanent("SyntheticFailure", "this transform always fails"))
    }
}

// ============================================================================
// SECTION: Gate
// ============================================================================

/// Gate routing rows with `value >= threshold` to a named route.
pub struct ThresholdGate {
    /// Field inspected.
    pub field: String,
    /// Inclusive threshold for routing away.
    pub threshold: i64,
    /// Route label for rows at or above the threshold.
    pub route: String,
}

impl GatePlugin for ThresholdGate {
    fn name(&self) -> &str {
        "threshold-gate"
    }

    fn plugin_version(&self) -> &str {
        "1.0.0"
    }

    fn evaluate(
        &self,
        row: &PipelineRow,
        _ctx: &PluginContext,
    ) -> Result<GateResult, PluginError> {
        let over = matches!(row.get(&self.field), Some(Value::Int(v)) if *v >= self.threshold);
        let action = if over {
            let mut reason = JsonMap::new();
            reason.insert("threshold".to_string(), JsonValue::from(self.threshold));
            RoutingAction::route(self.route.clone(), Some(&reason))
        } else {
            RoutingAction::continue_flow()
        };
        Ok(GateResult {
            data: row.data().clone(),
            action,
        })
    }
}

/// Gate that forks every row down the given branch labels.
pub struct ForkGate {
    /// Branch labels to copy down.
    pub labels: Vec<String>,
}

impl GatePlugin for ForkGate {
    fn name(&self) -> &str {
        "fork-gate"
    }

    fn plugin_version(&self) -> &str {
        "1.0.0"
    }

    fn evaluate(
        &self,
        row: &PipelineRow,
        _ctx: &PluginContext,
    ) -> Result<GateResult, PluginError> {
        Ok(GateResult {
            data: row.data().clone(),
            action: RoutingAction::fork_to_paths(self.labels.clone(), None),
        })
    }
}

// ============================================================================
// SECTION: Aggregation & Coalesce
// ============================================================================

/// Aggregation summing `value` over batches of a fixed size.
pub struct SummingAggregation {
    /// Flush threshold.
    pub batch_size: usize,
    /// Accumulated values.
    pub values: Vec<i64>,
}

impl AggregationPlugin for SummingAggregation {
    fn name(&self) -> &str {
        "summing-aggregation"
    }

    fn plugin_version(&self) -> &str {
        "1.0.0"
    }

    fn accumulate(
        &mut self,
        row: &PipelineRow,
        _ctx: &PluginContext,
    ) -> Result<(), PluginError> {
        let Some(Value::Int(value)) = row.get("value") else {
            return Err(PluginError::permanent("MissingField", "row has no integer 'value'"));
        };
        self.values.push(*value);
        Ok(())
    }

    fn should_flush(&self) -> Option<TriggerType> {
        (self.values.len() >= self.batch_size).then_some(TriggerType::Count)
    }

    fn flush(&mut self, _ctx: &PluginContext) -> Result<TransformResult, PluginError> {
        let total: i64 = self.values.iter().sum();
        let count = i64::try_from(self.values.len()).unwrap_or(i64::MAX);
        self.values.clear();
        let mut data = RowData::new();
        data.insert("total".to_string(), Value::Int(total));
        data.insert("count".to_string(), Value::Int(count));
        let mut reason = JsonMap::new();
        reason.insert("aggregated".to_string(), JsonValue::from(count));
        Ok(TransformResult::success(data, reason))
    }

    fn pending_len(&self) -> usize {
        self.values.len()
    }
}

/// Coalesce policy taking the union of branch rows (later branches win).
pub struct UnionCoalesce;

impl CoalescePlugin for UnionCoalesce {
    fn name(&self) -> &str {
        "union-coalesce"
    }

    fn plugin_version(&self) -> &str {
        "1.0.0"
    }

    fn merge(
        &self,
        rows: &[PipelineRow],
        _ctx: &PluginContext,
    ) -> Result<RowData, PluginError> {
        let mut merged = RowData::new();
        for row in rows {
            for (key, value) in row.data() {
                merged.insert(key.clone(), value.clone());
            }
        }
        Ok(merged)
    }
}

// ============================================================================
// SECTION: JSONL File Sink
// ============================================================================

/// Append-safe JSONL sink with real flush-plus-fsync durability.
pub struct JsonlFileSink {
    /// Output path.
    pub path: PathBuf,
    /// Open handle, once writing has begun.
    pub file: Option<File>,
    /// When set, flush fails with this message (durability fault injection).
    pub fail_flush: Option<String>,
}

impl JsonlFileSink {
    /// Creates a sink writing to the given path.
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            file: None,
            fail_flush: None,
        }
    }
}

impl SinkPlugin for JsonlFileSink {
    fn name(&self) -> &str {
        "jsonl-file"
    }

    fn plugin_version(&self) -> &str {
        "1.0.0"
    }

    fn write(
        &mut self,
        rows: &[RowData],
        _ctx: &PluginContext,
    ) -> Result<ArtifactDescriptor, PluginError> {
        if self.file.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .map_err(|err| PluginError::permanent("IoError", err.to_string()))?;
            self.file = Some(file);
        }
        let Some(file) = self.file.as_mut() else {
            return Err(PluginError::permanent("IoError", "sink file not open"));
        };
        for data in rows {
            let normalized = elspeth_core::normalize_row(data)
                .map_err(|err| PluginError::permanent("CanonicalError", err.to_string()))?;
            let line = serde_json::to_string(&normalized)
                .map_err(|err| PluginError::permanent("IoError", err.to_string()))?;
            writeln!(file, "{line}")
                .map_err(|err| PluginError::permanent("IoError", err.to_string()))?;
        }
        file.flush().map_err(|err| PluginError::permanent("IoError", err.to_string()))?;
        let bytes =
            std::fs::read(&self.path).map_err(|err| PluginError::permanent("IoError", err.to_string()))?;
        Ok(ArtifactDescriptor::for_file(
            self.path.display().to_string(),
            "jsonl",
            sha256_hex(&bytes),
            i64::try_from(bytes.len()).unwrap_or(i64::MAX),
        ))
    }

    fn flush(&mut self) -> Result<(), PluginError> {
        if let Some(message) = &self.fail_flush {
            return Err(PluginError::permanent("IoError", message.clone()));
        }
        if let Some(file) = self.file.as_mut() {
            file.flush().map_err(|err| PluginError::permanent("IoError", err.to_string()))?;
            file.sync_all().map_err(|err| PluginError::permanent("IoError", err.to_string()))?;
        }
        Ok(())
    }

    fn close(&mut self) {
        self.file = None;
    }
}

// ============================================================================
// SECTION: Map Helpers
// ============================================================================

/// Resolution map where normalized and original names coincide.
pub fn identity_resolution(names: &[&str]) -> BTreeMap<String, String> {
    names.iter().map(|name| ((*name).to_string(), (*name).to_string())).collect()
}
