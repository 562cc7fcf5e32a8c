// elspeth-core/src/core/row.rs
// ============================================================================
// Module: ELSPETH Pipeline Row
// Description: Contract-aware in-flight row carrier.
// Purpose: Present dual-name access over typed row data with its contract.
// Dependencies: crate::core::{contract, value}
// ============================================================================

//! ## Overview
//! [`PipelineRow`] is the carrier that flows through the DAG: typed row data
//! keyed by normalized field name, plus a shared reference to the contract
//! that produced it. Quarantined rows carry no contract; they are raw data
//! plus the failure that diverted them, and cannot be converted back into a
//! [`PipelineRow`].

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::core::contract::ContractViolation;
use crate::core::contract::SchemaContract;
use crate::core::value::RowData;
use crate::core::value::Value;

// ============================================================================
// SECTION: Pipeline Row
// ============================================================================

/// In-flight row: typed data plus the contract that shaped it.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineRow {
    /// Row data keyed by normalized field name.
    data: RowData,
    /// Contract governing this row's shape.
    contract: Arc<SchemaContract>,
}

impl PipelineRow {
    /// Creates a row from normalized-keyed data and its contract.
    #[must_use]
    pub const fn new(data: RowData, contract: Arc<SchemaContract>) -> Self {
        Self {
            data,
            contract,
        }
    }

    /// Looks up a value by normalized field name.
    #[must_use]
    pub fn get(&self, normalized_name: &str) -> Option<&Value> {
        self.data.get(normalized_name)
    }

    /// Looks up a value by the source's original field name.
    #[must_use]
    pub fn get_original(&self, original_name: &str) -> Option<&Value> {
        let field = self
            .contract
            .fields
            .iter()
            .find(|field| field.original_name == original_name)?;
        self.data.get(&field.normalized_name)
    }

    /// Mapping-style membership check over both name spaces.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.data.contains_key(name) || self.get_original(name).is_some()
    }

    /// Borrowed view of the row data.
    #[must_use]
    pub const fn data(&self) -> &RowData {
        &self.data
    }

    /// Consumes the row, returning its data.
    #[must_use]
    pub fn into_data(self) -> RowData {
        self.data
    }

    /// Copy of the row data keyed by original field names.
    ///
    /// Fields without a contract entry keep their normalized names; sinks
    /// restoring display headers rely on this view.
    #[must_use]
    pub fn to_original_map(&self) -> BTreeMap<String, Value> {
        self.data
            .iter()
            .map(|(name, value)| {
                let original = self
                    .contract
                    .field(name)
                    .map_or_else(|| name.clone(), |field| field.original_name.clone());
                (original, value.clone())
            })
            .collect()
    }

    /// The contract that produced this row.
    #[must_use]
    pub fn contract(&self) -> &Arc<SchemaContract> {
        &self.contract
    }

    /// Replaces the row's data, keeping its contract.
    #[must_use]
    pub fn with_data(&self, data: RowData) -> Self {
        Self {
            data,
            contract: Arc::clone(&self.contract),
        }
    }

    /// Replaces the row's contract after transform-driven schema evolution.
    #[must_use]
    pub fn with_contract(&self, contract: Arc<SchemaContract>) -> Self {
        Self {
            data: self.data.clone(),
            contract,
        }
    }
}

// ============================================================================
// SECTION: Quarantined Row
// ============================================================================

/// A row diverted out of the main path before gaining a contract.
#[derive(Debug, Clone, PartialEq)]
pub struct QuarantinedRow {
    /// Raw row data keyed by original field name.
    pub row_data: BTreeMap<String, Value>,
    /// Why the row was quarantined.
    pub error_message: String,
    /// The typed violations behind the quarantine.
    pub violations: Vec<ContractViolation>,
    /// Label of the quarantine sink that should receive the row.
    pub destination: String,
}

// ============================================================================
// SECTION: Source Row
// ============================================================================

/// One record emitted by a source: either valid or quarantined.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceRow {
    /// A contract-bearing row entering the main path.
    Valid(PipelineRow),
    /// A contract-less row diverted to a quarantine destination.
    Quarantined(QuarantinedRow),
}

impl SourceRow {
    /// Returns true when the record is quarantined.
    #[must_use]
    pub const fn is_quarantined(&self) -> bool {
        matches!(self, Self::Quarantined(_))
    }
}
