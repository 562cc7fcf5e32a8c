// elspeth-core/src/core/contract.rs
// ============================================================================
// Module: ELSPETH Schema Contracts
// Description: Typed field contracts with inference, locking, and validation.
// Purpose: Enforce row shape guarantees at every pipeline stage.
// Dependencies: serde, serde_json, crate::core::{canonical, value}
// ============================================================================

//! ## Overview
//! A schema contract is the typed row shape for a stage. `FIXED` contracts
//! declare every field up front and reject extras; `FLEXIBLE` contracts
//! declare some fields and lock the rest in from the first row; `OBSERVED`
//! contracts infer everything from the first row. Once locked, a contract
//! validates each subsequent row and its `version_hash` becomes part of the
//! audit trail; resume verifies the hash against a recomputation and fails
//! closed on mismatch.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

use crate::core::canonical::CanonicalError;
use crate::core::canonical::stable_hash_raw;
use crate::core::errors::SourceFieldError;
use crate::core::value::RowData;
use crate::core::value::Value;

// ============================================================================
// SECTION: Schema Mode
// ============================================================================

/// Contract discovery mode for a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchemaMode {
    /// All fields declared ahead of time; extras rejected.
    Fixed,
    /// Some fields declared; extras discovered from the first row and locked.
    Flexible,
    /// No fields declared; everything inferred from the first row and locked.
    Observed,
}

impl SchemaMode {
    /// Returns the stable storage literal for the mode.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Fixed => "FIXED",
            Self::Flexible => "FLEXIBLE",
            Self::Observed => "OBSERVED",
        }
    }

    /// Parses a stored literal, rejecting unknown values.
    ///
    /// # Errors
    ///
    /// Returns [`ContractError::UnknownLiteral`] for literals not produced by
    /// [`SchemaMode::as_str`].
    pub fn parse(literal: &str) -> Result<Self, ContractError> {
        match literal {
            "FIXED" => Ok(Self::Fixed),
            "FLEXIBLE" => Ok(Self::Flexible),
            "OBSERVED" => Ok(Self::Observed),
            other => Err(ContractError::UnknownLiteral {
                kind: "schema mode",
                literal: other.to_string(),
            }),
        }
    }
}

// ============================================================================
// SECTION: Field Types
// ============================================================================

/// Declared or inferred type of a contract field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    /// Nullable-only field (every observed value was null).
    Null,
    /// Boolean.
    Bool,
    /// 64-bit signed integer.
    Int,
    /// IEEE 754 double.
    Float,
    /// Exact decimal.
    Decimal,
    /// UTF-8 text.
    Text,
    /// Raw bytes.
    Bytes,
    /// Calendar date.
    Date,
    /// Instant in time.
    DateTime,
    /// Ordered list.
    Array,
    /// String-keyed mapping.
    Map,
    /// Accepts any value.
    Any,
}

impl FieldType {
    /// Returns the stable storage literal for the type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Float => "float",
            Self::Decimal => "decimal",
            Self::Text => "str",
            Self::Bytes => "bytes",
            Self::Date => "date",
            Self::DateTime => "datetime",
            Self::Array => "list",
            Self::Map => "dict",
            Self::Any => "any",
        }
    }

    /// Parses a stored literal, rejecting unknown values.
    ///
    /// # Errors
    ///
    /// Returns [`ContractError::UnknownLiteral`] for literals not produced by
    /// [`FieldType::as_str`].
    pub fn parse(literal: &str) -> Result<Self, ContractError> {
        match literal {
            "null" => Ok(Self::Null),
            "bool" => Ok(Self::Bool),
            "int" => Ok(Self::Int),
            "float" => Ok(Self::Float),
            "decimal" => Ok(Self::Decimal),
            "str" => Ok(Self::Text),
            "bytes" => Ok(Self::Bytes),
            "date" => Ok(Self::Date),
            "datetime" => Ok(Self::DateTime),
            "list" => Ok(Self::Array),
            "dict" => Ok(Self::Map),
            "any" => Ok(Self::Any),
            other => Err(ContractError::UnknownLiteral {
                kind: "field type",
                literal: other.to_string(),
            }),
        }
    }

    /// Infers the field type of an observed value.
    ///
    /// Wide integers infer as `int`: the width is a property of the value,
    /// not the field.
    #[must_use]
    pub const fn infer(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(_) => Self::Bool,
            Value::Int(_) | Value::BigInt(_) => Self::Int,
            Value::Float(_) => Self::Float,
            Value::Decimal(_) => Self::Decimal,
            Value::Text(_) => Self::Text,
            Value::Bytes(_) => Self::Bytes,
            Value::Date(_) => Self::Date,
            Value::DateTime(_) => Self::DateTime,
            Value::Array(_) => Self::Array,
            Value::Map(_) => Self::Map,
        }
    }

    /// Returns true when the value is an instance of this type.
    ///
    /// `Any` accepts everything; `Null` accepts only null; `Int` accepts
    /// both 64-bit and wide integers. All other types match exactly, with no
    /// cross-type coercion.
    #[must_use]
    pub const fn matches(self, value: &Value) -> bool {
        match self {
            Self::Any => true,
            Self::Null => matches!(value, Value::Null),
            Self::Bool => matches!(value, Value::Bool(_)),
            Self::Int => matches!(value, Value::Int(_) | Value::BigInt(_)),
            Self::Float => matches!(value, Value::Float(_)),
            Self::Decimal => matches!(value, Value::Decimal(_)),
            Self::Text => matches!(value, Value::Text(_)),
            Self::Bytes => matches!(value, Value::Bytes(_)),
            Self::Date => matches!(value, Value::Date(_)),
            Self::DateTime => matches!(value, Value::DateTime(_)),
            Self::Array => matches!(value, Value::Array(_)),
            Self::Map => matches!(value, Value::Map(_)),
        }
    }
}

// ============================================================================
// SECTION: Field Contract
// ============================================================================

/// Provenance of a contract field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldSource {
    /// Declared ahead of time in configuration.
    Declared,
    /// Inferred from the first observed row.
    Inferred,
}

impl FieldSource {
    /// Returns the stable storage literal for the source.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Declared => "declared",
            Self::Inferred => "inferred",
        }
    }
}

/// One typed field within a schema contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldContract {
    /// Normalized field name used throughout the pipeline.
    pub normalized_name: String,
    /// Original field name as emitted by the source.
    pub original_name: String,
    /// Declared or inferred type.
    pub field_type: FieldType,
    /// Whether the field must be present in every row.
    pub required: bool,
    /// Declared versus inferred provenance.
    pub source: FieldSource,
}

impl FieldContract {
    /// Creates a declared, required field with matching names.
    #[must_use]
    pub fn declared(name: impl Into<String>, field_type: FieldType) -> Self {
        let name = name.into();
        Self {
            normalized_name: name.clone(),
            original_name: name,
            field_type,
            required: true,
            source: FieldSource::Declared,
        }
    }

    /// Canonical JSON cell for version hashing.
    fn hash_cell(&self) -> serde_json::Value {
        json!({
            "normalized_name": self.normalized_name,
            "original_name": self.original_name,
            "type": self.field_type.as_str(),
            "required": self.required,
            "source": self.source.as_str(),
        })
    }
}

// ============================================================================
// SECTION: Errors & Violations
// ============================================================================

/// Errors raised by contract construction and integrity verification.
#[derive(Debug, Error)]
pub enum ContractError {
    /// A stored literal did not map to a known enum variant.
    #[error("unknown {kind} literal '{literal}' in stored contract")]
    UnknownLiteral {
        /// Which enum the literal belonged to.
        kind: &'static str,
        /// The offending literal.
        literal: String,
    },
    /// The embedded version hash did not match a recomputation.
    #[error("contract integrity violation: stored version_hash {stored} != recomputed {recomputed}")]
    IntegrityMismatch {
        /// Hash embedded in the stored contract.
        stored: String,
        /// Hash recomputed from the stored fields.
        recomputed: String,
    },
    /// Stored contract JSON could not be decoded.
    #[error("malformed contract json: {0}")]
    Malformed(String),
    /// Canonicalization failed while hashing the contract.
    #[error(transparent)]
    Canonical(#[from] CanonicalError),
}

/// A single validation failure for one row against a locked contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "violation", rename_all = "snake_case")]
pub enum ContractViolation {
    /// A required field was absent.
    MissingField {
        /// Normalized name of the missing field.
        field: String,
    },
    /// A field's value did not match its declared type.
    TypeMismatch {
        /// Normalized name of the field.
        field: String,
        /// Declared type literal.
        expected: String,
        /// Observed value kind.
        actual: String,
    },
    /// An undeclared field appeared under a `FIXED` contract.
    UnexpectedField {
        /// Normalized name of the unexpected field.
        field: String,
    },
}

impl ContractViolation {
    /// Human-readable message for quarantine records.
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::MissingField { field } => format!("required field '{field}' is missing"),
            Self::TypeMismatch {
                field,
                expected,
                actual,
            } => {
                format!("field '{field}' expected {expected}, got {actual}")
            }
            Self::UnexpectedField { field } => {
                format!("unexpected field '{field}' for fixed schema")
            }
        }
    }
}

// ============================================================================
// SECTION: Schema Contract
// ============================================================================

/// The typed row shape for a pipeline stage.
///
/// # Invariants
/// - `version_hash` always equals the recomputation over `mode` and `fields`.
/// - Once `locked`, the field set never changes except through explicit
///   transform-driven evolution, which produces a new contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaContract {
    /// Contract discovery mode.
    pub mode: SchemaMode,
    /// Whether the field set is final.
    pub locked: bool,
    /// Ordered field contracts.
    pub fields: Vec<FieldContract>,
    /// Stable hash over the canonical field tuple and mode.
    pub version_hash: String,
}

impl SchemaContract {
    /// Creates a contract from declared fields, computing its version hash.
    ///
    /// `OBSERVED` contracts start with no fields and lock on the first row.
    ///
    /// # Errors
    ///
    /// Returns [`ContractError::Canonical`] when hashing fails.
    pub fn new(
        mode: SchemaMode,
        fields: Vec<FieldContract>,
        locked: bool,
    ) -> Result<Self, ContractError> {
        let version_hash = Self::compute_version_hash(mode, &fields)?;
        Ok(Self {
            mode,
            locked,
            fields,
            version_hash,
        })
    }

    /// Computes the version hash over the canonical field tuple and mode.
    ///
    /// # Errors
    ///
    /// Returns [`ContractError::Canonical`] when hashing fails.
    pub fn compute_version_hash(
        mode: SchemaMode,
        fields: &[FieldContract],
    ) -> Result<String, ContractError> {
        let cells: Vec<serde_json::Value> = fields.iter().map(FieldContract::hash_cell).collect();
        Ok(stable_hash_raw(&json!({
            "mode": mode.as_str(),
            "fields": cells,
        }))?)
    }

    /// Verifies the embedded version hash against a recomputation.
    ///
    /// # Errors
    ///
    /// Returns [`ContractError::IntegrityMismatch`] when the stored hash does
    /// not match.
    pub fn verify_integrity(&self) -> Result<(), ContractError> {
        let recomputed = Self::compute_version_hash(self.mode, &self.fields)?;
        if recomputed == self.version_hash {
            Ok(())
        } else {
            Err(ContractError::IntegrityMismatch {
                stored: self.version_hash.clone(),
                recomputed,
            })
        }
    }

    /// Looks up a field by normalized name.
    #[must_use]
    pub fn field(&self, normalized_name: &str) -> Option<&FieldContract> {
        self.fields.iter().find(|field| field.normalized_name == normalized_name)
    }

    /// Returns the normalized-to-original name mapping.
    #[must_use]
    pub fn name_resolution(&self) -> BTreeMap<String, String> {
        self.fields
            .iter()
            .map(|field| (field.normalized_name.clone(), field.original_name.clone()))
            .collect()
    }

    /// Merges another contract into this one for mixed batches.
    ///
    /// Fields present in both keep this contract's name lineage; a type
    /// conflict widens to `Any` so the merged contract accepts both shapes.
    ///
    /// # Errors
    ///
    /// Returns [`ContractError::Canonical`] when rehashing fails.
    pub fn merge(&self, other: &Self) -> Result<Self, ContractError> {
        let mut fields = self.fields.clone();
        for incoming in &other.fields {
            match fields.iter_mut().find(|field| field.normalized_name == incoming.normalized_name)
            {
                Some(existing) => {
                    if existing.field_type != incoming.field_type {
                        existing.field_type = FieldType::Any;
                    }
                    existing.required = existing.required && incoming.required;
                }
                None => fields.push(incoming.clone()),
            }
        }
        Self::new(self.mode, fields, self.locked && other.locked)
    }

    /// Validates one row against a locked contract.
    ///
    /// Checks that every required field is present, that present values match
    /// their declared types (null is accepted for non-required fields), and,
    /// for `FIXED` contracts, that no undeclared fields appear.
    #[must_use]
    pub fn validate_row(&self, row: &RowData) -> Vec<ContractViolation> {
        let mut violations = Vec::new();
        for field in &self.fields {
            match row.get(&field.normalized_name) {
                None => {
                    if field.required {
                        violations.push(ContractViolation::MissingField {
                            field: field.normalized_name.clone(),
                        });
                    }
                }
                Some(value) => {
                    let nullable_ok = value.is_null() && !field.required;
                    if !nullable_ok && !field.field_type.matches(value) {
                        violations.push(ContractViolation::TypeMismatch {
                            field: field.normalized_name.clone(),
                            expected: field.field_type.as_str().to_string(),
                            actual: value.kind_name().to_string(),
                        });
                    }
                }
            }
        }
        if self.mode == SchemaMode::Fixed {
            for name in row.keys() {
                if self.field(name).is_none() {
                    violations.push(ContractViolation::UnexpectedField {
                        field: name.clone(),
                    });
                }
            }
        }
        violations
    }
}

// ============================================================================
// SECTION: Contract Builder
// ============================================================================

/// First-row contract locking.
pub struct ContractBuilder;

impl ContractBuilder {
    /// Locks a contract from the first observed row.
    ///
    /// Declared fields keep their declared types; undeclared row fields are
    /// resolved through `resolution` (original name to normalized name) and
    /// inferred as optional. A row field absent from the resolution map is a
    /// source-plugin bug and is rejected outright. Already-locked contracts
    /// are returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`SourceFieldError`] for unresolvable row fields and
    /// [`ContractError`] when the locked contract cannot be hashed.
    pub fn lock_from_first_row(
        contract: &SchemaContract,
        row: &RowData,
        resolution: &BTreeMap<String, String>,
    ) -> Result<SchemaContract, ContractLockError> {
        if contract.locked {
            return Ok(contract.clone());
        }

        let mut fields = contract.fields.clone();
        for (original_name, value) in row {
            let normalized = resolution.get(original_name).ok_or_else(|| SourceFieldError {
                field: original_name.clone(),
            })?;
            if contract.field(normalized).is_some() {
                continue;
            }
            if contract.mode == SchemaMode::Fixed {
                // Fixed contracts never grow; validate_row flags the extra.
                continue;
            }
            fields.push(FieldContract {
                normalized_name: normalized.clone(),
                original_name: original_name.clone(),
                field_type: FieldType::infer(value),
                required: false,
                source: FieldSource::Inferred,
            });
        }

        Ok(SchemaContract::new(contract.mode, fields, true)?)
    }
}

/// Errors raised while locking a contract from the first row.
#[derive(Debug, Error)]
pub enum ContractLockError {
    /// A row field had no entry in the source's resolution map.
    #[error(transparent)]
    SourceField(#[from] SourceFieldError),
    /// Hashing the locked contract failed.
    #[error(transparent)]
    Contract(#[from] ContractError),
}

// ============================================================================
// SECTION: Audit Record
// ============================================================================

/// Serialized form of a contract as embedded in run and node rows.
///
/// The `version_hash` is stored inside the JSON so tampering is detectable by
/// recomputation on read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractAuditRecord {
    /// Schema mode literal.
    pub mode: String,
    /// Whether the contract was locked when recorded.
    pub locked: bool,
    /// Field cells in contract order.
    pub fields: Vec<FieldAuditCell>,
    /// Embedded version hash.
    pub version_hash: String,
}

/// One field cell inside a [`ContractAuditRecord`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldAuditCell {
    /// Normalized field name.
    pub normalized_name: String,
    /// Original field name.
    pub original_name: String,
    /// Field type literal.
    #[serde(rename = "type")]
    pub field_type: String,
    /// Whether the field is required.
    pub required: bool,
    /// Provenance literal.
    pub source: String,
}

impl ContractAuditRecord {
    /// Builds the audit record for a contract.
    #[must_use]
    pub fn from_contract(contract: &SchemaContract) -> Self {
        Self {
            mode: contract.mode.as_str().to_string(),
            locked: contract.locked,
            fields: contract
                .fields
                .iter()
                .map(|field| FieldAuditCell {
                    normalized_name: field.normalized_name.clone(),
                    original_name: field.original_name.clone(),
                    field_type: field.field_type.as_str().to_string(),
                    required: field.required,
                    source: field.source.as_str().to_string(),
                })
                .collect(),
            version_hash: contract.version_hash.clone(),
        }
    }

    /// Serializes the record to JSON for storage.
    ///
    /// # Errors
    ///
    /// Returns [`ContractError::Malformed`] when serialization fails.
    pub fn to_json(&self) -> Result<String, ContractError> {
        serde_json::to_string(self).map_err(|err| ContractError::Malformed(err.to_string()))
    }

    /// Decodes a stored record from JSON.
    ///
    /// # Errors
    ///
    /// Returns [`ContractError::Malformed`] when decoding fails.
    pub fn from_json(raw: &str) -> Result<Self, ContractError> {
        serde_json::from_str(raw).map_err(|err| ContractError::Malformed(err.to_string()))
    }

    /// Reconstructs the typed contract, preserving the stored hash.
    ///
    /// The stored hash is carried through unchanged; use
    /// [`SchemaContract::verify_integrity`] to detect tampering.
    ///
    /// # Errors
    ///
    /// Returns [`ContractError::UnknownLiteral`] for unknown mode, type, or
    /// source literals.
    pub fn to_contract(&self) -> Result<SchemaContract, ContractError> {
        let mode = SchemaMode::parse(&self.mode)?;
        let mut fields = Vec::with_capacity(self.fields.len());
        for cell in &self.fields {
            let source = match cell.source.as_str() {
                "declared" => FieldSource::Declared,
                "inferred" => FieldSource::Inferred,
                other => {
                    return Err(ContractError::UnknownLiteral {
                        kind: "field source",
                        literal: other.to_string(),
                    });
                }
            };
            fields.push(FieldContract {
                normalized_name: cell.normalized_name.clone(),
                original_name: cell.original_name.clone(),
                field_type: FieldType::parse(&cell.field_type)?,
                required: cell.required,
                source,
            });
        }
        Ok(SchemaContract {
            mode,
            locked: self.locked,
            fields,
            version_hash: self.version_hash.clone(),
        })
    }
}
