// elspeth-plugins/src/lib.rs
// ============================================================================
// Module: ELSPETH Plugins Library
// Description: Reference sources, sinks, transforms, and client taxonomy.
// Purpose: Provide the concrete plugins the engine ships with.
// Dependencies: crate::{schema_config, sources, sinks, transforms, llm}
// ============================================================================

//! ## Overview
//! Reference plugin implementations: a CSV source with typed schema
//! configuration and quarantine support, CSV/JSONL/JSON-array sinks with
//! durable flush semantics, a field-mapping transform exercising schema
//! evolution, and the LLM client error taxonomy with a deterministic static
//! client for development and tests.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod csv_text;
pub mod llm;
pub mod schema_config;
pub mod sinks;
pub mod sources;
pub mod transforms;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use llm::MockLlmClient;
pub use llm::StaticLlmClient;
pub use llm::authentication_error;
pub use llm::content_policy_error;
pub use llm::context_length_error;
pub use llm::network_error;
pub use llm::rate_limit_error;
pub use llm::server_error;
pub use schema_config::SchemaConfig;
pub use sinks::csv::CsvSink;
pub use sinks::csv::CsvSinkConfig;
pub use sinks::json::JsonArraySink;
pub use sinks::jsonl::JsonlSink;
pub use sources::csv::CsvSource;
pub use sources::csv::CsvSourceConfig;
pub use transforms::field_mapper::FieldMapper;
