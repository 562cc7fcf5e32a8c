// elspeth-landscape/src/lib.rs
// ============================================================================
// Module: ELSPETH Landscape Library
// Description: Durable audit store for runs, tokens, states, and outcomes.
// Purpose: Expose the recorder, payload store, checkpointing, and replay.
// Dependencies: crate::{schema, recorder, payload, checkpoint, replay, export}
// ============================================================================

//! ## Overview
//! The landscape is ELSPETH's audit store: an append-mostly SQLite database
//! recording everything a run did, plus a content-addressed payload store for
//! full request/response and row payloads. Every durable write in the engine
//! goes through the [`LandscapeRecorder`]; checkpoint/resume and call replay
//! are thin layers over the same store. Loads fail closed: corrupt rows and
//! unknown enum literals crash the reader rather than being coerced.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod checkpoint;
pub mod export;
pub mod payload;
pub mod recorder;
pub mod replay;
pub mod schema;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use checkpoint::CheckpointManager;
pub use checkpoint::RecoveryManager;
pub use checkpoint::ResumeCheck;
pub use checkpoint::ResumePoint;
pub use export::export_run;
pub use payload::FilesystemPayloadStore;
pub use recorder::DivertSummary;
pub use recorder::LandscapeDb;
pub use recorder::LandscapeError;
pub use recorder::LandscapeRecorder;
pub use schema::initialize_schema;
