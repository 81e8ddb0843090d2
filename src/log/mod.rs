// src/log/mod.rs
//! Universal Log
//!
//! The append-only event stream and checkpoint store the engine consumes:
//!
//! - **Contract**: the `UniversalLog` trait plus record/query types
//! - **Memory**: in-memory implementation for tests and embedding
//! - **Sqlite**: persistent implementation (SQLite, one database)
//!
//! Sequence ids are assigned by the log at append time and are strictly
//! increasing, never reused. Continuations (checkpoints) are keyed by
//! `(agent, computation name, canonical tag filter)`.

pub mod contract;
pub mod memory;
pub mod sqlite;

// Re-export commonly used types
pub use contract::{
    canonical_tag_key, tags_match, AppendEvent, Continuation, ContinuationKind, ContinuationRef,
    EventRecord, LogQuery, SaveContinuation, UniversalLog, TAG_RESOURCE_ID, TAG_TYPE,
};
pub use memory::{MemoryLog, Notification};
pub use sqlite::{SqliteLog, SqliteLogConfig};
