// src/aggregation/mod.rs
//! Aggregation engine
//!
//! Incremental, checkpointed folds over the event log. Each run loads the
//! last continuation, folds only the events appended since, and persists a
//! new `(last_seen, value)` pair — see [`engine::Aggregator`].

pub mod engine;

pub use engine::Aggregator;
