// src/aggregation/engine.rs
//! Checkpointed aggregation engine
//!
//! Computes or continues a named, tag-filtered fold over an agent's event
//! log using the agent's own `initialize`/`reducer`/`serialize` functions,
//! executed through the execution backend. The accumulator stays resident
//! inside the boundary for the whole fold and travels between calls as an
//! opaque handle, so per-call cost is proportional to new events since the
//! last checkpoint, never to total log size.
//!
//! A reducer fault aborts the run with no checkpoint write: a partially
//! applied accumulator is never persisted, and the next run re-folds the
//! same event range from the last good checkpoint.
//!
//! Runs for the same `(agent, name, tag filter)` identity are serialized
//! through a per-identity async lock; the checkpoint read-modify-write is
//! not atomic otherwise.

use crate::boundary::backend::{AggregationStage, BoundaryArg, EntryPoint, ExecutionBackend};
use crate::log::contract::{
    Continuation, ContinuationKind, ContinuationRef, LogQuery, SaveContinuation, UniversalLog,
};
use crate::utils::errors::{EngineError, Result};
use dashmap::DashMap;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Checkpointed aggregation engine
#[derive(Default)]
pub struct Aggregator {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run one aggregation to the current end of the log and return the
    /// serialized result.
    pub async fn run(
        &self,
        backend: &dyn ExecutionBackend,
        log: &dyn UniversalLog,
        agent_id: &str,
        name: &str,
        tags: BTreeMap<String, String>,
    ) -> Result<Value> {
        let key = ContinuationRef {
            agent_id: agent_id.to_string(),
            name: name.to_string(),
            tags: tags.clone(),
        };

        let lock = self
            .locks
            .entry(key.canonical_key())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _identity_guard = lock.lock().await;

        let Continuation {
            last_seen,
            value: prior,
        } = log.get_continuation(&key).await?.unwrap_or(Continuation {
            last_seen: 0,
            value: Value::Null,
        });

        debug!(agent_id, name, last_seen, "Starting aggregation run");

        let mut accumulator = backend
            .invoke_retained(
                &EntryPoint::aggregation(name, AggregationStage::Initialize),
                vec![BoundaryArg::Value(prior)],
            )
            .await?;

        let events = log
            .events_since(&LogQuery {
                agent_id: agent_id.to_string(),
                last_seen,
                tags: tags.clone(),
            })
            .await?;

        let mut latest_seen = last_seen;
        let new_events = events.len();

        for event in events {
            let sequence_id = event.sequence_id;
            let event_value = serde_json::to_value(&event)
                .map_err(|e| EngineError::MarshallingFailed(format!("event encoding: {}", e)))?;

            match backend
                .invoke_retained(
                    &EntryPoint::aggregation(name, AggregationStage::Reducer),
                    vec![
                        BoundaryArg::Handle(accumulator),
                        BoundaryArg::Value(event_value),
                    ],
                )
                .await
            {
                Ok(next) => {
                    accumulator = next;
                    latest_seen = sequence_id;
                }
                Err(e) if e.is_fatal() || matches!(e, EngineError::Disposed) => return Err(e),
                Err(e) => {
                    metrics::counter!("aggregation.aborted").increment(1);
                    let _ = backend.release(accumulator).await;
                    return Err(EngineError::AggregationAborted {
                        name: name.to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }

        let result = backend
            .invoke(
                &EntryPoint::aggregation(name, AggregationStage::Serialize),
                vec![BoundaryArg::Handle(accumulator)],
            )
            .await?;

        log.save_continuation(SaveContinuation {
            agent_id: agent_id.to_string(),
            name: name.to_string(),
            kind: ContinuationKind::Aggregation,
            last_seen: latest_seen,
            value: result.clone(),
            tags,
        })
        .await?;

        metrics::counter!("aggregation.runs").increment(1);
        debug!(agent_id, name, latest_seen, new_events, "Aggregation checkpointed");

        Ok(result)
    }
}
