// src/log/memory.rs
//! In-memory Universal Log
//!
//! Reference implementation for tests and single-process embedding. Events
//! live in a vector guarded by a read-write lock; continuations in a
//! concurrent map keyed by canonical identity.

use crate::log::contract::{
    tags_match, AppendEvent, Continuation, ContinuationRef, EventRecord, LogQuery,
    SaveContinuation, UniversalLog,
};
use crate::utils::errors::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::debug;
use ulid::Ulid;

/// A message surfaced to the owning user outside the event log.
#[derive(Debug, Clone)]
pub struct Notification {
    pub agent_id: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// In-memory Universal Log
#[derive(Default)]
pub struct MemoryLog {
    events: RwLock<Vec<EventRecord>>,
    continuations: DashMap<String, Continuation>,
    notifications: RwLock<Vec<Notification>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Notifications recorded so far (inspection helper).
    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications.read().clone()
    }
}

#[async_trait]
impl UniversalLog for MemoryLog {
    async fn append_to_log(&self, event: AppendEvent) -> Result<()> {
        let mut events = self.events.write();
        let sequence_id = events.len() as u64 + 1;
        debug!(agent_id = %event.agent_id, sequence_id, event_type = %event.event_type, "Appending event");
        events.push(EventRecord {
            agent_id: event.agent_id,
            sequence_id,
            event_type: event.event_type,
            payload: event.payload,
            tags: event.tags,
            resource_id: event.resource_id,
            inserted_at: Utc::now(),
        });
        metrics::counter!("log.events_appended").increment(1);
        Ok(())
    }

    async fn events_since(&self, query: &LogQuery) -> Result<Vec<EventRecord>> {
        let events = self.events.read();
        Ok(events
            .iter()
            .filter(|evt| {
                evt.sequence_id > query.last_seen
                    && evt.agent_id == query.agent_id
                    && tags_match(&query.tags, &evt.tags)
            })
            .cloned()
            .collect())
    }

    async fn events(&self, agent_id: Option<&str>) -> Result<Vec<EventRecord>> {
        let events = self.events.read();
        Ok(events
            .iter()
            .filter(|evt| agent_id.map_or(true, |id| evt.agent_id == id))
            .cloned()
            .collect())
    }

    async fn get_continuation(&self, key: &ContinuationRef) -> Result<Option<Continuation>> {
        Ok(self
            .continuations
            .get(&key.canonical_key())
            .map(|entry| entry.clone()))
    }

    async fn save_continuation(&self, save: SaveContinuation) -> Result<()> {
        let key = save.continuation_ref().canonical_key();
        self.continuations.insert(
            key,
            Continuation {
                last_seen: save.last_seen,
                value: save.value,
            },
        );
        Ok(())
    }

    async fn create_resource(&self) -> Result<String> {
        Ok(Ulid::new().to_string())
    }

    async fn create_notification(&self, agent_id: &str, message: &str) -> Result<()> {
        self.notifications.write().push(Notification {
            agent_id: agent_id.to_string(),
            message: message.to_string(),
            created_at: Utc::now(),
        });
        Ok(())
    }
}
