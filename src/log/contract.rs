// src/log/contract.rs
//! Universal Log contract
//!
//! The append-only event stream and checkpoint store every agent writes
//! through. Implementations assign monotonic sequence ids at append time;
//! readers see events in append order, filtered by agent and tag subset.

use crate::utils::errors::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Reserved tag carrying the event type.
pub const TAG_TYPE: &str = "_type";

/// Reserved tag carrying the correlating resource id.
pub const TAG_RESOURCE_ID: &str = "_resourceId";

/// One event in the log. Immutable once appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    /// Owning agent
    pub agent_id: String,

    /// Monotonic ordering key, assigned by the log on append. Starts at 1,
    /// strictly increasing, never reused.
    pub sequence_id: u64,

    /// Event type (also present as the `_type` tag)
    pub event_type: String,

    /// Opaque payload
    pub payload: serde_json::Value,

    /// Tag map used for filtered reads
    pub tags: BTreeMap<String, String>,

    /// Optional correlating resource
    pub resource_id: Option<String>,

    /// Append timestamp
    pub inserted_at: DateTime<Utc>,
}

/// Parameters for appending an event.
#[derive(Debug, Clone)]
pub struct AppendEvent {
    pub agent_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub tags: BTreeMap<String, String>,
    pub resource_id: Option<String>,
}

/// A filtered read position: events for `agent_id` with sequence id
/// strictly greater than `last_seen`, carrying every tag in `tags`.
#[derive(Debug, Clone, Default)]
pub struct LogQuery {
    pub agent_id: String,
    pub last_seen: u64,
    pub tags: BTreeMap<String, String>,
}

/// Why a continuation exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContinuationKind {
    Aggregation,
    Trigger,
}

/// A persisted checkpoint: the highest sequence id folded so far and the
/// serialized accumulator at that point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Continuation {
    pub last_seen: u64,
    pub value: serde_json::Value,
}

/// Identity of a continuation: agent, computation name, tag filter.
#[derive(Debug, Clone)]
pub struct ContinuationRef {
    pub agent_id: String,
    pub name: String,
    pub tags: BTreeMap<String, String>,
}

impl ContinuationRef {
    /// Canonical identity string. Tags serialize sorted (`BTreeMap`), so two
    /// filters with the same entries in any order share one checkpoint.
    pub fn canonical_key(&self) -> String {
        format!("{}:{}:{}", self.agent_id, self.name, canonical_tag_key(&self.tags))
    }
}

/// Parameters for saving a continuation.
#[derive(Debug, Clone)]
pub struct SaveContinuation {
    pub agent_id: String,
    pub name: String,
    pub kind: ContinuationKind,
    pub last_seen: u64,
    pub value: serde_json::Value,
    pub tags: BTreeMap<String, String>,
}

impl SaveContinuation {
    pub fn continuation_ref(&self) -> ContinuationRef {
        ContinuationRef {
            agent_id: self.agent_id.clone(),
            name: self.name.clone(),
            tags: self.tags.clone(),
        }
    }
}

/// Order-independent serialization of a tag map.
pub fn canonical_tag_key(tags: &BTreeMap<String, String>) -> String {
    serde_json::to_string(tags).unwrap_or_else(|_| "{}".to_string())
}

/// Subset match: the event must carry every filter key with the same value.
/// Extra event tags are ignored.
pub fn tags_match(filter: &BTreeMap<String, String>, tags: &BTreeMap<String, String>) -> bool {
    filter.iter().all(|(key, value)| tags.get(key) == Some(value))
}

/// The Universal Log collaborator.
#[async_trait]
pub trait UniversalLog: Send + Sync {
    /// Append an event, assigning the next sequence id.
    async fn append_to_log(&self, event: AppendEvent) -> Result<()>;

    /// Matching events in ascending sequence order.
    async fn events_since(&self, query: &LogQuery) -> Result<Vec<EventRecord>>;

    /// Drive a per-event processor over `events_since`, in order.
    async fn process_logs_since(
        &self,
        query: &LogQuery,
        processor: &mut (dyn for<'e> FnMut(&'e EventRecord) + Send),
    ) -> Result<()> {
        for event in self.events_since(query).await? {
            processor(&event);
        }
        Ok(())
    }

    /// Unfiltered event listing for inspection/debugging.
    async fn events(&self, agent_id: Option<&str>) -> Result<Vec<EventRecord>>;

    /// Load a checkpoint, or `None` if this identity has never run.
    async fn get_continuation(&self, key: &ContinuationRef) -> Result<Option<Continuation>>;

    /// Overwrite the checkpoint for an identity.
    async fn save_continuation(&self, save: SaveContinuation) -> Result<()>;

    /// Mint an opaque resource identifier.
    async fn create_resource(&self) -> Result<String>;

    /// User-facing side channel outside the event log.
    async fn create_notification(&self, agent_id: &str, message: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_tags_match_subset() {
        let filter = tags(&[("_type", "order_created")]);
        let event_tags = tags(&[("_type", "order_created"), ("_resourceId", "r1")]);
        assert!(tags_match(&filter, &event_tags));
    }

    #[test]
    fn test_tags_match_rejects_wrong_value() {
        let filter = tags(&[("_type", "order_created")]);
        let event_tags = tags(&[("_type", "order_cancelled")]);
        assert!(!tags_match(&filter, &event_tags));
    }

    #[test]
    fn test_tags_match_empty_filter_matches_all() {
        let filter = BTreeMap::new();
        let event_tags = tags(&[("a", "1")]);
        assert!(tags_match(&filter, &event_tags));
        assert!(tags_match(&filter, &BTreeMap::new()));
    }

    #[test]
    fn test_canonical_key_is_order_independent() {
        let mut a = BTreeMap::new();
        a.insert("x".to_string(), "1".to_string());
        a.insert("y".to_string(), "2".to_string());

        let mut b = BTreeMap::new();
        b.insert("y".to_string(), "2".to_string());
        b.insert("x".to_string(), "1".to_string());

        let ref_a = ContinuationRef {
            agent_id: "a1".into(),
            name: "sum".into(),
            tags: a,
        };
        let ref_b = ContinuationRef {
            agent_id: "a1".into(),
            name: "sum".into(),
            tags: b,
        };
        assert_eq!(ref_a.canonical_key(), ref_b.canonical_key());
    }
}
