// src/log/sqlite.rs
//! SQLite-backed Universal Log
//!
//! Stores events and continuations in a single SQLite database. The events
//! table's AUTOINCREMENT primary key doubles as the monotonic sequence id
//! (never reused, strictly increasing in append order).

use crate::log::contract::{
    canonical_tag_key, tags_match, AppendEvent, Continuation, ContinuationRef, EventRecord,
    LogQuery, SaveContinuation, UniversalLog,
};
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info};
use ulid::Ulid;

/// Storage configuration
#[derive(Debug, Clone)]
pub struct SqliteLogConfig {
    /// Base directory for the database
    pub base_dir: PathBuf,

    /// Database file name
    pub db_name: String,
}

impl Default for SqliteLogConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("~/.warden"),
            db_name: "log.db".to_string(),
        }
    }
}

/// SQLite-backed Universal Log
pub struct SqliteLog {
    config: SqliteLogConfig,
    db: Arc<Mutex<Connection>>,
}

impl SqliteLog {
    /// Open (or create) the log database.
    pub async fn new(config: SqliteLogConfig) -> Result<Self> {
        fs::create_dir_all(&config.base_dir).await.map_err(|e| {
            EngineError::StorageFailed(format!("Failed to create directory: {}", e))
        })?;

        let db_path = config.base_dir.join(&config.db_name);
        let conn = Connection::open(&db_path)
            .map_err(|e| EngineError::StorageFailed(format!("Failed to open database: {}", e)))?;

        let log = Self {
            config,
            db: Arc::new(Mutex::new(conn)),
        };

        log.init_schema().await?;

        info!("Universal log opened at {:?}", log.config.base_dir);

        Ok(log)
    }

    /// Initialize database schema
    async fn init_schema(&self) -> Result<()> {
        let db = self.db.lock().await;

        db.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                sequence_id INTEGER PRIMARY KEY AUTOINCREMENT,
                agent_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                tags TEXT NOT NULL,
                resource_id TEXT,
                inserted_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_events_agent ON events(agent_id, sequence_id);

            CREATE TABLE IF NOT EXISTS continuations (
                agent_id TEXT NOT NULL,
                name TEXT NOT NULL,
                tags_key TEXT NOT NULL,
                kind TEXT NOT NULL,
                last_seen INTEGER NOT NULL,
                value TEXT,
                PRIMARY KEY (agent_id, name, tags_key)
            );

            CREATE TABLE IF NOT EXISTS notifications (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                agent_id TEXT NOT NULL,
                message TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            "#,
        )
        .map_err(|e| EngineError::StorageFailed(format!("Schema creation failed: {}", e)))?;

        Ok(())
    }

    fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<EventRecord> {
        let sequence_id: i64 = row.get(0)?;
        let payload: String = row.get(3)?;
        let tags: String = row.get(4)?;
        let inserted_at: String = row.get(6)?;
        Ok(EventRecord {
            sequence_id: sequence_id as u64,
            agent_id: row.get(1)?,
            event_type: row.get(2)?,
            payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
            tags: serde_json::from_str(&tags).unwrap_or_default(),
            resource_id: row.get(5)?,
            inserted_at: inserted_at.parse().unwrap_or_else(|_| Utc::now()),
        })
    }
}

#[async_trait]
impl UniversalLog for SqliteLog {
    async fn append_to_log(&self, event: AppendEvent) -> Result<()> {
        let payload = serde_json::to_string(&event.payload)
            .map_err(|e| EngineError::StorageFailed(format!("Payload encoding failed: {}", e)))?;
        let tags = canonical_tag_key(&event.tags);

        let db = self.db.lock().await;
        db.execute(
            r#"
            INSERT INTO events (agent_id, event_type, payload, tags, resource_id, inserted_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
            params![
                event.agent_id,
                event.event_type,
                payload,
                tags,
                event.resource_id,
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(|e| EngineError::StorageFailed(format!("Append failed: {}", e)))?;

        debug!(agent_id = %event.agent_id, event_type = %event.event_type, "Appended event");
        metrics::counter!("log.events_appended").increment(1);

        Ok(())
    }

    async fn events_since(&self, query: &LogQuery) -> Result<Vec<EventRecord>> {
        let db = self.db.lock().await;

        let mut stmt = db
            .prepare(
                r#"
                SELECT sequence_id, agent_id, event_type, payload, tags, resource_id, inserted_at
                FROM events
                WHERE agent_id = ? AND sequence_id > ?
                ORDER BY sequence_id
                "#,
            )
            .map_err(|e| EngineError::StorageFailed(format!("Query preparation failed: {}", e)))?;

        let events = stmt
            .query_map(
                params![query.agent_id, query.last_seen as i64],
                Self::row_to_event,
            )
            .map_err(|e| EngineError::StorageFailed(format!("Query execution failed: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| EngineError::StorageFailed(format!("Row decoding failed: {}", e)))?;

        Ok(events
            .into_iter()
            .filter(|evt| tags_match(&query.tags, &evt.tags))
            .collect())
    }

    async fn events(&self, agent_id: Option<&str>) -> Result<Vec<EventRecord>> {
        let query = LogQuery {
            agent_id: agent_id.unwrap_or_default().to_string(),
            last_seen: 0,
            tags: BTreeMap::new(),
        };
        if agent_id.is_some() {
            return self.events_since(&query).await;
        }

        let db = self.db.lock().await;
        let mut stmt = db
            .prepare(
                r#"
                SELECT sequence_id, agent_id, event_type, payload, tags, resource_id, inserted_at
                FROM events ORDER BY sequence_id
                "#,
            )
            .map_err(|e| EngineError::StorageFailed(format!("Query preparation failed: {}", e)))?;

        let events = stmt
            .query_map([], Self::row_to_event)
            .map_err(|e| EngineError::StorageFailed(format!("Query execution failed: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| EngineError::StorageFailed(format!("Row decoding failed: {}", e)));
        events
    }

    async fn get_continuation(&self, key: &ContinuationRef) -> Result<Option<Continuation>> {
        let db = self.db.lock().await;
        let result = db.query_row(
            "SELECT last_seen, value FROM continuations WHERE agent_id = ? AND name = ? AND tags_key = ?",
            params![key.agent_id, key.name, canonical_tag_key(&key.tags)],
            |row| {
                let last_seen: i64 = row.get(0)?;
                let value: Option<String> = row.get(1)?;
                Ok(Continuation {
                    last_seen: last_seen as u64,
                    value: value
                        .and_then(|v| serde_json::from_str(&v).ok())
                        .unwrap_or(serde_json::Value::Null),
                })
            },
        );

        match result {
            Ok(continuation) => Ok(Some(continuation)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(EngineError::StorageFailed(format!(
                "Continuation lookup failed: {}",
                e
            ))),
        }
    }

    async fn save_continuation(&self, save: SaveContinuation) -> Result<()> {
        let value = serde_json::to_string(&save.value)
            .map_err(|e| EngineError::StorageFailed(format!("Value encoding failed: {}", e)))?;
        let kind = match save.kind {
            crate::log::contract::ContinuationKind::Aggregation => "aggregation",
            crate::log::contract::ContinuationKind::Trigger => "trigger",
        };

        let db = self.db.lock().await;
        db.execute(
            r#"
            INSERT INTO continuations (agent_id, name, tags_key, kind, last_seen, value)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(agent_id, name, tags_key)
            DO UPDATE SET kind = excluded.kind, last_seen = excluded.last_seen, value = excluded.value
            "#,
            params![
                save.agent_id,
                save.name,
                canonical_tag_key(&save.tags),
                kind,
                save.last_seen as i64,
                value,
            ],
        )
        .map_err(|e| EngineError::StorageFailed(format!("Continuation save failed: {}", e)))?;

        Ok(())
    }

    async fn create_resource(&self) -> Result<String> {
        Ok(Ulid::new().to_string())
    }

    async fn create_notification(&self, agent_id: &str, message: &str) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO notifications (agent_id, message, created_at) VALUES (?, ?, ?)",
            params![agent_id, message, Utc::now().to_rfc3339()],
        )
        .map_err(|e| EngineError::StorageFailed(format!("Notification insert failed: {}", e)))?;
        Ok(())
    }
}
