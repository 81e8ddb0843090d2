// src/scheduler/job.rs
//! Job types for the deferred-work scheduler

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Payload of a one-shot deferred action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionPayload {
    pub user_id: String,
    pub agent_id: String,
    pub action_key: String,
    pub params: serde_json::Value,
}

/// Payload of a recurring cron job. Re-armed after every run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronPayload {
    pub user_id: String,
    pub agent_id: String,
    pub action_key: String,

    /// Cron expression (seconds-resolution, e.g. `"0 * * * * *"`)
    pub schedule: String,

    /// Retry ceiling carried into each re-armed instance
    pub max_attempts: Option<u32>,
}

/// What a job does when dispatched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum JobTask {
    RunAction(ActionPayload),
    Cron(CronPayload),
}

impl JobTask {
    pub fn kind(&self) -> &'static str {
        match self {
            JobTask::RunAction(_) => "run-action",
            JobTask::Cron(_) => "cron",
        }
    }
}

/// A unit of deferred work in the active set.
#[derive(Debug, Clone)]
pub struct Job {
    /// Unique among active jobs at any instant
    pub key: String,

    pub task: JobTask,

    /// Earliest dispatch time
    pub run_at: DateTime<Utc>,

    /// Failed runs so far
    pub attempts: u32,

    /// Dropped without dispatch once `attempts` reaches this
    pub max_attempts: u32,
}

/// Caller-supplied scheduling options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerOptions {
    /// Pin an explicit key for idempotent re-scheduling
    pub job_key: Option<String>,

    /// Override the default retry ceiling
    pub max_attempts: Option<u32>,
}

/// Parameters for inserting a job into the active set.
#[derive(Debug, Clone)]
pub struct AddJob {
    pub task: JobTask,
    pub run_at: DateTime<Utc>,

    /// Explicit key; generated when absent
    pub key: Option<String>,

    /// Retry ceiling; scheduler default when absent
    pub max_attempts: Option<u32>,
}

/// The Job Manager contract: schedule a deferred action for an agent.
#[derive(Debug, Clone)]
pub struct AddJobRequest {
    pub action_key: String,
    pub params: serde_json::Value,
    pub run_at: DateTime<Utc>,
    pub options: Option<SchedulerOptions>,
}
