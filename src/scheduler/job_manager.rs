// src/scheduler/job_manager.rs
//! Job Manager contract and local implementation
//!
//! The Job Manager is the narrow scheduling surface handed to capability
//! gateways: schedule one agent action, or cancel one by key. It never
//! exposes the runner or the active set.

use crate::scheduler::job::{ActionPayload, AddJob, AddJobRequest, CronPayload, JobTask, SchedulerOptions};
use crate::scheduler::task_runner::{next_occurrence, TaskRunner};
use crate::utils::errors::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;

/// The Job Manager contract.
#[async_trait]
pub trait JobManager: Send + Sync {
    /// Schedule an action for an agent; returns the job key.
    async fn add_job(&self, agent_id: &str, request: AddJobRequest) -> Result<String>;

    /// Cancel a pending job. No-op when absent.
    async fn remove_job(&self, job_key: &str) -> Result<()>;
}

/// Job manager bound to one user, forwarding to a shared [`TaskRunner`].
pub struct LocalJobManager {
    runner: Arc<TaskRunner>,
    user_id: String,
}

impl LocalJobManager {
    pub fn new(runner: Arc<TaskRunner>, user_id: impl Into<String>) -> Self {
        Self {
            runner,
            user_id: user_id.into(),
        }
    }

    /// Arm a recurring action: inserts a cron job at the schedule's next
    /// occurrence. Subsequent occurrences re-arm themselves after each run.
    pub fn schedule_recurring(
        &self,
        agent_id: &str,
        action_key: &str,
        schedule: &str,
        options: Option<SchedulerOptions>,
    ) -> Result<String> {
        let options = options.unwrap_or_default();
        let next = next_occurrence(schedule, Utc::now())?;
        let payload = CronPayload {
            user_id: self.user_id.clone(),
            agent_id: agent_id.to_string(),
            action_key: action_key.to_string(),
            schedule: schedule.to_string(),
            max_attempts: options.max_attempts,
        };
        Ok(self.runner.add_job(AddJob {
            task: JobTask::Cron(payload),
            run_at: next,
            key: options.job_key,
            max_attempts: options.max_attempts,
        }))
    }
}

#[async_trait]
impl JobManager for LocalJobManager {
    async fn add_job(&self, agent_id: &str, request: AddJobRequest) -> Result<String> {
        let options = request.options.unwrap_or_default();
        Ok(self.runner.add_job(AddJob {
            task: JobTask::RunAction(ActionPayload {
                user_id: self.user_id.clone(),
                agent_id: agent_id.to_string(),
                action_key: request.action_key,
                params: request.params,
            }),
            run_at: request.run_at,
            key: options.job_key,
            max_attempts: options.max_attempts,
        }))
    }

    async fn remove_job(&self, job_key: &str) -> Result<()> {
        self.runner.remove_job(job_key);
        Ok(())
    }
}
