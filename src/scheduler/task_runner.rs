// src/scheduler/task_runner.rs
//! In-memory deferred-job runner
//!
//! Polls the active set on a fixed interval; due jobs are removed up front
//! and dispatched strictly sequentially within the tick. A failed run is
//! re-inserted (same key) with its attempt count bumped and its run time
//! pushed back by the retry delay; once a job's attempts reach its ceiling
//! it is dropped at dispatch time. Cron jobs are unconditionally re-armed
//! after each run under a composite key, which makes repeated re-arms for
//! the same logical cron idempotent.

use crate::scheduler::job::{AddJob, ActionPayload, CronPayload, Job, JobTask};
use crate::utils::config::SchedulerSettings;
use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

/// Host callback dispatching a one-shot action job.
pub type ActionRunner =
    Arc<dyn Fn(ActionPayload) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Host callback dispatching a cron job.
pub type CronRunner =
    Arc<dyn Fn(CronPayload) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Next trigger time for a schedule expression, strictly after `now`.
pub fn next_occurrence(schedule: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let parsed = cron::Schedule::from_str(schedule).map_err(|e| EngineError::InvalidSchedule {
        schedule: schedule.to_string(),
        message: e.to_string(),
    })?;
    parsed
        .after(&now)
        .next()
        .ok_or_else(|| EngineError::InvalidSchedule {
            schedule: schedule.to_string(),
            message: "no future occurrence".to_string(),
        })
}

/// In-memory deferred-job runner
pub struct TaskRunner {
    action_runner: ActionRunner,
    cron_runner: CronRunner,
    settings: SchedulerSettings,
    jobs: Mutex<Vec<Job>>,
    poll_handle: Mutex<Option<JoinHandle<()>>>,
    shutdown: Notify,
    running: AtomicBool,
}

impl TaskRunner {
    pub fn new(
        action_runner: ActionRunner,
        cron_runner: CronRunner,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            action_runner,
            cron_runner,
            settings,
            jobs: Mutex::new(Vec::new()),
            poll_handle: Mutex::new(None),
            shutdown: Notify::new(),
            running: AtomicBool::new(false),
        }
    }

    /// Start the poll loop. No-op if already running.
    pub fn start(self: Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        info!(
            poll_interval_ms = self.settings.poll_interval_ms,
            "Starting job poll loop"
        );

        let runner = Arc::clone(&self);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_millis(
                runner.settings.poll_interval_ms,
            ));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        runner.run_due_jobs().await;
                    }
                    _ = runner.shutdown.notified() => {
                        debug!("Job poll loop stopping");
                        break;
                    }
                }
            }
        });

        *self.poll_handle.lock() = Some(handle);
    }

    /// Stop the poll loop. Does not interrupt a job already executing.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shutdown.notify_one();
        if let Some(handle) = self.poll_handle.lock().take() {
            handle.abort();
        }
    }

    /// Insert a job. An existing active job with the same key is replaced,
    /// which keeps explicit-key scheduling idempotent and key uniqueness
    /// intact.
    pub fn add_job(&self, params: AddJob) -> String {
        let key = params.key.unwrap_or_else(|| Ulid::new().to_string());
        let job = Job {
            key: key.clone(),
            task: params.task,
            run_at: params.run_at,
            attempts: 0,
            max_attempts: params
                .max_attempts
                .unwrap_or(self.settings.default_max_attempts),
        };
        self.upsert(job);
        key
    }

    /// Remove a job by key. No-op when absent: callers cannot distinguish
    /// "already ran" from "never existed".
    pub fn remove_job(&self, job_key: &str) {
        self.jobs.lock().retain(|job| job.key != job_key);
    }

    /// Snapshot of the active set (inspection/testing).
    pub fn active_jobs(&self) -> Vec<Job> {
        self.jobs.lock().clone()
    }

    fn upsert(&self, job: Job) {
        let mut jobs = self.jobs.lock();
        if let Some(existing) = jobs.iter_mut().find(|j| j.key == job.key) {
            *existing = job;
        } else {
            jobs.push(job);
        }
    }

    /// One poll tick: partition out due jobs and dispatch them in insertion
    /// order, one at a time.
    pub async fn run_due_jobs(&self) {
        let now = Utc::now();
        let due: Vec<Job> = {
            let mut jobs = self.jobs.lock();
            let all = std::mem::take(&mut *jobs);
            let (due, remaining): (Vec<_>, Vec<_>) =
                all.into_iter().partition(|job| job.run_at <= now);
            *jobs = remaining;
            due
        };

        for job in due {
            if job.attempts >= job.max_attempts {
                warn!(
                    key = %job.key,
                    attempts = job.attempts,
                    "Dropping job: retry ceiling reached"
                );
                metrics::counter!("scheduler.jobs_dropped").increment(1);
                continue;
            }

            match job.task.clone() {
                JobTask::RunAction(payload) => {
                    self.run_job(job, (self.action_runner)(payload)).await;
                }
                JobTask::Cron(payload) => {
                    self.run_job(job, (self.cron_runner)(payload.clone())).await;
                    self.rearm_cron(&payload);
                }
            }
        }
    }

    async fn run_job(&self, mut job: Job, run: BoxFuture<'static, anyhow::Result<()>>) {
        debug!(key = %job.key, kind = job.task.kind(), "Dispatching job");

        match run.await {
            Ok(()) => {
                metrics::counter!("scheduler.jobs_run").increment(1);
            }
            Err(e) => {
                error!(key = %job.key, attempts = job.attempts + 1, "Job failed: {}", e);
                metrics::counter!("scheduler.jobs_failed").increment(1);

                job.attempts += 1;
                job.run_at = job.run_at + ChronoDuration::minutes(self.settings.retry_delay_mins);
                self.upsert(job);
            }
        }
    }

    /// Arm the next occurrence of a cron job. The composite key makes
    /// re-arming idempotent if the same occurrence is computed twice.
    fn rearm_cron(&self, payload: &CronPayload) {
        let next = match next_occurrence(&payload.schedule, Utc::now()) {
            Ok(next) => next,
            Err(e) => {
                error!(schedule = %payload.schedule, "Cron re-arm failed: {}", e);
                return;
            }
        };

        let key = format!(
            "{}_{}_{}_{}",
            next.timestamp_millis(),
            payload.user_id,
            payload.agent_id,
            payload.action_key
        );
        self.add_job(AddJob {
            task: JobTask::Cron(payload.clone()),
            run_at: next,
            key: Some(key),
            max_attempts: payload.max_attempts,
        });
        metrics::counter!("scheduler.jobs_rearmed").increment(1);
    }
}
