use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use warden_core::{JobStatus, Schedule, ScheduleType, now_epoch_ms};
use warden_memory::{CronJobRecord, MemoryStore, NewCronJob};

const JOB_ID_LEN: usize = 12;

/// Work performed when a job comes due. Returning `Err` or panicking records the run as failed.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run_job(&self, job_id: &str, message: &str, chat_id: &str) -> Result<Option<String>>;
}

/// Polls the store for due jobs and runs each at most once at a time.
pub struct CronService {
    store: Arc<MemoryStore>,
    executing: Arc<Mutex<HashSet<String>>>,
    tick_interval: Duration,
    cancel: CancellationToken,
}

impl CronService {
    pub fn new(store: Arc<MemoryStore>, tick_interval: Duration) -> Self {
        Self {
            store,
            executing: Arc::new(Mutex::new(HashSet::new())),
            tick_interval,
            cancel: CancellationToken::new(),
        }
    }

    pub fn add(
        &self,
        name: &str,
        message: &str,
        chat_id: &str,
        schedule_type: &str,
        schedule_value: &str,
    ) -> Result<String> {
        let kind = ScheduleType::parse(schedule_type)?;
        let schedule = Schedule::parse(kind, schedule_value)?;
        let now_ms = now_epoch_ms();
        let next_run_at_ms = schedule.first_run_at(now_ms);
        let id: String = uuid::Uuid::new_v4()
            .simple()
            .to_string()
            .chars()
            .take(JOB_ID_LEN)
            .collect();

        self.store.insert_cron_job(&NewCronJob {
            id: &id,
            name,
            message,
            chat_id,
            schedule_type: kind.as_str(),
            schedule_value: schedule_value.trim(),
            next_run_at_ms,
        })?;
        tracing::info!(job_id = %id, name, schedule = kind.as_str(), "cron job added");
        Ok(id)
    }

    /// Removes every job whose id or name matches.
    pub fn remove(&self, id_or_name: &str) -> Result<usize> {
        let removed = self.store.remove_cron_jobs(id_or_name)?;
        tracing::info!(target_job = %id_or_name, removed, "cron jobs removed");
        Ok(removed)
    }

    pub fn list(&self) -> Result<Vec<CronJobRecord>> {
        self.store.list_cron_jobs()
    }

    /// Makes a job due now. Returns false when no such job exists.
    pub fn trigger(&self, job_id: &str) -> Result<bool> {
        self.store.set_cron_next_run(job_id, now_epoch_ms())
    }

    pub fn is_executing(&self, job_id: &str) -> bool {
        self.executing
            .lock()
            .map(|set| set.contains(job_id))
            .unwrap_or(false)
    }

    /// Spawns the tick loop. Stopping halts future ticks; runs already started finish.
    pub fn start(self: &Arc<Self>, handler: Arc<dyn JobHandler>) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(service.tick_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tracing::info!(tick_secs = service.tick_interval.as_secs(), "scheduler started");
            loop {
                tokio::select! {
                    _ = service.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = service.tick(&handler) {
                            tracing::error!(error = %err, "scheduler tick failed");
                        }
                    }
                }
            }
            tracing::info!("scheduler stopped");
        })
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Claims every due job that is not already running and launches it. Claiming happens
    /// before this returns, so an overlapping tick cannot launch the same job again.
    pub fn tick(&self, handler: &Arc<dyn JobHandler>) -> Result<Vec<JoinHandle<()>>> {
        let due = self.store.due_cron_jobs(now_epoch_ms())?;
        let mut launched = Vec::new();
        for job in due {
            let claimed = {
                let mut executing = self
                    .executing
                    .lock()
                    .map_err(|_| anyhow!("executing set lock poisoned"))?;
                executing.insert(job.id.clone())
            };
            if !claimed {
                tracing::debug!(job_id = %job.id, "job still running, skipping");
                continue;
            }
            let guard = ExecutingGuard {
                set: Arc::clone(&self.executing),
                job_id: job.id.clone(),
            };
            let store = Arc::clone(&self.store);
            let handler = Arc::clone(handler);
            launched.push(tokio::spawn(async move {
                let _guard = guard;
                execute_job(store, handler, job).await;
            }));
        }
        Ok(launched)
    }
}

/// Releases a claimed job id however the run ends.
struct ExecutingGuard {
    set: Arc<Mutex<HashSet<String>>>,
    job_id: String,
}

impl Drop for ExecutingGuard {
    fn drop(&mut self) {
        let mut set = self.set.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        set.remove(&self.job_id);
    }
}

async fn execute_job(store: Arc<MemoryStore>, handler: Arc<dyn JobHandler>, job: CronJobRecord) {
    tracing::info!(job_id = %job.id, name = %job.name, "running cron job");
    let (job_id, message, chat_id) = (job.id.clone(), job.message.clone(), job.chat_id.clone());
    let outcome =
        tokio::spawn(async move { handler.run_job(&job_id, &message, &chat_id).await }).await;

    let (status, error) = match outcome {
        Ok(Ok(_)) => (JobStatus::Ok, None),
        Ok(Err(err)) => (JobStatus::Error, Some(format!("{err:#}"))),
        Err(join_err) if join_err.is_panic() => {
            (JobStatus::Error, Some("job handler panicked".to_string()))
        }
        Err(join_err) => (JobStatus::Error, Some(join_err.to_string())),
    };
    if let Some(err) = &error {
        tracing::warn!(job_id = %job.id, error = %err, "cron job failed");
    }

    let completed_ms = now_epoch_ms();
    let next_run_at_ms = match ScheduleType::parse(&job.schedule_type)
        .and_then(|kind| Schedule::parse(kind, &job.schedule_value))
    {
        Ok(schedule) => schedule.next_run_after(completed_ms),
        Err(err) => {
            tracing::error!(job_id = %job.id, error = %err, "stored schedule is invalid, disabling job");
            None
        }
    };
    if let Err(err) =
        store.finish_cron_run(&job.id, completed_ms, status, error.as_deref(), next_run_at_ms)
    {
        tracing::error!(job_id = %job.id, error = %err, "failed to record cron run");
    }
}
