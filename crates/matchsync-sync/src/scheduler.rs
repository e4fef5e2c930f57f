//! Fixed-interval task runner.
//!
//! Tasks are kept in an explicit list owned by the scheduler. Every task is
//! due as soon as it is registered, then again `interval` after each start.
//! The scheduler sleeps until the earliest due time, never longer than
//! `poll_interval`, runs whatever is due one task at a time, and keeps going
//! whether a run succeeds or fails or panics.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::failure_class;

#[async_trait]
pub trait ScheduledJob: Send + Sync + 'static {
    fn name(&self) -> &str;
    async fn run(&self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Succeeded,
    Failed,
    Panicked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskStats {
    pub name: String,
    pub interval_secs: u64,
    pub runs: u64,
    pub failures: u64,
}

struct ScheduledTask {
    job: Arc<dyn ScheduledJob>,
    interval: Duration,
    next_due: Instant,
    runs: u64,
    failures: u64,
}

pub struct Scheduler {
    tasks: Vec<ScheduledTask>,
    poll_interval: Duration,
}

impl Scheduler {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            tasks: Vec::new(),
            poll_interval: poll_interval.max(Duration::from_millis(10)),
        }
    }

    /// Register `job` to run now and then every `interval`.
    pub fn every(mut self, interval: Duration, job: Arc<dyn ScheduledJob>) -> Self {
        self.tasks.push(ScheduledTask {
            job,
            interval,
            next_due: Instant::now(),
            runs: 0,
            failures: 0,
        });
        self
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Earliest due time, capped at one poll interval from now.
    fn next_wake(&self) -> Instant {
        let cap = Instant::now() + self.poll_interval;
        self.tasks
            .iter()
            .map(|task| task.next_due)
            .min()
            .map_or(cap, |due| due.min(cap))
    }

    pub fn stats(&self) -> Vec<TaskStats> {
        self.tasks
            .iter()
            .map(|task| TaskStats {
                name: task.job.name().to_string(),
                interval_secs: task.interval.as_secs(),
                runs: task.runs,
                failures: task.failures,
            })
            .collect()
    }

    /// Run every task that is due, in registration order. Returns how many ran.
    pub async fn run_pending(&mut self) -> usize {
        let mut ran = 0;
        for task in &mut self.tasks {
            let started = Instant::now();
            if started < task.next_due {
                continue;
            }
            let outcome = invoke(task.job.clone()).await;
            task.runs += 1;
            if outcome != RunOutcome::Succeeded {
                task.failures += 1;
            }
            task.next_due = started + task.interval;
            ran += 1;
        }
        ran
    }

    /// Poll until `shutdown` resolves. A run already in progress finishes
    /// before the scheduler notices the signal.
    pub async fn run_until<F>(&mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!(
            tasks = self.tasks.len(),
            poll_ms = self.poll_interval.as_millis() as u64,
            "scheduler started"
        );
        loop {
            self.run_pending().await;
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("shutdown requested; scheduler stopping");
                    break;
                }
                _ = tokio::time::sleep_until(self.next_wake()) => {}
            }
        }
    }
}

/// One isolated invocation. The job runs on its own task so a panic is
/// contained and reported instead of unwinding the scheduler.
pub async fn invoke(job: Arc<dyn ScheduledJob>) -> RunOutcome {
    let span = info_span!("scheduled_job", job = job.name(), run_id = %Uuid::new_v4());
    async move {
        let started = Instant::now();
        info!("job started");
        let handle = tokio::spawn(async move { job.run().await }.in_current_span());
        let elapsed_ms = || started.elapsed().as_millis() as u64;
        match handle.await {
            Ok(Ok(())) => {
                info!(elapsed_ms = elapsed_ms(), "job finished");
                RunOutcome::Succeeded
            }
            Ok(Err(err)) => {
                error!(
                    elapsed_ms = elapsed_ms(),
                    class = ?failure_class(&err),
                    error = %format!("{err:#}"),
                    "job failed"
                );
                RunOutcome::Failed
            }
            Err(join_err) if join_err.is_panic() => {
                error!(elapsed_ms = elapsed_ms(), "job panicked");
                RunOutcome::Panicked
            }
            Err(join_err) => {
                warn!(error = %join_err, "job was cancelled");
                RunOutcome::Failed
            }
        }
    }
    .instrument(span)
    .await
}
