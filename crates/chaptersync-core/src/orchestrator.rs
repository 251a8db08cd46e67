//! Hourly ticker and per-tick job dispatch.
//!
//! A tick asks the job store for the jobs due at that instant and runs them
//! through a small worker pool fed by an `async_channel`. Every job runs in
//! its own task, so a failing or panicking job is logged and the rest of the
//! tick carries on.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::model::IngestionJob;
use crate::resolver::{ResolveOutcome, Resolver};
use crate::scheduler::{DispatchPolicy, legacy_is_due, next_hour_boundary, plan_tick, schedule_hour};
use crate::store::{HourFilter, JobStore, StoreError};
use crate::{Config, ProgressFn, no_progress};

/// Summary of one tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    /// Jobs selected for this tick.
    pub due: usize,
    /// Jobs that imported at least one chapter.
    pub updated: usize,
    /// Chapters imported across all jobs.
    pub imported: usize,
    /// Job id and error of every failed job.
    pub failed: Vec<(String, String)>,
}

enum JobResult {
    Done(ResolveOutcome),
    Failed { job_id: String, message: String },
}

pub struct Orchestrator {
    jobs: Arc<dyn JobStore>,
    resolver: Arc<Resolver>,
    policy: DispatchPolicy,
    max_concurrent: usize,
    progress: ProgressFn,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(jobs: Arc<dyn JobStore>, resolver: Arc<Resolver>, config: &Config) -> Self {
        Self {
            jobs,
            resolver,
            policy: DispatchPolicy::from_config(config),
            max_concurrent: config.max_concurrent_jobs.max(1),
            progress: no_progress(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn resolver(&self) -> &Arc<Resolver> {
        &self.resolver
    }

    /// Assign a schedule hour to every job that lacks one, in one batched write.
    pub async fn backfill_schedule_hours(&self) -> Result<usize, StoreError> {
        let assignments: Vec<(String, u8)> = self
            .jobs
            .list_jobs()
            .await?
            .into_iter()
            .filter(|j| j.schedule_hour.is_none())
            .map(|j| {
                let hour = schedule_hour(&j.work_id, &j.id);
                (j.id, hour)
            })
            .collect();
        if assignments.is_empty() {
            return Ok(0);
        }
        let changed = self.jobs.assign_schedule_hours(&assignments).await?;
        tracing::info!(jobs = changed, "assigned schedule hours to legacy jobs");
        Ok(changed)
    }

    /// Jobs due at `now`, each at most once.
    pub async fn collect_due(&self, now: DateTime<Utc>) -> Result<Vec<IngestionJob>, StoreError> {
        let plan = plan_tick(now, &self.policy);
        let mut seen = HashSet::new();
        let mut due = Vec::new();

        for query in plan.all_queries() {
            for job in self.jobs.find_due_jobs(query.frequency, query.hour).await? {
                if query.hour == HourFilter::Unassigned && !legacy_is_due(&job, now) {
                    continue;
                }
                if seen.insert(job.id.clone()) {
                    due.push(job);
                }
            }
        }
        Ok(due)
    }

    /// Run every job due at `now`.
    pub async fn run_tick(&self, now: DateTime<Utc>) -> Result<TickReport, StoreError> {
        let due = self.collect_due(now).await?;
        let mut report = TickReport {
            due: due.len(),
            ..TickReport::default()
        };
        if due.is_empty() {
            tracing::debug!(at = %now, "no jobs due");
            return Ok(report);
        }
        tracing::info!(at = %now, jobs = due.len(), "tick started");

        let (job_tx, job_rx) = async_channel::unbounded::<IngestionJob>();
        for job in due {
            // Receiver is alive until the workers below exit.
            let _ = job_tx.send(job).await;
        }
        job_tx.close();

        let workers: Vec<JoinHandle<Vec<JobResult>>> = (0..self.max_concurrent.min(report.due))
            .map(|_| {
                tokio::spawn(worker_loop(
                    job_rx.clone(),
                    now,
                    self.resolver.clone(),
                    self.progress.clone(),
                    self.cancel.clone(),
                ))
            })
            .collect();
        drop(job_rx);

        for worker in workers {
            let results = match worker.await {
                Ok(results) => results,
                Err(e) => {
                    tracing::error!(error = %e, "tick worker crashed");
                    continue;
                }
            };
            for result in results {
                match result {
                    JobResult::Done(outcome) => {
                        if !outcome.imported.is_empty() {
                            report.updated += 1;
                            report.imported += outcome.imported.len();
                        }
                    }
                    JobResult::Failed { job_id, message } => report.failed.push((job_id, message)),
                }
            }
        }

        tracing::info!(
            at = %now,
            due = report.due,
            updated = report.updated,
            imported = report.imported,
            failed = report.failed.len(),
            "tick finished"
        );
        Ok(report)
    }

    /// Tick at every top of the hour until cancelled.
    ///
    /// Ticks are spawned, so a slow tick never delays the next one. On
    /// cancellation no new job starts, and the jobs already running are
    /// awaited before this returns.
    pub async fn run(self: Arc<Self>) {
        let mut ticks = JoinSet::new();
        loop {
            while ticks.try_join_next().is_some() {}

            let now = Utc::now();
            let next = next_hour_boundary(now);
            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }

            let this = self.clone();
            ticks.spawn(async move {
                if let Err(e) = this.run_tick(next).await {
                    tracing::error!(at = %next, error = %e, "tick aborted: could not load due jobs");
                }
            });
        }

        if !ticks.is_empty() {
            tracing::info!(ticks = ticks.len(), "waiting for running jobs to finish");
        }
        while let Some(result) = ticks.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = %e, "tick task crashed");
            }
        }
        tracing::info!("scheduler stopped");
    }
}

async fn worker_loop(
    job_rx: async_channel::Receiver<IngestionJob>,
    tick: DateTime<Utc>,
    resolver: Arc<Resolver>,
    progress: ProgressFn,
    cancel: CancellationToken,
) -> Vec<JobResult> {
    let mut results = Vec::new();
    while let Ok(job) = job_rx.recv().await {
        if cancel.is_cancelled() {
            break;
        }
        let job_id = job.id.clone();
        let work_id = job.work_id.clone();

        let resolver = resolver.clone();
        let progress = progress.clone();
        let handle = tokio::spawn(async move { resolver.resolve_at(&job, tick, &progress).await });

        let result = match handle.await {
            Ok(Ok(outcome)) => {
                tracing::info!(
                    job_id = %job_id,
                    work_id = %work_id,
                    imported = outcome.imported.len(),
                    failed = outcome.failed.len(),
                    "job finished"
                );
                JobResult::Done(outcome)
            }
            Ok(Err(e)) => {
                tracing::warn!(job_id = %job_id, work_id = %work_id, error = %e, "job failed");
                JobResult::Failed {
                    job_id,
                    message: e.to_string(),
                }
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, work_id = %work_id, error = %e, "job panicked");
                JobResult::Failed {
                    job_id,
                    message: format!("job panicked: {e}"),
                }
            }
        };
        results.push(result);
    }
    results
}
