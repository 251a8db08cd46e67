//! Admin operations over ingestion jobs.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;

use crate::model::{Frequency, IngestionJob, ParsedSource};
use crate::resolver::{ResolveError, ResolveOutcome, Resolver};
use crate::scheduler::schedule_hour;
use crate::sources::{SourceError, SourceInfo};
use crate::store::{Catalog, JobStore, StoreError};
use crate::{ProgressFn, no_progress};

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("invalid job: {0}")]
    Invalid(String),
    #[error("job not found: {0}")]
    JobNotFound(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Source(#[from] SourceError),
}

/// A job to register.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSpec {
    pub work_id: String,
    pub sources: Vec<String>,
    pub frequency: Frequency,
    pub enabled: bool,
}

impl JobSpec {
    pub fn new(work_id: impl Into<String>, sources: Vec<String>, frequency: Frequency) -> Self {
        Self {
            work_id: work_id.into(),
            sources,
            frequency,
            enabled: true,
        }
    }
}

/// Fields to change on an existing job; `None` leaves a field as is.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub sources: Option<Vec<String>>,
    pub frequency: Option<Frequency>,
    pub enabled: Option<bool>,
}

pub struct IngestionService {
    jobs: Arc<dyn JobStore>,
    catalog: Arc<dyn Catalog>,
    resolver: Arc<Resolver>,
    progress: ProgressFn,
}

impl IngestionService {
    pub fn new(jobs: Arc<dyn JobStore>, catalog: Arc<dyn Catalog>, resolver: Arc<Resolver>) -> Self {
        Self {
            jobs,
            catalog,
            resolver,
            progress: no_progress(),
        }
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = progress;
        self
    }

    /// Create the job of a work. A work has at most one job.
    pub async fn register_job(&self, spec: JobSpec) -> Result<IngestionJob, ServiceError> {
        let sources = self.validate_sources(&spec.sources)?;
        self.catalog.find_work(&spec.work_id).await?;
        if let Some(existing) = self.jobs.find_job_by_work(&spec.work_id).await? {
            return Err(StoreError::Conflict(format!(
                "work {} already has job {}",
                spec.work_id, existing.id
            ))
            .into());
        }

        let id = format!("{:016x}", fastrand::u64(..));
        let job = IngestionJob {
            schedule_hour: Some(schedule_hour(&spec.work_id, &id)),
            id,
            work_id: spec.work_id,
            sources,
            source_url: None,
            frequency: spec.frequency,
            enabled: spec.enabled,
            last_checked: None,
            last_success_index: None,
            last_success_source: None,
            created_at: Utc::now(),
        };
        self.jobs.create_job(&job).await?;
        tracing::info!(
            job_id = %job.id,
            work_id = %job.work_id,
            frequency = %job.frequency,
            schedule_hour = job.schedule_hour,
            "job registered"
        );
        Ok(job)
    }

    /// Apply an edit. Replacing the source list forgets the last successful source.
    pub async fn update_job(
        &self,
        job_id: &str,
        update: JobUpdate,
    ) -> Result<IngestionJob, ServiceError> {
        let mut job = self.get_job(job_id).await?;

        if let Some(sources) = update.sources {
            let sources = self.validate_sources(&sources)?;
            if sources != job.sources {
                job.sources = sources;
                job.source_url = None;
                job.last_success_index = None;
                job.last_success_source = None;
            }
        }
        if let Some(frequency) = update.frequency {
            job.frequency = frequency;
        }
        if let Some(enabled) = update.enabled {
            job.enabled = enabled;
        }

        self.jobs.update_job(&job).await?;
        tracing::info!(job_id = %job.id, "job updated");
        Ok(job)
    }

    pub async fn delete_job(&self, job_id: &str) -> Result<(), ServiceError> {
        self.get_job(job_id).await?;
        self.jobs.delete_job(job_id).await?;
        tracing::info!(job_id, "job deleted");
        Ok(())
    }

    /// Run one job now, regardless of its schedule or enabled flag.
    pub async fn trigger_job(&self, job_id: &str) -> Result<ResolveOutcome, ServiceError> {
        let job = self.get_job(job_id).await?;
        Ok(self.resolver.resolve(&job, &self.progress).await?)
    }

    pub async fn list_jobs(&self) -> Result<Vec<IngestionJob>, ServiceError> {
        Ok(self.jobs.list_jobs().await?)
    }

    pub fn supported_sources(&self) -> Vec<SourceInfo> {
        self.resolver.registry().families()
    }

    /// Parse a locator without touching the catalog.
    pub async fn parse_source(&self, locator: &str) -> Result<ParsedSource, ServiceError> {
        let (_, parsed) = self.resolver.parse_locator(locator, &self.progress).await?;
        Ok(parsed)
    }

    async fn get_job(&self, job_id: &str) -> Result<IngestionJob, ServiceError> {
        self.jobs
            .get_job(job_id)
            .await?
            .ok_or_else(|| ServiceError::JobNotFound(job_id.to_string()))
    }

    /// Trimmed, de-duplicated locators. At least one must be supported;
    /// unsupported ones are kept but logged.
    fn validate_sources(&self, sources: &[String]) -> Result<Vec<String>, ServiceError> {
        let mut cleaned: Vec<String> = Vec::new();
        for source in sources.iter().map(|s| s.trim()).filter(|s| !s.is_empty()) {
            if !cleaned.iter().any(|c| c == source) {
                cleaned.push(source.to_string());
            }
        }
        if cleaned.is_empty() {
            return Err(ServiceError::Invalid(
                "at least one source locator is required".into(),
            ));
        }

        let registry = self.resolver.registry();
        let mut supported = 0;
        for source in &cleaned {
            match registry.lookup(source) {
                Ok(_) => supported += 1,
                Err(e) => tracing::warn!(source = %source, error = %e, "locator has no adapter"),
            }
        }
        if supported == 0 {
            return Err(ServiceError::Invalid(format!(
                "no supported source among: {}",
                cleaned.join(", ")
            )));
        }
        Ok(cleaned)
    }
}
