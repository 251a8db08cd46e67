//! Collaborator contracts: catalog, job store, asset store and notifier.
//!
//! The ingestion engine never owns persistence. Each trait is the narrow
//! surface it needs; [`crate::memory`] and the `chaptersync-store` crate
//! provide implementations.

use futures_util::future::BoxFuture;
use thiserror::Error;

use crate::identity::ChapterKey;
use crate::model::{ChapterMetadata, ChapterRecord, Frequency, IngestionJob, RunBookkeeping, Work};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Which schedule hours a due-job query should match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HourFilter {
    /// Jobs assigned to this hour.
    At(u8),
    /// Legacy jobs without an assigned hour.
    Unassigned,
}

impl HourFilter {
    pub fn matches(&self, schedule_hour: Option<u8>) -> bool {
        match self {
            HourFilter::At(h) => schedule_hour == Some(*h),
            HourFilter::Unassigned => schedule_hour.is_none(),
        }
    }
}

/// Catalog of works and their chapters.
pub trait Catalog: Send + Sync {
    fn find_work<'a>(&'a self, work_id: &'a str) -> BoxFuture<'a, Result<Work, StoreError>>;

    fn list_chapters<'a>(
        &'a self,
        work_id: &'a str,
    ) -> BoxFuture<'a, Result<Vec<ChapterRecord>, StoreError>>;

    /// Create a chapter and return its id.
    fn create_chapter<'a>(
        &'a self,
        work_id: &'a str,
        identifier: &'a ChapterKey,
        pages: &'a [String],
        metadata: &'a ChapterMetadata,
    ) -> BoxFuture<'a, Result<String, StoreError>>;

    fn append_pages<'a>(
        &'a self,
        chapter_id: &'a str,
        pages: &'a [String],
    ) -> BoxFuture<'a, Result<(), StoreError>>;

    /// Compensating delete for a chapter whose import failed.
    fn delete_chapter<'a>(&'a self, chapter_id: &'a str) -> BoxFuture<'a, Result<(), StoreError>>;
}

/// Persistence of [`IngestionJob`] records.
pub trait JobStore: Send + Sync {
    /// Insert a new job. Fails with [`StoreError::Conflict`] if the work already has one.
    fn create_job<'a>(&'a self, job: &'a IngestionJob) -> BoxFuture<'a, Result<(), StoreError>>;

    fn get_job<'a>(
        &'a self,
        job_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<IngestionJob>, StoreError>>;

    fn find_job_by_work<'a>(
        &'a self,
        work_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<IngestionJob>, StoreError>>;

    fn list_jobs(&self) -> BoxFuture<'_, Result<Vec<IngestionJob>, StoreError>>;

    /// Replace the stored job with the same id.
    fn update_job<'a>(&'a self, job: &'a IngestionJob) -> BoxFuture<'a, Result<(), StoreError>>;

    fn delete_job<'a>(&'a self, job_id: &'a str) -> BoxFuture<'a, Result<(), StoreError>>;

    /// Enabled jobs of `frequency` whose schedule hour matches `hour`.
    fn find_due_jobs(
        &self,
        frequency: Frequency,
        hour: HourFilter,
    ) -> BoxFuture<'_, Result<Vec<IngestionJob>, StoreError>>;

    /// Single write of the run bookkeeping fields.
    fn record_run<'a>(
        &'a self,
        job_id: &'a str,
        run: &'a RunBookkeeping,
    ) -> BoxFuture<'a, Result<(), StoreError>>;

    /// Assign schedule hours to many jobs in one batched write. Returns rows changed.
    fn assign_schedule_hours<'a>(
        &'a self,
        assignments: &'a [(String, u8)],
    ) -> BoxFuture<'a, Result<usize, StoreError>>;
}

/// Storage for downloaded page images.
pub trait AssetStore: Send + Sync {
    /// Write `bytes` under the relative `path` and return the stored location.
    fn write_file<'a>(
        &'a self,
        path: &'a str,
        bytes: &'a [u8],
    ) -> BoxFuture<'a, Result<String, StoreError>>;

    fn delete<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<(), StoreError>>;
}

/// A newly imported chapter, as announced to interested parties.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct NewChapterNotice {
    pub work_id: String,
    pub chapter_id: String,
    pub identifier: ChapterKey,
    pub work_name: String,
}

#[derive(Error, Debug)]
#[error("notification failed: {0}")]
pub struct NotifyError(pub String);

/// Announces new chapters. Failures never abort an import.
pub trait Notifier: Send + Sync {
    fn notify_new_chapter<'a>(
        &'a self,
        notice: &'a NewChapterNotice,
    ) -> BoxFuture<'a, Result<(), NotifyError>>;
}
