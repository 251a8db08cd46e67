//! In-memory collaborators, for tests and dry runs.

use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::future::BoxFuture;

use crate::identity::ChapterKey;
use crate::model::{ChapterMetadata, ChapterRecord, Frequency, IngestionJob, RunBookkeeping, Work};
use crate::store::{AssetStore, Catalog, HourFilter, JobStore, StoreError};

#[derive(Default)]
pub struct MemoryCatalog {
    works: DashMap<String, Work>,
    chapters: DashMap<String, ChapterRecord>,
    next_id: AtomicUsize,
    writes: AtomicUsize,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_work(&self, id: &str, name: &str) {
        self.works.insert(
            id.to_string(),
            Work {
                id: id.to_string(),
                name: name.to_string(),
            },
        );
    }

    /// Seed an existing chapter without counting it as a write.
    pub fn seed_chapter(&self, work_id: &str, identifier: ChapterKey) -> String {
        let id = self.allocate_id();
        self.chapters.insert(
            id.clone(),
            ChapterRecord {
                id: id.clone(),
                work_id: work_id.to_string(),
                title: identifier.text(),
                identifier,
                pages: vec![],
                created_at: Utc::now(),
            },
        );
        id
    }

    /// Chapters of a work in creation order.
    pub fn chapters_of(&self, work_id: &str) -> Vec<ChapterRecord> {
        let mut chapters: Vec<ChapterRecord> = self
            .chapters
            .iter()
            .filter(|c| c.work_id == work_id)
            .map(|c| c.value().clone())
            .collect();
        chapters.sort_by(|a, b| a.id.cmp(&b.id));
        chapters
    }

    /// Number of create, append and delete calls so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn allocate_id(&self) -> String {
        format!("ch-{:06}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

impl Catalog for MemoryCatalog {
    fn find_work<'a>(&'a self, work_id: &'a str) -> BoxFuture<'a, Result<Work, StoreError>> {
        Box::pin(async move {
            self.works
                .get(work_id)
                .map(|w| w.value().clone())
                .ok_or_else(|| StoreError::NotFound(format!("work {work_id}")))
        })
    }

    fn list_chapters<'a>(
        &'a self,
        work_id: &'a str,
    ) -> BoxFuture<'a, Result<Vec<ChapterRecord>, StoreError>> {
        Box::pin(async move { Ok(self.chapters_of(work_id)) })
    }

    fn create_chapter<'a>(
        &'a self,
        work_id: &'a str,
        identifier: &'a ChapterKey,
        pages: &'a [String],
        metadata: &'a ChapterMetadata,
    ) -> BoxFuture<'a, Result<String, StoreError>> {
        Box::pin(async move {
            if !self.works.contains_key(work_id) {
                return Err(StoreError::NotFound(format!("work {work_id}")));
            }
            self.writes.fetch_add(1, Ordering::SeqCst);
            let id = self.allocate_id();
            self.chapters.insert(
                id.clone(),
                ChapterRecord {
                    id: id.clone(),
                    work_id: work_id.to_string(),
                    identifier: identifier.clone(),
                    title: metadata.title.clone(),
                    pages: pages.to_vec(),
                    created_at: Utc::now(),
                },
            );
            Ok(id)
        })
    }

    fn append_pages<'a>(
        &'a self,
        chapter_id: &'a str,
        pages: &'a [String],
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            self.writes.fetch_add(1, Ordering::SeqCst);
            let mut chapter = self
                .chapters
                .get_mut(chapter_id)
                .ok_or_else(|| StoreError::NotFound(format!("chapter {chapter_id}")))?;
            chapter.pages.extend_from_slice(pages);
            Ok(())
        })
    }

    fn delete_chapter<'a>(&'a self, chapter_id: &'a str) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.chapters.remove(chapter_id);
            Ok(())
        })
    }
}

#[derive(Default)]
pub struct MemoryJobStore {
    jobs: DashMap<String, IngestionJob>,
    /// work id -> job id, for the one-job-per-work constraint.
    by_work: DashMap<String, String>,
    runs_recorded: AtomicUsize,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a job directly, bypassing the conflict check.
    pub fn insert(&self, job: IngestionJob) {
        self.by_work.insert(job.work_id.clone(), job.id.clone());
        self.jobs.insert(job.id.clone(), job);
    }

    pub fn get(&self, job_id: &str) -> Option<IngestionJob> {
        self.jobs.get(job_id).map(|j| j.value().clone())
    }

    pub fn runs_recorded(&self) -> usize {
        self.runs_recorded.load(Ordering::SeqCst)
    }

    fn sorted(&self, keep: impl Fn(&IngestionJob) -> bool) -> Vec<IngestionJob> {
        let mut jobs: Vec<IngestionJob> = self
            .jobs
            .iter()
            .filter(|j| keep(j.value()))
            .map(|j| j.value().clone())
            .collect();
        jobs.sort_by(|a, b| a.id.cmp(&b.id));
        jobs
    }
}

impl JobStore for MemoryJobStore {
    fn create_job<'a>(&'a self, job: &'a IngestionJob) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            match self.by_work.entry(job.work_id.clone()) {
                Entry::Occupied(existing) => Err(StoreError::Conflict(format!(
                    "work {} already has job {}",
                    job.work_id,
                    existing.get()
                ))),
                Entry::Vacant(slot) => {
                    slot.insert(job.id.clone());
                    self.jobs.insert(job.id.clone(), job.clone());
                    Ok(())
                }
            }
        })
    }

    fn get_job<'a>(
        &'a self,
        job_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<IngestionJob>, StoreError>> {
        Box::pin(async move { Ok(self.get(job_id)) })
    }

    fn find_job_by_work<'a>(
        &'a self,
        work_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<IngestionJob>, StoreError>> {
        Box::pin(async move {
            let job_id = self.by_work.get(work_id).map(|id| id.value().clone());
            Ok(job_id.and_then(|id| self.get(&id)))
        })
    }

    fn list_jobs(&self) -> BoxFuture<'_, Result<Vec<IngestionJob>, StoreError>> {
        Box::pin(async move { Ok(self.sorted(|_| true)) })
    }

    fn update_job<'a>(&'a self, job: &'a IngestionJob) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let mut stored = self
                .jobs
                .get_mut(&job.id)
                .ok_or_else(|| StoreError::NotFound(format!("job {}", job.id)))?;
            if stored.work_id != job.work_id {
                return Err(StoreError::Conflict("a job's work cannot change".into()));
            }
            *stored = job.clone();
            Ok(())
        })
    }

    fn delete_job<'a>(&'a self, job_id: &'a str) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let (_, job) = self
                .jobs
                .remove(job_id)
                .ok_or_else(|| StoreError::NotFound(format!("job {job_id}")))?;
            self.by_work.remove(&job.work_id);
            Ok(())
        })
    }

    fn find_due_jobs(
        &self,
        frequency: Frequency,
        hour: HourFilter,
    ) -> BoxFuture<'_, Result<Vec<IngestionJob>, StoreError>> {
        Box::pin(async move {
            Ok(self.sorted(|j| j.enabled && j.frequency == frequency && hour.matches(j.schedule_hour)))
        })
    }

    fn record_run<'a>(
        &'a self,
        job_id: &'a str,
        run: &'a RunBookkeeping,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let mut job = self
                .jobs
                .get_mut(job_id)
                .ok_or_else(|| StoreError::NotFound(format!("job {job_id}")))?;
            job.last_checked = Some(run.last_checked);
            job.last_success_index = Some(run.source_index);
            job.last_success_source = Some(run.source_locator.clone());
            self.runs_recorded.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn assign_schedule_hours<'a>(
        &'a self,
        assignments: &'a [(String, u8)],
    ) -> BoxFuture<'a, Result<usize, StoreError>> {
        Box::pin(async move {
            let mut changed = 0;
            for (job_id, hour) in assignments {
                if let Some(mut job) = self.jobs.get_mut(job_id)
                    && job.schedule_hour.is_none()
                {
                    job.schedule_hour = Some(*hour);
                    changed += 1;
                }
            }
            Ok(changed)
        })
    }
}

#[derive(Default)]
pub struct MemoryAssetStore {
    files: DashMap<String, Vec<u8>>,
}

impl MemoryAssetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored paths, sorted.
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.files.iter().map(|f| f.key().clone()).collect();
        paths.sort();
        paths
    }

    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.files.get(path).map(|f| f.value().clone())
    }
}

impl AssetStore for MemoryAssetStore {
    fn write_file<'a>(
        &'a self,
        path: &'a str,
        bytes: &'a [u8],
    ) -> BoxFuture<'a, Result<String, StoreError>> {
        Box::pin(async move {
            self.files.insert(path.to_string(), bytes.to_vec());
            Ok(path.to_string())
        })
    }

    fn delete<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            self.files.remove(path);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(id: &str, work_id: &str, frequency: Frequency, hour: Option<u8>) -> IngestionJob {
        IngestionJob {
            id: id.into(),
            work_id: work_id.into(),
            sources: vec!["https://a.test/x".into()],
            source_url: None,
            frequency,
            enabled: true,
            schedule_hour: hour,
            last_checked: None,
            last_success_index: None,
            last_success_source: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn one_job_per_work() {
        let store = MemoryJobStore::new();
        store.create_job(&job("j1", "w1", Frequency::Daily, None)).await.unwrap();
        let err = store
            .create_job(&job("j2", "w1", Frequency::Daily, None))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        store.delete_job("j1").await.unwrap();
        store.create_job(&job("j2", "w1", Frequency::Daily, None)).await.unwrap();
    }

    #[tokio::test]
    async fn due_jobs_filter_on_frequency_hour_and_enabled() {
        let store = MemoryJobStore::new();
        store.insert(job("j1", "w1", Frequency::Daily, Some(5)));
        store.insert(job("j2", "w2", Frequency::Daily, Some(6)));
        store.insert(job("j3", "w3", Frequency::Weekly, Some(5)));
        store.insert(job("j4", "w4", Frequency::Daily, None));
        let mut disabled = job("j5", "w5", Frequency::Daily, Some(5));
        disabled.enabled = false;
        store.insert(disabled);

        let ids = |jobs: Vec<IngestionJob>| jobs.into_iter().map(|j| j.id).collect::<Vec<_>>();
        assert_eq!(
            ids(store.find_due_jobs(Frequency::Daily, HourFilter::At(5)).await.unwrap()),
            vec!["j1"]
        );
        assert_eq!(
            ids(store.find_due_jobs(Frequency::Daily, HourFilter::Unassigned).await.unwrap()),
            vec!["j4"]
        );
    }

    #[tokio::test]
    async fn backfill_only_touches_unassigned_jobs() {
        let store = MemoryJobStore::new();
        store.insert(job("j1", "w1", Frequency::Daily, None));
        store.insert(job("j2", "w2", Frequency::Daily, Some(3)));
        let changed = store
            .assign_schedule_hours(&[("j1".into(), 7), ("j2".into(), 9), ("missing".into(), 1)])
            .await
            .unwrap();
        assert_eq!(changed, 1);
        assert_eq!(store.get("j1").unwrap().schedule_hour, Some(7));
        assert_eq!(store.get("j2").unwrap().schedule_hour, Some(3));
    }

    #[tokio::test]
    async fn catalog_counts_writes_but_not_seeds() {
        let catalog = MemoryCatalog::new();
        catalog.add_work("w1", "Tower");
        catalog.seed_chapter("w1", ChapterKey::Number(1.0));
        assert_eq!(catalog.write_count(), 0);

        let id = catalog
            .create_chapter("w1", &ChapterKey::Number(2.0), &[], &ChapterMetadata::default())
            .await
            .unwrap();
        catalog.append_pages(&id, &["w1/x/001.jpg".into()]).await.unwrap();
        assert_eq!(catalog.write_count(), 2);
        let chapters = catalog.list_chapters("w1").await.unwrap();
        assert_eq!(chapters.len(), 2);
        assert_eq!(chapters[1].pages, vec!["w1/x/001.jpg".to_string()]);
    }
}
