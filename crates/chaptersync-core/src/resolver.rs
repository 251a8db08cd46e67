//! Multi-source resolution: find new chapters for one job and import them.
//!
//! Sources are tried in order (last successful source first) until one of
//! them lists a chapter the catalog does not have. The pages of each new
//! chapter are downloaded first and the catalog record is created with them,
//! so a chapter is never visible without pages; if the record cannot be
//! written the downloaded pages are discarded. The job's bookkeeping fields
//! are written once, at the end of the run.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::assets::{AssetPipeline, chapter_dir};
use crate::identity::{ChapterKey, is_new};
use crate::model::{ChapterMetadata, ChapterRef, IngestionJob, ParsedSource, RunBookkeeping};
use crate::notify::spawn_notify;
use crate::rate_limit::call_with_rate_limit;
use crate::sources::{SourceAdapter, SourceError, SourceRegistry};
use crate::store::{AssetStore, Catalog, JobStore, NewChapterNotice, Notifier, StoreError};
use crate::{Config, ProgressEvent, ProgressFn, RateLimiters};

/// One source that could not be used, labeled by its position in the job's list.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceAttemptError {
    pub index: usize,
    pub locator: String,
    pub error: SourceError,
}

impl fmt::Display for SourceAttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "source #{} ({}): {}", self.index, self.locator, self.error)
    }
}

fn format_attempts(errors: &[SourceAttemptError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Error, Debug)]
pub enum ResolveError {
    /// Every source failed outright, or the job lists none. Bookkeeping is
    /// left untouched.
    #[error("no source available for job {job_id}: {}", format_attempts(.errors))]
    NoSourceAvailable {
        job_id: String,
        errors: Vec<SourceAttemptError>,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A chapter imported by a run.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportedChapter {
    pub chapter_id: String,
    pub identifier: ChapterKey,
    pub name: String,
    pub pages: usize,
}

/// A new chapter that could not be imported and was rolled back.
#[derive(Debug, Clone, PartialEq)]
pub struct ChapterFailure {
    pub identifier: ChapterKey,
    pub name: String,
    pub reason: String,
}

/// Result of one job run that reached at least one responsive source.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolveOutcome {
    pub job_id: String,
    pub imported: Vec<ImportedChapter>,
    pub failed: Vec<ChapterFailure>,
    /// Listed chapters skipped for lacking a usable identifier.
    pub invalid_identifiers: Vec<String>,
    /// Source whose chapters were used, or the last one that responded.
    pub source_index: Option<usize>,
    pub source_locator: Option<String>,
    /// Per-source errors met before the used source.
    pub source_errors: Vec<SourceAttemptError>,
}

/// Positions of `len` candidate sources in try-order: the last successful
/// source first when it is in range, then the rest in list order.
pub fn try_order(len: usize, last_success: Option<usize>) -> Vec<usize> {
    match last_success {
        Some(first) if first < len => std::iter::once(first)
            .chain((0..len).filter(|i| *i != first))
            .collect(),
        _ => (0..len).collect(),
    }
}

/// New chapters of a listing paired with their catalog identifiers, ascending.
///
/// With `require_numeric`, chapters without a number are returned separately
/// as invalid; otherwise they are keyed by their display name.
pub fn select_new(
    listed: &[ChapterRef],
    existing: &[ChapterKey],
    require_numeric: bool,
) -> (Vec<(ChapterKey, ChapterRef)>, Vec<String>) {
    let mut fresh: Vec<(ChapterKey, ChapterRef)> = Vec::new();
    let mut invalid = Vec::new();

    for chapter in listed {
        let key = match chapter.number.filter(|n| n.is_finite()) {
            Some(n) => ChapterKey::Number(n),
            None if require_numeric => {
                invalid.push(chapter.name.clone());
                continue;
            }
            None => ChapterKey::Label(chapter.name.trim().to_string()),
        };
        let seen = fresh.iter().map(|(k, _)| k.clone()).collect::<Vec<_>>();
        if is_new(&key, existing) && is_new(&key, &seen) {
            fresh.push((key, chapter.clone()));
        }
    }

    fresh.sort_by(|(a, _), (b, _)| match (a.numeric(), b.numeric()) {
        (Some(x), Some(y)) => x.total_cmp(&y),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    });
    (fresh, invalid)
}

/// The source chosen for a run and the new chapters it listed.
struct Selection {
    index: usize,
    locator: String,
    adapter: Arc<dyn SourceAdapter>,
    parsed: ParsedSource,
    new_chapters: Vec<(ChapterKey, ChapterRef)>,
}

pub struct Resolver {
    registry: SourceRegistry,
    catalog: Arc<dyn Catalog>,
    jobs: Arc<dyn JobStore>,
    notifier: Arc<dyn Notifier>,
    pipeline: AssetPipeline,
    client: reqwest::Client,
    limiters: Arc<RateLimiters>,
    timeout: Duration,
    chapter_delay: Duration,
    require_numeric: bool,
}

impl Resolver {
    pub fn new(
        config: &Config,
        registry: SourceRegistry,
        catalog: Arc<dyn Catalog>,
        jobs: Arc<dyn JobStore>,
        assets: Arc<dyn AssetStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let client = config.build_client();
        Self {
            registry,
            catalog,
            jobs,
            notifier,
            pipeline: AssetPipeline::new(client.clone(), assets, config),
            client,
            limiters: config.rate_limiters.clone(),
            timeout: config.http_timeout(),
            chapter_delay: Duration::from_millis(config.chapter_delay_ms),
            require_numeric: config.require_numeric_identifier,
        }
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Parse one locator through its adapter, under the family rate limiter.
    pub async fn parse_locator(
        &self,
        locator: &str,
        progress: &ProgressFn,
    ) -> Result<(Arc<dyn SourceAdapter>, ParsedSource), SourceError> {
        let adapter = self.registry.lookup(locator)?;
        let parsed = call_with_rate_limit(adapter.name(), &self.limiters, self.timeout, progress, || {
            adapter.parse(locator, &self.client, self.timeout)
        })
        .await?;
        if parsed.chapters.is_empty() {
            return Err(SourceError::Empty);
        }
        Ok((adapter, parsed))
    }

    /// Run one job now: pick a source, import its new chapters, record bookkeeping.
    pub async fn resolve(
        &self,
        job: &IngestionJob,
        progress: &ProgressFn,
    ) -> Result<ResolveOutcome, ResolveError> {
        self.resolve_at(job, Utc::now(), progress).await
    }

    /// Like [`Resolver::resolve`], recording `checked_at` as the job's last
    /// check. Scheduled runs pass their tick instant so a slow run does not
    /// push the next due time back.
    pub async fn resolve_at(
        &self,
        job: &IngestionJob,
        checked_at: DateTime<Utc>,
        progress: &ProgressFn,
    ) -> Result<ResolveOutcome, ResolveError> {
        let candidates = job.candidate_sources();
        if candidates.is_empty() {
            tracing::warn!(job_id = %job.id, "job has no source locators");
            return Err(ResolveError::NoSourceAvailable {
                job_id: job.id.clone(),
                errors: Vec::new(),
            });
        }

        let work = self.catalog.find_work(&job.work_id).await?;
        let existing: Vec<ChapterKey> = self
            .catalog
            .list_chapters(&job.work_id)
            .await?
            .into_iter()
            .map(|c| c.identifier)
            .collect();

        let mut outcome = ResolveOutcome {
            job_id: job.id.clone(),
            ..ResolveOutcome::default()
        };
        // Last source that listed any chapters, new or not.
        let mut responsive: Option<(usize, String)> = None;
        let mut selection: Option<Selection> = None;

        for index in try_order(candidates.len(), job.last_success_index) {
            let locator = &candidates[index];
            progress(ProgressEvent::SourceAttempt {
                job_id: job.id.clone(),
                index,
                locator: locator.clone(),
            });

            let (adapter, parsed) = match self.parse_locator(locator, progress).await {
                Ok(found) => found,
                Err(error) => {
                    tracing::warn!(job_id = %job.id, index, source = %locator, error = %error, "source failed");
                    progress(ProgressEvent::SourceFailed {
                        job_id: job.id.clone(),
                        index,
                        locator: locator.clone(),
                        message: error.to_string(),
                    });
                    outcome.source_errors.push(SourceAttemptError {
                        index,
                        locator: locator.clone(),
                        error,
                    });
                    continue;
                }
            };
            responsive = Some((index, locator.clone()));

            let (new_chapters, invalid) =
                select_new(&parsed.chapters, &existing, self.require_numeric);
            for name in &invalid {
                tracing::info!(job_id = %job.id, chapter = %name, "InvalidIdentifier: chapter has no numeric identifier, skipped");
            }
            outcome.invalid_identifiers.extend(invalid);

            if new_chapters.is_empty() {
                tracing::debug!(job_id = %job.id, index, source = %locator, "no new chapters");
                continue;
            }
            selection = Some(Selection {
                index,
                locator: locator.clone(),
                adapter,
                parsed,
                new_chapters,
            });
            break;
        }

        let Some((last_index, last_locator)) = responsive else {
            return Err(ResolveError::NoSourceAvailable {
                job_id: job.id.clone(),
                errors: outcome.source_errors,
            });
        };

        let (index, locator) = match selection {
            Some(selection) => {
                let used = (selection.index, selection.locator.clone());
                self.import_all(job, &work.name, selection, &mut outcome, progress)
                    .await;
                used
            }
            None => (last_index, last_locator),
        };

        self.jobs
            .record_run(
                &job.id,
                &RunBookkeeping {
                    last_checked: checked_at,
                    source_index: index,
                    source_locator: locator.clone(),
                },
            )
            .await?;
        outcome.source_index = Some(index);
        outcome.source_locator = Some(locator);
        Ok(outcome)
    }

    async fn import_all(
        &self,
        job: &IngestionJob,
        work_name: &str,
        selection: Selection,
        outcome: &mut ResolveOutcome,
        progress: &ProgressFn,
    ) {
        tracing::info!(
            job_id = %job.id,
            work_id = %job.work_id,
            source = %selection.locator,
            title = %selection.parsed.title,
            count = selection.new_chapters.len(),
            "new chapters found"
        );
        progress(ProgressEvent::NewChaptersFound {
            job_id: job.id.clone(),
            locator: selection.locator.clone(),
            count: selection.new_chapters.len(),
        });

        for (i, (identifier, chapter)) in selection.new_chapters.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.chapter_delay).await;
            }
            let metadata = ChapterMetadata {
                title: chapter.name.clone(),
                source_locator: chapter.locator.clone(),
                source_name: selection.adapter.name().to_string(),
            };
            match self
                .import_chapter(job, work_name, selection.adapter.as_ref(), identifier, chapter, &metadata, progress)
                .await
            {
                Ok(Some(imported)) => outcome.imported.push(imported),
                Ok(None) => {}
                Err(reason) => outcome.failed.push(ChapterFailure {
                    identifier: identifier.clone(),
                    name: chapter.name.clone(),
                    reason,
                }),
            }
        }
    }

    /// Import one chapter. `Ok(None)` when a concurrent run already imported it.
    #[allow(clippy::too_many_arguments)]
    async fn import_chapter(
        &self,
        job: &IngestionJob,
        work_name: &str,
        adapter: &dyn SourceAdapter,
        identifier: &ChapterKey,
        chapter: &ChapterRef,
        metadata: &ChapterMetadata,
        progress: &ProgressFn,
    ) -> Result<Option<ImportedChapter>, String> {
        let work_id = job.work_id.as_str();

        // An overlapping tick may have imported it since the listing was matched.
        if self.already_present(work_id, identifier).await? {
            tracing::debug!(job_id = %job.id, chapter = %identifier, "chapter already present");
            return Ok(None);
        }

        let dir = chapter_dir(identifier);
        let pages = match self
            .pipeline
            .download_chapter_assets(adapter, chapter, work_id, &dir, progress)
            .await
        {
            Ok(pages) => pages,
            Err(e) => return Err(self.roll_back(job, identifier, e.to_string(), progress)),
        };

        // Checked again after the download. A run that won the race stored
        // the same paths, so the files stay.
        if self.already_present(work_id, identifier).await? {
            tracing::debug!(job_id = %job.id, chapter = %identifier, "chapter imported concurrently");
            return Ok(None);
        }

        let chapter_id = match self
            .catalog
            .create_chapter(work_id, identifier, &pages, metadata)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                self.pipeline.discard(&pages).await;
                return Err(self.roll_back(job, identifier, format!("catalog write failed: {e}"), progress));
            }
        };

        tracing::info!(
            job_id = %job.id,
            work_id,
            chapter_id = %chapter_id,
            chapter = %identifier,
            pages = pages.len(),
            "chapter imported"
        );
        progress(ProgressEvent::ChapterImported {
            work_id: work_id.to_string(),
            chapter_id: chapter_id.clone(),
            identifier: identifier.clone(),
            pages: pages.len(),
        });
        spawn_notify(
            self.notifier.clone(),
            NewChapterNotice {
                work_id: work_id.to_string(),
                chapter_id: chapter_id.clone(),
                identifier: identifier.clone(),
                work_name: work_name.to_string(),
            },
        );

        Ok(Some(ImportedChapter {
            chapter_id,
            identifier: identifier.clone(),
            name: chapter.name.clone(),
            pages: pages.len(),
        }))
    }

    async fn already_present(&self, work_id: &str, identifier: &ChapterKey) -> Result<bool, String> {
        let current: Vec<ChapterKey> = self
            .catalog
            .list_chapters(work_id)
            .await
            .map_err(|e| e.to_string())?
            .into_iter()
            .map(|c| c.identifier)
            .collect();
        Ok(!is_new(identifier, &current))
    }

    /// Report a chapter whose import failed. Nothing of it is left in the catalog.
    fn roll_back(
        &self,
        job: &IngestionJob,
        identifier: &ChapterKey,
        reason: String,
        progress: &ProgressFn,
    ) -> String {
        tracing::warn!(job_id = %job.id, chapter = %identifier, error = %reason, "chapter import failed");
        progress(ProgressEvent::ChapterRolledBack {
            work_id: job.work_id.clone(),
            identifier: identifier.clone(),
            reason: reason.clone(),
        });
        reason
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ch(number: Option<f64>, name: &str) -> ChapterRef {
        ChapterRef::new(name, number, format!("loc/{name}"))
    }

    #[test]
    fn last_success_goes_first() {
        assert_eq!(try_order(2, Some(1)), vec![1, 0]);
        assert_eq!(try_order(4, Some(2)), vec![2, 0, 1, 3]);
    }

    #[test]
    fn out_of_range_last_success_is_ignored() {
        assert_eq!(try_order(2, Some(5)), vec![0, 1]);
        assert_eq!(try_order(3, None), vec![0, 1, 2]);
        assert!(try_order(0, Some(0)).is_empty());
    }

    #[test]
    fn selects_only_missing_chapters_ascending() {
        let listed = vec![ch(Some(3.0), "c3"), ch(Some(1.0), "c1"), ch(Some(2.5), "c2.5")];
        let existing = vec![ChapterKey::Label("1.000".into()), ChapterKey::Number(2.0)];
        let (fresh, invalid) = select_new(&listed, &existing, true);
        let keys: Vec<ChapterKey> = fresh.into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![ChapterKey::Number(2.5), ChapterKey::Number(3.0)]);
        assert!(invalid.is_empty());
    }

    #[test]
    fn unnumbered_chapters_are_invalid_when_numbers_required() {
        let listed = vec![ch(None, "Special"), ch(Some(4.0), "c4")];
        let (fresh, invalid) = select_new(&listed, &[], true);
        assert_eq!(fresh.len(), 1);
        assert_eq!(invalid, vec!["Special".to_string()]);
    }

    #[test]
    fn unnumbered_chapters_use_labels_when_allowed() {
        let listed = vec![ch(None, "Special"), ch(Some(4.0), "c4")];
        let existing = vec![ChapterKey::Label("Special".into())];
        let (fresh, _) = select_new(&listed, &existing, false);
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].0, ChapterKey::Number(4.0));

        let (fresh, _) = select_new(&listed, &[], false);
        assert_eq!(
            fresh.into_iter().map(|(k, _)| k).collect::<Vec<_>>(),
            vec![ChapterKey::Number(4.0), ChapterKey::Label("Special".into())]
        );
    }

    #[test]
    fn duplicate_listings_are_selected_once() {
        let listed = vec![ch(Some(5.0), "a"), ch(Some(5.0), "b")];
        let (fresh, _) = select_new(&listed, &[], true);
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].1.name, "a");
    }

    #[test]
    fn attempt_errors_render_verbatim() {
        let err = ResolveError::NoSourceAvailable {
            job_id: "j1".into(),
            errors: vec![
                SourceAttemptError {
                    index: 0,
                    locator: "https://a.test/x".into(),
                    error: SourceError::Empty,
                },
                SourceAttemptError {
                    index: 1,
                    locator: "https://b.test/y".into(),
                    error: SourceError::Unavailable("HTTP 503".into()),
                },
            ],
        };
        assert_eq!(
            err.to_string(),
            "no source available for job j1: source #0 (https://a.test/x): source lists no chapters; \
             source #1 (https://b.test/y): source unavailable: HTTP 503"
        );
    }
}
