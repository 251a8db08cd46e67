use chaptersync_core::model::{Frequency, IngestionJob, RunBookkeeping};
use chaptersync_core::{HourFilter, JobStore, StoreError};
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::db::{Database, StoreDbError};

const COLUMNS: &str = "id, work_id, sources, source_url, frequency, enabled, schedule_hour, \
                       last_checked, last_success_index, last_success_source, created_at";

/// Raw column values, decoded outside the rusqlite row callback.
struct JobRow {
    id: String,
    work_id: String,
    sources: String,
    source_url: Option<String>,
    frequency: String,
    enabled: bool,
    schedule_hour: Option<i64>,
    last_checked: Option<i64>,
    last_success_index: Option<i64>,
    last_success_source: Option<String>,
    created_at: i64,
}

impl JobRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            work_id: row.get(1)?,
            sources: row.get(2)?,
            source_url: row.get(3)?,
            frequency: row.get(4)?,
            enabled: row.get(5)?,
            schedule_hour: row.get(6)?,
            last_checked: row.get(7)?,
            last_success_index: row.get(8)?,
            last_success_source: row.get(9)?,
            created_at: row.get(10)?,
        })
    }

    fn decode(self) -> Result<IngestionJob, StoreDbError> {
        let corrupt = |message: String| StoreDbError::Corrupt {
            table: "ingestion_jobs",
            message,
        };
        let sources: Vec<String> = serde_json::from_str(&self.sources)
            .map_err(|e| corrupt(format!("job {}: sources: {e}", self.id)))?;
        let frequency: Frequency = self.frequency.parse().map_err(corrupt)?;
        let schedule_hour = match self.schedule_hour {
            Some(h) => Some(
                u8::try_from(h)
                    .ok()
                    .filter(|h| *h < 24)
                    .ok_or_else(|| corrupt(format!("job {}: schedule hour {h}", self.id)))?,
            ),
            None => None,
        };
        Ok(IngestionJob {
            sources,
            frequency,
            schedule_hour,
            source_url: self.source_url,
            enabled: self.enabled,
            last_checked: self.last_checked.and_then(DateTime::<Utc>::from_timestamp_millis),
            last_success_index: self
                .last_success_index
                .and_then(|i| usize::try_from(i).ok()),
            last_success_source: self.last_success_source,
            created_at: DateTime::<Utc>::from_timestamp_millis(self.created_at)
                .unwrap_or_default(),
            id: self.id,
            work_id: self.work_id,
        })
    }
}

fn query_jobs(
    conn: &Connection,
    filter: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<IngestionJob>, StoreDbError> {
    let sql = format!("SELECT {COLUMNS} FROM ingestion_jobs {filter} ORDER BY id");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params, JobRow::read)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(JobRow::decode).collect()
}

fn query_job(
    conn: &Connection,
    filter: &str,
    params: impl rusqlite::Params,
) -> Result<Option<IngestionJob>, StoreDbError> {
    let sql = format!("SELECT {COLUMNS} FROM ingestion_jobs {filter}");
    let row = conn.query_row(&sql, params, JobRow::read).optional()?;
    row.map(JobRow::decode).transpose()
}

fn sources_json(job: &IngestionJob) -> String {
    serde_json::Value::from(job.sources.clone()).to_string()
}

/// [`JobStore`] over the `ingestion_jobs` table. `UNIQUE(work_id)` enforces
/// one job per work.
#[derive(Clone)]
pub struct SqliteJobStore {
    db: Database,
}

impl SqliteJobStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

impl JobStore for SqliteJobStore {
    fn create_job<'a>(&'a self, job: &'a IngestionJob) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            self.db.with_conn(|conn| {
                conn.execute(
                    &format!(
                        "INSERT INTO ingestion_jobs ({COLUMNS})
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
                    ),
                    params![
                        job.id,
                        job.work_id,
                        sources_json(job),
                        job.source_url,
                        job.frequency.as_str(),
                        job.enabled,
                        job.schedule_hour,
                        job.last_checked.map(|t| t.timestamp_millis()),
                        job.last_success_index.map(|i| i as i64),
                        job.last_success_source,
                        job.created_at.timestamp_millis(),
                    ],
                )?;
                Ok(())
            })?;
            Ok(())
        })
    }

    fn get_job<'a>(
        &'a self,
        job_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<IngestionJob>, StoreError>> {
        Box::pin(async move {
            Ok(self
                .db
                .with_conn(|conn| query_job(conn, "WHERE id = ?1", params![job_id]))?)
        })
    }

    fn find_job_by_work<'a>(
        &'a self,
        work_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<IngestionJob>, StoreError>> {
        Box::pin(async move {
            Ok(self
                .db
                .with_conn(|conn| query_job(conn, "WHERE work_id = ?1", params![work_id]))?)
        })
    }

    fn list_jobs(&self) -> BoxFuture<'_, Result<Vec<IngestionJob>, StoreError>> {
        Box::pin(async move { Ok(self.db.with_conn(|conn| query_jobs(conn, "", []))?) })
    }

    fn update_job<'a>(&'a self, job: &'a IngestionJob) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let stored_work: Option<String> = self.db.with_conn(|conn| {
                Ok(conn
                    .query_row(
                        "SELECT work_id FROM ingestion_jobs WHERE id = ?1",
                        params![job.id],
                        |row| row.get(0),
                    )
                    .optional()?)
            })?;
            match stored_work {
                None => return Err(StoreError::NotFound(format!("job {}", job.id))),
                Some(work) if work != job.work_id => {
                    return Err(StoreError::Conflict("a job's work cannot change".into()));
                }
                Some(_) => {}
            }

            self.db.with_conn(|conn| {
                conn.execute(
                    "UPDATE ingestion_jobs SET
                         sources = ?2, source_url = ?3, frequency = ?4, enabled = ?5,
                         schedule_hour = ?6, last_checked = ?7, last_success_index = ?8,
                         last_success_source = ?9
                     WHERE id = ?1",
                    params![
                        job.id,
                        sources_json(job),
                        job.source_url,
                        job.frequency.as_str(),
                        job.enabled,
                        job.schedule_hour,
                        job.last_checked.map(|t| t.timestamp_millis()),
                        job.last_success_index.map(|i| i as i64),
                        job.last_success_source,
                    ],
                )?;
                Ok(())
            })?;
            Ok(())
        })
    }

    fn delete_job<'a>(&'a self, job_id: &'a str) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let deleted = self.db.with_conn(|conn| {
                Ok(conn.execute("DELETE FROM ingestion_jobs WHERE id = ?1", params![job_id])?)
            })?;
            if deleted == 0 {
                return Err(StoreError::NotFound(format!("job {job_id}")));
            }
            Ok(())
        })
    }

    fn find_due_jobs(
        &self,
        frequency: Frequency,
        hour: HourFilter,
    ) -> BoxFuture<'_, Result<Vec<IngestionJob>, StoreError>> {
        Box::pin(async move {
            let jobs = self.db.with_conn(|conn| match hour {
                HourFilter::At(h) => query_jobs(
                    conn,
                    "WHERE enabled = 1 AND frequency = ?1 AND schedule_hour = ?2",
                    params![frequency.as_str(), h],
                ),
                HourFilter::Unassigned => query_jobs(
                    conn,
                    "WHERE enabled = 1 AND frequency = ?1 AND schedule_hour IS NULL",
                    params![frequency.as_str()],
                ),
            })?;
            Ok(jobs)
        })
    }

    fn record_run<'a>(
        &'a self,
        job_id: &'a str,
        run: &'a RunBookkeeping,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let updated = self.db.with_conn(|conn| {
                Ok(conn.execute(
                    "UPDATE ingestion_jobs SET
                         last_checked = ?2, last_success_index = ?3, last_success_source = ?4
                     WHERE id = ?1",
                    params![
                        job_id,
                        run.last_checked.timestamp_millis(),
                        run.source_index as i64,
                        run.source_locator,
                    ],
                )?)
            })?;
            if updated == 0 {
                return Err(StoreError::NotFound(format!("job {job_id}")));
            }
            Ok(())
        })
    }

    fn assign_schedule_hours<'a>(
        &'a self,
        assignments: &'a [(String, u8)],
    ) -> BoxFuture<'a, Result<usize, StoreError>> {
        Box::pin(async move {
            let changed = self.db.with_conn(|conn| {
                let tx = conn.transaction()?;
                let mut changed = 0;
                {
                    let mut stmt = tx.prepare(
                        "UPDATE ingestion_jobs SET schedule_hour = ?2
                         WHERE id = ?1 AND schedule_hour IS NULL",
                    )?;
                    for (job_id, hour) in assignments {
                        changed += stmt.execute(params![job_id, hour])?;
                    }
                }
                tx.commit()?;
                Ok(changed)
            })?;
            tracing::debug!(requested = assignments.len(), changed, "schedule hours assigned");
            Ok(changed)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn job(id: &str, work_id: &str, hour: Option<u8>) -> IngestionJob {
        IngestionJob {
            id: id.into(),
            work_id: work_id.into(),
            sources: vec!["https://a.test/x".into(), "https://b.test/y".into()],
            source_url: None,
            frequency: Frequency::Weekly,
            enabled: true,
            schedule_hour: hour,
            last_checked: None,
            last_success_index: None,
            last_success_source: None,
            created_at: Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap(),
        }
    }

    #[tokio::test]
    async fn job_round_trips_through_sqlite() {
        let store = SqliteJobStore::new(Database::open_in_memory().unwrap());
        let mut original = job("j1", "w1", Some(17));
        original.source_url = Some("https://old.test/z".into());
        store.create_job(&original).await.unwrap();

        let loaded = store.get_job("j1").await.unwrap().unwrap();
        assert_eq!(loaded, original);
        assert_eq!(
            store.find_job_by_work("w1").await.unwrap().map(|j| j.id),
            Some("j1".to_string())
        );
        assert!(store.get_job("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn second_job_for_a_work_conflicts() {
        let store = SqliteJobStore::new(Database::open_in_memory().unwrap());
        store.create_job(&job("j1", "w1", None)).await.unwrap();
        let err = store.create_job(&job("j2", "w1", None)).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn record_run_writes_bookkeeping_only() {
        let store = SqliteJobStore::new(Database::open_in_memory().unwrap());
        store.create_job(&job("j1", "w1", Some(2))).await.unwrap();
        let at = Utc.with_ymd_and_hms(2024, 5, 6, 2, 0, 0).unwrap();
        store
            .record_run(
                "j1",
                &RunBookkeeping {
                    last_checked: at,
                    source_index: 1,
                    source_locator: "https://b.test/y".into(),
                },
            )
            .await
            .unwrap();

        let loaded = store.get_job("j1").await.unwrap().unwrap();
        assert_eq!(loaded.last_checked, Some(at));
        assert_eq!(loaded.last_success_index, Some(1));
        assert_eq!(loaded.last_success_source.as_deref(), Some("https://b.test/y"));
        assert_eq!(loaded.schedule_hour, Some(2));

        let missing = RunBookkeeping {
            last_checked: at,
            source_index: 0,
            source_locator: String::new(),
        };
        assert!(matches!(
            store.record_run("nope", &missing).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn due_query_matches_hour_or_unassigned() {
        let store = SqliteJobStore::new(Database::open_in_memory().unwrap());
        store.create_job(&job("j1", "w1", Some(5))).await.unwrap();
        store.create_job(&job("j2", "w2", None)).await.unwrap();
        let mut disabled = job("j3", "w3", Some(5));
        disabled.enabled = false;
        store.create_job(&disabled).await.unwrap();

        let at_five = store
            .find_due_jobs(Frequency::Weekly, HourFilter::At(5))
            .await
            .unwrap();
        assert_eq!(at_five.iter().map(|j| j.id.as_str()).collect::<Vec<_>>(), vec!["j1"]);
        let legacy = store
            .find_due_jobs(Frequency::Weekly, HourFilter::Unassigned)
            .await
            .unwrap();
        assert_eq!(legacy.iter().map(|j| j.id.as_str()).collect::<Vec<_>>(), vec!["j2"]);
        assert!(
            store
                .find_due_jobs(Frequency::Daily, HourFilter::At(5))
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn backfill_skips_assigned_jobs() {
        let store = SqliteJobStore::new(Database::open_in_memory().unwrap());
        store.create_job(&job("j1", "w1", None)).await.unwrap();
        store.create_job(&job("j2", "w2", Some(3))).await.unwrap();

        let changed = store
            .assign_schedule_hours(&[("j1".into(), 7), ("j2".into(), 9)])
            .await
            .unwrap();
        assert_eq!(changed, 1);
        assert_eq!(store.get_job("j1").await.unwrap().unwrap().schedule_hour, Some(7));
        assert_eq!(store.get_job("j2").await.unwrap().unwrap().schedule_hour, Some(3));
    }

    #[tokio::test]
    async fn update_cannot_move_a_job_to_another_work() {
        let store = SqliteJobStore::new(Database::open_in_memory().unwrap());
        store.create_job(&job("j1", "w1", None)).await.unwrap();

        let mut moved = job("j1", "w2", None);
        moved.enabled = false;
        assert!(matches!(
            store.update_job(&moved).await,
            Err(StoreError::Conflict(_))
        ));

        let mut edited = job("j1", "w1", None);
        edited.enabled = false;
        edited.sources = vec!["https://c.test/z".into()];
        store.update_job(&edited).await.unwrap();
        assert_eq!(store.get_job("j1").await.unwrap().unwrap(), edited);

        store.delete_job("j1").await.unwrap();
        assert!(matches!(
            store.delete_job("j1").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn corrupt_sources_column_is_reported() {
        let db = Database::open_in_memory().unwrap();
        let store = SqliteJobStore::new(db.clone());
        store.create_job(&job("j1", "w1", None)).await.unwrap();
        db.with_conn(|conn| {
            conn.execute("UPDATE ingestion_jobs SET sources = '{not json' WHERE id = 'j1'", [])?;
            Ok(())
        })
        .unwrap();

        assert!(matches!(
            store.get_job("j1").await,
            Err(StoreError::Backend(_))
        ));
    }
}
