use std::path::Path;
use std::sync::{Arc, Mutex};

use chaptersync_core::StoreError;
use chaptersync_core::model::Work;
use rusqlite::{Connection, ErrorCode, OpenFlags, params};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreDbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt row in {table}: {message}")]
    Corrupt {
        table: &'static str,
        message: String,
    },
    #[error("database lock poisoned")]
    Poisoned,
}

impl From<StoreDbError> for StoreError {
    fn from(e: StoreDbError) -> Self {
        match e {
            StoreDbError::Sqlite(rusqlite::Error::SqliteFailure(f, msg))
                if f.code == ErrorCode::ConstraintViolation =>
            {
                StoreError::Conflict(msg.unwrap_or_else(|| f.to_string()))
            }
            StoreDbError::Io(e) => StoreError::Io(e),
            other => StoreError::Backend(other.to_string()),
        }
    }
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS works (
    id   TEXT PRIMARY KEY,
    name TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS chapters (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    work_id        TEXT NOT NULL REFERENCES works(id) ON DELETE CASCADE,
    number         REAL,
    label          TEXT,
    title          TEXT NOT NULL,
    source_locator TEXT NOT NULL,
    source_name    TEXT NOT NULL,
    created_at     INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_chapters_work ON chapters (work_id);

CREATE TABLE IF NOT EXISTS chapter_pages (
    chapter_id INTEGER NOT NULL REFERENCES chapters(id) ON DELETE CASCADE,
    position   INTEGER NOT NULL,
    path       TEXT NOT NULL,
    PRIMARY KEY (chapter_id, position)
);

CREATE TABLE IF NOT EXISTS ingestion_jobs (
    id                  TEXT PRIMARY KEY,
    work_id             TEXT NOT NULL UNIQUE,
    sources             TEXT NOT NULL,
    source_url          TEXT,
    frequency           TEXT NOT NULL,
    enabled             INTEGER NOT NULL,
    schedule_hour       INTEGER,
    last_checked        INTEGER,
    last_success_index  INTEGER,
    last_success_source TEXT,
    created_at          INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_jobs_due ON ingestion_jobs (frequency, schedule_hour);
";

fn open_sqlite(path: &Path) -> Result<Connection, rusqlite::Error> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = Connection::open_with_flags(path, flags)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA busy_timeout = 5000;",
    )?;
    Ok(conn)
}

/// A SQLite database holding works, chapters and ingestion jobs.
///
/// Cloning is cheap: clones share the connection. Statements are short and
/// run under the lock on the calling task.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the database file, creating parent directories.
    pub fn open(path: &Path) -> Result<Self, StoreDbError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        Self::init(open_sqlite(path)?)
    }

    /// A private in-memory database.
    pub fn open_in_memory() -> Result<Self, StoreDbError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreDbError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Insert or rename a work.
    pub fn upsert_work(&self, id: &str, name: &str) -> Result<(), StoreDbError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO works (id, name) VALUES (?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET name = excluded.name",
                params![id, name],
            )?;
            Ok(())
        })
    }

    pub fn list_works(&self) -> Result<Vec<Work>, StoreDbError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id, name FROM works ORDER BY id")?;
            let works = stmt
                .query_map([], |row| {
                    Ok(Work {
                        id: row.get(0)?,
                        name: row.get(1)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(works)
        })
    }

    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, StoreDbError>,
    ) -> Result<T, StoreDbError> {
        let mut conn = self.conn.lock().map_err(|_| StoreDbError::Poisoned)?;
        f(&mut conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_violation_maps_to_conflict() {
        let db = Database::open_in_memory().unwrap();
        let err = db
            .with_conn(|conn| {
                conn.execute("INSERT INTO works (id, name) VALUES ('w', 'a')", [])?;
                conn.execute("INSERT INTO works (id, name) VALUES ('w', 'b')", [])?;
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(StoreError::from(err), StoreError::Conflict(_)));
    }

    #[test]
    fn upsert_renames_existing_work() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_work("w1", "Old").unwrap();
        db.upsert_work("w1", "New").unwrap();
        let works = db.list_works().unwrap();
        assert_eq!(works.len(), 1);
        assert_eq!(works[0].name, "New");
    }

    #[test]
    fn open_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deeper/chaptersync.db");
        Database::open(&path).unwrap();
        assert!(path.exists());
    }
}
