use chaptersync_core::model::{ChapterMetadata, ChapterRecord, Work};
use chaptersync_core::{Catalog, ChapterKey, StoreError};
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use rusqlite::{Connection, OptionalExtension, params};

use crate::db::{Database, StoreDbError};

/// [`Catalog`] over the `works`, `chapters` and `chapter_pages` tables.
///
/// A chapter identifier is stored in `number` when numeric and in `label`
/// otherwise; exactly one of the two is set.
#[derive(Clone)]
pub struct SqliteCatalog {
    db: Database,
}

impl SqliteCatalog {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

fn parse_chapter_id(chapter_id: &str) -> Result<i64, StoreError> {
    chapter_id
        .parse()
        .map_err(|_| StoreError::NotFound(format!("chapter {chapter_id}")))
}

fn key_columns(identifier: &ChapterKey) -> (Option<f64>, Option<String>) {
    match identifier {
        ChapterKey::Number(n) => (Some(*n), None),
        ChapterKey::Label(s) => (None, Some(s.clone())),
    }
}

fn pages_of(conn: &Connection, chapter_id: i64) -> Result<Vec<String>, StoreDbError> {
    let mut stmt =
        conn.prepare("SELECT path FROM chapter_pages WHERE chapter_id = ?1 ORDER BY position")?;
    let pages = stmt
        .query_map(params![chapter_id], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(pages)
}

fn insert_pages(
    conn: &Connection,
    chapter_id: i64,
    first_position: i64,
    pages: &[String],
) -> Result<(), StoreDbError> {
    let mut stmt = conn.prepare(
        "INSERT INTO chapter_pages (chapter_id, position, path) VALUES (?1, ?2, ?3)",
    )?;
    for (offset, path) in pages.iter().enumerate() {
        stmt.execute(params![chapter_id, first_position + offset as i64, path])?;
    }
    Ok(())
}

impl Catalog for SqliteCatalog {
    fn find_work<'a>(&'a self, work_id: &'a str) -> BoxFuture<'a, Result<Work, StoreError>> {
        Box::pin(async move {
            let work = self.db.with_conn(|conn| {
                Ok(conn
                    .query_row(
                        "SELECT id, name FROM works WHERE id = ?1",
                        params![work_id],
                        |row| {
                            Ok(Work {
                                id: row.get(0)?,
                                name: row.get(1)?,
                            })
                        },
                    )
                    .optional()?)
            })?;
            work.ok_or_else(|| StoreError::NotFound(format!("work {work_id}")))
        })
    }

    fn list_chapters<'a>(
        &'a self,
        work_id: &'a str,
    ) -> BoxFuture<'a, Result<Vec<ChapterRecord>, StoreError>> {
        Box::pin(async move {
            let chapters = self.db.with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, number, label, title, created_at FROM chapters
                     WHERE work_id = ?1 ORDER BY id",
                )?;
                let rows = stmt
                    .query_map(params![work_id], |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, Option<f64>>(1)?,
                            row.get::<_, Option<String>>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, i64>(4)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;

                let mut chapters = Vec::with_capacity(rows.len());
                for (id, number, label, title, created_at) in rows {
                    let identifier = match (number, label) {
                        (Some(n), _) => ChapterKey::Number(n),
                        (None, Some(s)) => ChapterKey::Label(s),
                        (None, None) => {
                            return Err(StoreDbError::Corrupt {
                                table: "chapters",
                                message: format!("chapter {id} has no identifier"),
                            });
                        }
                    };
                    chapters.push(ChapterRecord {
                        id: id.to_string(),
                        work_id: work_id.to_string(),
                        identifier,
                        title,
                        pages: pages_of(conn, id)?,
                        created_at: DateTime::<Utc>::from_timestamp_millis(created_at)
                            .unwrap_or_default(),
                    });
                }
                Ok(chapters)
            })?;
            Ok(chapters)
        })
    }

    fn create_chapter<'a>(
        &'a self,
        work_id: &'a str,
        identifier: &'a ChapterKey,
        pages: &'a [String],
        metadata: &'a ChapterMetadata,
    ) -> BoxFuture<'a, Result<String, StoreError>> {
        Box::pin(async move {
            let (number, label) = key_columns(identifier);
            let id = self.db.with_conn(|conn| {
                let tx = conn.transaction()?;
                let exists: bool = tx.query_row(
                    "SELECT EXISTS (SELECT 1 FROM works WHERE id = ?1)",
                    params![work_id],
                    |row| row.get(0),
                )?;
                if !exists {
                    return Ok(None);
                }
                tx.execute(
                    "INSERT INTO chapters
                         (work_id, number, label, title, source_locator, source_name, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        work_id,
                        number,
                        label,
                        metadata.title,
                        metadata.source_locator,
                        metadata.source_name,
                        Utc::now().timestamp_millis(),
                    ],
                )?;
                let id = tx.last_insert_rowid();
                insert_pages(&tx, id, 0, pages)?;
                tx.commit()?;
                Ok(Some(id))
            })?;
            let id = id.ok_or_else(|| StoreError::NotFound(format!("work {work_id}")))?;
            tracing::debug!(work_id, chapter_id = id, chapter = %identifier, "chapter created");
            Ok(id.to_string())
        })
    }

    fn append_pages<'a>(
        &'a self,
        chapter_id: &'a str,
        pages: &'a [String],
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let id = parse_chapter_id(chapter_id)?;
            let found = self.db.with_conn(|conn| {
                let tx = conn.transaction()?;
                let exists: bool = tx.query_row(
                    "SELECT EXISTS (SELECT 1 FROM chapters WHERE id = ?1)",
                    params![id],
                    |row| row.get(0),
                )?;
                if !exists {
                    return Ok(false);
                }
                let next: i64 = tx.query_row(
                    "SELECT COALESCE(MAX(position) + 1, 0) FROM chapter_pages WHERE chapter_id = ?1",
                    params![id],
                    |row| row.get(0),
                )?;
                insert_pages(&tx, id, next, pages)?;
                tx.commit()?;
                Ok(true)
            })?;
            if !found {
                return Err(StoreError::NotFound(format!("chapter {chapter_id}")));
            }
            Ok(())
        })
    }

    fn delete_chapter<'a>(&'a self, chapter_id: &'a str) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let id = parse_chapter_id(chapter_id)?;
            self.db.with_conn(|conn| {
                conn.execute("DELETE FROM chapters WHERE id = ?1", params![id])?;
                Ok(())
            })?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> SqliteCatalog {
        let db = Database::open_in_memory().unwrap();
        db.upsert_work("w1", "Tower").unwrap();
        SqliteCatalog::new(db)
    }

    fn meta(title: &str) -> ChapterMetadata {
        ChapterMetadata {
            title: title.into(),
            source_locator: "https://a.test/c/1".into(),
            source_name: "A".into(),
        }
    }

    #[tokio::test]
    async fn chapters_keep_identifier_kind_and_page_order() {
        let catalog = catalog();
        let numeric = catalog
            .create_chapter("w1", &ChapterKey::Number(12.5), &[], &meta("Chapter 12.5"))
            .await
            .unwrap();
        catalog
            .create_chapter("w1", &ChapterKey::Label("Extra".into()), &[], &meta("Extra"))
            .await
            .unwrap();

        catalog
            .append_pages(&numeric, &["w1/1/001.jpg".into(), "w1/1/002.jpg".into()])
            .await
            .unwrap();
        catalog
            .append_pages(&numeric, &["w1/1/003.jpg".into()])
            .await
            .unwrap();

        let chapters = catalog.list_chapters("w1").await.unwrap();
        assert_eq!(chapters.len(), 2);
        assert_eq!(chapters[0].identifier, ChapterKey::Number(12.5));
        assert_eq!(chapters[0].title, "Chapter 12.5");
        assert_eq!(
            chapters[0].pages,
            vec!["w1/1/001.jpg", "w1/1/002.jpg", "w1/1/003.jpg"]
        );
        assert_eq!(chapters[1].identifier, ChapterKey::Label("Extra".into()));
        assert!(chapters[1].pages.is_empty());
    }

    #[tokio::test]
    async fn delete_removes_chapter_and_pages() {
        let catalog = catalog();
        let id = catalog
            .create_chapter("w1", &ChapterKey::Number(1.0), &["p.jpg".into()], &meta("1"))
            .await
            .unwrap();
        catalog.delete_chapter(&id).await.unwrap();
        assert!(catalog.list_chapters("w1").await.unwrap().is_empty());

        let orphan_pages: i64 = catalog
            .db
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM chapter_pages", [], |row| row.get(0))?)
            })
            .unwrap();
        assert_eq!(orphan_pages, 0);
    }

    #[tokio::test]
    async fn unknown_work_and_chapter_are_not_found() {
        let catalog = catalog();
        assert!(matches!(
            catalog.find_work("nope").await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            catalog
                .create_chapter("nope", &ChapterKey::Number(1.0), &[], &meta("1"))
                .await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            catalog.append_pages("999", &["x".into()]).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            catalog.append_pages("not-an-id", &[]).await,
            Err(StoreError::NotFound(_))
        ));
        assert_eq!(catalog.find_work("w1").await.unwrap().name, "Tower");
    }
}
