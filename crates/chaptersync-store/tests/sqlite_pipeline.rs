//! A job run persisted through SQLite and the filesystem asset store.

use std::sync::Arc;

use chrono::Utc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use chaptersync_core::notify::LogNotifier;
use chaptersync_core::sources::mock::MockSource;
use chaptersync_core::{
    Catalog, ChapterKey, Config, Frequency, IngestionJob, JobStore, RateLimiters, Resolver,
    SourceRegistry, no_progress,
};
use chaptersync_store::{Database, FsAssetStore, SqliteCatalog, SqliteJobStore};

const SOURCE: &str = "https://m.test/tower";

#[tokio::test]
async fn imported_chapter_lands_in_sqlite_and_on_disk() {
    let server = MockServer::start().await;
    for i in 1..=2u8 {
        Mock::given(method("GET"))
            .and(path(format!("/img/{i}.png")))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![i; 4]))
            .mount(&server)
            .await;
    }

    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(&dir.path().join("chaptersync.db")).unwrap();
    db.upsert_work("w1", "Tower").unwrap();
    let catalog = Arc::new(SqliteCatalog::new(db.clone()));
    let jobs = Arc::new(SqliteJobStore::new(db.clone()));
    let assets = Arc::new(FsAssetStore::new(dir.path().join("assets")));

    let job = IngestionJob {
        id: "j1".into(),
        work_id: "w1".into(),
        sources: vec![SOURCE.into()],
        source_url: None,
        frequency: Frequency::Daily,
        enabled: true,
        schedule_hour: Some(3),
        last_checked: None,
        last_success_index: None,
        last_success_source: None,
        created_at: Utc::now(),
    };
    jobs.create_job(&job).await.unwrap();

    let first = format!("{}/img/1.png", server.uri());
    let second = format!("{}/img/2.png", server.uri());
    let source = MockSource::new("M", &["m.test"])
        .chapters(SOURCE, &[1.0])
        .pages(&format!("{SOURCE}/c/1"), &[first.as_str(), second.as_str()]);
    let config = Config {
        pagination_delay_ms: 0,
        page_delay_ms: 0,
        chapter_delay_ms: 0,
        rate_limiters: Arc::new(RateLimiters::unlimited()),
        ..Config::default()
    };
    let resolver = Resolver::new(
        &config,
        SourceRegistry::new().with(Arc::new(source)),
        catalog.clone(),
        jobs.clone(),
        assets.clone(),
        Arc::new(LogNotifier),
    );

    let outcome = resolver.resolve(&job, &no_progress()).await.unwrap();
    assert_eq!(outcome.imported.len(), 1);

    let chapters = catalog.list_chapters("w1").await.unwrap();
    assert_eq!(chapters.len(), 1);
    assert_eq!(chapters[0].identifier, ChapterKey::Number(1.0));
    assert_eq!(chapters[0].pages.len(), 2);
    for (i, page) in chapters[0].pages.iter().enumerate() {
        assert!(page.ends_with(&format!("{:03}.png", i + 1)), "{page}");
        let bytes = std::fs::read(assets.root().join(page)).unwrap();
        assert_eq!(bytes, vec![(i + 1) as u8; 4]);
    }

    let stored = jobs.get_job("j1").await.unwrap().unwrap();
    assert_eq!(stored.last_success_index, Some(0));
    assert_eq!(stored.last_success_source.as_deref(), Some(SOURCE));
    assert!(stored.last_checked.is_some());

    // Reopening the file sees the same state and a second run imports nothing.
    let reopened = SqliteCatalog::new(Database::open(&dir.path().join("chaptersync.db")).unwrap());
    assert_eq!(reopened.list_chapters("w1").await.unwrap().len(), 1);
    let again = resolver.resolve(&stored, &no_progress()).await.unwrap();
    assert!(again.imported.is_empty());
}
