use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Weekday;

pub mod assets;
pub mod config_file;
pub mod identity;
pub mod memory;
pub mod model;
pub mod notify;
pub mod orchestrator;
pub mod rate_limit;
pub mod resolver;
pub mod scheduler;
pub mod service;
pub mod sources;
pub mod store;

// Re-export for convenience
pub use assets::{AssetError, AssetPipeline};
pub use identity::{ChapterKey, is_new, same_chapter};
pub use model::{ChapterRecord, ChapterRef, Frequency, IngestionJob, ParsedSource, Work};
pub use orchestrator::{Orchestrator, TickReport};
pub use rate_limit::RateLimiters;
pub use resolver::{ResolveError, ResolveOutcome, Resolver};
pub use scheduler::{DispatchPolicy, schedule_hour};
pub use service::{IngestionService, JobSpec, JobUpdate, ServiceError};
pub use sources::{SourceAdapter, SourceError, SourceFamily, SourceRegistry};
pub use store::{AssetStore, Catalog, HourFilter, JobStore, Notifier, StoreError};

/// Progress events emitted while resolving a job and downloading its chapters.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    SourceAttempt {
        job_id: String,
        index: usize,
        locator: String,
    },
    SourceFailed {
        job_id: String,
        index: usize,
        locator: String,
        message: String,
    },
    NewChaptersFound {
        job_id: String,
        locator: String,
        count: usize,
    },
    ChapterStarted {
        work_id: String,
        chapter: String,
        page_count: usize,
    },
    PageDownloaded {
        chapter: String,
        page: usize,
        total: usize,
        via_mirror: bool,
    },
    PageSkipped {
        chapter: String,
        page: usize,
        total: usize,
        message: String,
    },
    ChapterImported {
        work_id: String,
        chapter_id: String,
        identifier: ChapterKey,
        pages: usize,
    },
    /// A new chapter could not be imported; its pages were discarded and no
    /// catalog record remains.
    ChapterRolledBack {
        work_id: String,
        identifier: ChapterKey,
        reason: String,
    },
    RateLimitWait {
        source: String,
        wait_duration: Duration,
    },
}

/// Shared progress callback threaded through the controller and the pipeline.
pub type ProgressFn = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

/// A progress callback that drops every event.
pub fn no_progress() -> ProgressFn {
    Arc::new(|_| {})
}

/// Runtime configuration for ingestion.
#[derive(Clone)]
pub struct Config {
    pub database_path: PathBuf,
    pub asset_root: PathBuf,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    /// Delay between follow-up requests of one paginated chapter listing.
    pub pagination_delay_ms: u64,
    /// Delay between two page downloads of one chapter.
    pub page_delay_ms: u64,
    /// Delay between two chapter imports of one job run.
    pub chapter_delay_ms: u64,
    /// Day on which weekly jobs run.
    pub weekly_day: Weekday,
    pub max_concurrent_jobs: usize,
    /// Hours of the legacy quarter-day dispatch for jobs without a schedule hour.
    pub legacy_hours: Vec<u8>,
    /// Skip chapters whose identifier is not numeric.
    pub require_numeric_identifier: bool,
    pub mangadex_api_base: String,
    pub madara_hosts: Vec<String>,
    pub graphql_hosts: Vec<String>,
    /// Image host -> mirror host, for families that shard across mirrors.
    pub mirrors: HashMap<String, String>,
    pub webhook_url: Option<String>,
    pub log_dir: Option<PathBuf>,
    pub rate_limiters: Arc<RateLimiters>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("database_path", &self.database_path)
            .field("asset_root", &self.asset_root)
            .field("http_timeout_secs", &self.http_timeout_secs)
            .field("user_agent", &self.user_agent)
            .field("pagination_delay_ms", &self.pagination_delay_ms)
            .field("page_delay_ms", &self.page_delay_ms)
            .field("chapter_delay_ms", &self.chapter_delay_ms)
            .field("weekly_day", &self.weekly_day)
            .field("max_concurrent_jobs", &self.max_concurrent_jobs)
            .field("legacy_hours", &self.legacy_hours)
            .field(
                "require_numeric_identifier",
                &self.require_numeric_identifier,
            )
            .field("mangadex_api_base", &self.mangadex_api_base)
            .field("madara_hosts", &self.madara_hosts)
            .field("graphql_hosts", &self.graphql_hosts)
            .field("mirrors", &self.mirrors)
            .field("webhook_url", &self.webhook_url.as_ref().map(|_| "***"))
            .field("log_dir", &self.log_dir)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("chaptersync");
        Self {
            database_path: data_dir.join("chaptersync.db"),
            asset_root: data_dir.join("assets"),
            http_timeout_secs: 20,
            user_agent: format!("chaptersync/{}", env!("CARGO_PKG_VERSION")),
            pagination_delay_ms: 500,
            page_delay_ms: 250,
            chapter_delay_ms: 1000,
            weekly_day: Weekday::Sun,
            max_concurrent_jobs: 1,
            legacy_hours: vec![0, 6, 12, 18],
            require_numeric_identifier: true,
            mangadex_api_base: sources::mangadex::DEFAULT_API_BASE.to_string(),
            madara_hosts: vec![],
            graphql_hosts: vec![],
            mirrors: HashMap::new(),
            webhook_url: None,
            log_dir: None,
            rate_limiters: Arc::new(RateLimiters::default()),
        }
    }
}

impl Config {
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    /// Build the shared HTTP client used by adapters and the asset pipeline.
    pub fn build_client(&self) -> reqwest::Client {
        reqwest::Client::builder()
            .user_agent(self.user_agent.clone())
            .pool_max_idle_per_host(2)
            .pool_idle_timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new())
    }
}
