//! Source adapters: one implementation per external source family.
//!
//! Adapters share one capability interface, [`SourceAdapter`]. A locator is
//! routed to its adapter by host through the [`SourceRegistry`].

pub mod graphql;
pub mod madara;
pub mod mangadex;
pub mod mock;
pub mod numbering;

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use thiserror::Error;

use crate::Config;
use crate::model::{ChapterRef, ParsedSource};
use crate::rate_limit::check_rate_limit_response;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SourceError {
    /// The locator's host matches no registered adapter.
    #[error("unsupported source: {0}")]
    Unsupported(String),
    /// Network failure, bad status, or a layout the adapter cannot read.
    #[error("source unavailable: {0}")]
    Unavailable(String),
    /// Well-formed response that lists no chapters.
    #[error("source lists no chapters")]
    Empty,
    #[error("rate limited (429)")]
    RateLimited { retry_after: Option<Duration> },
}

/// The built-in source families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceFamily {
    /// Structured REST API.
    MangaDex,
    /// WordPress reader theme, scraped from markup.
    Madara,
    /// Cursor-paginated graph API.
    GraphQl,
}

impl SourceFamily {
    pub const ALL: [SourceFamily; 3] = [
        SourceFamily::MangaDex,
        SourceFamily::Madara,
        SourceFamily::GraphQl,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            SourceFamily::MangaDex => "MangaDex",
            SourceFamily::Madara => "Madara",
            SourceFamily::GraphQl => "GraphQL",
        }
    }

    /// Build the adapter for this family from configuration.
    pub fn build(&self, config: &Config) -> Arc<dyn SourceAdapter> {
        let delay = Duration::from_millis(config.pagination_delay_ms);
        match self {
            SourceFamily::MangaDex => Arc::new(mangadex::MangaDex::new(
                config.mangadex_api_base.clone(),
                delay,
            )),
            SourceFamily::Madara => Arc::new(madara::Madara::new(
                config.madara_hosts.clone(),
                config.mirrors.clone(),
                delay,
            )),
            SourceFamily::GraphQl => {
                Arc::new(graphql::GraphQl::new(config.graphql_hosts.clone(), delay))
            }
        }
    }
}

/// A source family that can parse a work page and list chapter images.
pub trait SourceAdapter: Send + Sync {
    /// Family name, also the rate limiter key.
    fn name(&self) -> &str;

    /// Hosts served by this adapter (subdomains match too).
    fn hosts(&self) -> &[String];

    /// Extract metadata and the ascending chapter list for a work locator.
    fn parse<'a>(
        &'a self,
        locator: &'a str,
        client: &'a reqwest::Client,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<ParsedSource, SourceError>>;

    /// Ordered page image URLs of one chapter. May be empty.
    fn page_urls<'a>(
        &'a self,
        chapter: &'a ChapterRef,
        client: &'a reqwest::Client,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<Vec<String>, SourceError>>;

    /// Alternate URL for a page when the family shards images across mirrors.
    fn mirror_for(&self, _page_url: &str) -> Option<String> {
        None
    }

    /// Referer to send with image requests, for hosts that check it.
    fn referer(&self, _chapter: &ChapterRef) -> Option<String> {
        None
    }
}

/// Summary of one registered family.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct SourceInfo {
    pub name: String,
    pub hosts: Vec<String>,
}

/// Host -> adapter lookup.
#[derive(Clone, Default)]
pub struct SourceRegistry {
    adapters: Vec<Arc<dyn SourceAdapter>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in family.
    pub fn from_config(config: &Config) -> Self {
        let mut registry = Self::new();
        for family in SourceFamily::ALL {
            registry.register(family.build(config));
        }
        registry
    }

    pub fn register(&mut self, adapter: Arc<dyn SourceAdapter>) {
        self.adapters.push(adapter);
    }

    pub fn with(mut self, adapter: Arc<dyn SourceAdapter>) -> Self {
        self.register(adapter);
        self
    }

    /// Find the adapter serving `locator`'s host.
    pub fn lookup(&self, locator: &str) -> Result<Arc<dyn SourceAdapter>, SourceError> {
        let host = host_of(locator).ok_or_else(|| SourceError::Unsupported(locator.to_string()))?;
        self.adapters
            .iter()
            .find(|a| a.hosts().iter().any(|h| host_matches(&host, h)))
            .cloned()
            .ok_or(SourceError::Unsupported(host))
    }

    pub fn families(&self) -> Vec<SourceInfo> {
        self.adapters
            .iter()
            .map(|a| SourceInfo {
                name: a.name().to_string(),
                hosts: a.hosts().to_vec(),
            })
            .collect()
    }
}

/// Lowercased host of a URL locator, with any `www.` prefix removed.
pub fn host_of(locator: &str) -> Option<String> {
    let url = reqwest::Url::parse(locator.trim()).ok()?;
    let host = url.host_str()?.to_ascii_lowercase();
    Some(host.strip_prefix("www.").unwrap_or(&host).to_string())
}

fn host_matches(host: &str, registered: &str) -> bool {
    let registered = registered.trim().to_ascii_lowercase();
    let registered = registered.strip_prefix("www.").unwrap_or(&registered);
    !registered.is_empty()
        && (host == registered || host.ends_with(&format!(".{registered}")))
}

/// Send a request and turn transport errors, 429s and non-2xx statuses into [`SourceError`].
pub(crate) async fn send(
    request: reqwest::RequestBuilder,
    timeout: Duration,
) -> Result<reqwest::Response, SourceError> {
    let resp = request
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| SourceError::Unavailable(e.to_string()))?;
    check_rate_limit_response(&resp)?;
    if !resp.status().is_success() {
        return Err(SourceError::Unavailable(format!("HTTP {}", resp.status())));
    }
    Ok(resp)
}

pub(crate) async fn send_text(
    request: reqwest::RequestBuilder,
    timeout: Duration,
) -> Result<String, SourceError> {
    send(request, timeout)
        .await?
        .text()
        .await
        .map_err(|e| SourceError::Unavailable(e.to_string()))
}

pub(crate) async fn send_json(
    request: reqwest::RequestBuilder,
    timeout: Duration,
) -> Result<serde_json::Value, SourceError> {
    send(request, timeout)
        .await?
        .json()
        .await
        .map_err(|e| SourceError::Unavailable(format!("invalid JSON: {e}")))
}

/// Run a markup parser off the async runtime (scraper types are `!Send`).
pub(crate) async fn parse_blocking<T, F>(f: F) -> Result<T, SourceError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SourceError::Unavailable(e.to_string()))
}
