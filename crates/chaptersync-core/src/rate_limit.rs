//! Per-source-family rate limiting with adaptive governor instances.
//!
//! Every API call to a source waits for its family's governor permit via
//! `until_ready()`. On 429 the governor is slowed, the call waits out
//! `Retry-After` (capped at the request timeout) and is retried once.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};

use crate::sources::SourceError;
use crate::{ProgressEvent, ProgressFn};

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// How long after the last 429 the original rate is restored.
const DECAY_AFTER: Duration = Duration::from_secs(60);

/// Per-family limiter whose rate is swapped atomically on 429.
pub struct AdaptiveLimiter {
    limiter: ArcSwap<DirectLimiter>,
    base_period: Duration,
    /// 1 = normal, 2 = half rate, capped at 16.
    current_factor: AtomicU32,
    last_429: std::sync::Mutex<Option<Instant>>,
}

impl AdaptiveLimiter {
    /// Create a limiter with the given period between requests (clamped to at least 1 ms).
    pub fn new(period: Duration) -> Self {
        let period = period.max(Duration::from_millis(1));
        Self {
            limiter: ArcSwap::from(Arc::new(Self::direct(period))),
            base_period: period,
            current_factor: AtomicU32::new(1),
            last_429: std::sync::Mutex::new(None),
        }
    }

    /// Create a limiter allowing `n` requests per second.
    pub fn per_second(n: u32) -> Self {
        let ms = 1000 / n.max(1) as u64;
        Self::new(Duration::from_millis(ms))
    }

    fn direct(period: Duration) -> DirectLimiter {
        // `period` is never zero here, so the quota always exists.
        let quota = Quota::with_period(period)
            .unwrap_or_else(|| Quota::per_second(std::num::NonZeroU32::MIN));
        DirectLimiter::direct(quota)
    }

    /// Wait until a request may be sent.
    pub async fn acquire(&self) {
        self.try_decay();
        let limiter = self.limiter.load();
        limiter.until_ready().await;
    }

    /// Double the slowdown factor and swap in a slower governor.
    pub fn on_rate_limited(&self) {
        if let Ok(mut last) = self.last_429.lock() {
            *last = Some(Instant::now());
        }

        let _ = self
            .current_factor
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |f| {
                Some((f * 2).min(16))
            });

        let factor = self.current_factor.load(Ordering::SeqCst);
        if let Some(scaled) = self.base_period.checked_mul(factor) {
            self.limiter.store(Arc::new(Self::direct(scaled)));
        }
    }

    fn try_decay(&self) {
        let should_restore = self
            .last_429
            .lock()
            .ok()
            .and_then(|last| last.map(|t| t.elapsed() >= DECAY_AFTER))
            .unwrap_or(false);

        if should_restore && self.current_factor.load(Ordering::SeqCst) > 1 {
            self.current_factor.store(1, Ordering::SeqCst);
            self.limiter
                .store(Arc::new(Self::direct(self.base_period)));
        }
    }

    pub fn factor(&self) -> u32 {
        self.current_factor.load(Ordering::SeqCst)
    }
}

/// Collection of per-family rate limiters, keyed by adapter name.
pub struct RateLimiters {
    limiters: HashMap<String, AdaptiveLimiter>,
}

impl Default for RateLimiters {
    fn default() -> Self {
        let mut limiters = HashMap::new();
        // MangaDex documents ~5 req/s per client for the API.
        limiters.insert("MangaDex".to_string(), AdaptiveLimiter::per_second(4));
        // Scraped reader sites: stay well under anything resembling a crawl.
        limiters.insert("Madara".to_string(), AdaptiveLimiter::per_second(1));
        limiters.insert("GraphQL".to_string(), AdaptiveLimiter::per_second(2));
        Self { limiters }
    }
}

impl RateLimiters {
    /// No limiters at all; every call goes straight through.
    pub fn unlimited() -> Self {
        Self {
            limiters: HashMap::new(),
        }
    }

    pub fn with(mut self, name: &str, limiter: AdaptiveLimiter) -> Self {
        self.limiters.insert(name.to_string(), limiter);
        self
    }

    pub fn get(&self, name: &str) -> Option<&AdaptiveLimiter> {
        self.limiters.get(name)
    }
}

/// Map a 429 response to [`SourceError::RateLimited`], extracting Retry-After.
pub fn check_rate_limit_response(resp: &reqwest::Response) -> Result<(), SourceError> {
    if resp.status().as_u16() == 429 {
        let retry_after = resp
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        Err(SourceError::RateLimited { retry_after })
    } else {
        Ok(())
    }
}

/// Parse a Retry-After header value (seconds or HTTP-date).
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    if let Ok(secs) = value.trim().parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    // HTTP-date: use a conservative fixed wait
    if value.contains(',') || value.contains("GMT") {
        return Some(Duration::from_secs(5));
    }
    None
}

/// Run one source call under its family's governor.
///
/// On 429 the governor is slowed, the call sleeps for `Retry-After` (at most
/// `timeout`, 2 s if absent) and is retried once. A second 429 is returned.
pub async fn call_with_rate_limit<T, F, Fut>(
    source: &str,
    limiters: &RateLimiters,
    timeout: Duration,
    progress: &ProgressFn,
    mut call: F,
) -> Result<T, SourceError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SourceError>>,
{
    let limiter = limiters.get(source);
    if let Some(lim) = limiter {
        lim.acquire().await;
    }

    match call().await {
        Err(SourceError::RateLimited { retry_after }) => {
            if let Some(lim) = limiter {
                lim.on_rate_limited();
            }
            let wait = retry_after.unwrap_or(Duration::from_secs(2)).min(timeout);
            tracing::info!(
                source,
                wait_secs = wait.as_secs_f64(),
                "rate limited, waiting before retry"
            );
            progress(ProgressEvent::RateLimitWait {
                source: source.to_string(),
                wait_duration: wait,
            });
            tokio::time::sleep(wait).await;

            if let Some(lim) = limiter {
                lim.acquire().await;
            }
            call().await
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn parse_integer_seconds() {
        assert_eq!(parse_retry_after("5"), Some(Duration::from_secs(5)));
    }

    #[test]
    fn parse_http_date_gmt() {
        let val = "Wed, 21 Oct 2015 07:28:00 GMT";
        assert_eq!(parse_retry_after(val), Some(Duration::from_secs(5)));
    }

    #[test]
    fn parse_garbage_none() {
        assert_eq!(parse_retry_after("soon"), None);
    }

    #[test]
    fn ok_on_200() {
        let http_resp = http::Response::builder().status(200).body("").unwrap();
        let resp = reqwest::Response::from(http_resp);
        assert!(check_rate_limit_response(&resp).is_ok());
    }

    #[test]
    fn rate_limited_429_with_retry_after() {
        let http_resp = http::Response::builder()
            .status(429)
            .header("retry-after", "10")
            .body("")
            .unwrap();
        let resp = reqwest::Response::from(http_resp);
        match check_rate_limit_response(&resp).unwrap_err() {
            SourceError::RateLimited { retry_after } => {
                assert_eq!(retry_after, Some(Duration::from_secs(10)));
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[test]
    fn on_rate_limited_doubles_and_caps() {
        let limiter = AdaptiveLimiter::per_second(10);
        limiter.on_rate_limited();
        assert_eq!(limiter.factor(), 2);
        for _ in 0..10 {
            limiter.on_rate_limited();
        }
        assert_eq!(limiter.factor(), 16);
    }

    #[tokio::test]
    async fn decay_restores_after_cooldown() {
        let limiter = AdaptiveLimiter::per_second(10);
        limiter.on_rate_limited();
        {
            let mut last = limiter.last_429.lock().unwrap();
            *last = Some(Instant::now() - Duration::from_secs(61));
        }
        limiter.acquire().await;
        assert_eq!(limiter.factor(), 1);
    }

    #[test]
    fn default_covers_builtin_families() {
        let limiters = RateLimiters::default();
        for name in ["MangaDex", "Madara", "GraphQL"] {
            assert!(limiters.get(name).is_some(), "missing limiter for {name}");
        }
        assert!(limiters.get("Unknown").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_call_retries_once() {
        let calls = AtomicUsize::new(0);
        let limiters = RateLimiters::unlimited();
        let progress = crate::no_progress();
        let result: Result<(), SourceError> =
            call_with_rate_limit("Test", &limiters, Duration::from_secs(10), &progress, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(SourceError::RateLimited {
                        retry_after: Some(Duration::from_secs(3)),
                    })
                }
            })
            .await;
        assert!(matches!(result, Err(SourceError::RateLimited { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn other_errors_are_not_retried() {
        let calls = AtomicUsize::new(0);
        let limiters = RateLimiters::unlimited();
        let progress = crate::no_progress();
        let result: Result<(), SourceError> =
            call_with_rate_limit("Test", &limiters, Duration::from_secs(10), &progress, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(SourceError::Unavailable("HTTP 500".into())) }
            })
            .await;
        assert!(matches!(result, Err(SourceError::Unavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
