//! Page image download for one chapter.
//!
//! Pages are fetched one at a time with a fixed delay between them. A page
//! that fails is retried once through the adapter's mirror, if it has one,
//! and otherwise skipped; a chapter with zero stored pages is an error.
//!
//! Pages are written before the chapter exists in the catalog, under a
//! directory named after the chapter identifier. An interrupted run leaves
//! no catalog record behind, and the next run overwrites the same files.

use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::identity::ChapterKey;
use crate::model::ChapterRef;
use crate::rate_limit::call_with_rate_limit;
use crate::sources::{SourceAdapter, SourceError, send};
use crate::store::{AssetStore, StoreError};
use crate::{Config, ProgressEvent, ProgressFn, RateLimiters};

const IMAGE_EXTENSIONS: [&str; 6] = ["jpg", "jpeg", "png", "webp", "gif", "avif"];
const DEFAULT_EXTENSION: &str = "jpg";

#[derive(Error, Debug)]
pub enum AssetError {
    /// The source listed no pages, or every page failed.
    #[error("no assets found for chapter {chapter}")]
    NoAssetsFound { chapter: String },
    #[error("page listing failed: {0}")]
    Source(#[from] SourceError),
    #[error("asset store failed: {0}")]
    Store(#[from] StoreError),
}

pub struct AssetPipeline {
    client: reqwest::Client,
    assets: Arc<dyn AssetStore>,
    limiters: Arc<RateLimiters>,
    timeout: Duration,
    page_delay: Duration,
}

impl AssetPipeline {
    pub fn new(client: reqwest::Client, assets: Arc<dyn AssetStore>, config: &Config) -> Self {
        Self {
            client,
            assets,
            limiters: config.rate_limiters.clone(),
            timeout: config.http_timeout(),
            page_delay: Duration::from_millis(config.page_delay_ms),
        }
    }

    pub fn with_page_delay(mut self, delay: Duration) -> Self {
        self.page_delay = delay;
        self
    }

    /// Download every page of `chapter` into `{work_id}/{chapter_dir}/` and
    /// return the stored locations, in page order.
    ///
    /// Files are named after the page's position in the source listing, so a
    /// skipped page leaves a gap in the numbering instead of shifting later pages.
    pub async fn download_chapter_assets(
        &self,
        adapter: &dyn SourceAdapter,
        chapter: &ChapterRef,
        work_id: &str,
        chapter_dir: &str,
        progress: &ProgressFn,
    ) -> Result<Vec<String>, AssetError> {
        let urls = call_with_rate_limit(adapter.name(), &self.limiters, self.timeout, progress, || {
            adapter.page_urls(chapter, &self.client, self.timeout)
        })
        .await?;

        if urls.is_empty() {
            return Err(AssetError::NoAssetsFound {
                chapter: chapter.name.clone(),
            });
        }

        progress(ProgressEvent::ChapterStarted {
            work_id: work_id.to_string(),
            chapter: chapter.name.clone(),
            page_count: urls.len(),
        });

        let referer = adapter.referer(chapter);
        let total = urls.len();
        let mut stored = Vec::with_capacity(total);

        for (i, url) in urls.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.page_delay).await;
            }

            let (bytes, via_mirror) = match self.fetch_image(url, referer.as_deref()).await {
                Ok(bytes) => (bytes, false),
                Err(primary) => match adapter.mirror_for(url) {
                    Some(mirror) => match self.fetch_image(&mirror, referer.as_deref()).await {
                        Ok(bytes) => (bytes, true),
                        Err(e) => {
                            self.skip(&chapter.name, i, total, &format!("{primary}; mirror: {e}"), progress);
                            continue;
                        }
                    },
                    None => {
                        self.skip(&chapter.name, i, total, &primary.to_string(), progress);
                        continue;
                    }
                },
            };

            let path = asset_path(work_id, chapter_dir, i, url);
            match self.assets.write_file(&path, &bytes).await {
                Ok(location) => stored.push(location),
                Err(e) => {
                    self.discard(&stored).await;
                    return Err(e.into());
                }
            }
            progress(ProgressEvent::PageDownloaded {
                chapter: chapter.name.clone(),
                page: i + 1,
                total,
                via_mirror,
            });
        }

        if stored.is_empty() {
            return Err(AssetError::NoAssetsFound {
                chapter: chapter.name.clone(),
            });
        }
        tracing::debug!(
            work_id,
            chapter_dir,
            stored = stored.len(),
            listed = total,
            "chapter assets downloaded"
        );
        Ok(stored)
    }

    async fn fetch_image(&self, url: &str, referer: Option<&str>) -> Result<Vec<u8>, SourceError> {
        let mut request = self.client.get(url);
        if let Some(referer) = referer {
            request = request.header("Referer", referer);
        }
        let bytes = send(request, self.timeout)
            .await?
            .bytes()
            .await
            .map_err(|e| SourceError::Unavailable(e.to_string()))?;
        if bytes.is_empty() {
            return Err(SourceError::Unavailable("empty image body".into()));
        }
        Ok(bytes.to_vec())
    }

    fn skip(&self, chapter: &str, index: usize, total: usize, message: &str, progress: &ProgressFn) {
        tracing::warn!(chapter, page = index + 1, total, error = message, "page skipped");
        progress(ProgressEvent::PageSkipped {
            chapter: chapter.to_string(),
            page: index + 1,
            total,
            message: message.to_string(),
        });
    }

    /// Best-effort removal of stored pages that no chapter record will reference.
    pub async fn discard(&self, stored: &[String]) {
        for location in stored {
            if let Err(e) = self.assets.delete(location).await {
                tracing::warn!(location, error = %e, "failed to remove orphaned asset");
            }
        }
    }
}

/// `{work_id}/{chapter_dir}/{NNN}.{ext}`, numbered from 001 by listing position.
pub fn asset_path(work_id: &str, chapter_dir: &str, index: usize, url: &str) -> String {
    format!(
        "{}/{}/{:03}.{}",
        work_id,
        chapter_dir,
        index + 1,
        extension_of(url)
    )
}

/// Directory name for a chapter's pages, stable across runs.
///
/// Numbers keep their decimal form. Labels keep only `[A-Za-z0-9_-]`; when
/// anything else had to be replaced, a short hash of the label is appended so
/// two labels never share a directory.
pub fn chapter_dir(identifier: &ChapterKey) -> String {
    match identifier {
        ChapterKey::Number(_) => identifier.text(),
        ChapterKey::Label(label) => {
            let cleaned: String = label
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
                .collect();
            if !cleaned.is_empty() && cleaned == *label {
                return cleaned;
            }
            let digest = Sha256::digest(label.as_bytes());
            let suffix: String = digest[..4].iter().map(|b| format!("{b:02x}")).collect();
            format!("{cleaned}-{suffix}")
        }
    }
}

/// Image extension from the URL path, defaulting to `jpg`.
pub fn extension_of(url: &str) -> &'static str {
    let path = reqwest::Url::parse(url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| url.split(['?', '#']).next().unwrap_or(url).to_string());
    let ext = path
        .rsplit('/')
        .next()
        .and_then(|file| file.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase());
    ext.and_then(|ext| IMAGE_EXTENSIONS.iter().find(|known| **known == ext).copied())
        .unwrap_or(DEFAULT_EXTENSION)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extensions() {
        assert_eq!(extension_of("https://img.test/a/001.PNG"), "png");
        assert_eq!(extension_of("https://img.test/a/1.webp?token=x"), "webp");
        assert_eq!(extension_of("https://img.test/a/page"), "jpg");
        assert_eq!(extension_of("https://img.test/a.b/page.php"), "jpg");
        assert_eq!(extension_of("not a url/x.gif?y"), "gif");
    }

    #[test]
    fn paths_keep_listing_position() {
        assert_eq!(asset_path("w1", "9", 0, "https://img.test/1.jpg"), "w1/9/001.jpg");
        assert_eq!(asset_path("w1", "9", 11, "https://img.test/x.png"), "w1/9/012.png");
    }

    #[test]
    fn chapter_dirs_follow_identifiers() {
        assert_eq!(chapter_dir(&ChapterKey::Number(12.0)), "12");
        assert_eq!(chapter_dir(&ChapterKey::Number(2.5)), "2.5");
        assert_eq!(chapter_dir(&ChapterKey::Label("Extra_1".into())), "Extra_1");

        let odd = chapter_dir(&ChapterKey::Label("Side/Story".into()));
        assert!(odd.starts_with("Side_Story-"));
        assert_ne!(odd, chapter_dir(&ChapterKey::Label("Side_Story".into())));
        assert!(!chapter_dir(&ChapterKey::Label("..".into())).contains(".."));
        assert!(chapter_dir(&ChapterKey::Label(String::new())).starts_with('-'));
    }
}
