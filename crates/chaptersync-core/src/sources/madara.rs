//! Scraper for reader sites built on the Madara WordPress theme.
//!
//! Layouts drift between sites and theme versions, so every field is read
//! through an ordered list of selectors and the first non-empty hit wins.

use std::collections::HashMap;
use std::time::Duration;

use futures_util::future::BoxFuture;
use once_cell::sync::Lazy;
use scraper::{ElementRef, Html, Selector};

use super::numbering::{extract_chapter_number, extract_number_from_url, sort_ascending};
use super::{SourceAdapter, SourceError, parse_blocking, send_text};
use crate::model::{ChapterRef, ParsedSource};

fn sel(css: &str) -> Selector {
    Selector::parse(css).expect("valid selector")
}

static TITLE_SEL: Lazy<Selector> = Lazy::new(|| sel(".post-title h1, .post-title h3"));
static OG_TITLE_SEL: Lazy<Selector> = Lazy::new(|| sel(r#"meta[property="og:title"]"#));
static OG_IMAGE_SEL: Lazy<Selector> = Lazy::new(|| sel(r#"meta[property="og:image"]"#));
static META_DESC_SEL: Lazy<Selector> = Lazy::new(|| sel(r#"meta[name="description"]"#));
static DESC_SELS: Lazy<Vec<Selector>> = Lazy::new(|| {
    vec![
        sel(".description-summary .summary__content"),
        sel(".summary__content"),
        sel(".manga-excerpt"),
    ]
});
static COVER_SEL: Lazy<Selector> = Lazy::new(|| sel(".summary_image img"));
static SUMMARY_ITEM_SEL: Lazy<Selector> = Lazy::new(|| sel(".post-content_item"));
static SUMMARY_HEADING_SEL: Lazy<Selector> = Lazy::new(|| sel(".summary-heading"));
static SUMMARY_CONTENT_SEL: Lazy<Selector> = Lazy::new(|| sel(".summary-content"));
static GENRE_SEL: Lazy<Selector> = Lazy::new(|| sel(".genres-content a"));
static AUTHOR_SEL: Lazy<Selector> = Lazy::new(|| sel(".author-content a"));
static ARTIST_SEL: Lazy<Selector> = Lazy::new(|| sel(".artist-content a"));
static CHAPTER_ITEM_SEL: Lazy<Selector> = Lazy::new(|| sel("li.wp-manga-chapter"));
static LINK_SEL: Lazy<Selector> = Lazy::new(|| sel("a[href]"));

/// Page image strategies, tried in order; the first one yielding URLs wins.
static PAGE_SELS: Lazy<Vec<Selector>> = Lazy::new(|| {
    vec![
        sel(".reading-content .page-break img"),
        sel(".reading-content img"),
        sel("#readerarea img"),
        sel("img.wp-manga-chapter-img"),
    ]
});

/// Lazy-loading themes keep the real URL in a data attribute.
const IMAGE_ATTRS: [&str; 3] = ["data-src", "data-lazy-src", "src"];

pub struct Madara {
    hosts: Vec<String>,
    /// Image host -> mirror host.
    mirrors: HashMap<String, String>,
    pagination_delay: Duration,
}

impl Madara {
    pub fn new(
        hosts: Vec<String>,
        mirrors: HashMap<String, String>,
        pagination_delay: Duration,
    ) -> Self {
        Self {
            hosts,
            mirrors,
            pagination_delay,
        }
    }
}

impl SourceAdapter for Madara {
    fn name(&self) -> &str {
        "Madara"
    }

    fn hosts(&self) -> &[String] {
        &self.hosts
    }

    fn parse<'a>(
        &'a self,
        locator: &'a str,
        client: &'a reqwest::Client,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<ParsedSource, SourceError>> {
        Box::pin(async move {
            let base = format!("{}/", locator.trim_end_matches('/'));
            let html = send_text(client.get(&base), timeout).await?;

            let page_base = base.clone();
            let (mut parsed, mut chapters) =
                parse_blocking(move || parse_series_page(&html, &page_base)).await?;

            // Newer theme versions load the chapter list through admin-ajax.
            if chapters.is_empty() {
                tokio::time::sleep(self.pagination_delay).await;
                let ajax_url = format!("{base}ajax/chapters/");
                let fragment = send_text(
                    client.post(&ajax_url).header("X-Requested-With", "XMLHttpRequest"),
                    timeout,
                )
                .await?;
                let list_base = base.clone();
                chapters =
                    parse_blocking(move || parse_chapter_list(&fragment, &list_base)).await?;
            }

            if chapters.is_empty() {
                return Err(SourceError::Empty);
            }
            sort_ascending(&mut chapters, true);
            parsed.chapters = chapters;
            Ok(parsed)
        })
    }

    fn page_urls<'a>(
        &'a self,
        chapter: &'a ChapterRef,
        client: &'a reqwest::Client,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<Vec<String>, SourceError>> {
        Box::pin(async move {
            let html = send_text(
                client
                    .get(&chapter.locator)
                    .header("Referer", chapter.locator.as_str()),
                timeout,
            )
            .await?;
            let base = chapter.locator.clone();
            parse_blocking(move || extract_page_urls(&html, &base)).await
        })
    }

    fn mirror_for(&self, page_url: &str) -> Option<String> {
        let mut url = reqwest::Url::parse(page_url).ok()?;
        let mirror_host = self.mirrors.get(url.host_str()?)?.clone();
        url.set_host(Some(&mirror_host)).ok()?;
        Some(url.to_string())
    }

    fn referer(&self, chapter: &ChapterRef) -> Option<String> {
        Some(chapter.locator.clone())
    }
}

/// Whitespace-collapsed text content.
fn text_of(el: ElementRef<'_>) -> String {
    el.text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

fn first_text(doc: &Html, selector: &Selector) -> Option<String> {
    doc.select(selector)
        .map(text_of)
        .find(|t| !t.is_empty())
}

fn meta_content(doc: &Html, selector: &Selector) -> Option<String> {
    doc.select(selector)
        .filter_map(|m| m.value().attr("content"))
        .map(str::trim)
        .find(|c| !c.is_empty())
        .map(str::to_string)
}

fn image_src(img: ElementRef<'_>) -> Option<String> {
    IMAGE_ATTRS
        .iter()
        .filter_map(|attr| img.value().attr(attr))
        .map(str::trim)
        .find(|v| !v.is_empty() && !v.starts_with("data:"))
        .map(str::to_string)
}

fn resolve_url(base: &str, href: &str) -> Option<String> {
    let base = reqwest::Url::parse(base).ok()?;
    base.join(href).ok().map(|u| u.to_string())
}

/// Heading -> content pairs of the summary block ("Alternative", "Type", ...).
fn summary_items(doc: &Html) -> Vec<(String, String)> {
    doc.select(&SUMMARY_ITEM_SEL)
        .filter_map(|item| {
            let heading = item.select(&SUMMARY_HEADING_SEL).next().map(text_of)?;
            let content = item.select(&SUMMARY_CONTENT_SEL).next().map(text_of)?;
            Some((heading, content))
        })
        .collect()
}

fn summary_value(items: &[(String, String)], heading: &str) -> Option<String> {
    let heading = heading.to_ascii_lowercase();
    items
        .iter()
        .find(|(h, _)| h.to_ascii_lowercase().contains(&heading))
        .map(|(_, c)| c.trim().to_string())
        .filter(|c| !c.is_empty() && c != "Updating")
}

fn slug_of(locator: &str) -> String {
    locator
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(locator)
        .to_string()
}

/// Parse a series page into metadata and whatever chapter list it embeds.
///
/// Title priority: `.post-title` heading, `og:title`, then the URL slug.
pub fn parse_series_page(html: &str, locator: &str) -> (ParsedSource, Vec<ChapterRef>) {
    let doc = Html::parse_document(html);
    let items = summary_items(&doc);

    let title = first_text(&doc, &TITLE_SEL)
        .or_else(|| meta_content(&doc, &OG_TITLE_SEL))
        .unwrap_or_else(|| slug_of(locator));

    let alt_titles = summary_value(&items, "alternative")
        .map(|alts| {
            alts.split([',', ';', '/'])
                .map(str::trim)
                .filter(|a| !a.is_empty() && *a != title)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let description = DESC_SELS
        .iter()
        .find_map(|s| first_text(&doc, s))
        .or_else(|| meta_content(&doc, &META_DESC_SEL))
        .unwrap_or_default();

    let cover_url = doc
        .select(&COVER_SEL)
        .find_map(image_src)
        .or_else(|| meta_content(&doc, &OG_IMAGE_SEL))
        .and_then(|src| resolve_url(locator, &src));

    let names = |selector: &Selector| -> Vec<String> {
        doc.select(selector)
            .map(text_of)
            .filter(|t| !t.is_empty())
            .collect()
    };
    let join = |v: Vec<String>| (!v.is_empty()).then(|| v.join(", "));

    let release_year = summary_value(&items, "release")
        .and_then(|r| extract_chapter_number(&r))
        .map(|y| y as i32);

    let parsed = ParsedSource {
        title,
        alt_titles,
        description,
        cover_url,
        genres: names(&GENRE_SEL),
        author: join(names(&AUTHOR_SEL)),
        artist: join(names(&ARTIST_SEL)),
        kind: summary_value(&items, "type"),
        release_year,
        chapters: vec![],
    };

    (parsed, chapters_from(&doc, locator))
}

/// Parse a chapter list fragment (the admin-ajax response).
pub fn parse_chapter_list(fragment: &str, base: &str) -> Vec<ChapterRef> {
    chapters_from(&Html::parse_fragment(fragment), base)
}

/// Chapters in native (newest-first) order.
fn chapters_from(doc: &Html, base: &str) -> Vec<ChapterRef> {
    doc.select(&CHAPTER_ITEM_SEL)
        .filter_map(|item| {
            let link = item.select(&LINK_SEL).next()?;
            let href = resolve_url(base, link.value().attr("href")?.trim())?;
            let name = text_of(link);
            let number = extract_chapter_number(&name).or_else(|| extract_number_from_url(&href));
            Some(ChapterRef::new(name, number, href))
        })
        .collect()
}

/// Page image URLs of a chapter page, through the selector cascade.
pub fn extract_page_urls(html: &str, base: &str) -> Vec<String> {
    let doc = Html::parse_document(html);
    PAGE_SELS
        .iter()
        .map(|selector| {
            doc.select(selector)
                .filter_map(image_src)
                .filter_map(|src| resolve_url(base, &src))
                .collect::<Vec<_>>()
        })
        .find(|urls| !urls.is_empty())
        .unwrap_or_default()
}
