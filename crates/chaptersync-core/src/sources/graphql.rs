//! Adapter for reader sites exposing a cursor-paginated GraphQL API.
//!
//! Series locators look like `{origin}/series/{slug}`; the endpoint is always
//! `{origin}/graphql`. Chapters are fetched newest-first with
//! `chapters(first, after)` until `pageInfo.hasNextPage` is false.

use std::time::Duration;

use futures_util::future::BoxFuture;
use serde_json::{Value, json};

use super::numbering::{dedupe_by_number, extract_chapter_number, number_from_json, sort_ascending};
use super::{SourceAdapter, SourceError, send_json};
use crate::model::{ChapterRef, ParsedSource};

const PAGE_SIZE: u32 = 50;

/// Upper bound on chapter pages, in case a server never clears `hasNextPage`.
const MAX_PAGES: usize = 200;

const SERIES_QUERY: &str = r#"query Series($slug: String!) {
  series(slug: $slug) {
    id slug title
    localizedTitles { lang text }
    altTitles description coverUrl genres authors artists format year
  }
}"#;

const CHAPTERS_QUERY: &str = r#"query Chapters($slug: String!, $first: Int!, $after: String) {
  series(slug: $slug) {
    chapters(first: $first, after: $after) {
      edges { node { id number name } }
      pageInfo { hasNextPage endCursor }
    }
  }
}"#;

const PAGES_QUERY: &str = r#"query Pages($id: ID!) {
  chapter(id: $id) { pages { url } }
}"#;

pub struct GraphQl {
    hosts: Vec<String>,
    pagination_delay: Duration,
    page_size: u32,
}

impl GraphQl {
    pub fn new(hosts: Vec<String>, pagination_delay: Duration) -> Self {
        Self {
            hosts,
            pagination_delay,
            page_size: PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, size: u32) -> Self {
        self.page_size = size.max(1);
        self
    }

    async fn query(
        &self,
        endpoint: &str,
        operation: &str,
        query: &str,
        variables: Value,
        client: &reqwest::Client,
        timeout: Duration,
    ) -> Result<Value, SourceError> {
        let body = json!({
            "operationName": operation,
            "query": query,
            "variables": variables,
        });
        let response = send_json(client.post(endpoint).json(&body), timeout).await?;
        if let Some(message) = response["errors"]
            .as_array()
            .and_then(|errors| errors.first())
            .and_then(|e| e["message"].as_str())
        {
            return Err(SourceError::Unavailable(format!("GraphQL error: {message}")));
        }
        Ok(response["data"].clone())
    }

    async fn fetch_chapters(
        &self,
        series: &SeriesLocator,
        client: &reqwest::Client,
        timeout: Duration,
    ) -> Result<Vec<ChapterRef>, SourceError> {
        let mut chapters = Vec::new();
        let mut after: Option<String> = None;

        for page in 0..MAX_PAGES {
            if page > 0 {
                tokio::time::sleep(self.pagination_delay).await;
            }
            let data = self
                .query(
                    &series.endpoint,
                    "Chapters",
                    CHAPTERS_QUERY,
                    json!({"slug": series.slug, "first": self.page_size, "after": after}),
                    client,
                    timeout,
                )
                .await?;
            let connection = &data["series"]["chapters"];
            if !connection.is_object() {
                return Err(SourceError::Unavailable("series not found".into()));
            }
            chapters.extend(parse_chapter_nodes(connection, series));

            let info = &connection["pageInfo"];
            match info["endCursor"].as_str() {
                Some(cursor) if info["hasNextPage"].as_bool() == Some(true) => {
                    after = Some(cursor.to_string());
                }
                _ => break,
            }
        }

        dedupe_by_number(&mut chapters);
        sort_ascending(&mut chapters, true);
        Ok(chapters)
    }
}

impl SourceAdapter for GraphQl {
    fn name(&self) -> &str {
        "GraphQL"
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
            let series = SeriesLocator::parse(locator)?;
            let data = self
                .query(
                    &series.endpoint,
                    "Series",
                    SERIES_QUERY,
                    json!({"slug": series.slug}),
                    client,
                    timeout,
                )
                .await?;
            let mut parsed = parse_series(&data["series"], &series.slug)?;

            tokio::time::sleep(self.pagination_delay).await;
            parsed.chapters = self.fetch_chapters(&series, client, timeout).await?;
            if parsed.chapters.is_empty() {
                return Err(SourceError::Empty);
            }
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
            let series = SeriesLocator::parse(&chapter.locator)?;
            let id = chapter_id(&chapter.locator)?;
            let data = self
                .query(
                    &series.endpoint,
                    "Pages",
                    PAGES_QUERY,
                    json!({"id": id}),
                    client,
                    timeout,
                )
                .await?;
            Ok(data["chapter"]["pages"]
                .as_array()
                .into_iter()
                .flatten()
                .filter_map(|p| p["url"].as_str())
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .map(str::to_string)
                .collect())
        })
    }
}

/// A series locator split into its API endpoint and slug.
#[derive(Debug, Clone, PartialEq)]
struct SeriesLocator {
    origin: String,
    endpoint: String,
    slug: String,
}

impl SeriesLocator {
    fn parse(locator: &str) -> Result<Self, SourceError> {
        let url = reqwest::Url::parse(locator)
            .map_err(|e| SourceError::Unavailable(format!("bad locator {locator}: {e}")))?;
        let origin = url.origin().ascii_serialization();
        let mut segments = url.path_segments().into_iter().flatten();
        let slug = loop {
            match segments.next() {
                Some("series") => break segments.next().filter(|s| !s.is_empty()),
                Some(_) => continue,
                None => break None,
            }
        }
        .ok_or_else(|| SourceError::Unavailable(format!("no series slug in locator {locator}")))?;
        Ok(Self {
            endpoint: format!("{origin}/graphql"),
            slug: slug.to_string(),
            origin,
        })
    }

    fn chapter_locator(&self, id: &str) -> String {
        format!("{}/series/{}/chapter/{}", self.origin, self.slug, id)
    }
}

fn chapter_id(locator: &str) -> Result<String, SourceError> {
    locator
        .trim_end_matches('/')
        .rsplit_once("/chapter/")
        .map(|(_, id)| id.to_string())
        .filter(|id| !id.is_empty() && !id.contains('/'))
        .ok_or_else(|| SourceError::Unavailable(format!("no chapter id in locator {locator}")))
}

fn non_empty(value: &Value) -> Option<&str> {
    value.as_str().map(str::trim).filter(|s| !s.is_empty())
}

fn localized_title<'v>(titles: &'v Value, lang: &str) -> Option<&'v str> {
    titles
        .as_array()?
        .iter()
        .filter(|t| t["lang"].as_str() == Some(lang))
        .find_map(|t| non_empty(&t["text"]))
}

fn strings(value: &Value) -> Vec<String> {
    value
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(non_empty)
        .map(str::to_string)
        .collect()
}

/// Title priority: localized English, the main title, localized romaji, then the slug.
fn parse_series(series: &Value, slug: &str) -> Result<ParsedSource, SourceError> {
    if !series.is_object() {
        return Err(SourceError::Unavailable("series not found".into()));
    }
    let titles = &series["localizedTitles"];
    let title = localized_title(titles, "en")
        .or_else(|| non_empty(&series["title"]))
        .or_else(|| localized_title(titles, "ja-ro"))
        .unwrap_or(slug)
        .to_string();

    let mut alt_titles: Vec<String> = Vec::new();
    let localized = titles
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|t| non_empty(&t["text"]));
    let candidates = localized
        .chain(non_empty(&series["title"]))
        .chain(series["altTitles"].as_array().into_iter().flatten().filter_map(non_empty));
    for alt in candidates {
        if alt != title && !alt_titles.iter().any(|a| a == alt) {
            alt_titles.push(alt.to_string());
        }
    }

    let join = |v: Vec<String>| (!v.is_empty()).then(|| v.join(", "));

    Ok(ParsedSource {
        title,
        alt_titles,
        description: non_empty(&series["description"]).unwrap_or("").to_string(),
        cover_url: non_empty(&series["coverUrl"]).map(str::to_string),
        genres: strings(&series["genres"]),
        author: join(strings(&series["authors"])),
        artist: join(strings(&series["artists"])),
        kind: non_empty(&series["format"]).map(str::to_string),
        release_year: series["year"].as_i64().map(|y| y as i32),
        chapters: vec![],
    })
}

fn parse_chapter_nodes(connection: &Value, series: &SeriesLocator) -> Vec<ChapterRef> {
    connection["edges"]
        .as_array()
        .into_iter()
        .flatten()
        .map(|edge| &edge["node"])
        .filter_map(|node| {
            let id = match &node["id"] {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                _ => return None,
            };
            let name = non_empty(&node["name"])
                .map(str::to_string)
                .unwrap_or_else(|| match number_from_json(&node["number"]) {
                    Some(n) => format!("Chapter {n}"),
                    None => format!("Chapter {id}"),
                });
            let number =
                number_from_json(&node["number"]).or_else(|| extract_chapter_number(&name));
            Some(ChapterRef::new(name, number, series.chapter_locator(&id)))
        })
        .collect()
}
