use std::time::Duration;

use futures_util::future::BoxFuture;
use serde_json::Value;

use super::numbering::{dedupe_by_number, extract_chapter_number, number_from_json, sort_ascending};
use super::{SourceAdapter, SourceError, send_json};
use crate::model::{ChapterRef, ParsedSource};

pub const DEFAULT_API_BASE: &str = "https://api.mangadex.org";
const SITE_BASE: &str = "https://mangadex.org";
const UPLOADS_BASE: &str = "https://uploads.mangadex.org";
const FEED_PAGE_SIZE: usize = 100;

/// Language priority for titles and descriptions.
const TITLE_LANGS: [&str; 2] = ["en", "ja-ro"];

pub struct MangaDex {
    api_base: String,
    hosts: Vec<String>,
    pagination_delay: Duration,
    feed_page_size: usize,
}

impl MangaDex {
    pub fn new(api_base: impl Into<String>, pagination_delay: Duration) -> Self {
        Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            hosts: vec!["mangadex.org".to_string()],
            pagination_delay,
            feed_page_size: FEED_PAGE_SIZE,
        }
    }

    /// Override the feed page size (the API caps it at 500).
    pub fn with_feed_page_size(mut self, size: usize) -> Self {
        self.feed_page_size = size.clamp(1, 500);
        self
    }

    async fn fetch_feed(
        &self,
        manga_id: &str,
        client: &reqwest::Client,
        timeout: Duration,
    ) -> Result<Vec<ChapterRef>, SourceError> {
        let url = format!("{}/manga/{}/feed", self.api_base, manga_id);
        let mut chapters = Vec::new();
        let mut offset = 0usize;

        loop {
            if offset > 0 {
                tokio::time::sleep(self.pagination_delay).await;
            }
            let query: Vec<(&str, String)> = vec![
                ("translatedLanguage[]", "en".to_string()),
                ("order[chapter]", "asc".to_string()),
                ("limit", self.feed_page_size.to_string()),
                ("offset", offset.to_string()),
            ];
            let body = send_json(client.get(&url).query(&query), timeout).await?;
            let (page, total) = parse_feed_page(&body)?;
            let fetched = body["data"].as_array().map(|d| d.len()).unwrap_or(0);
            chapters.extend(page);

            offset += self.feed_page_size;
            if fetched == 0 || offset >= total {
                break;
            }
        }

        dedupe_by_number(&mut chapters);
        sort_ascending(&mut chapters, false);
        Ok(chapters)
    }
}

impl SourceAdapter for MangaDex {
    fn name(&self) -> &str {
        "MangaDex"
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
            let id = path_id(locator, "title")?;
            let url = format!("{}/manga/{}", self.api_base, id);
            let includes = [
                ("includes[]", "cover_art"),
                ("includes[]", "author"),
                ("includes[]", "artist"),
            ];
            let body = send_json(client.get(&url).query(&includes), timeout).await?;
            let mut parsed = parse_manga(&id, &body["data"])?;

            parsed.chapters = self.fetch_feed(&id, client, timeout).await?;
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
            let id = path_id(&chapter.locator, "chapter")?;
            let url = format!("{}/at-home/server/{}", self.api_base, id);
            let body = send_json(client.get(&url), timeout).await?;
            parse_at_home(&body)
        })
    }

    /// Every at-home node serves `/data/{hash}/{file}`; the uploads host is the origin.
    fn mirror_for(&self, page_url: &str) -> Option<String> {
        let url = reqwest::Url::parse(page_url).ok()?;
        let path = url.path();
        let data_at = path.find("/data/")?;
        let mirror = format!("{}{}", UPLOADS_BASE, &path[data_at..]);
        (mirror != page_url).then_some(mirror)
    }
}

/// The path segment following `marker`, e.g. the UUID in `/title/{uuid}/slug`.
fn path_id(locator: &str, marker: &str) -> Result<String, SourceError> {
    let url = reqwest::Url::parse(locator)
        .map_err(|e| SourceError::Unavailable(format!("bad locator {locator}: {e}")))?;
    let mut segments = url.path_segments().into_iter().flatten();
    while let Some(seg) = segments.next() {
        if seg == marker
            && let Some(id) = segments.next().filter(|s| !s.is_empty())
        {
            return Ok(id.to_string());
        }
    }
    Err(SourceError::Unavailable(format!(
        "no {marker} id in locator {locator}"
    )))
}

/// First value for `lang` in a `{lang: text}` map, ignoring blanks.
fn localized<'v>(map: &'v Value, lang: &str) -> Option<&'v str> {
    map.get(lang)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// First value for `lang` across the `altTitles` list of maps.
fn alt_localized<'v>(alt_titles: &'v Value, lang: &str) -> Option<&'v str> {
    alt_titles
        .as_array()?
        .iter()
        .find_map(|m| localized(m, lang))
}

fn first_value(map: &Value) -> Option<&str> {
    map.as_object()?
        .values()
        .filter_map(Value::as_str)
        .map(str::trim)
        .find(|s| !s.is_empty())
}

/// Title priority: `title.en`, `altTitles.en`, `title.ja-ro`, `altTitles.ja-ro`,
/// any `title` value, then the manga id.
fn pick_title(id: &str, attrs: &Value) -> String {
    TITLE_LANGS
        .iter()
        .find_map(|lang| {
            localized(&attrs["title"], lang).or_else(|| alt_localized(&attrs["altTitles"], lang))
        })
        .or_else(|| first_value(&attrs["title"]))
        .unwrap_or(id)
        .to_string()
}

fn kind_for_language(lang: &str) -> &'static str {
    match lang {
        "ja" => "Manga",
        "ko" => "Manhwa",
        "zh" | "zh-hk" => "Manhua",
        _ => "Comic",
    }
}

fn relationship<'v>(data: &'v Value, kind: &str) -> Option<&'v Value> {
    data["relationships"]
        .as_array()?
        .iter()
        .find(|r| r["type"].as_str() == Some(kind))
}

fn parse_manga(id: &str, data: &Value) -> Result<ParsedSource, SourceError> {
    let attrs = &data["attributes"];
    if !attrs.is_object() {
        return Err(SourceError::Unavailable(
            "manga response has no attributes".into(),
        ));
    }

    let title = pick_title(id, attrs);

    let mut alt_titles: Vec<String> = Vec::new();
    for map in attrs["altTitles"].as_array().into_iter().flatten() {
        for value in map.as_object().into_iter().flat_map(|m| m.values()) {
            if let Some(t) = value.as_str().map(str::trim)
                && !t.is_empty()
                && t != title
                && !alt_titles.iter().any(|a| a == t)
            {
                alt_titles.push(t.to_string());
            }
        }
    }

    let description = localized(&attrs["description"], "en")
        .or_else(|| first_value(&attrs["description"]))
        .unwrap_or("")
        .to_string();

    let cover_url = relationship(data, "cover_art")
        .and_then(|r| r["attributes"]["fileName"].as_str())
        .map(|file| format!("{UPLOADS_BASE}/covers/{id}/{file}"));

    let genres = attrs["tags"]
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|t| localized(&t["attributes"]["name"], "en"))
        .map(str::to_string)
        .collect();

    let person = |kind: &str| {
        relationship(data, kind)
            .and_then(|r| r["attributes"]["name"].as_str())
            .map(str::to_string)
    };

    Ok(ParsedSource {
        title,
        alt_titles,
        description,
        cover_url,
        genres,
        author: person("author"),
        artist: person("artist"),
        kind: attrs["originalLanguage"]
            .as_str()
            .map(|l| kind_for_language(l).to_string()),
        release_year: attrs["year"].as_i64().map(|y| y as i32),
        chapters: vec![],
    })
}

/// One page of the chapter feed, plus the reported total.
fn parse_feed_page(body: &Value) -> Result<(Vec<ChapterRef>, usize), SourceError> {
    let data = body["data"]
        .as_array()
        .ok_or_else(|| SourceError::Unavailable("feed response has no data".into()))?;
    let total = body["total"].as_u64().unwrap_or(0) as usize;

    let chapters = data
        .iter()
        .filter_map(|entry| {
            let id = entry["id"].as_str()?;
            let attrs = &entry["attributes"];
            // Externally hosted chapters carry no pages here
            if attrs["externalUrl"].as_str().is_some() || attrs["pages"].as_u64() == Some(0) {
                return None;
            }
            let label = attrs["chapter"].as_str().map(str::trim).filter(|s| !s.is_empty());
            let chapter_title = attrs["title"].as_str().map(str::trim).filter(|s| !s.is_empty());
            let name = match (label, chapter_title) {
                (Some(c), Some(t)) => format!("Chapter {c}: {t}"),
                (Some(c), None) => format!("Chapter {c}"),
                (None, Some(t)) => t.to_string(),
                (None, None) => "Oneshot".to_string(),
            };
            let number = number_from_json(&attrs["chapter"])
                .or_else(|| chapter_title.and_then(extract_chapter_number));
            Some(ChapterRef::new(
                name,
                number,
                format!("{SITE_BASE}/chapter/{id}"),
            ))
        })
        .collect();

    Ok((chapters, total))
}

fn parse_at_home(body: &Value) -> Result<Vec<String>, SourceError> {
    let base = body["baseUrl"]
        .as_str()
        .ok_or_else(|| SourceError::Unavailable("at-home response has no baseUrl".into()))?
        .trim_end_matches('/');
    let hash = body["chapter"]["hash"]
        .as_str()
        .ok_or_else(|| SourceError::Unavailable("at-home response has no hash".into()))?;
    Ok(body["chapter"]["data"]
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
        .map(|file| format!("{base}/data/{hash}/{file}"))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manga(attrs: Value) -> Value {
        json!({
            "id": "m1",
            "attributes": attrs,
            "relationships": [
                {"type": "cover_art", "attributes": {"fileName": "cover.jpg"}},
                {"type": "author", "attributes": {"name": "Writer"}},
                {"type": "artist", "attributes": {"name": "Painter"}}
            ]
        })
    }

    #[test]
    fn english_title_preferred() {
        let data = manga(json!({
            "title": {"ja-ro": "Romaji", "en": "English"},
            "altTitles": [{"en": "Alt English"}]
        }));
        assert_eq!(parse_manga("m1", &data).unwrap().title, "English");
    }

    #[test]
    fn english_alt_title_beats_romaji_main_title() {
        let data = manga(json!({
            "title": {"ja-ro": "Romaji"},
            "altTitles": [{"ja": "日本語"}, {"en": "Alt English"}]
        }));
        let parsed = parse_manga("m1", &data).unwrap();
        assert_eq!(parsed.title, "Alt English");
        assert_eq!(parsed.alt_titles, vec!["日本語".to_string()]);
    }

    #[test]
    fn romaji_then_any_then_id() {
        let romaji = manga(json!({"title": {"ja-ro": "Romaji", "ko": "Korean"}}));
        assert_eq!(parse_manga("m1", &romaji).unwrap().title, "Romaji");

        let any = manga(json!({"title": {"ko": "Korean"}}));
        assert_eq!(parse_manga("m1", &any).unwrap().title, "Korean");

        let none = manga(json!({"title": {}}));
        assert_eq!(parse_manga("m1", &none).unwrap().title, "m1");
    }

    #[test]
    fn metadata_fields() {
        let data = manga(json!({
            "title": {"en": "T"},
            "description": {"fr": "Bonjour", "en": "Hello"},
            "tags": [{"attributes": {"name": {"en": "Action"}}}],
            "originalLanguage": "ko",
            "year": 2019
        }));
        let parsed = parse_manga("m1", &data).unwrap();
        assert_eq!(parsed.description, "Hello");
        assert_eq!(
            parsed.cover_url.as_deref(),
            Some("https://uploads.mangadex.org/covers/m1/cover.jpg")
        );
        assert_eq!(parsed.genres, vec!["Action".to_string()]);
        assert_eq!(parsed.author.as_deref(), Some("Writer"));
        assert_eq!(parsed.artist.as_deref(), Some("Painter"));
        assert_eq!(parsed.kind.as_deref(), Some("Manhwa"));
        assert_eq!(parsed.release_year, Some(2019));
    }

    #[test]
    fn feed_skips_external_and_empty_chapters() {
        let body = json!({
            "total": 4,
            "data": [
                {"id": "c1", "attributes": {"chapter": "1", "title": "Start", "pages": 20}},
                {"id": "c2", "attributes": {"chapter": "2", "externalUrl": "https://elsewhere.test"}},
                {"id": "c3", "attributes": {"chapter": "3", "pages": 0}},
                {"id": "c4", "attributes": {"chapter": null, "title": "Special", "pages": 5}}
            ]
        });
        let (chapters, total) = parse_feed_page(&body).unwrap();
        assert_eq!(total, 4);
        assert_eq!(chapters.len(), 2);
        assert_eq!(chapters[0].name, "Chapter 1: Start");
        assert_eq!(chapters[0].number, Some(1.0));
        assert_eq!(chapters[0].locator, "https://mangadex.org/chapter/c1");
        assert_eq!(chapters[1].name, "Special");
        assert_eq!(chapters[1].number, None);
    }

    #[test]
    fn at_home_urls() {
        let body = json!({
            "baseUrl": "https://node.test/",
            "chapter": {"hash": "h1", "data": ["1.png", "2.png"]}
        });
        assert_eq!(
            parse_at_home(&body).unwrap(),
            vec![
                "https://node.test/data/h1/1.png".to_string(),
                "https://node.test/data/h1/2.png".to_string()
            ]
        );
    }

    #[test]
    fn mirror_points_at_uploads_host() {
        let md = MangaDex::new(DEFAULT_API_BASE, Duration::ZERO);
        assert_eq!(
            md.mirror_for("https://node.test/token/data/h1/1.png").as_deref(),
            Some("https://uploads.mangadex.org/data/h1/1.png")
        );
        assert_eq!(md.mirror_for("https://uploads.mangadex.org/data/h1/1.png"), None);
        assert_eq!(md.mirror_for("https://node.test/covers/x.png"), None);
    }

    #[test]
    fn ids_from_locators() {
        assert_eq!(
            path_id("https://mangadex.org/title/abc-123/some-slug", "title").unwrap(),
            "abc-123"
        );
        assert!(path_id("https://mangadex.org/user/abc", "title").is_err());
    }
}
