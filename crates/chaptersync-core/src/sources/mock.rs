//! Scripted adapter for tests and dry runs.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::future::BoxFuture;

use super::{SourceAdapter, SourceError};
use crate::model::{ChapterRef, ParsedSource};

/// Canned answer for one locator.
#[derive(Debug, Clone)]
pub enum MockResponse {
    Chapters(ParsedSource),
    Empty,
    Error(SourceError),
}

/// Adapter answering from a script instead of the network.
///
/// Locators without a scripted response fail as unavailable. Every `parse`
/// call is recorded, so tests can assert on the order sources were tried.
pub struct MockSource {
    name: String,
    hosts: Vec<String>,
    responses: HashMap<String, MockResponse>,
    pages: HashMap<String, Vec<String>>,
    mirror_prefix: Option<(String, String)>,
    calls: Mutex<Vec<String>>,
    call_count: AtomicUsize,
}

impl MockSource {
    pub fn new(name: &str, hosts: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            hosts: hosts.iter().map(|h| h.to_string()).collect(),
            responses: HashMap::new(),
            pages: HashMap::new(),
            mirror_prefix: None,
            calls: Mutex::new(Vec::new()),
            call_count: AtomicUsize::new(0),
        }
    }

    pub fn respond(mut self, locator: &str, response: MockResponse) -> Self {
        self.responses.insert(locator.to_string(), response);
        self
    }

    /// Script a chapter list, with numbered chapter locators `{locator}/c/{n}`.
    pub fn chapters(self, locator: &str, numbers: &[f64]) -> Self {
        let chapters = numbers
            .iter()
            .map(|n| ChapterRef::new(format!("Chapter {n}"), Some(*n), format!("{locator}/c/{n}")))
            .collect();
        self.respond(
            locator,
            MockResponse::Chapters(ParsedSource {
                title: format!("{} work", locator),
                chapters,
                ..ParsedSource::default()
            }),
        )
    }

    pub fn pages(mut self, chapter_locator: &str, urls: &[&str]) -> Self {
        self.pages.insert(
            chapter_locator.to_string(),
            urls.iter().map(|u| u.to_string()).collect(),
        );
        self
    }

    /// Mirror page URLs by swapping `from` for `to` at the start of the URL.
    pub fn mirror(mut self, from: &str, to: &str) -> Self {
        self.mirror_prefix = Some((from.to_string(), to.to_string()));
        self
    }

    /// Locators passed to `parse`, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }
}

impl SourceAdapter for MockSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn hosts(&self) -> &[String] {
        &self.hosts
    }

    fn parse<'a>(
        &'a self,
        locator: &'a str,
        _client: &'a reqwest::Client,
        _timeout: Duration,
    ) -> BoxFuture<'a, Result<ParsedSource, SourceError>> {
        Box::pin(async move {
            self.call_count.fetch_add(1, Ordering::SeqCst);
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(locator.to_string());
            }
            match self.responses.get(locator) {
                Some(MockResponse::Chapters(parsed)) => Ok(parsed.clone()),
                Some(MockResponse::Empty) => Err(SourceError::Empty),
                Some(MockResponse::Error(e)) => Err(e.clone()),
                None => Err(SourceError::Unavailable(format!("no script for {locator}"))),
            }
        })
    }

    fn page_urls<'a>(
        &'a self,
        chapter: &'a ChapterRef,
        _client: &'a reqwest::Client,
        _timeout: Duration,
    ) -> BoxFuture<'a, Result<Vec<String>, SourceError>> {
        Box::pin(async move { Ok(self.pages.get(&chapter.locator).cloned().unwrap_or_default()) })
    }

    fn mirror_for(&self, page_url: &str) -> Option<String> {
        let (from, to) = self.mirror_prefix.as_ref()?;
        page_url
            .strip_prefix(from.as_str())
            .map(|rest| format!("{to}{rest}"))
    }
}
