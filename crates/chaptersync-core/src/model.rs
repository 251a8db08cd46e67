//! Records exchanged between adapters, the controller and the stores.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::ChapterKey;

/// One chapter as listed by a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterRef {
    pub name: String,
    pub number: Option<f64>,
    /// Source-specific address of the chapter (URL or opaque slug).
    pub locator: String,
}

impl ChapterRef {
    pub fn new(name: impl Into<String>, number: Option<f64>, locator: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            number,
            locator: locator.into(),
        }
    }
}

/// Normalized result of parsing one source. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedSource {
    pub title: String,
    pub alt_titles: Vec<String>,
    pub description: String,
    pub cover_url: Option<String>,
    pub genres: Vec<String>,
    pub author: Option<String>,
    pub artist: Option<String>,
    /// Publication format, e.g. "Manga" or "Manhwa".
    pub kind: Option<String>,
    pub release_year: Option<i32>,
    /// Ascending by chapter number.
    pub chapters: Vec<ChapterRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
}

impl Frequency {
    pub const ALL: [Frequency; 3] = [Frequency::Daily, Frequency::Weekly, Frequency::Monthly];

    pub fn as_str(&self) -> &'static str {
        match self {
            Frequency::Daily => "daily",
            Frequency::Weekly => "weekly",
            Frequency::Monthly => "monthly",
        }
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Frequency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "daily" => Ok(Frequency::Daily),
            "weekly" => Ok(Frequency::Weekly),
            "monthly" => Ok(Frequency::Monthly),
            other => Err(format!("unknown frequency: {other}")),
        }
    }
}

/// Persistent auto-discovery job. Exactly one per work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionJob {
    pub id: String,
    pub work_id: String,
    /// Ordered alternate source locators.
    pub sources: Vec<String>,
    /// Deprecated single locator, used only when `sources` is empty.
    pub source_url: Option<String>,
    pub frequency: Frequency,
    pub enabled: bool,
    /// Hour of day (0-23); `None` for jobs created before hour assignment.
    pub schedule_hour: Option<u8>,
    pub last_checked: Option<DateTime<Utc>>,
    pub last_success_index: Option<usize>,
    pub last_success_source: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl IngestionJob {
    /// The source list to try: the alternates, else the legacy locator.
    pub fn candidate_sources(&self) -> Vec<String> {
        let sources: Vec<String> = self
            .sources
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if !sources.is_empty() {
            return sources;
        }
        self.source_url
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| vec![s.to_string()])
            .unwrap_or_default()
    }
}

/// Bookkeeping written once at the end of a job run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunBookkeeping {
    pub last_checked: DateTime<Utc>,
    pub source_index: usize,
    pub source_locator: String,
}

/// A cataloged work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Work {
    pub id: String,
    pub name: String,
}

/// A chapter as stored by the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterRecord {
    pub id: String,
    pub work_id: String,
    pub identifier: ChapterKey,
    pub title: String,
    pub pages: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Descriptive fields passed along with a chapter creation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChapterMetadata {
    pub title: String,
    pub source_locator: String,
    pub source_name: String,
}
