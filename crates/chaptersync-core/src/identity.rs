//! Chapter identity: deciding whether a listed chapter is already in the catalog.
//!
//! Sources and the catalog disagree on how a chapter number is written
//! (`12`, `12.0`, `"12.000"`). Identifiers are compared in three steps:
//!
//! 1. if either side is non-numeric, compare the textual forms exactly
//!    (case-sensitive);
//! 2. if both are numeric and integral, compare exactly;
//! 3. if both are numeric and at least one is fractional, accept an absolute
//!    difference below [`NUMERIC_TOLERANCE`].

use std::fmt;

use serde::{Deserialize, Serialize};

/// Maximum distance at which two fractional chapter numbers are the same chapter.
pub const NUMERIC_TOLERANCE: f64 = 0.001;

/// A chapter identifier as stored by the catalog: a number or a free label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChapterKey {
    Number(f64),
    Label(String),
}

impl ChapterKey {
    /// The numeric value, if this identifier is (or spells) a finite number.
    pub fn numeric(&self) -> Option<f64> {
        let value = match self {
            ChapterKey::Number(n) => *n,
            ChapterKey::Label(s) => s.trim().parse::<f64>().ok()?,
        };
        value.is_finite().then_some(value)
    }

    /// Textual form used for string comparison.
    pub fn text(&self) -> String {
        match self {
            ChapterKey::Number(n) => format!("{n}"),
            ChapterKey::Label(s) => s.clone(),
        }
    }
}

impl fmt::Display for ChapterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text())
    }
}

impl From<f64> for ChapterKey {
    fn from(n: f64) -> Self {
        ChapterKey::Number(n)
    }
}

impl From<&str> for ChapterKey {
    fn from(s: &str) -> Self {
        ChapterKey::Label(s.to_string())
    }
}

/// Whether two identifiers name the same chapter.
pub fn same_chapter(a: &ChapterKey, b: &ChapterKey) -> bool {
    match (a.numeric(), b.numeric()) {
        (Some(x), Some(y)) => {
            if x.fract() == 0.0 && y.fract() == 0.0 {
                x == y
            } else {
                (x - y).abs() < NUMERIC_TOLERANCE
            }
        }
        _ => a.text() == b.text(),
    }
}

/// Whether `candidate` matches none of the `existing` identifiers.
pub fn is_new(candidate: &ChapterKey, existing: &[ChapterKey]) -> bool {
    !existing.iter().any(|e| same_chapter(candidate, e))
}
