//! Chapter number extraction from loose labels, and ascending ordering.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::model::ChapterRef;

/// Number after a chapter keyword: "Chapter 12.5", "Ch. 7", "Episode 3", "#41".
static KEYWORD_NUMBER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:chapter|chap|ch|episode|ep|#)\.?\s*(\d+(?:[.,]\d+)?)")
        .expect("valid regex")
});

/// Any decimal number.
static ANY_NUMBER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+(?:\.\d+)?)").expect("valid regex"));

/// Slug form used in chapter URLs: "chapter-12", "chapter-12-5".
static SLUG_NUMBER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:chapter|ch|episode|ep)[-_](\d+)(?:[-_.](\d+))?").expect("valid regex")
});

/// Extract a chapter number from a display label.
///
/// Prefers the number following a chapter keyword; otherwise takes the first
/// decimal number in the label. Returns `None` when the label has no digits.
pub fn extract_chapter_number(label: &str) -> Option<f64> {
    if let Some(caps) = KEYWORD_NUMBER_RE.captures(label) {
        let raw = caps[1].replace(',', ".");
        if let Ok(n) = raw.parse::<f64>() {
            return Some(n);
        }
    }
    ANY_NUMBER_RE
        .captures(label)
        .and_then(|caps| caps[1].parse::<f64>().ok())
}

/// Extract a chapter number from a chapter URL slug such as `.../chapter-12-5/`.
pub fn extract_number_from_url(url: &str) -> Option<f64> {
    let caps = SLUG_NUMBER_RE.captures_iter(url).last()?;
    let whole = &caps[1];
    match caps.get(2) {
        Some(frac) => format!("{whole}.{}", frac.as_str()).parse().ok(),
        None => whole.parse().ok(),
    }
}

/// Parse a JSON value that may hold a chapter number as a number or a string.
pub fn number_from_json(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|n| n.is_finite())
}

/// Put chapters into ascending numeric order.
///
/// `newest_first` reverses the native listing first, so positional order is
/// oldest-first. Chapters without a number keep their place right after the
/// numbered chapter that precedes them in that positional order.
pub fn sort_ascending(chapters: &mut Vec<ChapterRef>, newest_first: bool) {
    if newest_first {
        chapters.reverse();
    }
    let mut previous = f64::NEG_INFINITY;
    let mut keyed: Vec<(f64, ChapterRef)> = chapters
        .drain(..)
        .map(|c| {
            let key = c.number.unwrap_or(previous);
            previous = key;
            (key, c)
        })
        .collect();
    keyed.sort_by(|a, b| a.0.total_cmp(&b.0));
    chapters.extend(keyed.into_iter().map(|(_, c)| c));
}

/// Drop later chapters that repeat an earlier chapter number.
pub fn dedupe_by_number(chapters: &mut Vec<ChapterRef>) {
    let mut seen: Vec<f64> = Vec::new();
    chapters.retain(|c| match c.number {
        Some(n) if seen.iter().any(|s| (s - n).abs() < f64::EPSILON) => false,
        Some(n) => {
            seen.push(n);
            true
        }
        None => true,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ch(name: &str, number: Option<f64>) -> ChapterRef {
        ChapterRef::new(name, number, format!("loc:{name}"))
    }

    fn names(chapters: &[ChapterRef]) -> Vec<&str> {
        chapters.iter().map(|c| c.name.as_str()).collect()
    }

    #[test]
    fn keyword_numbers() {
        assert_eq!(extract_chapter_number("Chapter 12.5 - The Return"), Some(12.5));
        assert_eq!(extract_chapter_number("Ch. 7"), Some(7.0));
        assert_eq!(extract_chapter_number("Episode 3"), Some(3.0));
        assert_eq!(extract_chapter_number("Vol.2 Chapter 14"), Some(14.0));
        assert_eq!(extract_chapter_number("chapter 4,5"), Some(4.5));
    }

    #[test]
    fn falls_back_to_first_number() {
        assert_eq!(extract_chapter_number("Part 9: Night"), Some(9.0));
        assert_eq!(extract_chapter_number("Prologue"), None);
    }

    #[test]
    fn slug_numbers() {
        assert_eq!(
            extract_number_from_url("https://reader.test/manga/x/chapter-12-5/"),
            Some(12.5)
        );
        assert_eq!(
            extract_number_from_url("https://reader.test/manga/x/chapter-40/"),
            Some(40.0)
        );
        assert_eq!(extract_number_from_url("https://reader.test/manga/x/extra/"), None);
    }

    #[test]
    fn json_numbers() {
        assert_eq!(number_from_json(&serde_json::json!(3)), Some(3.0));
        assert_eq!(number_from_json(&serde_json::json!("10.5")), Some(10.5));
        assert_eq!(number_from_json(&serde_json::json!(null)), None);
        assert_eq!(number_from_json(&serde_json::json!("oneshot")), None);
    }

    #[test]
    fn newest_first_listing_is_reversed_and_sorted() {
        let mut chapters = vec![
            ch("c3", Some(3.0)),
            ch("c2", Some(2.0)),
            ch("c1", Some(1.0)),
        ];
        sort_ascending(&mut chapters, true);
        assert_eq!(names(&chapters), vec!["c1", "c2", "c3"]);
    }

    #[test]
    fn out_of_order_numbers_are_sorted() {
        let mut chapters = vec![
            ch("c2", Some(2.0)),
            ch("c10", Some(10.0)),
            ch("c1.5", Some(1.5)),
        ];
        sort_ascending(&mut chapters, false);
        assert_eq!(names(&chapters), vec!["c1.5", "c2", "c10"]);
    }

    #[test]
    fn unnumbered_chapters_keep_their_position() {
        let mut chapters = vec![
            ch("c2", Some(2.0)),
            ch("extra", None),
            ch("c1", Some(1.0)),
            ch("prologue", None),
        ];
        // newest-first: prologue, c1, extra, c2 in positional (oldest-first) order
        sort_ascending(&mut chapters, true);
        assert_eq!(names(&chapters), vec!["prologue", "c1", "extra", "c2"]);
    }

    #[test]
    fn dedupe_keeps_first_occurrence() {
        let mut chapters = vec![
            ch("group-a", Some(1.0)),
            ch("group-b", Some(1.0)),
            ch("c2", Some(2.0)),
            ch("x", None),
            ch("y", None),
        ];
        dedupe_by_number(&mut chapters);
        assert_eq!(names(&chapters), vec!["group-a", "c2", "x", "y"]);
    }
}
