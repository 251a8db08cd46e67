use std::io::Write;

use chaptersync_core::resolver::ResolveOutcome;
use chaptersync_core::sources::SourceInfo;
use chaptersync_core::{IngestionJob, ParsedSource, ProgressEvent, TickReport};
use owo_colors::OwoColorize;

/// Whether to use colored output.
#[derive(Debug, Clone, Copy)]
pub struct ColorMode(pub bool);

impl ColorMode {
    pub fn enabled(&self) -> bool {
        self.0
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        format!("{}...", s.chars().take(max).collect::<String>())
    } else {
        s.to_string()
    }
}

/// Print a real-time progress event.
pub fn print_progress(
    w: &mut dyn Write,
    event: &ProgressEvent,
    color: ColorMode,
) -> std::io::Result<()> {
    match event {
        ProgressEvent::SourceAttempt { index, locator, .. } => {
            writeln!(w, "[source #{}] Trying {}", index, locator)?;
        }
        ProgressEvent::SourceFailed {
            index, message, ..
        } => {
            if color.enabled() {
                writeln!(w, "[source #{}] -> {} {}", index, "FAILED".red(), message)?;
            } else {
                writeln!(w, "[source #{}] -> FAILED {}", index, message)?;
            }
        }
        ProgressEvent::NewChaptersFound { locator, count, .. } => {
            writeln!(w, "Found {} new chapter(s) on {}", count, locator)?;
        }
        ProgressEvent::ChapterStarted {
            chapter,
            page_count,
            ..
        } => {
            writeln!(
                w,
                "Downloading \"{}\" ({} pages)",
                truncate(chapter, 50),
                page_count
            )?;
        }
        ProgressEvent::PageDownloaded {
            page,
            total,
            via_mirror,
            ..
        } => {
            if *via_mirror {
                writeln!(w, "  [{}/{}] page (mirror)", page + 1, total)?;
            }
        }
        ProgressEvent::PageSkipped {
            page,
            total,
            message,
            ..
        } => {
            if color.enabled() {
                writeln!(w, "  [{}/{}] {} {}", page + 1, total, "SKIPPED".yellow(), message)?;
            } else {
                writeln!(w, "  [{}/{}] SKIPPED {}", page + 1, total, message)?;
            }
        }
        ProgressEvent::ChapterImported {
            identifier, pages, ..
        } => {
            if color.enabled() {
                writeln!(
                    w,
                    "-> {} chapter {} ({} pages)",
                    "IMPORTED".green(),
                    identifier,
                    pages
                )?;
            } else {
                writeln!(w, "-> IMPORTED chapter {} ({} pages)", identifier, pages)?;
            }
        }
        ProgressEvent::ChapterRolledBack {
            identifier, reason, ..
        } => {
            if color.enabled() {
                writeln!(w, "-> {} chapter {}: {}", "ROLLED BACK".red(), identifier, reason)?;
            } else {
                writeln!(w, "-> ROLLED BACK chapter {}: {}", identifier, reason)?;
            }
        }
        ProgressEvent::RateLimitWait {
            source,
            wait_duration,
        } => {
            let msg = format!(
                "rate limited by {}, waiting {:.1}s",
                source,
                wait_duration.as_secs_f64()
            );
            if color.enabled() {
                writeln!(w, "{}", msg.dimmed())?;
            } else {
                writeln!(w, "{}", msg)?;
            }
        }
    }
    Ok(())
}

/// Print the result of one job run.
pub fn print_outcome(
    w: &mut dyn Write,
    outcome: &ResolveOutcome,
    color: ColorMode,
) -> std::io::Result<()> {
    writeln!(w)?;
    if let Some(locator) = &outcome.source_locator {
        writeln!(
            w,
            "Job {} used source #{} ({})",
            outcome.job_id,
            outcome.source_index.unwrap_or_default(),
            locator
        )?;
    }
    for err in &outcome.source_errors {
        if color.enabled() {
            writeln!(w, "  {} {}", "skipped".yellow(), err)?;
        } else {
            writeln!(w, "  skipped {}", err)?;
        }
    }

    if outcome.imported.is_empty() && outcome.failed.is_empty() {
        writeln!(w, "No new chapters.")?;
    }
    for chapter in &outcome.imported {
        let line = format!(
            "  + {} \"{}\" ({} pages, id {})",
            chapter.identifier,
            truncate(&chapter.name, 60),
            chapter.pages,
            chapter.chapter_id
        );
        if color.enabled() {
            writeln!(w, "{}", line.green())?;
        } else {
            writeln!(w, "{}", line)?;
        }
    }
    for failure in &outcome.failed {
        let line = format!(
            "  x {} \"{}\": {}",
            failure.identifier,
            truncate(&failure.name, 60),
            failure.reason
        );
        if color.enabled() {
            writeln!(w, "{}", line.red())?;
        } else {
            writeln!(w, "{}", line)?;
        }
    }
    if !outcome.invalid_identifiers.is_empty() {
        let line = format!(
            "  ({} listed chapter(s) without a number ignored: {})",
            outcome.invalid_identifiers.len(),
            outcome.invalid_identifiers.join(", ")
        );
        if color.enabled() {
            writeln!(w, "{}", line.dimmed())?;
        } else {
            writeln!(w, "{}", line)?;
        }
    }
    Ok(())
}

pub fn print_tick_report(
    w: &mut dyn Write,
    report: &TickReport,
    color: ColorMode,
) -> std::io::Result<()> {
    writeln!(w)?;
    if color.enabled() {
        writeln!(w, "{}", "TICK SUMMARY".bold())?;
    } else {
        writeln!(w, "TICK SUMMARY")?;
    }
    writeln!(w, "  Due jobs:          {}", report.due)?;
    writeln!(w, "  Updated jobs:      {}", report.updated)?;
    writeln!(w, "  Imported chapters: {}", report.imported)?;
    writeln!(w, "  Failed jobs:       {}", report.failed.len())?;
    for (job_id, message) in &report.failed {
        if color.enabled() {
            writeln!(w, "    {} {}", job_id.red(), message)?;
        } else {
            writeln!(w, "    {} {}", job_id, message)?;
        }
    }
    Ok(())
}

pub fn print_jobs(w: &mut dyn Write, jobs: &[IngestionJob], color: ColorMode) -> std::io::Result<()> {
    if jobs.is_empty() {
        writeln!(w, "No jobs registered.")?;
        return Ok(());
    }
    for job in jobs {
        let hour = job
            .schedule_hour
            .map(|h| format!("{h:02}:00"))
            .unwrap_or_else(|| "legacy".into());
        let checked = job
            .last_checked
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "never".into());
        let state = if job.enabled { "enabled" } else { "disabled" };
        if color.enabled() {
            writeln!(
                w,
                "{}  work={} {} {} {} checked={}",
                job.id.bold(),
                job.work_id,
                job.frequency,
                hour,
                if job.enabled {
                    state.green().to_string()
                } else {
                    state.dimmed().to_string()
                },
                checked
            )?;
        } else {
            writeln!(
                w,
                "{}  work={} {} {} {} checked={}",
                job.id, job.work_id, job.frequency, hour, state, checked
            )?;
        }
        for (i, source) in job.candidate_sources().iter().enumerate() {
            let marker = if job.last_success_index == Some(i) { "*" } else { " " };
            writeln!(w, "   {marker}#{i} {source}")?;
        }
    }
    Ok(())
}

pub fn print_sources(w: &mut dyn Write, families: &[SourceInfo], color: ColorMode) -> std::io::Result<()> {
    for family in families {
        let hosts = if family.hosts.is_empty() {
            "(no hosts configured)".to_string()
        } else {
            family.hosts.join(", ")
        };
        if color.enabled() {
            writeln!(w, "{}: {}", family.name.bold(), hosts)?;
        } else {
            writeln!(w, "{}: {}", family.name, hosts)?;
        }
    }
    Ok(())
}

/// Print the metadata and chapter list of a dry parse.
pub fn print_parsed(w: &mut dyn Write, parsed: &ParsedSource, color: ColorMode) -> std::io::Result<()> {
    if color.enabled() {
        writeln!(w, "{}", parsed.title.bold().cyan())?;
    } else {
        writeln!(w, "{}", parsed.title)?;
    }
    if !parsed.alt_titles.is_empty() {
        writeln!(w, "Also known as: {}", parsed.alt_titles.join(" / "))?;
    }
    let mut facts = Vec::new();
    if let Some(kind) = &parsed.kind {
        facts.push(kind.clone());
    }
    if let Some(year) = parsed.release_year {
        facts.push(year.to_string());
    }
    if let Some(author) = &parsed.author {
        facts.push(format!("by {author}"));
    }
    if let Some(artist) = parsed.artist.as_ref().filter(|a| Some(*a) != parsed.author.as_ref()) {
        facts.push(format!("art by {artist}"));
    }
    if !facts.is_empty() {
        writeln!(w, "{}", facts.join(", "))?;
    }
    if !parsed.genres.is_empty() {
        writeln!(w, "Genres: {}", parsed.genres.join(", "))?;
    }
    if let Some(cover) = &parsed.cover_url {
        writeln!(w, "Cover: {cover}")?;
    }
    if !parsed.description.is_empty() {
        writeln!(w)?;
        writeln!(w, "{}", truncate(&parsed.description, 400))?;
    }

    writeln!(w)?;
    writeln!(w, "{} chapter(s):", parsed.chapters.len())?;
    for chapter in &parsed.chapters {
        let number = chapter
            .number
            .map(|n| n.to_string())
            .unwrap_or_else(|| "?".into());
        if color.enabled() {
            writeln!(w, "  {:>7}  {}  {}", number, chapter.name, chapter.locator.dimmed())?;
        } else {
            writeln!(w, "  {:>7}  {}  {}", number, chapter.name, chapter.locator)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chaptersync_core::ChapterKey;
    use chaptersync_core::resolver::{ChapterFailure, ImportedChapter};

    fn render(f: impl FnOnce(&mut dyn Write) -> std::io::Result<()>) -> String {
        let mut buf = Vec::new();
        f(&mut buf).unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn outcome_lists_imports_and_failures() {
        let outcome = ResolveOutcome {
            job_id: "j1".into(),
            imported: vec![ImportedChapter {
                chapter_id: "42".into(),
                identifier: ChapterKey::Number(3.0),
                name: "Chapter 3".into(),
                pages: 12,
            }],
            failed: vec![ChapterFailure {
                identifier: ChapterKey::Number(4.0),
                name: "Chapter 4".into(),
                reason: "no downloadable assets".into(),
            }],
            source_index: Some(1),
            source_locator: Some("https://b.test/work".into()),
            ..ResolveOutcome::default()
        };
        let text = render(|w| print_outcome(w, &outcome, ColorMode(false)));
        assert!(text.contains("used source #1 (https://b.test/work)"));
        assert!(text.contains("+ 3 \"Chapter 3\" (12 pages, id 42)"));
        assert!(text.contains("x 4 \"Chapter 4\": no downloadable assets"));
        assert!(!text.contains("No new chapters."));
    }

    #[test]
    fn long_titles_are_truncated_on_char_boundaries() {
        let title = "終".repeat(80);
        let short = truncate(&title, 50);
        assert_eq!(short.chars().count(), 53);
    }
}
