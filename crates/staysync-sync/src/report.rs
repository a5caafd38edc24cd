//! Run summaries and the report files written for every sync run.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use uuid::Uuid;

use crate::context::{FeedCounts, FeedReport};

pub const SUMMARY_JSON: &str = "summary.json";
pub const SUMMARY_MARKDOWN: &str = "summary.md";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub feeds: Vec<FeedReport>,
}

impl RunSummary {
    pub fn totals(&self) -> FeedCounts {
        let mut totals = FeedCounts::default();
        for feed in &self.feeds {
            totals.absorb(&feed.counts);
        }
        totals
    }

    pub fn failed_feeds(&self) -> Vec<&FeedReport> {
        self.feeds.iter().filter(|f| f.status.is_failure()).collect()
    }

    pub fn is_success(&self) -> bool {
        self.failed_feeds().is_empty()
    }
}

pub fn render_markdown(summary: &RunSummary) -> String {
    let totals = summary.totals();
    let mut lines = vec![
        "# Reservation Sync Run".to_string(),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Started: {}", summary.started_at),
        format!("- Finished: {}", summary.finished_at),
        format!("- Feeds: {} ({} failed)", summary.feeds.len(), summary.failed_feeds().len()),
        format!(
            "- Totals: created {}, modified {}, removed {}, suppressed duplicates {}, skipped {}",
            totals.created, totals.modified, totals.removed, totals.suppressed_duplicates, totals.skipped_errors
        ),
        String::new(),
        "## Feeds".to_string(),
        String::new(),
        "| Feed | Property | Status | Created | Modified | Unchanged | Removed | Suppressed | Deferred | Skipped |"
            .to_string(),
        "|---|---|---|---|---|---|---|---|---|---|".to_string(),
    ];
    for feed in &summary.feeds {
        let c = &feed.counts;
        lines.push(format!(
            "| {} | {} | {:?} | {} | {} | {} | {} | {} | {} | {} |",
            feed.feed_url,
            feed.property_id,
            feed.status,
            c.created,
            c.modified,
            c.unchanged,
            c.removed,
            c.suppressed_duplicates,
            c.deferred_removals,
            c.skipped_errors
        ));
    }

    let failures: Vec<_> = summary
        .feeds
        .iter()
        .filter_map(|f| f.error.as_ref().map(|e| (f, e)))
        .collect();
    if !failures.is_empty() {
        lines.push(String::new());
        lines.push("## Errors".to_string());
        lines.push(String::new());
        for (feed, error) in failures {
            lines.push(format!("- {} ({:?}): {}", feed.feed_url, feed.status, error));
        }
    }
    lines.push(String::new());
    lines.join("\n")
}

/// Writes `<reports_root>/<run_id>/summary.{json,md}` and returns the run directory.
pub async fn write_run_report(reports_root: &Path, summary: &RunSummary) -> Result<PathBuf> {
    let run_dir = reports_root.join(summary.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(run_dir.join(SUMMARY_JSON), json)
        .await
        .with_context(|| format!("writing {SUMMARY_JSON}"))?;
    fs::write(run_dir.join(SUMMARY_MARKDOWN), render_markdown(summary))
        .await
        .with_context(|| format!("writing {SUMMARY_MARKDOWN}"))?;

    Ok(run_dir)
}

/// Markdown digest of the latest `runs` run reports under `reports_root`.
pub fn report_recent_markdown(runs: usize, reports_root: &Path) -> Result<String> {
    let mut summaries = Vec::new();
    for entry in std::fs::read_dir(reports_root).with_context(|| format!("reading {}", reports_root.display()))? {
        let entry = entry.with_context(|| format!("listing {}", reports_root.display()))?;
        let path = entry.path().join(SUMMARY_JSON);
        if !path.is_file() {
            continue;
        }
        let text = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        let summary: RunSummary =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        summaries.push((entry.path(), summary));
    }
    summaries.sort_by(|a, b| b.1.started_at.cmp(&a.1.started_at));

    let mut lines = vec!["# Recent Reservation Sync Runs".to_string(), String::new()];
    if summaries.is_empty() {
        lines.push("No runs recorded yet.".to_string());
    }
    for (dir, summary) in summaries.into_iter().take(runs.max(1)) {
        let totals = summary.totals();
        let failed = summary.failed_feeds();
        lines.push(format!("## Run `{}`", summary.run_id));
        lines.push(format!("- started: {}", summary.started_at));
        lines.push(format!("- feeds: {}", summary.feeds.len()));
        lines.push(format!(
            "- created {}, modified {}, removed {}, suppressed {}, skipped {}",
            totals.created, totals.modified, totals.removed, totals.suppressed_duplicates, totals.skipped_errors
        ));
        if !failed.is_empty() {
            let urls: Vec<&str> = failed.iter().map(|f| f.feed_url.as_str()).collect();
            lines.push(format!("- failed feeds: {}", urls.join(", ")));
        }
        lines.push(format!("- summary: `{}`", dir.join(SUMMARY_MARKDOWN).display()));
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}
