//! Identity resolution of feed events against a feed's stored records.

use serde::{Deserialize, Serialize};
use staysync_core::{Event, Record};
use tracing::warn;

/// How to pick among several active records that share an event's
/// property, dates and entry type. Kept configurable until the business rule is settled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TieBreak {
    #[default]
    MostRecentlyUpdated,
    LeastRecentlyUpdated,
    /// Treat an ambiguous fallback as no match.
    Skip,
}

impl TieBreak {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "most-recently-updated" | "latest" => Some(Self::MostRecentlyUpdated),
            "least-recently-updated" | "oldest" => Some(Self::LeastRecentlyUpdated),
            "skip" | "none" => Some(Self::Skip),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchTier {
    /// Same composite id.
    Exact,
    /// Same property, dates and entry type under another identifier.
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub record: Record,
    pub tier: MatchTier,
    pub candidates: usize,
}

fn pick<'a>(candidates: &[&'a Record], tie_break: TieBreak) -> Option<&'a Record> {
    match tie_break {
        TieBreak::MostRecentlyUpdated => candidates.iter().copied().max_by_key(|r| r.last_updated),
        TieBreak::LeastRecentlyUpdated => candidates.iter().copied().min_by_key(|r| r.last_updated),
        TieBreak::Skip => None,
    }
}

fn active_in_feed<'a>(
    feed_records: &'a [Record],
    feed_url: &'a str,
) -> impl Iterator<Item = &'a Record> + 'a {
    feed_records
        .iter()
        .filter(move |r| r.is_active() && r.feed_url == feed_url)
}

/// Finds the active record of `event`'s feed that this event continues, if any.
pub fn resolve(event: &Event, feed_records: &[Record], tie_break: TieBreak) -> Option<Resolution> {
    let composite_id = event.composite_id();
    let exact: Vec<&Record> = active_in_feed(feed_records, &event.feed_url)
        .filter(|r| r.composite_id == composite_id)
        .collect();
    if let Some(record) = exact.iter().copied().max_by_key(|r| r.last_updated) {
        return Some(Resolution {
            record: record.clone(),
            tier: MatchTier::Exact,
            candidates: exact.len(),
        });
    }

    let key = event.key();
    let fallback: Vec<&Record> = active_in_feed(feed_records, &event.feed_url)
        .filter(|r| r.key() == key)
        .collect();
    let record = match fallback.len() {
        0 => return None,
        1 => fallback[0],
        n => {
            warn!(
                %key,
                candidates = n,
                ?tie_break,
                source_id = %event.source_id,
                "ambiguous fallback match"
            );
            pick(&fallback, tie_break)?
        }
    };

    Some(Resolution {
        record: record.clone(),
        tier: MatchTier::Fallback,
        candidates: fallback.len(),
    })
}
