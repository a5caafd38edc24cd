//! Per-feed cycle state and outcome counters.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use staysync_adapters::FeedBinding;
use staysync_core::{CompositeId, Event, Record, RecordId, ReservationKey};

use crate::removal::KeepReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    Created,
    Modified,
    Unchanged,
    DuplicateIgnored,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeedStatus {
    Completed,
    FetchFailed,
    TimedOut,
    ParseFailed,
    StoreFailed,
}

impl FeedStatus {
    pub fn is_failure(&self) -> bool {
        !matches!(self, Self::Completed)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedCounts {
    pub created: usize,
    pub modified: usize,
    pub unchanged: usize,
    pub removed: usize,
    pub suppressed_duplicates: usize,
    pub deferred_removals: usize,
    pub skipped_errors: usize,
}

impl FeedCounts {
    pub fn absorb(&mut self, other: &FeedCounts) {
        self.created += other.created;
        self.modified += other.modified;
        self.unchanged += other.unchanged;
        self.removed += other.removed;
        self.suppressed_duplicates += other.suppressed_duplicates;
        self.deferred_removals += other.deferred_removals;
        self.skipped_errors += other.skipped_errors;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedReport {
    pub feed_url: String,
    pub property_id: String,
    pub status: FeedStatus,
    pub counts: FeedCounts,
    #[serde(default)]
    pub kept_by_gate: BTreeMap<KeepReason, usize>,
    #[serde(default)]
    pub error: Option<String>,
}

impl FeedReport {
    pub fn new(binding: &FeedBinding) -> Self {
        Self {
            feed_url: binding.feed_url.clone(),
            property_id: binding.property_id.to_string(),
            status: FeedStatus::Completed,
            counts: FeedCounts::default(),
            kept_by_gate: BTreeMap::new(),
            error: None,
        }
    }

    pub fn failed(mut self, status: FeedStatus, error: impl ToString) -> Self {
        self.status = status;
        self.error = Some(error.to_string());
        self
    }
}

/// State of one feed's reconciliation cycle.
///
/// `records` starts as the store's active records for the feed and is kept in
/// step with every create and supersede the cycle performs, so later events in
/// the same feed resolve against current state. Writes made by other passes
/// are picked up per identity through [`CycleContext::refresh_identity`].
#[derive(Debug)]
pub struct CycleContext {
    pub binding: FeedBinding,
    pub now: DateTime<Utc>,
    pub report: FeedReport,
    records: Vec<Record>,
    matched: HashSet<RecordId>,
    suppressed: HashSet<ReservationKey>,
    unresolved_keys: HashSet<ReservationKey>,
    unresolved_ids: HashSet<CompositeId>,
}

impl CycleContext {
    pub fn new(binding: FeedBinding, now: DateTime<Utc>, records: Vec<Record>) -> Self {
        let report = FeedReport::new(&binding);
        let records = records
            .into_iter()
            .filter(|r| r.is_active() && r.feed_url == binding.feed_url)
            .collect();
        Self {
            binding,
            now,
            report,
            records,
            matched: HashSet::new(),
            suppressed: HashSet::new(),
            unresolved_keys: HashSet::new(),
            unresolved_ids: HashSet::new(),
        }
    }

    pub fn today(&self) -> NaiveDate {
        self.now.date_naive()
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn record(&self, record_id: RecordId) -> Option<&Record> {
        self.records.iter().find(|r| r.record_id == record_id)
    }

    /// Replaces every record an event could resolve to, by composite id or
    /// stay key, with `current` as just read from the store.
    pub fn refresh_identity(&mut self, event: &Event, current: Vec<Record>) {
        let composite_id = event.composite_id();
        let key = event.key();
        self.records.retain(|r| r.composite_id != composite_id && r.key() != key);
        for record in current {
            if record.is_active()
                && record.feed_url == self.binding.feed_url
                && self.record(record.record_id).is_none()
            {
                self.records.push(record);
            }
        }
    }

    pub fn is_matched(&self, record_id: RecordId) -> bool {
        self.matched.contains(&record_id)
    }

    pub fn mark_matched(&mut self, record_id: RecordId) {
        self.matched.insert(record_id);
    }

    pub fn suppress(&mut self, key: ReservationKey) {
        self.suppressed.insert(key);
    }

    pub fn is_suppressed(&self, key: &ReservationKey) -> bool {
        self.suppressed.contains(key)
    }

    /// Shields records an aborted event may have referred to from this cycle's removal pass.
    pub fn mark_unresolved(&mut self, event: &Event) {
        self.unresolved_keys.insert(event.key());
        self.unresolved_ids.insert(event.composite_id());
    }

    pub fn is_unresolved(&self, record: &Record) -> bool {
        self.unresolved_ids.contains(&record.composite_id) || self.unresolved_keys.contains(&record.key())
    }

    pub fn track_created(&mut self, record: Record) {
        self.matched.insert(record.record_id);
        self.records.push(record);
    }

    pub fn track_superseded(&mut self, retired: RecordId, successor: Record) {
        self.records.retain(|r| r.record_id != retired);
        self.matched.insert(successor.record_id);
        self.records.push(successor);
    }

    pub fn record_outcome(&mut self, outcome: EventOutcome) {
        let counts = &mut self.report.counts;
        match outcome {
            EventOutcome::Created => counts.created += 1,
            EventOutcome::Modified => counts.modified += 1,
            EventOutcome::Unchanged => counts.unchanged += 1,
            EventOutcome::DuplicateIgnored => counts.suppressed_duplicates += 1,
            EventOutcome::Skipped => counts.skipped_errors += 1,
        }
    }
}
