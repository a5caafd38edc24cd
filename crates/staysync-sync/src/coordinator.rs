//! Runs reconciliation cycles across many feeds under a bounded pool.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use staysync_adapters::{annotate_stays, normalize_event, FeedBinding, FeedParser, FeedSource};
use staysync_core::{Event, Record, RecordId, RecordStatus, ReservationKey};
use staysync_storage::{JobTracker, RecordFilter, RecordStore, StoreError};
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::context::{CycleContext, EventOutcome, FeedReport, FeedStatus};
use crate::dedup::{check_duplicate, DuplicateVerdict};
use crate::locks::KeyLocks;
use crate::removal::{sweep, RemovalPolicy};
use crate::report::RunSummary;
use crate::resolver::{resolve, MatchTier, Resolution, TieBreak};
use crate::versioning::{apply_event, Change};

/// Why a single event was abandoned. The event's stay is left untouched.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("identity lookup failed: {0}")]
    Resolution(#[source] StoreError),
    #[error("store write failed: {0}")]
    Store(#[source] StoreError),
}

#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    pub max_concurrent_feeds: usize,
    pub fetch_timeout: Duration,
    pub write_batch_size: usize,
    pub tie_break: TieBreak,
    pub removal: RemovalPolicy,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            max_concurrent_feeds: 4,
            fetch_timeout: Duration::from_secs(30),
            write_batch_size: 10,
            tie_break: TieBreak::default(),
            removal: RemovalPolicy::default(),
        }
    }
}

pub struct Reconciler {
    store: Arc<dyn RecordStore>,
    source: Arc<dyn FeedSource>,
    parser: Arc<dyn FeedParser>,
    jobs: Arc<dyn JobTracker>,
    locks: Arc<KeyLocks>,
    options: ReconcileOptions,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn RecordStore>,
        source: Arc<dyn FeedSource>,
        parser: Arc<dyn FeedParser>,
        jobs: Arc<dyn JobTracker>,
        options: ReconcileOptions,
    ) -> Self {
        Self {
            store,
            source,
            parser,
            jobs,
            locks: Arc::new(KeyLocks::new()),
            options,
        }
    }

    /// Shares a lock registry with other reconcilers writing to the same store.
    pub fn with_locks(mut self, locks: Arc<KeyLocks>) -> Self {
        self.locks = locks;
        self
    }

    pub fn options(&self) -> &ReconcileOptions {
        &self.options
    }

    pub async fn run_once(&self, feeds: &[FeedBinding]) -> RunSummary {
        self.run_cycle(feeds, Utc::now()).await
    }

    /// Reconciles every feed, at most `max_concurrent_feeds` at a time. A
    /// failing feed is recorded in its report and never aborts the others.
    pub async fn run_cycle(&self, feeds: &[FeedBinding], now: DateTime<Utc>) -> RunSummary {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, feeds = feeds.len(), "sync run started");

        let mut reports: Vec<FeedReport> = stream::iter(feeds.iter().cloned())
            .map(|binding| self.reconcile_feed(run_id, binding, now))
            .buffer_unordered(self.options.max_concurrent_feeds.max(1))
            .collect()
            .await;
        reports.sort_by(|a, b| a.feed_url.cmp(&b.feed_url));

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            feeds: reports,
        };
        let totals = summary.totals();
        info!(
            %run_id,
            created = totals.created,
            modified = totals.modified,
            removed = totals.removed,
            suppressed = totals.suppressed_duplicates,
            skipped = totals.skipped_errors,
            failed_feeds = summary.failed_feeds().len(),
            "sync run finished"
        );
        summary
    }

    pub async fn reconcile_feed(&self, run_id: Uuid, binding: FeedBinding, now: DateTime<Utc>) -> FeedReport {
        let span = info_span!(
            "reconcile_feed",
            %run_id,
            feed_url = %binding.feed_url,
            property_id = %binding.property_id
        );
        self.reconcile_feed_inner(binding, now).instrument(span).await
    }

    async fn reconcile_feed_inner(&self, binding: FeedBinding, now: DateTime<Utc>) -> FeedReport {
        let report = FeedReport::new(&binding);

        let bytes = match tokio::time::timeout(self.options.fetch_timeout, self.source.fetch_feed(&binding.feed_url)).await
        {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(err)) => {
                warn!(error = %err, "feed fetch failed; skipping feed this cycle");
                return report.failed(FeedStatus::FetchFailed, err);
            }
            Err(_) => {
                warn!(timeout = ?self.options.fetch_timeout, "feed fetch timed out; skipping feed this cycle");
                return report.failed(
                    FeedStatus::TimedOut,
                    format!("fetch timed out after {:?}", self.options.fetch_timeout),
                );
            }
        };

        let parsed = match self.parser.parse_feed(&bytes) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(error = %err, "feed document unparseable; skipping feed this cycle");
                return report.failed(FeedStatus::ParseFailed, err);
            }
        };

        let mut skipped = 0usize;
        for rejected in &parsed.rejected {
            warn!(index = rejected.index, line = rejected.line, uid = ?rejected.uid, reason = %rejected.reason, "malformed event skipped");
            skipped += 1;
        }
        let mut events = Vec::with_capacity(parsed.events.len());
        for raw in &parsed.events {
            match normalize_event(raw, &binding) {
                Ok(event) => events.push(event),
                Err(err) => {
                    warn!(error = %err, "event skipped during normalization");
                    skipped += 1;
                }
            }
        }
        annotate_stays(&mut events);

        let stored = match self
            .store
            .query_records(&RecordFilter::active_for_feed(binding.feed_url.clone()))
            .await
        {
            Ok(records) => records,
            Err(err) => {
                warn!(error = %err, "could not load stored records; skipping feed this cycle");
                return report.failed(FeedStatus::StoreFailed, err);
            }
        };

        let mut ctx = CycleContext::new(binding, now, stored);
        ctx.report.counts.skipped_errors += skipped;

        for event in events {
            match self.process_event(&mut ctx, &event).await {
                Ok(outcome) => ctx.record_outcome(outcome),
                Err(err) => {
                    warn!(source_id = %event.source_id, key = %event.key(), error = %err, "event aborted");
                    ctx.mark_unresolved(&event);
                    ctx.record_outcome(EventOutcome::Skipped);
                }
            }
        }

        let outcome = sweep(&ctx, self.jobs.as_ref(), &self.options.removal).await;
        ctx.report.kept_by_gate = outcome.kept.clone();
        ctx.report.counts.skipped_errors += outcome.lookup_failures;

        if let Err(err) = self.commit_sweep(&ctx, &outcome.refreshed, SweepWrite::Refresh).await {
            warn!(error = %err, "refreshing matched records failed");
            return ctx.report.failed(FeedStatus::StoreFailed, err);
        }
        match self.commit_sweep(&ctx, &outcome.deferred, SweepWrite::Staged).await {
            Ok(written) => ctx.report.counts.deferred_removals = written,
            Err(err) => {
                warn!(error = %err, "persisting missing counters failed");
                return ctx.report.failed(FeedStatus::StoreFailed, err);
            }
        }
        match self.commit_sweep(&ctx, &outcome.removed, SweepWrite::Staged).await {
            Ok(written) => ctx.report.counts.removed = written,
            Err(err) => {
                warn!(error = %err, "persisting removals failed");
                return ctx.report.failed(FeedStatus::StoreFailed, err);
            }
        }

        let report = ctx.report;
        info!(
            created = report.counts.created,
            modified = report.counts.modified,
            unchanged = report.counts.unchanged,
            removed = report.counts.removed,
            suppressed = report.counts.suppressed_duplicates,
            deferred = report.counts.deferred_removals,
            skipped = report.counts.skipped_errors,
            "feed reconciled"
        );
        report
    }

    /// Resolves one event and performs its create or supersede while holding
    /// the locks of the event's stay key and of the matched record's key.
    ///
    /// Resolution runs on records re-read under those locks, so a pass that
    /// waited on another pass sees its writes instead of the cycle snapshot.
    async fn process_event(&self, ctx: &mut CycleContext, event: &Event) -> Result<EventOutcome, ReconcileError> {
        let mut keys = vec![event.key()];
        loop {
            let _guards = self.locks.lock_all(&keys).await;
            self.refresh_identity(ctx, event).await?;

            let resolution = resolve(event, ctx.records(), self.options.tie_break);
            if let Some(matched) = resolution.as_ref().map(|r| r.record.key()) {
                if !keys.contains(&matched) {
                    keys.push(matched);
                    continue;
                }
            }
            return match resolution {
                Some(resolution) => self.continue_identity(ctx, event, resolution).await,
                None => self.create_or_suppress(ctx, event).await,
            };
        }
    }

    async fn refresh_identity(&self, ctx: &mut CycleContext, event: &Event) -> Result<(), ReconcileError> {
        let feed_url = &ctx.binding.feed_url;
        let mut current = self
            .store
            .query_records(&RecordFilter::active_for_identity(feed_url.clone(), event.composite_id()))
            .await
            .map_err(ReconcileError::Resolution)?;
        current.extend(
            self.store
                .query_records(&RecordFilter::active_for_key(event.key()).in_feed(feed_url.clone()))
                .await
                .map_err(ReconcileError::Resolution)?,
        );
        ctx.refresh_identity(event, current);
        Ok(())
    }

    async fn continue_identity(
        &self,
        ctx: &mut CycleContext,
        event: &Event,
        resolution: Resolution,
    ) -> Result<EventOutcome, ReconcileError> {
        let key = event.key();
        let matched = resolution.record;
        if ctx.is_matched(matched.record_id) {
            return Ok(match resolution.tier {
                MatchTier::Exact => {
                    warn!(source_id = %event.source_id, "source id repeated within feed; skipped");
                    EventOutcome::Skipped
                }
                MatchTier::Fallback => {
                    info!(source_id = %event.source_id, %key, record_id = %matched.record_id, "duplicate stay within feed ignored");
                    ctx.suppress(key);
                    EventOutcome::DuplicateIgnored
                }
            });
        }
        if resolution.tier == MatchTier::Fallback {
            debug!(
                source_id = %event.source_id,
                composite_id = %matched.composite_id,
                "identifier churn recovered by stay key"
            );
        }

        match apply_event(&matched, event, ctx.now) {
            Change::Unchanged => {
                ctx.mark_matched(matched.record_id);
                Ok(EventOutcome::Unchanged)
            }
            Change::Superseded {
                retired,
                successor,
                fields,
            } => {
                let verdict = check_duplicate(self.store.as_ref(), &key, Some(matched.record_id))
                    .await
                    .map_err(ReconcileError::Resolution)?;
                if let DuplicateVerdict::DuplicateOf(existing) = verdict {
                    // On an unchanged key only another version of the same
                    // identity blocks the write.
                    if successor.key() != matched.key() || existing.composite_id == matched.composite_id {
                        info!(
                            composite_id = %matched.composite_id,
                            %key,
                            existing = %existing.record_id,
                            "new version onto an occupied stay ignored"
                        );
                        ctx.mark_matched(matched.record_id);
                        ctx.suppress(key);
                        return Ok(EventOutcome::DuplicateIgnored);
                    }
                }

                self.supersede(&matched, &retired, &successor).await?;
                info!(
                    composite_id = %successor.composite_id,
                    retired = %retired.record_id,
                    successor = %successor.record_id,
                    ?fields,
                    "record superseded"
                );
                ctx.track_superseded(retired.record_id, successor);
                Ok(EventOutcome::Modified)
            }
        }
    }

    async fn create_or_suppress(&self, ctx: &mut CycleContext, event: &Event) -> Result<EventOutcome, ReconcileError> {
        let key = event.key();
        let verdict = check_duplicate(self.store.as_ref(), &key, None)
            .await
            .map_err(ReconcileError::Resolution)?;

        match verdict {
            DuplicateVerdict::DuplicateOf(existing) => {
                info!(
                    source_id = %event.source_id,
                    %key,
                    existing = %existing.record_id,
                    existing_feed = %existing.feed_url,
                    "duplicate event ignored"
                );
                ctx.suppress(key);
                Ok(EventOutcome::DuplicateIgnored)
            }
            DuplicateVerdict::Unique => {
                let record = Record::first_sighting(event, ctx.now);
                self.store
                    .create_records(std::slice::from_ref(&record))
                    .await
                    .map_err(ReconcileError::Store)?;
                debug!(record_id = %record.record_id, composite_id = %record.composite_id, "record created");
                ctx.track_created(record);
                Ok(EventOutcome::Created)
            }
        }
    }

    /// Retires `previous` then creates `successor`, so the stay never has two
    /// active versions. A failed create restores `previous`.
    async fn supersede(&self, previous: &Record, retired: &Record, successor: &Record) -> Result<(), ReconcileError> {
        self.store
            .update_records(std::slice::from_ref(retired))
            .await
            .map_err(ReconcileError::Store)?;

        if let Err(err) = self.store.create_records(std::slice::from_ref(successor)).await {
            if let Err(restore) = self.store.update_records(std::slice::from_ref(previous)).await {
                error!(
                    record_id = %previous.record_id,
                    error = %restore,
                    "could not restore record after failed supersede"
                );
            }
            return Err(ReconcileError::Store(err));
        }
        Ok(())
    }

    /// Writes sweep results in batches under the records' key locks, checked
    /// against the store first. A record another pass retired or already
    /// updated is skipped. Returns the number of records written.
    async fn commit_sweep(&self, ctx: &CycleContext, records: &[Record], write: SweepWrite) -> Result<usize, StoreError> {
        let mut written = 0;
        for chunk in records.chunks(self.options.write_batch_size.max(1)) {
            let keys: Vec<ReservationKey> = chunk.iter().map(Record::key).collect();
            let _guards = self.locks.lock_all(&keys).await;

            let current: HashMap<RecordId, Record> = self
                .store
                .query_records(&RecordFilter::active_for_feed(ctx.binding.feed_url.clone()))
                .await?
                .into_iter()
                .map(|r| (r.record_id, r))
                .collect();

            let mut batch = Vec::with_capacity(chunk.len());
            for next in chunk {
                let Some(stored) = current.get(&next.record_id) else {
                    debug!(record_id = %next.record_id, "record no longer active; sweep write skipped");
                    continue;
                };
                match write {
                    SweepWrite::Refresh => {
                        if stored.tracking == next.tracking && stored.last_updated == next.last_updated {
                            continue;
                        }
                        let mut fresh = stored.clone();
                        fresh.tracking = next.tracking;
                        fresh.last_updated = next.last_updated;
                        batch.push(fresh);
                    }
                    SweepWrite::Staged => {
                        if ctx.record(next.record_id) != Some(stored) {
                            debug!(record_id = %next.record_id, "record changed by another pass; sweep write skipped");
                            continue;
                        }
                        if next.status == RecordStatus::Removed {
                            info!(
                                record_id = %next.record_id,
                                composite_id = %next.composite_id,
                                key = %next.key(),
                                "record removed"
                            );
                        }
                        batch.push(next.clone());
                    }
                }
            }

            if !batch.is_empty() {
                self.store.update_records(&batch).await?;
                written += batch.len();
            }
        }
        Ok(written)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SweepWrite {
    /// Reset tracking on a matched record, keeping the rest of its stored row.
    Refresh,
    /// Write the record as staged, provided the stored row is still the one it was computed from.
    Staged,
}
