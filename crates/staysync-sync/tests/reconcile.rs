use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use staysync_adapters::{FeedBinding, ICalParser, InMemoryFeedSource};
use staysync_core::{Presence, PropertyId, Record, RecordStatus, ReservationKey};
use staysync_storage::{
    InMemoryRecordStore, JobTracker, NoActiveJobs, RecordFilter, RecordStore, StaticJobTracker, StoreError,
};
use staysync_sync::{FeedStatus, KeepReason, KeyLocks, ReconcileOptions, Reconciler, RunSummary};

const AIRBNB: &str = "https://www.airbnb.com/calendar/ical/1.ics";
const VRBO: &str = "https://www.vrbo.com/icalendar/2.ics";

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 7, 1, 12, 0, 0).single().unwrap()
}

fn hours(h: i64) -> DateTime<Utc> {
    t0() + chrono::Duration::hours(h)
}

fn date(m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, m, d).unwrap()
}

fn calendar(events: &[(&str, &str, &str)]) -> String {
    let mut out = String::from("BEGIN:VCALENDAR\r\nVERSION:2.0\r\nPRODID:-//Test//Feed//EN\r\n");
    for (uid, start, end) in events {
        out.push_str(&format!(
            "BEGIN:VEVENT\r\nUID:{uid}\r\nDTSTART;VALUE=DATE:{start}\r\nDTEND;VALUE=DATE:{end}\r\nSUMMARY:Reserved\r\nEND:VEVENT\r\n"
        ));
    }
    out.push_str("END:VCALENDAR\r\n");
    out
}

fn binding(feed_url: &str, property: &str) -> FeedBinding {
    FeedBinding {
        feed_url: feed_url.into(),
        property_id: PropertyId::new(property),
    }
}

struct Harness {
    store: Arc<InMemoryRecordStore>,
    source: Arc<InMemoryFeedSource>,
    reconciler: Reconciler,
}

impl Harness {
    fn new() -> Self {
        Self::with(Arc::new(NoActiveJobs), ReconcileOptions::default())
    }

    fn with(jobs: Arc<dyn JobTracker>, options: ReconcileOptions) -> Self {
        let store = Arc::new(InMemoryRecordStore::new());
        let source = Arc::new(InMemoryFeedSource::new());
        let reconciler = Reconciler::new(store.clone(), source.clone(), Arc::new(ICalParser), jobs, options);
        Self {
            store,
            source,
            reconciler,
        }
    }

    async fn feed(&self, url: &str, events: &[(&str, &str, &str)]) {
        self.source.set_body(url, calendar(events)).await;
    }

    async fn cycle(&self, feeds: &[FeedBinding], now: DateTime<Utc>) -> RunSummary {
        self.reconciler.run_cycle(feeds, now).await
    }

    async fn active(&self) -> Vec<Record> {
        self.store
            .all_records()
            .await
            .into_iter()
            .filter(Record::is_active)
            .collect()
    }
}

fn key(checkin: NaiveDate, checkout: NaiveDate) -> ReservationKey {
    ReservationKey {
        property_id: PropertyId::new("P"),
        checkin,
        checkout,
        entry_type: staysync_core::EntryType::Reservation,
    }
}

#[tokio::test]
async fn churned_identifier_leaves_original_record_in_place() {
    let h = Harness::new();
    let feeds = [binding(AIRBNB, "P")];

    h.feed(AIRBNB, &[("a", "20250720", "20250820")]).await;
    let first = h.cycle(&feeds, t0()).await;
    assert_eq!(first.feeds[0].counts.created, 1);

    let active = h.active().await;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].composite_id.as_str(), "a_P");
    assert_eq!(active[0].status, RecordStatus::New);
    let original = active[0].record_id;

    h.feed(AIRBNB, &[("b", "20250720", "20250820")]).await;
    for step in 1..=4 {
        let run = h.cycle(&feeds, hours(6 * step)).await;
        assert_eq!(run.feeds[0].counts.created, 0);
        assert_eq!(run.feeds[0].counts.removed, 0);
    }

    let active = h.active().await;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].record_id, original);
    assert_eq!(active[0].composite_id.as_str(), "a_P");
    assert_eq!(active[0].status, RecordStatus::New);
    assert_eq!(active[0].tracking.presence, Presence::Seen);
    assert_eq!(h.store.all_records().await.len(), 1);
}

#[tokio::test]
async fn unchanged_feed_is_idempotent() {
    let h = Harness::new();
    let feeds = [binding(AIRBNB, "P")];
    h.feed(
        AIRBNB,
        &[("a", "20250720", "20250724"), ("b", "20250724", "20250729"), ("c", "20250801", "20250805")],
    )
    .await;

    h.cycle(&feeds, t0()).await;
    let created = h.store.write_stats().records_created;
    let before = h.store.all_records().await;

    let second = h.cycle(&feeds, hours(4)).await;
    let counts = second.feeds[0].counts;
    assert_eq!((counts.created, counts.modified, counts.removed), (0, 0, 0));
    assert_eq!(counts.unchanged, 3);
    assert_eq!(h.store.write_stats().records_created, created);

    let after = h.store.all_records().await;
    assert_eq!(after.len(), before.len());
    for (b, a) in before.iter().zip(&after) {
        assert_eq!(b.record_id, a.record_id);
        assert_eq!(b.status, a.status);
        assert_eq!(b.same_day_turnover, a.same_day_turnover);
    }
}

#[tokio::test]
async fn changed_dates_retire_and_supersede() {
    let h = Harness::new();
    let feeds = [binding(AIRBNB, "P")];

    h.feed(AIRBNB, &[("a", "20250720", "20250820")]).await;
    h.cycle(&feeds, t0()).await;
    let original = h.active().await[0].clone();

    h.feed(AIRBNB, &[("a", "20250721", "20250820")]).await;
    let run = h.cycle(&feeds, hours(6)).await;
    assert_eq!(run.feeds[0].counts.modified, 1);

    let retired = h.store.get(original.record_id).await.expect("retired version kept");
    assert_eq!(retired.status, RecordStatus::Old);
    assert_eq!(retired.checkin, date(7, 20));

    let active = h.active().await;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].status, RecordStatus::Modified);
    assert_eq!(active[0].checkin, date(7, 21));
    assert_eq!(active[0].composite_id, original.composite_id);

    let again = h.cycle(&feeds, hours(12)).await;
    assert_eq!(again.feeds[0].counts.modified, 0);
    assert_eq!(again.feeds[0].counts.unchanged, 1);
}

#[tokio::test]
async fn removal_needs_three_misses_across_the_grace_period() {
    let h = Harness::new();
    let feeds = [binding(AIRBNB, "P")];
    h.feed(AIRBNB, &[("a", "20250720", "20250820")]).await;
    h.cycle(&feeds, t0()).await;
    let id = h.active().await[0].record_id;

    h.feed(AIRBNB, &[]).await;
    h.cycle(&feeds, hours(6)).await;
    let record = h.store.get(id).await.expect("record");
    assert_eq!(record.status, RecordStatus::New);
    assert_eq!(record.tracking.presence, Presence::Missing { count: 1, since: hours(6) });

    h.cycle(&feeds, hours(12)).await;
    assert_eq!(h.store.get(id).await.expect("record").status, RecordStatus::New);

    let third = h.cycle(&feeds, hours(18)).await;
    assert_eq!(third.feeds[0].counts.removed, 1);
    let record = h.store.get(id).await.expect("record");
    assert_eq!(record.status, RecordStatus::Removed);
    assert!(h.active().await.is_empty());
}

#[tokio::test]
async fn rapid_misses_wait_for_the_grace_period() {
    let h = Harness::new();
    let feeds = [binding(AIRBNB, "P")];
    h.feed(AIRBNB, &[("a", "20250720", "20250820")]).await;
    h.cycle(&feeds, t0()).await;
    let id = h.active().await[0].record_id;

    h.feed(AIRBNB, &[]).await;
    let minute = |m: i64| t0() + chrono::Duration::minutes(m);
    for m in 1..=3 {
        h.cycle(&feeds, minute(m)).await;
    }
    let record = h.store.get(id).await.expect("record");
    assert_eq!(record.status, RecordStatus::New);
    assert_eq!(record.tracking.missing_count(), 3);

    let run = h.cycle(&feeds, hours(13)).await;
    assert_eq!(run.feeds[0].counts.removed, 1);
    assert_eq!(h.store.get(id).await.expect("record").status, RecordStatus::Removed);
}

#[tokio::test]
async fn reappearance_resets_the_missing_counter() {
    let h = Harness::new();
    let feeds = [binding(AIRBNB, "P")];
    let present = [("a", "20250720", "20250820")];

    h.feed(AIRBNB, &present).await;
    h.cycle(&feeds, t0()).await;
    let id = h.active().await[0].record_id;

    h.feed(AIRBNB, &[]).await;
    h.cycle(&feeds, hours(6)).await;
    h.cycle(&feeds, hours(12)).await;
    assert_eq!(h.store.get(id).await.expect("record").tracking.missing_count(), 2);

    h.feed(AIRBNB, &present).await;
    h.cycle(&feeds, hours(18)).await;
    let record = h.store.get(id).await.expect("record");
    assert_eq!(record.tracking.presence, Presence::Seen);
    assert_eq!(record.tracking.last_seen, Some(hours(18)));

    h.feed(AIRBNB, &[]).await;
    h.cycle(&feeds, hours(24)).await;
    h.cycle(&feeds, hours(30)).await;
    let record = h.store.get(id).await.expect("record");
    assert_eq!(record.status, RecordStatus::New);
    assert_eq!(record.tracking.missing_count(), 2);
}

#[tokio::test]
async fn past_stays_survive_absence() {
    let h = Harness::new();
    let feeds = [binding(AIRBNB, "P")];
    h.feed(AIRBNB, &[("old", "20250601", "20250620")]).await;
    h.cycle(&feeds, t0()).await;
    let id = h.active().await[0].record_id;

    h.feed(AIRBNB, &[]).await;
    for step in 1..=6 {
        let run = h.cycle(&feeds, hours(12 * step)).await;
        assert_eq!(run.feeds[0].kept_by_gate.get(&KeepReason::PastStay), Some(&1));
    }
    let record = h.store.get(id).await.expect("record");
    assert_eq!(record.status, RecordStatus::New);
    assert_eq!(record.tracking.presence, Presence::Seen);
}

#[tokio::test]
async fn active_job_blocks_removal() {
    let h = Harness::new();
    let feeds = [binding(AIRBNB, "P")];
    h.feed(AIRBNB, &[("a", "20250720", "20250820")]).await;
    h.cycle(&feeds, t0()).await;
    let record = h.active().await[0].clone();

    let guarded = Reconciler::new(
        h.store.clone(),
        h.source.clone(),
        Arc::new(ICalParser),
        Arc::new(StaticJobTracker::for_records([&record])),
        ReconcileOptions::default(),
    );
    h.feed(AIRBNB, &[]).await;
    for step in 1..=5 {
        let run = guarded.run_cycle(&feeds, hours(12 * step)).await;
        assert_eq!(run.feeds[0].kept_by_gate.get(&KeepReason::ActiveJob), Some(&1));
    }
    assert_eq!(
        h.store.get(record.record_id).await.expect("record").status,
        RecordStatus::New
    );
}

#[tokio::test]
async fn job_on_an_earlier_version_still_blocks_removal() {
    let h = Harness::new();
    let feeds = [binding(AIRBNB, "P")];
    h.feed(AIRBNB, &[("a", "20250720", "20250820")]).await;
    h.cycle(&feeds, t0()).await;
    let first_version = h.active().await[0].clone();

    let guarded = Reconciler::new(
        h.store.clone(),
        h.source.clone(),
        Arc::new(ICalParser),
        Arc::new(StaticJobTracker::for_records([&first_version])),
        ReconcileOptions::default(),
    );
    h.feed(AIRBNB, &[("a", "20250721", "20250820")]).await;
    let run = guarded.run_cycle(&feeds, hours(6)).await;
    assert_eq!(run.feeds[0].counts.modified, 1);
    let second_version = h.active().await[0].clone();
    assert_ne!(second_version.record_id, first_version.record_id);

    h.feed(AIRBNB, &[]).await;
    for step in 1..=5 {
        let run = guarded.run_cycle(&feeds, hours(6 + 12 * step)).await;
        assert_eq!(run.feeds[0].kept_by_gate.get(&KeepReason::ActiveJob), Some(&1));
        assert_eq!(run.feeds[0].counts.removed, 0);
    }
    let record = h.store.get(second_version.record_id).await.expect("record");
    assert_eq!(record.status, RecordStatus::Modified);
}

#[tokio::test]
async fn two_identifiers_for_one_stay_in_a_feed_yield_one_record() {
    let h = Harness::new();
    let feeds = [binding(AIRBNB, "P")];
    h.feed(AIRBNB, &[("a", "20250720", "20250820"), ("b", "20250720", "20250820")]).await;

    for step in 0..4 {
        let run = h.cycle(&feeds, hours(6 * step)).await;
        let counts = run.feeds[0].counts;
        assert_eq!(counts.created, if step == 0 { 1 } else { 0 });
        assert_eq!(counts.suppressed_duplicates, 1);
        assert_eq!(counts.removed, 0);
        assert_eq!(counts.skipped_errors, 0);
    }

    let records = h.store.all_records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].composite_id.as_str(), "a_P");
    assert_eq!(records[0].status, RecordStatus::New);
    assert_eq!(records[0].tracking.presence, Presence::Seen);
}

/// Delays every read so that concurrent passes interleave between reading
/// state and writing it.
struct SlowReads {
    inner: Arc<InMemoryRecordStore>,
    delay: Duration,
}

#[async_trait]
impl RecordStore for SlowReads {
    async fn query_records(&self, filter: &RecordFilter) -> Result<Vec<Record>, StoreError> {
        let records = self.inner.query_records(filter).await?;
        tokio::time::sleep(self.delay).await;
        Ok(records)
    }

    async fn create_records(&self, records: &[Record]) -> Result<(), StoreError> {
        self.inner.create_records(records).await
    }

    async fn update_records(&self, records: &[Record]) -> Result<(), StoreError> {
        self.inner.update_records(records).await
    }
}

fn slow_reconciler(h: &Harness) -> Reconciler {
    Reconciler::new(
        Arc::new(SlowReads {
            inner: h.store.clone(),
            delay: Duration::from_millis(20),
        }),
        h.source.clone(),
        Arc::new(ICalParser),
        Arc::new(NoActiveJobs),
        ReconcileOptions::default(),
    )
}

#[tokio::test]
async fn reprocessing_a_feed_concurrently_keeps_one_active_version() {
    let h = Harness::new();
    let feed = binding(AIRBNB, "P");
    h.feed(AIRBNB, &[("a", "20250720", "20250820")]).await;
    h.cycle(std::slice::from_ref(&feed), t0()).await;
    let original = h.active().await[0].clone();

    // z checks out the day a checks in, which changes a's turnover flag.
    h.feed(AIRBNB, &[("a", "20250720", "20250820"), ("z", "20250715", "20250720")]).await;
    let run = slow_reconciler(&h).run_cycle(&[feed.clone(), feed], hours(6)).await;
    let totals = run.totals();
    assert_eq!(totals.modified, 1);
    assert_eq!(totals.created, 1);

    let stay = h
        .store
        .query_records(&RecordFilter::active_for_key(key(date(7, 20), date(8, 20))))
        .await
        .expect("query");
    assert_eq!(stay.len(), 1);
    assert_eq!(stay[0].status, RecordStatus::Modified);
    assert_eq!(stay[0].same_day_turnover, Some(true));

    let retired = h.store.get(original.record_id).await.expect("record");
    assert_eq!(retired.status, RecordStatus::Old);
    assert_eq!(
        h.store
            .all_records()
            .await
            .iter()
            .filter(|r| r.status == RecordStatus::Old)
            .count(),
        1
    );
    let turnover = h
        .store
        .query_records(&RecordFilter::active_for_key(key(date(7, 15), date(7, 20))))
        .await
        .expect("query");
    assert_eq!(turnover.len(), 1);
}

#[tokio::test]
async fn reprocessing_a_feed_concurrently_counts_each_removal_once() {
    let h = Harness::new();
    let feed = binding(AIRBNB, "P");
    h.feed(AIRBNB, &[("a", "20250720", "20250820")]).await;
    h.cycle(std::slice::from_ref(&feed), t0()).await;
    let id = h.active().await[0].record_id;

    h.feed(AIRBNB, &[]).await;
    h.cycle(std::slice::from_ref(&feed), hours(6)).await;
    h.cycle(std::slice::from_ref(&feed), hours(12)).await;
    assert_eq!(h.store.get(id).await.expect("record").tracking.missing_count(), 2);

    let run = slow_reconciler(&h).run_cycle(&[feed.clone(), feed], hours(18)).await;
    assert_eq!(run.totals().removed, 1);
    let record = h.store.get(id).await.expect("record");
    assert_eq!(record.status, RecordStatus::Removed);
    assert_eq!(record.tracking.missing_count(), 3);
}

#[tokio::test]
async fn same_stay_from_two_feeds_yields_one_active_record() {
    let h = Harness::new();
    let feeds = [binding(AIRBNB, "P"), binding(VRBO, "P")];
    h.feed(AIRBNB, &[("airbnb-1", "20250720", "20250820")]).await;
    h.feed(VRBO, &[("vrbo-9", "20250720", "20250820")]).await;

    for step in 0..3 {
        let run = h.cycle(&feeds, hours(4 * step)).await;
        let totals = run.totals();
        if step == 0 {
            assert_eq!(totals.created, 1);
        }
        assert_eq!(totals.suppressed_duplicates, 1);
        assert_eq!(totals.removed, 0);
        assert!(run.is_success());
    }

    let active = h.active().await;
    assert_eq!(active.len(), 1);
    assert_eq!(h.store.all_records().await.len(), 1);
}

#[tokio::test]
async fn concurrent_reconcilers_share_key_locks() {
    let store = Arc::new(InMemoryRecordStore::new());
    let locks = Arc::new(KeyLocks::new());
    let mut reconcilers = Vec::new();
    for (url, uid) in [(AIRBNB, "airbnb-1"), (VRBO, "vrbo-9")] {
        let source = Arc::new(InMemoryFeedSource::new());
        source.set_body(url, calendar(&[(uid, "20250720", "20250820")])).await;
        let reconciler = Reconciler::new(
            store.clone(),
            source,
            Arc::new(ICalParser),
            Arc::new(NoActiveJobs),
            ReconcileOptions::default(),
        )
        .with_locks(locks.clone());
        reconcilers.push((reconciler, binding(url, "P")));
    }

    let (a, b) = tokio::join!(
        reconcilers[0].0.run_cycle(std::slice::from_ref(&reconcilers[0].1), t0()),
        reconcilers[1].0.run_cycle(std::slice::from_ref(&reconcilers[1].1), t0()),
    );
    assert_eq!(a.totals().created + b.totals().created, 1);
    assert_eq!(a.totals().suppressed_duplicates + b.totals().suppressed_duplicates, 1);

    let active = store
        .query_records(&RecordFilter::active_for_key(key(date(7, 20), date(8, 20))))
        .await
        .expect("query");
    assert_eq!(active.len(), 1);
}

#[tokio::test]
async fn cross_feed_duplicate_takes_over_once_original_is_removed() {
    let h = Harness::new();
    let airbnb = [binding(AIRBNB, "P")];
    let vrbo = [binding(VRBO, "P")];
    h.feed(AIRBNB, &[("airbnb-1", "20250720", "20250820")]).await;
    h.cycle(&airbnb, t0()).await;
    let original = h.active().await[0].clone();

    h.feed(AIRBNB, &[]).await;
    h.feed(VRBO, &[("vrbo-9", "20250720", "20250820")]).await;
    for step in 1..=3 {
        let run = h.cycle(&vrbo, hours(6 * step)).await;
        assert_eq!(run.feeds[0].counts.suppressed_duplicates, 1);
        h.cycle(&airbnb, hours(6 * step)).await;
        assert!(h.active().await.len() <= 1);
    }
    assert_eq!(
        h.store.get(original.record_id).await.expect("record").status,
        RecordStatus::Removed
    );

    let run = h.cycle(&vrbo, hours(24)).await;
    assert_eq!(run.totals().created, 1);
    let active = h.active().await;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].feed_url, VRBO);
    assert_eq!(active[0].composite_id.as_str(), "vrbo-9_P");
}

#[tokio::test]
async fn date_change_onto_an_occupied_stay_is_ignored() {
    let h = Harness::new();
    let feeds = [binding(AIRBNB, "P")];
    h.feed(AIRBNB, &[("a", "20250720", "20250820"), ("b", "20250725", "20250820")]).await;
    h.cycle(&feeds, t0()).await;
    assert_eq!(h.active().await.len(), 2);

    h.feed(AIRBNB, &[("a", "20250725", "20250820")]).await;
    let run = h.cycle(&feeds, hours(6)).await;
    assert_eq!(run.feeds[0].counts.suppressed_duplicates, 1);
    assert_eq!(run.feeds[0].counts.modified, 0);
    assert_eq!(
        run.feeds[0].kept_by_gate.get(&KeepReason::SuppressedDuplicate),
        Some(&1)
    );

    let records = h.store.all_records().await;
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(Record::is_active));
}

#[tokio::test]
async fn failed_feeds_skip_the_removal_pass() {
    let h = Harness::with(
        Arc::new(NoActiveJobs),
        ReconcileOptions {
            fetch_timeout: Duration::from_millis(50),
            ..ReconcileOptions::default()
        },
    );
    let feeds = [binding(AIRBNB, "P")];
    h.feed(AIRBNB, &[("a", "20250720", "20250820")]).await;
    h.cycle(&feeds, t0()).await;
    let id = h.active().await[0].record_id;

    h.source.set_status(AIRBNB, 503).await;
    let run = h.cycle(&feeds, hours(12)).await;
    assert_eq!(run.feeds[0].status, FeedStatus::FetchFailed);
    assert!(!run.is_success());

    h.source
        .set_slow_body(AIRBNB, calendar(&[]), Duration::from_millis(500))
        .await;
    let run = h.cycle(&feeds, hours(24)).await;
    assert_eq!(run.feeds[0].status, FeedStatus::TimedOut);

    h.source.set_body(AIRBNB, "<html>maintenance</html>").await;
    let run = h.cycle(&feeds, hours(36)).await;
    assert_eq!(run.feeds[0].status, FeedStatus::ParseFailed);

    let record = h.store.get(id).await.expect("record");
    assert_eq!(record.status, RecordStatus::New);
    assert_eq!(record.tracking.presence, Presence::Seen);
    assert_eq!(h.store.write_stats().update_calls, 0);
}

#[tokio::test]
async fn one_failing_feed_does_not_block_others() {
    let h = Harness::new();
    let feeds = [binding(AIRBNB, "P"), binding(VRBO, "Q")];
    h.source.set_status(AIRBNB, 500).await;
    h.feed(VRBO, &[("v", "20250720", "20250724")]).await;

    let run = h.cycle(&feeds, t0()).await;
    assert_eq!(run.feeds.len(), 2);
    assert_eq!(run.failed_feeds().len(), 1);
    assert_eq!(run.failed_feeds()[0].feed_url, AIRBNB);
    assert_eq!(run.totals().created, 1);
}

#[tokio::test]
async fn malformed_events_are_counted_and_the_rest_processed() {
    let h = Harness::new();
    let feeds = [binding(AIRBNB, "P")];
    let body = "BEGIN:VCALENDAR\r\n\
BEGIN:VEVENT\r\nUID:good\r\nDTSTART;VALUE=DATE:20250720\r\nDTEND;VALUE=DATE:20250724\r\nEND:VEVENT\r\n\
BEGIN:VEVENT\r\nUID:no-end\r\nDTSTART;VALUE=DATE:20250801\r\nEND:VEVENT\r\n\
BEGIN:VEVENT\r\nUID:bad-date\r\nDTSTART;VALUE=DATE:2025-13-45\r\nDTEND;VALUE=DATE:20250810\r\nEND:VEVENT\r\n\
END:VCALENDAR\r\n";
    h.source.set_body(AIRBNB, body).await;

    let run = h.cycle(&feeds, t0()).await;
    assert_eq!(run.feeds[0].status, FeedStatus::Completed);
    assert_eq!(run.feeds[0].counts.created, 1);
    assert_eq!(run.feeds[0].counts.skipped_errors, 2);
}

/// Fails every cross-feed key lookup, leaving feed queries and writes intact.
struct KeyLookupOutage {
    inner: Arc<InMemoryRecordStore>,
}

#[async_trait]
impl RecordStore for KeyLookupOutage {
    async fn query_records(&self, filter: &RecordFilter) -> Result<Vec<Record>, StoreError> {
        if filter.key.is_some() {
            return Err(StoreError::Unavailable("key index offline".into()));
        }
        self.inner.query_records(filter).await
    }

    async fn create_records(&self, records: &[Record]) -> Result<(), StoreError> {
        self.inner.create_records(records).await
    }

    async fn update_records(&self, records: &[Record]) -> Result<(), StoreError> {
        self.inner.update_records(records).await
    }
}

#[tokio::test]
async fn resolution_errors_fail_closed() {
    let h = Harness::new();
    let feeds = [binding(AIRBNB, "P")];
    h.feed(AIRBNB, &[("a", "20250720", "20250820")]).await;
    h.cycle(&feeds, t0()).await;
    let original = h.active().await[0].clone();

    let flaky = Reconciler::new(
        Arc::new(KeyLookupOutage {
            inner: h.store.clone(),
        }),
        h.source.clone(),
        Arc::new(ICalParser),
        Arc::new(NoActiveJobs),
        ReconcileOptions::default(),
    );
    h.feed(AIRBNB, &[("a", "20250725", "20250820"), ("new", "20250901", "20250905")]).await;
    for step in 1..=4 {
        let run = flaky.run_cycle(&feeds, hours(12 * step)).await;
        let report = &run.feeds[0];
        assert_eq!(report.status, FeedStatus::Completed);
        assert_eq!(report.counts.skipped_errors, 2);
        assert_eq!(report.counts.created, 0);
        assert_eq!(report.counts.removed, 0);
        assert_eq!(report.kept_by_gate.get(&KeepReason::Unresolved), Some(&1));
    }

    let records = h.store.all_records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].record_id, original.record_id);
    assert_eq!(records[0].status, RecordStatus::New);
    assert_eq!(records[0].tracking.presence, Presence::Seen);
}

#[tokio::test]
async fn many_feeds_complete_under_a_small_pool() {
    let h = Harness::with(
        Arc::new(NoActiveJobs),
        ReconcileOptions {
            max_concurrent_feeds: 2,
            ..ReconcileOptions::default()
        },
    );
    let mut feeds = Vec::new();
    for n in 0..8 {
        let url = format!("https://feeds.example/{n}.ics");
        h.feed(&url, &[("stay", "20250720", "20250724")]).await;
        feeds.push(binding(&url, &format!("prop-{n}")));
    }

    let run = h.cycle(&feeds, t0()).await;
    assert_eq!(run.feeds.len(), 8);
    assert!(run.is_success());
    assert_eq!(run.totals().created, 8);
    let mut urls: Vec<&str> = run.feeds.iter().map(|f| f.feed_url.as_str()).collect();
    let sorted = {
        let mut s = urls.clone();
        s.sort();
        s
    };
    assert_eq!(urls, sorted);
    urls.dedup();
    assert_eq!(urls.len(), 8);
}
