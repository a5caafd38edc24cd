//! Removal detection for records that went missing from their feed.
//!
//! A record absent from one fetch is not evidence that the stay is gone: feeds
//! reissue identifiers, drop far-future entries and fail transiently. A missing
//! record is only removed once every gate below lets it through, in order:
//!
//! 1. the stay is not already over,
//! 2. no work is in flight (recent checkin, imminent checkout, active job),
//! 3. the checkin is inside the sync horizon,
//! 4. the stay did not reappear this cycle under another identity,
//! 5. it has been missing for `missing_threshold` consecutive cycles spanning
//!    at least `grace_period`.

use std::collections::BTreeMap;

use chrono::{Duration, Months, NaiveDate};
use serde::{Deserialize, Serialize};
use staysync_core::{Presence, Record, RecordStatus, Tracking};
use staysync_storage::JobTracker;
use tracing::{debug, warn};

use crate::context::CycleContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemovalPolicy {
    pub missing_threshold: u32,
    pub grace_period: Duration,
    pub horizon_months: u32,
    pub recent_checkin_days: i64,
    pub imminent_checkout_days: i64,
}

impl Default for RemovalPolicy {
    fn default() -> Self {
        Self {
            missing_threshold: 3,
            grace_period: Duration::hours(12),
            horizon_months: 6,
            recent_checkin_days: 7,
            imminent_checkout_days: 1,
        }
    }
}

impl RemovalPolicy {
    fn horizon_end(&self, today: NaiveDate) -> NaiveDate {
        today
            .checked_add_months(Months::new(self.horizon_months))
            .unwrap_or(NaiveDate::MAX)
    }
}

/// Why a missing record was left active this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeepReason {
    PastStay,
    RecentCheckin,
    ImminentCheckout,
    ActiveJob,
    BeyondHorizon,
    SuppressedDuplicate,
    Unresolved,
    FirstMiss,
    BelowThreshold,
    GracePeriod,
    LookupFailed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemovalDecision {
    /// Leave the record exactly as stored.
    Keep(KeepReason),
    /// Persist the advanced missing counter, keep the record active.
    Track { record: Record, reason: KeepReason },
    Remove(Record),
}

/// Runs the removal gates for one record that was not matched this cycle.
pub async fn decide(
    record: &Record,
    ctx: &CycleContext,
    jobs: &dyn JobTracker,
    policy: &RemovalPolicy,
) -> RemovalDecision {
    let today = ctx.today();

    if record.checkout < today {
        return RemovalDecision::Keep(KeepReason::PastStay);
    }

    let recent_from = today - Duration::days(policy.recent_checkin_days);
    if record.checkin >= recent_from && record.checkin <= today {
        return RemovalDecision::Keep(KeepReason::RecentCheckin);
    }
    if record.checkout <= today + Duration::days(policy.imminent_checkout_days) {
        return RemovalDecision::Keep(KeepReason::ImminentCheckout);
    }
    match jobs.has_active_job(record).await {
        Ok(true) => return RemovalDecision::Keep(KeepReason::ActiveJob),
        Ok(false) => {}
        Err(err) => {
            warn!(record_id = %record.record_id, error = %err, "job lookup failed; keeping record");
            return RemovalDecision::Keep(KeepReason::LookupFailed);
        }
    }

    if record.checkin > policy.horizon_end(today) {
        return RemovalDecision::Keep(KeepReason::BeyondHorizon);
    }

    if ctx.is_suppressed(&record.key()) {
        return RemovalDecision::Keep(KeepReason::SuppressedDuplicate);
    }
    if ctx.is_unresolved(record) {
        return RemovalDecision::Keep(KeepReason::Unresolved);
    }

    let now = ctx.now;
    let (count, since) = match record.tracking.presence {
        Presence::Seen => {
            let mut tracked = record.clone();
            tracked.tracking = Tracking {
                presence: Presence::Missing { count: 1, since: now },
                last_seen: record.tracking.last_seen,
            };
            return RemovalDecision::Track {
                record: tracked,
                reason: KeepReason::FirstMiss,
            };
        }
        Presence::Missing { count, since } => (count.saturating_add(1), since),
    };

    let mut next = record.clone();
    next.tracking.presence = Presence::Missing { count, since };

    if count < policy.missing_threshold {
        return RemovalDecision::Track {
            record: next,
            reason: KeepReason::BelowThreshold,
        };
    }
    if now - since < policy.grace_period {
        return RemovalDecision::Track {
            record: next,
            reason: KeepReason::GracePeriod,
        };
    }

    next.status = RecordStatus::Removed;
    next.last_updated = now;
    next.sync_details = Some(format!(
        "removed at {} after {} missed syncs since {}",
        now.to_rfc3339(),
        count,
        since.to_rfc3339()
    ));
    RemovalDecision::Remove(next)
}

#[derive(Debug, Default)]
pub struct SweepOutcome {
    /// Matched records whose missing counter or last-seen stamp needs resetting.
    pub refreshed: Vec<Record>,
    pub deferred: Vec<Record>,
    pub removed: Vec<Record>,
    pub kept: BTreeMap<KeepReason, usize>,
    pub lookup_failures: usize,
}

/// Removal pass over every active record of the cycle's feed.
///
/// Only call this once the feed's full event set has been processed. Nothing
/// is written here; the caller persists the staged records.
pub async fn sweep(ctx: &CycleContext, jobs: &dyn JobTracker, policy: &RemovalPolicy) -> SweepOutcome {
    let mut outcome = SweepOutcome::default();
    let now = ctx.now;

    for record in ctx.records() {
        if ctx.is_matched(record.record_id) {
            if record.tracking != Tracking::seen(now) || record.last_updated != now {
                let mut fresh = record.clone();
                fresh.tracking = Tracking::seen(now);
                fresh.last_updated = now;
                outcome.refreshed.push(fresh);
            }
            continue;
        }

        match decide(record, ctx, jobs, policy).await {
            RemovalDecision::Keep(reason) => {
                debug!(record_id = %record.record_id, key = %record.key(), ?reason, "missing record kept");
                if reason == KeepReason::LookupFailed {
                    outcome.lookup_failures += 1;
                }
                *outcome.kept.entry(reason).or_default() += 1;
            }
            RemovalDecision::Track { record: tracked, reason } => {
                debug!(
                    record_id = %tracked.record_id,
                    key = %tracked.key(),
                    missing_count = tracked.tracking.missing_count(),
                    ?reason,
                    "removal deferred"
                );
                *outcome.kept.entry(reason).or_default() += 1;
                outcome.deferred.push(tracked);
            }
            RemovalDecision::Remove(removed) => {
                debug!(record_id = %removed.record_id, key = %removed.key(), "removal gates passed");
                outcome.removed.push(removed);
            }
        }
    }

    outcome
}
