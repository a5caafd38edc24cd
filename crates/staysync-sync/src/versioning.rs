//! Change detection and append-only versioning of records.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use staysync_core::{Event, Record, RecordId, RecordStatus, Tracking};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ChangedField {
    Checkin,
    Checkout,
    EntryType,
    SameDayTurnover,
    Overlapping,
}

impl ChangedField {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Checkin => "checkin",
            Self::Checkout => "checkout",
            Self::EntryType => "entry_type",
            Self::SameDayTurnover => "same_day_turnover",
            Self::Overlapping => "overlapping",
        }
    }
}

impl fmt::Display for ChangedField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fields of `record` that `event` would change. Both sides are already
/// date-only, and unset stored flags compare as `false`.
pub fn detect_changes(record: &Record, event: &Event) -> Vec<ChangedField> {
    let stored = record.attributes();
    let mut changes = Vec::new();
    if record.checkin != event.checkin {
        changes.push(ChangedField::Checkin);
    }
    if record.checkout != event.checkout {
        changes.push(ChangedField::Checkout);
    }
    if record.entry_type != event.entry_type {
        changes.push(ChangedField::EntryType);
    }
    if stored.same_day_turnover != event.attributes.same_day_turnover {
        changes.push(ChangedField::SameDayTurnover);
    }
    if stored.overlapping != event.attributes.overlapping {
        changes.push(ChangedField::Overlapping);
    }
    changes
}

/// Builds the next version of `previous`: everything is carried over except
/// the sync audit fields, then the event's values are applied and the status
/// becomes `Modified`. The composite id is carried over as stored.
pub fn successor(previous: &Record, event: &Event, changes: &[ChangedField], now: DateTime<Utc>) -> Record {
    let mut next = previous.clone();
    next.record_id = RecordId::new();
    next.tracking = Tracking::seen(now);
    next.last_updated = now;
    next.checkin = event.checkin;
    next.checkout = event.checkout;
    next.entry_type = event.entry_type;
    next.same_day_turnover = Some(event.attributes.same_day_turnover);
    next.overlapping = Some(event.attributes.overlapping);
    if event.summary.is_some() {
        next.summary = event.summary.clone();
    }

    let fields: Vec<&str> = changes.iter().map(ChangedField::as_str).collect();
    next.sync_details = Some(format!(
        "modified at {} (changed: {}; previous version {})",
        now.to_rfc3339(),
        fields.join(", "),
        previous.record_id
    ));
    next.status = RecordStatus::Modified;
    next
}

/// The superseded version, kept as history.
pub fn retire(previous: &Record, now: DateTime<Utc>) -> Record {
    let mut retired = previous.clone();
    retired.status = RecordStatus::Old;
    retired.last_updated = now;
    retired
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Unchanged,
    Superseded {
        retired: Record,
        successor: Record,
        fields: Vec<ChangedField>,
    },
}

pub fn apply_event(record: &Record, event: &Event, now: DateTime<Utc>) -> Change {
    let fields = detect_changes(record, event);
    if fields.is_empty() {
        return Change::Unchanged;
    }
    Change::Superseded {
        retired: retire(record, now),
        successor: successor(record, event, &fields, now),
        fields,
    }
}
