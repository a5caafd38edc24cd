//! Turns raw feed events into canonical, date-only [`Event`]s.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use staysync_core::{EntryType, Event, PropertyId, SourceId, StayAttributes};
use thiserror::Error;

use crate::ical::RawEvent;

/// Which property a feed's events belong to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedBinding {
    pub feed_url: String,
    pub property_id: PropertyId,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("event {uid:?} has no start date")]
    MissingStart { uid: Option<String> },
    #[error("event {uid:?} has no end date")]
    MissingEnd { uid: Option<String> },
    #[error("event {uid:?} checks out ({checkout}) before it checks in ({checkin})")]
    InvertedDates {
        uid: Option<String>,
        checkin: NaiveDate,
        checkout: NaiveDate,
    },
    #[error("event {uid:?} is cancelled")]
    Cancelled { uid: Option<String> },
}

const BLOCK_MARKERS: [&str; 4] = ["not available", "unavailable", "blocked", "closed period"];

pub fn classify_entry(summary: Option<&str>) -> EntryType {
    let Some(summary) = summary else {
        return EntryType::Reservation;
    };
    let lower = summary.to_ascii_lowercase();
    if BLOCK_MARKERS.iter().any(|marker| lower.contains(marker)) {
        EntryType::Block
    } else {
        EntryType::Reservation
    }
}

/// Deterministic stand-in for feeds that omit `UID`.
pub fn synthetic_source_id(
    property_id: &PropertyId,
    checkin: NaiveDate,
    checkout: NaiveDate,
    summary: Option<&str>,
) -> SourceId {
    let mut hasher = Sha256::new();
    hasher.update(property_id.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(checkin.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(checkout.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(summary.unwrap_or_default().as_bytes());
    let digest = hasher.finalize();
    SourceId::new(format!("synthetic-{}", hex::encode(&digest[..12])))
}

pub fn normalize_event(raw: &RawEvent, binding: &FeedBinding) -> Result<Event, NormalizeError> {
    let uid = raw.uid.clone();
    if raw.status.as_deref() == Some("CANCELLED") {
        return Err(NormalizeError::Cancelled { uid });
    }
    let checkin = raw
        .dtstart
        .ok_or_else(|| NormalizeError::MissingStart { uid: uid.clone() })?
        .date();
    let checkout = raw
        .dtend
        .ok_or_else(|| NormalizeError::MissingEnd { uid: uid.clone() })?
        .date();
    if checkout < checkin {
        return Err(NormalizeError::InvertedDates {
            uid,
            checkin,
            checkout,
        });
    }

    let summary = raw
        .summary
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty());
    let source_id = match uid.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(uid) => SourceId::new(uid),
        None => synthetic_source_id(&binding.property_id, checkin, checkout, summary),
    };

    Ok(Event {
        source_id,
        property_id: binding.property_id.clone(),
        checkin,
        checkout,
        entry_type: classify_entry(summary),
        feed_url: binding.feed_url.clone(),
        summary: summary.map(ToString::to_string),
        attributes: StayAttributes::default(),
    })
}

/// Derives the feed-wide attributes of each reservation: a same-day turnover
/// when another stay at the property checks out on its checkin date, and an
/// overlap when another stay shares any night with it. Blocks never carry
/// either flag.
pub fn annotate_stays(events: &mut [Event]) {
    let stays: Vec<(PropertyId, NaiveDate, NaiveDate)> = events
        .iter()
        .filter(|e| e.entry_type == EntryType::Reservation)
        .map(|e| (e.property_id.clone(), e.checkin, e.checkout))
        .collect();

    for event in events.iter_mut() {
        if event.entry_type != EntryType::Reservation {
            event.attributes = StayAttributes::default();
            continue;
        }
        let mut attributes = StayAttributes::default();
        let mut self_skipped = false;
        for (property_id, checkin, checkout) in &stays {
            if property_id != &event.property_id {
                continue;
            }
            if !self_skipped && *checkin == event.checkin && *checkout == event.checkout {
                self_skipped = true;
                continue;
            }
            if *checkout == event.checkin {
                attributes.same_day_turnover = true;
            }
            if *checkin < event.checkout && event.checkin < *checkout {
                attributes.overlapping = true;
            }
        }
        event.attributes = attributes;
    }
}
