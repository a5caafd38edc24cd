//! Core reservation model for staysync: feed events, stored records and their identities.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntryType {
    Reservation,
    Block,
}

impl EntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reservation => "Reservation",
            Self::Block => "Block",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Reservation" => Some(Self::Reservation),
            "Block" => Some(Self::Block),
            _ => None,
        }
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a stored record.
///
/// `DuplicateIgnored` exists so rows written by older tooling can be read back;
/// the reconciliation engine reports suppressed events through its outcome
/// counters and never persists this status itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordStatus {
    New,
    Modified,
    Old,
    Removed,
    DuplicateIgnored,
}

impl RecordStatus {
    pub const ACTIVE: [RecordStatus; 2] = [RecordStatus::New, RecordStatus::Modified];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "New",
            Self::Modified => "Modified",
            Self::Old => "Old",
            Self::Removed => "Removed",
            Self::DuplicateIgnored => "Duplicate_Ignored",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "New" => Some(Self::New),
            "Modified" => Some(Self::Modified),
            "Old" => Some(Self::Old),
            "Removed" => Some(Self::Removed),
            "Duplicate_Ignored" => Some(Self::DuplicateIgnored),
            _ => None,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::New | Self::Modified)
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event identifier exactly as published by a feed. Not stable across fetches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceId(String);

impl SourceId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PropertyId(String);

impl PropertyId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PropertyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Durable external identity of a record, `<source id>_<property id>`.
///
/// Only [`CompositeId::compose`] builds a new value, and it accepts a raw
/// [`SourceId`]; there is no conversion from a composite id back into a source
/// id, so an identity cannot be composed twice.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CompositeId(String);

impl CompositeId {
    pub fn compose(source_id: &SourceId, property_id: &PropertyId) -> Self {
        Self(format!("{}_{}", source_id.as_str(), property_id.as_str()))
    }

    /// Rehydrates a value previously written to the store, verbatim.
    pub fn from_stored(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CompositeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Store-assigned identity. Immutable once created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId(Uuid);

impl RecordId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The tuple on which at most one active record may exist.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReservationKey {
    pub property_id: PropertyId,
    pub checkin: NaiveDate,
    pub checkout: NaiveDate,
    pub entry_type: EntryType,
}

impl fmt::Display for ReservationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}..{}:{}",
            self.property_id, self.checkin, self.checkout, self.entry_type
        )
    }
}

/// User-visible attributes derived from the whole feed rather than one event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StayAttributes {
    pub same_day_turnover: bool,
    pub overlapping: bool,
}

/// One normalized feed item for one reconciliation cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub source_id: SourceId,
    pub property_id: PropertyId,
    pub checkin: NaiveDate,
    pub checkout: NaiveDate,
    pub entry_type: EntryType,
    pub feed_url: String,
    pub summary: Option<String>,
    pub attributes: StayAttributes,
}

impl Event {
    pub fn key(&self) -> ReservationKey {
        ReservationKey {
            property_id: self.property_id.clone(),
            checkin: self.checkin,
            checkout: self.checkout,
            entry_type: self.entry_type,
        }
    }

    pub fn composite_id(&self) -> CompositeId {
        CompositeId::compose(&self.source_id, &self.property_id)
    }
}

/// Whether a record was present in its feed the last time the feed was reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Presence {
    #[default]
    Seen,
    Missing {
        count: u32,
        since: DateTime<Utc>,
    },
}

/// Removal bookkeeping carried by every record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Tracking {
    pub presence: Presence,
    pub last_seen: Option<DateTime<Utc>>,
}

impl Tracking {
    pub fn seen(at: DateTime<Utc>) -> Self {
        Self {
            presence: Presence::Seen,
            last_seen: Some(at),
        }
    }

    /// Rebuilds tracking from the store's flat columns. A positive count with no
    /// recorded start falls back to `fallback_since`.
    pub fn from_stored(
        missing_count: u32,
        missing_since: Option<DateTime<Utc>>,
        last_seen: Option<DateTime<Utc>>,
        fallback_since: DateTime<Utc>,
    ) -> Self {
        let presence = match missing_count {
            0 => Presence::Seen,
            count => Presence::Missing {
                count,
                since: missing_since.unwrap_or(fallback_since),
            },
        };
        Self {
            presence,
            last_seen,
        }
    }

    pub fn missing_count(&self) -> u32 {
        match self.presence {
            Presence::Seen => 0,
            Presence::Missing { count, .. } => count,
        }
    }

    pub fn missing_since(&self) -> Option<DateTime<Utc>> {
        match self.presence {
            Presence::Seen => None,
            Presence::Missing { since, .. } => Some(since),
        }
    }
}

/// Durable stored reservation record. One version in a reservation lineage.
///
/// The attribute flags stay optional because rows written by other tools may
/// leave them unset; readers treat `None` as `false`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub record_id: RecordId,
    pub composite_id: CompositeId,
    pub property_id: PropertyId,
    pub checkin: NaiveDate,
    pub checkout: NaiveDate,
    pub entry_type: EntryType,
    pub feed_url: String,
    pub status: RecordStatus,
    pub summary: Option<String>,
    pub same_day_turnover: Option<bool>,
    pub overlapping: Option<bool>,
    pub service_job_id: Option<String>,
    pub tracking: Tracking,
    pub last_updated: DateTime<Utc>,
    pub sync_details: Option<String>,
}

impl Record {
    /// First version of a new lineage, created when an event has no active match.
    pub fn first_sighting(event: &Event, now: DateTime<Utc>) -> Self {
        Self {
            record_id: RecordId::new(),
            composite_id: event.composite_id(),
            property_id: event.property_id.clone(),
            checkin: event.checkin,
            checkout: event.checkout,
            entry_type: event.entry_type,
            feed_url: event.feed_url.clone(),
            status: RecordStatus::New,
            summary: event.summary.clone(),
            same_day_turnover: Some(event.attributes.same_day_turnover),
            overlapping: Some(event.attributes.overlapping),
            service_job_id: None,
            tracking: Tracking::seen(now),
            last_updated: now,
            sync_details: Some(format!("created from feed at {}", now.to_rfc3339())),
        }
    }

    pub fn key(&self) -> ReservationKey {
        ReservationKey {
            property_id: self.property_id.clone(),
            checkin: self.checkin,
            checkout: self.checkout,
            entry_type: self.entry_type,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn attributes(&self) -> StayAttributes {
        StayAttributes {
            same_day_turnover: self.same_day_turnover.unwrap_or(false),
            overlapping: self.overlapping.unwrap_or(false),
        }
    }
}
