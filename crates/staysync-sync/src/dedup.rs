//! Duplicate suppression for events that resolved to no existing identity.

use staysync_core::{Record, RecordId, ReservationKey};
use staysync_storage::{RecordFilter, RecordStore, StoreError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DuplicateVerdict {
    Unique,
    /// An active record already holds this stay under another identity.
    DuplicateOf(Record),
}

/// Asks the store, across all feeds, whether `key` already has an active record.
///
/// A store failure is returned to the caller; it must never be read as "unique",
/// since that would create a sibling record for the same stay.
pub async fn check_duplicate(
    store: &dyn RecordStore,
    key: &ReservationKey,
    excluding: Option<RecordId>,
) -> Result<DuplicateVerdict, StoreError> {
    let existing = store
        .query_records(&RecordFilter::active_for_key(key.clone()))
        .await?
        .into_iter()
        .filter(|r| r.is_active() && Some(r.record_id) != excluding)
        .max_by_key(|r| r.last_updated);

    Ok(match existing {
        Some(record) => DuplicateVerdict::DuplicateOf(record),
        None => DuplicateVerdict::Unique,
    })
}
