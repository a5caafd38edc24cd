//! Record store, job-tracking lookups and feed fetching for staysync.

mod fetch;
mod postgres;

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use staysync_core::{CompositeId, Record, RecordId, ReservationKey};
use thiserror::Error;
use tokio::sync::Mutex;

pub use fetch::{
    retry_reason_for_error, retry_reason_for_status, FeedClientConfig, FeedFetcher, FeedRetryPolicy, FetchError,
    FetchedFeed, RetryReason,
};
pub use postgres::{PgJobTracker, PgRecordStore};

/// Selection criteria understood by every [`RecordStore`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFilter {
    pub feed_url: Option<String>,
    pub composite_id: Option<CompositeId>,
    pub key: Option<ReservationKey>,
    pub active_only: bool,
}

impl RecordFilter {
    pub fn active_for_feed(feed_url: impl Into<String>) -> Self {
        Self {
            feed_url: Some(feed_url.into()),
            active_only: true,
            ..Self::default()
        }
    }

    pub fn active_for_key(key: ReservationKey) -> Self {
        Self {
            key: Some(key),
            active_only: true,
            ..Self::default()
        }
    }

    /// Active versions of one identity within a feed.
    pub fn active_for_identity(feed_url: impl Into<String>, composite_id: CompositeId) -> Self {
        Self {
            feed_url: Some(feed_url.into()),
            composite_id: Some(composite_id),
            active_only: true,
            ..Self::default()
        }
    }

    /// Narrows the filter to one feed.
    pub fn in_feed(mut self, feed_url: impl Into<String>) -> Self {
        self.feed_url = Some(feed_url.into());
        self
    }

    pub fn matches(&self, record: &Record) -> bool {
        if self.active_only && !record.is_active() {
            return false;
        }
        if let Some(feed_url) = &self.feed_url {
            if &record.feed_url != feed_url {
                return false;
            }
        }
        if let Some(composite_id) = &self.composite_id {
            if &record.composite_id != composite_id {
                return false;
            }
        }
        if let Some(key) = &self.key {
            if &record.key() != key {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("record {0} already exists")]
    Conflict(RecordId),
    #[error("record {0} not found")]
    NotFound(RecordId),
    #[error("stored row {record_id} is malformed: {reason}")]
    CorruptRow { record_id: String, reason: String },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// The persistent source of truth for record state across cycles.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn query_records(&self, filter: &RecordFilter) -> Result<Vec<Record>, StoreError>;

    async fn create_records(&self, records: &[Record]) -> Result<(), StoreError>;

    async fn update_records(&self, records: &[Record]) -> Result<(), StoreError>;
}

#[derive(Debug, Error)]
pub enum JobLookupError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("job tracker unavailable: {0}")]
    Unavailable(String),
}

/// Read-only view of field-service jobs attached to reservations.
///
/// Jobs follow a reservation's lineage: a job scheduled against one version
/// still counts once the reservation has been superseded.
#[async_trait]
pub trait JobTracker: Send + Sync {
    async fn has_active_job(&self, record: &Record) -> Result<bool, JobLookupError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoActiveJobs;

#[async_trait]
impl JobTracker for NoActiveJobs {
    async fn has_active_job(&self, _record: &Record) -> Result<bool, JobLookupError> {
        Ok(false)
    }
}

/// Fixed set of reservation identities with scheduled or in-progress jobs.
#[derive(Debug, Default, Clone)]
pub struct StaticJobTracker {
    active: HashSet<CompositeId>,
}

impl StaticJobTracker {
    pub fn new(active: impl IntoIterator<Item = CompositeId>) -> Self {
        Self {
            active: active.into_iter().collect(),
        }
    }

    /// Tracks a job on each record's identity, covering every later version.
    pub fn for_records<'a>(records: impl IntoIterator<Item = &'a Record>) -> Self {
        Self::new(records.into_iter().map(|r| r.composite_id.clone()))
    }
}

#[async_trait]
impl JobTracker for StaticJobTracker {
    async fn has_active_job(&self, record: &Record) -> Result<bool, JobLookupError> {
        Ok(self.active.contains(&record.composite_id))
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StoreWriteStats {
    pub create_calls: usize,
    pub update_calls: usize,
    pub records_created: usize,
    pub records_updated: usize,
}

/// Process-local store used by tests and dry runs.
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    records: Mutex<BTreeMap<RecordId, Record>>,
    create_calls: AtomicUsize,
    update_calls: AtomicUsize,
    records_created: AtomicUsize,
    records_updated: AtomicUsize,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds records without counting them as writes.
    pub async fn seed(&self, records: impl IntoIterator<Item = Record>) {
        let mut map = self.records.lock().await;
        for record in records {
            map.insert(record.record_id, record);
        }
    }

    pub async fn all_records(&self) -> Vec<Record> {
        self.records.lock().await.values().cloned().collect()
    }

    pub async fn get(&self, record_id: RecordId) -> Option<Record> {
        self.records.lock().await.get(&record_id).cloned()
    }

    pub fn write_stats(&self) -> StoreWriteStats {
        StoreWriteStats {
            create_calls: self.create_calls.load(Ordering::SeqCst),
            update_calls: self.update_calls.load(Ordering::SeqCst),
            records_created: self.records_created.load(Ordering::SeqCst),
            records_updated: self.records_updated.load(Ordering::SeqCst),
        }
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn query_records(&self, filter: &RecordFilter) -> Result<Vec<Record>, StoreError> {
        let map = self.records.lock().await;
        Ok(map.values().filter(|r| filter.matches(r)).cloned().collect())
    }

    async fn create_records(&self, records: &[Record]) -> Result<(), StoreError> {
        let mut map = self.records.lock().await;
        if let Some(existing) = records.iter().find(|r| map.contains_key(&r.record_id)) {
            return Err(StoreError::Conflict(existing.record_id));
        }
        for record in records {
            map.insert(record.record_id, record.clone());
        }
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        self.records_created.fetch_add(records.len(), Ordering::SeqCst);
        Ok(())
    }

    async fn update_records(&self, records: &[Record]) -> Result<(), StoreError> {
        let mut map = self.records.lock().await;
        if let Some(missing) = records.iter().find(|r| !map.contains_key(&r.record_id)) {
            return Err(StoreError::NotFound(missing.record_id));
        }
        for record in records {
            map.insert(record.record_id, record.clone());
        }
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        self.records_updated.fetch_add(records.len(), Ordering::SeqCst);
        Ok(())
    }
}
