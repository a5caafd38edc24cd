//! Postgres-backed record store and job lookups.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use staysync_core::{
    CompositeId, EntryType, PropertyId, Record, RecordId, RecordStatus, Tracking,
};
use tracing::debug;
use uuid::Uuid;

use crate::{JobLookupError, JobTracker, RecordFilter, RecordStore, StoreError};

const RECORD_COLUMNS: &str = "record_id, composite_id, property_id, checkin, checkout, entry_type, \
     feed_url, status, summary, same_day_turnover, overlapping, service_job_id, missing_count, \
     missing_since, last_seen, last_updated, sync_details";

#[derive(Debug, Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn record_from_row(row: &PgRow) -> Result<Record, StoreError> {
    let record_id: Uuid = row.try_get("record_id")?;
    let corrupt = |reason: String| StoreError::CorruptRow {
        record_id: record_id.to_string(),
        reason,
    };

    let entry_type: String = row.try_get("entry_type")?;
    let entry_type = EntryType::parse(&entry_type)
        .ok_or_else(|| corrupt(format!("unknown entry type {entry_type:?}")))?;
    let status: String = row.try_get("status")?;
    let status = RecordStatus::parse(&status)
        .ok_or_else(|| corrupt(format!("unknown status {status:?}")))?;

    let missing_count: i32 = row.try_get("missing_count")?;
    let missing_since: Option<DateTime<Utc>> = row.try_get("missing_since")?;
    let last_seen: Option<DateTime<Utc>> = row.try_get("last_seen")?;
    let last_updated: DateTime<Utc> = row.try_get("last_updated")?;
    let checkin: NaiveDate = row.try_get("checkin")?;
    let checkout: NaiveDate = row.try_get("checkout")?;

    // NULL flags are read back as a concrete false.
    let same_day_turnover: Option<bool> = row.try_get("same_day_turnover")?;
    let overlapping: Option<bool> = row.try_get("overlapping")?;

    Ok(Record {
        record_id: RecordId::from_uuid(record_id),
        composite_id: CompositeId::from_stored(row.try_get::<String, _>("composite_id")?),
        property_id: PropertyId::new(row.try_get::<String, _>("property_id")?),
        checkin,
        checkout,
        entry_type,
        feed_url: row.try_get("feed_url")?,
        status,
        summary: row.try_get("summary")?,
        same_day_turnover: Some(same_day_turnover.unwrap_or(false)),
        overlapping: Some(overlapping.unwrap_or(false)),
        service_job_id: row.try_get("service_job_id")?,
        tracking: Tracking::from_stored(
            missing_count.max(0) as u32,
            missing_since,
            last_seen,
            last_updated,
        ),
        last_updated,
        sync_details: row.try_get("sync_details")?,
    })
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn query_records(&self, filter: &RecordFilter) -> Result<Vec<Record>, StoreError> {
        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT {RECORD_COLUMNS} FROM reservations WHERE TRUE"));
        if let Some(feed_url) = &filter.feed_url {
            qb.push(" AND feed_url = ").push_bind(feed_url.clone());
        }
        if let Some(composite_id) = &filter.composite_id {
            qb.push(" AND composite_id = ").push_bind(composite_id.as_str().to_string());
        }
        if let Some(key) = &filter.key {
            qb.push(" AND property_id = ")
                .push_bind(key.property_id.as_str().to_string())
                .push(" AND checkin = ")
                .push_bind(key.checkin)
                .push(" AND checkout = ")
                .push_bind(key.checkout)
                .push(" AND entry_type = ")
                .push_bind(key.entry_type.as_str());
        }
        if filter.active_only {
            qb.push(" AND status IN ('New', 'Modified')");
        }
        qb.push(" ORDER BY last_updated DESC");

        let rows = qb.build().fetch_all(&self.pool).await?;
        debug!(rows = rows.len(), ?filter, "queried reservations");
        rows.iter().map(record_from_row).collect()
    }

    async fn create_records(&self, records: &[Record]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for record in records {
            let result = sqlx::query(
                "INSERT INTO reservations (record_id, composite_id, property_id, checkin, checkout, \
                 entry_type, feed_url, status, summary, same_day_turnover, overlapping, service_job_id, \
                 missing_count, missing_since, last_seen, last_updated, sync_details) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17) \
                 ON CONFLICT (record_id) DO NOTHING",
            )
            .bind(record.record_id.as_uuid())
            .bind(record.composite_id.as_str())
            .bind(record.property_id.as_str())
            .bind(record.checkin)
            .bind(record.checkout)
            .bind(record.entry_type.as_str())
            .bind(&record.feed_url)
            .bind(record.status.as_str())
            .bind(&record.summary)
            .bind(record.same_day_turnover.unwrap_or(false))
            .bind(record.overlapping.unwrap_or(false))
            .bind(&record.service_job_id)
            .bind(record.tracking.missing_count() as i32)
            .bind(record.tracking.missing_since())
            .bind(record.tracking.last_seen)
            .bind(record.last_updated)
            .bind(&record.sync_details)
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() == 0 {
                return Err(StoreError::Conflict(record.record_id));
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn update_records(&self, records: &[Record]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for record in records {
            let result = sqlx::query(
                "UPDATE reservations SET composite_id = $2, property_id = $3, checkin = $4, \
                 checkout = $5, entry_type = $6, feed_url = $7, status = $8, summary = $9, \
                 same_day_turnover = $10, overlapping = $11, service_job_id = $12, \
                 missing_count = $13, missing_since = $14, last_seen = $15, last_updated = $16, \
                 sync_details = $17 WHERE record_id = $1",
            )
            .bind(record.record_id.as_uuid())
            .bind(record.composite_id.as_str())
            .bind(record.property_id.as_str())
            .bind(record.checkin)
            .bind(record.checkout)
            .bind(record.entry_type.as_str())
            .bind(&record.feed_url)
            .bind(record.status.as_str())
            .bind(&record.summary)
            .bind(record.same_day_turnover.unwrap_or(false))
            .bind(record.overlapping.unwrap_or(false))
            .bind(&record.service_job_id)
            .bind(record.tracking.missing_count() as i32)
            .bind(record.tracking.missing_since())
            .bind(record.tracking.last_seen)
            .bind(record.last_updated)
            .bind(&record.sync_details)
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() == 0 {
                return Err(StoreError::NotFound(record.record_id));
            }
        }
        tx.commit().await?;
        Ok(())
    }
}

/// Looks up `service_jobs` rows that are scheduled or in progress.
///
/// A job is attached to whichever version existed when it was booked, so the
/// lookup joins through every version sharing the record's composite id.
#[derive(Debug, Clone)]
pub struct PgJobTracker {
    pool: PgPool,
}

impl PgJobTracker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobTracker for PgJobTracker {
    async fn has_active_job(&self, record: &Record) -> Result<bool, JobLookupError> {
        let active: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM service_jobs j \
             JOIN reservations r ON r.record_id = j.reservation_id \
             WHERE r.composite_id = $1 AND r.property_id = $2 \
             AND j.status IN ('scheduled', 'in_progress')) \
             OR EXISTS (SELECT 1 FROM service_jobs \
             WHERE job_id = $3 AND status IN ('scheduled', 'in_progress'))",
        )
        .bind(record.composite_id.as_str())
        .bind(record.property_id.as_str())
        .bind(record.service_job_id.as_deref())
        .fetch_one(&self.pool)
        .await?;
        Ok(active)
    }
}
