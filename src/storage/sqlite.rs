//! SQLite storage implementation.
//!
//! Provides persistent storage using SQLite database. Conditional writes are
//! single statements; the number of affected rows tells whether they applied.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use super::{Consistency, SliceStatus, Storage, StorageError, StoredLock};
use crate::core::clock::{Clock, SystemClock};
use crate::core::job::JobDetails;
use crate::core::trigger::Trigger;
use crate::core::types::{JobId, TimeSlice};

type JobRow = (String, String, String, String, String, i64);

/// SQLite storage backend.
///
/// Provides persistent storage with automatic schema migration.
pub struct SqliteStorage {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    consistency: Consistency,
}

impl SqliteStorage {
    /// Create a new SQLite storage with the given database path.
    ///
    /// Creates the database file if it doesn't exist and runs migrations.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path_str = path.as_ref().to_string_lossy();
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path_str))
            .map_err(|e| StorageError::Other(e.to_string()))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;

        Self::from_pool(pool).await
    }

    /// Create an in-memory SQLite database (useful for testing).
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StorageError::Other(e.to_string()))?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;

        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self, StorageError> {
        let storage = Self {
            pool,
            clock: Arc::new(SystemClock),
            consistency: Consistency::default(),
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Use `clock` for shared-lock expiry.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Record the consistency level this session runs at.
    pub fn with_consistency(mut self, consistency: Consistency) -> Self {
        self.consistency = consistency;
        self
    }

    /// Run database migrations.
    async fn run_migrations(&self) -> Result<(), StorageError> {
        let schema = include_str!("../../migrations/001_initial_schema.sql");
        sqlx::raw_sql(schema)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Other(format!("migration failed: {}", e)))?;
        Ok(())
    }

    /// Close the database connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    fn now_millis(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }

    async fn set_flag(
        &self,
        column: &'static str,
        slice: TimeSlice,
        id: &JobId,
    ) -> Result<(), StorageError> {
        let sql = format!(
            "INSERT INTO jobs_status (time_slice, job_id, {column}) VALUES (?1, ?2, 1) \
             ON CONFLICT(time_slice, job_id) DO UPDATE SET {column} = 1"
        );
        sqlx::query(&sql)
            .bind(slice.timestamp_millis())
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;
        Ok(())
    }
}

// Helper functions for row conversion
fn slice_from_millis(millis: i64) -> Result<TimeSlice, StorageError> {
    TimeSlice::from_start_millis(millis)
        .ok_or_else(|| StorageError::SerializationError(format!("invalid time slice: {}", millis)))
}

fn parse_job_id(s: &str) -> Result<JobId, StorageError> {
    JobId::from_str(s).map_err(|e| StorageError::SerializationError(e.to_string()))
}

fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn row_to_job(row: JobRow) -> Result<JobDetails, StorageError> {
    let parameters: BTreeMap<String, String> = serde_json::from_str(&row.3)
        .map_err(|e| StorageError::SerializationError(e.to_string()))?;
    let trigger: Trigger = serde_json::from_str(&row.4)
        .map_err(|e| StorageError::SerializationError(e.to_string()))?;

    Ok(JobDetails {
        job_id: parse_job_id(&row.0)?,
        job_type: row.1,
        job_name: row.2,
        parameters,
        trigger,
        retry_count: u32::try_from(row.5).unwrap_or(u32::MAX),
    })
}

fn encode_job(job: &JobDetails) -> Result<(String, String), StorageError> {
    let parameters = serde_json::to_string(&job.parameters)
        .map_err(|e| StorageError::SerializationError(e.to_string()))?;
    let trigger = serde_json::to_string(&job.trigger)
        .map_err(|e| StorageError::SerializationError(e.to_string()))?;
    Ok((parameters, trigger))
}

#[async_trait]
impl Storage for SqliteStorage {
    fn consistency(&self) -> Consistency {
        self.consistency
    }

    async fn insert_job(&self, job: JobDetails) -> Result<(), StorageError> {
        let (parameters, trigger) = encode_job(&job)?;
        let result = sqlx::query(
            r#"
            INSERT INTO jobs (job_id, job_type, job_name, parameters, trigger, trigger_time, retry_count)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(job.job_id.to_string())
        .bind(&job.job_type)
        .bind(&job.job_name)
        .bind(parameters)
        .bind(trigger)
        .bind(job.trigger.trigger_time().timestamp_millis())
        .bind(i64::from(job.retry_count))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(StorageError::DuplicateKey(format!("job: {}", job.job_id)))
            }
            Err(e) => Err(StorageError::Other(e.to_string())),
        }
    }

    async fn get_job(&self, id: &JobId) -> Result<JobDetails, StorageError> {
        let row: JobRow = sqlx::query_as(
            "SELECT job_id, job_type, job_name, parameters, trigger, retry_count FROM jobs WHERE job_id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Other(e.to_string()))?
        .ok_or_else(|| StorageError::NotFound(format!("job: {}", id)))?;

        row_to_job(row)
    }

    async fn update_job(&self, job: JobDetails) -> Result<(), StorageError> {
        let (parameters, trigger) = encode_job(&job)?;
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET job_type = ?, job_name = ?, parameters = ?, trigger = ?, trigger_time = ?, retry_count = ?
            WHERE job_id = ?
            "#,
        )
        .bind(&job.job_type)
        .bind(&job.job_name)
        .bind(parameters)
        .bind(trigger)
        .bind(job.trigger.trigger_time().timestamp_millis())
        .bind(i64::from(job.retry_count))
        .bind(job.job_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Other(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("job: {}", job.job_id)));
        }
        Ok(())
    }

    async fn delete_job(&self, id: &JobId) -> Result<(), StorageError> {
        let result = sqlx::query("DELETE FROM jobs WHERE job_id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("job: {}", id)));
        }
        Ok(())
    }

    async fn list_jobs(&self) -> Result<Vec<JobDetails>, StorageError> {
        let rows: Vec<JobRow> = sqlx::query_as(
            "SELECT job_id, job_type, job_name, parameters, trigger, retry_count FROM jobs ORDER BY trigger_time, job_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Other(e.to_string()))?;

        rows.into_iter().map(row_to_job).collect()
    }

    async fn add_scheduled(&self, slice: TimeSlice, id: &JobId) -> Result<(), StorageError> {
        self.set_flag("scheduled", slice, id).await
    }

    async fn remove_scheduled(&self, slice: TimeSlice, id: &JobId) -> Result<(), StorageError> {
        sqlx::query("UPDATE jobs_status SET scheduled = 0 WHERE time_slice = ? AND job_id = ?")
            .bind(slice.timestamp_millis())
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;
        Ok(())
    }

    async fn add_active(&self, slice: TimeSlice, id: &JobId) -> Result<(), StorageError> {
        self.set_flag("active", slice, id).await
    }

    async fn add_finished(&self, slice: TimeSlice, id: &JobId) -> Result<(), StorageError> {
        self.set_flag("finished", slice, id).await
    }

    async fn get_slice_status(&self, slice: TimeSlice) -> Result<SliceStatus, StorageError> {
        let rows: Vec<(String, bool, bool, bool)> = sqlx::query_as(
            "SELECT job_id, scheduled, active, finished FROM jobs_status WHERE time_slice = ?",
        )
        .bind(slice.timestamp_millis())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Other(e.to_string()))?;

        let mut status = SliceStatus::empty(slice);
        for (job_id, scheduled, active, finished) in rows {
            let id = parse_job_id(&job_id)?;
            if scheduled {
                status.scheduled.insert(id);
            }
            if active {
                status.active.insert(id);
            }
            if finished {
                status.finished.insert(id);
            }
        }
        Ok(status)
    }

    async fn delete_slice(&self, slice: TimeSlice) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM jobs_status WHERE time_slice = ?")
            .bind(slice.timestamp_millis())
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;
        Ok(())
    }

    async fn list_slices(&self) -> Result<Vec<TimeSlice>, StorageError> {
        let rows: Vec<(i64,)> =
            sqlx::query_as("SELECT DISTINCT time_slice FROM jobs_status ORDER BY time_slice")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| StorageError::Other(e.to_string()))?;

        rows.into_iter().map(|(ms,)| slice_from_millis(ms)).collect()
    }

    async fn get_active_queue(&self) -> Result<Option<TimeSlice>, StorageError> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT time_slice FROM active_queue WHERE id = 0")
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;

        row.map(|(ms,)| slice_from_millis(ms)).transpose()
    }

    async fn init_active_queue(&self, slice: TimeSlice) -> Result<bool, StorageError> {
        let result = sqlx::query(
            "INSERT INTO active_queue (id, time_slice) VALUES (0, ?) ON CONFLICT(id) DO NOTHING",
        )
        .bind(slice.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Other(e.to_string()))?;

        Ok(result.rows_affected() == 1)
    }

    async fn advance_active_queue(
        &self,
        expected: TimeSlice,
        next: TimeSlice,
    ) -> Result<bool, StorageError> {
        let result =
            sqlx::query("UPDATE active_queue SET time_slice = ? WHERE id = 0 AND time_slice = ?")
                .bind(next.timestamp_millis())
                .bind(expected.timestamp_millis())
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Other(e.to_string()))?;

        Ok(result.rows_affected() == 1)
    }

    async fn try_lock_exclusive(&self, name: &str, owner: &str) -> Result<bool, StorageError> {
        let result = sqlx::query(
            r#"
            INSERT INTO locks (name, owner)
            SELECT ?1, ?2
            WHERE NOT EXISTS (
                SELECT 1 FROM lock_owners WHERE name = ?1 AND expires_at > ?3
            )
            ON CONFLICT(name) DO UPDATE SET owner = excluded.owner
            WHERE locks.owner IS NULL OR locks.owner = excluded.owner
            "#,
        )
        .bind(name)
        .bind(owner)
        .bind(self.now_millis())
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Other(e.to_string()))?;

        Ok(result.rows_affected() == 1)
    }

    async fn try_lock_shared(
        &self,
        name: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, StorageError> {
        let now = self.clock.now();
        let expires_at = now
            .checked_add_signed(TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        // Expired owners are purged lazily; a plain write is enough here.
        sqlx::query("DELETE FROM lock_owners WHERE name = ? AND expires_at <= ?")
            .bind(name)
            .bind(now.timestamp_millis())
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;

        let result = sqlx::query(
            r#"
            INSERT INTO lock_owners (name, owner, expires_at)
            SELECT ?1, ?2, ?3
            WHERE NOT EXISTS (
                SELECT 1 FROM locks WHERE name = ?1 AND owner IS NOT NULL
            )
            ON CONFLICT(name, owner) DO UPDATE SET expires_at = excluded.expires_at
            "#,
        )
        .bind(name)
        .bind(owner)
        .bind(expires_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Other(e.to_string()))?;

        Ok(result.rows_affected() == 1)
    }

    async fn unlock_shared(&self, name: &str, owner: &str) -> Result<bool, StorageError> {
        let result = sqlx::query(
            r#"
            DELETE FROM lock_owners
            WHERE name = ?1 AND owner = ?2 AND expires_at > ?3
              AND NOT EXISTS (SELECT 1 FROM locks WHERE name = ?1 AND owner IS NOT NULL)
            "#,
        )
        .bind(name)
        .bind(owner)
        .bind(self.now_millis())
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Other(e.to_string()))?;

        Ok(result.rows_affected() == 1)
    }

    async fn unlock_exclusive(&self, name: &str, owner: &str) -> Result<bool, StorageError> {
        let result = sqlx::query("UPDATE locks SET owner = NULL WHERE name = ? AND owner = ?")
            .bind(name)
            .bind(owner)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;

        Ok(result.rows_affected() == 1)
    }

    async fn get_lock(&self, name: &str) -> Result<Option<StoredLock>, StorageError> {
        let owner: Option<(Option<String>,)> =
            sqlx::query_as("SELECT owner FROM locks WHERE name = ?")
                .bind(name)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| StorageError::Other(e.to_string()))?;

        let shared: Vec<(String, i64)> = sqlx::query_as(
            "SELECT owner, expires_at FROM lock_owners WHERE name = ? AND expires_at > ? ORDER BY owner",
        )
        .bind(name)
        .bind(self.now_millis())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Other(e.to_string()))?;

        let lock = StoredLock {
            name: name.to_string(),
            exclusive_owner: owner.and_then(|(o,)| o),
            shared_owners: shared
                .into_iter()
                .map(|(o, expires_at)| (o, millis_to_datetime(expires_at)))
                .collect(),
        };
        Ok((!lock.is_free()).then_some(lock))
    }
}
