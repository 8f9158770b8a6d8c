use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;
use serde_json::Value;
use serde_with::{DeserializeFromStr, SerializeDisplay};
use strum_macros::{Display, EnumIter, EnumString};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use uuid::Uuid;

use crate::device::DeviceKind;
use crate::error::QueueError;

/// Lifecycle of one queued operation. Progression is monotonic:
/// pending → processing → (completed | failed | cancelled).
#[derive(
    Debug,
    Clone,
    Copy,
    Eq,
    PartialEq,
    Hash,
    Display,
    EnumIter,
    EnumString,
    SerializeDisplay,
    DeserializeFromStr,
)]
pub enum JobStatus {
    #[strum(to_string = "pending")]
    Pending,
    #[strum(to_string = "processing")]
    Processing,
    #[strum(to_string = "completed")]
    Completed,
    #[strum(to_string = "failed")]
    Failed,
    #[strum(to_string = "cancelled")]
    Cancelled,
}

/// One persistent operation row.
#[derive(Debug, Clone, Serialize)]
pub struct OperationJob {
    pub job_id: String,
    pub device_id: String,
    pub device_kind: DeviceKind,
    pub operation: String,
    pub params: Value,
    pub status: JobStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub retry_count: u32,
}

/// Aggregated queue counters.
#[derive(Debug, Clone, Serialize)]
pub struct QueueSummary {
    pub counts: BTreeMap<String, u64>,
    pub total: u64,
    /// Mean `completed_at - started_at` across completed jobs, when any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_completion_ms: Option<f64>,
}

const SCHEMA: &str = "\
CREATE TABLE IF NOT EXISTS queue_jobs (
    id TEXT PRIMARY KEY,
    device_id TEXT NOT NULL,
    device_kind TEXT NOT NULL,
    operation TEXT NOT NULL,
    params TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT,
    error TEXT,
    retry_count INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_queue_jobs_device_id ON queue_jobs(device_id);
CREATE INDEX IF NOT EXISTS idx_queue_jobs_status ON queue_jobs(status);
CREATE INDEX IF NOT EXISTS idx_queue_jobs_created_at ON queue_jobs(created_at);
";

/// SQLite-backed job store. The schema is created on first open; rows
/// survive process restarts.
pub struct JobStore {
    conn: Mutex<Connection>,
}

impl JobStore {
    /// Opens (or creates) the store at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be opened or the schema cannot
    /// be created.
    pub fn open(path: &Path) -> Result<Self, QueueError> {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(path).map_err(|source| QueueError::Open {
            path: path.display().to_string(),
            source,
        })?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Opens a throwaway in-memory store.
    ///
    /// # Errors
    ///
    /// Returns an error when the schema cannot be created.
    pub fn open_in_memory() -> Result<Self, QueueError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Inserts a new pending job and returns the stored row.
    ///
    /// # Errors
    ///
    /// Returns an error when the insert fails.
    pub fn enqueue(
        &self,
        device_id: &str,
        device_kind: DeviceKind,
        operation: &str,
        params: &Value,
    ) -> Result<OperationJob, QueueError> {
        let job_id = format!("job_{}", Uuid::new_v4());
        let created_at = OffsetDateTime::now_utc();
        let conn = self.conn.lock().expect("job store lock poisoned");
        conn.execute(
            "INSERT INTO queue_jobs (id, device_id, device_kind, operation, params, status, created_at, retry_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0)",
            params![
                job_id,
                device_id,
                device_kind.to_string(),
                operation,
                params.to_string(),
                JobStatus::Pending.to_string(),
                format_timestamp(created_at),
            ],
        )?;
        drop(conn);
        self.get(&job_id)?.ok_or(QueueError::JobNotFound { job_id })
    }

    /// Atomically claims the oldest pending job not in `exclude`, marking it
    /// processing and stamping `started_at`.
    ///
    /// # Errors
    ///
    /// Returns an error when the store fails.
    pub fn claim_oldest_pending(
        &self,
        exclude: &[String],
    ) -> Result<Option<OperationJob>, QueueError> {
        let conn = self.conn.lock().expect("job store lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT id FROM queue_jobs WHERE status = 'pending' ORDER BY created_at, rowid",
        )?;
        let pending: Vec<String> = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<_, _>>()?;
        drop(stmt);

        let Some(job_id) = pending.into_iter().find(|id| !exclude.contains(id)) else {
            return Ok(None);
        };

        let updated = conn.execute(
            "UPDATE queue_jobs SET status = 'processing', started_at = ?2 WHERE id = ?1 AND status = 'pending'",
            params![job_id, format_timestamp(OffsetDateTime::now_utc())],
        )?;
        drop(conn);
        if updated == 0 {
            return Ok(None);
        }
        self.get(&job_id)
    }

    /// Marks a processing job completed.
    ///
    /// # Errors
    ///
    /// Returns an error when the store fails.
    pub fn mark_completed(&self, job_id: &str) -> Result<(), QueueError> {
        let conn = self.conn.lock().expect("job store lock poisoned");
        conn.execute(
            "UPDATE queue_jobs SET status = 'completed', completed_at = ?2, error = NULL
             WHERE id = ?1 AND status = 'processing'",
            params![job_id, format_timestamp(OffsetDateTime::now_utc())],
        )?;
        Ok(())
    }

    /// Returns a failed attempt to pending for a later retry.
    ///
    /// # Errors
    ///
    /// Returns an error when the store fails.
    pub fn mark_retry(&self, job_id: &str, error: &str) -> Result<(), QueueError> {
        let conn = self.conn.lock().expect("job store lock poisoned");
        conn.execute(
            "UPDATE queue_jobs SET status = 'pending', retry_count = retry_count + 1, error = ?2
             WHERE id = ?1 AND status = 'processing'",
            params![job_id, error],
        )?;
        Ok(())
    }

    /// Marks a processing job terminally failed.
    ///
    /// # Errors
    ///
    /// Returns an error when the store fails.
    pub fn mark_failed(&self, job_id: &str, error: &str) -> Result<(), QueueError> {
        let conn = self.conn.lock().expect("job store lock poisoned");
        conn.execute(
            "UPDATE queue_jobs SET status = 'failed', completed_at = ?2, error = ?3
             WHERE id = ?1 AND status = 'processing'",
            params![job_id, format_timestamp(OffsetDateTime::now_utc()), error],
        )?;
        Ok(())
    }

    /// Cancels a pending or processing job. Returns whether the transition
    /// applied; cancelling a terminal job is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error when the store fails.
    pub fn cancel(&self, job_id: &str) -> Result<bool, QueueError> {
        let conn = self.conn.lock().expect("job store lock poisoned");
        let updated = conn.execute(
            "UPDATE queue_jobs SET status = 'cancelled', completed_at = ?2
             WHERE id = ?1 AND status IN ('pending', 'processing')",
            params![job_id, format_timestamp(OffsetDateTime::now_utc())],
        )?;
        Ok(updated > 0)
    }

    /// Returns a failed or cancelled job to pending, counting the retry.
    ///
    /// # Errors
    ///
    /// Returns an error when the store fails.
    pub fn retry(&self, job_id: &str) -> Result<bool, QueueError> {
        let conn = self.conn.lock().expect("job store lock poisoned");
        let updated = conn.execute(
            "UPDATE queue_jobs SET status = 'pending', retry_count = retry_count + 1,
                 started_at = NULL, completed_at = NULL, error = NULL
             WHERE id = ?1 AND status IN ('failed', 'cancelled')",
            params![job_id],
        )?;
        Ok(updated > 0)
    }

    /// Fetches one job.
    ///
    /// # Errors
    ///
    /// Returns an error when the store fails.
    pub fn get(&self, job_id: &str) -> Result<Option<OperationJob>, QueueError> {
        let conn = self.conn.lock().expect("job store lock poisoned");
        let job = conn
            .query_row(
                "SELECT id, device_id, device_kind, operation, params, status,
                        created_at, started_at, completed_at, error, retry_count
                 FROM queue_jobs WHERE id = ?1",
                params![job_id],
                row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    /// Lists jobs newest-first, optionally filtered.
    ///
    /// # Errors
    ///
    /// Returns an error when the store fails.
    pub fn list(
        &self,
        device_id: Option<&str>,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<OperationJob>, QueueError> {
        let conn = self.conn.lock().expect("job store lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT id, device_id, device_kind, operation, params, status,
                    created_at, started_at, completed_at, error, retry_count
             FROM queue_jobs
             WHERE (?1 IS NULL OR device_id = ?1)
               AND (?2 IS NULL OR status = ?2)
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(
            params![
                device_id,
                status.map(|status| status.to_string()),
                limit as i64,
            ],
            row_to_job,
        )?;
        let jobs = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    /// Aggregates per-status counts and the mean completion duration.
    ///
    /// # Errors
    ///
    /// Returns an error when the store fails.
    pub fn summary(&self) -> Result<QueueSummary, QueueError> {
        let conn = self.conn.lock().expect("job store lock poisoned");
        let mut counts = BTreeMap::new();
        let mut total = 0_u64;
        {
            let mut stmt =
                conn.prepare("SELECT status, COUNT(*) FROM queue_jobs GROUP BY status")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (status, count) = row?;
                total += count as u64;
                counts.insert(status, count as u64);
            }
        }

        let average_completion_ms: Option<f64> = conn.query_row(
            "SELECT AVG((julianday(completed_at) - julianday(started_at)) * 86400000.0)
             FROM queue_jobs WHERE status = 'completed'",
            [],
            |row| row.get(0),
        )?;

        Ok(QueueSummary {
            counts,
            total,
            average_completion_ms,
        })
    }
}

fn format_timestamp(timestamp: OffsetDateTime) -> String {
    timestamp
        .format(&Rfc3339)
        .expect("UTC timestamps always format as RFC 3339")
}

fn parse_timestamp(index: usize, raw: String) -> Result<OffsetDateTime, rusqlite::Error> {
    OffsetDateTime::parse(&raw, &Rfc3339).map_err(|error| {
        rusqlite::Error::FromSqlConversionFailure(
            index,
            rusqlite::types::Type::Text,
            Box::new(error),
        )
    })
}

fn row_to_job(row: &Row<'_>) -> Result<OperationJob, rusqlite::Error> {
    let device_kind_raw: String = row.get(2)?;
    let device_kind = device_kind_raw.parse().map_err(|error| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(error))
    })?;
    let params_raw: String = row.get(4)?;
    let params = serde_json::from_str(&params_raw).unwrap_or(Value::Null);
    let status_raw: String = row.get(5)?;
    let status = status_raw.parse().map_err(|error| {
        rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(error))
    })?;

    let created_at = parse_timestamp(6, row.get(6)?)?;
    let started_at = row
        .get::<_, Option<String>>(7)?
        .map(|raw| parse_timestamp(7, raw))
        .transpose()?;
    let completed_at = row
        .get::<_, Option<String>>(8)?
        .map(|raw| parse_timestamp(8, raw))
        .transpose()?;

    Ok(OperationJob {
        job_id: row.get(0)?,
        device_id: row.get(1)?,
        device_kind,
        operation: row.get(3)?,
        params,
        status,
        created_at,
        started_at,
        completed_at,
        error: row.get(9)?,
        retry_count: row.get::<_, i64>(10)? as u32,
    })
}
