// src/store.rs
//
// =============================================================================
// CRUCIBLE: JOB STORE
// =============================================================================
//
// The persistence layer.
//
// Architecture:
// - SQLite, one local database file for jobs and API keys.
// - High-traffic fields are columns; args / input_files are JSON text.
// - Booleans stored as 0/1 integers, timestamps as unix milliseconds.
// - Transitions guarded in SQL: the WHERE clause on status makes every
//   write linearizable per job id, so exactly one finalize wins.

use crate::core::{
    InputFile, Job, JobOutcome, JobSeed, JobStatus, JobSummary, ServiceStats,
};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use uuid::Uuid;

// -----------------------------------------------------------------------------
// Errors
// -----------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("job not found")]
    NotFound,

    #[error("invalid status transition for job {id}: record is already {status}")]
    InvalidTransition { id: Uuid, status: String },
}

pub type StoreResult<T> = Result<T, StoreError>;

// -----------------------------------------------------------------------------
// JobStore
// -----------------------------------------------------------------------------

pub struct JobStore {
    path: PathBuf,
}

impl JobStore {
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let store = Self {
            path: path.as_ref().to_path_buf(),
        };
        store.init()?;
        Ok(store)
    }

    /// Initialize the schema if it doesn't exist.
    fn init(&self) -> StoreResult<()> {
        let conn = self.conn()?;

        conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS jobs (
                id              TEXT PRIMARY KEY,
                owner           TEXT NOT NULL,
                status          TEXT NOT NULL,
                source          TEXT NOT NULL,
                args            TEXT NOT NULL,
                input_files     TEXT NOT NULL,
                sandbox_id      TEXT,
                stdout          BLOB NOT NULL DEFAULT x'',
                stderr          BLOB NOT NULL DEFAULT x'',
                crashed         INTEGER NOT NULL DEFAULT 0,
                timed_out       INTEGER NOT NULL DEFAULT 0,
                peak_memory_mb  REAL NOT NULL DEFAULT 0,
                peak_cpu_pct    REAL NOT NULL DEFAULT 0,
                execution_ms    INTEGER NOT NULL DEFAULT 0,
                created_at      INTEGER NOT NULL,
                started_at      INTEGER,
                completed_at    INTEGER
            );

            CREATE TABLE IF NOT EXISTS api_keys (
                key         TEXT PRIMARY KEY,
                created_at  INTEGER NOT NULL,
                description TEXT NOT NULL DEFAULT ''
            );

            -- Tenant-scoped listing is always owner + newest-first
            CREATE INDEX IF NOT EXISTS idx_jobs_owner_created
                ON jobs(owner, created_at DESC);
            CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
            COMMIT;",
        )?;

        Ok(())
    }

    fn conn(&self) -> StoreResult<Connection> {
        let conn = Connection::open(&self.path)?;
        // Readers (HTTP) and writers (supervisors) share the file.
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout=10000;",
        )?;
        Ok(conn)
    }

    // -------------------------------------------------------------------------
    // WRITE API (Supervisor)
    // -------------------------------------------------------------------------

    /// Insert a fresh job in `not_started`. Returns its id.
    pub fn create(&self, seed: &JobSeed) -> StoreResult<Uuid> {
        let id = Uuid::new_v4();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO jobs (id, owner, status, source, args, input_files, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id.to_string(),
                seed.owner,
                JobStatus::NotStarted.as_str(),
                seed.source,
                serde_json::to_string(&seed.args)?,
                serde_json::to_string(&seed.input_files)?,
                Utc::now().timestamp_millis(),
            ],
        )?;
        Ok(id)
    }

    /// `not_started -> running`, stamping `started_at`. A second call while
    /// already `running` is a no-op success; a call after `done` is refused.
    pub fn mark_running(&self, id: Uuid) -> StoreResult<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE jobs SET status = ?2, started_at = ?3
             WHERE id = ?1 AND status = ?4",
            params![
                id.to_string(),
                JobStatus::Running.as_str(),
                Utc::now().timestamp_millis(),
                JobStatus::NotStarted.as_str(),
            ],
        )?;
        if changed == 1 {
            return Ok(());
        }
        match self.status_of(&conn, id)? {
            JobStatus::Running => Ok(()),
            status => Err(StoreError::InvalidTransition {
                id,
                status: status.as_str().into(),
            }),
        }
    }

    pub fn attach_sandbox(&self, id: Uuid, sandbox_id: &str) -> StoreResult<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE jobs SET sandbox_id = ?2 WHERE id = ?1",
            params![id.to_string(), sandbox_id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Atomic terminal write: every outcome field plus `status='done'` and
    /// `completed_at` land in one UPDATE. The status guard serializes
    /// concurrent attempts; the loser gets `InvalidTransition`.
    pub fn finalize(&self, id: Uuid, outcome: &JobOutcome) -> StoreResult<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE jobs SET
                status = ?2, stdout = ?3, stderr = ?4,
                crashed = ?5, timed_out = ?6,
                peak_memory_mb = ?7, peak_cpu_pct = ?8,
                execution_ms = ?9, completed_at = ?10
             WHERE id = ?1 AND status != ?2",
            params![
                id.to_string(),
                JobStatus::Done.as_str(),
                outcome.stdout,
                outcome.stderr,
                outcome.crashed as i64,
                outcome.timed_out as i64,
                outcome.peak_memory_mb,
                outcome.peak_cpu_pct,
                outcome.execution_ms as i64,
                Utc::now().timestamp_millis(),
            ],
        )?;
        if changed == 1 {
            return Ok(());
        }
        let status = self.status_of(&conn, id)?;
        Err(StoreError::InvalidTransition {
            id,
            status: status.as_str().into(),
        })
    }

    // -------------------------------------------------------------------------
    // READ API (HTTP adapter, supervisor hydration, sweeper)
    // -------------------------------------------------------------------------

    /// Fetch one job. With `owner` set, a record belonging to someone else
    /// is reported as absent rather than forbidden.
    pub fn get(&self, id: Uuid, owner: Option<&str>) -> StoreResult<Job> {
        let conn = self.conn()?;
        let job = conn
            .query_row(
                "SELECT id, owner, status, source, args, input_files, sandbox_id,
                        stdout, stderr, crashed, timed_out,
                        peak_memory_mb, peak_cpu_pct, execution_ms,
                        created_at, started_at, completed_at
                 FROM jobs WHERE id = ?1",
                params![id.to_string()],
                row_to_job,
            )
            .optional()?
            .ok_or(StoreError::NotFound)?;

        match owner {
            Some(o) if o != job.owner => Err(StoreError::NotFound),
            _ => Ok(job),
        }
    }

    /// Tenant listing, newest-first.
    pub fn list(&self, owner: &str, limit: u32, offset: u32) -> StoreResult<Vec<JobSummary>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, status, created_at, completed_at, crashed, timed_out
             FROM jobs WHERE owner = ?1
             ORDER BY created_at DESC
             LIMIT ?2 OFFSET ?3",
        )?;

        let rows = stmt.query_map(params![owner, limit, offset], |row| {
            let id: String = row.get(0)?;
            let status: String = row.get(1)?;
            let created: i64 = row.get(2)?;
            let completed: Option<i64> = row.get(3)?;
            let crashed: bool = row.get(4)?;
            let timed_out: bool = row.get(5)?;
            Ok((id, status, created, completed, crashed, timed_out))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (id, status, created, completed, crashed, timed_out) = row?;
            let status = JobStatus::parse(&status).unwrap_or(JobStatus::Done);
            let done = status == JobStatus::Done;
            out.push(JobSummary {
                id: Uuid::parse_str(&id).unwrap_or_default(),
                status,
                created_at: ms_to_utc(created),
                completed_at: completed.map(ms_to_utc),
                crashed: done.then_some(crashed),
                timed_out: done.then_some(timed_out),
            });
        }
        Ok(out)
    }

    /// Ids of every job currently `running`; the sweeper reconciles these.
    pub fn running_jobs(&self) -> StoreResult<Vec<Uuid>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id FROM jobs WHERE status = ?1")?;
        let rows = stmt.query_map(params![JobStatus::Running.as_str()], |row| {
            row.get::<_, String>(0)
        })?;
        let mut out = Vec::new();
        for row in rows {
            if let Ok(id) = Uuid::parse_str(&row?) {
                out.push(id);
            }
        }
        Ok(out)
    }

    fn status_of(&self, conn: &Connection, id: Uuid) -> StoreResult<JobStatus> {
        let status: String = conn
            .query_row(
                "SELECT status FROM jobs WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?
            .ok_or(StoreError::NotFound)?;
        JobStatus::parse(&status).ok_or(StoreError::NotFound)
    }

    // -------------------------------------------------------------------------
    // API KEYS (auth layer + admin CLI)
    // -------------------------------------------------------------------------

    pub fn add_key(&self, key: &str, description: &str) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO api_keys (key, created_at, description)
             VALUES (?1, ?2, ?3)",
            params![key, Utc::now().timestamp_millis(), description],
        )?;
        Ok(())
    }

    pub fn key_exists(&self, key: &str) -> StoreResult<bool> {
        let conn = self.conn()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM api_keys WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Returns false when the key was not present.
    pub fn revoke_key(&self, key: &str) -> StoreResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute("DELETE FROM api_keys WHERE key = ?1", params![key])?;
        Ok(changed == 1)
    }

    pub fn list_keys(&self) -> StoreResult<Vec<(String, DateTime<Utc>, String)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT key, created_at, description FROM api_keys ORDER BY created_at",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (key, ms, desc) = row?;
            out.push((key, ms_to_utc(ms), desc));
        }
        Ok(out)
    }

    // -------------------------------------------------------------------------
    // STATS (admin CLI)
    // -------------------------------------------------------------------------

    pub fn stats(&self) -> StoreResult<ServiceStats> {
        let conn = self.conn()?;
        let (total, not_started, running, done, crashed, timed_out) = conn.query_row(
            "SELECT COUNT(*),
                    SUM(status = 'not_started'),
                    SUM(status = 'running'),
                    SUM(status = 'done'),
                    SUM(crashed),
                    SUM(timed_out)
             FROM jobs",
            [],
            |row| {
                Ok((
                    row.get::<_, i64>(0)? as u64,
                    row.get::<_, Option<i64>>(1)?.unwrap_or(0) as u64,
                    row.get::<_, Option<i64>>(2)?.unwrap_or(0) as u64,
                    row.get::<_, Option<i64>>(3)?.unwrap_or(0) as u64,
                    row.get::<_, Option<i64>>(4)?.unwrap_or(0) as u64,
                    row.get::<_, Option<i64>>(5)?.unwrap_or(0) as u64,
                ))
            },
        )?;
        let api_keys: u64 =
            conn.query_row("SELECT COUNT(*) FROM api_keys", [], |row| row.get::<_, i64>(0))? as u64;
        Ok(ServiceStats {
            total_jobs: total,
            not_started,
            running,
            done,
            crashed,
            timed_out,
            api_keys,
        })
    }
}

// -----------------------------------------------------------------------------
// Row mapping
// -----------------------------------------------------------------------------

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<Job> {
    let id: String = row.get(0)?;
    let status: String = row.get(2)?;
    let args: String = row.get(4)?;
    let input_files: String = row.get(5)?;

    Ok(Job {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        owner: row.get(1)?,
        status: JobStatus::parse(&status).unwrap_or(JobStatus::Done),
        source: row.get(3)?,
        args: serde_json::from_str(&args).unwrap_or_default(),
        input_files: serde_json::from_str::<Vec<InputFile>>(&input_files).unwrap_or_default(),
        sandbox_id: row.get(6)?,
        stdout: row.get(7)?,
        stderr: row.get(8)?,
        crashed: row.get(9)?,
        timed_out: row.get(10)?,
        peak_memory_mb: row.get(11)?,
        peak_cpu_pct: row.get(12)?,
        execution_ms: row.get::<_, i64>(13)? as u64,
        created_at: ms_to_utc(row.get(14)?),
        started_at: row.get::<_, Option<i64>>(15)?.map(ms_to_utc),
        completed_at: row.get::<_, Option<i64>>(16)?.map(ms_to_utc),
    })
}

fn ms_to_utc(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

// ============================================================================
// TESTS
// ============================================================================
