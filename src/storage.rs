//! Durable persistence for jobs, runs and configuration.
//!
//! All state transitions flow through [`Store`]; workers never touch job
//! rows directly. The backing engine is SQLite in WAL mode, which serialises
//! writers internally — the claim statement below relies on that to hand
//! every job to exactly one worker.

use std::path::{Path, PathBuf};
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::debug;

use crate::config::{Config, Settings};
use crate::error::{Error, Result};
use crate::schema::{Job, JobRun, JobSpec, JobState, Stats, DEFAULT_PRIORITY};
use crate::util;

const DB_FILE: &str = "queuectl.db";
const LOGS_DIR: &str = "logs";
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY,
    command TEXT NOT NULL,
    state TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    max_retries INTEGER NOT NULL DEFAULT 3,
    priority INTEGER NOT NULL DEFAULT 100,
    timeout_secs INTEGER,
    run_at TEXT,
    next_run_at TEXT NOT NULL,
    worker_name TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    last_error TEXT
);

CREATE INDEX IF NOT EXISTS idx_jobs_state_priority_created
ON jobs(state, priority, created_at);

CREATE TABLE IF NOT EXISTS job_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id TEXT NOT NULL,
    attempt INTEGER NOT NULL,
    started_at TEXT NOT NULL,
    finished_at TEXT NOT NULL,
    duration_ms INTEGER NOT NULL,
    exit_code INTEGER,
    stdout_bytes INTEGER NOT NULL,
    stderr_bytes INTEGER NOT NULL,
    worker_name TEXT NOT NULL,
    outcome TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS config (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

const RUN_COLUMNS: &str = "job_id, attempt, started_at, finished_at, duration_ms, \
                           exit_code, stdout_bytes, stderr_bytes, worker_name, outcome";

/// Handle to the on-disk queue state rooted at a data directory.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    data_dir: PathBuf,
}

impl Store {
    /// Opens (creating if necessary) the database under `data_dir` and
    /// ensures the schema and the logs directory exist.
    pub async fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(data_dir.join(LOGS_DIR))?;

        let options = SqliteConnectOptions::new()
            .filename(data_dir.join(DB_FILE))
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        sqlx::raw_sql(SCHEMA).execute(&pool).await?;

        Ok(Store { pool, data_dir })
    }

    /// The directory this store is rooted at.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Typed view over the `config` table, sharing this store's pool.
    pub fn config(&self) -> Config {
        Config::new(self.pool.clone())
    }

    /// Inserts a new job in `pending` state.
    ///
    /// `default_max_retries` is used when the spec omits its own ceiling.
    /// Fails with [`Error::AlreadyExists`] when the id collides.
    pub async fn enqueue(&self, spec: JobSpec, default_max_retries: i64) -> Result<Job> {
        let spec = spec.validate()?;
        let now = util::now_ts();
        let next_run_at = spec.run_at.clone().unwrap_or_else(|| now.clone());

        let job = sqlx::query_as::<_, Job>(
            r"
            INSERT INTO jobs
            (id, command, state, attempts, max_retries, priority, timeout_secs,
             run_at, next_run_at, worker_name, created_at, updated_at, last_error)
            VALUES (?, ?, 'pending', 0, ?, ?, ?, ?, ?, NULL, ?, ?, NULL)
            RETURNING *
            ",
        )
        .bind(&spec.id)
        .bind(&spec.command)
        .bind(spec.max_retries.unwrap_or(default_max_retries))
        .bind(spec.priority.unwrap_or(DEFAULT_PRIORITY))
        .bind(spec.timeout_secs)
        .bind(&spec.run_at)
        .bind(&next_run_at)
        .bind(&now)
        .bind(&now)
        .fetch_one(&self.pool)
        .await
        .map_err(|err| match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Error::AlreadyExists(spec.id.clone())
            }
            _ => err.into(),
        })?;

        debug!(job.id = %job.id, "enqueued job");
        Ok(job)
    }

    /// Fetches a job by id, failing with [`Error::NotFound`] when absent.
    pub async fn get(&self, id: &str) -> Result<Job> {
        sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    /// Lists jobs, optionally filtered by state.
    ///
    /// Filtered listings use dispatch order (priority, then creation time);
    /// unfiltered listings come back in creation order.
    pub async fn list(&self, state: Option<JobState>, limit: Option<i64>) -> Result<Vec<Job>> {
        // LIMIT -1 means unbounded in SQLite.
        let limit = limit.unwrap_or(-1);
        let jobs = match state {
            Some(state) => {
                sqlx::query_as::<_, Job>(
                    r"
                    SELECT * FROM jobs WHERE state = ?
                    ORDER BY priority ASC, created_at ASC, id ASC
                    LIMIT ?
                    ",
                )
                .bind(state)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, Job>(
                    "SELECT * FROM jobs ORDER BY created_at ASC, id ASC LIMIT ?",
                )
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(jobs)
    }

    /// Atomically claims the next eligible pending job for `worker_name`.
    ///
    /// A single conditional update selects the highest-priority pending job
    /// whose `next_run_at` has passed, flips it to `processing` and stamps
    /// the worker, so concurrent callers can never claim the same row.
    /// Returns `None` when nothing is eligible.
    pub async fn claim_next(&self, worker_name: &str, now: &str) -> Result<Option<Job>> {
        let claimed = sqlx::query_as::<_, Job>(
            r"
            UPDATE jobs
            SET state = 'processing', worker_name = ?, updated_at = ?
            WHERE id = (
                SELECT id FROM jobs
                WHERE state = 'pending' AND next_run_at <= ?
                ORDER BY priority ASC, created_at ASC, id ASC
                LIMIT 1
            )
              AND state = 'pending'
            RETURNING *
            ",
        )
        .bind(worker_name)
        .bind(now)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(job) = &claimed {
            debug!(job.id = %job.id, worker.name = %worker_name, "claimed job");
        }
        Ok(claimed)
    }

    /// Finishes a successful attempt: `processing -> completed`, appends the
    /// run record, clears the worker and any previous error.
    pub async fn complete(&self, id: &str, run: &JobRun) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r"
            UPDATE jobs
            SET state = 'completed', attempts = attempts + 1,
                worker_name = NULL, last_error = NULL, updated_at = ?
            WHERE id = ? AND state = 'processing'
            ",
        )
        .bind(util::now_ts())
        .bind(id)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(self.state_conflict(id, "processing").await);
        }

        insert_run(&mut *tx, run).await?;
        tx.commit().await?;

        debug!(job.id = %id, "job completed");
        Ok(())
    }

    /// Finishes a failed or timed-out attempt.
    ///
    /// Increments `attempts` and appends the run record. While the new count
    /// stays within `max_retries` the job parks in `failed` with
    /// `next_run_at = now + backoff_base^(attempts - 1)` seconds; beyond the
    /// ceiling it moves to `dead`.
    pub async fn reschedule_or_dead(
        &self,
        id: &str,
        run: &JobRun,
        last_error: &str,
        cfg: &Settings,
    ) -> Result<Job> {
        let mut tx = self.pool.begin().await?;

        let row: Option<(i64, i64)> = sqlx::query_as(
            "SELECT attempts, max_retries FROM jobs WHERE id = ? AND state = 'processing'",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((attempts, max_retries)) = row else {
            return Err(self.state_conflict(id, "processing").await);
        };

        let attempts = attempts + 1;
        let now = util::now_utc();

        let job = if attempts <= max_retries {
            let next_run_at = util::ts_after(now, cfg.backoff_base.powi((attempts - 1) as i32));
            sqlx::query_as::<_, Job>(
                r"
                UPDATE jobs
                SET state = 'failed', attempts = ?, next_run_at = ?,
                    last_error = ?, worker_name = NULL, updated_at = ?
                WHERE id = ?
                RETURNING *
                ",
            )
            .bind(attempts)
            .bind(&next_run_at)
            .bind(last_error)
            .bind(util::format_ts(now))
            .bind(id)
            .fetch_one(&mut *tx)
            .await?
        } else {
            sqlx::query_as::<_, Job>(
                r"
                UPDATE jobs
                SET state = 'dead', attempts = ?,
                    last_error = ?, worker_name = NULL, updated_at = ?
                WHERE id = ?
                RETURNING *
                ",
            )
            .bind(attempts)
            .bind(last_error)
            .bind(util::format_ts(now))
            .bind(id)
            .fetch_one(&mut *tx)
            .await?
        };

        insert_run(&mut *tx, run).await?;
        tx.commit().await?;

        debug!(job.id = %id, state = %job.state, attempts, "attempt failed");
        Ok(job)
    }

    /// Reactivates every `failed` job whose backoff has elapsed. Returns the
    /// number of rows hoisted back to `pending`. Idempotent for a fixed
    /// `now`.
    pub async fn move_failed_to_pending(&self, now: &str) -> Result<u64> {
        let result = sqlx::query(
            r"
            UPDATE jobs
            SET state = 'pending', updated_at = ?
            WHERE state = 'failed' AND next_run_at <= ?
            ",
        )
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let moved = result.rows_affected();
        if moved > 0 {
            debug!(moved, "reactivated retry-ready jobs");
        }
        Ok(moved)
    }

    /// Explicit attempt-counter bump, for bookkeeping outside the normal
    /// completion paths. Returns the new count.
    pub async fn increment_attempts(&self, id: &str) -> Result<i64> {
        sqlx::query_scalar::<_, i64>(
            "UPDATE jobs SET attempts = attempts + 1, updated_at = ? WHERE id = ? RETURNING attempts",
        )
        .bind(util::now_ts())
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    /// Returns a dead job to `pending` with a clean slate: zero attempts, no
    /// error, eligible immediately. Fails with [`Error::InvalidState`] when
    /// the job is not dead.
    pub async fn retry_from_dlq(&self, id: &str) -> Result<Job> {
        let now = util::now_ts();
        let job = sqlx::query_as::<_, Job>(
            r"
            UPDATE jobs
            SET state = 'pending', attempts = 0, last_error = NULL,
                next_run_at = ?, updated_at = ?
            WHERE id = ? AND state = 'dead'
            RETURNING *
            ",
        )
        .bind(&now)
        .bind(&now)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match job {
            Some(job) => {
                debug!(job.id = %id, "job returned from dead letter queue");
                Ok(job)
            }
            None => Err(self.state_conflict(id, "dead").await),
        }
    }

    /// Aggregate counts for every state (zero-filled) plus totals.
    pub async fn stats(&self) -> Result<Stats> {
        let (pending, processing, completed, failed, dead): (i64, i64, i64, i64, i64) =
            sqlx::query_as(
                r"
                SELECT
                    COALESCE(SUM(CASE WHEN state = 'pending' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN state = 'processing' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN state = 'completed' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN state = 'failed' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN state = 'dead' THEN 1 ELSE 0 END), 0)
                FROM jobs
                ",
            )
            .fetch_one(&self.pool)
            .await?;

        let total_runs = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM job_runs")
            .fetch_one(&self.pool)
            .await?;

        Ok(Stats {
            pending,
            processing,
            completed,
            failed,
            dead,
            total_jobs: pending + processing + completed + failed + dead,
            total_runs,
        })
    }

    /// Appends a run record outside the terminal transitions, for
    /// observability callers.
    pub async fn record_run(&self, run: &JobRun) -> Result<()> {
        insert_run(&self.pool, run).await
    }

    /// The most recent execution attempts across all jobs, newest first.
    pub async fn recent_runs(&self, limit: i64) -> Result<Vec<JobRun>> {
        let runs = sqlx::query_as::<_, JobRun>(&format!(
            "SELECT {RUN_COLUMNS} FROM job_runs ORDER BY id DESC LIMIT ?"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(runs)
    }

    /// All recorded attempts for one job, oldest first.
    pub async fn runs_for(&self, id: &str) -> Result<Vec<JobRun>> {
        let runs = sqlx::query_as::<_, JobRun>(&format!(
            "SELECT {RUN_COLUMNS} FROM job_runs WHERE job_id = ? ORDER BY id ASC"
        ))
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        Ok(runs)
    }

    /// Deterministic log file locations for a job. Does not create the
    /// files.
    pub fn log_paths_for(&self, id: &str) -> (PathBuf, PathBuf) {
        let logs = self.data_dir.join(LOGS_DIR);
        (
            logs.join(format!("{id}.stdout.log")),
            logs.join(format!("{id}.stderr.log")),
        )
    }

    /// Builds the error for a conditional update that matched no row: the
    /// job is either missing or in the wrong state.
    async fn state_conflict(&self, id: &str, expected: &str) -> Error {
        match self.get(id).await {
            Ok(job) => Error::InvalidState(format!(
                "job {id} is {}, expected {expected}",
                job.state
            )),
            Err(err) => err,
        }
    }
}

/// Inserts a [`JobRun`] through any executor, so it can join a transaction
/// or run standalone.
async fn insert_run<'e, E>(executor: E, run: &JobRun) -> Result<()>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    sqlx::query(&format!(
        "INSERT INTO job_runs ({RUN_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
    ))
    .bind(&run.job_id)
    .bind(run.attempt)
    .bind(&run.started_at)
    .bind(&run.finished_at)
    .bind(run.duration_ms)
    .bind(run.exit_code)
    .bind(run.stdout_bytes)
    .bind(run.stderr_bytes)
    .bind(&run.worker_name)
    .bind(run.outcome)
    .execute(executor)
    .await?;
    Ok(())
}
