//! Row types for the job store.

use std::fmt;

use serde::Deserialize;
use sqlx::FromRow;

use crate::error::{Error, Result};
use crate::util;

/// Default priority assigned when an enqueue spec omits one. Smaller values
/// dispatch first.
pub const DEFAULT_PRIORITY: i64 = 100;

/// Lifecycle state of a job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, sqlx::Type, clap::ValueEnum)]
#[sqlx(rename_all = "lowercase")]
pub enum JobState {
    /// Eligible for claiming once `next_run_at` has passed.
    Pending,
    /// Held by a worker.
    Processing,
    /// Finished successfully. Terminal.
    Completed,
    /// Failed, waiting out its backoff before reactivation.
    Failed,
    /// Exhausted its retries; parked in the dead letter queue.
    Dead,
}

impl JobState {
    /// Every state, in display order.
    pub const ALL: [JobState; 5] = [
        JobState::Pending,
        JobState::Processing,
        JobState::Completed,
        JobState::Failed,
        JobState::Dead,
    ];

    /// The lowercase form stored in the database.
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Dead => "dead",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a single execution attempt ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
pub enum RunOutcome {
    /// Exit code zero.
    Success,
    /// Non-zero exit code, or the command could not be spawned.
    Failure,
    /// The wall-clock limit elapsed and the process tree was killed.
    Timeout,
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunOutcome::Success => "success",
            RunOutcome::Failure => "failure",
            RunOutcome::Timeout => "timeout",
        })
    }
}

/// A persistent job record.
///
/// Timestamps are stored as ISO-8601 UTC text with second resolution; see
/// [`crate::now_ts`] for the canonical format.
#[derive(Debug, Clone, FromRow)]
pub struct Job {
    /// Externally supplied unique id.
    pub id: String,
    /// Shell command line to execute.
    pub command: String,
    /// Current lifecycle state.
    pub state: JobState,
    /// Number of finished execution attempts.
    pub attempts: i64,
    /// Retry ceiling; a failed attempt beyond it moves the job to `dead`.
    pub max_retries: i64,
    /// Dispatch priority; smaller runs first.
    pub priority: i64,
    /// Optional per-job wall-clock limit in seconds.
    pub timeout_secs: Option<i64>,
    /// Initial schedule time, if the job was deferred at enqueue.
    pub run_at: Option<String>,
    /// Earliest time the job is eligible to start.
    pub next_run_at: String,
    /// Worker currently holding the job; set only while `processing`.
    pub worker_name: Option<String>,
    /// Creation timestamp.
    pub created_at: String,
    /// Last mutation timestamp.
    pub updated_at: String,
    /// Short diagnostic from the most recent failure.
    pub last_error: Option<String>,
}

/// Append-only record of one execution attempt.
#[derive(Debug, Clone, FromRow)]
pub struct JobRun {
    /// Id of the job this attempt belongs to.
    pub job_id: String,
    /// 1-based attempt number.
    pub attempt: i64,
    /// When the command was spawned.
    pub started_at: String,
    /// When the command finished or was killed.
    pub finished_at: String,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: i64,
    /// Exit code; absent when the command never spawned.
    pub exit_code: Option<i64>,
    /// Bytes captured to the stdout log.
    pub stdout_bytes: i64,
    /// Bytes captured to the stderr log.
    pub stderr_bytes: i64,
    /// Worker that ran the attempt.
    pub worker_name: String,
    /// How the attempt ended.
    pub outcome: RunOutcome,
}

/// Aggregate view over the whole queue.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Stats {
    /// Jobs in `pending`.
    pub pending: i64,
    /// Jobs in `processing`.
    pub processing: i64,
    /// Jobs in `completed`.
    pub completed: i64,
    /// Jobs in `failed`.
    pub failed: i64,
    /// Jobs in `dead`.
    pub dead: i64,
    /// Total job rows.
    pub total_jobs: i64,
    /// Total recorded execution attempts.
    pub total_runs: i64,
}

/// Fields a client supplies when enqueueing a job.
///
/// Everything but `id` and `command` is optional; omitted fields fall back
/// to the configured defaults at insert time.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobSpec {
    /// Unique job id.
    pub id: String,
    /// Shell command line.
    pub command: String,
    /// Dispatch priority; defaults to [`DEFAULT_PRIORITY`].
    #[serde(default)]
    pub priority: Option<i64>,
    /// Retry ceiling; defaults to the `max_retries` config value.
    #[serde(default)]
    pub max_retries: Option<i64>,
    /// Per-job wall-clock limit in seconds.
    #[serde(default)]
    pub timeout_secs: Option<i64>,
    /// Earliest start time, RFC 3339.
    #[serde(default)]
    pub run_at: Option<String>,
}

impl JobSpec {
    /// Checks field constraints and canonicalises `run_at` into the storage
    /// timestamp format.
    pub(crate) fn validate(mut self) -> Result<Self> {
        if self.id.trim().is_empty() {
            return Err(Error::InvalidInput("job id must not be empty".into()));
        }
        if self.command.trim().is_empty() {
            return Err(Error::InvalidInput("job command must not be empty".into()));
        }
        if self.max_retries.is_some_and(|n| n < 0) {
            return Err(Error::InvalidInput("max_retries must be >= 0".into()));
        }
        if self.timeout_secs.is_some_and(|n| n <= 0) {
            return Err(Error::InvalidInput("timeout_secs must be > 0".into()));
        }
        if let Some(run_at) = &self.run_at {
            self.run_at = Some(util::format_ts(util::parse_ts(run_at)?));
        }
        Ok(self)
    }
}
