//! The worker execution loop: claim, run, report.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::process::Command;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::schema::{Job, JobRun, RunOutcome};
use crate::storage::Store;
use crate::util;

const DEFAULT_JITTER: Duration = Duration::from_millis(100);

/// How many times an outcome report is retried on storage errors before the
/// worker logs and moves on. Losing a run record is preferable to losing
/// forward progress.
const REPORT_ATTEMPTS: u32 = 3;

/// A single long-lived execution unit.
///
/// Within a worker everything is straight-line sequential: claim a job, run
/// its command with the streams captured to log files, report the outcome.
/// Concurrency comes from running several workers, each its own OS process.
pub struct Worker {
    store: Store,
    settings: Settings,
    name: String,
    jitter: Duration,
}

/// The result of one executed attempt, ready to report.
struct Attempt {
    run: JobRun,
    /// Diagnostic for the job's `last_error`; `None` means success.
    error: Option<String>,
}

enum CommandStatus {
    Exited(i64),
    TimedOut,
    SpawnFailed(std::io::Error),
}

impl Worker {
    /// Creates a worker bound to a store with a settings snapshot.
    pub fn new(store: Store, settings: Settings, name: impl Into<String>) -> Self {
        Worker {
            store,
            settings,
            name: name.into(),
            jitter: DEFAULT_JITTER,
        }
    }

    /// Conventional worker name: `worker-<index>-<pid>`.
    pub fn default_name(index: usize) -> String {
        format!("worker-{index}-{}", std::process::id())
    }

    /// Runs until `shutdown` is cancelled.
    ///
    /// Cancellation is only observed between attempts: an in-flight job
    /// always finishes and reports before the loop exits.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(worker.name = %self.name, "worker started");
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            match self.run_next().await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    let pause = self.sleep_duration_with_jitter();
                    trace!("queue empty, polling again in {pause:?}");
                    tokio::select! {
                        () = sleep(pause) => {}
                        () = shutdown.cancelled() => break,
                    }
                }
                Err(err) => {
                    error!(%err, "failed to claim next job");
                    tokio::select! {
                        () = sleep(self.sleep_duration_with_jitter()) => {}
                        () = shutdown.cancelled() => break,
                    }
                }
            }
        }
        info!(worker.name = %self.name, "worker stopped");
    }

    /// Claims and runs a single job.
    ///
    /// Returns `Ok(Some(job_id))` when an attempt was executed and
    /// `Ok(None)` when nothing was eligible.
    pub async fn run_next(&self) -> Result<Option<String>> {
        let Some(job) = self.store.claim_next(&self.name, &util::now_ts()).await? else {
            return Ok(None);
        };

        let span = info_span!("job", job.id = %job.id, worker.name = %self.name);
        let attempt = self.execute(&job).instrument(span.clone()).await;
        self.report(&job, &attempt).instrument(span).await;
        Ok(Some(job.id))
    }

    /// Spawns the job's command through the platform shell and waits for it,
    /// bounded by the job's timeout.
    async fn execute(&self, job: &Job) -> Attempt {
        let limit = job
            .timeout_secs
            .map(|secs| Duration::from_secs(secs as u64))
            .unwrap_or(self.settings.default_timeout);
        let (stdout_path, stderr_path) = self.store.log_paths_for(&job.id);

        debug!(command = %job.command, timeout_secs = limit.as_secs(), "running command");
        let started = util::now_ts();
        let begin = Instant::now();
        let status = run_command(&job.command, &stdout_path, &stderr_path, limit).await;
        let finished = util::now_ts();
        let duration_ms = begin.elapsed().as_millis() as i64;

        let (exit_code, outcome, error) = match status {
            CommandStatus::Exited(0) => (Some(0), RunOutcome::Success, None),
            CommandStatus::Exited(code) => {
                (Some(code), RunOutcome::Failure, Some(format!("exit:{code}")))
            }
            CommandStatus::TimedOut => {
                let message = format!("timeout after {}s", limit.as_secs());
                warn!(job.id = %job.id, "{message}");
                append_line(&stderr_path, &message);
                // 124 is the conventional timeout exit code.
                (Some(124), RunOutcome::Timeout, Some(message))
            }
            CommandStatus::SpawnFailed(err) => {
                let message = format!("spawn: {err}");
                error!(job.id = %job.id, "{message}");
                append_line(&stderr_path, &message);
                (None, RunOutcome::Failure, Some(message))
            }
        };

        Attempt {
            run: JobRun {
                job_id: job.id.clone(),
                attempt: job.attempts + 1,
                started_at: started,
                finished_at: finished,
                duration_ms,
                exit_code,
                stdout_bytes: file_len(&stdout_path),
                stderr_bytes: file_len(&stderr_path),
                worker_name: self.name.clone(),
                outcome,
            },
            error,
        }
    }

    /// Reports the attempt back to the store, retrying transient storage
    /// failures a bounded number of times.
    async fn report(&self, job: &Job, attempt: &Attempt) {
        let mut delay = Duration::from_millis(100);
        for round in 0..REPORT_ATTEMPTS {
            let result = match &attempt.error {
                None => self.store.complete(&job.id, &attempt.run).await,
                Some(message) => self
                    .store
                    .reschedule_or_dead(&job.id, &attempt.run, message, &self.settings)
                    .await
                    .map(|_| ()),
            };
            match result {
                Ok(()) => return,
                Err(Error::Storage(err)) if round + 1 < REPORT_ATTEMPTS => {
                    warn!(%err, "storage error while reporting outcome, retrying");
                    sleep(delay).await;
                    delay *= 2;
                }
                Err(err) => {
                    error!(%err, job.id = %job.id, "giving up on reporting job outcome");
                    return;
                }
            }
        }
    }

    /// Poll pause with random jitter, to keep a pool of workers from hitting
    /// the store in lockstep.
    fn sleep_duration_with_jitter(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.settings.poll_interval;
        }
        let jitter_millis = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let random_jitter = rand::thread_rng().gen_range(0..=jitter_millis);
        self.settings.poll_interval + Duration::from_millis(random_jitter)
    }
}

/// Runs `command` via `sh -c` with stdout/stderr truncated into the given
/// log files. On timeout the whole process group is killed.
async fn run_command(
    command: &str,
    stdout_path: &Path,
    stderr_path: &Path,
    limit: Duration,
) -> CommandStatus {
    let stdout = match std::fs::File::create(stdout_path) {
        Ok(file) => file,
        Err(err) => return CommandStatus::SpawnFailed(err),
    };
    let stderr = match std::fs::File::create(stderr_path) {
        Ok(file) => file,
        Err(err) => return CommandStatus::SpawnFailed(err),
    };

    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr));
    // Own process group, so a timeout can take out the job's descendants
    // along with the shell.
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => return CommandStatus::SpawnFailed(err),
    };

    match tokio::time::timeout(limit, child.wait()).await {
        Ok(Ok(status)) => CommandStatus::Exited(status.code().map_or(-1, i64::from)),
        Ok(Err(err)) => CommandStatus::SpawnFailed(err),
        Err(_elapsed) => {
            kill_tree(&mut child).await;
            CommandStatus::TimedOut
        }
    }
}

async fn kill_tree(child: &mut tokio::process::Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // Negative pid signals the whole process group.
        unsafe { libc::kill(-(pid as i32), libc::SIGKILL) };
    }
    let _ = child.start_kill();
    let _ = child.wait().await;
}

fn file_len(path: &Path) -> i64 {
    std::fs::metadata(path).map_or(0, |meta| meta.len() as i64)
}

fn append_line(path: &Path, line: &str) {
    use std::io::Write;
    if let Ok(mut file) = std::fs::OpenOptions::new().append(true).create(true).open(path) {
        let _ = writeln!(file, "{line}");
    }
}
