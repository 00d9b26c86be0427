//! Worker pool lifecycle and periodic store maintenance.
//!
//! Workers are separate OS processes, so one crashing command cannot take
//! down its peers. The supervisor is the foreground of `worker start`: it
//! spawns the pool, records pids, reactivates retry-ready jobs on a fixed
//! cadence, and tears everything down gracefully on SIGINT/SIGTERM.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tokio::process::{Child, Command};
use tokio::time::{interval, sleep};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::shutdown;
use crate::storage::Store;
use crate::util;
use crate::worker::Worker;

const PID_FILE: &str = "workers.pid";
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
const LIVENESS_POLL: Duration = Duration::from_millis(200);

/// Owns the worker pool for one data directory.
pub struct Supervisor {
    store: Store,
    config: Config,
}

impl Supervisor {
    /// Creates a supervisor over a store and its configuration.
    pub fn new(store: Store, config: Config) -> Self {
        Supervisor { store, config }
    }

    /// Location of the pid file; present only while a supervisor is live.
    pub fn pid_file(&self) -> PathBuf {
        self.store.data_dir().join(PID_FILE)
    }

    /// Spawns `count` worker processes and blocks until interrupted.
    ///
    /// The data directory is a singleton resource: when the pid file names
    /// any live process this refuses to start a second pool. A pid file
    /// with no survivors is treated as stale and removed.
    pub async fn start(&self, count: usize) -> Result<()> {
        if count == 0 {
            return Err(Error::InvalidInput("worker count must be > 0".into()));
        }

        let pid_file = self.pid_file();
        let live: Vec<i32> = read_pid_file(&pid_file)?
            .into_iter()
            .filter(|pid| process_alive(*pid))
            .collect();
        if !live.is_empty() {
            return Err(Error::InvalidState(format!(
                "workers {live:?} from another supervisor are already running against this data directory"
            )));
        }
        if pid_file.exists() {
            warn!("removing stale pid file");
            std::fs::remove_file(&pid_file)?;
        }

        let settings = self.config.settings().await?;
        let exe = std::env::current_exe()?;
        let mut children = Vec::with_capacity(count);
        for index in 0..count {
            let name = Worker::default_name(index);
            let child = Command::new(&exe)
                .arg("--data-dir")
                .arg(self.store.data_dir())
                .arg("worker")
                .arg("run")
                .arg("--name")
                .arg(&name)
                .spawn()?;
            info!(worker.name = %name, pid = child.id(), "started worker");
            children.push(child);
        }
        write_pid_file(&pid_file, &children)?;

        let shutdown = shutdown::install_shutdown_handler();
        let mut ticker = interval(settings.poll_interval);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    // Centralising the sweep here keeps N workers from all
                    // issuing the same statement.
                    if let Err(err) = self.store.move_failed_to_pending(&util::now_ts()).await {
                        warn!(%err, "reactivation sweep failed");
                    }
                    reap_exited(&mut children);
                    if children.is_empty() {
                        error!("all workers exited, shutting down");
                        break;
                    }
                }
            }
        }

        stop_children(&mut children).await;
        if pid_file.exists() {
            std::fs::remove_file(&pid_file)?;
        }
        Ok(())
    }

    /// Signals the recorded workers to stop, escalating to SIGKILL on any
    /// that outlive the grace period, then removes the pid file.
    pub async fn stop(&self) -> Result<()> {
        let pid_file = self.pid_file();
        let pids = read_pid_file(&pid_file)?;
        if pids.is_empty() {
            info!("no workers recorded");
            return Ok(());
        }

        for pid in &pids {
            if process_alive(*pid) {
                info!(pid, "signalling worker to stop");
                terminate(*pid);
            }
        }

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        while Instant::now() < deadline {
            if pids.iter().all(|pid| !process_alive(*pid)) {
                break;
            }
            sleep(LIVENESS_POLL).await;
        }
        for pid in &pids {
            if process_alive(*pid) {
                warn!(pid, "worker did not stop within the grace period, killing");
                kill(*pid);
            }
        }

        if pid_file.exists() {
            std::fs::remove_file(&pid_file)?;
        }
        Ok(())
    }

    /// True when any recorded worker process is still alive.
    pub fn is_running(&self) -> Result<bool> {
        Ok(read_pid_file(&self.pid_file())?
            .into_iter()
            .any(process_alive))
    }
}

/// Graceful stop for children this supervisor spawned: SIGTERM, wait out
/// the grace period, force-kill the rest.
async fn stop_children(children: &mut Vec<Child>) {
    if children.is_empty() {
        return;
    }
    info!("stopping {} worker(s)", children.len());
    for child in children.iter() {
        if let Some(pid) = child.id() {
            terminate(pid as i32);
        }
    }

    let deadline = Instant::now() + SHUTDOWN_GRACE;
    while Instant::now() < deadline {
        reap_exited(children);
        if children.is_empty() {
            return;
        }
        sleep(LIVENESS_POLL).await;
    }

    for child in children.iter_mut() {
        warn!(pid = child.id(), "worker did not stop within the grace period, killing");
        let _ = child.start_kill();
        let _ = child.wait().await;
    }
    children.clear();
}

fn reap_exited(children: &mut Vec<Child>) {
    children.retain_mut(|child| match child.try_wait() {
        Ok(None) => true,
        Ok(Some(status)) => {
            info!(%status, "worker exited");
            false
        }
        Err(err) => {
            warn!(%err, "failed to poll worker process");
            true
        }
    });
}

fn write_pid_file(path: &Path, children: &[Child]) -> Result<()> {
    let mut body = String::new();
    for child in children {
        if let Some(pid) = child.id() {
            body.push_str(&pid.to_string());
            body.push('\n');
        }
    }
    std::fs::write(path, body)?;
    Ok(())
}

fn read_pid_file(path: &Path) -> Result<Vec<i32>> {
    let body = match std::fs::read_to_string(path) {
        Ok(body) => body,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    Ok(body
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect())
}

#[cfg(unix)]
fn process_alive(pid: i32) -> bool {
    unsafe { libc::kill(pid, 0) == 0 }
}

#[cfg(unix)]
fn terminate(pid: i32) {
    unsafe { libc::kill(pid, libc::SIGTERM) };
}

#[cfg(unix)]
fn kill(pid: i32) {
    unsafe { libc::kill(pid, libc::SIGKILL) };
}

#[cfg(not(unix))]
fn process_alive(_pid: i32) -> bool {
    false
}

#[cfg(not(unix))]
fn terminate(_pid: i32) {}

#[cfg(not(unix))]
fn kill(_pid: i32) {}
