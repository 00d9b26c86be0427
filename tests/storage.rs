#![allow(missing_docs)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::DateTime;
use claims::{assert_none, assert_some};
use insta::assert_compact_json_snapshot;
use queuectl::schema::{JobRun, JobSpec, JobState, RunOutcome};
use queuectl::{now_ts, Error, Store};
use tempfile::TempDir;

/// Test utilities and common setup
mod test_utils {
    use super::*;

    /// Provision a fresh store in an isolated data directory.
    pub(super) async fn open_store() -> anyhow::Result<(Store, TempDir)> {
        let dir = TempDir::new()?;
        let store = Store::open(dir.path()).await?;
        Ok((store, dir))
    }

    pub(super) fn spec(id: &str, command: &str) -> JobSpec {
        JobSpec {
            id: id.into(),
            command: command.into(),
            ..JobSpec::default()
        }
    }

    pub(super) fn run_record(job_id: &str, attempt: i64, outcome: RunOutcome) -> JobRun {
        let now = now_ts();
        JobRun {
            job_id: job_id.into(),
            attempt,
            started_at: now.clone(),
            finished_at: now,
            duration_ms: 5,
            exit_code: Some(if outcome == RunOutcome::Success { 0 } else { 1 }),
            stdout_bytes: 0,
            stderr_bytes: 0,
            worker_name: "w-test".into(),
            outcome,
        }
    }

    /// Seconds between two stored timestamps.
    pub(super) fn secs_between(earlier: &str, later: &str) -> i64 {
        let earlier = DateTime::parse_from_rfc3339(earlier).unwrap();
        let later = DateTime::parse_from_rfc3339(later).unwrap();
        (later - earlier).num_seconds()
    }
}

const FAR_FUTURE: &str = "2999-01-01T00:00:00Z";

#[tokio::test]
async fn enqueue_then_get_round_trips() -> anyhow::Result<()> {
    let (store, _dir) = test_utils::open_store().await?;

    let spec = JobSpec {
        priority: Some(7),
        timeout_secs: Some(30),
        ..test_utils::spec("a", "echo ok")
    };
    store.enqueue(spec, 3).await?;

    let job = store.get("a").await?;
    assert_eq!(job.id, "a");
    assert_eq!(job.command, "echo ok");
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.attempts, 0);
    assert_eq!(job.priority, 7);
    assert_eq!(job.timeout_secs, Some(30));
    assert_none!(job.worker_name.as_deref());
    assert_none!(job.last_error.as_deref());
    assert_eq!(job.next_run_at, job.created_at);
    Ok(())
}

#[tokio::test]
async fn enqueue_applies_defaults() -> anyhow::Result<()> {
    let (store, _dir) = test_utils::open_store().await?;

    let job = store.enqueue(test_utils::spec("a", "true"), 5).await?;
    assert_eq!(job.priority, 100);
    assert_eq!(job.max_retries, 5);
    assert_none!(job.timeout_secs);
    assert_none!(job.run_at.as_deref());
    Ok(())
}

#[tokio::test]
async fn enqueue_rejects_duplicate_id() -> anyhow::Result<()> {
    let (store, _dir) = test_utils::open_store().await?;

    store.enqueue(test_utils::spec("a", "true"), 3).await?;
    let err = store
        .enqueue(test_utils::spec("a", "false"), 3)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyExists(id) if id == "a"));
    Ok(())
}

#[tokio::test]
async fn enqueue_rejects_malformed_specs() -> anyhow::Result<()> {
    let (store, _dir) = test_utils::open_store().await?;

    let err = store.enqueue(test_utils::spec("", "true"), 3).await.unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));

    let bad_run_at = JobSpec {
        run_at: Some("soon".into()),
        ..test_utils::spec("a", "true")
    };
    let err = store.enqueue(bad_run_at, 3).await.unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
    Ok(())
}

#[tokio::test]
async fn get_missing_job_is_not_found() -> anyhow::Result<()> {
    let (store, _dir) = test_utils::open_store().await?;
    let err = store.get("ghost").await.unwrap_err();
    assert!(matches!(err, Error::NotFound(id) if id == "ghost"));
    Ok(())
}

#[tokio::test]
async fn claim_orders_by_priority_then_id() -> anyhow::Result<()> {
    let (store, _dir) = test_utils::open_store().await?;

    // Same creation second for x and z, so the id tie-break decides.
    store
        .enqueue(
            JobSpec {
                priority: Some(100),
                ..test_utils::spec("x", "true")
            },
            3,
        )
        .await?;
    store
        .enqueue(
            JobSpec {
                priority: Some(10),
                ..test_utils::spec("y", "true")
            },
            3,
        )
        .await?;
    store
        .enqueue(
            JobSpec {
                priority: Some(100),
                ..test_utils::spec("z", "true")
            },
            3,
        )
        .await?;

    let first = assert_some!(store.claim_next("w1", &now_ts()).await?);
    let second = assert_some!(store.claim_next("w1", &now_ts()).await?);
    let third = assert_some!(store.claim_next("w1", &now_ts()).await?);
    assert_eq!(first.id, "y");
    assert_eq!(second.id, "x");
    assert_eq!(third.id, "z");
    assert_none!(store.claim_next("w1", &now_ts()).await?);
    Ok(())
}

#[tokio::test]
async fn claim_skips_deferred_jobs() -> anyhow::Result<()> {
    let (store, _dir) = test_utils::open_store().await?;

    let deferred = JobSpec {
        run_at: Some(FAR_FUTURE.into()),
        ..test_utils::spec("later", "true")
    };
    store.enqueue(deferred, 3).await?;

    assert_none!(store.claim_next("w1", &now_ts()).await?);
    // With the clock moved past run_at the job becomes eligible.
    assert_some!(store.claim_next("w1", "2999-06-01T00:00:00Z").await?);
    Ok(())
}

#[tokio::test]
async fn claim_marks_processing_and_prevents_reclaim() -> anyhow::Result<()> {
    let (store, _dir) = test_utils::open_store().await?;

    store.enqueue(test_utils::spec("a", "true"), 3).await?;
    let claimed = assert_some!(store.claim_next("w1", &now_ts()).await?);
    assert_eq!(claimed.state, JobState::Processing);
    assert_eq!(claimed.worker_name.as_deref(), Some("w1"));

    // A processing job is invisible to further claims.
    assert_none!(store.claim_next("w2", &now_ts()).await?);
    Ok(())
}

#[tokio::test]
async fn concurrent_claims_hand_each_job_to_one_worker() -> anyhow::Result<()> {
    const JOBS: usize = 25;
    const WORKERS: usize = 6;

    let (store, _dir) = test_utils::open_store().await?;
    for i in 0..JOBS {
        let spec = JobSpec {
            priority: Some((i % 3) as i64),
            ..test_utils::spec(&format!("job-{i}"), "true")
        };
        store.enqueue(spec, 3).await?;
    }

    let claimed = Arc::new(Mutex::new(HashSet::new()));
    let mut tasks = tokio::task::JoinSet::new();
    for index in 0..WORKERS {
        let store = store.clone();
        let claimed = claimed.clone();
        tasks.spawn(async move {
            let worker = format!("w-{index}");
            while let Some(job) = store.claim_next(&worker, &now_ts()).await.unwrap() {
                assert!(
                    claimed.lock().unwrap().insert(job.id.clone()),
                    "job {} was claimed twice",
                    job.id
                );
            }
        });
    }
    while let Some(result) = tasks.join_next().await {
        result?;
    }

    assert_eq!(claimed.lock().unwrap().len(), JOBS);
    Ok(())
}

#[tokio::test]
async fn complete_finishes_the_attempt() -> anyhow::Result<()> {
    let (store, _dir) = test_utils::open_store().await?;

    store.enqueue(test_utils::spec("a", "true"), 3).await?;
    assert_some!(store.claim_next("w1", &now_ts()).await?);
    store
        .complete("a", &test_utils::run_record("a", 1, RunOutcome::Success))
        .await?;

    let job = store.get("a").await?;
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.attempts, 1);
    assert_none!(job.worker_name.as_deref());
    assert_none!(job.last_error.as_deref());

    let runs = store.runs_for("a").await?;
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].outcome, RunOutcome::Success);
    Ok(())
}

#[tokio::test]
async fn complete_requires_a_processing_job() -> anyhow::Result<()> {
    let (store, _dir) = test_utils::open_store().await?;

    store.enqueue(test_utils::spec("a", "true"), 3).await?;
    let err = store
        .complete("a", &test_utils::run_record("a", 1, RunOutcome::Success))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));

    let err = store
        .complete("ghost", &test_utils::run_record("ghost", 1, RunOutcome::Success))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
    Ok(())
}

#[tokio::test]
async fn failed_attempts_reschedule_then_divert_to_dlq() -> anyhow::Result<()> {
    let (store, _dir) = test_utils::open_store().await?;
    let settings = store.config().settings().await?;

    let spec = JobSpec {
        max_retries: Some(1),
        ..test_utils::spec("b", "false")
    };
    store.enqueue(spec, 3).await?;

    assert_some!(store.claim_next("w1", &now_ts()).await?);
    let job = store
        .reschedule_or_dead(
            "b",
            &test_utils::run_record("b", 1, RunOutcome::Failure),
            "exit:1",
            &settings,
        )
        .await?;
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.last_error.as_deref(), Some("exit:1"));
    assert_none!(job.worker_name.as_deref());

    assert_eq!(store.move_failed_to_pending(FAR_FUTURE).await?, 1);
    assert_some!(store.claim_next("w1", FAR_FUTURE).await?);
    let job = store
        .reschedule_or_dead(
            "b",
            &test_utils::run_record("b", 2, RunOutcome::Failure),
            "exit:1",
            &settings,
        )
        .await?;
    assert_eq!(job.state, JobState::Dead);
    assert_eq!(job.attempts, 2);

    assert_eq!(store.runs_for("b").await?.len(), 2);
    Ok(())
}

#[tokio::test]
async fn backoff_delays_grow_exponentially() -> anyhow::Result<()> {
    let (store, _dir) = test_utils::open_store().await?;
    let settings = store.config().settings().await?;

    store.enqueue(test_utils::spec("b", "false"), 3).await?;

    // First failure: delay >= backoff_base^0 = 1 second.
    assert_some!(store.claim_next("w1", &now_ts()).await?);
    let job = store
        .reschedule_or_dead(
            "b",
            &test_utils::run_record("b", 1, RunOutcome::Failure),
            "exit:1",
            &settings,
        )
        .await?;
    let first_delay = test_utils::secs_between(&job.updated_at, &job.next_run_at);
    assert!(first_delay >= 1, "first delay was {first_delay}s");

    // Second failure: delay >= backoff_base^1 = 2 seconds.
    store.move_failed_to_pending(FAR_FUTURE).await?;
    assert_some!(store.claim_next("w1", FAR_FUTURE).await?);
    let job = store
        .reschedule_or_dead(
            "b",
            &test_utils::run_record("b", 2, RunOutcome::Failure),
            "exit:1",
            &settings,
        )
        .await?;
    let second_delay = test_utils::secs_between(&job.updated_at, &job.next_run_at);
    assert!(second_delay >= 2, "second delay was {second_delay}s");
    assert!(second_delay > first_delay);
    Ok(())
}

#[tokio::test]
async fn move_failed_to_pending_is_idempotent() -> anyhow::Result<()> {
    let (store, _dir) = test_utils::open_store().await?;
    let settings = store.config().settings().await?;

    store.enqueue(test_utils::spec("a", "false"), 3).await?;
    assert_some!(store.claim_next("w1", &now_ts()).await?);
    store
        .reschedule_or_dead(
            "a",
            &test_utils::run_record("a", 1, RunOutcome::Failure),
            "exit:1",
            &settings,
        )
        .await?;

    assert_eq!(store.move_failed_to_pending(FAR_FUTURE).await?, 1);
    assert_eq!(store.move_failed_to_pending(FAR_FUTURE).await?, 0);
    assert_eq!(store.get("a").await?.state, JobState::Pending);
    Ok(())
}

#[tokio::test]
async fn retry_from_dlq_resets_the_job() -> anyhow::Result<()> {
    let (store, _dir) = test_utils::open_store().await?;
    let settings = store.config().settings().await?;

    let spec = JobSpec {
        max_retries: Some(0),
        ..test_utils::spec("b", "false")
    };
    store.enqueue(spec, 3).await?;
    assert_some!(store.claim_next("w1", &now_ts()).await?);
    store
        .reschedule_or_dead(
            "b",
            &test_utils::run_record("b", 1, RunOutcome::Failure),
            "exit:1",
            &settings,
        )
        .await?;
    assert_eq!(store.get("b").await?.state, JobState::Dead);

    let job = store.retry_from_dlq("b").await?;
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.attempts, 0);
    assert_none!(job.last_error.as_deref());

    // Immediately eligible again.
    assert_some!(store.claim_next("w1", &now_ts()).await?);
    Ok(())
}

#[tokio::test]
async fn retry_from_dlq_requires_a_dead_job() -> anyhow::Result<()> {
    let (store, _dir) = test_utils::open_store().await?;

    store.enqueue(test_utils::spec("a", "true"), 3).await?;
    let err = store.retry_from_dlq("a").await.unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));

    let err = store.retry_from_dlq("ghost").await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
    Ok(())
}

#[tokio::test]
async fn increment_attempts_bumps_the_counter() -> anyhow::Result<()> {
    let (store, _dir) = test_utils::open_store().await?;

    store.enqueue(test_utils::spec("a", "true"), 3).await?;
    assert_eq!(store.increment_attempts("a").await?, 1);
    assert_eq!(store.increment_attempts("a").await?, 2);

    let err = store.increment_attempts("ghost").await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
    Ok(())
}

#[tokio::test]
async fn stats_cover_every_state() -> anyhow::Result<()> {
    let (store, _dir) = test_utils::open_store().await?;

    assert_compact_json_snapshot!(store.stats().await?, @r#"{"pending": 0, "processing": 0, "completed": 0, "failed": 0, "dead": 0, "total_jobs": 0, "total_runs": 0}"#);

    store.enqueue(test_utils::spec("a", "true"), 3).await?;
    store.enqueue(test_utils::spec("b", "true"), 3).await?;
    assert_some!(store.claim_next("w1", &now_ts()).await?);
    store
        .record_run(&test_utils::run_record("a", 1, RunOutcome::Success))
        .await?;

    assert_compact_json_snapshot!(store.stats().await?, @r#"{"pending": 1, "processing": 1, "completed": 0, "failed": 0, "dead": 0, "total_jobs": 2, "total_runs": 1}"#);
    Ok(())
}

#[tokio::test]
async fn list_filters_by_state_in_dispatch_order() -> anyhow::Result<()> {
    let (store, _dir) = test_utils::open_store().await?;

    store
        .enqueue(
            JobSpec {
                priority: Some(50),
                ..test_utils::spec("b", "true")
            },
            3,
        )
        .await?;
    store
        .enqueue(
            JobSpec {
                priority: Some(10),
                ..test_utils::spec("c", "true")
            },
            3,
        )
        .await?;
    store.enqueue(test_utils::spec("a", "true"), 3).await?;
    assert_some!(store.claim_next("w1", &now_ts()).await?);

    let pending: Vec<String> = store
        .list(Some(JobState::Pending), None)
        .await?
        .into_iter()
        .map(|job| job.id)
        .collect();
    assert_eq!(pending, ["b", "a"]);

    let all: Vec<String> = store
        .list(None, None)
        .await?
        .into_iter()
        .map(|job| job.id)
        .collect();
    assert_eq!(all, ["a", "b", "c"]);

    let limited = store.list(None, Some(2)).await?;
    assert_eq!(limited.len(), 2);
    Ok(())
}

#[tokio::test]
async fn recent_runs_come_back_newest_first() -> anyhow::Result<()> {
    let (store, _dir) = test_utils::open_store().await?;

    for attempt in 1..=3 {
        store
            .record_run(&test_utils::run_record("a", attempt, RunOutcome::Failure))
            .await?;
    }

    let runs = store.recent_runs(2).await?;
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[0].attempt, 3);
    assert_eq!(runs[1].attempt, 2);
    Ok(())
}

#[tokio::test]
async fn log_paths_are_deterministic() -> anyhow::Result<()> {
    let (store, dir) = test_utils::open_store().await?;

    let (stdout, stderr) = store.log_paths_for("job-1");
    assert_eq!(stdout, dir.path().join("logs").join("job-1.stdout.log"));
    assert_eq!(stderr, dir.path().join("logs").join("job-1.stderr.log"));
    // The paths are deterministic, not pre-created.
    assert!(!stdout.exists());
    Ok(())
}

#[tokio::test]
async fn store_state_survives_reopen() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    {
        let store = Store::open(dir.path()).await?;
        store.enqueue(test_utils::spec("a", "true"), 3).await?;
    }

    let store = Store::open(dir.path()).await?;
    let job = store.get("a").await?;
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.attempts, 0);
    Ok(())
}

#[tokio::test]
async fn config_defaults_materialise_on_first_read() -> anyhow::Result<()> {
    let (store, _dir) = test_utils::open_store().await?;
    let config = store.config();

    assert_eq!(config.get("max_retries").await?.as_deref(), Some("3"));
    assert_none!(config.get("unknown_key").await?);

    assert_compact_json_snapshot!(config.all().await?, @r#"{"backoff_base": "2", "default_timeout_secs": "60", "max_retries": "3", "poll_interval_ms": "500"}"#);
    Ok(())
}

#[tokio::test]
async fn config_set_validates_recognised_keys() -> anyhow::Result<()> {
    let (store, _dir) = test_utils::open_store().await?;
    let config = store.config();

    let err = config.set("max_retries", "many").await.unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
    let err = config.set("backoff_base", "1").await.unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));

    // Unknown keys are stored untouched for forward-compatibility.
    config.set("dashboard_theme", "dark").await?;
    assert_eq!(config.get("dashboard_theme").await?.as_deref(), Some("dark"));
    Ok(())
}

#[tokio::test]
async fn config_settings_reflect_overrides() -> anyhow::Result<()> {
    let (store, _dir) = test_utils::open_store().await?;
    let config = store.config();

    config.set("poll_interval_ms", "250").await?;
    config.set("backoff_base", "3").await?;

    let settings = config.settings().await?;
    assert_eq!(settings.poll_interval.as_millis(), 250);
    assert_eq!(settings.backoff_base, 3.0);
    assert_eq!(settings.max_retries, 3);
    assert_eq!(settings.default_timeout.as_secs(), 60);
    Ok(())
}
