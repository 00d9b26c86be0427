use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tabled::settings::Style;
use tabled::{Table, Tabled};
use tracing_subscriber::EnvFilter;

use queuectl::schema::{Job, JobRun, JobSpec, JobState, Stats};
use queuectl::{install_shutdown_handler, Error, Store, Supervisor, Worker};

#[derive(Parser, Debug)]
#[command(name = "queuectl")]
#[command(about = "Durable multi-worker background job queue", version)]
struct Cli {
    /// Directory holding the database, log files and worker pid file
    #[arg(long, default_value = "./data", global = true)]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Enqueue a job from a JSON object, e.g. '{"id":"j1","command":"echo hi"}'
    Enqueue {
        /// JSON object with at least "id" and "command"
        job_json: String,
        /// Dispatch priority; lower runs first
        #[arg(long)]
        priority: Option<i64>,
        /// Earliest start time, RFC 3339 UTC (e.g. 2025-11-04T10:30:00Z)
        #[arg(long)]
        run_at: Option<String>,
        /// Per-job timeout in seconds
        #[arg(long)]
        timeout: Option<i64>,
        /// Retry ceiling, overriding the configured default
        #[arg(long)]
        max_retries: Option<i64>,
    },
    /// Worker management
    #[command(subcommand)]
    Worker(WorkerCommands),
    /// Summary of job states and run totals
    Status,
    /// List jobs, optionally filtered by state
    List {
        #[arg(long, value_enum)]
        state: Option<JobState>,
        #[arg(long)]
        limit: Option<i64>,
    },
    /// Dead letter queue operations
    #[command(subcommand)]
    Dlq(DlqCommands),
    /// Configuration management
    #[command(subcommand)]
    Config(ConfigCommands),
    /// Most recent execution attempts
    Runs {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Print the log file paths for a job
    Logs { job_id: String },
}

#[derive(Subcommand, Debug)]
enum WorkerCommands {
    /// Start N workers in the foreground; Ctrl+C to stop
    Start {
        #[arg(long, default_value_t = 1)]
        count: usize,
    },
    /// Gracefully stop the workers recorded in the pid file
    Stop,
    /// Run a single worker loop in this process
    #[command(hide = true)]
    Run {
        #[arg(long)]
        name: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum DlqCommands {
    /// List jobs in the dead letter queue
    List,
    /// Return a dead job to pending with a clean slate
    Retry { job_id: String },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Set a config key
    Set { key: String, value: String },
    /// Print a config value
    Get { key: String },
    /// Print the whole configuration
    Show,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        eprintln!("error: {err}");
        std::process::exit(err.exit_code());
    }
}

async fn run(cli: Cli) -> Result<(), Error> {
    let store = Store::open(&cli.data_dir).await?;
    let config = store.config();

    match cli.command {
        Commands::Enqueue {
            job_json,
            priority,
            run_at,
            timeout,
            max_retries,
        } => {
            let mut spec: JobSpec = serde_json::from_str(&job_json)
                .map_err(|err| Error::InvalidInput(format!("invalid job JSON: {err}")))?;
            if priority.is_some() {
                spec.priority = priority;
            }
            if run_at.is_some() {
                spec.run_at = run_at;
            }
            if timeout.is_some() {
                spec.timeout_secs = timeout;
            }
            if max_retries.is_some() {
                spec.max_retries = max_retries;
            }
            let default_max_retries = config.settings().await?.max_retries;
            let job = store.enqueue(spec, default_max_retries).await?;
            println!("{}", job_table(&[job]));
        }
        Commands::Worker(WorkerCommands::Start { count }) => {
            println!("Starting {count} worker(s), Ctrl+C to stop");
            Supervisor::new(store, config).start(count).await?;
        }
        Commands::Worker(WorkerCommands::Stop) => {
            Supervisor::new(store, config).stop().await?;
            println!("Stop requested");
        }
        Commands::Worker(WorkerCommands::Run { name }) => {
            let settings = config.settings().await?;
            let name = name.unwrap_or_else(|| Worker::default_name(0));
            Worker::new(store, settings, name)
                .run(install_shutdown_handler())
                .await;
        }
        Commands::Status => {
            let stats = store.stats().await?;
            println!("{}", stats_table(&stats));
        }
        Commands::List { state, limit } => {
            let jobs = store.list(state, limit).await?;
            if jobs.is_empty() {
                println!("No jobs found.");
            } else {
                println!("{}", job_table(&jobs));
            }
        }
        Commands::Dlq(DlqCommands::List) => {
            let jobs = store.list(Some(JobState::Dead), None).await?;
            if jobs.is_empty() {
                println!("DLQ empty.");
            } else {
                println!("{}", job_table(&jobs));
            }
        }
        Commands::Dlq(DlqCommands::Retry { job_id }) => {
            store.retry_from_dlq(&job_id).await?;
            println!("Job {job_id} returned to pending");
        }
        Commands::Config(ConfigCommands::Set { key, value }) => {
            config.set(&key, &value).await?;
            println!("Set {key} = {value}");
        }
        Commands::Config(ConfigCommands::Get { key }) => match config.get(&key).await? {
            Some(value) => println!("{value}"),
            None => println!("(unset)"),
        },
        Commands::Config(ConfigCommands::Show) => {
            let rows: Vec<ConfigRow> = config
                .all()
                .await?
                .into_iter()
                .map(|(key, value)| ConfigRow { key, value })
                .collect();
            println!("{}", Table::new(rows).with(Style::sharp()));
        }
        Commands::Runs { limit } => {
            let runs = store.recent_runs(limit).await?;
            if runs.is_empty() {
                println!("No runs recorded.");
            } else {
                println!("{}", run_table(&runs));
            }
        }
        Commands::Logs { job_id } => {
            let (stdout, stderr) = store.log_paths_for(&job_id);
            println!("stdout: {}", stdout.display());
            println!("stderr: {}", stderr.display());
        }
    }
    Ok(())
}

#[derive(Tabled)]
struct JobRow {
    id: String,
    state: String,
    attempts: String,
    priority: i64,
    next_run_at: String,
    worker: String,
    last_error: String,
}

impl From<&Job> for JobRow {
    fn from(job: &Job) -> Self {
        JobRow {
            id: job.id.clone(),
            state: job.state.to_string(),
            attempts: format!("{}/{}", job.attempts, job.max_retries + 1),
            priority: job.priority,
            next_run_at: job.next_run_at.clone(),
            worker: job.worker_name.clone().unwrap_or_else(|| "-".into()),
            last_error: job.last_error.clone().unwrap_or_else(|| "-".into()),
        }
    }
}

fn job_table(jobs: &[Job]) -> String {
    Table::new(jobs.iter().map(JobRow::from))
        .with(Style::sharp())
        .to_string()
}

#[derive(Tabled)]
struct RunRow {
    job_id: String,
    attempt: i64,
    outcome: String,
    exit_code: String,
    duration_ms: i64,
    started_at: String,
    worker: String,
}

fn run_table(runs: &[JobRun]) -> String {
    let rows = runs.iter().map(|run| RunRow {
        job_id: run.job_id.clone(),
        attempt: run.attempt,
        outcome: run.outcome.to_string(),
        exit_code: run
            .exit_code
            .map_or_else(|| "-".into(), |code| code.to_string()),
        duration_ms: run.duration_ms,
        started_at: run.started_at.clone(),
        worker: run.worker_name.clone(),
    });
    Table::new(rows).with(Style::sharp()).to_string()
}

#[derive(Tabled)]
struct StatsRow {
    pending: i64,
    processing: i64,
    completed: i64,
    failed: i64,
    dead: i64,
    total_jobs: i64,
    total_runs: i64,
}

fn stats_table(stats: &Stats) -> String {
    let row = StatsRow {
        pending: stats.pending,
        processing: stats.processing,
        completed: stats.completed,
        failed: stats.failed,
        dead: stats.dead,
        total_jobs: stats.total_jobs,
        total_runs: stats.total_runs,
    };
    Table::new([row]).with(Style::sharp()).to_string()
}

#[derive(Tabled)]
struct ConfigRow {
    key: String,
    value: String,
}
