//! foreman command-line entry point.
//!
//! `serve` runs the dispatch loop; `worker` is what the scheduler spawns for
//! each job; the remaining subcommands are control-plane operations against
//! the shared database.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use foreman::builtin::builtin_registry;
use foreman::{
    GpuProbe, JobFilter, JobId, JobStatus, JobStore, LaunchRequest, PersistenceConfig,
    ProcessLauncher, ResourceClass, RetryConfig, Scheduler, SchedulerBuilder, SchedulerConfig,
    SqliteStore, SystemGpuProbe, WorkerOutcome, WorkerRuntime,
};

#[derive(Parser, Debug)]
#[command(name = "foreman")]
#[command(version)]
#[command(about = "GPU-aware job orchestrator with process-isolated workers")]
#[command(propagate_version = true)]
struct Args {
    /// SQLite database shared by the scheduler and its workers
    #[arg(long, global = true, env = "FOREMAN_DATABASE_URL", default_value = "sqlite://foreman.db")]
    database_url: String,

    /// How long a statement waits on a locked database
    #[arg(long, global = true, env = "FOREMAN_BUSY_TIMEOUT_MS", default_value_t = 5000)]
    busy_timeout_ms: u64,

    /// Emit logs as JSON
    #[arg(long, global = true, env = "FOREMAN_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the scheduler loop until interrupted
    Serve(ServeArgs),

    /// Execute one leased job (spawned by the scheduler)
    Worker(WorkerArgs),

    /// Enqueue a job
    Enqueue {
        kind: String,
        /// JSON payload
        #[arg(long, default_value = "{}")]
        payload: String,
        /// Lower dispatches first
        #[arg(long, default_value_t = 100)]
        priority: i64,
        #[arg(long)]
        max_attempts: Option<u32>,
    },

    /// List jobs, newest first
    Jobs {
        #[arg(long, value_parser = parse_status)]
        status: Option<JobStatus>,
        #[arg(long)]
        kind: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: u32,
        #[arg(long, default_value_t = 0)]
        offset: u32,
    },

    /// Show a job with its checkpoint and recent events
    Job {
        id: JobId,
        #[arg(long, default_value_t = 20)]
        events: u32,
    },

    /// Cancel a job
    Cancel { id: JobId },

    /// Pause one job, or the whole scheduler when no id is given
    Pause { id: Option<JobId> },

    /// Resume one job, or the whole scheduler when no id is given
    Resume { id: Option<JobId> },

    /// Show held resource locks
    Locks,

    /// Probe the GPU
    Gpu,

    /// Show counts per status and per-class utilization
    Status,
}

#[derive(Parser, Debug)]
struct ServeArgs {
    /// JSON scheduler configuration; flags below override it
    #[arg(long, env = "FOREMAN_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "FOREMAN_POLL_INTERVAL_MS")]
    poll_interval_ms: Option<u64>,

    #[arg(long, env = "FOREMAN_HEARTBEAT_SECS")]
    heartbeat_secs: Option<u64>,

    #[arg(long, env = "FOREMAN_LEASE_TTL_SECS")]
    lease_ttl_secs: Option<i64>,

    #[arg(long, env = "FOREMAN_GPU_SAFETY_MARGIN_MB")]
    gpu_safety_margin_mb: Option<u64>,

    /// Per-class concurrency limit, e.g. `light_cpu=4` (repeatable)
    #[arg(long = "limit", value_parser = parse_limit)]
    limits: Vec<(ResourceClass, usize)>,

    /// Worker executable (defaults to this binary)
    #[arg(long, env = "FOREMAN_WORKER_PROGRAM")]
    worker_program: Option<PathBuf>,
}

#[derive(Parser, Debug)]
struct WorkerArgs {
    #[arg(long)]
    job_id: JobId,
    #[arg(long)]
    kind: String,
    #[arg(long)]
    lease_owner: String,
    #[arg(long)]
    gpu_resource: Option<String>,
    #[arg(long, default_value_t = 5)]
    heartbeat_secs: u64,
    #[arg(long, default_value_t = 1000)]
    retry_base_ms: u64,
    #[arg(long, default_value_t = 300000)]
    retry_max_ms: u64,
}

fn parse_status(s: &str) -> Result<JobStatus, String> {
    s.parse().map_err(|err: anyhow::Error| err.to_string())
}

fn parse_limit(s: &str) -> Result<(ResourceClass, usize), String> {
    let (class, limit) = s
        .split_once('=')
        .ok_or_else(|| format!("expected CLASS=N, got '{s}'"))?;
    let class = class
        .parse::<ResourceClass>()
        .map_err(|err| err.to_string())?;
    let limit = limit.parse::<usize>().map_err(|err| err.to_string())?;
    Ok((class, limit))
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn load_config(args: &ServeArgs) -> anyhow::Result<SchedulerConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?
        }
        None => SchedulerConfig::default(),
    };

    if let Some(ms) = args.poll_interval_ms {
        config = config.with_poll_interval(ms);
    }
    if let Some(secs) = args.heartbeat_secs {
        config = config.with_heartbeat_interval(secs);
    }
    if let Some(secs) = args.lease_ttl_secs {
        config = config.with_lease_ttl(secs);
    }
    if let Some(mb) = args.gpu_safety_margin_mb {
        config = config.with_gpu_safety_margin(mb);
    }
    for (class, limit) in &args.limits {
        config = config.with_limit(*class, *limit);
    }
    if let Some(program) = &args.worker_program {
        config = config.with_worker_program(program);
    }
    Ok(config)
}

async fn open_store(config: &PersistenceConfig) -> anyhow::Result<Arc<SqliteStore>> {
    let store = SqliteStore::connect(config)
        .await
        .with_context(|| format!("opening {}", config.database_url))?;
    Ok(Arc::new(store))
}

fn build_scheduler(
    config: SchedulerConfig,
    database_url: &str,
    store: Arc<SqliteStore>,
) -> anyhow::Result<Scheduler> {
    let launcher = match &config.worker_program {
        Some(program) => ProcessLauncher::new(program, database_url),
        None => ProcessLauncher::current_exe(database_url)?,
    }
    .with_heartbeat_interval(config.heartbeat_interval())
    .with_retry(config.retry.clone());

    SchedulerBuilder::new(config)
        .with_store(store)
        .with_registry(Arc::new(builtin_registry()?))
        .with_launcher(Arc::new(launcher))
        .build()
}

async fn serve(args: ServeArgs, persistence: &PersistenceConfig) -> anyhow::Result<()> {
    let config = load_config(&args)?;
    #[cfg(feature = "metrics")]
    foreman::metrics::init_metrics()?;

    let store = open_store(persistence).await?;
    let scheduler = Arc::new(build_scheduler(
        config,
        &persistence.database_url,
        store,
    )?);
    let handle = scheduler.spawn();

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    scheduler.shutdown();
    handle.await?;
    Ok(())
}

async fn worker(
    args: WorkerArgs,
    persistence: PersistenceConfig,
) -> anyhow::Result<WorkerOutcome> {
    // A worker touches one job; heartbeats use their own connection.
    let store: Arc<dyn JobStore> = open_store(&persistence.with_max_connections(2)).await?;
    let runtime = WorkerRuntime::new(store, Arc::new(builtin_registry()?))
        .with_heartbeat_interval(Duration::from_secs(args.heartbeat_secs.max(1)))
        .with_retry(RetryConfig {
            base_delay_ms: args.retry_base_ms,
            max_backoff_ms: args.retry_max_ms,
        });

    runtime
        .execute(LaunchRequest {
            job_id: args.job_id,
            kind: args.kind,
            lease_owner: args.lease_owner,
            gpu_resource: args.gpu_resource,
        })
        .await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);
    let persistence =
        PersistenceConfig::new(&args.database_url).with_busy_timeout(args.busy_timeout_ms);

    match args.command {
        Commands::Serve(serve_args) => serve(serve_args, &persistence).await?,
        Commands::Worker(worker_args) => {
            let outcome = worker(worker_args, persistence).await?;
            info!(outcome = outcome.as_str(), "worker finished");
        }
        Commands::Gpu => {
            let config = SchedulerConfig::default();
            let probe = SystemGpuProbe::new().with_timeout(config.gpu_probe_timeout());
            print_json(&probe.probe().await)?;
        }
        command => {
            let store = open_store(&persistence).await?;
            let scheduler = build_scheduler(
                SchedulerConfig::default(),
                &persistence.database_url,
                store,
            )?;
            control(&scheduler, command).await?;
        }
    }
    Ok(())
}

async fn control(scheduler: &Scheduler, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Enqueue {
            kind,
            payload,
            priority,
            max_attempts,
        } => {
            let payload: Value = serde_json::from_str(&payload).context("parsing --payload")?;
            let id = scheduler.enqueue(&kind, payload, priority, max_attempts).await?;
            print_json(&serde_json::json!({ "job_id": id }))
        }
        Commands::Jobs {
            status,
            kind,
            limit,
            offset,
        } => {
            let mut filter = JobFilter::default().with_page(limit, offset);
            if let Some(status) = status {
                filter = filter.with_status(status);
            }
            if let Some(kind) = kind {
                filter = filter.with_kind(kind);
            }
            print_json(&scheduler.list_jobs(&filter).await?)
        }
        Commands::Job { id, events } => {
            let job = scheduler
                .get_job(id)
                .await?
                .with_context(|| format!("job {id} not found"))?;
            print_json(&serde_json::json!({
                "job": job,
                "checkpoint": scheduler.job_checkpoint(id).await?,
                "events": scheduler.job_events(id, events).await?,
            }))
        }
        Commands::Cancel { id } => print_json(&scheduler.cancel_job(id).await?),
        Commands::Pause { id: Some(id) } => {
            print_json(&serde_json::json!({ "paused": scheduler.pause_job(id).await? }))
        }
        Commands::Pause { id: None } => {
            scheduler.pause_all().await?;
            print_json(&serde_json::json!({ "scheduler_paused": true }))
        }
        Commands::Resume { id: Some(id) } => {
            print_json(&serde_json::json!({ "resumed": scheduler.resume_job(id).await? }))
        }
        Commands::Resume { id: None } => {
            scheduler.resume_all().await?;
            print_json(&serde_json::json!({ "scheduler_paused": false }))
        }
        Commands::Locks => print_json(&scheduler.locks().await?),
        Commands::Status => print_json(&scheduler.snapshot().await?),
        Commands::Serve(_) | Commands::Worker(_) | Commands::Gpu => {
            anyhow::bail!("not a control-plane command")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_limit() {
        assert_eq!(
            parse_limit("light_cpu=4").unwrap(),
            (ResourceClass::LightCpu, 4)
        );
        assert!(parse_limit("light_cpu").is_err());
        assert!(parse_limit("quantum=1").is_err());
    }

    #[test]
    fn test_worker_args_parse() {
        let args = Args::try_parse_from([
            "foreman",
            "--database-url",
            "sqlite:///tmp/x.db",
            "worker",
            "--job-id",
            "7",
            "--kind",
            "sleep",
            "--lease-owner",
            "job-7-abc",
        ])
        .unwrap();
        match args.command {
            Commands::Worker(worker) => {
                assert_eq!(worker.job_id, JobId(7));
                assert!(worker.gpu_resource.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_busy_timeout_is_global() {
        let args = Args::try_parse_from(["foreman", "jobs", "--busy-timeout-ms", "250"]).unwrap();
        assert_eq!(args.busy_timeout_ms, 250);

        let args = Args::try_parse_from(["foreman", "locks"]).unwrap();
        assert_eq!(args.busy_timeout_ms, 5000);
    }
}
