//! CLI command definitions for job-forge.
//!
//! - `work`: run the queue worker daemon
//! - `push`: enqueue a job, optionally delayed
//! - `size` / `clear`: inspect or empty a queue
//! - `exec` (hidden): serve one task over stdin/stdout as a worker process

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde_json::Value;
use tracing::{info, warn};

use crate::entrypoint::{default_handlers, registry_with_handlers, run_stdio};
use crate::metrics::init_metrics;
use crate::pool::RuntimeKind;
use crate::queue::{HandlerRegistry, QueueConfig, QueueManager, QueueWorker, WorkerConfig};

/// Background job queue with process-isolated workers.
#[derive(Parser)]
#[command(name = "job-forge")]
#[command(about = "Run background jobs from durable queues in isolated worker processes")]
#[command(version)]
#[command(
    long_about = "job-forge stores jobs in file or redis queues and runs them in separate worker processes.\n\nExample usage:\n  job-forge push log --data '{\"hello\":\"world\"}'\n  job-forge work --concurrency 4 --tries 3"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Queue connections file (YAML). Defaults to a file queue in ./storage/queue.
    #[arg(short, long, global = true, env = "JOB_FORGE_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the queue worker daemon.
    Work(WorkArgs),

    /// Push a job onto a queue.
    Push(PushArgs),

    /// Print the number of ready jobs in a queue.
    Size(QueueArgs),

    /// Remove every job from a queue.
    Clear(QueueArgs),

    /// Serve one task read from stdin (worker process mode).
    #[command(hide = true)]
    Exec,
}

/// Arguments for `job-forge work`. Unset options fall back to `QUEUE_*`
/// environment variables, then to defaults.
#[derive(Parser, Debug, Default)]
pub struct WorkArgs {
    /// Connection to pull from.
    #[arg(long)]
    pub connection: Option<String>,

    /// Queue to pull from.
    #[arg(short, long)]
    pub queue: Option<String>,

    /// Jobs run in parallel per batch.
    #[arg(short = 'j', long)]
    pub concurrency: Option<usize>,

    /// Attempts before a job is moved to the failed store.
    #[arg(long)]
    pub tries: Option<u32>,

    /// Seconds to sleep when the queue is empty.
    #[arg(long)]
    pub sleep: Option<u64>,

    /// Seconds a job may run before its process is killed.
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Memory ceiling in megabytes.
    #[arg(long)]
    pub memory: Option<u64>,

    /// Seconds after which the worker stops.
    #[arg(long)]
    pub max_runtime: Option<u64>,

    /// Seconds before a failed job is retried.
    #[arg(long)]
    pub backoff: Option<u64>,

    /// How worker processes are spawned (pipe, reexec).
    #[arg(long)]
    pub runtime: Option<RuntimeKind>,

    /// Worker program for the pipe runtime.
    #[arg(long)]
    pub worker_program: Option<PathBuf>,

    /// Exit once the queue is empty.
    #[arg(long)]
    pub stop_when_empty: bool,

    /// Exit after this many jobs.
    #[arg(long)]
    pub max_jobs: Option<u64>,
}

impl WorkArgs {
    /// Applies the flags that were given on top of `config`.
    pub fn apply(&self, mut config: WorkerConfig) -> WorkerConfig {
        if let Some(connection) = &self.connection {
            config.connection = Some(connection.clone());
        }
        if let Some(queue) = &self.queue {
            config.queue = Some(queue.clone());
        }
        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency;
        }
        if let Some(tries) = self.tries {
            config.max_tries = tries;
        }
        if let Some(secs) = self.sleep {
            config.sleep = Duration::from_secs(secs);
        }
        if let Some(secs) = self.timeout {
            config.timeout = Duration::from_secs(secs);
        }
        if let Some(mb) = self.memory {
            config.memory_limit_mb = mb;
        }
        if let Some(secs) = self.max_runtime {
            config.max_runtime = Duration::from_secs(secs);
        }
        if let Some(secs) = self.backoff {
            config.backoff = Duration::from_secs(secs);
        }
        if let Some(runtime) = self.runtime {
            config.runtime = runtime;
        }
        if let Some(program) = &self.worker_program {
            config.worker_program = Some(program.clone());
        }
        if self.stop_when_empty {
            config.stop_when_empty = true;
        }
        if let Some(max_jobs) = self.max_jobs {
            config.max_jobs = Some(max_jobs);
        }
        config
    }
}

/// Arguments for `job-forge push`.
#[derive(Parser, Debug)]
pub struct PushArgs {
    /// Job type, resolved to a handler by the worker.
    pub job: String,

    /// Job data as JSON.
    #[arg(short, long, default_value = "null")]
    pub data: String,

    /// Seconds before the job becomes available.
    #[arg(long)]
    pub delay: Option<u64>,

    #[command(flatten)]
    pub target: QueueArgs,
}

/// Queue selection shared by several subcommands.
#[derive(Parser, Debug, Default)]
pub struct QueueArgs {
    /// Connection name.
    #[arg(long)]
    pub connection: Option<String>,

    /// Queue name.
    #[arg(short, long)]
    pub queue: Option<String>,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments and the built-in job handlers.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    run_with_handlers(cli, default_handlers()).await
}

/// Run the CLI with application-provided job handlers.
///
/// The `work` command re-launches the current executable as its worker
/// processes, so the binary calling this must route `exec` here as well.
pub async fn run_with_handlers(cli: Cli, handlers: HandlerRegistry) -> anyhow::Result<()> {
    match cli.command {
        Commands::Exec => {
            let code = run_stdio(&registry_with_handlers(handlers)).await;
            if code != 0 {
                std::process::exit(code);
            }
            Ok(())
        }
        Commands::Work(args) => run_work_command(cli.config, args, handlers).await,
        Commands::Push(args) => run_push_command(cli.config, args).await,
        Commands::Size(args) => run_size_command(cli.config, args).await,
        Commands::Clear(args) => run_clear_command(cli.config, args).await,
    }
}

fn load_queue_config(path: Option<PathBuf>) -> anyhow::Result<QueueConfig> {
    match path {
        Some(path) => QueueConfig::from_file(&path)
            .with_context(|| format!("failed to load queue config {}", path.display())),
        None => Ok(QueueConfig::default()),
    }
}

async fn run_work_command(
    config_path: Option<PathBuf>,
    args: WorkArgs,
    handlers: HandlerRegistry,
) -> anyhow::Result<()> {
    let queue_config = load_queue_config(config_path)?;
    let worker_config = args.apply(WorkerConfig::from_env()?);
    worker_config.validate()?;

    if let Err(e) = init_metrics() {
        warn!(error = %e, "Failed to initialize metrics");
    }

    let manager = Arc::new(QueueManager::new(queue_config));
    let mut worker = QueueWorker::new(manager, worker_config, Arc::new(handlers))?;

    let shutdown = worker.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, finishing current batch");
            let _ = shutdown.send(());
        }
    });

    let reason = worker.run().await?;
    info!(reason = %reason, "Queue worker stopped");
    Ok(())
}

async fn run_push_command(config_path: Option<PathBuf>, args: PushArgs) -> anyhow::Result<()> {
    let data: Value = serde_json::from_str(&args.data).context("--data must be valid JSON")?;
    let manager = QueueManager::new(load_queue_config(config_path)?);
    let driver = manager.connection(args.target.connection.as_deref()).await?;
    let queue = args.target.queue.as_deref();

    let id = match args.delay {
        Some(secs) if secs > 0 => {
            driver
                .later(Duration::from_secs(secs), &args.job, data, queue)
                .await?
        }
        _ => driver.push(&args.job, data, queue).await?,
    };

    println!("{}", id);
    Ok(())
}

async fn run_size_command(config_path: Option<PathBuf>, args: QueueArgs) -> anyhow::Result<()> {
    let manager = QueueManager::new(load_queue_config(config_path)?);
    let driver = manager.connection(args.connection.as_deref()).await?;
    let size = driver.size(args.queue.as_deref()).await?;
    println!("{}", size);
    Ok(())
}

async fn run_clear_command(config_path: Option<PathBuf>, args: QueueArgs) -> anyhow::Result<()> {
    let manager = QueueManager::new(load_queue_config(config_path)?);
    let driver = manager.connection(args.connection.as_deref()).await?;
    let cleared = driver.clear(args.queue.as_deref()).await?;
    println!("Cleared {} jobs", cleared);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_work_command_defaults() {
        let cli = Cli::try_parse_from(["job-forge", "work"]).expect("should parse");
        assert_eq!(cli.log_level, "info");
        match cli.command {
            Commands::Work(args) => {
                assert!(args.concurrency.is_none());
                assert!(!args.stop_when_empty);
                let config = args.apply(WorkerConfig::default());
                assert_eq!(config.concurrency, 4);
                assert_eq!(config.max_tries, 3);
            }
            _ => panic!("Expected Work command"),
        }
    }

    #[test]
    fn test_work_command_with_options() {
        let cli = Cli::try_parse_from([
            "job-forge",
            "work",
            "--queue",
            "emails",
            "-j",
            "8",
            "--tries",
            "5",
            "--memory",
            "256",
            "--backoff",
            "0",
            "--runtime",
            "pipe",
            "--worker-program",
            "/usr/bin/job-forge",
            "--stop-when-empty",
            "--max-jobs",
            "10",
        ])
        .expect("should parse");

        match cli.command {
            Commands::Work(args) => {
                let config = args.apply(WorkerConfig::default());
                assert_eq!(config.queue.as_deref(), Some("emails"));
                assert_eq!(config.concurrency, 8);
                assert_eq!(config.max_tries, 5);
                assert_eq!(config.memory_limit_mb, 256);
                assert_eq!(config.backoff, Duration::ZERO);
                assert_eq!(config.runtime, RuntimeKind::Pipe);
                assert!(config.stop_when_empty);
                assert_eq!(config.max_jobs, Some(10));
                assert!(config.validate().is_ok());
            }
            _ => panic!("Expected Work command"),
        }
    }

    #[test]
    fn test_push_command() {
        let cli = Cli::try_parse_from([
            "job-forge",
            "--config",
            "queue.yaml",
            "push",
            "send_email",
            "--data",
            r#"{"to":"a@b.c"}"#,
            "--delay",
            "30",
            "-q",
            "mail",
        ])
        .expect("should parse");

        assert_eq!(cli.config, Some(PathBuf::from("queue.yaml")));
        match cli.command {
            Commands::Push(args) => {
                assert_eq!(args.job, "send_email");
                assert_eq!(args.delay, Some(30));
                assert_eq!(args.target.queue.as_deref(), Some("mail"));
                assert!(serde_json::from_str::<Value>(&args.data).is_ok());
            }
            _ => panic!("Expected Push command"),
        }
    }

    #[test]
    fn test_exec_is_hidden() {
        let help = Cli::command().render_help().to_string();
        assert!(!help.contains("exec"));
        assert!(matches!(
            Cli::try_parse_from(["job-forge", "exec"]).expect("parse").command,
            Commands::Exec
        ));
    }

    #[test]
    fn test_invalid_runtime_rejected() {
        assert!(Cli::try_parse_from(["job-forge", "work", "--runtime", "thread"]).is_err());
    }
}
