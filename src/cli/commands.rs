//! CLI command definitions for dockq.
//!
//! Each subcommand maps onto one client or worker operation. Results are
//! printed to stdout as JSON.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{error, info};

use crate::execution::{ContainerExecutor, DockerClient, RuntimeOptions};
use crate::metrics::{init_metrics, serve_metrics, METRICS_PATH};
use crate::scheduler::job::{DEFAULT_MAX_RETRIES, DEFAULT_QUEUE, DEFAULT_RETRY_DELAY_SECS};
use crate::scheduler::{
    CallbackConfig, CallbackDispatcher, LivenessConfig, LivenessMonitor, QueueDepthInspector,
    RedisBroker, RedisBrokerConfig, RetryController, TaskGateway, TaskSubmission, WorkerPool,
    WorkerPoolConfig,
};

/// Default Redis URL for broker and result store.
const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// Where `dockq metrics` scrapes a local worker by default.
const DEFAULT_METRICS_URL: &str = "http://127.0.0.1:9100/metrics";

/// Sandboxed command execution in Docker containers, driven by a Redis queue.
#[derive(Parser)]
#[command(name = "dockq")]
#[command(about = "Run shell commands in throwaway Docker containers through a task queue")]
#[command(version)]
#[command(
    long_about = "dockq queues commands for execution inside throwaway Docker containers.\n\nWorkers pull tasks from Redis, run each attempt in a fresh container, retry failures with a delay, and POST results to an optional callback URL.\n\nExample usage:\n  dockq worker --concurrency 4 --queues celery\n  dockq submit --image python:3.13-slim -- python -c 'print(42)'"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run a worker process that executes queued tasks.
    Worker(WorkerArgs),

    /// Submit a task and print its id.
    Submit(SubmitArgs),

    /// Show a task's status and, once finished, its result.
    Status(TaskIdArgs),

    /// Drop a task that has not started yet.
    #[command(alias = "delete")]
    Forget(TaskIdArgs),

    /// Print the number of pending tasks per queue.
    Queues(QueuesArgs),

    /// Probe the worker fleet and print the responsive workers.
    Workers(WorkersArgs),

    /// Scrape a running worker's Prometheus metrics and print them.
    Metrics(MetricsArgs),
}

/// Broker connection flags shared by every networked command.
#[derive(clap::Args, Debug, Clone)]
pub struct BrokerArgs {
    /// Redis URL used as broker and result store.
    #[arg(long, env = "DOCKQ_REDIS_URL", default_value = DEFAULT_REDIS_URL)]
    pub redis_url: String,

    /// Prefix for result, revocation and control keys.
    #[arg(long, env = "DOCKQ_KEY_PREFIX", default_value = "dockq")]
    pub key_prefix: String,

    /// Seconds task records are kept.
    #[arg(long, env = "DOCKQ_RESULT_TTL", default_value = "86400")]
    pub result_ttl: u64,
}

impl BrokerArgs {
    fn config(&self) -> RedisBrokerConfig {
        RedisBrokerConfig::new(&self.redis_url)
            .with_key_prefix(&self.key_prefix)
            .with_result_ttl(Duration::from_secs(self.result_ttl))
    }

    async fn connect(&self) -> anyhow::Result<Arc<RedisBroker>> {
        let broker = RedisBroker::connect(self.config())
            .await
            .with_context(|| format!("connecting to {}", self.redis_url))?;
        Ok(Arc::new(broker))
    }
}

/// Arguments for the worker command.
#[derive(clap::Args, Debug)]
pub struct WorkerArgs {
    #[command(flatten)]
    pub broker: BrokerArgs,

    /// Worker loops per queue.
    #[arg(short = 'c', long, env = "DOCKQ_CONCURRENCY", default_value = "4")]
    pub concurrency: usize,

    /// Queues to consume (comma-separated).
    #[arg(
        short = 'Q',
        long,
        env = "DOCKQ_QUEUES",
        value_delimiter = ',',
        default_value = DEFAULT_QUEUE
    )]
    pub queues: Vec<String>,

    /// Name to answer liveness probes with (default: dockq@$HOSTNAME).
    #[arg(long, env = "DOCKQ_NODE_NAME")]
    pub node_name: Option<String>,

    /// Proxy-fetch endpoint for tasks that set none.
    #[arg(long, env = "DOCKQ_PROXY_FETCH_URL")]
    pub proxy_fetch_url: Option<String>,

    /// Attempt time limit in seconds for tasks that set none.
    #[arg(long, env = "DOCKQ_MAX_EXECUTION_TIME", default_value = "3600")]
    pub max_execution_time: u64,

    /// Callback request timeout in seconds.
    #[arg(long, env = "DOCKQ_CALLBACK_TIMEOUT", default_value = "6")]
    pub callback_timeout: u64,

    /// Seconds to wait for running tasks on shutdown.
    #[arg(long, default_value = "60")]
    pub shutdown_timeout: u64,

    /// Seconds this worker's lease on its in-flight tasks survives without
    /// renewal. Tasks held by a worker silent for longer are requeued.
    #[arg(long, env = "DOCKQ_LEASE_TTL", default_value = "30")]
    pub lease_ttl: u64,

    /// Address to serve Prometheus metrics on (e.g. 0.0.0.0:9100).
    #[arg(long, env = "DOCKQ_METRICS_ADDR")]
    pub metrics_addr: Option<SocketAddr>,
}

/// Arguments for the metrics command.
#[derive(clap::Args, Debug)]
pub struct MetricsArgs {
    /// Metrics endpoint of a running worker.
    #[arg(long, env = "DOCKQ_METRICS_URL", default_value = DEFAULT_METRICS_URL)]
    pub url: String,
}

/// Arguments for the submit command.
#[derive(clap::Args, Debug)]
pub struct SubmitArgs {
    #[command(flatten)]
    pub broker: BrokerArgs,

    /// Docker image to run.
    #[arg(short, long)]
    pub image: String,

    /// Container options as JSON, e.g. '{"shm_size": "2g", "env": {"A": "1"}}'.
    #[arg(long)]
    pub options: Option<String>,

    /// Proxy-fetch endpoint for this task.
    #[arg(long)]
    pub proxy: Option<String>,

    /// Queue to submit to.
    #[arg(short = 'q', long, default_value = DEFAULT_QUEUE)]
    pub queue: String,

    /// Retries after the first attempt.
    #[arg(long, default_value_t = DEFAULT_MAX_RETRIES)]
    pub max_retries: u32,

    /// Seconds between attempts.
    #[arg(long, default_value_t = DEFAULT_RETRY_DELAY_SECS)]
    pub retry_delay: u64,

    /// Seconds before the first attempt may start.
    #[arg(long)]
    pub countdown: Option<u64>,

    /// Seconds after which an unstarted task is discarded.
    #[arg(long)]
    pub expires: Option<u64>,

    /// Attempt time limit in seconds.
    #[arg(long)]
    pub max_execution_time: Option<u64>,

    /// URL to POST the result to.
    #[arg(long)]
    pub callback: Option<String>,

    /// Command and arguments to run, after `--`.
    #[arg(last = true, required = true)]
    pub command: Vec<String>,
}

impl SubmitArgs {
    fn to_submission(&self) -> anyhow::Result<TaskSubmission> {
        let options: RuntimeOptions = match &self.options {
            Some(raw) => serde_json::from_str(raw).context("parsing --options JSON")?,
            None => RuntimeOptions::default(),
        };

        Ok(TaskSubmission {
            image: self.image.clone(),
            command: self.command.clone(),
            container_options: options,
            proxy: self.proxy.clone(),
            max_retries: self.max_retries,
            retry_delay: self.retry_delay,
            queue: self.queue.clone(),
            countdown: self.countdown,
            expires: self.expires,
            max_execution_time: self.max_execution_time,
            callback: self.callback.clone(),
        })
    }
}

#[derive(clap::Args, Debug)]
pub struct TaskIdArgs {
    #[command(flatten)]
    pub broker: BrokerArgs,

    /// Task id returned by submit.
    pub task_id: String,
}

#[derive(clap::Args, Debug)]
pub struct QueuesArgs {
    #[command(flatten)]
    pub broker: BrokerArgs,

    /// Queue names to inspect.
    #[arg(required = true)]
    pub names: Vec<String>,
}

#[derive(clap::Args, Debug)]
pub struct WorkersArgs {
    #[command(flatten)]
    pub broker: BrokerArgs,

    /// Seconds to wait for probe replies.
    #[arg(long, env = "DOCKQ_PROBE_TIMEOUT", default_value = "3")]
    pub timeout: u64,

    /// Keep probing every `--interval` seconds.
    #[arg(short, long)]
    pub watch: bool,

    /// Seconds between probes in watch mode.
    #[arg(long, env = "DOCKQ_LIVENESS_INTERVAL", default_value = "60")]
    pub interval: u64,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Worker(args) => run_worker_command(args).await,
        Commands::Submit(args) => run_submit_command(args).await,
        Commands::Status(args) => run_status_command(args).await,
        Commands::Forget(args) => run_forget_command(args).await,
        Commands::Queues(args) => run_queues_command(args).await,
        Commands::Workers(args) => run_workers_command(args).await,
        Commands::Metrics(args) => run_metrics_command(args).await,
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ============================================================================
// Worker
// ============================================================================

async fn run_worker_command(args: WorkerArgs) -> anyhow::Result<()> {
    init_metrics()?;

    let broker = args.broker.connect().await?;
    let docker = DockerClient::new().context("connecting to the Docker daemon")?;
    let executor = Arc::new(ContainerExecutor::new(Arc::new(docker)));
    let controller = Arc::new(
        RetryController::new(executor)
            .with_default_timeout(Duration::from_secs(args.max_execution_time)),
    );
    let callbacks = CallbackDispatcher::new(
        CallbackConfig::default().with_timeout(Duration::from_secs(args.callback_timeout)),
    );

    let mut config = WorkerPoolConfig::new(args.concurrency)
        .with_queues(args.queues)
        .with_proxy_fetch_url(args.proxy_fetch_url)
        .with_lease_ttl(Duration::from_secs(args.lease_ttl.max(1)))
        .with_shutdown_timeout(Duration::from_secs(args.shutdown_timeout));
    if let Some(name) = args.node_name {
        config = config.with_node_name(name);
    }

    let metrics_server = match args.metrics_addr {
        Some(addr) => {
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("binding metrics endpoint {addr}"))?;
            let (stop_tx, stop_rx) = oneshot::channel::<()>();
            let handle = tokio::spawn(async move {
                let stopped = async move {
                    let _ = stop_rx.await;
                };
                if let Err(e) = serve_metrics(listener, stopped).await {
                    error!(error = %e, "Metrics endpoint stopped");
                }
            });
            Some((stop_tx, handle))
        }
        None => None,
    };

    let mut pool = WorkerPool::new(config, broker.clone(), controller)
        .with_probe(broker)
        .with_callbacks(callbacks);
    pool.start().await?;

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutdown signal received");

    let stopped = pool.shutdown().await;
    if let Some((stop_tx, handle)) = metrics_server {
        let _ = stop_tx.send(());
        let _ = handle.await;
    }
    stopped?;
    let stats = pool.stats();
    info!(
        succeeded = stats.tasks_succeeded,
        failed = stats.tasks_failed,
        retried = stats.tasks_retried,
        revoked = stats.tasks_revoked,
        "Worker stopped"
    );
    Ok(())
}

// ============================================================================
// Client commands
// ============================================================================

async fn run_metrics_command(args: MetricsArgs) -> anyhow::Result<()> {
    let response = reqwest::get(&args.url)
        .await
        .with_context(|| format!("scraping {}", args.url))?;
    let status = response.status();
    if !status.is_success() {
        anyhow::bail!(
            "{} answered {status}; is a worker running with --metrics-addr (path {METRICS_PATH})?",
            args.url
        );
    }
    print!("{}", response.text().await?);
    Ok(())
}

#[derive(Serialize)]
struct SubmitOutput {
    task_id: String,
}

async fn run_submit_command(args: SubmitArgs) -> anyhow::Result<()> {
    let submission = args.to_submission()?;
    let gateway = TaskGateway::new(args.broker.connect().await?);
    let task_id = gateway.submit(submission).await?;
    print_json(&SubmitOutput { task_id })
}

async fn run_status_command(args: TaskIdArgs) -> anyhow::Result<()> {
    let gateway = TaskGateway::new(args.broker.connect().await?);
    let view = gateway.status(&args.task_id).await?;
    print_json(&view)
}

#[derive(Serialize)]
struct ForgetOutput {
    task_id: String,
    message: String,
}

async fn run_forget_command(args: TaskIdArgs) -> anyhow::Result<()> {
    let gateway = TaskGateway::new(args.broker.connect().await?);
    gateway.forget(&args.task_id).await?;
    print_json(&ForgetOutput {
        message: format!("Task {} forgotten", args.task_id),
        task_id: args.task_id,
    })
}

async fn run_queues_command(args: QueuesArgs) -> anyhow::Result<()> {
    init_metrics()?;
    let inspector = QueueDepthInspector::new(args.broker.connect().await?);
    let depths = inspector.inspect(&args.names).await?;
    print_json(&depths)
}

async fn run_workers_command(args: WorkersArgs) -> anyhow::Result<()> {
    init_metrics()?;
    let broker = args.broker.connect().await?;
    let config = LivenessConfig::default()
        .with_interval(Duration::from_secs(args.interval.max(1)))
        .with_probe_timeout(Duration::from_secs(args.timeout));
    let monitor = LivenessMonitor::new(broker, config.clone());

    if !args.watch {
        monitor.refresh().await?;
        return print_json(&monitor.worker_count());
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
    let handle = monitor.spawn(shutdown_rx);

    // Print each snapshot once its probe window has closed
    tokio::time::sleep(config.probe_timeout).await;
    let mut ticker = tokio::time::interval(config.interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                tokio::time::sleep(Duration::from_millis(100)).await;
                print_json(&monitor.worker_count())?;
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    let _ = shutdown_tx.send(());
    let _ = handle.await;
    Ok(())
}
