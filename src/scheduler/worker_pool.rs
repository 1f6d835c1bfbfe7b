//! Worker pool for processing task envelopes from the broker.
//!
//! Each worker runs as an independent async task pulling from one queue.
//! Alongside the workers the pool runs a promotion loop for delayed
//! envelopes, a lease loop that keeps this pool's deliveries its own and,
//! when a probe is configured, a liveness responder.
//!
//! # Features
//!
//! - Configurable number of workers per queue
//! - Graceful shutdown with broadcast channel
//! - Recovery of envelopes held by pools whose lease lapsed
//! - Delayed retries through the broker instead of in-process sleeps
//! - Callback deliveries tracked and drained on shutdown
//! - Pool statistics tracking

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::Utc;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::callback::CallbackDispatcher;
use super::job::{ResultPayload, TaskEnvelope, TaskRecord, TaskStatus, DEFAULT_QUEUE};
use super::queue::{TaskBroker, WorkerProbe};
use super::retry::{RetryController, RetryDecision};
use crate::error::QueueError;
use crate::metrics::MetricsCollector;

/// Default lifetime of a pool's lease; renewed every third of it.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(30);

/// Tries made to hand a retry back to the broker before giving up.
const SCHEDULE_RETRY_ATTEMPTS: u32 = 3;

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Broker error: {0}")]
    Queue(#[from] QueueError),

    #[error("Pool is already running")]
    AlreadyRunning,

    #[error("Pool is not running")]
    NotRunning,

    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker tasks to spawn for each queue.
    pub num_workers: usize,
    /// Queues this process consumes.
    pub queues: Vec<String>,
    /// Name this process answers liveness probes with.
    pub node_name: String,
    /// How long one dequeue waits before checking for shutdown.
    pub poll_interval: Duration,
    /// How often delayed envelopes are checked for promotion.
    pub promote_interval: Duration,
    /// How long the pool's lease outlives its last renewal.
    pub lease_ttl: Duration,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,
    /// Proxy-fetch endpoint for submissions that set none.
    pub proxy_fetch_url: Option<String>,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 4,
            queues: vec![DEFAULT_QUEUE.to_string()],
            node_name: default_node_name(),
            poll_interval: Duration::from_secs(1),
            promote_interval: Duration::from_secs(1),
            lease_ttl: DEFAULT_LEASE_TTL,
            shutdown_timeout: Duration::from_secs(60),
            proxy_fetch_url: None,
        }
    }
}

/// `dockq@<hostname>`, falling back to `localhost`.
pub fn default_node_name() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| "localhost".to_string());
    format!("dockq@{}", host.trim())
}

impl WorkerPoolConfig {
    /// Creates a new configuration with the specified number of workers.
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Default::default()
        }
    }

    pub fn with_queues<I, S>(mut self, queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.queues = queues.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_node_name(mut self, name: impl Into<String>) -> Self {
        self.node_name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_promote_interval(mut self, interval: Duration) -> Self {
        self.promote_interval = interval;
        self
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_proxy_fetch_url(mut self, url: Option<String>) -> Self {
        self.proxy_fetch_url = url;
        self
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total number of workers in the pool.
    pub num_workers: usize,
    /// Number of workers currently running an attempt.
    pub active_workers: usize,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    pub tasks_retried: u64,
    pub tasks_revoked: u64,
    /// Average wall-clock time per processed envelope.
    pub average_task_duration: Duration,
}

impl PoolStats {
    /// Returns the number of tasks that reached SUCCESS or FAILURE.
    pub fn total_finished(&self) -> u64 {
        self.tasks_succeeded + self.tasks_failed
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_finished();
        if total == 0 {
            return 0.0;
        }
        (self.tasks_succeeded as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
struct SharedPoolStats {
    tasks_succeeded: AtomicU64,
    tasks_failed: AtomicU64,
    tasks_retried: AtomicU64,
    tasks_revoked: AtomicU64,
    total_duration_ms: AtomicU64,
    processed: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    fn new() -> Self {
        Self {
            tasks_succeeded: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            tasks_retried: AtomicU64::new(0),
            tasks_revoked: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            active_workers: AtomicU64::new(0),
        }
    }

    fn record(&self, status: TaskStatus, duration: Duration) {
        let counter = match status {
            TaskStatus::Success => &self.tasks_succeeded,
            TaskStatus::Failure => &self.tasks_failed,
            TaskStatus::Retry => &self.tasks_retried,
            TaskStatus::Revoked => &self.tasks_revoked,
            _ => return,
        };
        counter.fetch_add(1, Ordering::SeqCst);
        self.processed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn increment_active(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement_active(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        let processed = self.processed.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);

        let average_duration = if processed > 0 {
            Duration::from_millis(total_duration_ms / processed)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers,
            active_workers: self.active_workers.load(Ordering::SeqCst) as usize,
            tasks_succeeded: self.tasks_succeeded.load(Ordering::SeqCst),
            tasks_failed: self.tasks_failed.load(Ordering::SeqCst),
            tasks_retried: self.tasks_retried.load(Ordering::SeqCst),
            tasks_revoked: self.tasks_revoked.load(Ordering::SeqCst),
            average_task_duration: average_duration,
        }
    }
}

/// Callback deliveries still in flight, shared by every worker of a pool.
type PendingCallbacks = Arc<Mutex<JoinSet<()>>>;

fn lock_pending(pending: &PendingCallbacks) -> MutexGuard<'_, JoinSet<()>> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Worker pool that manages workers pulling from the broker.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    /// Identifies this pool's deliveries and lease in the broker.
    consumer: String,
    broker: Arc<dyn TaskBroker>,
    probe: Option<Arc<dyn WorkerProbe>>,
    controller: Arc<RetryController>,
    callbacks: CallbackDispatcher,
    pending_callbacks: PendingCallbacks,
    shutdown_tx: broadcast::Sender<()>,
    handles: Vec<JoinHandle<()>>,
    stats: Arc<SharedPoolStats>,
    is_running: AtomicBool,
}

impl WorkerPool {
    /// Creates a pool over an existing broker and retry controller.
    pub fn new(
        config: WorkerPoolConfig,
        broker: Arc<dyn TaskBroker>,
        controller: Arc<RetryController>,
    ) -> Self {
        // Buffer size of 1 is sufficient since we only send once
        let (shutdown_tx, _) = broadcast::channel(1);
        let consumer = format!("{}:{}", config.node_name, Uuid::new_v4().simple());

        Self {
            config,
            consumer,
            broker,
            probe: None,
            controller,
            callbacks: CallbackDispatcher::default(),
            pending_callbacks: Arc::new(Mutex::new(JoinSet::new())),
            shutdown_tx,
            handles: Vec::new(),
            stats: Arc::new(SharedPoolStats::new()),
            is_running: AtomicBool::new(false),
        }
    }

    /// Answers liveness probes through `probe` while running.
    pub fn with_probe(mut self, probe: Arc<dyn WorkerProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn with_callbacks(mut self, callbacks: CallbackDispatcher) -> Self {
        self.callbacks = callbacks;
        self
    }

    /// Broker-side identity of this pool.
    pub fn consumer_id(&self) -> &str {
        &self.consumer
    }

    /// Takes the lease, then starts workers, the promotion and lease loops
    /// and the liveness responder.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if the pool is already running,
    /// or `PoolError::Queue` if the first lease cannot be taken.
    pub async fn start(&mut self) -> Result<(), PoolError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }

        self.broker
            .renew_lease(&self.consumer, &self.config.queues, self.config.lease_ttl)
            .await?;

        // Recover envelopes stranded by pools that are gone
        for queue in &self.config.queues {
            if let Err(e) = self.broker.recover_orphans(queue).await {
                warn!(queue = %queue, error = %e, "Failed to recover stranded envelopes");
            }
        }

        for queue in &self.config.queues {
            for i in 0..self.config.num_workers {
                let worker = Worker {
                    id: format!("worker-{}-{}", queue, i),
                    queue: queue.clone(),
                    consumer: self.consumer.clone(),
                    broker: Arc::clone(&self.broker),
                    controller: Arc::clone(&self.controller),
                    callbacks: self.callbacks.clone(),
                    pending_callbacks: Arc::clone(&self.pending_callbacks),
                    shutdown_rx: self.shutdown_tx.subscribe(),
                    poll_interval: self.config.poll_interval,
                    proxy_fetch_url: self.config.proxy_fetch_url.clone(),
                    stats: Arc::clone(&self.stats),
                    metrics: MetricsCollector::new(),
                };
                self.handles.push(tokio::spawn(worker.run()));
            }
        }

        self.handles.push(tokio::spawn(promote_loop(
            Arc::clone(&self.broker),
            self.config.queues.clone(),
            self.config.promote_interval,
            self.shutdown_tx.subscribe(),
        )));

        self.handles.push(tokio::spawn(lease_loop(
            Arc::clone(&self.broker),
            self.consumer.clone(),
            self.config.queues.clone(),
            self.config.lease_ttl,
            self.shutdown_tx.subscribe(),
        )));

        if let Some(probe) = &self.probe {
            let probe = Arc::clone(probe);
            let node_name = self.config.node_name.clone();
            let shutdown_rx = self.shutdown_tx.subscribe();
            self.handles.push(tokio::spawn(async move {
                if let Err(e) = probe.serve(&node_name, shutdown_rx).await {
                    error!(node = %node_name, error = %e, "Liveness responder stopped");
                }
            }));
        }

        self.is_running.store(true, Ordering::SeqCst);
        info!(
            num_workers = self.config.num_workers,
            queues = ?self.config.queues,
            node = %self.config.node_name,
            consumer = %self.consumer,
            "Worker pool started"
        );

        Ok(())
    }

    /// Gracefully shuts down all workers.
    ///
    /// Workers finish the envelope they hold and pending callbacks are
    /// delivered before the lease is released.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::ShutdownTimeout` if that does not finish within
    /// the configured timeout.
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!("Initiating worker pool shutdown");

        // Ignore send error - workers may have already stopped
        let _ = self.shutdown_tx.send(());

        let handles: Vec<_> = self.handles.drain(..).collect();
        let broker = Arc::clone(&self.broker);
        let consumer = self.consumer.clone();
        let pending_callbacks = Arc::clone(&self.pending_callbacks);
        let shutdown_future = async move {
            for handle in handles {
                if let Err(e) = handle.await {
                    error!(error = %e, "Worker task panicked during shutdown");
                }
            }

            // Taken only after the workers stop, so no delivery is missed
            let mut pending = std::mem::take(&mut *lock_pending(&pending_callbacks));
            if !pending.is_empty() {
                info!(pending = pending.len(), "Waiting for callback deliveries");
            }
            while let Some(joined) = pending.join_next().await {
                if let Err(e) = joined {
                    error!(error = %e, "Callback delivery panicked");
                }
            }

            if let Err(e) = broker.release_lease(&consumer).await {
                warn!(consumer = %consumer, error = %e, "Failed to release lease");
            }
        };

        let outcome = tokio::time::timeout(self.config.shutdown_timeout, shutdown_future).await;
        self.is_running.store(false, Ordering::SeqCst);
        match outcome {
            Ok(()) => {
                info!("Worker pool shutdown complete");
                Ok(())
            }
            Err(_) => Err(PoolError::ShutdownTimeout(self.config.shutdown_timeout)),
        }
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats
            .to_pool_stats(self.config.num_workers * self.config.queues.len())
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }
}

/// Moves due delayed envelopes onto their queues until shutdown.
async fn promote_loop(
    broker: Arc<dyn TaskBroker>,
    queues: Vec<String>,
    interval: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for queue in &queues {
                    match broker.promote_due(queue, Utc::now()).await {
                        Ok(0) => {}
                        Ok(n) => debug!(queue = %queue, promoted = n, "Promoted delayed envelopes"),
                        Err(e) => warn!(queue = %queue, error = %e, "Failed to promote delayed envelopes"),
                    }
                }
            }
            _ = shutdown_rx.recv() => break,
        }
    }
}

/// Renews the pool's lease and recovers lapsed consumers until shutdown.
async fn lease_loop(
    broker: Arc<dyn TaskBroker>,
    consumer: String,
    queues: Vec<String>,
    ttl: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval((ttl / 3).max(Duration::from_millis(10)));
    // The first tick fires at once; start() has just renewed
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = broker.renew_lease(&consumer, &queues, ttl).await {
                    warn!(consumer = %consumer, error = %e, "Failed to renew lease");
                    continue;
                }
                for queue in &queues {
                    if let Err(e) = broker.recover_orphans(queue).await {
                        warn!(queue = %queue, error = %e, "Failed to recover stranded envelopes");
                    }
                }
            }
            _ = shutdown_rx.recv() => break,
        }
    }
}

/// A single worker that processes envelopes from one queue.
struct Worker {
    id: String,
    queue: String,
    consumer: String,
    broker: Arc<dyn TaskBroker>,
    controller: Arc<RetryController>,
    callbacks: CallbackDispatcher,
    pending_callbacks: PendingCallbacks,
    shutdown_rx: broadcast::Receiver<()>,
    poll_interval: Duration,
    proxy_fetch_url: Option<String>,
    stats: Arc<SharedPoolStats>,
    metrics: MetricsCollector,
}

impl Worker {
    /// Main worker loop.
    ///
    /// Continuously polls for envelopes and processes them until a shutdown
    /// signal is received.
    async fn run(mut self) {
        info!(worker_id = %self.id, queue = %self.queue, "Worker started");

        loop {
            match self.shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                    info!(worker_id = %self.id, "Worker received shutdown signal");
                    break;
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            match self
                .broker
                .dequeue(&self.queue, &self.consumer, self.poll_interval)
                .await
            {
                Ok(Some(envelope)) => self.process(envelope).await,
                Ok(None) => {
                    debug!(worker_id = %self.id, "No tasks available");
                }
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "Failed to dequeue task");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }

    /// Processes a single envelope.
    async fn process(&self, mut envelope: TaskEnvelope) {
        let started = Instant::now();
        let task_id = envelope.id.clone();
        let attempt = envelope.attempt();

        if self.should_discard(&envelope).await {
            self.discard(&envelope, started).await;
            return;
        }
        if self.already_finished(&envelope).await {
            info!(worker_id = %self.id, task_id = %task_id, "Dropping delivery of finished task");
            self.ack(&envelope).await;
            return;
        }

        info!(
            worker_id = %self.id,
            task_id = %task_id,
            attempt,
            image = %envelope.submission.image,
            "Processing task"
        );
        self.store(TaskRecord::in_flight(&task_id, TaskStatus::Received, attempt))
            .await;

        // STARTED is only written if no forget has landed, as one step
        let started_record = TaskRecord::in_flight(&task_id, TaskStatus::Started, attempt);
        match self.broker.mark_started(&started_record).await {
            Ok(true) => {}
            Ok(false) => {
                self.discard(&envelope, started).await;
                return;
            }
            Err(e) => {
                error!(worker_id = %self.id, task_id = %task_id, error = %e, "Failed to mark task started");
            }
        }

        if envelope.submission.proxy.is_none() {
            envelope.submission.proxy = self.proxy_fetch_url.clone();
        }

        self.stats.increment_active();
        self.metrics.job_started();
        let decision = self.controller.run_attempt(&envelope).await;
        self.metrics.job_finished();
        self.stats.decrement_active();

        match decision {
            RetryDecision::RetryAfter { delay, error } => {
                self.store(TaskRecord::retrying(&task_id, attempt, error)).await;
                let next = envelope.next_attempt(delay, Utc::now());
                self.schedule_retry(&next).await;
                self.stats.record(TaskStatus::Retry, started.elapsed());
            }
            RetryDecision::Complete(payload) => {
                let status = payload.status();
                self.store(TaskRecord::terminal(&task_id, payload.clone()))
                    .await;
                self.ack(&envelope).await;
                self.metrics.record_task(status.as_str());
                self.stats.record(status, started.elapsed());
                self.notify(task_id, payload);
            }
        }
    }

    async fn should_discard(&self, envelope: &TaskEnvelope) -> bool {
        if envelope.is_expired(Utc::now()) {
            return true;
        }
        match self.broker.is_revoked(&envelope.id).await {
            Ok(revoked) => revoked,
            Err(e) => {
                warn!(task_id = %envelope.id, error = %e, "Revocation check failed");
                false
            }
        }
    }

    /// A recovered delivery whose task already reached SUCCESS or FAILURE.
    async fn already_finished(&self, envelope: &TaskEnvelope) -> bool {
        match self.broker.load_record(&envelope.id).await {
            Ok(record) => record.is_some_and(|r| r.status.is_terminal()),
            Err(e) => {
                warn!(task_id = %envelope.id, error = %e, "Record lookup failed");
                false
            }
        }
    }

    async fn discard(&self, envelope: &TaskEnvelope, started: Instant) {
        info!(
            worker_id = %self.id,
            task_id = %envelope.id,
            expired = envelope.is_expired(Utc::now()),
            "Discarding revoked task"
        );
        self.store(TaskRecord::in_flight(
            &envelope.id,
            TaskStatus::Revoked,
            envelope.attempt(),
        ))
        .await;
        self.ack(envelope).await;
        self.metrics.record_task(TaskStatus::Revoked.as_str());
        self.stats.record(TaskStatus::Revoked, started.elapsed());
    }

    async fn store(&self, record: TaskRecord) {
        if let Err(e) = self.broker.store_record(&record).await {
            error!(
                worker_id = %self.id,
                task_id = %record.task_id,
                status = %record.status,
                error = %e,
                "Failed to store task record"
            );
        }
    }

    async fn ack(&self, envelope: &TaskEnvelope) {
        if let Err(e) = self.broker.ack(envelope, &self.consumer).await {
            error!(worker_id = %self.id, task_id = %envelope.id, error = %e, "Failed to ack task");
        }
    }

    /// Hands the next attempt to the broker. Until that succeeds the current
    /// delivery stays in this pool's processing list, so a failure here
    /// leaves the task recoverable once the lease is released.
    async fn schedule_retry(&self, next: &TaskEnvelope) {
        let mut tries = 0;
        loop {
            tries += 1;
            match self.broker.schedule_retry(next, &self.consumer).await {
                Ok(()) => return,
                Err(e) if tries < SCHEDULE_RETRY_ATTEMPTS => {
                    warn!(worker_id = %self.id, task_id = %next.id, tries, error = %e, "Retry scheduling failed, trying again");
                    tokio::time::sleep(self.poll_interval).await;
                }
                Err(e) => {
                    error!(
                        worker_id = %self.id,
                        task_id = %next.id,
                        error = %e,
                        "Failed to schedule retry, delivery stays held"
                    );
                    return;
                }
            }
        }
    }

    /// Fires the callback without holding the worker. The delivery is
    /// tracked so shutdown can wait for it.
    fn notify(&self, task_id: String, payload: ResultPayload) {
        if payload.callback.is_none() {
            return;
        }
        let callbacks = self.callbacks.clone();
        let mut pending = lock_pending(&self.pending_callbacks);
        while pending.try_join_next().is_some() {}
        pending.spawn(async move {
            callbacks.dispatch(&task_id, &payload).await;
        });
    }
}
