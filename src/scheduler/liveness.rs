//! Background worker liveness probing with a cached snapshot.
//!
//! One loop per process probes the fleet every `interval` and swaps in a
//! fresh [`WorkerSnapshot`]. Queries read the cached snapshot and never
//! trigger a probe.

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::queue::WorkerProbe;
use crate::error::QueueError;
use crate::metrics::MetricsCollector;

#[derive(Debug, Clone)]
pub struct LivenessConfig {
    /// Time between probe cycles.
    pub interval: Duration,
    /// How long each probe waits for replies.
    pub probe_timeout: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            probe_timeout: Duration::from_secs(3),
        }
    }
}

impl LivenessConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }
}

/// Responders of a single probe cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkerSnapshot {
    pub workers: BTreeSet<String>,
    /// When the cycle completed; `None` before the first cycle.
    pub refreshed_at: Option<DateTime<Utc>>,
}

/// Reply to a worker-count query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCount {
    pub count: usize,
    pub workers: Vec<String>,
}

impl From<&WorkerSnapshot> for WorkerCount {
    fn from(snapshot: &WorkerSnapshot) -> Self {
        Self {
            count: snapshot.workers.len(),
            workers: snapshot.workers.iter().cloned().collect(),
        }
    }
}

/// Periodic prober plus the cache it maintains.
#[derive(Clone)]
pub struct LivenessMonitor {
    probe: Arc<dyn WorkerProbe>,
    config: LivenessConfig,
    cache: Arc<RwLock<Arc<WorkerSnapshot>>>,
    metrics: MetricsCollector,
}

impl LivenessMonitor {
    /// Creates a monitor with an empty cache.
    pub fn new(probe: Arc<dyn WorkerProbe>, config: LivenessConfig) -> Self {
        Self {
            probe,
            config,
            cache: Arc::new(RwLock::new(Arc::new(WorkerSnapshot::default()))),
            metrics: MetricsCollector::new(),
        }
    }

    /// The latest cached snapshot.
    pub fn snapshot(&self) -> Arc<WorkerSnapshot> {
        let guard = self.cache.read().unwrap_or_else(|p| p.into_inner());
        Arc::clone(&guard)
    }

    /// `{count, workers}` from the latest snapshot.
    pub fn worker_count(&self) -> WorkerCount {
        WorkerCount::from(self.snapshot().as_ref())
    }

    /// Runs one probe cycle and replaces the cached snapshot.
    ///
    /// On error the previous snapshot is kept.
    pub async fn refresh(&self) -> Result<Arc<WorkerSnapshot>, QueueError> {
        let replies = self.probe.probe(self.config.probe_timeout).await?;
        let snapshot = Arc::new(WorkerSnapshot {
            workers: replies.into_iter().collect(),
            refreshed_at: Some(Utc::now()),
        });

        {
            let mut guard = self.cache.write().unwrap_or_else(|p| p.into_inner());
            *guard = Arc::clone(&snapshot);
        }
        self.metrics.set_live_workers(snapshot.workers.len());
        debug!(count = snapshot.workers.len(), "Worker snapshot refreshed");
        Ok(snapshot)
    }

    /// Probes every `interval` until `shutdown` fires.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            probe_timeout_ms = self.config.probe_timeout.as_millis() as u64,
            "Liveness monitor started"
        );
        let mut ticker = tokio::time::interval(self.config.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.refresh().await {
                        warn!(error = %e, "Worker liveness refresh failed");
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
        info!("Liveness monitor stopped");
    }

    /// Spawns [`LivenessMonitor::run`] on the current runtime.
    pub fn spawn(&self, shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(self.clone().run(shutdown))
    }
}
