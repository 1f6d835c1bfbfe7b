//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by dockq and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all dockq metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Tasks that reached a final state, labeled by status.
pub static TASKS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Container run time of one attempt, from start to exit.
pub static ATTEMPT_DURATION: OnceLock<Histogram> = OnceLock::new();

/// Pending envelopes per queue, as last inspected.
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Number of tasks currently held by this worker process.
pub static JOBS_IN_PROGRESS: OnceLock<Gauge> = OnceLock::new();

/// Workers that answered the latest liveness probe.
pub static LIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Callback deliveries, labeled by outcome.
pub static CALLBACKS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Container removals, labeled by outcome.
pub static CONTAINERS_REMOVED_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Calling it again keeps the first registry.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let tasks_total = CounterVec::new(
        Opts::new("dockq_tasks_total", "Tasks that reached a final state"),
        &["status"],
    )?;

    let attempt_duration = Histogram::with_opts(
        HistogramOpts::new(
            "dockq_attempt_duration_seconds",
            "Container run time of one attempt in seconds",
        )
        .buckets(vec![0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 3600.0]),
    )?;

    let queue_depth = GaugeVec::new(
        Opts::new("dockq_queue_depth", "Number of pending tasks in queue"),
        &["queue_name"],
    )?;

    let jobs_in_progress = Gauge::new(
        "dockq_jobs_in_progress",
        "Number of tasks currently being processed",
    )?;

    let live_workers = Gauge::new(
        "dockq_live_workers",
        "Workers that answered the latest liveness probe",
    )?;

    let callbacks_total = CounterVec::new(
        Opts::new("dockq_callbacks_total", "Callback delivery attempts"),
        &["outcome"],
    )?;

    let containers_removed_total = CounterVec::new(
        Opts::new("dockq_containers_removed_total", "Container removals"),
        &["outcome"],
    )?;

    registry.register(Box::new(tasks_total.clone()))?;
    registry.register(Box::new(attempt_duration.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(jobs_in_progress.clone()))?;
    registry.register(Box::new(live_workers.clone()))?;
    registry.register(Box::new(callbacks_total.clone()))?;
    registry.register(Box::new(containers_removed_total.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = TASKS_TOTAL.set(tasks_total);
    let _ = ATTEMPT_DURATION.set(attempt_duration);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = JOBS_IN_PROGRESS.set(jobs_in_progress);
    let _ = LIVE_WORKERS.set(live_workers);
    let _ = CALLBACKS_TOTAL.set(callbacks_total);
    let _ = CONTAINERS_REMOVED_TOTAL.set(containers_removed_total);

    tracing::debug!("Prometheus metrics initialized");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// If the registry has not been initialized or encoding fails, the returned
/// text is a single comment line describing the problem.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
