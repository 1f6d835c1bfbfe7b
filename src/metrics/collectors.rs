//! Recording helpers over the raw Prometheus metrics.
//!
//! `MetricsCollector` is a zero-sized handle passed to every component that
//! records something. Before `init_metrics()` runs, every method is a no-op,
//! so library code and tests can record freely.

use std::time::Duration;

use super::prometheus::{
    ATTEMPT_DURATION, CALLBACKS_TOTAL, CONTAINERS_REMOVED_TOTAL, JOBS_IN_PROGRESS, LIVE_WORKERS,
    QUEUE_DEPTH, TASKS_TOTAL,
};

/// Metrics collector for recording dockq operational metrics.
///
/// # Example
///
/// ```ignore
/// use dockq::metrics::{init_metrics, MetricsCollector};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
/// collector.record_task("SUCCESS");
/// collector.set_queue_depth("celery", 12);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Counts a task reaching a final state (`SUCCESS`, `FAILURE`, `REVOKED`).
    pub fn record_task(&self, status: &str) {
        if let Some(tasks_total) = TASKS_TOTAL.get() {
            tasks_total.with_label_values(&[status]).inc();
        }

        tracing::trace!(status = status, "Recorded task metric");
    }

    /// Observes how long one container ran.
    pub fn record_attempt_duration(&self, duration: Duration) {
        if let Some(histogram) = ATTEMPT_DURATION.get() {
            histogram.observe(duration.as_secs_f64());
        }
    }

    /// Sets the pending count of a queue.
    pub fn set_queue_depth(&self, queue_name: &str, depth: u64) {
        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            queue_depth
                .with_label_values(&[queue_name])
                .set(depth as f64);
        }
    }

    /// Marks a task as picked up by this process.
    pub fn job_started(&self) {
        if let Some(gauge) = JOBS_IN_PROGRESS.get() {
            gauge.inc();
        }
    }

    /// Marks a task as released by this process.
    pub fn job_finished(&self) {
        if let Some(gauge) = JOBS_IN_PROGRESS.get() {
            gauge.dec();
        }
    }

    pub fn set_live_workers(&self, count: usize) {
        if let Some(gauge) = LIVE_WORKERS.get() {
            gauge.set(count as f64);
        }
    }

    pub fn record_callback(&self, delivered: bool) {
        let outcome = if delivered { "delivered" } else { "failed" };
        if let Some(counter) = CALLBACKS_TOTAL.get() {
            counter.with_label_values(&[outcome]).inc();
        }
    }

    pub fn record_container_removal(&self, removed: bool) {
        let outcome = if removed { "removed" } else { "failed" };
        if let Some(counter) = CONTAINERS_REMOVED_TOTAL.get() {
            counter.with_label_values(&[outcome]).inc();
        }
    }
}
