//! Metrics module for Prometheus-based monitoring.
//!
//! Tracks task outcomes, attempt durations, queue depths, live workers,
//! callback deliveries and container cleanup.
//!
//! # Example
//!
//! ```ignore
//! use dockq::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_task("SUCCESS");
//!
//! let metrics_text = export_metrics();
//!
//! // Or let Prometheus scrape it
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:9100").await?;
//! serve_metrics(listener, std::future::pending()).await?;
//! ```

pub mod collectors;
pub mod prometheus;
pub mod server;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};
pub use server::{serve_metrics, METRICS_PATH};

pub use prometheus::{
    ATTEMPT_DURATION, CALLBACKS_TOTAL, CONTAINERS_REMOVED_TOTAL, JOBS_IN_PROGRESS, LIVE_WORKERS,
    QUEUE_DEPTH, REGISTRY, TASKS_TOTAL,
};
