//! HTTP endpoint exposing this process's registry to Prometheus.
//!
//! The worker mounts it with `--metrics-addr`; counters live in the worker's
//! memory, so they can only be scraped from the worker itself.

use std::future::Future;

use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::info;

use super::prometheus::export_metrics;

/// Path the registry is served on.
pub const METRICS_PATH: &str = "/metrics";

/// `GET /metrics` in Prometheus text format.
pub async fn metrics_handler() -> String {
    export_metrics()
}

pub fn router() -> Router {
    Router::new().route(METRICS_PATH, get(metrics_handler))
}

/// Serves [`router`] on `listener` until `shutdown` resolves.
///
/// # Errors
///
/// Returns the I/O error that stopped the server.
pub async fn serve_metrics<F>(listener: TcpListener, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!(addr = %listener.local_addr()?, path = METRICS_PATH, "Serving metrics");
    axum::serve(listener, router())
        .with_graceful_shutdown(shutdown)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{init_metrics, MetricsCollector};
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_scrape_serves_process_registry() {
        let _ = init_metrics();
        MetricsCollector::new().job_started();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(serve_metrics(listener, async move {
            let _ = stop_rx.await;
        }));

        let body = reqwest::get(format!("http://{addr}{METRICS_PATH}"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(body.contains("dockq_jobs_in_progress"));
        assert!(!body.starts_with("# Metrics not initialized"));

        stop_tx.send(()).unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unknown_path_is_not_found() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(serve_metrics(listener, async move {
            let _ = stop_rx.await;
        }));

        let response = reqwest::get(format!("http://{addr}/other")).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

        stop_tx.send(()).unwrap();
        server.await.unwrap().unwrap();
    }
}
