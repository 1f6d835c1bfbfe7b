//! Docker execution layer for dockq tasks.
//!
//! This module runs one task attempt inside a throwaway container using the
//! bollard crate, and turns the container's output into a result string.
//!
//! # Architecture
//!
//! ```text
//! ContainerExecutor ──▶ ContainerRuntime (trait) ──▶ DockerClient (bollard)
//!        │
//!        ├──▶ ProxyFetcher     (best-effort HTTP_PROXY lookup)
//!        └──▶ ResultExtractor  (===result-data=== blocks)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use dockq::execution::{ContainerExecutor, DockerClient, ExecutionRequest, RuntimeOptions};
//!
//! let executor = ContainerExecutor::new(Arc::new(DockerClient::new()?));
//! let report = executor
//!     .run(&ExecutionRequest {
//!         task_id: "task-123".to_string(),
//!         attempt: 1,
//!         image: "python:3.13-slim".to_string(),
//!         command: vec!["python".into(), "-c".into(), "print(42)".into()],
//!         options: RuntimeOptions::new(),
//!         proxy_url: None,
//!         timeout: Duration::from_secs(60),
//!     })
//!     .await?;
//! assert_eq!(report.result, "42");
//! ```

pub mod docker_client;
pub mod executor;
pub mod extractor;
pub mod options;
pub mod proxy;

#[cfg(test)]
pub(crate) mod testing;

pub use docker_client::{ContainerConfig, ContainerRuntime, DockerClient};
pub use executor::{ContainerExecutor, ExecutionReport, ExecutionRequest};
pub use extractor::{extract_result, ResultExtractor, RESULT_DELIMITER};
pub use options::{ResourceLimits, RuntimeOptions};
pub use proxy::ProxyFetcher;
