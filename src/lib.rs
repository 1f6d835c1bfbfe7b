//! dockq: run shell commands in throwaway Docker containers through a task queue.
//!
//! Callers submit a task (image, command, container options, retry policy,
//! optional callback URL) to a Redis-backed queue. Workers pick tasks up, run
//! each attempt in a fresh container, extract the delimited result from the
//! container logs, retry failures after a delay, and POST the final payload to
//! the callback URL.

pub mod cli;
pub mod error;
pub mod execution;
pub mod metrics;
pub mod scheduler;

// Re-export commonly used error types
pub use error::{
    CallbackError, ExecutionError, GatewayError, ProxyError, QueueError, SubmissionError,
};
