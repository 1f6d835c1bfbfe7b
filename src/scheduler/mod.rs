//! Task queueing, workers and fleet observation.
//!
//! This module provides everything around the container executor:
//!
//! - **TaskGateway**: submit, query and forget tasks
//! - **TaskBroker**: durable queue and result store (Redis or in-memory)
//! - **RetryController**: one attempt plus a retry decision
//! - **CallbackDispatcher**: best-effort webhook delivery of terminal results
//! - **WorkerPool**: worker loops tying broker, controller and callbacks together
//! - **LivenessMonitor**: cached set of workers answering probes
//! - **QueueDepthInspector**: pending counts per queue
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │ TaskGateway  │
//!                      │    (CLI)     │
//!                      └──────┬───────┘
//!                             │ enqueue / record
//!                      ┌──────▼───────┐        ┌──────────────────┐
//!                      │    Redis     │◀───────│ LivenessMonitor  │
//!                      │   broker     │ probe  │ QueueDepthInsp.  │
//!                      └──────┬───────┘        └──────────────────┘
//!                             │
//!         ┌───────────────────┼───────────────────┐
//!         ▼                   ▼                   ▼
//!    ┌─────────┐         ┌─────────┐         ┌─────────┐
//!    │ Worker 1│         │ Worker 2│         │ Worker N│
//!    └────┬────┘         └─────────┘         └─────────┘
//!         │ RetryController → ContainerExecutor → CallbackDispatcher
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use dockq::execution::{ContainerExecutor, DockerClient};
//! use dockq::scheduler::{
//!     RedisBroker, RedisBrokerConfig, RetryController, TaskGateway, TaskSubmission,
//!     WorkerPool, WorkerPoolConfig,
//! };
//!
//! let broker = Arc::new(RedisBroker::connect(RedisBrokerConfig::new("redis://localhost:6379")).await?);
//!
//! let gateway = TaskGateway::new(broker.clone());
//! let task_id = gateway
//!     .submit(TaskSubmission::new("python:3.13-slim", vec!["python".into(), "-V".into()]))
//!     .await?;
//!
//! let executor = Arc::new(ContainerExecutor::new(Arc::new(DockerClient::new()?)));
//! let mut pool = WorkerPool::new(
//!     WorkerPoolConfig::new(4),
//!     broker.clone(),
//!     Arc::new(RetryController::new(executor)),
//! )
//! .with_probe(broker);
//! pool.start().await?;
//!
//! println!("{:?}", gateway.status(&task_id).await?);
//! pool.shutdown().await?;
//! ```
//!
//! # Reliability Features
//!
//! - **Atomic dequeue**: BRPOPLPUSH moves envelopes to a per-pool processing list
//! - **Crash recovery**: pools hold renewed leases; lists of lapsed pools are requeued
//! - **Durable retries**: the next attempt is enqueued with an ETA in the same
//!   step that releases the current delivery
//! - **Exclusive forget**: revocation and STARTED are checked and written atomically
//! - **Graceful shutdown**: workers finish their current task and pending
//!   callbacks are delivered before stopping

pub mod callback;
pub mod gateway;
pub mod inspector;
pub mod job;
pub mod liveness;
pub mod memory;
pub mod queue;
pub mod retry;
pub mod worker_pool;

pub use callback::{CallbackConfig, CallbackDispatcher};
pub use gateway::TaskGateway;
pub use inspector::QueueDepthInspector;
pub use job::{
    ResultPayload, TaskEnvelope, TaskRecord, TaskStatus, TaskStatusView, TaskSubmission,
};
pub use liveness::{LivenessConfig, LivenessMonitor, WorkerCount, WorkerSnapshot};
pub use memory::MemoryBroker;
pub use queue::{RedisBroker, RedisBrokerConfig, TaskBroker, WorkerProbe};
pub use retry::{decide, RetryController, RetryDecision};
pub use worker_pool::{PoolError, PoolStats, WorkerPool, WorkerPoolConfig, DEFAULT_LEASE_TTL};
