//! End-to-end tests of submit → worker → result over the in-memory broker.
//!
//! The container runtime is scripted, so these run without Docker or Redis.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dockq::execution::{ContainerConfig, ContainerExecutor, ContainerRuntime};
use dockq::scheduler::{
    LivenessConfig, LivenessMonitor, MemoryBroker, QueueDepthInspector, RetryController,
    TaskGateway, TaskStatus, TaskStatusView, TaskSubmission, WorkerPool, WorkerPoolConfig,
};
use dockq::ExecutionError;

/// Runtime whose image pulls fail a set number of times before succeeding.
struct FlakyRuntime {
    pull_failures: AtomicU32,
    logs: String,
    exit_code: i64,
    removed: AtomicU32,
}

impl FlakyRuntime {
    fn new(pull_failures: u32, logs: &str, exit_code: i64) -> Self {
        Self {
            pull_failures: AtomicU32::new(pull_failures),
            logs: logs.to_string(),
            exit_code,
            removed: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl ContainerRuntime for FlakyRuntime {
    async fn image_exists(&self, _image: &str) -> bool {
        false
    }

    async fn pull_image(&self, image: &str) -> Result<(), ExecutionError> {
        let remaining = self.pull_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.pull_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(ExecutionError::ImagePull {
                image: image.to_string(),
                reason: "manifest unknown".to_string(),
            });
        }
        Ok(())
    }

    async fn create_container(&self, _config: &ContainerConfig) -> Result<String, ExecutionError> {
        Ok("container-1".to_string())
    }

    async fn start_container(&self, _id: &str) -> Result<(), ExecutionError> {
        Ok(())
    }

    async fn wait_container(&self, _id: &str) -> Result<i64, ExecutionError> {
        Ok(self.exit_code)
    }

    async fn get_logs(&self, _id: &str) -> Result<String, ExecutionError> {
        Ok(self.logs.clone())
    }

    async fn remove_container(&self, _id: &str, _force: bool) -> Result<(), ExecutionError> {
        self.removed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn start_pool(broker: &Arc<MemoryBroker>, runtime: Arc<FlakyRuntime>) -> WorkerPool {
    let executor = Arc::new(ContainerExecutor::new(runtime));
    let controller = Arc::new(RetryController::new(executor));
    let config = WorkerPoolConfig::new(2)
        .with_node_name("dockq@test")
        .with_poll_interval(Duration::from_millis(50))
        .with_promote_interval(Duration::from_millis(50))
        .with_shutdown_timeout(Duration::from_secs(5));

    WorkerPool::new(config, broker.clone(), controller).with_probe(broker.clone())
}

async fn wait_terminal(gateway: &TaskGateway, task_id: &str) -> TaskStatusView {
    wait_until(gateway, task_id, |status| status.is_terminal()).await
}

async fn wait_until(
    gateway: &TaskGateway,
    task_id: &str,
    done: impl Fn(TaskStatus) -> bool,
) -> TaskStatusView {
    for _ in 0..300 {
        let view = gateway.status(task_id).await.unwrap();
        if done(view.status) {
            return view;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("task {task_id} never finished");
}

fn python_submission() -> TaskSubmission {
    TaskSubmission::new(
        "python:3.13-slim",
        vec![
            "python".to_string(),
            "-c".to_string(),
            "print(42)".to_string(),
        ],
    )
}

#[tokio::test]
async fn test_task_succeeds_and_result_is_extracted() {
    let broker = Arc::new(MemoryBroker::new());
    let runtime = Arc::new(FlakyRuntime::new(
        0,
        "booting\n===result-data===\n42\n===result-data===\n",
        0,
    ));
    let mut pool = start_pool(&broker, runtime.clone());
    pool.start().await.unwrap();

    let gateway = TaskGateway::new(broker.clone());
    let task_id = gateway.submit(python_submission()).await.unwrap();

    let view = wait_terminal(&gateway, &task_id).await;
    pool.shutdown().await.unwrap();

    assert_eq!(view.status, TaskStatus::Success);
    let result = view.result.expect("terminal view carries the payload");
    assert!(result.success);
    assert_eq!(result.attempt, 1);
    assert_eq!(result.status_code, Some(0));
    assert_eq!(result.result.as_deref(), Some("42"));
    assert_eq!(runtime.removed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_pull_failure_retries_once_then_fails() {
    let broker = Arc::new(MemoryBroker::new());
    let runtime = Arc::new(FlakyRuntime::new(u32::MAX, "", 0));
    let mut pool = start_pool(&broker, runtime);
    pool.start().await.unwrap();

    let gateway = TaskGateway::new(broker.clone());
    let task_id = gateway
        .submit(
            TaskSubmission::new("no-such-image:latest", vec!["true".to_string()])
                .with_retries(1, 0),
        )
        .await
        .unwrap();

    let view = wait_terminal(&gateway, &task_id).await;
    pool.shutdown().await.unwrap();

    assert_eq!(view.status, TaskStatus::Failure);
    let result = view.result.unwrap();
    assert!(!result.success);
    assert_eq!(result.attempt, 2);
    assert!(result.error.unwrap().contains("no-such-image"));
    assert!(result.traceback.is_some());
}

#[tokio::test]
async fn test_transient_failure_recovers_on_retry() {
    let broker = Arc::new(MemoryBroker::new());
    let runtime = Arc::new(FlakyRuntime::new(1, "ok\n", 0));
    let mut pool = start_pool(&broker, runtime);
    pool.start().await.unwrap();

    let gateway = TaskGateway::new(broker.clone());
    let task_id = gateway
        .submit(python_submission().with_retries(2, 0))
        .await
        .unwrap();

    let view = wait_terminal(&gateway, &task_id).await;
    pool.shutdown().await.unwrap();

    assert_eq!(view.status, TaskStatus::Success);
    let result = view.result.unwrap();
    assert_eq!(result.attempt, 2);
    assert_eq!(result.result.as_deref(), Some("ok"));
}

#[tokio::test]
async fn test_forgotten_task_never_runs() {
    let broker = Arc::new(MemoryBroker::new());
    let gateway = TaskGateway::new(broker.clone());

    // Submitted before any worker is running
    let task_id = gateway.submit(python_submission()).await.unwrap();
    gateway.forget(&task_id).await.unwrap();

    let runtime = Arc::new(FlakyRuntime::new(0, "42\n", 0));
    let mut pool = start_pool(&broker, runtime.clone());
    pool.start().await.unwrap();

    let view = wait_until(&gateway, &task_id, |status| status == TaskStatus::Revoked).await;
    pool.shutdown().await.unwrap();

    assert_eq!(view.status, TaskStatus::Revoked);
    assert_eq!(runtime.removed.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_fleet_observation_sees_running_pool() {
    let broker = Arc::new(MemoryBroker::new());
    let gateway = TaskGateway::new(broker.clone());
    for _ in 0..3 {
        gateway
            .submit(python_submission().with_queue("browser"))
            .await
            .unwrap();
    }

    let depths = QueueDepthInspector::new(broker.clone())
        .inspect(&["browser", "celery"])
        .await
        .unwrap();
    assert_eq!(depths.get("browser"), Some(&3));
    assert_eq!(depths.get("celery"), Some(&0));

    let runtime = Arc::new(FlakyRuntime::new(0, "42\n", 0));
    let mut pool = start_pool(&broker, runtime);
    pool.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let monitor = LivenessMonitor::new(
        broker.clone(),
        LivenessConfig::default().with_probe_timeout(Duration::from_millis(50)),
    );
    monitor.refresh().await.unwrap();
    let count = monitor.worker_count();
    pool.shutdown().await.unwrap();

    assert_eq!(count.count, 1);
    assert_eq!(count.workers, vec!["dockq@test".to_string()]);
}
