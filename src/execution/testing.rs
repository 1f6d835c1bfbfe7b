//! In-memory [`ContainerRuntime`] used by unit tests.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::ExecutionError;
use crate::execution::docker_client::{ContainerConfig, ContainerRuntime};

/// Step at which the fake runtime should fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailAt {
    Pull,
    Create,
    Start,
    Logs,
    Remove,
}

#[derive(Debug, Default)]
struct FakeState {
    created: Vec<ContainerConfig>,
    removed: Vec<String>,
    pulled: Vec<String>,
    next_id: u32,
}

/// Scriptable container runtime.
#[derive(Debug)]
pub(crate) struct FakeRuntime {
    pub(crate) image_present: bool,
    pub(crate) fail_at: Option<FailAt>,
    pub(crate) exit_code: i64,
    pub(crate) logs: String,
    /// When set, `wait_container` sleeps this long before returning.
    pub(crate) wait_delay: Option<Duration>,
    state: Mutex<FakeState>,
}

impl FakeRuntime {
    pub(crate) fn new(logs: &str) -> Self {
        Self {
            image_present: true,
            fail_at: None,
            exit_code: 0,
            logs: logs.to_string(),
            wait_delay: None,
            state: Mutex::new(FakeState::default()),
        }
    }

    pub(crate) fn failing_at(mut self, step: FailAt) -> Self {
        self.fail_at = Some(step);
        self
    }

    pub(crate) fn without_image(mut self) -> Self {
        self.image_present = false;
        self
    }

    pub(crate) fn with_exit_code(mut self, code: i64) -> Self {
        self.exit_code = code;
        self
    }

    pub(crate) fn with_wait_delay(mut self, delay: Duration) -> Self {
        self.wait_delay = Some(delay);
        self
    }

    pub(crate) fn created(&self) -> Vec<ContainerConfig> {
        self.state.lock().expect("fake state").created.clone()
    }

    pub(crate) fn removed(&self) -> Vec<String> {
        self.state.lock().expect("fake state").removed.clone()
    }

    pub(crate) fn pulled(&self) -> Vec<String> {
        self.state.lock().expect("fake state").pulled.clone()
    }

    fn fails(&self, step: FailAt) -> bool {
        self.fail_at == Some(step)
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn image_exists(&self, _image: &str) -> bool {
        self.image_present
    }

    async fn pull_image(&self, image: &str) -> Result<(), ExecutionError> {
        if self.fails(FailAt::Pull) {
            return Err(ExecutionError::ImagePull {
                image: image.to_string(),
                reason: "manifest unknown".to_string(),
            });
        }
        self.state
            .lock()
            .expect("fake state")
            .pulled
            .push(image.to_string());
        Ok(())
    }

    async fn create_container(&self, config: &ContainerConfig) -> Result<String, ExecutionError> {
        if self.fails(FailAt::Create) {
            return Err(ExecutionError::Create("no space left".to_string()));
        }
        let mut state = self.state.lock().expect("fake state");
        state.next_id += 1;
        state.created.push(config.clone());
        Ok(format!("fake-{}", state.next_id))
    }

    async fn start_container(&self, id: &str) -> Result<(), ExecutionError> {
        if self.fails(FailAt::Start) {
            return Err(ExecutionError::Start {
                id: id.to_string(),
                reason: "port already allocated".to_string(),
            });
        }
        Ok(())
    }

    async fn wait_container(&self, _id: &str) -> Result<i64, ExecutionError> {
        if let Some(delay) = self.wait_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.exit_code)
    }

    async fn get_logs(&self, id: &str) -> Result<String, ExecutionError> {
        if self.fails(FailAt::Logs) {
            return Err(ExecutionError::Logs {
                id: id.to_string(),
                reason: "stream reset".to_string(),
            });
        }
        Ok(self.logs.clone())
    }

    async fn remove_container(&self, id: &str, _force: bool) -> Result<(), ExecutionError> {
        self.state
            .lock()
            .expect("fake state")
            .removed
            .push(id.to_string());
        if self.fails(FailAt::Remove) {
            return Err(ExecutionError::Remove {
                id: id.to_string(),
                reason: "device busy".to_string(),
            });
        }
        Ok(())
    }
}
