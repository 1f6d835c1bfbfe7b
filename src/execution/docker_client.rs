//! Docker API wrapper using the bollard crate.
//!
//! [`ContainerRuntime`] is the seam the executor talks to; [`DockerClient`]
//! is its production implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, PortBinding};
use bollard::Docker;
use futures::StreamExt;

use crate::error::ExecutionError;
use crate::execution::options::{parse_port_key, RuntimeOptions};

/// Label carrying the owning task id on every container we create.
pub const TASK_ID_LABEL: &str = "dockq.task_id";
/// Label carrying the attempt number on every container we create.
pub const ATTEMPT_LABEL: &str = "dockq.attempt";

/// Everything needed to create one task container.
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    /// Docker image to use.
    pub image: String,
    /// Command to run in the container.
    pub cmd: Vec<String>,
    /// Caller-supplied runtime options.
    pub options: RuntimeOptions,
    /// Labels identifying the owning task and attempt.
    pub labels: HashMap<String, String>,
}

impl ContainerConfig {
    /// Creates a new container configuration for the given image and command.
    pub fn new(image: impl Into<String>, cmd: Vec<String>) -> Self {
        Self {
            image: image.into(),
            cmd,
            options: RuntimeOptions::default(),
            labels: HashMap::new(),
        }
    }

    /// Sets the runtime options.
    pub fn with_options(mut self, options: RuntimeOptions) -> Self {
        self.options = options;
        self
    }

    /// Tags the container with its task id and attempt number.
    pub fn with_task(mut self, task_id: &str, attempt: u32) -> Self {
        self.labels
            .insert(TASK_ID_LABEL.to_string(), task_id.to_string());
        self.labels
            .insert(ATTEMPT_LABEL.to_string(), attempt.to_string());
        self
    }

    /// Builds the bollard create request.
    pub fn to_bollard(&self) -> Result<Config<String>, ExecutionError> {
        self.options.validate()?;
        let options = &self.options;

        let mut exposed_ports = HashMap::new();
        let mut port_bindings = HashMap::new();
        for (key, host_port) in &options.ports {
            let key = parse_port_key(key)?;
            exposed_ports.insert(key.clone(), HashMap::new());
            port_bindings.insert(
                key,
                Some(vec![PortBinding {
                    host_ip: None,
                    host_port: host_port.map(|p| p.to_string()),
                }]),
            );
        }

        let host_config = HostConfig {
            memory: options.limits.memory_bytes(),
            cpu_period: options.limits.cpu_quota().map(|_| options.limits.cpu_period()),
            cpu_quota: options.limits.cpu_quota(),
            pids_limit: options.limits.pids_limit,
            shm_size: options.limits.shm_bytes()?,
            network_mode: options.network_mode.clone(),
            binds: if options.volumes.is_empty() {
                None
            } else {
                Some(options.volumes.clone())
            },
            port_bindings: if port_bindings.is_empty() {
                None
            } else {
                Some(port_bindings)
            },
            ..Default::default()
        };

        let mut labels: HashMap<String, String> = options.labels().into_iter().collect();
        labels.extend(self.labels.clone());

        let env = options.env_list();

        Ok(Config {
            image: Some(self.image.clone()),
            cmd: Some(self.cmd.clone()),
            env: if env.is_empty() { None } else { Some(env) },
            working_dir: options.working_dir.clone(),
            user: options.user.clone(),
            labels: Some(labels),
            exposed_ports: if exposed_ports.is_empty() {
                None
            } else {
                Some(exposed_ports)
            },
            host_config: Some(host_config),
            tty: Some(false),
            attach_stdin: Some(false),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        })
    }
}

/// Container operations one execution attempt needs.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Checks if an image exists locally.
    async fn image_exists(&self, image: &str) -> bool;

    /// Pulls an image from its registry.
    async fn pull_image(&self, image: &str) -> Result<(), ExecutionError>;

    /// Creates (without starting) a container, returning its id.
    async fn create_container(&self, config: &ContainerConfig) -> Result<String, ExecutionError>;

    /// Starts a created container.
    async fn start_container(&self, id: &str) -> Result<(), ExecutionError>;

    /// Waits for the container to exit and returns its exit code.
    async fn wait_container(&self, id: &str) -> Result<i64, ExecutionError>;

    /// Combined stdout and stderr of the container.
    async fn get_logs(&self, id: &str) -> Result<String, ExecutionError>;

    /// Removes a container, killing it first when `force` is set.
    async fn remove_container(&self, id: &str, force: bool) -> Result<(), ExecutionError>;
}

/// Docker client wrapper for container operations.
#[derive(Clone)]
pub struct DockerClient {
    docker: Docker,
}

impl DockerClient {
    /// Creates a new Docker client connecting to the local Docker daemon.
    ///
    /// # Errors
    ///
    /// Returns `ExecutionError::DaemonUnavailable` if the Docker daemon is not accessible.
    pub fn new() -> Result<Self, ExecutionError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| ExecutionError::DaemonUnavailable(format!("Failed to connect: {e}")))?;

        Ok(Self { docker })
    }

    /// Creates a new Docker client from an existing bollard Docker instance.
    pub fn from_docker(docker: Docker) -> Self {
        Self { docker }
    }
}

#[async_trait]
impl ContainerRuntime for DockerClient {
    async fn image_exists(&self, image: &str) -> bool {
        self.docker.inspect_image(image).await.is_ok()
    }

    async fn pull_image(&self, image: &str) -> Result<(), ExecutionError> {
        let (repository, tag) = split_image_reference(image);
        let options = CreateImageOptions {
            from_image: repository,
            tag,
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(options), None, None);

        while let Some(result) = stream.next().await {
            result.map_err(|e| ExecutionError::ImagePull {
                image: image.to_string(),
                reason: e.to_string(),
            })?;
        }

        Ok(())
    }

    async fn create_container(&self, config: &ContainerConfig) -> Result<String, ExecutionError> {
        let container_config = config.to_bollard()?;

        let response = self
            .docker
            .create_container(None::<CreateContainerOptions<String>>, container_config)
            .await
            .map_err(|e| ExecutionError::Create(e.to_string()))?;

        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), ExecutionError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| ExecutionError::Start {
                id: id.to_string(),
                reason: e.to_string(),
            })
    }

    async fn wait_container(&self, id: &str) -> Result<i64, ExecutionError> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };

        let mut stream = self.docker.wait_container(id, Some(options));

        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports a non-zero exit as an error carrying the code
            Some(Err(BollardError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(ExecutionError::Wait {
                id: id.to_string(),
                reason: e.to_string(),
            }),
            None => Err(ExecutionError::Wait {
                id: id.to_string(),
                reason: "wait stream ended without a status".to_string(),
            }),
        }
    }

    async fn get_logs(&self, id: &str) -> Result<String, ExecutionError> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: false,
            timestamps: false,
            ..Default::default()
        };

        let mut logs = self.docker.logs(id, Some(options));
        let mut output = String::new();

        while let Some(chunk) = logs.next().await {
            match chunk {
                Ok(LogOutput::StdOut { message })
                | Ok(LogOutput::StdErr { message })
                | Ok(LogOutput::Console { message }) => {
                    output.push_str(&String::from_utf8_lossy(&message));
                }
                Ok(_) => {}
                Err(e) => {
                    return Err(ExecutionError::Logs {
                        id: id.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        Ok(output)
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), ExecutionError> {
        let options = RemoveContainerOptions {
            force,
            v: true, // Remove anonymous volumes
            ..Default::default()
        };

        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(|e| ExecutionError::Remove {
                id: id.to_string(),
                reason: e.to_string(),
            })
    }
}

/// Splits an image reference into repository and tag.
///
/// The Docker API pulls every tag when none is given, so a bare name
/// resolves to `latest`. Digest references are passed through whole.
pub fn split_image_reference(image: &str) -> (&str, &str) {
    if image.contains('@') {
        return (image, "");
    }
    let last_segment_start = image.rfind('/').map(|i| i + 1).unwrap_or(0);
    match image[last_segment_start..].rfind(':') {
        Some(pos) => {
            let split = last_segment_start + pos;
            (&image[..split], &image[split + 1..])
        }
        None => (image, "latest"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::options::ResourceLimits;

    #[test]
    fn test_split_image_reference() {
        assert_eq!(
            split_image_reference("python:3.13-slim"),
            ("python", "3.13-slim")
        );
        assert_eq!(split_image_reference("alpine"), ("alpine", "latest"));
        assert_eq!(
            split_image_reference("localhost:5000/team/app"),
            ("localhost:5000/team/app", "latest")
        );
        assert_eq!(
            split_image_reference("localhost:5000/team/app:v2"),
            ("localhost:5000/team/app", "v2")
        );
        assert_eq!(
            split_image_reference("alpine@sha256:abcd"),
            ("alpine@sha256:abcd", "")
        );
    }

    #[test]
    fn test_container_config_to_bollard() {
        let options = RuntimeOptions::new()
            .with_env("FOO", "bar")
            .with_port("7900/tcp", None)
            .with_port("8080", Some(18080))
            .with_volume("/tmp/data:/data:ro")
            .with_network_mode("bridge")
            .with_limits(ResourceLimits {
                memory_mb: Some(256),
                cpu_cores: Some(1.5),
                pids_limit: Some(64),
                shm_size: Some("2g".to_string()),
            });
        let config = ContainerConfig::new(
            "python:3.13-slim",
            vec!["python".to_string(), "-c".to_string(), "print(1)".to_string()],
        )
        .with_options(options)
        .with_task("task-1", 2);

        let built = config.to_bollard().expect("config should build");
        assert_eq!(built.image.as_deref(), Some("python:3.13-slim"));
        assert_eq!(built.cmd.as_ref().map(Vec::len), Some(3));
        assert_eq!(built.env, Some(vec!["FOO=bar".to_string()]));

        let labels = built.labels.expect("labels set");
        assert_eq!(labels.get(TASK_ID_LABEL).map(String::as_str), Some("task-1"));
        assert_eq!(labels.get(ATTEMPT_LABEL).map(String::as_str), Some("2"));

        let exposed = built.exposed_ports.expect("ports exposed");
        assert!(exposed.contains_key("7900/tcp"));
        assert!(exposed.contains_key("8080/tcp"));

        let host = built.host_config.expect("host config set");
        assert_eq!(host.memory, Some(256 * 1024 * 1024));
        assert_eq!(host.cpu_quota, Some(150_000));
        assert_eq!(host.cpu_period, Some(100_000));
        assert_eq!(host.pids_limit, Some(64));
        assert_eq!(host.shm_size, Some(2 * 1024 * 1024 * 1024));
        assert_eq!(host.binds, Some(vec!["/tmp/data:/data:ro".to_string()]));

        let bindings = host.port_bindings.expect("bindings set");
        let random = bindings["7900/tcp"].as_ref().expect("binding list");
        assert_eq!(random[0].host_port, None);
        let pinned = bindings["8080/tcp"].as_ref().expect("binding list");
        assert_eq!(pinned[0].host_port.as_deref(), Some("18080"));
    }

    #[test]
    fn test_container_config_rejects_bad_options() {
        let config = ContainerConfig::new("alpine", vec!["true".to_string()])
            .with_options(RuntimeOptions::new().with_port("not-a-port", None));
        assert!(matches!(
            config.to_bollard(),
            Err(ExecutionError::InvalidOptions(_))
        ));
    }

    #[test]
    fn test_plain_config_has_no_limits() {
        let config = ContainerConfig::new("alpine", vec!["true".to_string()]);
        let built = config.to_bollard().expect("config should build");
        let host = built.host_config.expect("host config");
        assert_eq!(host.memory, None);
        assert_eq!(host.cpu_quota, None);
        assert_eq!(host.cpu_period, None);
        assert!(built.env.is_none());
        assert!(built.exposed_ports.is_none());
    }
}
