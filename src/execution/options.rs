//! Container runtime options for a task.
//!
//! Callers describe how their container should run with a small, typed set
//! of options (environment, published ports, bind mounts, resource limits).
//! Anything else lands in [`RuntimeOptions::extra`], of which only a narrow
//! set of keys is honoured by the Docker client.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ExecutionError;

/// Resource limits applied to a task container.
///
/// Every limit is optional; unset limits fall back to the daemon defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Memory limit in megabytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,
    /// CPU cores available (e.g., 0.5, 1.0, 2.0).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_cores: Option<f64>,
    /// Maximum number of processes allowed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pids_limit: Option<i64>,
    /// Size of `/dev/shm`, e.g. "64m" or "2g".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shm_size: Option<String>,
}

impl ResourceLimits {
    /// Returns memory limit in bytes.
    pub fn memory_bytes(&self) -> Option<i64> {
        self.memory_mb.map(|mb| (mb * 1024 * 1024) as i64)
    }

    /// Returns CPU period in microseconds (fixed at 100ms).
    pub fn cpu_period(&self) -> i64 {
        100_000
    }

    /// Returns CPU quota based on cores allocated.
    ///
    /// Formula: quota = period * cores
    /// e.g., 1.0 core = 100000 quota (100% of one CPU)
    pub fn cpu_quota(&self) -> Option<i64> {
        self.cpu_cores
            .map(|cores| (self.cpu_period() as f64 * cores) as i64)
    }

    /// Returns the shared memory size in bytes.
    pub fn shm_bytes(&self) -> Result<Option<i64>, ExecutionError> {
        self.shm_size.as_deref().map(parse_size).transpose()
    }
}

/// Options passed through to the container runtime for one task.
///
/// Deserializes from the loose shape callers already send, e.g.
/// `{"shm_size": "2g", "ports": {"7900/tcp": null}}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeOptions {
    /// Environment variables.
    #[serde(default, alias = "environment", skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Container port ("7900/tcp") to host port; `None` picks a random host port.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub ports: BTreeMap<String, Option<u16>>,
    /// Bind mounts in `host:container[:mode]` form.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<String>,
    /// Network mode (e.g., "none", "bridge", "host").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_mode: Option<String>,
    /// Working directory inside the container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    /// User to run as (e.g., "1000:1000").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(flatten)]
    pub limits: ResourceLimits,
    /// Provider-specific settings. Only `labels` is understood.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl RuntimeOptions {
    /// Creates empty options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Publishes a container port, optionally pinned to a host port.
    pub fn with_port(mut self, container_port: impl Into<String>, host_port: Option<u16>) -> Self {
        self.ports.insert(container_port.into(), host_port);
        self
    }

    /// Adds a bind mount.
    pub fn with_volume(mut self, volume: impl Into<String>) -> Self {
        self.volumes.push(volume.into());
        self
    }

    /// Sets explicit resource limits.
    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Sets the network mode.
    pub fn with_network_mode(mut self, mode: impl Into<String>) -> Self {
        self.network_mode = Some(mode.into());
        self
    }

    /// Points both `HTTP_PROXY` and `HTTPS_PROXY` at `proxy`.
    pub fn apply_proxy(&mut self, proxy: &str) {
        self.env.insert("HTTP_PROXY".to_string(), proxy.to_string());
        self.env.insert("HTTPS_PROXY".to_string(), proxy.to_string());
    }

    /// Environment in the `KEY=value` form the Docker API expects.
    pub fn env_list(&self) -> Vec<String> {
        self.env.iter().map(|(k, v)| format!("{k}={v}")).collect()
    }

    /// Labels supplied through the `labels` escape hatch.
    pub fn labels(&self) -> BTreeMap<String, String> {
        let Some(Value::Object(map)) = self.extra.get("labels") else {
            return BTreeMap::new();
        };
        map.iter()
            .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
            .collect()
    }

    /// Keys in `extra` that the runtime will ignore.
    pub fn unsupported_keys(&self) -> Vec<&str> {
        self.extra
            .keys()
            .map(String::as_str)
            .filter(|k| *k != "labels")
            .collect()
    }

    /// Checks the options for values the runtime would reject anyway.
    pub fn validate(&self) -> Result<(), ExecutionError> {
        for port in self.ports.keys() {
            parse_port_key(port)?;
        }
        for volume in &self.volumes {
            let mut parts = volume.split(':');
            let host = parts.next().unwrap_or_default();
            let container = parts.next().unwrap_or_default();
            if host.is_empty() || container.is_empty() {
                return Err(ExecutionError::InvalidOptions(format!(
                    "volume '{volume}' must be host:container[:mode]"
                )));
            }
        }
        if let Some(cores) = self.limits.cpu_cores {
            if cores <= 0.0 {
                return Err(ExecutionError::InvalidOptions(format!(
                    "cpu_cores must be positive, got {cores}"
                )));
            }
        }
        self.limits.shm_bytes()?;
        Ok(())
    }
}

/// Normalizes a port key to `port/proto`, defaulting the protocol to tcp.
pub fn parse_port_key(key: &str) -> Result<String, ExecutionError> {
    let (port, proto) = key.split_once('/').unwrap_or((key, "tcp"));
    if port.parse::<u16>().is_err() || !matches!(proto, "tcp" | "udp" | "sctp") {
        return Err(ExecutionError::InvalidOptions(format!(
            "port '{key}' must look like 8080/tcp"
        )));
    }
    Ok(format!("{port}/{proto}"))
}

/// Parses a human size such as "512m" or "2g" into bytes.
pub fn parse_size(raw: &str) -> Result<i64, ExecutionError> {
    let trimmed = raw.trim().to_ascii_lowercase();
    let trimmed = trimmed.strip_suffix('b').unwrap_or(&trimmed);
    let (digits, multiplier) = match trimmed.chars().last() {
        Some('k') => (&trimmed[..trimmed.len() - 1], 1024_i64),
        Some('m') => (&trimmed[..trimmed.len() - 1], 1024 * 1024),
        Some('g') => (&trimmed[..trimmed.len() - 1], 1024 * 1024 * 1024),
        _ => (trimmed, 1),
    };
    digits
        .parse::<i64>()
        .ok()
        .and_then(|n| n.checked_mul(multiplier))
        .ok_or_else(|| ExecutionError::InvalidOptions(format!("invalid size '{raw}'")))
}
