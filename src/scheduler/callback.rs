//! Best-effort webhook delivery of terminal results.

use std::time::Duration;

use tracing::{error, info};

use super::job::{is_http_url, ResultPayload};
use crate::error::CallbackError;
use crate::metrics::MetricsCollector;

/// Header carrying the task id on callback requests.
pub const TASK_ID_HEADER: &str = "Task-Id";

/// Default timeout for one callback request.
pub const DEFAULT_CALLBACK_TIMEOUT: Duration = Duration::from_secs(6);

#[derive(Debug, Clone)]
pub struct CallbackConfig {
    /// Upper bound on the whole POST, including reading the response.
    pub timeout: Duration,
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_CALLBACK_TIMEOUT,
        }
    }
}

impl CallbackConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// POSTs terminal payloads to caller-supplied URLs.
#[derive(Debug, Clone)]
pub struct CallbackDispatcher {
    client: reqwest::Client,
    metrics: MetricsCollector,
}

impl CallbackDispatcher {
    pub fn new(config: CallbackConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            metrics: MetricsCollector::new(),
        }
    }

    /// Sends `payload` to `url` with the task id header.
    ///
    /// # Errors
    ///
    /// Fails on a non-http(s) URL, a transport error or timeout, or a
    /// non-2xx response.
    pub async fn deliver(
        &self,
        url: &str,
        task_id: &str,
        payload: &ResultPayload,
    ) -> Result<(), CallbackError> {
        if !is_http_url(url) {
            return Err(CallbackError::UnsupportedUrl(url.to_string()));
        }

        let response = self
            .client
            .post(url)
            .header(TASK_ID_HEADER, task_id)
            .json(payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CallbackError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }

    /// Delivers the payload to its echoed callback URL, if any, and logs the
    /// outcome. Never fails.
    pub async fn dispatch(&self, task_id: &str, payload: &ResultPayload) {
        let Some(url) = payload.callback.as_deref() else {
            return;
        };

        match self.deliver(url, task_id, payload).await {
            Ok(()) => {
                self.metrics.record_callback(true);
                info!(task_id = %task_id, url = %url, "Callback delivered");
            }
            // Delivery failures never touch the task's recorded status.
            Err(e) => {
                self.metrics.record_callback(false);
                error!(task_id = %task_id, url = %url, error = %e, "Callback delivery failed");
            }
        }
    }
}

impl Default for CallbackDispatcher {
    fn default() -> Self {
        Self::new(CallbackConfig::default())
    }
}
