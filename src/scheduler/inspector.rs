//! On-demand pending counts per queue.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::join_all;
use tracing::warn;

use super::queue::TaskBroker;
use crate::error::QueueError;
use crate::metrics::MetricsCollector;

/// Reports how many envelopes are waiting in each named queue.
#[derive(Clone)]
pub struct QueueDepthInspector {
    broker: Arc<dyn TaskBroker>,
    metrics: MetricsCollector,
}

impl QueueDepthInspector {
    pub fn new(broker: Arc<dyn TaskBroker>) -> Self {
        Self {
            broker,
            metrics: MetricsCollector::new(),
        }
    }

    /// Pending count for each queue in `queues`.
    ///
    /// A queue that cannot be inspected is logged and left out of the map.
    ///
    /// # Errors
    ///
    /// `QueueError::Unavailable` when the broker cannot be reached at all.
    pub async fn inspect<S: AsRef<str>>(
        &self,
        queues: &[S],
    ) -> Result<BTreeMap<String, u64>, QueueError> {
        self.broker.ping().await?;

        let lookups = queues.iter().map(|name| async move {
            let name = name.as_ref();
            (name, self.broker.queue_depth(name).await)
        });

        let mut depths = BTreeMap::new();
        for (name, result) in join_all(lookups).await {
            match result {
                Ok(depth) => {
                    self.metrics.set_queue_depth(name, depth);
                    depths.insert(name.to_string(), depth);
                }
                Err(e) => warn!(queue = %name, error = %e, "Queue inspection failed"),
            }
        }
        Ok(depths)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::{TaskEnvelope, TaskSubmission};
    use crate::scheduler::memory::MemoryBroker;
    use chrono::Utc;

    async fn seed(broker: &MemoryBroker, queue: &str, n: usize) {
        for _ in 0..n {
            let sub = TaskSubmission::new("alpine", vec!["true".into()]).with_queue(queue);
            broker.enqueue(&TaskEnvelope::new(sub, Utc::now())).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_counts_each_queue() {
        let broker = MemoryBroker::new();
        seed(&broker, "a", 2).await;
        seed(&broker, "celery", 1).await;
        let inspector = QueueDepthInspector::new(Arc::new(broker));

        let depths = inspector.inspect(&["a", "celery", "empty"]).await.unwrap();
        assert_eq!(depths.get("a"), Some(&2));
        assert_eq!(depths.get("celery"), Some(&1));
        assert_eq!(depths.get("empty"), Some(&0));
    }

    #[tokio::test]
    async fn test_failing_queue_is_omitted() {
        let broker = MemoryBroker::new();
        seed(&broker, "a", 3).await;
        broker.fail_queue("b");
        let inspector = QueueDepthInspector::new(Arc::new(broker));

        let depths = inspector
            .inspect(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(depths.len(), 1);
        assert_eq!(depths.get("a"), Some(&3));
        assert!(!depths.contains_key("b"));
    }

    #[tokio::test]
    async fn test_unreachable_broker_fails_whole_call() {
        let broker = MemoryBroker::new();
        broker.set_unavailable(true);
        let inspector = QueueDepthInspector::new(Arc::new(broker));

        let err = inspector.inspect(&["a"]).await.unwrap_err();
        assert!(matches!(err, QueueError::Unavailable(_)));
    }
}
