//! In-process broker for tests and single-process runs.
//!
//! Mirrors the Redis layout: ready queues are pushed on the front and popped
//! from the back, dequeued envelopes sit in their consumer's processing list
//! until acked, consumers hold expiring leases, and envelopes with an ETA
//! wait in a delayed set until promoted.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, Notify};
use tokio::time::Instant;

use super::job::{TaskEnvelope, TaskRecord, TaskStatus};
use super::queue::{TaskBroker, WorkerProbe};
use crate::error::QueueError;

/// Processing lists are keyed by (queue, consumer).
type ProcessingKey = (String, String);

#[derive(Debug, Default)]
struct MemoryState {
    queues: HashMap<String, VecDeque<TaskEnvelope>>,
    processing: HashMap<ProcessingKey, Vec<TaskEnvelope>>,
    consumers: HashMap<String, BTreeSet<String>>,
    leases: HashMap<String, Instant>,
    delayed: HashMap<String, Vec<TaskEnvelope>>,
    records: HashMap<String, TaskRecord>,
    revoked: HashSet<String>,
    serving: BTreeSet<String>,
    failing_queues: HashSet<String>,
    failing_enqueues: bool,
    unavailable: bool,
}

impl MemoryState {
    fn push(&mut self, envelope: TaskEnvelope) {
        let queue = envelope.queue().to_string();
        if envelope.eta.is_some_and(|eta| eta > Utc::now()) {
            self.delayed.entry(queue).or_default().push(envelope);
        } else {
            self.queues.entry(queue).or_default().push_front(envelope);
        }
    }

    fn take_held(&mut self, queue: &str, consumer: &str, task_id: &str) -> Option<TaskEnvelope> {
        let list = self
            .processing
            .get_mut(&(queue.to_string(), consumer.to_string()))?;
        let pos = list.iter().position(|e| e.id == task_id)?;
        Some(list.remove(pos))
    }

    fn lease_alive(&self, consumer: &str) -> bool {
        self.leases
            .get(consumer)
            .is_some_and(|expires| *expires > Instant::now())
    }
}

/// [`TaskBroker`] and [`WorkerProbe`] kept entirely in memory.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<MemoryState>>,
    notify: Arc<Notify>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every depth inspection of `queue` fail.
    pub fn fail_queue(&self, queue: &str) {
        self.lock().failing_queues.insert(queue.to_string());
    }

    /// Makes enqueues (including retry scheduling) fail while set.
    pub fn fail_enqueues(&self, failing: bool) {
        self.lock().failing_enqueues = failing;
    }

    /// Simulates losing (or regaining) the broker connection.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Number of envelopes waiting in the delayed set of `queue`.
    pub fn delayed_len(&self, queue: &str) -> usize {
        self.lock().delayed.get(queue).map_or(0, Vec::len)
    }

    /// Number of stored task records.
    pub fn record_count(&self) -> usize {
        self.lock().records.len()
    }

    /// Number of envelopes held by any consumer of `queue`.
    pub fn processing_len(&self, queue: &str) -> usize {
        self.lock()
            .processing
            .iter()
            .filter(|((q, _), _)| q == queue)
            .map(|(_, list)| list.len())
            .sum()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        // State is plain data; a panicked holder cannot leave it half-written
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn available(&self) -> Result<MutexGuard<'_, MemoryState>, QueueError> {
        let state = self.lock();
        if state.unavailable {
            return Err(QueueError::Unavailable("connection refused".to_string()));
        }
        Ok(state)
    }

    fn writable(&self) -> Result<MutexGuard<'_, MemoryState>, QueueError> {
        let state = self.available()?;
        if state.failing_enqueues {
            return Err(QueueError::Operation("OOM command not allowed".to_string()));
        }
        Ok(state)
    }

    fn try_pop(&self, queue: &str, consumer: &str) -> Result<Option<TaskEnvelope>, QueueError> {
        let mut state = self.available()?;
        let popped = state.queues.get_mut(queue).and_then(VecDeque::pop_back);
        if let Some(envelope) = &popped {
            state
                .processing
                .entry((queue.to_string(), consumer.to_string()))
                .or_default()
                .push(envelope.clone());
        }
        Ok(popped)
    }
}

#[async_trait]
impl TaskBroker for MemoryBroker {
    async fn ping(&self) -> Result<(), QueueError> {
        self.available().map(|_| ())
    }

    async fn enqueue(&self, envelope: &TaskEnvelope) -> Result<(), QueueError> {
        self.writable()?.push(envelope.clone());
        self.notify.notify_waiters();
        Ok(())
    }

    async fn dequeue(
        &self,
        queue: &str,
        consumer: &str,
        timeout: Duration,
    ) -> Result<Option<TaskEnvelope>, QueueError> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(envelope) = self.try_pop(queue, consumer)? {
                return Ok(Some(envelope));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, envelope: &TaskEnvelope, consumer: &str) -> Result<(), QueueError> {
        self.available()?
            .take_held(envelope.queue(), consumer, &envelope.id);
        Ok(())
    }

    async fn schedule_retry(
        &self,
        next: &TaskEnvelope,
        consumer: &str,
    ) -> Result<(), QueueError> {
        {
            let mut state = self.writable()?;
            if state.take_held(next.queue(), consumer, &next.id).is_none() {
                return Ok(());
            }
            state.push(next.clone());
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn promote_due(&self, queue: &str, now: DateTime<Utc>) -> Result<usize, QueueError> {
        let promoted = {
            let mut state = self.available()?;
            let waiting = state.delayed.remove(queue).unwrap_or_default();
            let (due, later): (Vec<_>, Vec<_>) = waiting
                .into_iter()
                .partition(|e| e.eta.map_or(true, |eta| eta <= now));
            if !later.is_empty() {
                state.delayed.insert(queue.to_string(), later);
            }
            let ready = state.queues.entry(queue.to_string()).or_default();
            let count = due.len();
            for envelope in due {
                ready.push_front(envelope);
            }
            count
        };
        if promoted > 0 {
            self.notify.notify_waiters();
        }
        Ok(promoted)
    }

    async fn renew_lease(
        &self,
        consumer: &str,
        queues: &[String],
        ttl: Duration,
    ) -> Result<(), QueueError> {
        let mut state = self.available()?;
        state
            .leases
            .insert(consumer.to_string(), Instant::now() + ttl);
        for queue in queues {
            state
                .consumers
                .entry(queue.clone())
                .or_default()
                .insert(consumer.to_string());
        }
        Ok(())
    }

    async fn release_lease(&self, consumer: &str) -> Result<(), QueueError> {
        self.available()?.leases.remove(consumer);
        Ok(())
    }

    async fn recover_orphans(&self, queue: &str) -> Result<usize, QueueError> {
        let recovered = {
            let mut state = self.available()?;
            let lapsed: Vec<String> = state
                .consumers
                .get(queue)
                .into_iter()
                .flatten()
                .filter(|consumer| !state.lease_alive(consumer))
                .cloned()
                .collect();

            let mut count = 0;
            for consumer in lapsed {
                let stranded = state
                    .processing
                    .remove(&(queue.to_string(), consumer.clone()))
                    .unwrap_or_default();
                count += stranded.len();
                let ready = state.queues.entry(queue.to_string()).or_default();
                for envelope in stranded {
                    ready.push_back(envelope);
                }
                if let Some(consumers) = state.consumers.get_mut(queue) {
                    consumers.remove(&consumer);
                }
            }
            count
        };
        if recovered > 0 {
            self.notify.notify_waiters();
        }
        Ok(recovered)
    }

    async fn queue_depth(&self, queue: &str) -> Result<u64, QueueError> {
        let state = self.available()?;
        if state.failing_queues.contains(queue) {
            return Err(QueueError::Operation(format!(
                "WRONGTYPE inspecting queue '{queue}'"
            )));
        }
        Ok(state.queues.get(queue).map_or(0, |q| q.len() as u64))
    }

    async fn store_record(&self, record: &TaskRecord) -> Result<(), QueueError> {
        self.available()?
            .records
            .insert(record.task_id.clone(), record.clone());
        Ok(())
    }

    async fn load_record(&self, task_id: &str) -> Result<Option<TaskRecord>, QueueError> {
        Ok(self.available()?.records.get(task_id).cloned())
    }

    async fn delete_record(&self, task_id: &str) -> Result<(), QueueError> {
        self.available()?.records.remove(task_id);
        Ok(())
    }

    async fn mark_started(&self, record: &TaskRecord) -> Result<bool, QueueError> {
        let mut state = self.available()?;
        if state.revoked.contains(&record.task_id) {
            return Ok(false);
        }
        state.records.insert(record.task_id.clone(), record.clone());
        Ok(true)
    }

    async fn revoke_unstarted(&self, task_id: &str) -> Result<Option<TaskStatus>, QueueError> {
        let mut state = self.available()?;
        if let Some(record) = state.records.get(task_id) {
            if !record.status.is_forgettable() {
                return Ok(Some(record.status));
            }
        }
        state.revoked.insert(task_id.to_string());
        state.records.remove(task_id);
        Ok(None)
    }

    async fn is_revoked(&self, task_id: &str) -> Result<bool, QueueError> {
        Ok(self.available()?.revoked.contains(task_id))
    }
}

#[async_trait]
impl WorkerProbe for MemoryBroker {
    async fn probe(&self, _timeout: Duration) -> Result<Vec<String>, QueueError> {
        Ok(self.available()?.serving.iter().cloned().collect())
    }

    async fn serve(
        &self,
        node_name: &str,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), QueueError> {
        self.lock().serving.insert(node_name.to_string());
        let _ = shutdown.recv().await;
        self.lock().serving.remove(node_name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::{TaskStatus, TaskSubmission};

    fn envelope(queue: &str) -> TaskEnvelope {
        TaskEnvelope::new(
            TaskSubmission::new("alpine", vec!["true".to_string()]).with_queue(queue),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_fifo_order_and_processing() {
        let broker = MemoryBroker::new();
        let first = envelope("celery");
        let second = envelope("celery");
        broker.enqueue(&first).await.unwrap();
        broker.enqueue(&second).await.unwrap();
        assert_eq!(broker.queue_depth("celery").await.unwrap(), 2);

        let got = broker
            .dequeue("celery", "c1", Duration::from_millis(10))
            .await
            .unwrap()
            .expect("first envelope");
        assert_eq!(got.id, first.id);
        assert_eq!(broker.processing_len("celery"), 1);

        // Another consumer's ack does not release this delivery
        broker.ack(&got, "c2").await.unwrap();
        assert_eq!(broker.processing_len("celery"), 1);
        broker.ack(&got, "c1").await.unwrap();
        assert_eq!(broker.processing_len("celery"), 0);
    }

    #[tokio::test]
    async fn test_dequeue_times_out_when_empty() {
        let broker = MemoryBroker::new();
        let got = broker
            .dequeue("celery", "c1", Duration::from_millis(20))
            .await
            .unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_dequeue_wakes_on_enqueue() {
        let broker = MemoryBroker::new();
        let producer = broker.clone();
        let env = envelope("celery");
        let id = env.id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.enqueue(&env).await.unwrap();
        });

        let got = broker
            .dequeue("celery", "c1", Duration::from_secs(2))
            .await
            .unwrap()
            .expect("woken by enqueue");
        assert_eq!(got.id, id);
    }

    #[tokio::test]
    async fn test_delayed_promotion() {
        let broker = MemoryBroker::new();
        let now = Utc::now();
        let env = envelope("celery").next_attempt(Duration::from_secs(30), now);
        broker.enqueue(&env).await.unwrap();

        assert_eq!(broker.queue_depth("celery").await.unwrap(), 0);
        assert_eq!(broker.delayed_len("celery"), 1);

        assert_eq!(broker.promote_due("celery", now).await.unwrap(), 0);
        let later = now + chrono::Duration::seconds(31);
        assert_eq!(broker.promote_due("celery", later).await.unwrap(), 1);
        assert_eq!(broker.queue_depth("celery").await.unwrap(), 1);
        assert_eq!(broker.delayed_len("celery"), 0);
    }

    #[tokio::test]
    async fn test_recover_orphans_skips_live_consumers() {
        let broker = MemoryBroker::new();
        let queues = vec!["celery".to_string()];
        broker.enqueue(&envelope("celery")).await.unwrap();
        broker.enqueue(&envelope("celery")).await.unwrap();

        broker
            .renew_lease("alive", &queues, Duration::from_secs(30))
            .await
            .unwrap();
        broker
            .renew_lease("crashed", &queues, Duration::from_millis(10))
            .await
            .unwrap();
        broker
            .dequeue("celery", "alive", Duration::from_millis(10))
            .await
            .unwrap()
            .expect("one for the live consumer");
        broker
            .dequeue("celery", "crashed", Duration::from_millis(10))
            .await
            .unwrap()
            .expect("one for the crashed consumer");

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(broker.recover_orphans("celery").await.unwrap(), 1);
        assert_eq!(broker.queue_depth("celery").await.unwrap(), 1);
        assert_eq!(broker.processing_len("celery"), 1);

        // Nothing left to take from the lapsed consumer
        assert_eq!(broker.recover_orphans("celery").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_released_lease_is_recovered_at_once() {
        let broker = MemoryBroker::new();
        let queues = vec!["celery".to_string()];
        broker.enqueue(&envelope("celery")).await.unwrap();
        broker
            .renew_lease("c1", &queues, Duration::from_secs(30))
            .await
            .unwrap();
        broker
            .dequeue("celery", "c1", Duration::from_millis(10))
            .await
            .unwrap();

        assert_eq!(broker.recover_orphans("celery").await.unwrap(), 0);
        broker.release_lease("c1").await.unwrap();
        assert_eq!(broker.recover_orphans("celery").await.unwrap(), 1);
        assert_eq!(broker.processing_len("celery"), 0);
    }

    #[tokio::test]
    async fn test_failed_retry_keeps_delivery_held() {
        let broker = MemoryBroker::new();
        broker.enqueue(&envelope("celery")).await.unwrap();
        let held = broker
            .dequeue("celery", "c1", Duration::from_millis(10))
            .await
            .unwrap()
            .expect("delivery");
        let next = held.next_attempt(Duration::from_secs(30), Utc::now());

        broker.fail_enqueues(true);
        assert!(broker.schedule_retry(&next, "c1").await.is_err());
        assert_eq!(broker.processing_len("celery"), 1);
        assert_eq!(broker.delayed_len("celery"), 0);

        broker.fail_enqueues(false);
        broker.schedule_retry(&next, "c1").await.unwrap();
        assert_eq!(broker.processing_len("celery"), 0);
        assert_eq!(broker.delayed_len("celery"), 1);
    }

    #[tokio::test]
    async fn test_retry_of_recovered_delivery_is_dropped() {
        let broker = MemoryBroker::new();
        broker.enqueue(&envelope("celery")).await.unwrap();
        let held = broker
            .dequeue("celery", "c1", Duration::from_millis(10))
            .await
            .unwrap()
            .expect("delivery");
        broker
            .renew_lease("c1", &["celery".to_string()], Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(broker.recover_orphans("celery").await.unwrap(), 1);

        let next = held.next_attempt(Duration::ZERO, Utc::now());
        broker.schedule_retry(&next, "c1").await.unwrap();
        assert_eq!(broker.queue_depth("celery").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_records_and_revocation() {
        let broker = MemoryBroker::new();
        broker
            .store_record(&TaskRecord::in_flight("t1", TaskStatus::Received, 1))
            .await
            .unwrap();
        assert_eq!(broker.record_count(), 1);

        assert_eq!(broker.revoke_unstarted("t1").await.unwrap(), None);
        assert!(broker.is_revoked("t1").await.unwrap());
        assert!(broker.load_record("t1").await.unwrap().is_none());

        let started = TaskRecord::in_flight("t1", TaskStatus::Started, 1);
        assert!(!broker.mark_started(&started).await.unwrap());
        assert_eq!(broker.record_count(), 0);
    }

    #[tokio::test]
    async fn test_started_task_cannot_be_revoked() {
        let broker = MemoryBroker::new();
        let started = TaskRecord::in_flight("t1", TaskStatus::Started, 1);
        assert!(broker.mark_started(&started).await.unwrap());

        assert_eq!(
            broker.revoke_unstarted("t1").await.unwrap(),
            Some(TaskStatus::Started)
        );
        assert!(!broker.is_revoked("t1").await.unwrap());
        assert_eq!(
            broker.load_record("t1").await.unwrap().unwrap().status,
            TaskStatus::Started
        );
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let broker = MemoryBroker::new();
        broker.fail_queue("b");
        assert!(broker.queue_depth("a").await.is_ok());
        assert!(matches!(
            broker.queue_depth("b").await,
            Err(QueueError::Operation(_))
        ));

        broker.set_unavailable(true);
        assert!(matches!(broker.ping().await, Err(QueueError::Unavailable(_))));
        broker.set_unavailable(false);
        assert!(broker.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_serve_registers_until_shutdown() {
        let broker = MemoryBroker::new();
        let (tx, rx) = broadcast::channel(1);
        let server = broker.clone();
        let handle = tokio::spawn(async move { server.serve("worker@a", rx).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            broker.probe(Duration::ZERO).await.unwrap(),
            vec!["worker@a".to_string()]
        );

        tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
        assert!(broker.probe(Duration::ZERO).await.unwrap().is_empty());
    }
}
