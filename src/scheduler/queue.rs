//! Redis-backed task broker and result store.
//!
//! This module provides the durable side of the system:
//!
//! - Atomic dequeue using BRPOPLPUSH into a per-consumer processing list
//! - Consumer leases, so only the lists of dead consumers are recovered
//! - Delayed delivery (countdown and retry delays) through a sorted set
//! - A per-task result store with expiry
//! - Revocation markers for forgotten tasks
//! - A pub/sub liveness probe answered by every running worker
//!
//! # Key Layout
//!
//! - `{queue}`: ready envelopes, LPUSH in, BRPOPLPUSH out from the right
//! - `{queue}:processing:{consumer}`: envelopes held by one worker pool
//! - `{prefix}:consumers:{queue}`: consumers that have dequeued from `queue`
//! - `{prefix}:lease:{consumer}`: present while the consumer is alive, with TTL
//! - `{prefix}:delayed:{queue}`: envelopes with an ETA, scored by ETA ms
//! - `{prefix}:task-meta:{id}`: JSON `TaskRecord`, with TTL
//! - `{prefix}:revoked:{id}`: revocation marker, with TTL
//! - `{prefix}:control:ping`: pub/sub channel carrying a reply list key
//!
//! # Reliability
//!
//! Envelopes are atomically moved to the consumer's processing list when
//! dequeued. A running pool keeps renewing its lease. Once a lease lapses
//! (crash, lost network or graceful release), any surviving pool pushes that
//! consumer's stranded envelopes back onto the queue. Live consumers' lists
//! are never touched.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::job::{TaskEnvelope, TaskRecord, TaskStatus};
use crate::error::QueueError;

/// Default Redis key prefix.
pub const DEFAULT_KEY_PREFIX: &str = "dockq";

/// Default lifetime of stored task records (one day).
pub const DEFAULT_RESULT_TTL: Duration = Duration::from_secs(86_400);

/// KEYS: meta, revoked. ARGV: record JSON, ttl secs.
const MARK_STARTED_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[2]) == 1 then
  return 0
end
redis.call('SET', KEYS[1], ARGV[1], 'EX', ARGV[2])
return 1
";

/// KEYS: meta, revoked. ARGV: ttl secs, then the forgettable status names.
const REVOKE_UNSTARTED_SCRIPT: &str = r"
local data = redis.call('GET', KEYS[1])
if data then
  local status = cjson.decode(data)['status']
  local forgettable = false
  for i = 2, #ARGV do
    if ARGV[i] == status then
      forgettable = true
    end
  end
  if not forgettable then
    return status
  end
end
redis.call('SET', KEYS[2], '1', 'EX', ARGV[1])
redis.call('DEL', KEYS[1])
return false
";

/// Durable queue plus result store used by the gateway and the workers.
///
/// Deliveries are scoped to a `consumer`, the id of one running worker pool.
#[async_trait]
pub trait TaskBroker: Send + Sync {
    /// Checks that the broker can be reached at all.
    async fn ping(&self) -> Result<(), QueueError>;

    /// Adds an envelope to its queue. Envelopes with a future ETA are held
    /// back until [`TaskBroker::promote_due`] moves them.
    async fn enqueue(&self, envelope: &TaskEnvelope) -> Result<(), QueueError>;

    /// Takes the next ready envelope from `queue` into `consumer`'s
    /// processing list, waiting up to `timeout`.
    async fn dequeue(
        &self,
        queue: &str,
        consumer: &str,
        timeout: Duration,
    ) -> Result<Option<TaskEnvelope>, QueueError>;

    /// Releases an envelope a worker has finished with.
    async fn ack(&self, envelope: &TaskEnvelope, consumer: &str) -> Result<(), QueueError>;

    /// Enqueues the next attempt and releases the current delivery as one
    /// step. On error neither happened and the delivery stays held.
    ///
    /// If the delivery is no longer held (its lease lapsed and another pool
    /// requeued it), nothing is enqueued.
    async fn schedule_retry(&self, next: &TaskEnvelope, consumer: &str)
        -> Result<(), QueueError>;

    /// Moves delayed envelopes whose ETA has passed onto the ready queue.
    async fn promote_due(&self, queue: &str, now: DateTime<Utc>) -> Result<usize, QueueError>;

    /// Marks `consumer` alive on `queues` for `ttl`.
    async fn renew_lease(
        &self,
        consumer: &str,
        queues: &[String],
        ttl: Duration,
    ) -> Result<(), QueueError>;

    /// Drops `consumer`'s lease so anything it still holds is recoverable.
    async fn release_lease(&self, consumer: &str) -> Result<(), QueueError>;

    /// Pushes envelopes held by consumers of `queue` whose lease has lapsed
    /// back onto the queue.
    async fn recover_orphans(&self, queue: &str) -> Result<usize, QueueError>;

    /// Number of ready envelopes in `queue`.
    async fn queue_depth(&self, queue: &str) -> Result<u64, QueueError>;

    async fn store_record(&self, record: &TaskRecord) -> Result<(), QueueError>;

    async fn load_record(&self, task_id: &str) -> Result<Option<TaskRecord>, QueueError>;

    async fn delete_record(&self, task_id: &str) -> Result<(), QueueError>;

    /// Stores a STARTED record unless the task has been revoked.
    ///
    /// Returns `false`, storing nothing, when it was revoked.
    async fn mark_started(&self, record: &TaskRecord) -> Result<bool, QueueError>;

    /// Revokes a task that has not started and deletes its record.
    ///
    /// Returns `None` once revoked, or the current status when the task can
    /// no longer be forgotten. The check and the revocation form one step
    /// with respect to [`TaskBroker::mark_started`].
    async fn revoke_unstarted(&self, task_id: &str) -> Result<Option<TaskStatus>, QueueError>;

    async fn is_revoked(&self, task_id: &str) -> Result<bool, QueueError>;
}

/// Broadcast probe answered by every live worker.
#[async_trait]
pub trait WorkerProbe: Send + Sync {
    /// Returns the node names that answered within `timeout`.
    async fn probe(&self, timeout: Duration) -> Result<Vec<String>, QueueError>;

    /// Answers probes as `node_name` until `shutdown` fires.
    async fn serve(
        &self,
        node_name: &str,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<(), QueueError>;
}

/// Connection settings for [`RedisBroker`].
#[derive(Debug, Clone)]
pub struct RedisBrokerConfig {
    /// Redis connection URL (e.g., "redis://localhost:6379").
    pub url: String,
    /// Prefix for every key that is not a queue list.
    pub key_prefix: String,
    /// Expiry of task records and revocation markers.
    pub result_ttl: Duration,
}

impl Default for RedisBrokerConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            result_ttl: DEFAULT_RESULT_TTL,
        }
    }
}

impl RedisBrokerConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_result_ttl(mut self, ttl: Duration) -> Self {
        self.result_ttl = ttl;
        self
    }
}

/// Redis implementation of [`TaskBroker`] and [`WorkerProbe`].
#[derive(Clone)]
pub struct RedisBroker {
    client: redis::Client,
    /// Shared connection for short commands.
    redis: ConnectionManager,
    /// BRPOPLPUSH holds its connection for the whole wait, so blocking pops
    /// get their own connection.
    blocking: ConnectionManager,
    config: RedisBrokerConfig,
}

impl RedisBroker {
    /// Connects to Redis.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Unavailable` if the connection fails.
    pub async fn connect(config: RedisBrokerConfig) -> Result<Self, QueueError> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;

        let redis = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;
        let blocking = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;

        Ok(Self {
            client,
            redis,
            blocking,
            config,
        })
    }

    pub fn config(&self) -> &RedisBrokerConfig {
        &self.config
    }

    fn processing_key(queue: &str, consumer: &str) -> String {
        format!("{}:processing:{}", queue, consumer)
    }

    fn consumers_key(&self, queue: &str) -> String {
        format!("{}:consumers:{}", self.config.key_prefix, queue)
    }

    fn lease_key(&self, consumer: &str) -> String {
        format!("{}:lease:{}", self.config.key_prefix, consumer)
    }

    fn delayed_key(&self, queue: &str) -> String {
        format!("{}:delayed:{}", self.config.key_prefix, queue)
    }

    fn meta_key(&self, task_id: &str) -> String {
        format!("{}:task-meta:{}", self.config.key_prefix, task_id)
    }

    fn revoked_key(&self, task_id: &str) -> String {
        format!("{}:revoked:{}", self.config.key_prefix, task_id)
    }

    fn control_channel(&self) -> String {
        format!("{}:control:ping", self.config.key_prefix)
    }

    fn ttl_secs(&self) -> u64 {
        self.config.result_ttl.as_secs().max(1)
    }

    /// Finds the raw processing-list entry holding `task_id`.
    async fn find_in_processing(
        &self,
        processing: &str,
        task_id: &str,
    ) -> Result<Option<String>, QueueError> {
        let mut conn = self.redis.clone();
        let entries: Vec<String> = conn.lrange(processing, 0, -1).await?;
        Ok(entries.into_iter().find(|data| {
            serde_json::from_str::<TaskEnvelope>(data).is_ok_and(|envelope| envelope.id == task_id)
        }))
    }
}

#[async_trait]
impl TaskBroker for RedisBroker {
    async fn ping(&self) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn enqueue(&self, envelope: &TaskEnvelope) -> Result<(), QueueError> {
        let serialized = serde_json::to_string(envelope)?;
        let mut conn = self.redis.clone();

        match envelope.eta.filter(|eta| *eta > Utc::now()) {
            Some(eta) => {
                let _: () = conn
                    .zadd(self.delayed_key(envelope.queue()), serialized, eta.timestamp_millis())
                    .await?;
            }
            None => {
                conn.lpush::<_, _, ()>(envelope.queue(), serialized).await?;
            }
        }
        Ok(())
    }

    async fn dequeue(
        &self,
        queue: &str,
        consumer: &str,
        timeout: Duration,
    ) -> Result<Option<TaskEnvelope>, QueueError> {
        let mut conn = self.blocking.clone();
        let timeout_secs = timeout.as_secs().max(1) as usize;

        let result: Option<String> = redis::cmd("BRPOPLPUSH")
            .arg(queue)
            .arg(Self::processing_key(queue, consumer))
            .arg(timeout_secs)
            .query_async(&mut conn)
            .await?;

        match result {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    async fn ack(&self, envelope: &TaskEnvelope, consumer: &str) -> Result<(), QueueError> {
        let processing = Self::processing_key(envelope.queue(), consumer);
        // Not found is not an error: it may have been recovered already
        if let Some(data) = self.find_in_processing(&processing, &envelope.id).await? {
            let mut conn = self.redis.clone();
            conn.lrem::<_, _, ()>(&processing, 1, &data).await?;
        }
        Ok(())
    }

    async fn schedule_retry(
        &self,
        next: &TaskEnvelope,
        consumer: &str,
    ) -> Result<(), QueueError> {
        let processing = Self::processing_key(next.queue(), consumer);
        let Some(held) = self.find_in_processing(&processing, &next.id).await? else {
            warn!(task_id = %next.id, "Delivery no longer held, leaving the retry to its new owner");
            return Ok(());
        };

        let serialized = serde_json::to_string(next)?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        match next.eta.filter(|eta| *eta > Utc::now()) {
            Some(eta) => {
                pipe.zadd(self.delayed_key(next.queue()), serialized, eta.timestamp_millis())
                    .ignore();
            }
            None => {
                pipe.lpush(next.queue(), serialized).ignore();
            }
        }
        pipe.lrem(&processing, 1, &held).ignore();

        let mut conn = self.redis.clone();
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn promote_due(&self, queue: &str, now: DateTime<Utc>) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let delayed = self.delayed_key(queue);

        let due: Vec<String> = conn
            .zrangebyscore(&delayed, "-inf", now.timestamp_millis())
            .await?;

        let mut promoted = 0;
        for data in due {
            // Only the worker whose ZREM removes the member pushes it
            let removed: i64 = conn.zrem(&delayed, &data).await?;
            if removed == 1 {
                conn.lpush::<_, _, ()>(queue, &data).await?;
                promoted += 1;
            }
        }
        Ok(promoted)
    }

    async fn renew_lease(
        &self,
        consumer: &str,
        queues: &[String],
        ttl: Duration,
    ) -> Result<(), QueueError> {
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("SET")
            .arg(self.lease_key(consumer))
            .arg(1)
            .arg("PX")
            .arg(ttl.as_millis().max(1) as u64)
            .ignore();
        for queue in queues {
            pipe.sadd(self.consumers_key(queue), consumer).ignore();
        }

        let mut conn = self.redis.clone();
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn release_lease(&self, consumer: &str) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        conn.del::<_, ()>(self.lease_key(consumer)).await?;
        Ok(())
    }

    async fn recover_orphans(&self, queue: &str) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let consumers_key = self.consumers_key(queue);
        let consumers: Vec<String> = conn.smembers(&consumers_key).await?;
        let mut recovered = 0;

        for consumer in consumers {
            let alive: bool = conn.exists(self.lease_key(&consumer)).await?;
            if alive {
                continue;
            }

            let processing = Self::processing_key(queue, &consumer);
            // Each move is atomic, so concurrent recoverers never push the
            // same entry twice
            while conn
                .rpoplpush::<_, _, Option<String>>(&processing, queue)
                .await?
                .is_some()
            {
                recovered += 1;
            }
            conn.srem::<_, _, ()>(&consumers_key, &consumer).await?;
            debug!(queue = %queue, consumer = %consumer, "Dropped lapsed consumer");
        }

        if recovered > 0 {
            info!(queue = %queue, recovered, "Recovered envelopes from lapsed consumers");
        }
        Ok(recovered)
    }

    async fn queue_depth(&self, queue: &str) -> Result<u64, QueueError> {
        let mut conn = self.redis.clone();
        let len: u64 = conn.llen(queue).await?;
        Ok(len)
    }

    async fn store_record(&self, record: &TaskRecord) -> Result<(), QueueError> {
        let data = serde_json::to_string(record)?;
        let mut conn = self.redis.clone();
        redis::cmd("SET")
            .arg(self.meta_key(&record.task_id))
            .arg(data)
            .arg("EX")
            .arg(self.ttl_secs())
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn load_record(&self, task_id: &str) -> Result<Option<TaskRecord>, QueueError> {
        let mut conn = self.redis.clone();
        let data: Option<String> = conn.get(self.meta_key(task_id)).await?;

        match data {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    async fn delete_record(&self, task_id: &str) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        conn.del::<_, ()>(self.meta_key(task_id)).await?;
        Ok(())
    }

    async fn mark_started(&self, record: &TaskRecord) -> Result<bool, QueueError> {
        let data = serde_json::to_string(record)?;
        let mut conn = self.redis.clone();
        let stored: i64 = redis::Script::new(MARK_STARTED_SCRIPT)
            .key(self.meta_key(&record.task_id))
            .key(self.revoked_key(&record.task_id))
            .arg(data)
            .arg(self.ttl_secs())
            .invoke_async(&mut conn)
            .await?;
        Ok(stored == 1)
    }

    async fn revoke_unstarted(&self, task_id: &str) -> Result<Option<TaskStatus>, QueueError> {
        let script = redis::Script::new(REVOKE_UNSTARTED_SCRIPT);
        let mut invocation = script.key(self.meta_key(task_id));
        invocation.key(self.revoked_key(task_id)).arg(self.ttl_secs());
        for status in TaskStatus::ALL.iter().filter(|s| s.is_forgettable()) {
            invocation.arg(status.as_str());
        }

        let mut conn = self.redis.clone();
        let blocking: Option<String> = invocation.invoke_async(&mut conn).await?;
        blocking
            .map(|name| name.parse::<TaskStatus>().map_err(QueueError::Operation))
            .transpose()
    }

    async fn is_revoked(&self, task_id: &str) -> Result<bool, QueueError> {
        let mut conn = self.redis.clone();
        let exists: bool = conn.exists(self.revoked_key(task_id)).await?;
        Ok(exists)
    }
}


#[async_trait]
impl WorkerProbe for RedisBroker {
    async fn probe(&self, timeout: Duration) -> Result<Vec<String>, QueueError> {
        let mut conn = self.redis.clone();
        let reply_key = format!("{}:control:reply:{}", self.config.key_prefix, Uuid::new_v4());

        conn.publish::<_, _, ()>(self.control_channel(), &reply_key)
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;

        tokio::time::sleep(timeout).await;

        let replies: Vec<String> = conn.lrange(&reply_key, 0, -1).await?;
        conn.del::<_, ()>(&reply_key).await?;
        Ok(replies)
    }

    /// Each probe message carries a reply list key; the node name is pushed
    /// onto it and the key is given a short expiry so abandoned replies do
    /// not linger.
    async fn serve(
        &self,
        node_name: &str,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), QueueError> {
        let mut pubsub = self
            .client
            .get_async_connection()
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))?
            .into_pubsub();
        let channel = self.control_channel();
        pubsub.subscribe(&channel).await?;
        info!(node = %node_name, channel = %channel, "Answering liveness probes");

        let mut messages = pubsub.on_message();
        loop {
            tokio::select! {
                msg = messages.next() => {
                    let Some(msg) = msg else {
                        warn!(node = %node_name, "Liveness channel closed");
                        break;
                    };
                    let reply_key: String = match msg.get_payload() {
                        Ok(key) => key,
                        Err(e) => {
                            warn!(error = %e, "Ignoring malformed liveness probe");
                            continue;
                        }
                    };
                    let mut conn = self.redis.clone();
                    let mut pipe = redis::pipe();
                    pipe.rpush(&reply_key, node_name).ignore()
                        .expire(&reply_key, 60).ignore();
                    if let Err(e) = pipe.query_async::<_, ()>(&mut conn).await {
                        warn!(node = %node_name, error = %e, "Failed to answer liveness probe");
                    } else {
                        debug!(node = %node_name, "Answered liveness probe");
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
        Ok(())
    }
}
