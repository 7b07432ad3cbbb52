use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::models::job::{JobPayload, JobRecord, JobStatus, JobView};
use crate::services::storage::StorageGateway;

pub const DEFAULT_KEY_PREFIX: &str = "mdconv";

/// Move the oldest ready id onto the processing list and lease it in one step,
/// so a reaper never sees a claimed id without its lease.
///
/// KEYS: ready, processing. ARGV: lease key prefix, lease seconds.
const CLAIM_SCRIPT: &str = r#"
local id = redis.call('RPOPLPUSH', KEYS[1], KEYS[2])
if id then
  redis.call('SET', ARGV[1] .. id, 1, 'EX', ARGV[2])
end
return id
"#;

/// Requeue every processing id whose lease key is gone.
///
/// KEYS: processing, ready. ARGV: lease key prefix.
const RECOVER_SCRIPT: &str = r#"
local recovered = 0
for _, id in ipairs(redis.call('LRANGE', KEYS[1], 0, -1)) do
  if redis.call('EXISTS', ARGV[1] .. id) == 0 then
    if redis.call('LREM', KEYS[1], 1, id) > 0 then
      redis.call('RPUSH', KEYS[2], id)
      recovered = recovered + 1
    end
  end
end
return recovered
"#;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("task {0} not found")]
    NotFound(Uuid),

    #[error("Corrupt queue entry: {0}")]
    Corrupt(String),
}

/// Durable task queue plus result store.
///
/// Delivery is at-least-once: a claimed job sits in a processing list under a
/// lease until it is acknowledged, and [`JobBackend::recover_expired`] puts it
/// back on the ready list if the lease runs out first.
#[async_trait]
pub trait JobBackend: Send + Sync {
    /// Write the record, resetting its retention TTL.
    async fn store(&self, record: &JobRecord) -> Result<(), QueueError>;

    /// `None` once the record expired or was removed.
    async fn load(&self, job_id: Uuid) -> Result<Option<JobRecord>, QueueError>;

    async fn remove(&self, job_id: Uuid) -> Result<(), QueueError>;

    /// Make the job claimable now, or at `not_before` when given.
    async fn push(&self, job_id: Uuid, not_before: Option<DateTime<Utc>>)
        -> Result<(), QueueError>;

    /// Take the next due job and hold it under a lease.
    async fn claim(&self, lease: Duration) -> Result<Option<Uuid>, QueueError>;

    async fn ack(&self, job_id: Uuid) -> Result<(), QueueError>;

    async fn revoke(&self, job_id: Uuid) -> Result<(), QueueError>;

    async fn is_revoked(&self, job_id: Uuid) -> Result<bool, QueueError>;

    /// Re-queue claimed jobs whose lease expired. Returns how many moved.
    async fn recover_expired(&self) -> Result<usize, QueueError>;

    /// Jobs waiting to be claimed, immediate and delayed.
    async fn depth(&self) -> Result<u64, QueueError>;

    async fn ping(&self) -> Result<(), QueueError>;
}

/// Redis-backed queue.
///
/// Keys, under a configurable prefix:
/// - `{p}:job:{id}` JSON record with TTL
/// - `{p}:ready` list of ids (LPUSH / RPOPLPUSH)
/// - `{p}:delayed` sorted set of ids scored by due Unix time
/// - `{p}:processing` list of claimed ids
/// - `{p}:lease:{id}` present while a claim is live
/// - `{p}:revoked:{id}` cancellation marker with TTL
pub struct RedisJobBackend {
    client: redis::Client,
    prefix: String,
    result_ttl: Duration,
}

impl RedisJobBackend {
    pub fn new(redis_url: &str, prefix: &str, result_ttl: Duration) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(QueueError::Redis)?;
        Ok(Self {
            client,
            prefix: prefix.to_string(),
            result_ttl,
        })
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection, QueueError> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    fn job_key(&self, job_id: Uuid) -> String {
        format!("{}:job:{}", self.prefix, job_id)
    }

    fn lease_prefix(&self) -> String {
        format!("{}:lease:", self.prefix)
    }

    fn lease_key(&self, job_id: &str) -> String {
        format!("{}{}", self.lease_prefix(), job_id)
    }

    fn revoked_key(&self, job_id: Uuid) -> String {
        format!("{}:revoked:{}", self.prefix, job_id)
    }

    fn ready_key(&self) -> String {
        format!("{}:ready", self.prefix)
    }

    fn delayed_key(&self) -> String {
        format!("{}:delayed", self.prefix)
    }

    fn processing_key(&self) -> String {
        format!("{}:processing", self.prefix)
    }

    fn ttl_secs(&self) -> u64 {
        self.result_ttl.as_secs().max(1)
    }

    /// Move delayed jobs whose due time has passed onto the ready list.
    async fn promote_due(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
    ) -> Result<(), QueueError> {
        let now = Utc::now().timestamp();
        let due: Vec<String> = conn
            .zrangebyscore(self.delayed_key(), "-inf", now)
            .await?;
        for id in due {
            // Only the caller that wins the ZREM promotes the entry.
            let removed: i64 = conn.zrem(self.delayed_key(), &id).await?;
            if removed > 0 {
                conn.lpush::<_, _, ()>(self.ready_key(), &id).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl JobBackend for RedisJobBackend {
    async fn store(&self, record: &JobRecord) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        let payload = serde_json::to_string(record)?;
        conn.set_ex::<_, _, ()>(self.job_key(record.job_id), payload, self.ttl_secs())
            .await?;
        Ok(())
    }

    async fn load(&self, job_id: Uuid) -> Result<Option<JobRecord>, QueueError> {
        let mut conn = self.conn().await?;
        let payload: Option<String> = conn.get(self.job_key(job_id)).await?;
        payload
            .map(|p| serde_json::from_str(&p).map_err(QueueError::Serialize))
            .transpose()
    }

    async fn remove(&self, job_id: Uuid) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        conn.del::<_, ()>(self.job_key(job_id)).await?;
        Ok(())
    }

    async fn push(
        &self,
        job_id: Uuid,
        not_before: Option<DateTime<Utc>>,
    ) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        let id = job_id.to_string();
        match not_before {
            Some(due) if due > Utc::now() => {
                conn.zadd::<_, _, _, ()>(self.delayed_key(), &id, due.timestamp())
                    .await?;
            }
            _ => {
                conn.lpush::<_, _, ()>(self.ready_key(), &id).await?;
            }
        }
        Ok(())
    }

    async fn claim(&self, lease: Duration) -> Result<Option<Uuid>, QueueError> {
        let mut conn = self.conn().await?;
        self.promote_due(&mut conn).await?;

        let claimed: Option<String> = redis::Script::new(CLAIM_SCRIPT)
            .key(self.ready_key())
            .key(self.processing_key())
            .arg(self.lease_prefix())
            .arg(lease.as_secs().max(1))
            .invoke_async(&mut conn)
            .await?;
        let Some(id) = claimed else {
            return Ok(None);
        };

        match Uuid::parse_str(&id) {
            Ok(job_id) => Ok(Some(job_id)),
            Err(_) => {
                conn.lrem::<_, _, ()>(self.processing_key(), 1, &id).await?;
                Err(QueueError::Corrupt(id))
            }
        }
    }

    async fn ack(&self, job_id: Uuid) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        let id = job_id.to_string();
        conn.lrem::<_, _, ()>(self.processing_key(), 1, &id).await?;
        conn.del::<_, ()>(self.lease_key(&id)).await?;
        Ok(())
    }

    async fn revoke(&self, job_id: Uuid) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        conn.set_ex::<_, _, ()>(self.revoked_key(job_id), 1, self.ttl_secs())
            .await?;
        Ok(())
    }

    async fn is_revoked(&self, job_id: Uuid) -> Result<bool, QueueError> {
        let mut conn = self.conn().await?;
        Ok(conn.exists(self.revoked_key(job_id)).await?)
    }

    async fn recover_expired(&self) -> Result<usize, QueueError> {
        let mut conn = self.conn().await?;
        // RPUSH puts recovered ids at the consuming end: redelivered next.
        let recovered: usize = redis::Script::new(RECOVER_SCRIPT)
            .key(self.processing_key())
            .key(self.ready_key())
            .arg(self.lease_prefix())
            .invoke_async(&mut conn)
            .await?;
        Ok(recovered)
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        let mut conn = self.conn().await?;
        let ready: u64 = conn.llen(self.ready_key()).await?;
        let delayed: u64 = conn.zcard(self.delayed_key()).await?;
        Ok(ready + delayed)
    }

    async fn ping(&self) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}

#[derive(Default)]
struct MemoryQueueState {
    records: HashMap<Uuid, (JobRecord, DateTime<Utc>)>,
    ready: VecDeque<Uuid>,
    delayed: Vec<(DateTime<Utc>, Uuid)>,
    processing: HashMap<Uuid, DateTime<Utc>>,
    revoked: HashMap<Uuid, DateTime<Utc>>,
}

impl MemoryQueueState {
    /// Forget records and revocation markers past their retention, the way
    /// Redis expires the matching keys.
    fn prune(&mut self, now: DateTime<Utc>) {
        self.records.retain(|_, (_, expires_at)| *expires_at > now);
        self.revoked.retain(|_, expires_at| *expires_at > now);
    }
}

/// In-process queue for tests and single-node development.
pub struct MemoryJobBackend {
    state: Mutex<MemoryQueueState>,
    result_ttl: Duration,
}

impl MemoryJobBackend {
    pub fn new(result_ttl: Duration) -> Self {
        Self {
            state: Mutex::new(MemoryQueueState::default()),
            result_ttl,
        }
    }

    /// Ids currently held under a lease.
    pub async fn in_flight(&self) -> usize {
        self.state.lock().await.processing.len()
    }

    /// Records and revocation markers still within their retention.
    pub async fn retained(&self) -> (usize, usize) {
        let mut state = self.state.lock().await;
        state.prune(Utc::now());
        (state.records.len(), state.revoked.len())
    }
}

fn deadline(now: DateTime<Utc>, span: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(span).unwrap_or(chrono::Duration::MAX)
}

#[async_trait]
impl JobBackend for MemoryJobBackend {
    async fn store(&self, record: &JobRecord) -> Result<(), QueueError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        state.prune(now);
        state
            .records
            .insert(record.job_id, (record.clone(), deadline(now, self.result_ttl)));
        Ok(())
    }

    async fn load(&self, job_id: Uuid) -> Result<Option<JobRecord>, QueueError> {
        let mut state = self.state.lock().await;
        state.prune(Utc::now());
        Ok(state.records.get(&job_id).map(|(record, _)| record.clone()))
    }

    async fn remove(&self, job_id: Uuid) -> Result<(), QueueError> {
        self.state.lock().await.records.remove(&job_id);
        Ok(())
    }

    async fn push(
        &self,
        job_id: Uuid,
        not_before: Option<DateTime<Utc>>,
    ) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        match not_before {
            Some(due) if due > Utc::now() => state.delayed.push((due, job_id)),
            _ => state.ready.push_back(job_id),
        }
        Ok(())
    }

    async fn claim(&self, lease: Duration) -> Result<Option<Uuid>, QueueError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;

        let mut due: Vec<(DateTime<Utc>, Uuid)> = Vec::new();
        state.delayed.retain(|entry| {
            if entry.0 <= now {
                due.push(*entry);
                false
            } else {
                true
            }
        });
        due.sort();
        state.ready.extend(due.into_iter().map(|(_, id)| id));

        let Some(job_id) = state.ready.pop_front() else {
            return Ok(None);
        };
        state.processing.insert(job_id, deadline(now, lease));
        Ok(Some(job_id))
    }

    async fn ack(&self, job_id: Uuid) -> Result<(), QueueError> {
        self.state.lock().await.processing.remove(&job_id);
        Ok(())
    }

    async fn revoke(&self, job_id: Uuid) -> Result<(), QueueError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        state.prune(now);
        state.revoked.insert(job_id, deadline(now, self.result_ttl));
        Ok(())
    }

    async fn is_revoked(&self, job_id: Uuid) -> Result<bool, QueueError> {
        let mut state = self.state.lock().await;
        state.prune(Utc::now());
        Ok(state.revoked.contains_key(&job_id))
    }

    async fn recover_expired(&self) -> Result<usize, QueueError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let expired: Vec<Uuid> = state
            .processing
            .iter()
            .filter(|(_, until)| **until <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            state.processing.remove(id);
            state.ready.push_front(*id);
        }
        Ok(expired.len())
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        let state = self.state.lock().await;
        Ok((state.ready.len() + state.delayed.len()) as u64)
    }

    async fn ping(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

/// Outcome of [`JobQueue::delete`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteOutcome {
    pub cancelled: bool,
    pub result_removed: bool,
}

/// Client side of the queue: what the API process uses.
#[derive(Clone)]
pub struct JobQueue {
    backend: Arc<dyn JobBackend>,
}

impl JobQueue {
    pub fn new(backend: Arc<dyn JobBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> Arc<dyn JobBackend> {
        self.backend.clone()
    }

    /// Enqueue a conversion job. Returns as soon as it is queued.
    pub async fn submit(&self, payload: JobPayload) -> Result<Uuid, QueueError> {
        let job_id = Uuid::new_v4();
        let record = JobRecord::new(job_id, payload, Utc::now());

        self.backend.store(&record).await?;
        self.backend.push(job_id, None).await?;
        metrics::counter!("conversion_jobs_total").increment(1);

        tracing::info!(
            job_id = %job_id,
            input_object_key = %record.payload.input_object_key,
            filename = %record.payload.original_filename,
            "Conversion job submitted"
        );
        Ok(job_id)
    }

    pub async fn record(&self, job_id: Uuid) -> Result<JobRecord, QueueError> {
        self.backend
            .load(job_id)
            .await?
            .ok_or(QueueError::NotFound(job_id))
    }

    /// Unknown and expired ids are `NotFound`, never `Pending`.
    pub async fn get_status(&self, job_id: Uuid) -> Result<JobView, QueueError> {
        let record = self.record(job_id).await?;
        let revoked = self.backend.is_revoked(job_id).await?;
        Ok(JobView::from_record(&record, revoked))
    }

    /// Best-effort cancellation. Returns `false` when the job already reached
    /// a terminal state, in which case nothing happens.
    pub async fn cancel(&self, job_id: Uuid) -> Result<bool, QueueError> {
        let record = self.record(job_id).await?;
        if record.status().is_terminal() {
            return Ok(false);
        }
        self.backend.revoke(job_id).await?;
        tracing::info!(job_id = %job_id, status = %record.status(), "Cancellation requested");
        Ok(true)
    }

    /// Cancel the job, delete its result object and forget the record.
    ///
    /// The uploaded input object is left alone; uploads are expected to be
    /// expired by a bucket lifecycle rule on the `uploads/` prefix.
    pub async fn delete(
        &self,
        job_id: Uuid,
        storage: &StorageGateway,
    ) -> Result<DeleteOutcome, QueueError> {
        let record = self.record(job_id).await?;
        let cancelled = self.cancel(job_id).await?;

        let mut result_removed = false;
        if record.status() == JobStatus::Succeeded {
            if let Some(key) = record.output_object_key() {
                match storage.delete(key).await {
                    Ok(()) => result_removed = true,
                    Err(e) => {
                        tracing::warn!(job_id = %job_id, object_key = %key, error = %e, "Failed to remove result object")
                    }
                }
            }
        }

        self.backend.remove(job_id).await?;
        tracing::info!(job_id = %job_id, cancelled, result_removed, "Task deleted");
        Ok(DeleteOutcome {
            cancelled,
            result_removed,
        })
    }

    pub async fn depth(&self) -> Result<u64, QueueError> {
        self.backend.depth().await
    }

    /// Check backend connectivity (for health checks).
    pub async fn health_check(&self) -> Result<(), QueueError> {
        self.backend.ping().await
    }
}
