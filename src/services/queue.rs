//! Durable task queue of job ids with priorities, delays, leases and bounded history.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{AsyncCommands, Script};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

const WAITING_KEY: &str = "plate_scan:queue:waiting";
const TASKS_KEY: &str = "plate_scan:queue:tasks";
const ACTIVE_KEY: &str = "plate_scan:queue:active";
const LEASES_KEY: &str = "plate_scan:queue:leases";
const COMPLETED_KEY: &str = "plate_scan:queue:completed";
const FAILED_KEY: &str = "plate_scan:queue:failed";

/// Ready tasks inspected per claim when choosing by priority.
const CLAIM_SCAN_LIMIT: usize = 64;

/// Queue and worker pool tuning. Built from `AppConfig` at startup.
#[derive(Debug, Clone)]
pub struct TaskQueueConfig {
    /// Jobs processed concurrently per worker process
    pub concurrency: usize,
    /// Attempts per task, including the first
    pub max_attempts: u32,
    /// Backoff before the second attempt; doubles for each one after
    pub backoff_base: Duration,
    /// Admission delay applied by [`TaskQueue::enqueue`]
    pub default_delay: Duration,
    pub stall_timeout: Duration,
    pub stall_check_interval: Duration,
    /// Reclaims allowed per task before it is failed instead of re-dispatched
    pub max_stalled_count: u32,
    pub poll_interval: Duration,
    pub keep_completed: usize,
    pub keep_failed: usize,
}

impl Default for TaskQueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            max_attempts: 3,
            backoff_base: Duration::from_secs(2),
            default_delay: Duration::from_secs(1),
            stall_timeout: Duration::from_secs(30),
            stall_check_interval: Duration::from_secs(15),
            max_stalled_count: 1,
            poll_interval: Duration::from_millis(500),
            keep_completed: 10,
            keep_failed: 5,
        }
    }
}

/// Task payload stored in the queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueuedTask {
    pub task_id: Uuid,
    pub job_id: Uuid,
    /// Lower values are dispatched first.
    pub priority: i32,
    /// Attempts that have already run to a failure.
    #[serde(default)]
    pub attempts_made: u32,
    /// Times the task was reclaimed from a silent worker.
    #[serde(default)]
    pub stalled_count: u32,
    pub enqueued_at: DateTime<Utc>,
}

/// Handle returned to callers of `enqueue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskHandle {
    pub task_id: Uuid,
    pub job_id: Uuid,
    /// False when the job was already waiting or active and no task was added.
    pub created: bool,
}

/// A claimed task plus the token proving ownership of it.
#[derive(Debug, Clone)]
pub struct Lease {
    pub task: QueuedTask,
    pub token: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
    Completed {
        #[serde(rename = "detectedPlates")]
        detected_plates: usize,
    },
    Failed {
        error: String,
    },
}

/// Retained record of a finished task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub task: QueuedTask,
    pub finished_at: DateTime<Utc>,
    #[serde(flatten)]
    pub outcome: TaskOutcome,
}

impl TaskRecord {
    pub fn kind(&self) -> HistoryKind {
        match self.outcome {
            TaskOutcome::Completed { .. } => HistoryKind::Completed,
            TaskOutcome::Failed { .. } => HistoryKind::Failed,
        }
    }
}

/// Outcome of one stalled-lease sweep.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReclaimedTasks {
    /// Back in waiting for another worker.
    pub requeued: Vec<QueuedTask>,
    /// Over the stall limit and removed from the queue.
    pub exhausted: Vec<QueuedTask>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryKind {
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Includes delayed tasks and tasks backing off between attempts
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct EnqueueOptions {
    pub priority: i32,
    pub delay: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Storage for queue state. All methods are atomic with respect to each other.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Add `task` unless its job is already waiting or active; returns the task
    /// that ends up queued for that job.
    async fn push(&self, task: &QueuedTask, ready_at_ms: i64) -> Result<QueuedTask, QueueError>;

    /// Take the best ready task whose job is not active and lease it until `lease_until_ms`.
    async fn claim(&self, now_ms: i64, lease_until_ms: i64) -> Result<Option<Lease>, QueueError>;

    /// Extend a lease. False if the lease was lost to the stall sweeper.
    async fn heartbeat(&self, lease: &Lease, lease_until_ms: i64) -> Result<bool, QueueError>;

    /// Drop a finished task. False if the lease was lost.
    async fn release(&self, lease: &Lease) -> Result<bool, QueueError>;

    /// Put a leased task back as waiting with updated bookkeeping.
    async fn reschedule(
        &self,
        lease: &Lease,
        task: &QueuedTask,
        ready_at_ms: i64,
    ) -> Result<bool, QueueError>;

    /// Move tasks with expired leases back to waiting, or drop them once
    /// their stall count exceeds `max_stalled_count`.
    async fn reclaim_stalled(
        &self,
        now_ms: i64,
        max_stalled_count: u32,
    ) -> Result<ReclaimedTasks, QueueError>;

    /// Drop the job's task if it is waiting and not leased.
    async fn discard(&self, job_id: Uuid) -> Result<bool, QueueError>;

    /// Append to the completed or failed history, keeping the newest `keep`.
    async fn record(&self, record: &TaskRecord, keep: usize) -> Result<(), QueueError>;

    /// Newest first.
    async fn history(&self, kind: HistoryKind) -> Result<Vec<TaskRecord>, QueueError>;

    async fn stats(&self) -> Result<QueueStats, QueueError>;

    async fn health_check(&self) -> Result<(), QueueError>;
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Duration as whole milliseconds, saturating.
pub fn duration_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Front door to the queue: admission, backoff policy and inspection.
pub struct TaskQueue {
    backend: Arc<dyn QueueBackend>,
    config: TaskQueueConfig,
}

impl TaskQueue {
    pub fn new(backend: Arc<dyn QueueBackend>, config: TaskQueueConfig) -> Self {
        Self { backend, config }
    }

    pub fn config(&self) -> &TaskQueueConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn QueueBackend> {
        &self.backend
    }

    pub fn default_options(&self) -> EnqueueOptions {
        EnqueueOptions {
            priority: 1,
            delay: self.config.default_delay,
        }
    }

    /// Enqueue with default priority and admission delay.
    pub async fn enqueue(&self, job_id: Uuid) -> Result<TaskHandle, QueueError> {
        self.enqueue_with(job_id, self.default_options()).await
    }

    pub async fn enqueue_with(
        &self,
        job_id: Uuid,
        options: EnqueueOptions,
    ) -> Result<TaskHandle, QueueError> {
        let task = QueuedTask {
            task_id: Uuid::new_v4(),
            job_id,
            priority: options.priority,
            attempts_made: 0,
            stalled_count: 0,
            enqueued_at: Utc::now(),
        };

        let ready_at = now_ms().saturating_add(duration_ms(options.delay));
        let queued = self.backend.push(&task, ready_at).await?;
        let created = queued.task_id == task.task_id;

        if created {
            info!(job_id = %job_id, task_id = %queued.task_id, priority = options.priority, "Job added to queue");
        } else {
            debug!(job_id = %job_id, task_id = %queued.task_id, "Job already queued");
        }

        Ok(TaskHandle {
            task_id: queued.task_id,
            job_id,
            created,
        })
    }

    /// Delay before the attempt following `attempts_made` failures.
    pub fn backoff_delay(&self, attempts_made: u32) -> Duration {
        let exponent = attempts_made.saturating_sub(1).min(20);
        self.config.backoff_base.saturating_mul(2u32.pow(exponent))
    }

    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        self.backend.stats().await
    }

    pub async fn history(&self, kind: HistoryKind) -> Result<Vec<TaskRecord>, QueueError> {
        self.backend.history(kind).await
    }

    pub async fn health_check(&self) -> Result<(), QueueError> {
        self.backend.health_check().await
    }
}

// ── Redis backend ───────────────────────────────────────────────────────────

const PUSH_SCRIPT: &str = r#"
local existing = redis.call('HGET', KEYS[2], ARGV[1])
if existing then
    return existing
end
redis.call('HSET', KEYS[2], ARGV[1], ARGV[2])
redis.call('ZADD', KEYS[1], ARGV[3], ARGV[1])
return ARGV[2]
"#;

const CLAIM_SCRIPT: &str = r#"
local ready = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[4]))
local best, best_priority, best_payload
for _, job_id in ipairs(ready) do
    if redis.call('HEXISTS', KEYS[3], job_id) == 0 then
        local payload = redis.call('HGET', KEYS[2], job_id)
        if payload then
            local priority = cjson.decode(payload)['priority']
            if best == nil or priority < best_priority then
                best, best_priority, best_payload = job_id, priority, payload
            end
        else
            redis.call('ZREM', KEYS[1], job_id)
        end
    end
end
if best == nil then
    return false
end
redis.call('ZREM', KEYS[1], best)
redis.call('HSET', KEYS[3], best, ARGV[3])
redis.call('ZADD', KEYS[4], ARGV[2], best)
return best_payload
"#;

const HEARTBEAT_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], ARGV[1]) == ARGV[2] then
    redis.call('ZADD', KEYS[2], ARGV[3], ARGV[1])
    return 1
end
return 0
"#;

const RELEASE_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], ARGV[1]) == ARGV[2] then
    redis.call('HDEL', KEYS[1], ARGV[1])
    redis.call('ZREM', KEYS[2], ARGV[1])
    redis.call('HDEL', KEYS[3], ARGV[1])
    return 1
end
return 0
"#;

const RESCHEDULE_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], ARGV[1]) == ARGV[2] then
    redis.call('HDEL', KEYS[1], ARGV[1])
    redis.call('ZREM', KEYS[2], ARGV[1])
    redis.call('HSET', KEYS[3], ARGV[1], ARGV[3])
    redis.call('ZADD', KEYS[4], ARGV[4], ARGV[1])
    return 1
end
return 0
"#;

const RECLAIM_SCRIPT: &str = r#"
local expired = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
local requeued, exhausted = {}, {}
for _, job_id in ipairs(expired) do
    redis.call('ZREM', KEYS[1], job_id)
    redis.call('HDEL', KEYS[2], job_id)
    local payload = redis.call('HGET', KEYS[3], job_id)
    if payload then
        local task = cjson.decode(payload)
        task['stalledCount'] = (task['stalledCount'] or 0) + 1
        payload = cjson.encode(task)
        if task['stalledCount'] > tonumber(ARGV[2]) then
            redis.call('HDEL', KEYS[3], job_id)
            table.insert(exhausted, payload)
        else
            redis.call('HSET', KEYS[3], job_id, payload)
            redis.call('ZADD', KEYS[4], ARGV[1], job_id)
            table.insert(requeued, payload)
        end
    end
end
return {requeued, exhausted}
"#;

const DISCARD_SCRIPT: &str = r#"
if redis.call('HEXISTS', KEYS[1], ARGV[1]) == 1 then
    return 0
end
redis.call('ZREM', KEYS[2], ARGV[1])
return redis.call('HDEL', KEYS[3], ARGV[1])
"#;

/// Redis-backed queue state, shared by every API and worker process.
///
/// Layout: `waiting` zset (job id scored by ready time), `tasks` hash (job id
/// to payload, present while waiting or active), `active` hash (job id to
/// lease token), `leases` zset (job id scored by lease deadline), and capped
/// `completed`/`failed` lists.
pub struct RedisQueueBackend {
    client: redis::Client,
    push: Script,
    claim: Script,
    heartbeat: Script,
    release: Script,
    reschedule: Script,
    reclaim: Script,
    discard: Script,
}

impl RedisQueueBackend {
    pub fn new(redis_url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(QueueError::Redis)?;
        Ok(Self::from_client(client))
    }

    pub fn from_client(client: redis::Client) -> Self {
        Self {
            client,
            push: Script::new(PUSH_SCRIPT),
            claim: Script::new(CLAIM_SCRIPT),
            heartbeat: Script::new(HEARTBEAT_SCRIPT),
            release: Script::new(RELEASE_SCRIPT),
            reschedule: Script::new(RESCHEDULE_SCRIPT),
            reclaim: Script::new(RECLAIM_SCRIPT),
            discard: Script::new(DISCARD_SCRIPT),
        }
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection, QueueError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::Redis)
    }

    fn history_key(kind: HistoryKind) -> &'static str {
        match kind {
            HistoryKind::Completed => COMPLETED_KEY,
            HistoryKind::Failed => FAILED_KEY,
        }
    }
}

#[async_trait]
impl QueueBackend for RedisQueueBackend {
    async fn push(&self, task: &QueuedTask, ready_at_ms: i64) -> Result<QueuedTask, QueueError> {
        let mut conn = self.conn().await?;
        let payload = serde_json::to_string(task)?;
        let queued: String = self
            .push
            .key(WAITING_KEY)
            .key(TASKS_KEY)
            .arg(task.job_id.to_string())
            .arg(&payload)
            .arg(ready_at_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(serde_json::from_str(&queued)?)
    }

    async fn claim(&self, now_ms: i64, lease_until_ms: i64) -> Result<Option<Lease>, QueueError> {
        let mut conn = self.conn().await?;
        let token = Uuid::new_v4();
        let payload: Option<String> = self
            .claim
            .key(WAITING_KEY)
            .key(TASKS_KEY)
            .key(ACTIVE_KEY)
            .key(LEASES_KEY)
            .arg(now_ms)
            .arg(lease_until_ms)
            .arg(token.to_string())
            .arg(CLAIM_SCAN_LIMIT)
            .invoke_async(&mut conn)
            .await?;

        match payload {
            Some(payload) => Ok(Some(Lease {
                task: serde_json::from_str(&payload)?,
                token,
            })),
            None => Ok(None),
        }
    }

    async fn heartbeat(&self, lease: &Lease, lease_until_ms: i64) -> Result<bool, QueueError> {
        let mut conn = self.conn().await?;
        let renewed: i32 = self
            .heartbeat
            .key(ACTIVE_KEY)
            .key(LEASES_KEY)
            .arg(lease.task.job_id.to_string())
            .arg(lease.token.to_string())
            .arg(lease_until_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(renewed == 1)
    }

    async fn release(&self, lease: &Lease) -> Result<bool, QueueError> {
        let mut conn = self.conn().await?;
        let released: i32 = self
            .release
            .key(ACTIVE_KEY)
            .key(LEASES_KEY)
            .key(TASKS_KEY)
            .arg(lease.task.job_id.to_string())
            .arg(lease.token.to_string())
            .invoke_async(&mut conn)
            .await?;
        Ok(released == 1)
    }

    async fn reschedule(
        &self,
        lease: &Lease,
        task: &QueuedTask,
        ready_at_ms: i64,
    ) -> Result<bool, QueueError> {
        let mut conn = self.conn().await?;
        let payload = serde_json::to_string(task)?;
        let rescheduled: i32 = self
            .reschedule
            .key(ACTIVE_KEY)
            .key(LEASES_KEY)
            .key(TASKS_KEY)
            .key(WAITING_KEY)
            .arg(lease.task.job_id.to_string())
            .arg(lease.token.to_string())
            .arg(&payload)
            .arg(ready_at_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(rescheduled == 1)
    }

    async fn reclaim_stalled(
        &self,
        now_ms: i64,
        max_stalled_count: u32,
    ) -> Result<ReclaimedTasks, QueueError> {
        let mut conn = self.conn().await?;
        let (requeued, exhausted): (Vec<String>, Vec<String>) = self
            .reclaim
            .key(LEASES_KEY)
            .key(ACTIVE_KEY)
            .key(TASKS_KEY)
            .key(WAITING_KEY)
            .arg(now_ms)
            .arg(max_stalled_count)
            .invoke_async(&mut conn)
            .await?;

        let decode = |payloads: Vec<String>| -> Result<Vec<QueuedTask>, QueueError> {
            payloads
                .iter()
                .map(|p| serde_json::from_str(p).map_err(QueueError::from))
                .collect()
        };
        Ok(ReclaimedTasks {
            requeued: decode(requeued)?,
            exhausted: decode(exhausted)?,
        })
    }

    async fn discard(&self, job_id: Uuid) -> Result<bool, QueueError> {
        let mut conn = self.conn().await?;
        let removed: i32 = self
            .discard
            .key(ACTIVE_KEY)
            .key(WAITING_KEY)
            .key(TASKS_KEY)
            .arg(job_id.to_string())
            .invoke_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }

    async fn record(&self, record: &TaskRecord, keep: usize) -> Result<(), QueueError> {
        if keep == 0 {
            return Ok(());
        }
        let mut conn = self.conn().await?;
        let key = Self::history_key(record.kind());
        let payload = serde_json::to_string(record)?;
        redis::pipe()
            .atomic()
            .lpush(key, payload)
            .ignore()
            .ltrim(key, 0, keep as isize - 1)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn history(&self, kind: HistoryKind) -> Result<Vec<TaskRecord>, QueueError> {
        let mut conn = self.conn().await?;
        let payloads: Vec<String> = conn.lrange(Self::history_key(kind), 0, -1).await?;
        payloads
            .iter()
            .map(|p| serde_json::from_str(p).map_err(QueueError::from))
            .collect()
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let mut conn = self.conn().await?;
        let (waiting, active, completed, failed): (u64, u64, u64, u64) = redis::pipe()
            .zcard(WAITING_KEY)
            .hlen(ACTIVE_KEY)
            .llen(COMPLETED_KEY)
            .llen(FAILED_KEY)
            .query_async(&mut conn)
            .await?;

        Ok(QueueStats {
            waiting,
            active,
            completed,
            failed,
        })
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }
}

// ── In-memory backend ───────────────────────────────────────────────────────

#[derive(Default)]
struct MemoryState {
    tasks: HashMap<Uuid, QueuedTask>,
    /// job id → ready time; insertion sequence breaks ties
    waiting: HashMap<Uuid, (i64, u64)>,
    active: HashMap<Uuid, (Uuid, i64)>,
    completed: VecDeque<TaskRecord>,
    failed: VecDeque<TaskRecord>,
    seq: u64,
}

impl MemoryState {
    fn holds(&self, lease: &Lease) -> bool {
        self.active
            .get(&lease.task.job_id)
            .is_some_and(|(token, _)| *token == lease.token)
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }
}

/// Process-local queue state with the same semantics as [`RedisQueueBackend`].
#[derive(Default)]
pub struct MemoryQueueBackend {
    state: Mutex<MemoryState>,
}

impl MemoryQueueBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl QueueBackend for MemoryQueueBackend {
    async fn push(&self, task: &QueuedTask, ready_at_ms: i64) -> Result<QueuedTask, QueueError> {
        let mut state = self.state();
        if let Some(existing) = state.tasks.get(&task.job_id) {
            return Ok(existing.clone());
        }
        let seq = state.next_seq();
        state.tasks.insert(task.job_id, task.clone());
        state.waiting.insert(task.job_id, (ready_at_ms, seq));
        Ok(task.clone())
    }

    async fn claim(&self, now_ms: i64, lease_until_ms: i64) -> Result<Option<Lease>, QueueError> {
        let mut state = self.state();
        let best = state
            .waiting
            .iter()
            .filter(|(job_id, (ready_at, _))| *ready_at <= now_ms && !state.active.contains_key(*job_id))
            .filter_map(|(job_id, order)| state.tasks.get(job_id).map(|t| (t.priority, *order, *job_id)))
            .min()
            .map(|(_, _, job_id)| job_id);

        let Some(job_id) = best else {
            return Ok(None);
        };

        state.waiting.remove(&job_id);
        let token = Uuid::new_v4();
        state.active.insert(job_id, (token, lease_until_ms));
        let task = state.tasks.get(&job_id).cloned();
        Ok(task.map(|task| Lease { task, token }))
    }

    async fn heartbeat(&self, lease: &Lease, lease_until_ms: i64) -> Result<bool, QueueError> {
        let mut state = self.state();
        if !state.holds(lease) {
            return Ok(false);
        }
        state
            .active
            .insert(lease.task.job_id, (lease.token, lease_until_ms));
        Ok(true)
    }

    async fn release(&self, lease: &Lease) -> Result<bool, QueueError> {
        let mut state = self.state();
        if !state.holds(lease) {
            return Ok(false);
        }
        state.active.remove(&lease.task.job_id);
        state.tasks.remove(&lease.task.job_id);
        Ok(true)
    }

    async fn reschedule(
        &self,
        lease: &Lease,
        task: &QueuedTask,
        ready_at_ms: i64,
    ) -> Result<bool, QueueError> {
        let mut state = self.state();
        if !state.holds(lease) {
            return Ok(false);
        }
        let seq = state.next_seq();
        state.active.remove(&lease.task.job_id);
        state.tasks.insert(task.job_id, task.clone());
        state.waiting.insert(task.job_id, (ready_at_ms, seq));
        Ok(true)
    }

    async fn reclaim_stalled(
        &self,
        now_ms: i64,
        max_stalled_count: u32,
    ) -> Result<ReclaimedTasks, QueueError> {
        let mut guard = self.state();
        let state = &mut *guard;
        let expired: Vec<Uuid> = state
            .active
            .iter()
            .filter(|(_, (_, until))| *until <= now_ms)
            .map(|(job_id, _)| *job_id)
            .collect();

        let mut reclaimed = ReclaimedTasks::default();
        for job_id in expired {
            state.active.remove(&job_id);
            let Some(mut task) = state.tasks.remove(&job_id) else {
                continue;
            };
            task.stalled_count += 1;
            if task.stalled_count > max_stalled_count {
                reclaimed.exhausted.push(task);
            } else {
                let seq = state.next_seq();
                state.tasks.insert(job_id, task.clone());
                state.waiting.insert(job_id, (now_ms, seq));
                reclaimed.requeued.push(task);
            }
        }
        Ok(reclaimed)
    }

    async fn discard(&self, job_id: Uuid) -> Result<bool, QueueError> {
        let mut state = self.state();
        if state.active.contains_key(&job_id) {
            return Ok(false);
        }
        state.waiting.remove(&job_id);
        Ok(state.tasks.remove(&job_id).is_some())
    }

    async fn record(&self, record: &TaskRecord, keep: usize) -> Result<(), QueueError> {
        let mut state = self.state();
        let list = match record.kind() {
            HistoryKind::Completed => &mut state.completed,
            HistoryKind::Failed => &mut state.failed,
        };
        list.push_front(record.clone());
        list.truncate(keep);
        Ok(())
    }

    async fn history(&self, kind: HistoryKind) -> Result<Vec<TaskRecord>, QueueError> {
        let state = self.state();
        let list = match kind {
            HistoryKind::Completed => &state.completed,
            HistoryKind::Failed => &state.failed,
        };
        Ok(list.iter().cloned().collect())
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let state = self.state();
        Ok(QueueStats {
            waiting: state.waiting.len() as u64,
            active: state.active.len() as u64,
            completed: state.completed.len() as u64,
            failed: state.failed.len() as u64,
        })
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(config: TaskQueueConfig) -> TaskQueue {
        TaskQueue::new(Arc::new(MemoryQueueBackend::new()), config)
    }

    fn immediate(priority: i32) -> EnqueueOptions {
        EnqueueOptions {
            priority,
            delay: Duration::ZERO,
        }
    }

    fn record(job_id: Uuid, outcome: TaskOutcome) -> TaskRecord {
        TaskRecord {
            task: QueuedTask {
                task_id: Uuid::new_v4(),
                job_id,
                priority: 1,
                attempts_made: 0,
                stalled_count: 0,
                enqueued_at: Utc::now(),
            },
            finished_at: Utc::now(),
            outcome,
        }
    }

    #[tokio::test]
    async fn test_enqueue_same_job_twice_is_deduplicated() {
        let q = queue(TaskQueueConfig::default());
        let job_id = Uuid::new_v4();

        let first = q.enqueue_with(job_id, immediate(1)).await.unwrap();
        let second = q.enqueue_with(job_id, immediate(1)).await.unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.task_id, second.task_id);
        assert_eq!(q.stats().await.unwrap().waiting, 1);
    }

    #[tokio::test]
    async fn test_claim_respects_priority_then_ready_order() {
        let q = queue(TaskQueueConfig::default());
        let low = Uuid::new_v4();
        let first_high = Uuid::new_v4();
        let second_high = Uuid::new_v4();
        q.enqueue_with(low, immediate(5)).await.unwrap();
        q.enqueue_with(first_high, immediate(1)).await.unwrap();
        q.enqueue_with(second_high, immediate(1)).await.unwrap();

        let now = now_ms() + 10;
        let backend = q.backend();
        let order: Vec<Uuid> = vec![
            backend.claim(now, now + 1000).await.unwrap().unwrap().task.job_id,
            backend.claim(now, now + 1000).await.unwrap().unwrap().task.job_id,
            backend.claim(now, now + 1000).await.unwrap().unwrap().task.job_id,
        ];
        assert_eq!(order, vec![first_high, second_high, low]);
        assert!(backend.claim(now, now + 1000).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delayed_task_not_claimed_early() {
        let q = queue(TaskQueueConfig::default());
        let job_id = Uuid::new_v4();
        q.enqueue_with(
            job_id,
            EnqueueOptions {
                priority: 1,
                delay: Duration::from_secs(60),
            },
        )
        .await
        .unwrap();

        let now = now_ms();
        assert!(q.backend().claim(now, now + 1000).await.unwrap().is_none());
        let later = now + 61_000;
        let lease = q.backend().claim(later, later + 1000).await.unwrap().unwrap();
        assert_eq!(lease.task.job_id, job_id);
    }

    #[tokio::test]
    async fn test_active_job_cannot_be_enqueued_again() {
        let q = queue(TaskQueueConfig::default());
        let job_id = Uuid::new_v4();
        q.enqueue_with(job_id, immediate(1)).await.unwrap();
        let now = now_ms() + 10;
        let lease = q.backend().claim(now, now + 1000).await.unwrap().unwrap();

        let again = q.enqueue_with(job_id, immediate(1)).await.unwrap();
        assert!(!again.created);
        assert!(q.backend().claim(now, now + 1000).await.unwrap().is_none());

        assert!(q.backend().release(&lease).await.unwrap());
        let fresh = q.enqueue_with(job_id, immediate(1)).await.unwrap();
        assert!(fresh.created);
    }

    #[tokio::test]
    async fn test_stalled_lease_is_reclaimed_and_old_lease_rejected() {
        let q = queue(TaskQueueConfig::default());
        let job_id = Uuid::new_v4();
        q.enqueue_with(job_id, immediate(1)).await.unwrap();
        let now = now_ms() + 10;
        let stale = q.backend().claim(now, now + 100).await.unwrap().unwrap();

        assert_eq!(
            q.backend().reclaim_stalled(now + 50, 1).await.unwrap(),
            ReclaimedTasks::default()
        );
        let reclaimed = q.backend().reclaim_stalled(now + 200, 1).await.unwrap();
        assert_eq!(reclaimed.requeued.len(), 1);
        assert!(reclaimed.exhausted.is_empty());
        assert_eq!(reclaimed.requeued[0].stalled_count, 1);

        let fresh = q.backend().claim(now + 200, now + 1000).await.unwrap().unwrap();
        assert_eq!(fresh.task.job_id, job_id);

        assert!(!q.backend().heartbeat(&stale, now + 5000).await.unwrap());
        assert!(!q.backend().release(&stale).await.unwrap());
        assert!(q.backend().heartbeat(&fresh, now + 5000).await.unwrap());
        assert!(q.backend().release(&fresh).await.unwrap());
        assert_eq!(q.stats().await.unwrap(), QueueStats::default());
    }

    #[tokio::test]
    async fn test_task_over_stall_limit_is_dropped() {
        let q = queue(TaskQueueConfig::default());
        let job_id = Uuid::new_v4();
        q.enqueue_with(job_id, immediate(1)).await.unwrap();
        let backend = q.backend();

        let mut now = now_ms() + 10;
        for stall in 1..=2 {
            backend.claim(now, now + 100).await.unwrap().unwrap();
            now += 200;
            let reclaimed = backend.reclaim_stalled(now, 2).await.unwrap();
            assert_eq!(reclaimed.requeued.len(), 1);
            assert_eq!(reclaimed.requeued[0].stalled_count, stall);
        }

        backend.claim(now, now + 100).await.unwrap().unwrap();
        let reclaimed = backend.reclaim_stalled(now + 200, 2).await.unwrap();
        assert!(reclaimed.requeued.is_empty());
        assert_eq!(reclaimed.exhausted.len(), 1);
        assert_eq!(reclaimed.exhausted[0].job_id, job_id);
        assert_eq!(reclaimed.exhausted[0].stalled_count, 3);

        assert!(backend.claim(now + 200, now + 1000).await.unwrap().is_none());
        assert_eq!(q.stats().await.unwrap(), QueueStats::default());
        assert!(q.enqueue_with(job_id, immediate(1)).await.unwrap().created);
    }

    #[tokio::test]
    async fn test_discard_skips_leased_tasks() {
        let q = queue(TaskQueueConfig::default());
        let waiting = Uuid::new_v4();
        let leased = Uuid::new_v4();
        q.enqueue_with(leased, immediate(1)).await.unwrap();
        let now = now_ms() + 10;
        let lease = q.backend().claim(now, now + 1000).await.unwrap().unwrap();
        q.enqueue_with(waiting, immediate(1)).await.unwrap();

        assert!(q.backend().discard(waiting).await.unwrap());
        assert!(!q.backend().discard(waiting).await.unwrap());
        assert!(!q.backend().discard(leased).await.unwrap());

        let stats = q.stats().await.unwrap();
        assert_eq!((stats.waiting, stats.active), (0, 1));
        assert!(q.backend().release(&lease).await.unwrap());
    }

    #[tokio::test]
    async fn test_heartbeat_postpones_reclaim() {
        let q = queue(TaskQueueConfig::default());
        q.enqueue_with(Uuid::new_v4(), immediate(1)).await.unwrap();
        let now = now_ms() + 10;
        let lease = q.backend().claim(now, now + 100).await.unwrap().unwrap();

        assert!(q.backend().heartbeat(&lease, now + 10_000).await.unwrap());
        assert!(q.backend().reclaim_stalled(now + 200, 1).await.unwrap().requeued.is_empty());
        assert_eq!(q.stats().await.unwrap().active, 1);
    }

    #[tokio::test]
    async fn test_reschedule_keeps_attempt_count() {
        let q = queue(TaskQueueConfig::default());
        q.enqueue_with(Uuid::new_v4(), immediate(1)).await.unwrap();
        let now = now_ms() + 10;
        let lease = q.backend().claim(now, now + 1000).await.unwrap().unwrap();

        let mut task = lease.task.clone();
        task.attempts_made = 1;
        assert!(q.backend().reschedule(&lease, &task, now + 500).await.unwrap());
        assert!(q.backend().claim(now, now + 1000).await.unwrap().is_none());

        let retried = q.backend().claim(now + 500, now + 2000).await.unwrap().unwrap();
        assert_eq!(retried.task.attempts_made, 1);
        assert_eq!(retried.task.task_id, lease.task.task_id);
    }

    #[tokio::test]
    async fn test_history_is_bounded_newest_first() {
        let q = queue(TaskQueueConfig::default());
        let backend = q.backend();
        let mut last = Uuid::nil();
        for _ in 0..12 {
            last = Uuid::new_v4();
            backend
                .record(&record(last, TaskOutcome::Completed { detected_plates: 1 }), 10)
                .await
                .unwrap();
        }
        for _ in 0..7 {
            backend
                .record(&record(Uuid::new_v4(), TaskOutcome::Failed { error: "x".into() }), 5)
                .await
                .unwrap();
        }

        let completed = q.history(HistoryKind::Completed).await.unwrap();
        assert_eq!(completed.len(), 10);
        assert_eq!(completed[0].task.job_id, last);
        assert_eq!(q.history(HistoryKind::Failed).await.unwrap().len(), 5);

        let stats = q.stats().await.unwrap();
        assert_eq!((stats.completed, stats.failed), (10, 5));
    }

    #[test]
    fn test_backoff_doubles_per_attempt() {
        let q = queue(TaskQueueConfig {
            backoff_base: Duration::from_millis(2000),
            ..Default::default()
        });
        assert_eq!(q.backoff_delay(1), Duration::from_millis(2000));
        assert_eq!(q.backoff_delay(2), Duration::from_millis(4000));
        assert_eq!(q.backoff_delay(3), Duration::from_millis(8000));
    }

    #[test]
    fn test_record_wire_shape() {
        let rec = record(Uuid::new_v4(), TaskOutcome::Failed { error: "no video stream".into() });
        let value = serde_json::to_value(&rec).unwrap();
        assert_eq!(value["outcome"], "failed");
        assert_eq!(value["error"], "no video stream");
        let back: TaskRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back, rec);
    }
}
