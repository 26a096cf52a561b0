//! Redis broker (feature `redis`).
//!
//! Every operation that reads then writes queue state runs as one Lua
//! script, so it is atomic with respect to every other client. "now" is
//! passed in from the injected `Clock`; only unique-key TTLs use Redis time.
//!
//! # Key layout (`p` = key prefix)
//! - `p:t:{id}`                 hash: envelope JSON, payload bytes, state fields
//! - `p:q:{queue}:pending`      list, LPUSH in / RPOP out
//! - `p:q:{queue}:scheduled`    zset by process_at (ms)
//! - `p:q:{queue}:retry`        zset by process_at (ms)
//! - `p:q:{queue}:active`       zset by lease expiry (ms)
//! - `p:q:{queue}:completed`    zset by completed_at (ms)
//! - `p:q:{queue}:dead`         zset by died_at (ms)
//! - `p:queues`                 set of queue names
//! - `p:unique:{type}:{key}`    string holding the task id, PX = TTL

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::domain::options::add_std;
use crate::domain::{CourierError, CourierResult, LeaseId, TaskEnvelope, TaskId, TaskState};
use crate::ports::{Broker, Clock, IdGenerator, QueueCounts, RetryDisposition, UlidGenerator};
use crate::queue::{ClaimedTask, Lease, TaskRecord};

const ENQUEUE: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then return -1 end
if ARGV[8] ~= '' then
  if not redis.call('SET', ARGV[8], ARGV[1], 'NX', 'PX', ARGV[9]) then return 0 end
end
redis.call('HSET', KEYS[1], 'envelope', ARGV[2], 'payload', ARGV[3], 'queue', ARGV[4],
  'retry_count', '0', 'max_retry', ARGV[5], 'process_at', ARGV[6], 'updated_at', ARGV[7],
  'unique_key', ARGV[8])
redis.call('SADD', KEYS[4], ARGV[4])
if tonumber(ARGV[6]) > tonumber(ARGV[7]) then
  redis.call('HSET', KEYS[1], 'state', 'scheduled')
  redis.call('ZADD', KEYS[3], ARGV[6], ARGV[1])
else
  redis.call('HSET', KEYS[1], 'state', 'pending')
  redis.call('LPUSH', KEYS[2], ARGV[1])
end
return 1
"#;

const DEQUEUE: &str = r#"
local now = ARGV[1]
for _, zset in ipairs({KEYS[2], KEYS[3]}) do
  local due = redis.call('ZRANGEBYSCORE', zset, '-inf', now)
  for _, id in ipairs(due) do
    redis.call('ZREM', zset, id)
    redis.call('HSET', ARGV[4] .. id, 'state', 'pending', 'updated_at', now)
    redis.call('LPUSH', KEYS[1], id)
  end
end
local claimed = {}
local n = 0
while n < tonumber(ARGV[2]) do
  local id = redis.call('RPOP', KEYS[1])
  if not id then break end
  local key = ARGV[4] .. id
  if redis.call('HGET', key, 'state') == 'pending' then
    n = n + 1
    local lease = ARGV[4 + n]
    redis.call('HSET', key, 'state', 'active', 'lease_id', lease, 'lease_expires', ARGV[3],
      'updated_at', now)
    redis.call('ZADD', KEYS[4], ARGV[3], id)
    table.insert(claimed, id)
    table.insert(claimed, lease)
  end
end
return claimed
"#;

// Shared prologue: bail out with -2 unless ARGV[2] is the current lease.
const SETTLE_GUARD: &str = r#"
if redis.call('HGET', KEYS[1], 'state') ~= 'active'
  or redis.call('HGET', KEYS[1], 'lease_id') ~= ARGV[2] then
  return -2
end
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('HDEL', KEYS[1], 'lease_id', 'lease_expires')
local function release_unique()
  local unique = redis.call('HGET', KEYS[1], 'unique_key')
  if unique and unique ~= '' and redis.call('GET', unique) == ARGV[1] then
    redis.call('DEL', unique)
  end
end
"#;

const ACK: &str = r#"
redis.call('HSET', KEYS[1], 'state', 'completed', 'completed_at', ARGV[3], 'updated_at', ARGV[3])
redis.call('HDEL', KEYS[1], 'last_error')
redis.call('ZADD', KEYS[3], ARGV[3], ARGV[1])
release_unique()
return 1
"#;

const RETRY: &str = r#"
local retry = tonumber(redis.call('HGET', KEYS[1], 'retry_count'))
local max = tonumber(redis.call('HGET', KEYS[1], 'max_retry'))
if retry >= max then
  redis.call('HSET', KEYS[1], 'state', 'dead', 'last_error', ARGV[5], 'died_at', ARGV[3],
    'updated_at', ARGV[3])
  redis.call('ZADD', KEYS[4], ARGV[3], ARGV[1])
  release_unique()
  return -1
end
local floor = tonumber(redis.call('HGET', KEYS[1], 'process_at')) + 1
local at = string.format('%.0f', math.max(tonumber(ARGV[4]), floor))
redis.call('HSET', KEYS[1], 'state', 'retry', 'retry_count', tostring(retry + 1),
  'process_at', at, 'last_error', ARGV[5], 'updated_at', ARGV[3])
redis.call('ZADD', KEYS[3], at, ARGV[1])
return tonumber(at)
"#;

const DEAD_LETTER: &str = r#"
redis.call('HSET', KEYS[1], 'state', 'dead', 'last_error', ARGV[4], 'died_at', ARGV[3],
  'updated_at', ARGV[3])
redis.call('ZADD', KEYS[3], ARGV[3], ARGV[1])
release_unique()
return 1
"#;

const REAP: &str = r#"
local expired = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
local reclaimed = 0
for _, id in ipairs(expired) do
  redis.call('ZREM', KEYS[1], id)
  local key = ARGV[2] .. id
  if redis.call('HGET', key, 'state') == 'active' then
    redis.call('HSET', key, 'state', 'pending', 'last_error', 'lease expired', 'updated_at', ARGV[1])
    redis.call('HDEL', key, 'lease_id', 'lease_expires')
    redis.call('RPUSH', KEYS[2], id)
    reclaimed = reclaimed + 1
  end
end
local old = redis.call('ZRANGEBYSCORE', KEYS[3], '-inf', ARGV[3])
for _, id in ipairs(old) do
  redis.call('DEL', ARGV[2] .. id)
end
if #old > 0 then redis.call('ZREMRANGEBYSCORE', KEYS[3], '-inf', ARGV[3]) end
return reclaimed
"#;

const REQUEUE_DEAD: &str = r#"
if redis.call('HGET', KEYS[1], 'state') ~= 'dead' then return 0 end
if ARGV[3] ~= '' then
  if not redis.call('SET', ARGV[3], ARGV[1], 'NX', 'PX', ARGV[4]) then return -1 end
end
redis.call('ZREM', KEYS[2], ARGV[1])
local at = math.max(tonumber(ARGV[2]), tonumber(redis.call('HGET', KEYS[1], 'process_at')))
redis.call('HSET', KEYS[1], 'state', 'pending', 'retry_count', '0',
  'process_at', string.format('%.0f', at), 'updated_at', ARGV[2])
redis.call('HDEL', KEYS[1], 'died_at')
redis.call('LPUSH', KEYS[3], ARGV[1])
return 1
"#;

const DELETE: &str = r#"
local state = redis.call('HGET', KEYS[1], 'state')
if not state or state == 'active' then return 0 end
local base = ARGV[2] .. redis.call('HGET', KEYS[1], 'queue')
redis.call('LREM', base .. ':pending', 0, ARGV[1])
for _, suffix in ipairs({':scheduled', ':retry', ':completed', ':dead'}) do
  redis.call('ZREM', base .. suffix, ARGV[1])
end
local unique = redis.call('HGET', KEYS[1], 'unique_key')
if unique and unique ~= '' and redis.call('GET', unique) == ARGV[1] then
  redis.call('DEL', unique)
end
redis.call('DEL', KEYS[1])
return 1
"#;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedisBrokerConfig {
    pub url: String,
    /// Prefix of every key; separate prefixes isolate deployments (and tests).
    pub key_prefix: String,
    pub completed_retention: Duration,
}

impl Default for RedisBrokerConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379/0".to_string(),
            key_prefix: "courier".to_string(),
            completed_retention: Duration::from_secs(24 * 60 * 60),
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
}

struct Scripts {
    enqueue: Script,
    dequeue: Script,
    ack: Script,
    retry: Script,
    dead_letter: Script,
    reap: Script,
    requeue_dead: Script,
    delete: Script,
}

impl Scripts {
    fn load() -> Self {
        let settle = |body: &str| Script::new(&format!("{SETTLE_GUARD}{body}"));
        Self {
            enqueue: Script::new(ENQUEUE),
            dequeue: Script::new(DEQUEUE),
            ack: settle(ACK),
            retry: settle(RETRY),
            dead_letter: settle(DEAD_LETTER),
            reap: Script::new(REAP),
            requeue_dead: Script::new(REQUEUE_DEAD),
            delete: Script::new(DELETE),
        }
    }
}

pub struct RedisBroker {
    conn: ConnectionManager,
    scripts: Arc<Scripts>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    config: RedisBrokerConfig,
}

impl RedisBroker {
    /// Connect to `config.url` (e.g. `redis://127.0.0.1:6379/0`).
    pub async fn connect(config: RedisBrokerConfig, clock: Arc<dyn Clock>) -> CourierResult<Self> {
        let client = redis::Client::open(config.url.as_str())?;
        let conn = ConnectionManager::new(client).await?;
        info!(key_prefix = %config.key_prefix, "connected to redis");
        Ok(Self::new(conn, config, clock))
    }

    pub fn new(conn: ConnectionManager, config: RedisBrokerConfig, clock: Arc<dyn Clock>) -> Self {
        let ids = Arc::new(UlidGenerator::new(Arc::clone(&clock)));
        Self {
            conn,
            scripts: Arc::new(Scripts::load()),
            clock,
            ids,
            config,
        }
    }

    fn task_prefix(&self) -> String {
        format!("{}:t:", self.config.key_prefix)
    }

    fn task_key(&self, id: TaskId) -> String {
        format!("{}{}", self.task_prefix(), id.to_key())
    }

    fn queue_prefix(&self) -> String {
        format!("{}:q:", self.config.key_prefix)
    }

    fn queue_key(&self, queue: &str, suffix: &str) -> String {
        format!("{}{queue}:{suffix}", self.queue_prefix())
    }

    fn queues_key(&self) -> String {
        format!("{}:queues", self.config.key_prefix)
    }

    fn unique_key(&self, envelope: &TaskEnvelope) -> String {
        envelope
            .unique()
            .map(|lock| {
                format!(
                    "{}:unique:{}:{}",
                    self.config.key_prefix,
                    envelope.task_type(),
                    lock.key
                )
            })
            .unwrap_or_default()
    }

    /// Queue the lease's task belongs to, read from its hash.
    async fn queue_of(&self, task_id: TaskId) -> CourierResult<Option<String>> {
        let mut conn = self.conn.clone();
        let queue: Option<String> = conn.hget(self.task_key(task_id), "queue").await?;
        Ok(queue)
    }

    async fn load(&self, task_id: TaskId) -> CourierResult<Option<TaskRecord>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, Vec<u8>> = conn.hgetall(self.task_key(task_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        decode_record(task_id, fields).map(Some)
    }

    /// Run one of the settle scripts (ack / retry / dead-letter).
    async fn settle(
        &self,
        script: &Script,
        lease: &Lease,
        terminal_key: &str,
        extra: &[String],
    ) -> CourierResult<i64> {
        let Some(queue) = self.queue_of(lease.task_id).await? else {
            return Ok(-2);
        };
        let now = to_ms(self.clock.now());
        let mut invocation = script.prepare_invoke();
        invocation
            .key(self.task_key(lease.task_id))
            .key(self.queue_key(&queue, "active"))
            .key(self.queue_key(&queue, terminal_key))
            .key(self.queue_key(&queue, "dead"))
            .arg(lease.task_id.to_key())
            .arg(lease.lease_id.to_key())
            .arg(now);
        for arg in extra {
            invocation.arg(arg);
        }
        let mut conn = self.conn.clone();
        let result: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(result)
    }
}

#[async_trait]
impl Broker for RedisBroker {
    #[instrument(skip_all, fields(task_id = %envelope.id(), task_type = %envelope.task_type(), queue = envelope.queue()))]
    async fn enqueue(
        &self,
        envelope: TaskEnvelope,
        process_at: DateTime<Utc>,
    ) -> CourierResult<TaskId> {
        let task_id = envelope.id();
        let queue = envelope.queue().to_string();
        let unique_key = self.unique_key(&envelope);
        let ttl_ms = unique_ttl_ms(&envelope);
        let meta = serde_json::to_string(&envelope)?;

        let mut conn = self.conn.clone();
        let result: i64 = self
            .scripts
            .enqueue
            .key(self.task_key(task_id))
            .key(self.queue_key(&queue, "pending"))
            .key(self.queue_key(&queue, "scheduled"))
            .key(self.queues_key())
            .arg(task_id.to_key())
            .arg(meta)
            .arg(envelope.payload())
            .arg(&queue)
            .arg(envelope.max_retry())
            .arg(to_ms(process_at))
            .arg(to_ms(self.clock.now()))
            .arg(&unique_key)
            .arg(ttl_ms.to_string())
            .invoke_async(&mut conn)
            .await?;

        match result {
            1 => {
                debug!("enqueued");
                Ok(task_id)
            }
            0 => Err(duplicate(&envelope)),
            _ => Err(CourierError::InvalidTask(format!("{task_id} already exists"))),
        }
    }

    async fn dequeue(
        &self,
        queues: &[String],
        count: usize,
        lease_duration: Duration,
    ) -> CourierResult<Vec<ClaimedTask>> {
        let mut loaded = Vec::new();
        for queue in queues {
            let remaining = count.saturating_sub(loaded.len());
            if remaining == 0 {
                break;
            }
            let now = self.clock.now();
            let expires_at = add_std(now, lease_duration);

            let mut invocation = self.scripts.dequeue.prepare_invoke();
            invocation
                .key(self.queue_key(queue, "pending"))
                .key(self.queue_key(queue, "scheduled"))
                .key(self.queue_key(queue, "retry"))
                .key(self.queue_key(queue, "active"))
                .arg(to_ms(now))
                .arg(remaining)
                .arg(to_ms(expires_at))
                .arg(self.task_prefix());
            for _ in 0..remaining {
                invocation.arg(self.ids.generate_lease_id().to_key());
            }

            let mut conn = self.conn.clone();
            let pairs: Vec<String> = match invocation.invoke_async(&mut conn).await {
                Ok(pairs) => pairs,
                // keep what earlier queues already claimed
                Err(err) if !loaded.is_empty() => {
                    warn!(queue = %queue, error = %err, "dequeue failed; returning partial batch");
                    break;
                }
                Err(err) => return Err(err.into()),
            };

            for pair in pairs.chunks(2) {
                let [task_key, lease_key] = pair else {
                    continue;
                };
                let task_id = parse_id::<TaskId>(task_key)?;
                let lease = Lease {
                    task_id,
                    lease_id: parse_id::<LeaseId>(lease_key)?,
                    expires_at,
                };
                let record = self.load(task_id).await;
                loaded.push((lease, record));
            }
        }
        collect_claims(loaded)
    }

    async fn ack(&self, lease: &Lease) -> CourierResult<()> {
        let result = self.settle(&self.scripts.ack, lease, "completed", &[]).await?;
        if result == -2 {
            debug!(task_id = %lease.task_id, lease_id = %lease.lease_id, "stale lease; ignoring");
        }
        Ok(())
    }

    async fn retry(
        &self,
        lease: &Lease,
        delay: Duration,
        error: &str,
    ) -> CourierResult<RetryDisposition> {
        let candidate = to_ms(add_std(self.clock.now(), delay));
        let result = self
            .settle(
                &self.scripts.retry,
                lease,
                "retry",
                &[candidate.to_string(), error.to_string()],
            )
            .await?;
        Ok(match result {
            -2 => RetryDisposition::Ignored,
            -1 => RetryDisposition::Dead,
            ms => RetryDisposition::Scheduled {
                process_at: from_ms(ms)?,
            },
        })
    }

    async fn dead_letter(&self, lease: &Lease, error: &str) -> CourierResult<()> {
        // the script reads the error from ARGV[4]; ARGV[3] is now
        self.settle(&self.scripts.dead_letter, lease, "dead", &[error.to_string()])
            .await?;
        Ok(())
    }

    async fn reap_expired_leases(&self) -> CourierResult<usize> {
        let now = self.clock.now();
        let cutoff = chrono::Duration::from_std(self.config.completed_retention)
            .ok()
            .and_then(|retention| now.checked_sub_signed(retention))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut reclaimed = 0;
        for queue in self.queues().await? {
            let mut conn = self.conn.clone();
            let n: i64 = self
                .scripts
                .reap
                .key(self.queue_key(&queue, "active"))
                .key(self.queue_key(&queue, "pending"))
                .key(self.queue_key(&queue, "completed"))
                .arg(to_ms(now))
                .arg(self.task_prefix())
                .arg(to_ms(cutoff))
                .invoke_async(&mut conn)
                .await?;
            reclaimed += n.max(0) as usize;
        }
        Ok(reclaimed)
    }

    async fn task(&self, id: TaskId) -> CourierResult<Option<TaskRecord>> {
        self.load(id).await
    }

    async fn counts(&self, queue: &str) -> CourierResult<QueueCounts> {
        let mut conn = self.conn.clone();
        let (pending, scheduled, retry, active, completed, dead): (
            usize,
            usize,
            usize,
            usize,
            usize,
            usize,
        ) = redis::pipe()
            .llen(self.queue_key(queue, "pending"))
            .zcard(self.queue_key(queue, "scheduled"))
            .zcard(self.queue_key(queue, "retry"))
            .zcard(self.queue_key(queue, "active"))
            .zcard(self.queue_key(queue, "completed"))
            .zcard(self.queue_key(queue, "dead"))
            .query_async(&mut conn)
            .await?;
        Ok(QueueCounts {
            pending,
            scheduled,
            active,
            retry,
            completed,
            dead,
        })
    }

    async fn queues(&self) -> CourierResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut queues: Vec<String> = conn.smembers(self.queues_key()).await?;
        queues.sort();
        Ok(queues)
    }

    async fn requeue_dead(&self, id: TaskId) -> CourierResult<bool> {
        let Some(record) = self.load(id).await? else {
            return Ok(false);
        };
        let envelope = &record.envelope;
        let queue = envelope.queue();
        let mut conn = self.conn.clone();
        let result: i64 = self
            .scripts
            .requeue_dead
            .key(self.task_key(id))
            .key(self.queue_key(queue, "dead"))
            .key(self.queue_key(queue, "pending"))
            .arg(id.to_key())
            .arg(to_ms(self.clock.now()))
            .arg(self.unique_key(envelope))
            .arg(unique_ttl_ms(envelope).to_string())
            .invoke_async(&mut conn)
            .await?;
        match result {
            -1 => Err(duplicate(envelope)),
            n => Ok(n == 1),
        }
    }

    async fn delete_task(&self, id: TaskId) -> CourierResult<bool> {
        let mut conn = self.conn.clone();
        let result: i64 = self
            .scripts
            .delete
            .key(self.task_key(id))
            .arg(id.to_key())
            .arg(self.queue_prefix())
            .invoke_async(&mut conn)
            .await?;
        Ok(result == 1)
    }
}

/// Turn a freshly claimed batch into `ClaimedTask`s.
///
/// A task whose hash could not be read stays active under its lease and is
/// reclaimed by the reaper once that expires; the rest of the batch is still
/// handed out. Errors only when nothing could be loaded.
fn collect_claims(
    loaded: Vec<(Lease, CourierResult<Option<TaskRecord>>)>,
) -> CourierResult<Vec<ClaimedTask>> {
    let mut claimed = Vec::with_capacity(loaded.len());
    let mut first_err = None;
    for (lease, record) in loaded {
        match record {
            Ok(Some(record)) => claimed.push(ClaimedTask {
                envelope: record.envelope,
                lease,
                retry_count: record.retry_count,
                last_error: record.last_error,
            }),
            Ok(None) => {}
            Err(err) => {
                warn!(task_id = %lease.task_id, error = %err, "claimed task could not be loaded; left for the reaper");
                if first_err.is_none() {
                    first_err = Some(err);
                }
            }
        }
    }
    match first_err {
        Some(err) if claimed.is_empty() => Err(err),
        _ => Ok(claimed),
    }
}

fn unique_ttl_ms(envelope: &TaskEnvelope) -> u128 {
    envelope
        .unique()
        .map(|lock| lock.ttl.as_millis().max(1))
        .unwrap_or(0)
}

fn duplicate(envelope: &TaskEnvelope) -> CourierError {
    CourierError::DuplicateTask {
        task_type: envelope.task_type().clone(),
        unique_key: envelope.unique().map(|l| l.key.clone()).unwrap_or_default(),
    }
}

fn to_ms(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_ms(ms: i64) -> CourierResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| CourierError::Codec(format!("timestamp out of range: {ms}")))
}

fn parse_id<I: FromStr<Err = ulid::DecodeError>>(raw: &str) -> CourierResult<I> {
    raw.parse()
        .map_err(|e| CourierError::Codec(format!("bad id '{raw}': {e}")))
}

fn text(fields: &HashMap<String, Vec<u8>>, name: &str) -> Option<String> {
    fields
        .get(name)
        .map(|raw| String::from_utf8_lossy(raw).into_owned())
        .filter(|s| !s.is_empty())
}

fn millis(fields: &HashMap<String, Vec<u8>>, name: &str) -> CourierResult<Option<DateTime<Utc>>> {
    text(fields, name)
        .map(|raw| {
            raw.parse::<i64>()
                .map_err(|e| CourierError::Codec(format!("field {name}: {e}")))
                .and_then(from_ms)
        })
        .transpose()
}

fn required<T>(value: Option<T>, name: &str) -> CourierResult<T> {
    value.ok_or_else(|| CourierError::Codec(format!("task hash missing field {name}")))
}

fn decode_record(task_id: TaskId, mut fields: HashMap<String, Vec<u8>>) -> CourierResult<TaskRecord> {
    let payload = fields.remove("payload").unwrap_or_default();
    let meta = required(fields.get("envelope"), "envelope")?;
    let envelope = serde_json::from_slice::<TaskEnvelope>(meta)?.with_payload(payload);

    let state = TaskState::from_str(&required(text(&fields, "state"), "state")?)
        .map_err(CourierError::Codec)?;
    let retry_count = required(text(&fields, "retry_count"), "retry_count")?
        .parse::<u32>()
        .map_err(|e| CourierError::Codec(format!("field retry_count: {e}")))?;

    let lease = match (text(&fields, "lease_id"), millis(&fields, "lease_expires")?) {
        (Some(lease_id), Some(expires_at)) => Some(Lease {
            task_id,
            lease_id: parse_id(&lease_id)?,
            expires_at,
        }),
        _ => None,
    };

    Ok(TaskRecord {
        envelope,
        state,
        retry_count,
        process_at: required(millis(&fields, "process_at")?, "process_at")?,
        last_error: text(&fields, "last_error"),
        lease,
        updated_at: required(millis(&fields, "updated_at")?, "updated_at")?,
        completed_at: millis(&fields, "completed_at")?,
        died_at: millis(&fields, "died_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskType;
    use chrono::TimeZone;
    use ulid::Ulid;

    fn loaded(now: DateTime<Utc>) -> (Lease, TaskRecord) {
        let envelope = TaskEnvelope::new(
            TaskId::from_ulid(Ulid::new()),
            TaskType::new("email:verify"),
            br#"{"username":"alice"}"#.to_vec(),
            now,
        );
        let lease = Lease {
            task_id: envelope.id(),
            lease_id: LeaseId::from_ulid(Ulid::new()),
            expires_at: now,
        };
        (lease, TaskRecord::new(envelope, now, now))
    }

    #[test]
    fn unreadable_task_does_not_drop_the_rest_of_the_batch() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap();
        let (first, first_record) = loaded(now);
        let (broken, _) = loaded(now);
        let (last, last_record) = loaded(now);

        let claimed = collect_claims(vec![
            (first.clone(), Ok(Some(first_record))),
            (broken, Err(CourierError::BrokerUnavailable("connection reset".into()))),
            (last.clone(), Ok(Some(last_record))),
        ])
        .unwrap();

        let ids: Vec<_> = claimed.iter().map(|c| c.lease.task_id).collect();
        assert_eq!(ids, vec![first.task_id, last.task_id]);
    }

    #[test]
    fn batch_with_nothing_loadable_reports_the_error() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap();
        let (broken, _) = loaded(now);
        let (gone, _) = loaded(now);

        let err = collect_claims(vec![
            (gone, Ok(None)),
            (broken, Err(CourierError::BrokerUnavailable("connection reset".into()))),
        ])
        .unwrap_err();
        assert!(matches!(err, CourierError::BrokerUnavailable(_)));
        assert!(collect_claims(Vec::new()).unwrap().is_empty());
    }
}
