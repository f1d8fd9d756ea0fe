use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::Script;

use crate::domain::TaskError;

use super::Limiter;

/// Admits a request when the bucket holds fewer than `capacity` drops,
/// otherwise returns the milliseconds left until the next drop leaks.
/// Runs server-side so concurrent workers observe one atomic update.
const LEAKY_BUCKET_SCRIPT: &str = r#"
local now_ms = tonumber(ARGV[1])
local interval_ms = tonumber(ARGV[2])
local capacity = tonumber(ARGV[3])
local state = redis.call('HMGET', KEYS[1], 'level', 'last_tick')
local level = tonumber(state[1]) or 0
local last_tick = tonumber(state[2]) or now_ms
local leaked = math.floor((now_ms - last_tick) / interval_ms)
if leaked > 0 then
    level = math.max(0, level - leaked)
    last_tick = last_tick + leaked * interval_ms
end
if level < capacity then
    redis.call('HSET', KEYS[1], 'level', level + 1, 'last_tick', last_tick)
    redis.call('PEXPIRE', KEYS[1], interval_ms * (capacity + 1))
    return 0
end
return interval_ms - (now_ms - last_tick)
"#;

const KEY_PREFIX: &str = "per_domain_limiter";

/// Leaky bucket whose state lives in the shared Redis instance, so every
/// worker in the fleet throttles the same origin together.
pub struct RedisLeakyBucket {
    conn: MultiplexedConnection,
    script: Script,
    leak_interval: Duration,
    capacity: u32,
}

impl RedisLeakyBucket {
    pub fn new(conn: MultiplexedConnection, leak_interval: Duration, capacity: u32) -> Self {
        Self {
            conn,
            script: Script::new(LEAKY_BUCKET_SCRIPT),
            leak_interval,
            capacity,
        }
    }
}

#[async_trait]
impl Limiter for RedisLeakyBucket {
    async fn limit(&self, key: &str) -> Result<Duration, TaskError> {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(TaskError::internal)?
            .as_millis() as u64;

        let mut conn = self.conn.clone();
        let wait_ms: i64 = self
            .script
            .key(format!("{KEY_PREFIX}:{key}"))
            .arg(now_ms)
            .arg(self.leak_interval.as_millis() as u64)
            .arg(self.capacity)
            .invoke_async(&mut conn)
            .await
            .map_err(|err| TaskError::CacheUnavailable(err.to_string()))?;

        Ok(Duration::from_millis(wait_ms.max(0) as u64))
    }
}
