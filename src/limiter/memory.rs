use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::domain::TaskError;

use super::Limiter;

struct BucketState {
    level: u32,
    last_tick: Instant,
}

/// Leaky bucket kept in process memory. Single-instance runs and the
/// extractor CLI use this; the fleet shares state through Redis instead.
pub struct MemoryLeakyBucket {
    capacity: u32,
    leak_interval: Duration,
    buckets: Mutex<HashMap<String, BucketState>>,
}

impl MemoryLeakyBucket {
    pub fn new(leak_interval: Duration, capacity: u32) -> Self {
        Self {
            capacity,
            leak_interval,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    fn limit_at(&self, key: &str, now: Instant) -> Duration {
        let mut buckets = self.buckets.lock();
        let state = buckets.entry(key.to_string()).or_insert(BucketState {
            level: 0,
            last_tick: now,
        });

        let elapsed = now.saturating_duration_since(state.last_tick);
        let leaked = (elapsed.as_nanos() / self.leak_interval.as_nanos().max(1)) as u32;
        let level = state.level.saturating_sub(leaked);
        let last_tick = state.last_tick + self.leak_interval * leaked;

        if level < self.capacity {
            state.level = level + 1;
            state.last_tick = last_tick;
            return Duration::ZERO;
        }
        // Full: report the remainder of the current leak interval, keep state.
        self.leak_interval
            .saturating_sub(now.saturating_duration_since(last_tick))
    }
}

#[async_trait]
impl Limiter for MemoryLeakyBucket {
    async fn limit(&self, key: &str) -> Result<Duration, TaskError> {
        Ok(self.limit_at(key, Instant::now()))
    }
}
