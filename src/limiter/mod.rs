mod memory;
mod redis_leaky;

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::TaskError;

pub use memory::MemoryLeakyBucket;
pub use redis_leaky::RedisLeakyBucket;

/// Per-key admission control. Returns how long the caller should sleep
/// before proceeding; zero means go now.
#[async_trait]
pub trait Limiter: Send + Sync {
    async fn limit(&self, key: &str) -> Result<Duration, TaskError>;
}
