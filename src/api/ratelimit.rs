use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};

use crate::config::ClientLimitConfig;

struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Per-client token bucket. One bucket per real client IP, created lazily;
/// a request either takes a token immediately or is rejected, there is no
/// queueing on the API side.
pub struct ClientRateLimiter {
    /// Tokens refilled per second.
    rate: f64,
    burst: f64,
    buckets: RwLock<HashMap<IpAddr, Arc<Mutex<Bucket>>>>,
}

impl ClientRateLimiter {
    pub fn new(config: ClientLimitConfig) -> Self {
        Self {
            rate: 1.0 / config.every_seconds.max(f64::EPSILON),
            burst: f64::from(config.burst),
            buckets: RwLock::new(HashMap::new()),
        }
    }

    pub fn allow(&self, ip: IpAddr) -> bool {
        self.allow_at(ip, Instant::now())
    }

    fn allow_at(&self, ip: IpAddr, now: Instant) -> bool {
        let bucket = self.bucket(ip, now);
        let mut bucket = bucket.lock();
        let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.burst);
        bucket.last = now;
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn bucket(&self, ip: IpAddr, now: Instant) -> Arc<Mutex<Bucket>> {
        {
            let buckets = self.buckets.read();
            if let Some(bucket) = buckets.get(&ip) {
                return Arc::clone(bucket);
            }
        }
        // Double-checked under the write lock: another request may have
        // created the bucket between the locks.
        let mut buckets = self.buckets.write();
        Arc::clone(buckets.entry(ip).or_insert_with(|| {
            Arc::new(Mutex::new(Bucket {
                tokens: self.burst,
                last: now,
            }))
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn limiter(every_seconds: f64, burst: u32) -> ClientRateLimiter {
        ClientRateLimiter::new(ClientLimitConfig {
            every_seconds,
            burst,
        })
    }

    #[test]
    fn burst_then_reject() {
        let limiter = limiter(60.0, 2);
        let ip: IpAddr = "198.51.100.4".parse().unwrap();
        let now = Instant::now();
        assert!(limiter.allow_at(ip, now));
        assert!(limiter.allow_at(ip, now));
        assert!(!limiter.allow_at(ip, now));
    }

    #[test]
    fn tokens_refill_over_time() {
        let limiter = limiter(60.0, 1);
        let ip: IpAddr = "198.51.100.4".parse().unwrap();
        let now = Instant::now();
        assert!(limiter.allow_at(ip, now));
        assert!(!limiter.allow_at(ip, now));
        assert!(limiter.allow_at(ip, now + Duration::from_secs(60)));
    }

    #[test]
    fn refill_never_exceeds_burst() {
        let limiter = limiter(1.0, 2);
        let ip: IpAddr = "198.51.100.4".parse().unwrap();
        let now = Instant::now();
        let later = now + Duration::from_secs(3600);
        assert!(limiter.allow_at(ip, later));
        assert!(limiter.allow_at(ip, later));
        assert!(!limiter.allow_at(ip, later));
    }

    #[test]
    fn clients_have_independent_buckets() {
        let limiter = limiter(60.0, 1);
        let now = Instant::now();
        let first: IpAddr = "198.51.100.4".parse().unwrap();
        let second: IpAddr = "198.51.100.5".parse().unwrap();
        assert!(limiter.allow_at(first, now));
        assert!(limiter.allow_at(second, now));
        assert!(!limiter.allow_at(first, now));
    }
}
