use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;

use crate::domain::{Task, TaskError};
use crate::infrastructure::shutdown::Shutdown;

use super::{Cache, CachedEntry, Completion, WorkQueue};

/// How long a finished result stays around. The API clamps client cache
/// lifetimes to 24h, so anything older is unreachable anyway.
const RESULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Pending markers outlive the producer deadline by a little jitter so a
/// crashed worker cannot wedge a key for long.
const PENDING_TTL: Duration = Duration::from_secs(75);

/// How long one BLPOP blocks before the consumer rechecks shutdown.
const POP_INTERVAL: Duration = Duration::from_secs(1);

fn result_key(cache_key: &str) -> String {
    format!("cache:{cache_key}")
}

fn pending_key(cache_key: &str) -> String {
    format!("pending:{cache_key}")
}

fn done_topic(cache_key: &str) -> String {
    format!("done:{cache_key}")
}

/// Resolves one popped queue message against the coalescing rules: decode
/// the task, claim its pending marker, run the handler, and on success
/// populate the cache before the marker is released. Returns the completion
/// to publish, or `None` when the message must be dropped silently (either
/// undecodable, or another worker already owns the key and will publish).
///
/// Kept generic over the cache so these rules are testable without a broker.
async fn execute_claimed<F, Fut>(
    cache: &dyn Cache,
    handler: &F,
    payload: Vec<u8>,
) -> Result<Option<(String, Completion)>, TaskError>
where
    F: Fn(Vec<u8>) -> Fut,
    Fut: Future<Output = Result<(String, Vec<u8>), TaskError>>,
{
    let cache_key = match serde_json::from_slice::<Task>(&payload) {
        Ok(task) => task.cache_key(),
        Err(err) => {
            tracing::error!(target: "queue", error = %err, "undecodable task message");
            return Ok(None);
        }
    };

    if !cache.claim(&cache_key, PENDING_TTL).await? {
        tracing::debug!(target: "queue", key = %cache_key, "fetch already owned elsewhere");
        return Ok(None);
    }

    match handler(payload).await {
        Ok((key, result)) => {
            cache.put(&key, &result, RESULT_TTL).await?;
            cache.release(&key).await?;
            Ok(Some((key, Completion::ok(result))))
        }
        Err(err) => {
            tracing::warn!(target: "queue", key = %cache_key, error = %err, "task failed");
            cache.release(&cache_key).await?;
            Ok(Some((cache_key, Completion::failed(err.to_string()))))
        }
    }
}

/// Durable queue plus result cache on one Redis instance. The queue is a
/// list popped by competing consumers; completions fan out over pub/sub.
#[derive(Clone)]
pub struct RedisAdapter {
    client: redis::Client,
    conn: MultiplexedConnection,
    queue_name: String,
}

impl RedisAdapter {
    pub async fn connect(redis_url: &str, queue_name: &str) -> Result<Self, TaskError> {
        let client = redis::Client::open(redis_url)
            .map_err(|err| TaskError::CacheUnavailable(err.to_string()))?;
        let mut conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|err| TaskError::CacheUnavailable(err.to_string()))?;
        redis::cmd("PING")
            .query_async::<()>(&mut conn)
            .await
            .map_err(|err| TaskError::CacheUnavailable(err.to_string()))?;
        Ok(Self {
            client,
            conn,
            queue_name: queue_name.to_string(),
        })
    }

    pub fn connection(&self) -> MultiplexedConnection {
        self.conn.clone()
    }

    /// Competing-consumer loop. Each popped task goes through
    /// `execute_claimed`, so concurrent requests for one cache key trigger
    /// exactly one fetch across the whole fleet.
    pub async fn consume_queue<F, Fut>(
        &self,
        shutdown: Shutdown,
        handler: F,
    ) -> Result<(), TaskError>
    where
        F: Fn(Vec<u8>) -> Fut,
        Fut: Future<Output = Result<(String, Vec<u8>), TaskError>>,
    {
        loop {
            if shutdown.is_triggered() {
                tracing::info!(target: "queue", "consumer stopping");
                return Ok(());
            }

            let mut conn = self.conn.clone();
            let popped: Option<(String, Vec<u8>)> = redis::cmd("BLPOP")
                .arg(&self.queue_name)
                .arg(POP_INTERVAL.as_secs_f64())
                .query_async(&mut conn)
                .await
                .map_err(|err| TaskError::CacheUnavailable(err.to_string()))?;

            let Some((_, payload)) = popped else {
                continue;
            };

            if let Some((key, completion)) = execute_claimed(self, &handler, payload).await? {
                self.publish(&key, completion).await?;
            }
        }
    }

    async fn publish(&self, cache_key: &str, completion: Completion) -> Result<(), TaskError> {
        let body = serde_json::to_vec(&completion).map_err(TaskError::internal)?;
        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(done_topic(cache_key), body)
            .await
            .map_err(|err| TaskError::CacheUnavailable(err.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl WorkQueue for RedisAdapter {
    async fn enqueue(
        &self,
        cache_key: &str,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, TaskError> {
        // Subscribe before pushing: the worker may finish faster than we can
        // come back for the result.
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|err| TaskError::CacheUnavailable(err.to_string()))?;
        pubsub
            .subscribe(done_topic(cache_key))
            .await
            .map_err(|err| TaskError::CacheUnavailable(err.to_string()))?;

        let mut conn = self.conn.clone();
        conn.lpush::<_, _, ()>(&self.queue_name, payload)
            .await
            .map_err(|err| TaskError::CacheUnavailable(err.to_string()))?;

        let mut messages = pubsub.on_message();
        let message = tokio::time::timeout(timeout, messages.next())
            .await
            .map_err(|_| TaskError::TaskTimeout)?
            .ok_or_else(|| TaskError::CacheUnavailable("completion stream closed".to_string()))?;

        let completion: Completion = serde_json::from_slice(message.get_payload_bytes())
            .map_err(TaskError::internal)?;
        completion.into_result()
    }
}

#[async_trait]
impl Cache for RedisAdapter {
    async fn get(&self, cache_key: &str) -> Result<Option<CachedEntry>, TaskError> {
        let mut conn = self.conn.clone();
        let raw: Option<Vec<u8>> = conn
            .get(result_key(cache_key))
            .await
            .map_err(|err| TaskError::CacheUnavailable(err.to_string()))?;
        match raw {
            Some(bytes) => {
                let entry = serde_json::from_slice(&bytes).map_err(TaskError::internal)?;
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    async fn put(&self, cache_key: &str, value: &[u8], ttl: Duration) -> Result<(), TaskError> {
        let entry = CachedEntry::new(value.to_vec());
        let body = serde_json::to_vec(&entry).map_err(TaskError::internal)?;
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(result_key(cache_key), body, ttl.as_secs().max(1))
            .await
            .map_err(|err| TaskError::CacheUnavailable(err.to_string()))?;
        Ok(())
    }

    async fn claim(&self, cache_key: &str, ttl: Duration) -> Result<bool, TaskError> {
        let mut conn = self.conn.clone();
        let outcome: Option<String> = redis::cmd("SET")
            .arg(pending_key(cache_key))
            .arg(1)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(|err| TaskError::CacheUnavailable(err.to_string()))?;
        Ok(outcome.is_some())
    }

    async fn release(&self, cache_key: &str) -> Result<(), TaskError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(pending_key(cache_key))
            .await
            .map_err(|err| TaskError::CacheUnavailable(err.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use parking_lot::Mutex;

    use crate::domain::TaskKind;

    use super::*;

    /// Cache double recording every operation in order, with the same
    /// claim atomicity the Redis SET NX provides.
    #[derive(Default)]
    struct RecordingCache {
        entries: Mutex<HashMap<String, Vec<u8>>>,
        pending: Mutex<HashSet<String>>,
        ops: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Cache for RecordingCache {
        async fn get(&self, cache_key: &str) -> Result<Option<CachedEntry>, TaskError> {
            Ok(self
                .entries
                .lock()
                .get(cache_key)
                .map(|value| CachedEntry::new(value.clone())))
        }

        async fn put(&self, cache_key: &str, value: &[u8], _ttl: Duration) -> Result<(), TaskError> {
            self.ops.lock().push(format!("put {cache_key}"));
            self.entries.lock().insert(cache_key.to_string(), value.to_vec());
            Ok(())
        }

        async fn claim(&self, cache_key: &str, _ttl: Duration) -> Result<bool, TaskError> {
            let won = self.pending.lock().insert(cache_key.to_string());
            self.ops.lock().push(format!("claim {cache_key} -> {won}"));
            Ok(won)
        }

        async fn release(&self, cache_key: &str) -> Result<(), TaskError> {
            self.ops.lock().push(format!("release {cache_key}"));
            self.pending.lock().remove(cache_key);
            Ok(())
        }
    }

    fn sample_task() -> Task {
        Task {
            kind: TaskKind::Extract,
            url: "https://example.com/blog".to_string(),
            headers: Default::default(),
            selector_post: "article".to_string(),
            selector_title: "h1".to_string(),
            selector_link: "a".to_string(),
            selector_created: "time".to_string(),
            created_extract_from: crate::domain::ExtractFrom::InnerText,
            created_attribute_name: String::new(),
            selector_description: String::new(),
            selector_author: String::new(),
            selector_content: String::new(),
            selector_enclosure: String::new(),
            salt: String::new(),
        }
    }

    fn payload_and_key() -> (Vec<u8>, String) {
        let task = sample_task();
        (serde_json::to_vec(&task).unwrap(), task.cache_key())
    }

    #[test]
    fn key_namespaces_do_not_collide() {
        assert_eq!(result_key("abc"), "cache:abc");
        assert_eq!(pending_key("abc"), "pending:abc");
        assert_eq!(done_topic("abc"), "done:abc");
        let keys = [result_key("abc"), pending_key("abc"), done_topic("abc")];
        assert_eq!(keys.iter().collect::<HashSet<_>>().len(), 3);
    }

    #[tokio::test]
    async fn success_populates_the_cache_before_releasing_the_claim() {
        let cache = RecordingCache::default();
        let (payload, cache_key) = payload_and_key();

        let outcome = execute_claimed(&cache, &|raw: Vec<u8>| async move {
            let task: Task = serde_json::from_slice(&raw).unwrap();
            Ok((task.cache_key(), b"result-bytes".to_vec()))
        }, payload)
        .await
        .unwrap();

        let (key, completion) = outcome.unwrap();
        assert_eq!(key, cache_key);
        assert_eq!(completion.into_result().unwrap(), b"result-bytes".to_vec());
        assert_eq!(
            *cache.ops.lock(),
            vec![
                format!("claim {cache_key} -> true"),
                format!("put {cache_key}"),
                format!("release {cache_key}"),
            ]
        );
        assert!(cache.entries.lock().contains_key(&cache_key));
        assert!(cache.pending.lock().is_empty());
    }

    #[tokio::test]
    async fn failure_releases_the_claim_and_reports_the_error_without_caching() {
        let cache = RecordingCache::default();
        let (payload, cache_key) = payload_and_key();

        let outcome = execute_claimed(&cache, &|_: Vec<u8>| async {
            Err(TaskError::BlockedHost("http://10.0.0.1/".to_string()))
        }, payload)
        .await
        .unwrap();

        let (key, completion) = outcome.unwrap();
        assert_eq!(key, cache_key);
        let err = completion.into_result().unwrap_err();
        assert!(err.to_string().contains("blocked host"));
        assert!(cache.entries.lock().is_empty());
        assert!(cache.pending.lock().is_empty());
    }

    #[tokio::test]
    async fn deliveries_for_an_already_claimed_key_are_dropped_silently() {
        let cache = RecordingCache::default();
        let (payload, cache_key) = payload_and_key();
        cache.claim(&cache_key, PENDING_TTL).await.unwrap();

        let invocations = AtomicUsize::new(0);
        let outcome = execute_claimed(&cache, &|_: Vec<u8>| {
            invocations.fetch_add(1, Ordering::SeqCst);
            async { Ok(("never".to_string(), Vec::new())) }
        }, payload)
        .await
        .unwrap();

        assert!(outcome.is_none());
        assert_eq!(invocations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn undecodable_payloads_are_skipped_without_claiming() {
        let cache = RecordingCache::default();
        let outcome = execute_claimed(&cache, &|_: Vec<u8>| async {
            Ok(("never".to_string(), Vec::new()))
        }, b"not json".to_vec())
        .await
        .unwrap();

        assert!(outcome.is_none());
        assert!(cache.ops.lock().is_empty());
    }

    #[tokio::test]
    async fn twenty_deliveries_of_one_key_run_exactly_one_fetch() {
        let cache = Arc::new(RecordingCache::default());
        let (payload, cache_key) = payload_and_key();
        let invocations = Arc::new(AtomicUsize::new(0));

        let mut deliveries = Vec::new();
        for _ in 0..20 {
            let cache = Arc::clone(&cache);
            let payload = payload.clone();
            let invocations = Arc::clone(&invocations);
            let key = cache_key.clone();
            deliveries.push(tokio::spawn(async move {
                let handler = |_: Vec<u8>| {
                    let invocations = Arc::clone(&invocations);
                    let key = key.clone();
                    async move {
                        invocations.fetch_add(1, Ordering::SeqCst);
                        Ok((key, b"shared-result".to_vec()))
                    }
                };
                execute_claimed(cache.as_ref(), &handler, payload).await.unwrap()
            }));
        }

        let mut completions = Vec::new();
        for delivery in deliveries {
            if let Some(outcome) = delivery.await.unwrap() {
                completions.push(outcome);
            }
        }

        // One worker wins the claim; everyone else relies on its single
        // published completion, so all waiters see identical bytes.
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
        assert_eq!(completions.len(), 1);
        let (key, completion) = completions.pop().unwrap();
        assert_eq!(key, cache_key);
        assert_eq!(completion.into_result().unwrap(), b"shared-result".to_vec());
    }
}
