use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::api::{self, ApiState};
use crate::config::AppConfig;
use crate::cookies::RedisCookieStore;
use crate::dates::ChronoDateParser;
use crate::extract::{DnsCache, PageExtractor, PageExtractorConfig, SolverClient};
use crate::infrastructure::shutdown::Shutdown;
use crate::limiter::RedisLeakyBucket;
use crate::queue::{Cache, RedisAdapter, WorkQueue};
use crate::worker::Worker;

const QUEUE_NAME: &str = "RENDER_TASKS";
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// The assembled service: HTTP producers and the queue worker share one
/// Redis adapter and go down together on shutdown.
pub struct PagefeedApp {
    listener: TcpListener,
    router: axum::Router,
    worker_handle: JoinHandle<()>,
    sweeper_handle: JoinHandle<()>,
    shutdown: Shutdown,
}

impl PagefeedApp {
    pub async fn initialize(config: AppConfig, shutdown: Shutdown) -> Result<Self> {
        let adapter = RedisAdapter::connect(&config.redis_url, QUEUE_NAME)
            .await
            .context("redis connect failed")?;

        let dns = DnsCache::new();
        let sweeper_handle = dns.spawn_sweeper(shutdown.clone());

        let origin_limiter = RedisLeakyBucket::new(
            adapter.connection(),
            Duration::from_secs_f64(config.origin_limit.every_seconds),
            config.origin_limit.capacity,
        );
        let cookie_store = RedisCookieStore::new(adapter.connection());
        let solver = SolverClient::new(&config.solver.url, config.solver.max_timeout_ms)
            .context("create solver client")?;

        let extractor = PageExtractor::new(
            PageExtractorConfig {
                proxy: config.proxy.clone(),
                max_timeout_ms: config.solver.max_timeout_ms,
                wait_seconds: config.solver.wait_seconds,
            },
            Arc::new(solver),
            Arc::new(ChronoDateParser::new()),
            Arc::new(cookie_store),
            Arc::new(origin_limiter),
            dns,
        )
        .await
        .context("create page extractor")?;

        let adapter = Arc::new(adapter);
        let worker = Arc::new(Worker::new(Arc::clone(&adapter), Arc::new(extractor)));
        let worker_handle = worker.spawn(shutdown.clone());

        let queue: Arc<dyn WorkQueue> = Arc::clone(&adapter) as Arc<dyn WorkQueue>;
        let cache: Arc<dyn Cache> = adapter;
        let state = ApiState::new(&config, queue, cache);
        let router = api::router(Arc::new(state));

        let listener = TcpListener::bind(&config.listen_address)
            .await
            .with_context(|| format!("bind {}", config.listen_address))?;

        Ok(Self {
            listener,
            router,
            worker_handle,
            sweeper_handle,
            shutdown,
        })
    }

    pub async fn run(self) -> Result<()> {
        let PagefeedApp {
            listener,
            router,
            mut worker_handle,
            sweeper_handle,
            shutdown,
        } = self;

        let addr = listener.local_addr().context("listener address")?;
        tracing::info!(target: "app", %addr, "pagefeed listening");

        let mut stop_signal = shutdown.clone();
        let server = axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { stop_signal.wait().await });

        if let Err(err) = server.await {
            tracing::error!(target: "app", error = %err, "http server failed");
        }

        // The server has drained; take the worker and sweeper down with it.
        shutdown.trigger();

        let worker_deadline = tokio::time::sleep(SHUTDOWN_TIMEOUT);
        tokio::pin!(worker_deadline);
        tokio::select! {
            result = &mut worker_handle => {
                if let Err(err) = result {
                    if err.is_panic() {
                        tracing::error!(target: "app", "worker task panicked");
                    }
                }
            }
            _ = &mut worker_deadline => {
                tracing::warn!(
                    target: "app",
                    "worker did not stop within {:?}; aborting",
                    SHUTDOWN_TIMEOUT
                );
                worker_handle.abort();
            }
        }

        sweeper_handle.abort();
        let _ = timeout(Duration::from_millis(100), sweeper_handle).await;

        tracing::info!(target: "app", "pagefeed stopped");
        Ok(())
    }
}
