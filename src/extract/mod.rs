mod content;
mod dns;
mod parser;
mod solver;
mod urlutil;

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use url::Url;

use crate::cookies::CookieStore;
use crate::dates::DateParser;
use crate::domain::{ScreenshotResult, Task, TaskError, TaskResult};
use crate::limiter::Limiter;

pub use dns::{DnsCache, HostGate};
pub use parser::PageParser;
pub use solver::{
    parse_proxy, RemoteFetch, SessionGuard, SolverClient, SolverCookie, SolverProxy,
    SolverRequest, SolverResponse, SolverSolution,
};
pub use urlutil::{abs_url, base_domain};

pub struct PageExtractorConfig {
    pub proxy: Option<String>,
    pub max_timeout_ms: u64,
    pub wait_seconds: u64,
}

/// Worker-side execution pipeline for one task: rate-limit the origin, gate
/// the destination, drive the challenge solver (with the session flow when
/// the outbound proxy needs credentials), then parse what came back.
pub struct PageExtractor {
    remote: Arc<dyn RemoteFetch>,
    date_parser: Arc<dyn DateParser>,
    cookies: Arc<dyn CookieStore>,
    limiter: Arc<dyn Limiter>,
    gate: HostGate,
    proxy: Option<SolverProxy>,
    proxy_has_auth: bool,
    max_timeout_ms: u64,
    wait_seconds: u64,
}

impl PageExtractor {
    pub async fn new(
        config: PageExtractorConfig,
        remote: Arc<dyn RemoteFetch>,
        date_parser: Arc<dyn DateParser>,
        cookies: Arc<dyn CookieStore>,
        limiter: Arc<dyn Limiter>,
        dns: Arc<DnsCache>,
    ) -> Result<Self, TaskError> {
        let parsed = parse_proxy(config.proxy.as_deref().unwrap_or(""))?;
        let (proxy, proxy_has_auth, proxy_host) = match parsed {
            Some((proxy, has_auth, host)) => (Some(proxy), has_auth, Some(host)),
            None => (None, false, None),
        };

        // The gate also refuses fetches that would hairpin into the proxy.
        let proxy_ip = match proxy_host {
            Some(host) => Some(
                dns.resolve(&host)
                    .await?
                    .into_iter()
                    .next()
                    .ok_or_else(|| TaskError::Internal("proxy host unresolved".to_string()))?,
            ),
            None => None,
        };

        Ok(Self {
            remote,
            date_parser,
            cookies,
            limiter,
            gate: HostGate::new(dns, proxy_ip),
            proxy,
            proxy_has_auth,
            max_timeout_ms: config.max_timeout_ms,
            wait_seconds: config.wait_seconds,
        })
    }

    pub async fn extract(&self, task: &Task) -> Result<TaskResult, TaskError> {
        let (solution, base_url) = self.fetch_solution(task, false).await?;
        let parser = PageParser::new(task, self.date_parser.as_ref(), base_url);
        parser.parse(&solution.response)
    }

    pub async fn screenshot(&self, task: &Task) -> Result<ScreenshotResult, TaskError> {
        let (solution, _) = self.fetch_solution(task, true).await?;
        if solution.screenshot.is_empty() {
            return Err(TaskError::RemoteFetch("empty screenshot payload".to_string()));
        }
        let image = BASE64
            .decode(solution.screenshot.as_bytes())
            .map_err(|err| TaskError::RemoteFetch(format!("decode screenshot: {err}")))?;
        Ok(ScreenshotResult { image })
    }

    async fn fetch_solution(
        &self,
        task: &Task,
        want_screenshot: bool,
    ) -> Result<(SolverSolution, Option<Url>), TaskError> {
        let (domain, scheme) = base_domain(&task.url)?;
        // Cookie jars are shared across every page of an origin.
        let origin = format!("{scheme}://{domain}");

        let wait = self.limiter.limit(&domain).await?;
        if wait > Duration::ZERO {
            tracing::info!(target: "extract", %domain, ?wait, "origin limiter backoff");
            tokio::time::sleep(wait).await;
        }

        if !self.gate.allow(&task.url).await? {
            return Err(TaskError::BlockedHost(task.url.clone()));
        }

        let (cookie_header, cookies) = self.stored_cookies(task, &origin).await;

        let mut request = SolverRequest {
            cmd: "request.get".to_string(),
            url: Some(task.url.clone()),
            max_timeout: Some(self.max_timeout_ms),
            return_screenshot: want_screenshot,
            ..Default::default()
        };
        if self.wait_seconds > 0 {
            request.wait_in_seconds = Some(self.wait_seconds);
        }
        if !cookies.is_empty() {
            request.cookies = cookies
                .iter()
                .map(|(name, value)| SolverCookie {
                    name: name.clone(),
                    value: value.clone(),
                })
                .collect();
        }

        // The solver cannot attach proxy credentials to a bare request.get,
        // so a credentialed proxy goes through a dedicated session instead.
        let mut session = None;
        if let Some(proxy) = &self.proxy {
            if self.proxy_has_auth {
                let id = self.remote.create_session(proxy).await?;
                let guard = SessionGuard::new(Arc::clone(&self.remote), id);
                request.session = Some(guard.id().to_string());
                session = Some(guard);
            } else {
                request.proxy = Some(proxy.clone());
            }
        }

        let outcome = self
            .fetch_and_inspect(task, request, &origin, &cookie_header, !cookies.is_empty())
            .await;
        if let Some(guard) = session {
            guard.destroy().await;
        }
        outcome
    }

    async fn fetch_and_inspect(
        &self,
        task: &Task,
        request: SolverRequest,
        origin: &str,
        cookie_header: &str,
        had_cookies: bool,
    ) -> Result<(SolverSolution, Option<Url>), TaskError> {
        let response = self.remote.request(request).await?;
        let solution = response
            .solution
            .ok_or_else(|| TaskError::RemoteFetch("empty solver solution".to_string()))?;

        // Redirects may have moved the final URL somewhere forbidden.
        if !solution.url.is_empty() && !self.gate.allow(&solution.url).await? {
            return Err(TaskError::BlockedHost(solution.url.clone()));
        }

        let mut base_url = Url::parse(&task.url).ok();
        if let Ok(final_url) = Url::parse(&solution.url) {
            base_url = Some(final_url);
        }

        if had_cookies {
            let updated: Vec<(String, String)> = solution
                .cookies
                .iter()
                .map(|cookie| (cookie.name.clone(), cookie.value.clone()))
                .collect();
            if let Err(err) = self.cookies.update(origin, cookie_header, &updated).await {
                tracing::warn!(target: "extract", error = %err, "cookie store update failed");
            }
        }

        Ok((solution, base_url))
    }

    /// Cookie lookups fail open: extraction without cookies beats no
    /// extraction at all.
    async fn stored_cookies(&self, task: &Task, origin: &str) -> (String, Vec<(String, String)>) {
        let Some(header) = task.headers.get("Cookie").filter(|v| !v.is_empty()) else {
            return (String::new(), Vec::new());
        };
        match self.cookies.get(origin, header).await {
            Ok(cookies) => {
                tracing::debug!(target: "extract", count = cookies.len(), "stored cookies found");
                (header.clone(), cookies)
            }
            Err(err) => {
                tracing::warn!(target: "extract", error = %err, "cookie store read failed");
                (header.clone(), Vec::new())
            }
        }
    }
}
