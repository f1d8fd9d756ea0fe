use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use url::Url;

use crate::config::{AppConfig, IpRange};
use crate::domain::task::FORWARDED_HEADERS;
use crate::domain::{ScreenshotResult, Task, TaskError, TaskResult};
use crate::feed::render_feed;
use crate::queue::{Cache, WorkQueue};

use super::ratelimit::ClientRateLimiter;
use super::specs::decode_specs;

/// Producer-side deadline for one task round-trip through the queue.
const TASK_TIMEOUT: Duration = Duration::from_secs(60);

pub struct ApiState {
    queue: Arc<dyn WorkQueue>,
    cache: Arc<dyn Cache>,
    limiter: ClientRateLimiter,
    trusted_ranges: Vec<IpRange>,
    real_ip_header: Option<String>,
    debug: bool,
}

impl ApiState {
    pub fn new(config: &AppConfig, queue: Arc<dyn WorkQueue>, cache: Arc<dyn Cache>) -> Self {
        Self {
            queue,
            cache,
            limiter: ClientRateLimiter::new(config.client_limit),
            trusted_ranges: config.trusted_ip_ranges.clone(),
            real_ip_header: config.real_ip_header.clone(),
            debug: config.debug,
        }
    }
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/render/:specs", get(handle_render))
        .route("/screenshot", get(handle_screenshot))
        .with_state(state)
}

async fn handle_render(
    State(state): State<Arc<ApiState>>,
    Path(specs_param): Path<String>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let specs = decode_specs(&specs_param)?;

    let mut cache_lifetime = specs.cache_lifetime;
    if state.debug {
        cache_lifetime = Duration::ZERO;
    }

    let task = specs.into_task(forwarded_headers(&headers));
    let task_url = task.url.clone();
    let cache_key = task.cache_key();

    let cached = state.cache.get(&cache_key).await?;
    let result_bytes = match cached.filter(|entry| entry.age() <= cache_lifetime) {
        Some(entry) => entry.value,
        None => {
            if !state.limiter.allow(state.client_ip(&headers, peer)) {
                return Err(ApiError(TaskError::RateLimited));
            }
            let payload = serde_json::to_vec(&task).map_err(TaskError::internal)?;
            state
                .queue
                .enqueue(&cache_key, &payload, TASK_TIMEOUT)
                .await?
        }
    };

    let result: TaskResult =
        serde_json::from_slice(&result_bytes).map_err(TaskError::internal)?;
    let atom = render_feed(&task_url, &result)?;

    Ok(([(CONTENT_TYPE, "text/xml")], atom).into_response())
}

async fn handle_screenshot(
    State(state): State<Arc<ApiState>>,
    Query(params): Query<HashMap<String, String>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let page_url = params.get("url").cloned().unwrap_or_default();
    if Url::parse(&page_url).is_err() {
        return Err(ApiError(TaskError::BadRequest(
            "url is invalid or missing".to_string(),
        )));
    }

    if !state.limiter.allow(state.client_ip(&headers, peer)) {
        return Err(ApiError(TaskError::RateLimited));
    }

    let task = Task::screenshot(page_url, forwarded_headers(&headers));
    let payload = serde_json::to_vec(&task).map_err(TaskError::internal)?;
    let result_bytes = state
        .queue
        .enqueue(&task.cache_key(), &payload, TASK_TIMEOUT)
        .await?;

    let result: ScreenshotResult =
        serde_json::from_slice(&result_bytes).map_err(TaskError::internal)?;
    Ok(([(CONTENT_TYPE, "image/png")], result.image).into_response())
}

fn forwarded_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut forwarded = BTreeMap::new();
    for name in FORWARDED_HEADERS {
        if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
            if !value.is_empty() {
                forwarded.insert(name.to_string(), value.to_string());
            }
        }
    }
    forwarded
}

impl ApiState {
    /// The peer address, unless it is a trusted reverse proxy that forwarded
    /// the client's address in the configured header.
    fn client_ip(&self, headers: &HeaderMap, peer: SocketAddr) -> std::net::IpAddr {
        let Some(header_name) = &self.real_ip_header else {
            return peer.ip();
        };
        if !self.trusted_ranges.iter().any(|range| range.contains(peer.ip())) {
            return peer.ip();
        }
        headers
            .get(header_name)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .and_then(|value| value.trim().parse().ok())
            .unwrap_or_else(|| peer.ip())
    }
}

/// Maps pipeline errors onto the HTTP surface.
struct ApiError(TaskError);

impl From<TaskError> for ApiError {
    fn from(err: TaskError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            TaskError::BadRequest(_) => StatusCode::BAD_REQUEST,
            TaskError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(target: "api", error = %self.0, "request failed");
        }
        (status, self.0.to_string()).into_response()
    }
}
