use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::domain::TaskError;

/// Extra socket headroom on top of the solver's own deadline.
const TIMEOUT_MARGIN: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolverCookie {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverProxy {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// One `POST /v1` body. Everything except `cmd` is optional on the wire.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SolverRequest {
    pub cmd: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cookies: Vec<SolverCookie>,
    #[serde(rename = "maxTimeout", skip_serializing_if = "Option::is_none")]
    pub max_timeout: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy: Option<SolverProxy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    #[serde(rename = "session_ttl_minutes", skip_serializing_if = "Option::is_none")]
    pub session_ttl_minutes: Option<u64>,
    #[serde(rename = "returnOnlyCookies", skip_serializing_if = "std::ops::Not::not")]
    pub return_only_cookies: bool,
    #[serde(rename = "returnScreenshot", skip_serializing_if = "std::ops::Not::not")]
    pub return_screenshot: bool,
    #[serde(rename = "waitInSeconds", skip_serializing_if = "Option::is_none")]
    pub wait_in_seconds: Option<u64>,
    #[serde(rename = "disableMedia", skip_serializing_if = "std::ops::Not::not")]
    pub disable_media: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SolverSolution {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub status: u16,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub response: String,
    #[serde(default)]
    pub cookies: Vec<SolverCookie>,
    #[serde(default, rename = "userAgent")]
    pub user_agent: String,
    #[serde(default)]
    pub screenshot: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SolverResponse {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub session: String,
    #[serde(default)]
    pub solution: Option<SolverSolution>,
}

/// The challenge-solving fetcher, narrowed to what the dispatcher needs so
/// tests can substitute a recording double.
#[async_trait]
pub trait RemoteFetch: Send + Sync {
    async fn request(&self, request: SolverRequest) -> Result<SolverResponse, TaskError>;
    async fn create_session(&self, proxy: &SolverProxy) -> Result<String, TaskError>;
    async fn destroy_session(&self, session: &str) -> Result<(), TaskError>;
}

/// JSON-over-HTTPS client for the headless-browser proxy.
pub struct SolverClient {
    http: reqwest::Client,
    endpoint: String,
}

impl SolverClient {
    pub fn new(base_url: &str, max_timeout_ms: u64) -> Result<Self, TaskError> {
        if base_url.is_empty() {
            return Err(TaskError::BadRequest("solver url is empty".to_string()));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(max_timeout_ms) + TIMEOUT_MARGIN)
            .build()
            .map_err(TaskError::internal)?;
        Ok(Self {
            http,
            endpoint: format!("{}/v1", base_url.trim_end_matches('/')),
        })
    }

    async fn call(&self, request: &SolverRequest) -> Result<SolverResponse, TaskError> {
        let response = self
            .http
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .map_err(|err| TaskError::RemoteFetch(err.to_string()))?;

        // The solver reports failures inside the envelope, not via HTTP
        // status, so the body is decoded unconditionally.
        let decoded: SolverResponse = response
            .json()
            .await
            .map_err(|err| TaskError::RemoteFetch(format!("decode response: {err}")))?;
        if decoded.status != "ok" {
            let message = if decoded.message.is_empty() {
                format!("status {}", decoded.status)
            } else {
                decoded.message
            };
            return Err(TaskError::RemoteFetch(message));
        }
        Ok(decoded)
    }
}

#[async_trait]
impl RemoteFetch for SolverClient {
    async fn request(&self, request: SolverRequest) -> Result<SolverResponse, TaskError> {
        self.call(&request).await
    }

    async fn create_session(&self, proxy: &SolverProxy) -> Result<String, TaskError> {
        let response = self
            .call(&SolverRequest {
                cmd: "sessions.create".to_string(),
                proxy: Some(proxy.clone()),
                ..Default::default()
            })
            .await?;
        if response.session.is_empty() {
            return Err(TaskError::RemoteFetch("empty session id".to_string()));
        }
        Ok(response.session)
    }

    async fn destroy_session(&self, session: &str) -> Result<(), TaskError> {
        self.call(&SolverRequest {
            cmd: "sessions.destroy".to_string(),
            session: Some(session.to_string()),
            ..Default::default()
        })
        .await?;
        Ok(())
    }
}

/// Owns one solver session for the duration of a fetch. `destroy` is the
/// normal path; dropping the guard (early return, panic) spawns the destroy
/// instead, so a session never outlives its dispatcher invocation.
pub struct SessionGuard {
    remote: Arc<dyn RemoteFetch>,
    session: Option<String>,
}

impl SessionGuard {
    pub fn new(remote: Arc<dyn RemoteFetch>, session: String) -> Self {
        Self {
            remote,
            session: Some(session),
        }
    }

    pub fn id(&self) -> &str {
        self.session.as_deref().unwrap_or_default()
    }

    pub async fn destroy(mut self) {
        if let Some(session) = self.session.take() {
            if let Err(err) = self.remote.destroy_session(&session).await {
                tracing::warn!(target: "solver", error = %err, "destroy session failed");
            }
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        let remote = Arc::clone(&self.remote);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = remote.destroy_session(&session).await {
                        tracing::warn!(target: "solver", error = %err, "destroy session failed");
                    }
                });
            }
            Err(_) => {
                tracing::warn!(target: "solver", session = %session, "session leaked: no runtime")
            }
        }
    }
}

/// Splits a configured proxy URL into the solver's wire shape plus whether
/// it carries credentials (which forces the session flow) and its host.
pub fn parse_proxy(raw: &str) -> Result<Option<(SolverProxy, bool, String)>, TaskError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    let parsed =
        Url::parse(raw).map_err(|err| TaskError::BadRequest(format!("proxy url: {err}")))?;

    let mut without_user = parsed.clone();
    let _ = without_user.set_username("");
    let _ = without_user.set_password(None);

    let username = Some(parsed.username())
        .filter(|u| !u.is_empty())
        .map(|u| u.to_string());
    let password = parsed.password().map(|p| p.to_string());
    let has_auth = username.is_some() || password.is_some();

    let host = parsed
        .host_str()
        .ok_or_else(|| TaskError::BadRequest("proxy url has no host".to_string()))?
        .to_string();

    Ok(Some((
        SolverProxy {
            url: without_user.to_string(),
            username,
            password,
        },
        has_auth,
        host,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serialization_omits_unset_fields() {
        let request = SolverRequest {
            cmd: "request.get".to_string(),
            url: Some("https://example.com".to_string()),
            max_timeout: Some(60_000),
            ..Default::default()
        };
        let body = serde_json::to_value(&request).unwrap();
        assert_eq!(body["cmd"], "request.get");
        assert_eq!(body["maxTimeout"], 60_000);
        let keys: Vec<&String> = body.as_object().unwrap().keys().collect();
        assert_eq!(keys.len(), 3, "unexpected fields serialized: {keys:?}");
    }

    #[test]
    fn proxy_credentials_are_split_off_the_url() {
        let (proxy, has_auth, host) = parse_proxy("http://u:p@proxy.example:3128")
            .unwrap()
            .unwrap();
        assert_eq!(proxy.url, "http://proxy.example:3128/");
        assert_eq!(proxy.username.as_deref(), Some("u"));
        assert_eq!(proxy.password.as_deref(), Some("p"));
        assert!(has_auth);
        assert_eq!(host, "proxy.example");
    }

    #[test]
    fn plain_proxy_has_no_auth() {
        let (proxy, has_auth, _) = parse_proxy("socks://proxy.example:1080").unwrap().unwrap();
        assert!(proxy.username.is_none());
        assert!(!has_auth);
    }

    #[test]
    fn empty_proxy_config_means_no_proxy() {
        assert!(parse_proxy("").unwrap().is_none());
        assert!(parse_proxy("   ").unwrap().is_none());
    }

    #[test]
    fn solution_decodes_the_solver_envelope() {
        let body = r#"{
            "status": "ok",
            "message": "",
            "solution": {
                "url": "https://example.com/final",
                "status": 200,
                "headers": {},
                "response": "<html></html>",
                "cookies": [{"name": "cf", "value": "x"}],
                "userAgent": "Mozilla/5.0"
            }
        }"#;
        let decoded: SolverResponse = serde_json::from_str(body).unwrap();
        let solution = decoded.solution.unwrap();
        assert_eq!(solution.url, "https://example.com/final");
        assert_eq!(solution.cookies.len(), 1);
        assert!(solution.screenshot.is_empty());
    }
}
