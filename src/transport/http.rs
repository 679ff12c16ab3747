use super::Transport;
use crate::error::Stage;
use crate::types::{CallDescriptor, MergedCall, Response};
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::Method;
use std::collections::HashMap;
use std::env;
use std::time::Duration;
use url::Url;

/// Request id header attached to every outbound call.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpTransportConfig {
    /// Client-side timeout for a whole request. A call's own timeout shortens it.
    pub timeout: Duration,
    pub pool_max_idle_per_host: usize,
    pub pool_idle_timeout: Duration,
    /// Query parameter carrying the comma-separated item ids of a merged call.
    pub batch_param: String,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            pool_max_idle_per_host: 32,
            pool_idle_timeout: Duration::from_secs(90),
            batch_param: "ids".to_string(),
        }
    }
}

impl HttpTransportConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `PIPELINE_HTTP_*` environment variables.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(secs) = env_parse::<u64>("PIPELINE_HTTP_TIMEOUT_SECS") {
            cfg.timeout = Duration::from_secs(secs);
        }
        if let Some(n) = env_parse::<usize>("PIPELINE_HTTP_POOL_MAX_IDLE_PER_HOST") {
            cfg.pool_max_idle_per_host = n;
        }
        if let Some(secs) = env_parse::<u64>("PIPELINE_HTTP_POOL_IDLE_TIMEOUT_SECS") {
            cfg.pool_idle_timeout = Duration::from_secs(secs);
        }
        cfg
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_batch_param(mut self, name: impl Into<String>) -> Self {
        self.batch_param = name.into();
        self
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|s| s.parse::<T>().ok())
}

/// reqwest-backed [`Transport`].
///
/// Sends `method base_url + route[/item]`; merged calls become
/// `GET base_url + route?ids=a,b,c`.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    config: HttpTransportConfig,
}

impl HttpTransport {
    pub fn new(base_url: &str) -> Result<Self> {
        Self::with_config(base_url, HttpTransportConfig::from_env())
    }

    pub fn with_config(base_url: &str, config: HttpTransportConfig) -> Result<Self> {
        let parsed = Url::parse(base_url).map_err(|e| {
            Error::configuration_with_context(
                format!("invalid base url: {}", e),
                ErrorContext::new()
                    .with_field_path("transport.base_url")
                    .with_details(base_url.to_string())
                    .with_source("http_transport"),
            )
        })?;

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .pool_idle_timeout(Some(config.pool_idle_timeout))
            .build()
            .map_err(|e| {
                Error::configuration_with_context(
                    format!("failed to build http client: {}", e),
                    ErrorContext::new().with_source("http_transport"),
                )
            })?;

        Ok(Self {
            client,
            base_url: parsed.as_str().trim_end_matches('/').to_string(),
            config,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> Result<Url> {
        let joined = if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        };
        Url::parse(&joined).map_err(|e| {
            Error::configuration_with_context(
                format!("invalid request url: {}", e),
                ErrorContext::new()
                    .with_details(joined)
                    .with_source("http_transport"),
            )
        })
    }

    async fn perform(
        &self,
        call: &CallDescriptor,
        method: Method,
        url: Url,
    ) -> Result<Response> {
        let timeout = call
            .timeout()
            .map(|t| t.min(self.config.timeout))
            .unwrap_or(self.config.timeout);

        let mut req = self
            .client
            .request(method, url)
            .timeout(timeout)
            .header(REQUEST_ID_HEADER, call.id());
        if let Some(body) = call.body() {
            req = req.json(body);
        }

        let send = async {
            let resp = req.send().await.map_err(|e| map_reqwest_error(e, timeout))?;
            read_response(resp, timeout).await
        };

        match call.cancellation() {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => Err(Error::cancelled(Stage::Transport)),
                r = send => r,
            },
            None => send.await,
        }
    }
}

fn map_reqwest_error(e: reqwest::Error, timeout: Duration) -> Error {
    if e.is_timeout() {
        Error::timeout(Stage::Transport, timeout)
    } else {
        Error::network(e.to_string())
    }
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// `error.code` or top-level `code` of a JSON error body.
fn error_code(body: &serde_json::Value) -> Option<String> {
    let code = body
        .pointer("/error/code")
        .or_else(|| body.get("code"))?;
    match code {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

async fn read_response(resp: reqwest::Response, timeout: Duration) -> Result<Response> {
    let status = resp.status();
    let headers: HashMap<String, String> = resp
        .headers()
        .iter()
        .filter_map(|(k, v)| Some((k.as_str().to_string(), v.to_str().ok()?.to_string())))
        .collect();
    let hint = retry_after(resp.headers());

    let text = resp
        .text()
        .await
        .map_err(|e| map_reqwest_error(e, timeout))?;
    let body = if text.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text))
    };

    if !status.is_success() {
        let message = match &body {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Null => status
                .canonical_reason()
                .unwrap_or("request failed")
                .to_string(),
            other => other.to_string(),
        };
        let mut err = Error::upstream(status.as_u16(), message);
        if let Some(code) = error_code(&body) {
            err = err.with_code(code);
        }
        if let Some(after) = hint {
            err = err.with_retry_after(after);
        }
        return Err(err);
    }

    Ok(Response {
        status: status.as_u16(),
        headers,
        body,
    })
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, call: &CallDescriptor) -> Result<Response> {
        let method = Method::from_bytes(call.method().as_bytes()).map_err(|_| {
            Error::configuration_with_context(
                format!("unsupported http method {}", call.method()),
                ErrorContext::new().with_source("http_transport"),
            )
        })?;
        let url = self.url(&call.path())?;
        self.perform(call, method, url).await
    }

    async fn send_batch(&self, merged: &MergedCall) -> Result<Response> {
        let mut url = self.url(merged.target().route())?;
        url.query_pairs_mut()
            .append_pair(&self.config.batch_param, &merged.items().join(","));
        self.perform(merged.descriptor(), Method::GET, url).await
    }
}
