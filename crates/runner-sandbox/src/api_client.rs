//! Default workspace API capability backed by `reqwest`.

use std::sync::Arc;
use std::time::Duration;

use runner_error::DispatchError;
use serde_json::Value;

use crate::types::ExecutionContext;
use crate::{ApiClientFactory, ApiDispatcher};

/// Upstream error bodies are cut to this many bytes before reaching the script.
const MAX_ERROR_BODY: usize = 1024;

/// Talks to the workspace API on behalf of one execution.
///
/// Every request carries `Authorization: Bearer <token>`. The token lives
/// only in this struct and never crosses into the isolate.
pub struct HttpApiClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
    workspace_slug: String,
    timeout: Duration,
}

impl std::fmt::Debug for HttpApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpApiClient")
            .field("base_url", &self.base_url)
            .field("workspace_slug", &self.workspace_slug)
            .finish_non_exhaustive()
    }
}

impl HttpApiClient {
    /// Create a client for `base_url` authenticated with `token`.
    pub fn new(
        base_url: impl Into<String>,
        token: impl Into<String>,
        workspace_slug: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            token: token.into(),
            workspace_slug: workspace_slug.into(),
            timeout,
        }
    }

    /// Join `path` onto the base URL, refusing anything that would leave it.
    fn resolve(&self, path: &str) -> Result<String, DispatchError> {
        if path.contains("://") || path.starts_with("//") || path.contains('\\') {
            return Err(DispatchError::InvalidUrl {
                url: path.to_string(),
                reason: "API paths must be relative to the API base URL".into(),
            });
        }
        let path = path.replace("{workspace_slug}", &self.workspace_slug);
        Ok(format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        ))
    }
}

#[async_trait::async_trait]
impl ApiDispatcher for HttpApiClient {
    async fn request(
        &self,
        method: &str,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, DispatchError> {
        let url = self.resolve(path)?;
        let method = reqwest::Method::from_bytes(method.to_ascii_uppercase().as_bytes())
            .map_err(|_| DispatchError::InvalidUrl {
                url: url.clone(),
                reason: format!("unsupported HTTP method '{method}'"),
            })?;

        tracing::debug!(method = %method, path = %path, "api request");

        let mut req = self
            .client
            .request(method, &url)
            .bearer_auth(&self.token)
            .header(reqwest::header::ACCEPT, "application/json")
            .timeout(self.timeout);
        if let Some(body) = body {
            req = req.json(&body);
        }

        let resp = req.send().await.map_err(|e| self.transport_error(e))?;
        let status = resp.status();
        let text = resp.text().await.map_err(|e| self.transport_error(e))?;

        if !status.is_success() {
            return Err(DispatchError::Upstream {
                status: status.as_u16(),
                message: truncate(&text, MAX_ERROR_BODY),
            });
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
    }
}

impl HttpApiClient {
    fn transport_error(&self, e: reqwest::Error) -> DispatchError {
        if e.is_timeout() {
            DispatchError::Timeout {
                timeout_ms: self.timeout.as_millis() as u64,
            }
        } else {
            // reqwest errors embed the URL; strip it to the path-free message
            DispatchError::Transport(e.without_url().to_string())
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

/// Creates an [`HttpApiClient`] per execution from the execution context.
#[derive(Debug, Clone)]
pub struct HttpApiClientFactory {
    /// Per-request timeout.
    pub timeout: Duration,
}

impl Default for HttpApiClientFactory {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
        }
    }
}

impl ApiClientFactory for HttpApiClientFactory {
    fn create(&self, ctx: &ExecutionContext) -> Arc<dyn ApiDispatcher> {
        Arc::new(HttpApiClient::new(
            ctx.api_base_url.clone(),
            ctx.access_token.clone(),
            ctx.workspace_slug.clone(),
            self.timeout,
        ))
    }
}
