//! deno_core op definitions for the script sandbox.
//!
//! The `#[op2]` macro generates additional public items (v8 function pointers,
//! metadata structs) that cannot carry doc comments. We suppress `missing_docs`
//! at the module level.
#![allow(missing_docs)]

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine as _;
use deno_core::op2;
use deno_core::OpState;
use deno_error::JsErrorBox;
use runner_error::DispatchError;
use url::Url;

use crate::audit::{sha256_hex, FetchCallAudit};
use crate::ApiDispatcher;

/// Target for `console.*` output from scripts.
pub const JS_LOG_TARGET: &str = "runner::sandbox::js";

/// Execution id prefixed onto console lines.
pub struct ExecutionLabel(pub String);

/// JSON envelope written by the bootstrap once `main` settles.
pub struct ScriptOutcome(pub String);

/// Per-execution network policy and budget for the sandboxed `fetch`.
pub struct FetchPolicy {
    /// Normalized allowed domains. Empty denies everything.
    pub allowed_domains: Vec<String>,
    /// Maximum calls per execution.
    pub max_calls: usize,
    /// Calls made so far.
    pub calls_made: usize,
    /// Maximum response body size in bytes.
    pub max_response_size: usize,
    /// Per-request timeout.
    pub timeout: Duration,
}

/// HTTP client shared by every `fetch` in one execution.
pub struct FetchClient(pub reqwest::Client);

/// Where fetch audit records go.
pub struct FetchAuditSink(pub tokio::sync::mpsc::UnboundedSender<FetchCallAudit>);

/// The API capability plus the token used to scrub its errors.
pub struct ApiCapability {
    pub dispatcher: Arc<dyn ApiDispatcher>,
    pub token: String,
}

// --- Allow-list ---

/// Lower-case and strip a leading `*.` or `.` from an allow-list entry.
pub fn normalize_domain(domain: &str) -> String {
    let d = domain.trim().to_ascii_lowercase();
    let d = d.strip_prefix("*.").unwrap_or(&d);
    d.trim_start_matches('.').trim_end_matches('.').to_string()
}

/// `host` equals an allowed domain or is a subdomain of one.
pub fn host_allowed(host: &str, allowed: &[String]) -> bool {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    allowed.iter().any(|domain| {
        !domain.is_empty()
            && (host == *domain
                || host
                    .strip_suffix(domain.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.')))
    })
}

/// Parse a fetch target and check it against the allow-list.
pub fn check_fetch_url(raw: &str, allowed: &[String]) -> Result<Url, DispatchError> {
    let url = Url::parse(raw).map_err(|e| DispatchError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(DispatchError::InvalidUrl {
            url: raw.to_string(),
            reason: format!("unsupported scheme '{}'", url.scheme()),
        });
    }
    let host = url.host_str().unwrap_or_default().to_string();
    if !host_allowed(&host, allowed) {
        return Err(DispatchError::DomainNotAllowed { host });
    }
    Ok(url)
}

/// Build the per-execution fetch client. Redirects are re-checked against
/// the allow-list so an allowed host cannot bounce a request elsewhere.
pub fn build_fetch_client(allowed: Vec<String>) -> Result<reqwest::Client, reqwest::Error> {
    let policy = reqwest::redirect::Policy::custom(move |attempt| {
        let host = attempt.url().host_str().unwrap_or_default().to_string();
        if attempt.previous().len() >= 10 {
            attempt.error("too many redirects")
        } else if host_allowed(&host, &allowed) {
            attempt.follow()
        } else {
            attempt.error(format!("Domain not allowed: {host}"))
        }
    });
    reqwest::Client::builder().redirect(policy).build()
}

// --- Console and result ---

/// Log a console line from sandbox code.
#[op2(fast)]
pub fn op_runner_log(state: &mut OpState, #[string] level: &str, #[string] msg: &str) {
    let id = state
        .try_borrow::<ExecutionLabel>()
        .map(|l| l.0.as_str())
        .unwrap_or("-");
    match level {
        "error" => tracing::error!(target: JS_LOG_TARGET, "[{}] {}", id, msg),
        "warn" => tracing::warn!(target: JS_LOG_TARGET, "[{}] {}", id, msg),
        "debug" => tracing::debug!(target: JS_LOG_TARGET, "[{}] {}", id, msg),
        "trace" => tracing::trace!(target: JS_LOG_TARGET, "[{}] {}", id, msg),
        _ => tracing::info!(target: JS_LOG_TARGET, "[{}] {}", id, msg),
    }
}

/// Store the execution outcome in OpState. Only the first call counts.
#[op2(fast)]
pub fn op_runner_set_result(state: &mut OpState, #[string] json: &str) {
    if state.try_borrow::<ScriptOutcome>().is_none() {
        state.put(ScriptOutcome(json.to_string()));
    }
}

/// Timer primitive behind `setTimeout` / `setInterval`.
#[op2(async)]
pub async fn op_runner_sleep(#[smi] delay_ms: u32) {
    tokio::time::sleep(Duration::from_millis(u64::from(delay_ms))).await;
}

// --- fetch ---

/// Perform an allow-listed HTTP request.
///
/// Returns `{status, statusText, url, redirected, headers, body}` as JSON.
#[op2(async)]
#[string]
pub async fn op_runner_fetch(
    op_state: Rc<RefCell<OpState>>,
    #[string] url: String,
    #[string] method: String,
    #[string] headers_json: String,
    #[string] body: Option<String>,
) -> Result<String, JsErrorBox> {
    let start = Instant::now();
    let method = method.to_ascii_uppercase();

    let checked = {
        let st = op_state.borrow();
        check_fetch_url(&url, &st.borrow::<FetchPolicy>().allowed_domains)
    };
    let target = match checked {
        Ok(target) => target,
        Err(e) => {
            tracing::debug!(code = e.code(), "fetch rejected");
            let st = op_state.borrow();
            if let Some(sink) = st.try_borrow::<FetchAuditSink>() {
                let _ = sink.0.send(FetchCallAudit {
                    method: method.clone(),
                    host: host_of(&url),
                    url_hash: sha256_hex(&url),
                    status: None,
                    duration_ms: 0,
                    success: false,
                });
            }
            return Err(JsErrorBox::type_error(e.to_string()));
        }
    };

    let (client, max_size, timeout, audit_tx) = {
        let mut st = op_state.borrow_mut();
        let policy = st.borrow_mut::<FetchPolicy>();
        if policy.calls_made >= policy.max_calls {
            return Err(JsErrorBox::type_error(
                DispatchError::LimitExceeded(format!(
                    "fetch call limit reached (max {} calls per execution)",
                    policy.max_calls
                ))
                .to_string(),
            ));
        }
        policy.calls_made += 1;
        let (max_size, timeout) = (policy.max_response_size, policy.timeout);

        let client = st.borrow::<FetchClient>().0.clone();
        let audit_tx = st.try_borrow::<FetchAuditSink>().map(|s| s.0.clone());
        (client, max_size, timeout, audit_tx)
    };

    tracing::debug!(method = %method, url_hash = %sha256_hex(&url), "fetch dispatched");

    let outcome = send_fetch(&client, target, &method, &headers_json, body, max_size, timeout).await;

    if let Some(tx) = audit_tx {
        let _ = tx.send(FetchCallAudit {
            method: method.clone(),
            host: host_of(&url),
            url_hash: sha256_hex(&url),
            status: outcome.as_ref().ok().map(|r| r.status),
            duration_ms: start.elapsed().as_millis() as u64,
            success: outcome.is_ok(),
        });
    }

    let resp = outcome.map_err(|e| JsErrorBox::type_error(e.to_string()))?;
    serde_json::to_string(&resp)
        .map_err(|e| JsErrorBox::generic(format!("response serialization failed: {e}")))
}

/// Render an error and its sources on one line. A rejected redirect only
/// names the blocked host in its source.
fn error_chain(e: &dyn std::error::Error) -> String {
    let mut msg = e.to_string();
    let mut source = e.source();
    while let Some(cause) = source {
        msg.push_str(": ");
        msg.push_str(&cause.to_string());
        source = cause.source();
    }
    msg
}

fn host_of(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_default()
}

#[derive(serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct FetchResponse {
    status: u16,
    status_text: String,
    url: String,
    redirected: bool,
    headers: serde_json::Map<String, serde_json::Value>,
    body: String,
}

async fn send_fetch(
    client: &reqwest::Client,
    target: Url,
    method: &str,
    headers_json: &str,
    body: Option<String>,
    max_size: usize,
    timeout: Duration,
) -> Result<FetchResponse, DispatchError> {
    let method = reqwest::Method::from_bytes(method.as_bytes()).map_err(|_| {
        DispatchError::InvalidUrl {
            url: target.to_string(),
            reason: format!("unsupported HTTP method '{method}'"),
        }
    })?;
    let headers: serde_json::Map<String, serde_json::Value> =
        serde_json::from_str(headers_json).unwrap_or_default();

    let mut req = client.request(method, target.clone()).timeout(timeout);
    for (name, value) in &headers {
        if let Some(v) = value.as_str() {
            req = req.header(name.as_str(), v);
        }
    }
    if let Some(body) = body {
        req = req.body(body);
    }

    let map_err = |e: reqwest::Error| {
        if e.is_timeout() {
            DispatchError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }
        } else {
            DispatchError::Transport(error_chain(&e.without_url()))
        }
    };

    let mut resp = req.send().await.map_err(map_err)?;
    let status = resp.status();
    let redirected = resp.url() != &target;
    let final_url = resp.url().to_string();

    let mut response_headers = serde_json::Map::new();
    for (name, value) in resp.headers() {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        match response_headers.get_mut(name.as_str()) {
            Some(serde_json::Value::String(existing)) => {
                existing.push_str(", ");
                existing.push_str(&value);
            }
            _ => {
                response_headers.insert(name.as_str().to_string(), serde_json::Value::String(value));
            }
        }
    }

    let mut bytes = Vec::new();
    while let Some(chunk) = resp.chunk().await.map_err(map_err)? {
        if bytes.len() + chunk.len() > max_size {
            return Err(DispatchError::LimitExceeded(format!(
                "response body exceeds {max_size} bytes"
            )));
        }
        bytes.extend_from_slice(&chunk);
    }

    Ok(FetchResponse {
        status: status.as_u16(),
        status_text: status.canonical_reason().unwrap_or_default().to_string(),
        redirected,
        url: final_url,
        headers: response_headers,
        body: String::from_utf8_lossy(&bytes).into_owned(),
    })
}

// --- Workspace API ---

/// Forward a `plane.*` call to the [`ApiDispatcher`]. Returns the JSON result.
#[op2(async)]
#[string]
pub async fn op_runner_api_request(
    op_state: Rc<RefCell<OpState>>,
    #[string] method: String,
    #[string] path: String,
    #[string] body_json: Option<String>,
) -> Result<String, JsErrorBox> {
    tracing::debug!(method = %method, path_len = path.len(), "api call dispatched");

    let (dispatcher, token) = {
        let st = op_state.borrow();
        let cap = st.borrow::<ApiCapability>();
        (cap.dispatcher.clone(), cap.token.clone())
    };

    let body = match body_json {
        Some(json) => Some(
            serde_json::from_str(&json)
                .map_err(|e| JsErrorBox::type_error(format!("invalid JSON body: {e}")))?,
        ),
        None => None,
    };

    let result = dispatcher
        .request(&method, &path, body)
        .await
        .map_err(|e| {
            JsErrorBox::generic(crate::redact::redact_api_error(
                &method,
                &path,
                &e.to_string(),
                Some(&token),
            ))
        })?;

    serde_json::to_string(&result)
        .map_err(|e| JsErrorBox::generic(format!("result serialization failed: {e}")))
}

// --- base64 ---

const FORGIVING_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// `btoa`: every code unit must fit in a byte.
#[op2]
#[string]
pub fn op_runner_btoa(#[string] input: String) -> Result<String, JsErrorBox> {
    let bytes = input
        .chars()
        .map(|c| u8::try_from(u32::from(c)))
        .collect::<Result<Vec<u8>, _>>()
        .map_err(|_| {
            JsErrorBox::generic(
                "InvalidCharacterError: string contains characters outside of the Latin1 range",
            )
        })?;
    Ok(FORGIVING_BASE64.encode(bytes))
}

/// `atob`: whitespace is ignored, padding optional.
#[op2]
#[string]
pub fn op_runner_atob(#[string] input: String) -> Result<String, JsErrorBox> {
    let cleaned: String = input
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();
    let bytes = FORGIVING_BASE64.decode(cleaned.as_bytes()).map_err(|_| {
        JsErrorBox::generic("InvalidCharacterError: the string to be decoded is not correctly encoded")
    })?;
    Ok(bytes.into_iter().map(char::from).collect())
}

// --- Text encoding ---

#[op2]
#[buffer]
pub fn op_runner_text_encode(#[string] input: String) -> Vec<u8> {
    input.into_bytes()
}

#[op2]
#[string]
pub fn op_runner_text_decode(#[buffer] input: &[u8], fatal: bool) -> Result<String, JsErrorBox> {
    if fatal {
        return std::str::from_utf8(input)
            .map(str::to_string)
            .map_err(|_| JsErrorBox::type_error("The encoded data was not valid for encoding utf-8"));
    }
    Ok(String::from_utf8_lossy(input).into_owned())
}

// --- URL ---

#[derive(serde::Serialize)]
struct UrlParts {
    href: String,
    origin: String,
    protocol: String,
    username: String,
    password: String,
    host: String,
    hostname: String,
    port: String,
    pathname: String,
    search: String,
    hash: String,
}

impl From<&Url> for UrlParts {
    fn from(url: &Url) -> Self {
        let hostname = url.host_str().unwrap_or_default().to_string();
        let port = url.port().map(|p| p.to_string()).unwrap_or_default();
        let host = if port.is_empty() {
            hostname.clone()
        } else {
            format!("{hostname}:{port}")
        };
        Self {
            href: url.to_string(),
            origin: url.origin().ascii_serialization(),
            protocol: format!("{}:", url.scheme()),
            username: url.username().to_string(),
            password: url.password().unwrap_or_default().to_string(),
            host,
            hostname,
            port,
            pathname: url.path().to_string(),
            search: url
                .query()
                .filter(|q| !q.is_empty())
                .map(|q| format!("?{q}"))
                .unwrap_or_default(),
            hash: url
                .fragment()
                .filter(|f| !f.is_empty())
                .map(|f| format!("#{f}"))
                .unwrap_or_default(),
        }
    }
}

fn parse_url(href: &str, base: Option<&str>) -> Result<Url, JsErrorBox> {
    let parsed = match base {
        Some(base) => Url::parse(base).and_then(|b| b.join(href)),
        None => Url::parse(href),
    };
    parsed.map_err(|_| JsErrorBox::type_error(format!("Invalid URL: '{href}'")))
}

fn url_json(url: &Url) -> Result<String, JsErrorBox> {
    serde_json::to_string(&UrlParts::from(url))
        .map_err(|e| JsErrorBox::generic(format!("URL serialization failed: {e}")))
}

/// Parse `href` (optionally against `base`) into WHATWG URL components.
#[op2]
#[string]
pub fn op_runner_url_parse(
    #[string] href: String,
    #[string] base: Option<String>,
) -> Result<String, JsErrorBox> {
    url_json(&parse_url(&href, base.as_deref())?)
}

/// Update one component of `href` and return the re-parsed components.
#[op2]
#[string]
pub fn op_runner_url_set(
    #[string] href: String,
    #[string] part: String,
    #[string] value: String,
) -> Result<String, JsErrorBox> {
    let mut url = parse_url(&href, None)?;
    let strip = |v: &str, prefix: char| v.strip_prefix(prefix).unwrap_or(v).to_string();
    // setters that reject a value leave the URL unchanged, as in browsers
    match part.as_str() {
        "search" => {
            let q = strip(&value, '?');
            url.set_query((!q.is_empty()).then_some(q.as_str()));
        }
        "hash" => {
            let f = strip(&value, '#');
            url.set_fragment((!f.is_empty()).then_some(f.as_str()));
        }
        "pathname" => url.set_path(&value),
        "hostname" => {
            let _ = url.set_host(Some(&value));
        }
        "port" => {
            let port = if value.is_empty() {
                None
            } else {
                value.parse::<u16>().ok()
            };
            if value.is_empty() || port.is_some() {
                let _ = url.set_port(port);
            }
        }
        "protocol" => {
            let _ = url.set_scheme(value.trim_end_matches(':'));
        }
        "username" => {
            let _ = url.set_username(&value);
        }
        "password" => {
            let _ = url.set_password((!value.is_empty()).then_some(value.as_str()));
        }
        "href" => url = parse_url(&value, None)?,
        other => {
            return Err(JsErrorBox::type_error(format!(
                "unsupported URL component '{other}'"
            )))
        }
    }
    url_json(&url)
}

deno_core::extension!(
    runner_ext,
    ops = [
        op_runner_log,
        op_runner_set_result,
        op_runner_sleep,
        op_runner_fetch,
        op_runner_api_request,
        op_runner_btoa,
        op_runner_atob,
        op_runner_text_encode,
        op_runner_text_decode,
        op_runner_url_parse,
        op_runner_url_set
    ],
);
