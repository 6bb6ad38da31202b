//! `fetch` and `plane` against a live local HTTP server.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use runner_error::DispatchError;
use runner_sandbox::audit::{AuditEntry, AuditLogger, AuditOutcome};
use runner_sandbox::{
    ApiClientFactory, ApiDispatcher, ExecutionContext, RunnerConfig, SandboxConfig,
    SandboxExecutor,
};
use serde_json::{json, Value};

const TOKEN: &str = "secret-token-1234567890";

async fn json_handler() -> Json<Value> {
    Json(json!({"ok": true, "items": [1, 2, 3]}))
}

async fn echo(method: Method, headers: HeaderMap, body: String) -> Json<Value> {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string);
    Json(json!({
        "method": method.as_str(),
        "custom": header("x-custom"),
        "contentType": header("content-type"),
        "body": body,
    }))
}

async fn redirect_away(State(port): State<u16>) -> Redirect {
    Redirect::temporary(&format!("http://localhost:{port}/json"))
}

async fn redirect_home() -> Redirect {
    Redirect::temporary("/json")
}

async fn big() -> String {
    "x".repeat(4096)
}

async fn issues(Path(slug): Path<String>, headers: HeaderMap) -> Response {
    let expected = format!("Bearer {TOKEN}");
    match headers.get("authorization").and_then(|v| v.to_str().ok()) {
        Some(auth) if auth == expected => Json(json!({"workspace": slug, "count": 2})).into_response(),
        _ => (StatusCode::UNAUTHORIZED, "missing credentials").into_response(),
    }
}

async fn forbidden(headers: HeaderMap) -> Response {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    (StatusCode::FORBIDDEN, format!("rejected credentials {auth}")).into_response()
}

/// Start the fixture server and return its base URL.
async fn spawn_server() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let app = Router::new()
        .route("/json", get(json_handler))
        .route("/echo", any(echo))
        .route("/redirect-away", get(redirect_away))
        .route("/redirect-home", get(redirect_home))
        .route("/big", get(big))
        .route("/api/workspaces/{slug}/issues", get(issues))
        .route("/api/forbidden", get(forbidden))
        .with_state(port);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://127.0.0.1:{port}")
}

fn bundle(body: &str) -> String {
    format!("async function main(event, variables) {{\n{body}\n}}")
}

fn runner_config() -> RunnerConfig {
    RunnerConfig {
        workspace_slug: "acme".into(),
        task_id: "sync".into(),
        execution_id: "sync-cap".into(),
    }
}

fn context(base: &str) -> ExecutionContext {
    ExecutionContext {
        workspace_slug: "acme".into(),
        input: json!({"base": base}),
        allowed_domains: vec!["127.0.0.1".into()],
        access_token: TOKEN.into(),
        api_base_url: format!("{base}/api"),
        ..Default::default()
    }
}

fn executor(config: SandboxConfig) -> SandboxExecutor {
    SandboxExecutor::new(SandboxConfig {
        timeout: Duration::from_secs(10),
        ..config
    })
}

async fn run(exec: &SandboxExecutor, ctx: ExecutionContext, body: &str) -> Value {
    exec.execute_bundle(&runner_config(), ctx, bundle(body))
        .await
        .unwrap()
        .value
}

#[tokio::test]
async fn fetch_get_parses_json() {
    let base = spawn_server().await;
    let value = run(
        &executor(SandboxConfig::default()),
        context(&base),
        r#"const r = await fetch(event.base + "/json");
           return { status: r.status, ok: r.ok, type: r.headers.get("Content-Type"), body: await r.json() };"#,
    )
    .await;
    assert_eq!(value["status"], 200);
    assert_eq!(value["ok"], true);
    assert_eq!(value["type"], "application/json");
    assert_eq!(value["body"], json!({"ok": true, "items": [1, 2, 3]}));
}

#[tokio::test]
async fn fetch_post_sends_headers_and_json_body() {
    let base = spawn_server().await;
    let value = run(
        &executor(SandboxConfig::default()),
        context(&base),
        r#"const r = await fetch(event.base + "/echo", {
               method: "post",
               headers: { "X-Custom": "yes" },
               body: { title: "New issue" },
           });
           return r.json();"#,
    )
    .await;
    assert_eq!(
        value,
        json!({
            "method": "POST",
            "custom": "yes",
            "contentType": "application/json",
            "body": "{\"title\":\"New issue\"}",
        })
    );
}

#[tokio::test]
async fn body_can_only_be_read_once() {
    let base = spawn_server().await;
    let value = run(
        &executor(SandboxConfig::default()),
        context(&base),
        r#"const r = await fetch(event.base + "/json");
           await r.text();
           try { await r.text(); return "read twice"; }
           catch (e) { return [r.bodyUsed, e instanceof TypeError]; }"#,
    )
    .await;
    assert_eq!(value, json!([true, true]));
}

#[tokio::test]
async fn redirect_within_allow_list_is_followed() {
    let base = spawn_server().await;
    let value = run(
        &executor(SandboxConfig::default()),
        context(&base),
        r#"const r = await fetch(event.base + "/redirect-home");
           return { redirected: r.redirected, url: r.url, body: await r.json() };"#,
    )
    .await;
    assert_eq!(value["redirected"], true);
    assert_eq!(value["url"], format!("{base}/json"));
    assert_eq!(value["body"]["ok"], true);
}

#[tokio::test]
async fn redirect_off_allow_list_is_blocked() {
    let base = spawn_server().await;
    let value = run(
        &executor(SandboxConfig::default()),
        context(&base),
        r#"try { await fetch(event.base + "/redirect-away"); return "followed"; }
           catch (e) { return e.message; }"#,
    )
    .await;
    let message = value.as_str().unwrap();
    assert!(message.contains("Domain not allowed: localhost"), "{message}");
}

#[tokio::test]
async fn oversized_response_is_rejected() {
    let base = spawn_server().await;
    let exec = executor(SandboxConfig {
        max_fetch_response_size: 1024,
        ..Default::default()
    });
    let value = run(
        &exec,
        context(&base),
        r#"try { await fetch(event.base + "/big"); return "read"; }
           catch (e) { return e.message; }"#,
    )
    .await;
    let message = value.as_str().unwrap();
    assert!(message.contains("exceeds 1024 bytes"), "{message}");
}

#[tokio::test]
async fn fetch_budget_is_enforced() {
    let base = spawn_server().await;
    let exec = executor(SandboxConfig {
        max_fetch_calls: 2,
        ..Default::default()
    });
    let value = run(
        &exec,
        context(&base),
        r#"const results = [];
           for (let i = 0; i < 3; i++) {
               try { results.push((await fetch(event.base + "/json")).status); }
               catch (e) { results.push(e.message); }
           }
           return results;"#,
    )
    .await;
    assert_eq!(value[0], 200);
    assert_eq!(value[1], 200);
    assert!(value[2].as_str().unwrap().contains("fetch call limit reached"), "{value}");
}

#[derive(Default)]
struct CollectingAudit(Mutex<Vec<AuditEntry>>);

#[async_trait::async_trait]
impl AuditLogger for CollectingAudit {
    async fn log(&self, entry: &AuditEntry) {
        self.0.lock().unwrap().push(entry.clone());
    }
}

/// Answers every call with the request it received.
struct EchoDispatcher;

#[async_trait::async_trait]
impl ApiDispatcher for EchoDispatcher {
    async fn request(
        &self,
        method: &str,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, DispatchError> {
        if path.contains("missing") {
            return Err(DispatchError::Upstream {
                status: 404,
                message: "not found".into(),
            });
        }
        Ok(json!({"method": method, "path": path, "body": body}))
    }
}

struct EchoFactory;

impl ApiClientFactory for EchoFactory {
    fn create(&self, _ctx: &ExecutionContext) -> Arc<dyn ApiDispatcher> {
        Arc::new(EchoDispatcher)
    }
}

#[tokio::test]
async fn audit_entry_records_calls_without_raw_urls() {
    let base = spawn_server().await;
    let audit = Arc::new(CollectingAudit::default());
    let exec = executor(SandboxConfig::default())
        .with_api_factory(Arc::new(EchoFactory))
        .with_audit_logger(audit.clone());

    let value = run(
        &exec,
        context(&base),
        r#"await fetch(event.base + "/json?secret=abc");
           try { await fetch("https://blocked.example/"); } catch (_) {}
           const created = await plane.post("/issues/", { name: "x" });
           return created;"#,
    )
    .await;
    assert_eq!(
        value,
        json!({"method": "POST", "path": "/issues/", "body": {"name": "x"}})
    );

    let entries = audit.0.lock().unwrap();
    assert_eq!(entries.len(), 1);
    let entry = &entries[0];
    assert_eq!(entry.execution_id, "sync-cap");
    assert!(matches!(entry.outcome, AuditOutcome::Success));

    assert_eq!(entry.fetch_calls.len(), 2);
    let ok = entry.fetch_calls.iter().find(|c| c.success).unwrap();
    assert_eq!(ok.host, "127.0.0.1");
    assert_eq!(ok.status, Some(200));
    assert_eq!(ok.url_hash.len(), 64);
    let denied = entry.fetch_calls.iter().find(|c| !c.success).unwrap();
    assert_eq!(denied.host, "blocked.example");
    assert_eq!(denied.status, None);

    assert_eq!(entry.api_calls.len(), 1);
    assert_eq!(entry.api_calls[0].method, "POST");
    assert!(entry.api_calls[0].success);

    let serialized = serde_json::to_string(&entry.fetch_calls).unwrap();
    assert!(!serialized.contains("secret=abc"));
}

#[tokio::test]
async fn api_errors_reach_the_script_as_exceptions() {
    let exec = executor(SandboxConfig::default()).with_api_factory(Arc::new(EchoFactory));
    let value = run(
        &exec,
        ExecutionContext::default(),
        r#"try { await plane.get("/missing/"); return "found"; }
           catch (e) { return e.message; }"#,
    )
    .await;
    assert_eq!(
        value,
        json!("API request GET /missing/ failed: upstream error (404): not found")
    );
}

#[tokio::test]
async fn http_api_client_sends_bearer_token() {
    let base = spawn_server().await;
    let value = run(
        &executor(SandboxConfig::default()),
        context(&base),
        r#"return [plane.workspaceSlug, await plane.get("/workspaces/{workspace_slug}/issues")];"#,
    )
    .await;
    assert_eq!(value, json!(["acme", {"workspace": "acme", "count": 2}]));
}

#[tokio::test]
async fn token_echoed_by_upstream_is_redacted() {
    let base = spawn_server().await;
    let value = run(
        &executor(SandboxConfig::default()),
        context(&base),
        r#"try { await plane.get("/forbidden"); return "allowed"; }
           catch (e) { return e.message; }"#,
    )
    .await;
    let message = value.as_str().unwrap();
    assert!(message.contains("upstream error (403)"), "{message}");
    assert!(!message.contains(TOKEN), "{message}");
    assert!(message.contains("[REDACTED]"), "{message}");
}

#[tokio::test]
async fn token_is_not_visible_to_scripts() {
    let base = spawn_server().await;
    let value = run(
        &executor(SandboxConfig::default()),
        context(&base),
        r#"const seen = JSON.stringify([event, variables, env, Object.keys(plane)]);
           return seen.includes("secret-token");"#,
    )
    .await;
    assert_eq!(value, json!(false));
}
