#![warn(missing_docs)]

//! # runner-server
//!
//! HTTP boundary of the automation script runner.
//!
//! | route | purpose |
//! |---|---|
//! | `POST /build` | validate and bundle a script, returning the bundle |
//! | `POST /validate` | report whether a script would be accepted and build |
//! | `POST /execute-sync` | validate, build and run a script, or run a pre-built bundle |
//! | `GET /health` | liveness |
//! | `GET /metrics` | Prometheus text format (`metrics` feature) |
//!
//! Every request gets its own pipeline and scratch directories; nothing is
//! shared between requests except the isolate semaphore.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use runner_config::{SandboxSection, ServiceConfig, ToolchainSection};
use runner_sandbox::audit::TracingAuditLogger;
use runner_sandbox::error::ErrorData;
use runner_sandbox::{
    detect_function_names, validate, BuiltBundle, ExecutionContext, RunnerConfig, SandboxConfig,
    SandboxExecutor, ScriptBuilder, ScriptFunction, ScriptSource, ToolchainConfig,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

const SECURITY_VALIDATION_FAILED: &str = "Security validation failed";

fn mib(n: usize) -> usize {
    n.saturating_mul(1024 * 1024)
}

/// Build a [`SandboxConfig`] from the `[sandbox]` config section.
pub fn sandbox_config(section: &SandboxSection) -> SandboxConfig {
    SandboxConfig {
        timeout: Duration::from_millis(section.timeout_ms),
        init_timeout: Duration::from_millis(section.init_timeout_ms),
        max_heap_size: mib(section.max_heap_mb),
        max_concurrent: section.max_concurrent,
        max_fetch_calls: section.max_fetch_calls,
        max_output_size: mib(section.max_output_mb),
        ..SandboxConfig::default()
    }
}

/// Build a [`ToolchainConfig`] from the `[toolchain]` config section.
pub fn toolchain_config(section: &ToolchainSection) -> ToolchainConfig {
    ToolchainConfig {
        sourcemap: section.sourcemap,
        step_timeout: section.step_timeout_secs.map(Duration::from_secs),
        ..ToolchainConfig::npm(&section.npm, &section.npx)
    }
}

/// Shared state behind every route.
pub struct AppState {
    builder: ScriptBuilder,
    executor: SandboxExecutor,
    api_base_url: String,
    typecheck_on_validate: bool,
    #[cfg(feature = "metrics")]
    metrics: telemetry::Metrics,
}

impl AppState {
    /// Assemble state from explicit parts.
    pub fn new(
        builder: ScriptBuilder,
        executor: SandboxExecutor,
        api_base_url: impl Into<String>,
    ) -> Self {
        Self {
            builder,
            executor,
            api_base_url: api_base_url.into(),
            typecheck_on_validate: false,
            #[cfg(feature = "metrics")]
            metrics: telemetry::Metrics::default(),
        }
    }

    /// Assemble state from the service configuration.
    pub fn from_config(config: &ServiceConfig) -> Self {
        let executor = SandboxExecutor::new(sandbox_config(&config.sandbox))
            .with_audit_logger(Arc::new(TracingAuditLogger));
        Self::new(
            ScriptBuilder::new(toolchain_config(&config.toolchain)),
            executor,
            config.api.base_url.clone(),
        )
        .with_typecheck(config.toolchain.typecheck_on_validate)
    }

    /// Run `tsc` as part of `/validate`.
    pub fn with_typecheck(mut self, enabled: bool) -> Self {
        self.typecheck_on_validate = enabled;
        self
    }

    fn record_rejection(&self) {
        #[cfg(feature = "metrics")]
        self.metrics.runner.record_rejection();
    }

    #[cfg_attr(not(feature = "metrics"), allow(unused_variables))]
    fn record_build(&self, elapsed: Duration, success: bool) {
        #[cfg(feature = "metrics")]
        self.metrics.runner.record_build(elapsed.as_secs_f64(), success);
    }

    #[cfg_attr(not(feature = "metrics"), allow(unused_variables))]
    fn record_execution(&self, elapsed: Duration, error_kind: Option<&str>) {
        #[cfg(feature = "metrics")]
        self.metrics
            .runner
            .record_execution(elapsed.as_secs_f64(), error_kind);
    }

    async fn build(&self, source: &ScriptSource) -> Result<BuiltBundle, runner_sandbox::BuildError> {
        let start = Instant::now();
        let result = self.builder.build(&source.code, source.inline).await;
        self.record_build(start.elapsed(), result.is_ok());
        result
    }
}

/// Build the router with a request body limit of `body_limit` bytes.
pub fn router(state: AppState, body_limit: usize) -> Router {
    let router = Router::new()
        .route("/build", post(build_handler))
        .route("/validate", post(validate_handler))
        .route("/execute-sync", post(execute_sync_handler))
        .route("/health", get(health));
    #[cfg(feature = "metrics")]
    let router = router.route("/metrics", get(metrics_handler));
    router
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(Arc::new(state))
}

/// Bind the configured address and serve until Ctrl-C.
pub async fn serve(config: &ServiceConfig) -> std::io::Result<()> {
    let app = router(
        AppState::from_config(config),
        mib(config.server.body_limit_mb),
    );
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "script runner listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

// --- errors ---

/// A request the service refuses to process.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// `code` is absent, not a string, or empty.
    #[error("code is required and must be a string")]
    MissingCode,

    /// The body is not JSON.
    #[error("invalid JSON body: {0}")]
    InvalidJson(serde_json::Error),

    /// A field other than `code` has the wrong shape.
    #[error("invalid request: {0}")]
    InvalidField(serde_json::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        tracing::debug!(error = %self, "rejecting request");
        (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": self.to_string() })),
        )
            .into_response()
    }
}

/// Parse a request body that must carry a string `code`.
fn parse_request<T: DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    let value: Value = serde_json::from_slice(body).map_err(ApiError::InvalidJson)?;
    if !value
        .get("code")
        .and_then(Value::as_str)
        .is_some_and(|code| !code.is_empty())
    {
        return Err(ApiError::MissingCode);
    }
    serde_json::from_value(value).map_err(ApiError::InvalidField)
}

// --- /build ---

#[derive(Debug, Deserialize)]
struct BuildRequest {
    code: String,
    #[serde(default)]
    code_type: Option<String>,
    #[serde(default, rename = "inlineScript")]
    inline_script: Option<bool>,
}

impl BuildRequest {
    fn source(&self) -> ScriptSource {
        let mut source = ScriptSource::new(self.code.as_str(), self.code_type.as_deref());
        source.inline |= self.inline_script == Some(true);
        source
    }
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum BuildResponse {
    Built {
        success: bool,
        build: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        sourcemap: Option<String>,
        function_names: Vec<String>,
    },
    Rejected {
        success: bool,
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        violations: Option<Vec<String>>,
    },
}

impl BuildResponse {
    fn failed(error: impl Into<String>, violations: Option<Vec<String>>) -> (StatusCode, Json<Self>) {
        (
            StatusCode::BAD_REQUEST,
            Json(Self::Rejected {
                success: false,
                error: error.into(),
                violations,
            }),
        )
    }
}

async fn build_handler(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<(StatusCode, Json<BuildResponse>), ApiError> {
    let req: BuildRequest = parse_request(&body)?;
    let source = req.source();
    tracing::info!(code_len = source.code.len(), inline = source.inline, "build: request");

    let validation = validate(&source.code);
    if !validation.valid {
        state.record_rejection();
        return Ok(BuildResponse::failed(
            SECURITY_VALIDATION_FAILED,
            Some(validation.violations),
        ));
    }
    let function_names = detect_function_names(&source.code);

    let bundle = match state.build(&source).await {
        Ok(bundle) => bundle,
        Err(e) => {
            tracing::warn!(error = %e, "build: failed");
            return Ok(BuildResponse::failed(e.to_string(), None));
        }
    };
    let build = match bundle.read().await {
        Ok(build) => build,
        Err(e) => return Ok(BuildResponse::failed(format!("failed to read bundle: {e}"), None)),
    };

    Ok((
        StatusCode::OK,
        Json(BuildResponse::Built {
            success: true,
            build,
            sourcemap: bundle.sourcemap().map(str::to_string),
            function_names,
        }),
    ))
}

// --- /validate ---

#[derive(Debug, Deserialize)]
struct ValidateRequest {
    code: String,
    #[serde(default, rename = "inlineScript")]
    inline_script: Option<bool>,
}

async fn validate_handler(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<runner_sandbox::ValidationResult>, ApiError> {
    let req: ValidateRequest = parse_request(&body)?;
    let source = ScriptSource {
        code: req.code,
        inline: req.inline_script == Some(true),
    };

    let validation = validate(&source.code);
    if !validation.valid {
        state.record_rejection();
        return Ok(Json(validation));
    }

    if state.typecheck_on_validate {
        let types = state.builder.typecheck(&source.code, source.inline).await;
        if !types.valid {
            return Ok(Json(types));
        }
    }

    // the bundle is dropped straight away, which removes its directory
    match state.build(&source).await {
        Ok(_) => Ok(Json(runner_sandbox::ValidationResult::ok())),
        Err(e) => Ok(Json(runner_sandbox::ValidationResult::from_violations(vec![
            e.to_string(),
        ]))),
    }
}

// --- /execute-sync ---

#[derive(Debug, Deserialize)]
struct ExecuteRequest {
    code: String,
    #[serde(default)]
    build: Option<String>,
    #[serde(default)]
    workspace_slug: Option<String>,
    #[serde(default)]
    input_data: Value,
    #[serde(default)]
    code_type: Option<String>,
    #[serde(default)]
    env_variables: Option<HashMap<String, String>>,
    #[serde(default)]
    execution_variables: Option<serde_json::Map<String, Value>>,
    #[serde(default)]
    allowed_domains: Option<Vec<String>>,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    functions: Option<Vec<ScriptFunction>>,
}

/// `/execute-sync` always answers 200 with one of these.
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
enum ExecuteResponse {
    Completed { output_data: Value },
    Errored { error_data: ExecuteError },
}

#[derive(Debug, Serialize)]
struct ExecuteError {
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    stack: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    violations: Option<Vec<String>>,
}

impl ExecuteResponse {
    fn errored(message: impl Into<String>) -> Self {
        Self::Errored {
            error_data: ExecuteError {
                message: message.into(),
                stack: None,
                violations: None,
            },
        }
    }
}

impl From<ErrorData> for ExecuteError {
    fn from(data: ErrorData) -> Self {
        Self {
            message: data.message,
            stack: data.stack,
            violations: None,
        }
    }
}

async fn execute_sync_handler(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<ExecuteResponse>, ApiError> {
    let req: ExecuteRequest = parse_request(&body)?;
    let runner = RunnerConfig {
        workspace_slug: req.workspace_slug.clone().unwrap_or_default(),
        task_id: "sync".into(),
        execution_id: format!("sync-{}", chrono::Utc::now().timestamp_millis()),
    };
    tracing::info!(
        execution_id = %runner.execution_id,
        workspace_slug = %runner.workspace_slug,
        code_len = req.code.len(),
        prebuilt = req.build.as_deref().is_some_and(|b| !b.is_empty()),
        "execute-sync: request"
    );
    Ok(Json(execute_sync(&state, &runner, req).await))
}

async fn execute_sync(state: &AppState, runner: &RunnerConfig, req: ExecuteRequest) -> ExecuteResponse {
    // an empty `build` means the caller has no cached bundle yet
    let bundle = match req.build.as_deref().filter(|build| !build.is_empty()) {
        Some(build) => BuiltBundle::stage(build).await,
        None => {
            let source = ScriptSource::new(req.code.as_str(), req.code_type.as_deref());
            let validation = validate(&source.code);
            if !validation.valid {
                state.record_rejection();
                return ExecuteResponse::Errored {
                    error_data: ExecuteError {
                        message: SECURITY_VALIDATION_FAILED.into(),
                        stack: None,
                        violations: Some(validation.violations),
                    },
                };
            }
            state.build(&source).await
        }
    };
    let bundle = match bundle {
        Ok(bundle) => bundle,
        Err(e) => {
            tracing::warn!(execution_id = %runner.execution_id, error = %e, "execute-sync: build failed");
            return ExecuteResponse::errored(e.to_string());
        }
    };

    let ctx = ExecutionContext {
        workspace_slug: runner.workspace_slug.clone(),
        input: req.input_data,
        env: req.env_variables.unwrap_or_default(),
        variables: req.execution_variables.unwrap_or_default(),
        allowed_domains: req.allowed_domains.unwrap_or_default(),
        access_token: req.access_token.unwrap_or_default(),
        api_base_url: state.api_base_url.clone(),
        functions: req.functions.unwrap_or_default(),
    };

    let start = Instant::now();
    let result = state.executor.execute(runner, ctx, bundle.path()).await;
    state.record_execution(
        start.elapsed(),
        result.as_ref().err().map(runner_sandbox::SandboxError::kind),
    );
    match result {
        Ok(result) => ExecuteResponse::Completed {
            output_data: result.value,
        },
        Err(e) => ExecuteResponse::Errored {
            error_data: e.to_error_data().into(),
        },
    }
}

// --- /health, /metrics ---

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

#[cfg(feature = "metrics")]
async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.metrics.encode() {
        Ok(text) => (
            [(
                axum::http::header::CONTENT_TYPE,
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )],
            text,
        )
            .into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "metrics encoding failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(feature = "metrics")]
mod telemetry {
    use prometheus_client::registry::Registry;
    use runner_sandbox::metrics::RunnerMetrics;

    pub(crate) struct Metrics {
        registry: Registry,
        pub(crate) runner: RunnerMetrics,
    }

    impl Default for Metrics {
        fn default() -> Self {
            let mut registry = Registry::default();
            let runner = RunnerMetrics::new(&mut registry);
            Self { registry, runner }
        }
    }

    impl Metrics {
        pub(crate) fn encode(&self) -> Result<String, std::fmt::Error> {
            let mut buf = String::new();
            prometheus_client::encoding::text::encode(&mut buf, &self.registry)?;
            Ok(buf)
        }
    }
}
