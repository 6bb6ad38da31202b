//! Sandbox executor: runs a built bundle in a fresh V8 isolate.
//!
//! Each execution gets a brand new runtime. No state leaks between calls.
//!
//! V8 isolates are `!Send`, so all JsRuntime operations run on a dedicated
//! thread with its own single-threaded tokio runtime. The public API is
//! fully async and `Send`-safe.
//!
//! An execution has two phases, each guarded by its own watchdog thread that
//! terminates V8 when the phase deadline passes:
//!
//! 1. **Init**: the prelude, the `Functions` helpers and the bundle's
//!    top-level code, bounded by `init_timeout`.
//! 2. **Run**: `main(event, variables)` is invoked and the event loop is
//!    driven until the returned promise settles, bounded by `timeout`.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::Poll;
use std::time::{Duration, Instant};

use deno_core::{v8, JsRuntime, PollEventLoopOptions, RuntimeOptions};
use serde_json::Value;
use tokio::sync::Semaphore;

use crate::api_client::HttpApiClientFactory;
use crate::audit::{
    ApiCallAudit, AuditEntryBuilder, AuditLogger, AuditingApiDispatcher, FetchCallAudit,
    NoopAuditLogger,
};
use crate::bootstrap::{self, BOOTSTRAP_SCRIPT_NAME, INVOKE_SCRIPT, SEAL_FUNCTIONS_SCRIPT};
use crate::error::SandboxError;
use crate::ops::{
    build_fetch_client, normalize_domain, runner_ext, ApiCapability, ExecutionLabel,
    FetchAuditSink, FetchClient, FetchPolicy, ScriptOutcome,
};
use crate::types::{ExecutionContext, ExecutionResult, RunnerConfig, ScriptFunction};
use crate::{ApiClientFactory, ApiDispatcher};

const HELPER_SCRIPT_NAME: &str = "[runner:functions]";
const BUNDLE_SCRIPT_NAME: &str = "[runner:bundle]";
const INVOKE_SCRIPT_NAME: &str = "[runner:invoke]";

/// Configuration for the sandbox executor.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Deadline for `main` to settle.
    pub timeout: Duration,
    /// Deadline for the bundle's top-level code. Must be shorter than `timeout`.
    pub init_timeout: Duration,
    /// V8 heap limit in bytes.
    pub max_heap_size: usize,
    /// Maximum concurrent sandbox executions.
    pub max_concurrent: usize,
    /// Maximum `fetch` calls per execution.
    pub max_fetch_calls: usize,
    /// Maximum `fetch` response body size in bytes.
    pub max_fetch_response_size: usize,
    /// Per-request `fetch` timeout.
    pub fetch_timeout: Duration,
    /// Maximum size of the JSON result in bytes.
    pub max_output_size: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            init_timeout: Duration::from_secs(5),
            max_heap_size: 128 * 1024 * 1024, // 128 MB
            max_concurrent: 8,
            max_fetch_calls: 50,
            max_fetch_response_size: 10 * 1024 * 1024, // 10 MB
            fetch_timeout: Duration::from_secs(30),
            max_output_size: 10 * 1024 * 1024, // 10 MB
        }
    }
}

/// The sandbox executor. Creates a fresh V8 isolate for each execution.
///
/// This is `Send + Sync` safe; all V8 operations are dispatched to a
/// dedicated thread internally. A concurrency semaphore limits the number
/// of simultaneous V8 isolates.
pub struct SandboxExecutor {
    config: SandboxConfig,
    semaphore: Arc<Semaphore>,
    api_factory: Arc<dyn ApiClientFactory>,
    audit_logger: Arc<dyn AuditLogger>,
}

impl SandboxExecutor {
    /// Create an executor that talks to the workspace API over HTTP.
    pub fn new(config: SandboxConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent));
        Self {
            config,
            semaphore,
            api_factory: Arc::new(HttpApiClientFactory::default()),
            audit_logger: Arc::new(NoopAuditLogger),
        }
    }

    /// Replace the factory that creates the per-execution `plane` capability.
    pub fn with_api_factory(mut self, factory: Arc<dyn ApiClientFactory>) -> Self {
        self.api_factory = factory;
        self
    }

    /// Send an audit entry for every execution to `logger`.
    pub fn with_audit_logger(mut self, logger: Arc<dyn AuditLogger>) -> Self {
        self.audit_logger = logger;
        self
    }

    /// The executor's limits.
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Run the bundle stored at `bundle_path`.
    pub async fn execute(
        &self,
        config: &RunnerConfig,
        ctx: ExecutionContext,
        bundle_path: &Path,
    ) -> Result<ExecutionResult, SandboxError> {
        let bundle = tokio::fs::read_to_string(bundle_path).await?;
        self.execute_bundle(config, ctx, bundle).await
    }

    /// Run an in-memory bundle.
    pub async fn execute_bundle(
        &self,
        config: &RunnerConfig,
        ctx: ExecutionContext,
        bundle: String,
    ) -> Result<ExecutionResult, SandboxError> {
        tracing::info!(
            execution_id = %config.execution_id,
            workspace_slug = %config.workspace_slug,
            code_len = bundle.len(),
            functions = ctx.functions.len(),
            "execute: starting"
        );

        let mut audit_builder = AuditEntryBuilder::new(config, &bundle);

        // queue for an isolate slot, but no longer than the run deadline
        let _permit = match tokio::time::timeout(
            self.config.timeout,
            self.semaphore.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) | Err(_) => {
                return Err(SandboxError::ConcurrencyLimit {
                    max: self.config.max_concurrent,
                })
            }
        };

        let (api_audit_tx, mut api_audit_rx) =
            tokio::sync::mpsc::unbounded_channel::<ApiCallAudit>();
        let api: Arc<dyn ApiDispatcher> = Arc::new(AuditingApiDispatcher::new(
            self.api_factory.create(&ctx),
            api_audit_tx,
        ));
        let (fetch_audit_tx, mut fetch_audit_rx) =
            tokio::sync::mpsc::unbounded_channel::<FetchCallAudit>();

        let start = Instant::now();
        let job = IsolateJob {
            config: self.config.clone(),
            execution_id: config.execution_id.clone(),
            ctx,
            bundle,
            api,
            fetch_audit: fetch_audit_tx,
        };
        let result = run_on_isolate_thread(job).await;

        while let Ok(audit) = fetch_audit_rx.try_recv() {
            audit_builder.record_fetch(audit);
        }
        while let Ok(audit) = api_audit_rx.try_recv() {
            audit_builder.record_api_call(audit);
        }
        let entry = audit_builder.finish(&result);
        self.audit_logger.log(&entry).await;

        let elapsed_ms = start.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => tracing::info!(
                execution_id = %config.execution_id,
                elapsed_ms,
                "execute: complete"
            ),
            Err(e) => tracing::warn!(
                execution_id = %config.execution_id,
                elapsed_ms,
                kind = e.kind(),
                error = %e,
                "execute: failed"
            ),
        }

        result
    }
}

/// Everything the isolate thread needs, moved in as one value.
struct IsolateJob {
    config: SandboxConfig,
    execution_id: String,
    ctx: ExecutionContext,
    bundle: String,
    api: Arc<dyn ApiDispatcher>,
    fetch_audit: tokio::sync::mpsc::UnboundedSender<FetchCallAudit>,
}

/// Spawn a dedicated thread with its own V8 isolate and wait for its result.
async fn run_on_isolate_thread(job: IsolateJob) -> Result<ExecutionResult, SandboxError> {
    let (tx, rx) = tokio::sync::oneshot::channel();
    std::thread::Builder::new()
        .name("runner-isolate".into())
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    if tx.send(Err(SandboxError::Execution(e.into()))).is_err() {
                        tracing::warn!("sandbox result receiver dropped");
                    }
                    return;
                }
            };
            let result = rt.block_on(run_isolate(job));
            if tx.send(result).is_err() {
                tracing::warn!("sandbox result receiver dropped before result was sent");
            }
        })?;

    rx.await
        .map_err(|_| SandboxError::Execution(anyhow::anyhow!("sandbox thread panicked")))?
}

/// State for the near-heap-limit callback.
struct HeapLimitState {
    handle: v8::IsolateHandle,
    triggered: AtomicBool,
}

impl HeapLimitState {
    fn triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }
}

/// V8 near-heap-limit callback. Terminates execution and grants 1MB grace
/// for the termination to propagate cleanly.
extern "C" fn near_heap_limit_callback(
    data: *mut std::ffi::c_void,
    current_heap_limit: usize,
    _initial_heap_limit: usize,
) -> usize {
    // SAFETY: `data` points to the boxed HeapLimitState created in
    // `run_isolate`, which removes this callback before the box is dropped.
    let state = unsafe { &*(data as *const HeapLimitState) };
    if !state.triggered.swap(true, Ordering::SeqCst) {
        state.handle.terminate_execution();
    }
    current_heap_limit.saturating_add(1024 * 1024)
}

/// Terminates V8 execution if not disarmed before `timeout`.
///
/// Handles CPU-bound code, which never yields to a tokio timer. The thread is
/// always joined before the watchdog goes away so the isolate handle is never
/// used after the runtime drops.
struct Watchdog {
    cancel: Option<std::sync::mpsc::Sender<()>>,
    thread: Option<std::thread::JoinHandle<()>>,
    fired: Arc<AtomicBool>,
}

impl Watchdog {
    fn arm(handle: v8::IsolateHandle, timeout: Duration) -> Self {
        let fired = Arc::new(AtomicBool::new(false));
        let thread_fired = fired.clone();
        let (cancel_tx, cancel_rx) = std::sync::mpsc::channel::<()>();
        let thread = std::thread::spawn(move || {
            if let Err(std::sync::mpsc::RecvTimeoutError::Timeout) = cancel_rx.recv_timeout(timeout)
            {
                thread_fired.store(true, Ordering::SeqCst);
                handle.terminate_execution();
            }
        });
        Self {
            cancel: Some(cancel_tx),
            thread: Some(thread),
            fired,
        }
    }

    /// Stop the watchdog. Returns whether it fired.
    fn disarm(mut self) -> bool {
        self.stop();
        self.fired.load(Ordering::SeqCst)
    }

    fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Create a fresh JsRuntime with the runner extension loaded and V8 heap limits set.
pub(crate) fn create_runtime(max_heap_size: usize) -> JsRuntime {
    let create_params = v8::CreateParams::default().heap_limits(0, max_heap_size);
    JsRuntime::new(RuntimeOptions {
        extensions: vec![runner_ext::init_ops()],
        create_params: Some(create_params),
        ..Default::default()
    })
}

/// Run one execution on the current thread (must be a dedicated thread, not
/// the main tokio runtime).
async fn run_isolate(job: IsolateJob) -> Result<ExecutionResult, SandboxError> {
    let IsolateJob {
        config,
        execution_id,
        ctx,
        bundle,
        api,
        fetch_audit,
    } = job;

    let allowed_domains: Vec<String> = ctx
        .allowed_domains
        .iter()
        .map(|d| normalize_domain(d))
        .filter(|d| !d.is_empty())
        .collect();
    let fetch_client = build_fetch_client(allowed_domains.clone())
        .map_err(|e| SandboxError::Execution(e.into()))?;

    let mut runtime = create_runtime(config.max_heap_size);
    {
        let op_state = runtime.op_state();
        let mut state = op_state.borrow_mut();
        state.put(ExecutionLabel(execution_id));
        state.put(FetchPolicy {
            allowed_domains,
            max_calls: config.max_fetch_calls,
            calls_made: 0,
            max_response_size: config.max_fetch_response_size,
            timeout: config.fetch_timeout,
        });
        state.put(FetchClient(fetch_client));
        state.put(FetchAuditSink(fetch_audit));
        state.put(ApiCapability {
            dispatcher: api,
            token: ctx.access_token.clone(),
        });
    }

    let heap_state = Box::new(HeapLimitState {
        handle: runtime.v8_isolate().thread_safe_handle(),
        triggered: AtomicBool::new(false),
    });
    runtime.v8_isolate().add_near_heap_limit_callback(
        near_heap_limit_callback,
        &*heap_state as *const HeapLimitState as *mut std::ffi::c_void,
    );

    let result = match initialize(&mut runtime, &config, &ctx, bundle, &heap_state) {
        Ok(()) => invoke_entry(&mut runtime, &config, &heap_state).await,
        Err(e) => Err(e),
    };

    runtime
        .v8_isolate()
        .remove_near_heap_limit_callback(near_heap_limit_callback, 0);
    drop(runtime);
    drop(heap_state);
    result
}

/// Phase 1: prelude, helpers and the bundle's top-level code.
fn initialize(
    runtime: &mut JsRuntime,
    config: &SandboxConfig,
    ctx: &ExecutionContext,
    bundle: String,
    heap: &HeapLimitState,
) -> Result<(), SandboxError> {
    let watchdog = Watchdog::arm(runtime.v8_isolate().thread_safe_handle(), config.init_timeout);
    let loaded = load_scripts(runtime, ctx, bundle);
    let fired = watchdog.disarm();

    if heap.triggered() {
        return Err(SandboxError::HeapLimitExceeded);
    }
    if fired {
        return Err(SandboxError::InitTimeout {
            timeout_ms: config.init_timeout.as_millis() as u64,
        });
    }
    loaded
}

fn load_scripts(
    runtime: &mut JsRuntime,
    ctx: &ExecutionContext,
    bundle: String,
) -> Result<(), SandboxError> {
    let prelude = bootstrap::build_bootstrap(ctx)?;
    runtime
        .execute_script(BOOTSTRAP_SCRIPT_NAME, prelude)
        .map_err(|e| init_error(&e.to_string()))?;

    for function in &ctx.functions {
        register_helper(runtime, function)?;
    }
    runtime
        .execute_script(HELPER_SCRIPT_NAME, SEAL_FUNCTIONS_SCRIPT)
        .map_err(|e| init_error(&e.to_string()))?;

    runtime
        .execute_script(BUNDLE_SCRIPT_NAME, bundle)
        .map_err(|e| init_error(&e.to_string()))?;
    Ok(())
}

/// Compile one helper into `Functions`, or register a stub explaining why not.
fn register_helper(runtime: &mut JsRuntime, function: &ScriptFunction) -> Result<(), SandboxError> {
    let name = function.name.as_str();
    let rejected = if !bootstrap::is_valid_identifier(name) {
        Some(format!("'{name}' is not a valid function name"))
    } else {
        let validation = crate::validator::validate(&function.code);
        (!validation.valid).then(|| {
            format!(
                "security validation failed: {}",
                validation.violations.join("; ")
            )
        })
    };

    let reason = match rejected {
        Some(reason) => reason,
        None => match runtime.execute_script(HELPER_SCRIPT_NAME, bootstrap::helper_script(function)?)
        {
            Ok(_) => return Ok(()),
            Err(e) => split_js_error(&e.to_string()).0,
        },
    };

    tracing::warn!(function = %name, reason = %reason, "helper unavailable");
    runtime
        .execute_script(
            HELPER_SCRIPT_NAME,
            bootstrap::broken_helper_script(name, &reason)?,
        )
        .map_err(|e| init_error(&e.to_string()))?;
    Ok(())
}

/// How driving the event loop ended.
enum LoopExit {
    /// The entry point settled and the outcome is in OpState.
    Settled,
    /// Nothing left to run, yet no outcome: a promise that can never settle.
    Idle,
    /// The deadline passed first.
    Elapsed,
    /// The event loop itself failed (uncaught error, termination).
    Failed(String),
}

/// Phase 2: invoke `main` and wait for it to settle.
async fn invoke_entry(
    runtime: &mut JsRuntime,
    config: &SandboxConfig,
    heap: &HeapLimitState,
) -> Result<ExecutionResult, SandboxError> {
    let deadline = tokio::time::Instant::now() + config.timeout;
    let watchdog = Watchdog::arm(runtime.v8_isolate().thread_safe_handle(), config.timeout);

    let exit = match runtime.execute_script(INVOKE_SCRIPT_NAME, INVOKE_SCRIPT) {
        Ok(_) => drive_until_settled(runtime, deadline).await,
        Err(e) => LoopExit::Failed(e.to_string()),
    };
    if matches!(exit, LoopExit::Idle) {
        tokio::time::sleep_until(deadline).await;
    }
    let fired = watchdog.disarm();

    if heap.triggered() {
        return Err(SandboxError::HeapLimitExceeded);
    }
    if fired || matches!(exit, LoopExit::Idle | LoopExit::Elapsed) {
        return Err(SandboxError::Timeout {
            timeout_ms: config.timeout.as_millis() as u64,
        });
    }
    if let LoopExit::Failed(text) = exit {
        let (message, stack) = split_js_error(&text);
        return Err(SandboxError::JsError { message, stack });
    }

    let raw = {
        let state = runtime.op_state();
        let state = state.borrow();
        state
            .try_borrow::<ScriptOutcome>()
            .map(|o| o.0.clone())
            .ok_or_else(|| SandboxError::JsError {
                message: "no result returned from script".into(),
                stack: None,
            })?
    };

    if raw.len() > config.max_output_size {
        return Err(SandboxError::OutputTooLarge {
            max: config.max_output_size,
        });
    }

    parse_outcome(&raw)
}

/// Poll the event loop until an outcome is recorded, the loop goes idle, or
/// the deadline passes.
async fn drive_until_settled(runtime: &mut JsRuntime, deadline: tokio::time::Instant) -> LoopExit {
    let driven = tokio::time::timeout_at(
        deadline,
        std::future::poll_fn(|cx| {
            let polled = runtime.poll_event_loop(cx, PollEventLoopOptions::default());
            if has_outcome(runtime) {
                return Poll::Ready(LoopExit::Settled);
            }
            match polled {
                Poll::Ready(Ok(())) => Poll::Ready(LoopExit::Idle),
                Poll::Ready(Err(e)) => Poll::Ready(LoopExit::Failed(e.to_string())),
                Poll::Pending => Poll::Pending,
            }
        }),
    )
    .await;
    driven.unwrap_or(LoopExit::Elapsed)
}

fn has_outcome(runtime: &mut JsRuntime) -> bool {
    let state = runtime.op_state();
    let found = state.borrow().try_borrow::<ScriptOutcome>().is_some();
    found
}

/// Decode the envelope written by the prelude's `invoke`.
fn parse_outcome(raw: &str) -> Result<ExecutionResult, SandboxError> {
    let mut envelope: Value = serde_json::from_str(raw)?;

    if envelope.get("missing_entry").is_some() {
        return Err(SandboxError::MissingEntryPoint);
    }
    if let Some(error) = envelope.get("error") {
        return Err(SandboxError::JsError {
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
            stack: error
                .get("stack")
                .and_then(Value::as_str)
                .map(str::to_string),
        });
    }

    Ok(ExecutionResult {
        value: envelope
            .get_mut("ok")
            .map(Value::take)
            .unwrap_or(Value::Null),
    })
}

fn init_error(text: &str) -> SandboxError {
    let (message, stack) = split_js_error(text);
    SandboxError::InitError { message, stack }
}

/// Split deno_core's error rendering into the message line and full trace.
fn split_js_error(text: &str) -> (String, Option<String>) {
    let first = text.lines().next().unwrap_or_default();
    let message = first
        .strip_prefix("Uncaught (in promise) ")
        .or_else(|| first.strip_prefix("Uncaught "))
        .unwrap_or(first)
        .to_string();
    let stack = text.contains('\n').then(|| text.to_string());
    (message, stack)
}
