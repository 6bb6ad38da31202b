#![warn(missing_docs)]

//! # runner-sandbox
//!
//! Validation, bundling and sandboxed execution of user-authored automation
//! scripts.
//!
//! A script flows through three stages:
//!
//! 1. [`validator`] parses the source and rejects dangerous constructs.
//! 2. [`builder`] wraps the source and bundles it with an external toolchain
//!    into a single self-contained IIFE.
//! 3. [`executor`] runs the bundle in a fresh deno_core isolate and returns
//!    the value resolved by the script's `main` entry point.
//!
//! ## Security model
//!
//! - **V8 isolate**: one fresh isolate per execution, never reused
//! - **No ambient capabilities**: no module system, filesystem, process or sockets
//! - **Allow-listed network**: `fetch` only reaches the execution's allowed domains
//! - **Opaque API client**: the access token stays on the host side
//! - **Preemptive deadlines**: a watchdog terminates V8 on timeout, CPU-bound or not
//! - **Heap ceiling**: near-heap-limit callback terminates instead of aborting

pub mod api_client;
pub mod audit;
mod bootstrap;
pub mod builder;
pub mod error;
pub mod executor;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod ops;
pub mod redact;
pub mod types;
pub mod validator;

pub use api_client::{HttpApiClient, HttpApiClientFactory};
pub use builder::{BuildError, BuiltBundle, ScriptBuilder, ToolCommand, ToolchainConfig};
pub use error::SandboxError;
pub use executor::{SandboxConfig, SandboxExecutor};
pub use types::{
    ExecutionContext, ExecutionResult, FunctionParameter, RunnerConfig, ScriptFunction,
    ScriptSource,
};
pub use validator::{detect_function_names, validate, ValidationResult};

/// Workspace API capability handed to sandboxed scripts as `plane`.
///
/// Implementations hold the caller's credentials. Script code never sees the
/// token; it calls `plane.get(path)` and friends, which route here.
#[async_trait::async_trait]
pub trait ApiDispatcher: Send + Sync {
    /// Perform one API request.
    ///
    /// - `method`: HTTP method, upper-case (e.g. "GET", "POST")
    /// - `path`: path relative to the API base URL
    /// - `body`: optional JSON body
    async fn request(
        &self,
        method: &str,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, runner_error::DispatchError>;
}

/// Builds one [`ApiDispatcher`] per execution from that execution's context.
pub trait ApiClientFactory: Send + Sync {
    /// Create the dispatcher for a single execution.
    fn create(&self, ctx: &ExecutionContext) -> std::sync::Arc<dyn ApiDispatcher>;
}
