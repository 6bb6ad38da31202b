//! Audit logging for script executions.
//!
//! Every execution emits an [`AuditEntry`] containing:
//! - Audit ID (UUID) plus the caller's execution id and workspace
//! - SHA-256 hash of the bundle (never the raw bundle in logs)
//! - A redacted preview of the first 500 chars of the bundle
//! - Outbound `fetch` calls and API capability calls, with hashed URLs/paths
//! - Duration and outcome
//!
//! The [`AuditLogger`] trait allows pluggable backends.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::types::{ExecutionResult, RunnerConfig};
use crate::{ApiDispatcher, SandboxError};

/// Maximum length of the bundle preview in audit entries.
const CODE_PREVIEW_MAX: usize = 500;

/// A complete audit record for a single execution.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    /// Unique audit record identifier.
    pub audit_id: String,
    /// Caller-visible execution identifier.
    pub execution_id: String,
    /// Workspace the execution ran for.
    pub workspace_slug: String,
    /// ISO-8601 timestamp of when execution started.
    pub timestamp: DateTime<Utc>,
    /// SHA-256 hash of the executed bundle.
    pub code_hash: String,
    /// First N characters of the bundle, secrets redacted.
    pub code_preview: String,
    /// Outbound `fetch` calls.
    pub fetch_calls: Vec<FetchCallAudit>,
    /// Workspace API calls.
    pub api_calls: Vec<ApiCallAudit>,
    /// Total execution duration in milliseconds.
    pub duration_ms: u64,
    /// Size of the serialized result in bytes.
    pub result_size_bytes: usize,
    /// Final outcome.
    pub outcome: AuditOutcome,
}

/// Audit record for one sandboxed `fetch`.
#[derive(Debug, Clone, Serialize)]
pub struct FetchCallAudit {
    /// HTTP method.
    pub method: String,
    /// Destination host (empty when the URL did not parse).
    pub host: String,
    /// SHA-256 hash of the full URL (query strings may carry secrets).
    pub url_hash: String,
    /// Response status, when a response was received.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    /// Duration in milliseconds.
    pub duration_ms: u64,
    /// Whether the call was allowed and completed.
    pub success: bool,
}

/// Audit record for one workspace API call.
#[derive(Debug, Clone, Serialize)]
pub struct ApiCallAudit {
    /// HTTP method.
    pub method: String,
    /// SHA-256 hash of the request path.
    pub path_hash: String,
    /// Duration in milliseconds.
    pub duration_ms: u64,
    /// Whether the call succeeded.
    pub success: bool,
}

/// The outcome of an execution.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum AuditOutcome {
    /// `main` resolved.
    Success,
    /// Execution failed with an error.
    Error {
        /// Error kind label.
        kind: String,
        /// The error message.
        message: String,
    },
    /// Execution was terminated at a deadline.
    Timeout,
}

/// Trait for audit log backends.
#[async_trait::async_trait]
pub trait AuditLogger: Send + Sync {
    /// Write an audit entry.
    async fn log(&self, entry: &AuditEntry);
}

/// A no-op audit logger for when auditing is not needed.
pub struct NoopAuditLogger;

#[async_trait::async_trait]
impl AuditLogger for NoopAuditLogger {
    async fn log(&self, _entry: &AuditEntry) {}
}

/// An audit logger that emits structured events via [`tracing`].
///
/// Entries are logged at `INFO` with `audit = true`; call lists are
/// summarised as counts.
pub struct TracingAuditLogger;

#[async_trait::async_trait]
impl AuditLogger for TracingAuditLogger {
    async fn log(&self, entry: &AuditEntry) {
        let outcome = match &entry.outcome {
            AuditOutcome::Success => "success",
            AuditOutcome::Error { .. } => "error",
            AuditOutcome::Timeout => "timeout",
        };
        tracing::info!(
            audit = true,
            audit_id = %entry.audit_id,
            execution_id = %entry.execution_id,
            workspace_slug = %entry.workspace_slug,
            code_hash = %entry.code_hash,
            duration_ms = entry.duration_ms,
            result_size_bytes = entry.result_size_bytes,
            fetch_calls = entry.fetch_calls.len(),
            api_calls = entry.api_calls.len(),
            outcome = outcome,
            "audit"
        );
    }
}

/// Compute the SHA-256 hash of a string, returned as a hex string.
pub fn sha256_hex(data: &str) -> String {
    let digest = Sha256::digest(data.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// First N bytes of `code` on a char boundary, with an ellipsis if truncated.
pub fn code_preview(code: &str) -> String {
    if code.len() <= CODE_PREVIEW_MAX {
        return code.to_string();
    }
    let mut end = CODE_PREVIEW_MAX;
    while !code.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &code[..end])
}

/// Builder for constructing audit entries during execution.
pub struct AuditEntryBuilder {
    execution_id: String,
    workspace_slug: String,
    timestamp: DateTime<Utc>,
    code_hash: String,
    code_preview: String,
    fetch_calls: Vec<FetchCallAudit>,
    api_calls: Vec<ApiCallAudit>,
    start: Instant,
}

impl AuditEntryBuilder {
    /// Start building an audit entry for an execution of `bundle`.
    pub fn new(config: &RunnerConfig, bundle: &str) -> Self {
        Self {
            execution_id: config.execution_id.clone(),
            workspace_slug: config.workspace_slug.clone(),
            timestamp: Utc::now(),
            code_hash: sha256_hex(bundle),
            code_preview: crate::redact::redact_secrets(&code_preview(bundle), None),
            fetch_calls: Vec::new(),
            api_calls: Vec::new(),
            start: Instant::now(),
        }
    }

    /// Record a fetch call.
    pub fn record_fetch(&mut self, audit: FetchCallAudit) {
        self.fetch_calls.push(audit);
    }

    /// Record an API call.
    pub fn record_api_call(&mut self, audit: ApiCallAudit) {
        self.api_calls.push(audit);
    }

    /// Finalize the audit entry with the execution result.
    pub fn finish(self, result: &Result<ExecutionResult, SandboxError>) -> AuditEntry {
        let duration_ms = self.start.elapsed().as_millis() as u64;
        let (result_size_bytes, outcome) = match result {
            Ok(r) => {
                let size = serde_json::to_string(&r.value).map(|s| s.len()).unwrap_or(0);
                (size, AuditOutcome::Success)
            }
            Err(SandboxError::Timeout { .. } | SandboxError::InitTimeout { .. }) => {
                (0, AuditOutcome::Timeout)
            }
            Err(e) => (
                0,
                AuditOutcome::Error {
                    kind: e.kind().to_string(),
                    message: crate::redact::redact_secrets(&e.to_string(), None),
                },
            ),
        };

        AuditEntry {
            audit_id: Uuid::new_v4().to_string(),
            execution_id: self.execution_id,
            workspace_slug: self.workspace_slug,
            timestamp: self.timestamp,
            code_hash: self.code_hash,
            code_preview: self.code_preview,
            fetch_calls: self.fetch_calls,
            api_calls: self.api_calls,
            duration_ms,
            result_size_bytes,
            outcome,
        }
    }
}

/// An audit-recording wrapper around an [`ApiDispatcher`].
pub struct AuditingApiDispatcher {
    inner: Arc<dyn ApiDispatcher>,
    audit_tx: tokio::sync::mpsc::UnboundedSender<ApiCallAudit>,
}

impl AuditingApiDispatcher {
    /// Wrap a dispatcher with audit recording.
    pub fn new(
        inner: Arc<dyn ApiDispatcher>,
        audit_tx: tokio::sync::mpsc::UnboundedSender<ApiCallAudit>,
    ) -> Self {
        Self { inner, audit_tx }
    }
}

#[async_trait::async_trait]
impl ApiDispatcher for AuditingApiDispatcher {
    async fn request(
        &self,
        method: &str,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, runner_error::DispatchError> {
        let path_hash = sha256_hex(path);
        let start = Instant::now();

        let result = self.inner.request(method, path, body).await;

        let audit = ApiCallAudit {
            method: method.to_string(),
            path_hash,
            duration_ms: start.elapsed().as_millis() as u64,
            success: result.is_ok(),
        };
        let _ = self.audit_tx.send(audit);

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runner_error::DispatchError;

    fn config() -> RunnerConfig {
        RunnerConfig {
            workspace_slug: "acme".into(),
            task_id: "sync".into(),
            execution_id: "sync-1".into(),
        }
    }

    #[test]
    fn sha256_matches_known_vector() {
        assert_eq!(
            sha256_hex("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn preview_truncates_on_char_boundary() {
        let code = "é".repeat(400);
        let preview = code_preview(&code);
        assert!(preview.ends_with("..."));
        assert!(preview.len() <= CODE_PREVIEW_MAX + 3);
    }

    #[test]
    fn preview_keeps_short_code() {
        assert_eq!(code_preview("return 1;"), "return 1;");
    }

    #[test]
    fn builder_records_success() {
        let mut b = AuditEntryBuilder::new(&config(), "var globalThis = 1;");
        b.record_fetch(FetchCallAudit {
            method: "GET".into(),
            host: "plane.so".into(),
            url_hash: sha256_hex("https://plane.so/"),
            status: Some(200),
            duration_ms: 3,
            success: true,
        });
        let entry = b.finish(&Ok(ExecutionResult {
            value: serde_json::json!({"n": 1}),
        }));
        assert_eq!(entry.execution_id, "sync-1");
        assert_eq!(entry.workspace_slug, "acme");
        assert_eq!(entry.fetch_calls.len(), 1);
        assert_eq!(entry.result_size_bytes, r#"{"n":1}"#.len());
        assert!(matches!(entry.outcome, AuditOutcome::Success));
    }

    #[test]
    fn builder_maps_timeouts_and_errors() {
        let b = AuditEntryBuilder::new(&config(), "x");
        let entry = b.finish(&Err(SandboxError::Timeout { timeout_ms: 5 }));
        assert!(matches!(entry.outcome, AuditOutcome::Timeout));

        let b = AuditEntryBuilder::new(&config(), "x");
        let entry = b.finish(&Err(SandboxError::MissingEntryPoint));
        match entry.outcome {
            AuditOutcome::Error { kind, .. } => assert_eq!(kind, "missing_entry_point"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn preview_redacts_inline_secrets() {
        let b = AuditEntryBuilder::new(&config(), "const h = 'Bearer abc.def.ghi';");
        let entry = b.finish(&Err(SandboxError::MissingEntryPoint));
        assert!(!entry.code_preview.contains("abc.def.ghi"));
    }

    struct FailingApi;

    #[async_trait::async_trait]
    impl ApiDispatcher for FailingApi {
        async fn request(
            &self,
            _method: &str,
            _path: &str,
            _body: Option<serde_json::Value>,
        ) -> Result<serde_json::Value, DispatchError> {
            Err(DispatchError::Upstream {
                status: 500,
                message: "down".into(),
            })
        }
    }

    #[tokio::test]
    async fn auditing_dispatcher_records_calls() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let api = AuditingApiDispatcher::new(Arc::new(FailingApi), tx);
        assert!(api.request("GET", "/issues/", None).await.is_err());
        let audit = rx.try_recv().unwrap();
        assert_eq!(audit.method, "GET");
        assert_eq!(audit.path_hash, sha256_hex("/issues/"));
        assert!(!audit.success);
    }
}
