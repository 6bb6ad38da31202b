//! Error types for the script sandbox.

use serde::Serialize;
use thiserror::Error;

/// Errors that can occur during sandbox execution.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The bundle's top-level code (or bootstrap) threw.
    #[error("{message}")]
    InitError {
        /// The error message from JavaScript.
        message: String,
        /// Stack trace, when one was available.
        stack: Option<String>,
    },

    /// The bundle's top-level code did not finish before the init deadline.
    #[error("Script initialization timed out after {timeout_ms}ms")]
    InitTimeout {
        /// Configured init timeout in milliseconds.
        timeout_ms: u64,
    },

    /// The bundle does not expose a callable `main`.
    #[error("Script does not export a main function")]
    MissingEntryPoint,

    /// `main` threw or its promise rejected.
    #[error("{message}")]
    JsError {
        /// The error message from JavaScript.
        message: String,
        /// Stack trace, when one was available.
        stack: Option<String>,
    },

    /// `main` did not settle before the execution deadline.
    #[error("Script execution timed out after {timeout_ms}ms")]
    Timeout {
        /// Configured timeout in milliseconds.
        timeout_ms: u64,
    },

    /// Execution result exceeds the configured maximum size.
    #[error("output exceeds maximum size of {max} bytes")]
    OutputTooLarge {
        /// Maximum allowed size.
        max: usize,
    },

    /// V8 heap memory limit was exceeded.
    #[error("V8 heap limit exceeded")]
    HeapLimitExceeded,

    /// Too many concurrent sandbox executions.
    #[error("concurrency limit reached (max {max} concurrent executions)")]
    ConcurrencyLimit {
        /// Maximum allowed concurrent executions.
        max: usize,
    },

    /// Reading the bundle from disk failed.
    #[error("failed to read bundle: {0}")]
    Io(#[from] std::io::Error),

    /// Result serialization failed.
    #[error("result serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic execution failure.
    #[error("sandbox execution failed: {0}")]
    Execution(#[from] anyhow::Error),
}

/// The `{message, stack?}` shape callers receive for a failed execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorData {
    /// Human-readable error message.
    pub message: String,
    /// JavaScript stack trace, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl SandboxError {
    /// Normalize into the caller-facing `{message, stack?}` shape.
    pub fn to_error_data(&self) -> ErrorData {
        let stack = match self {
            Self::InitError { stack, .. } | Self::JsError { stack, .. } => stack.clone(),
            _ => None,
        };
        ErrorData {
            message: self.to_string(),
            stack,
        }
    }

    /// Short label for logs, audit entries and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InitError { .. } => "init_error",
            Self::InitTimeout { .. } => "init_timeout",
            Self::MissingEntryPoint => "missing_entry_point",
            Self::JsError { .. } => "js_error",
            Self::Timeout { .. } => "timeout",
            Self::OutputTooLarge { .. } => "output_too_large",
            Self::HeapLimitExceeded => "heap_limit",
            Self::ConcurrencyLimit { .. } => "concurrency_limit",
            Self::Io(_) => "io",
            Self::Serialization(_) => "serialization",
            Self::Execution(_) => "execution",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_message_names_limit() {
        let err = SandboxError::Timeout { timeout_ms: 50 };
        assert_eq!(err.to_string(), "Script execution timed out after 50ms");
    }

    #[test]
    fn js_error_keeps_message_and_stack() {
        let err = SandboxError::JsError {
            message: "boom".into(),
            stack: Some("Error: boom\n    at main".into()),
        };
        let data = err.to_error_data();
        assert_eq!(data.message, "boom");
        assert_eq!(data.stack.as_deref(), Some("Error: boom\n    at main"));
    }

    #[test]
    fn error_data_omits_missing_stack() {
        let data = SandboxError::MissingEntryPoint.to_error_data();
        let json = serde_json::to_value(&data).unwrap();
        assert!(json.get("stack").is_none());
        assert_eq!(json["message"], "Script does not export a main function");
    }
}
