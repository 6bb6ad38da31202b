//! Typed error types for the host capabilities injected into the script sandbox.
//!
//! Provides [`DispatchError`], the canonical error type for every capability
//! that crosses the isolate boundary: the sandboxed `fetch` and the workspace
//! API client.

use thiserror::Error;

/// Canonical error type for capability calls made from sandboxed scripts.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DispatchError {
    /// The target host is not on the execution's allow-list.
    #[error("Domain not allowed: {host}")]
    DomainNotAllowed {
        /// The hostname that was rejected.
        host: String,
    },

    /// The URL could not be parsed or uses an unsupported scheme.
    #[error("Invalid URL '{url}': {reason}")]
    InvalidUrl {
        /// The URL as supplied by the script.
        url: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The upstream service answered with an error status.
    #[error("upstream error ({status}): {message}")]
    Upstream {
        /// HTTP status code.
        status: u16,
        /// Response body or reason phrase.
        message: String,
    },

    /// The request did not complete in time.
    #[error("request timed out after {timeout_ms}ms")]
    Timeout {
        /// The timeout in milliseconds.
        timeout_ms: u64,
    },

    /// A per-execution budget was exhausted.
    #[error("limit exceeded: {0}")]
    LimitExceeded(String),

    /// Transport-level failure (DNS, connection reset, TLS, ...).
    #[error("request failed: {0}")]
    Transport(String),
}

impl DispatchError {
    /// Returns a static error code string for programmatic matching.
    pub fn code(&self) -> &'static str {
        match self {
            Self::DomainNotAllowed { .. } => "DOMAIN_NOT_ALLOWED",
            Self::InvalidUrl { .. } => "INVALID_URL",
            Self::Upstream { .. } => "UPSTREAM_ERROR",
            Self::Timeout { .. } => "TIMEOUT",
            Self::LimitExceeded(_) => "LIMIT_EXCEEDED",
            Self::Transport(_) => "TRANSPORT_ERROR",
        }
    }
}

// Compile-time assertion: DispatchError must be Send + Sync + 'static
const _: fn() = || {
    fn assert_bounds<T: Send + Sync + 'static>() {}
    assert_bounds::<DispatchError>();
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_domain_not_allowed() {
        let err = DispatchError::DomainNotAllowed {
            host: "evil.example".into(),
        };
        assert_eq!(err.to_string(), "Domain not allowed: evil.example");
    }

    #[test]
    fn display_invalid_url() {
        let err = DispatchError::InvalidUrl {
            url: "ftp://x".into(),
            reason: "unsupported scheme 'ftp'".into(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid URL 'ftp://x': unsupported scheme 'ftp'"
        );
    }

    #[test]
    fn display_upstream() {
        let err = DispatchError::Upstream {
            status: 404,
            message: "not found".into(),
        };
        assert_eq!(err.to_string(), "upstream error (404): not found");
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(
            DispatchError::DomainNotAllowed { host: "x".into() }.code(),
            "DOMAIN_NOT_ALLOWED"
        );
        assert_eq!(DispatchError::Timeout { timeout_ms: 10 }.code(), "TIMEOUT");
        assert_eq!(
            DispatchError::LimitExceeded("fetch".into()).code(),
            "LIMIT_EXCEEDED"
        );
        assert_eq!(
            DispatchError::Transport("reset".into()).code(),
            "TRANSPORT_ERROR"
        );
    }
}
