//! Error types and the failure taxonomy used by the failover loop.
//!
//! Every transport attempt resolves to either success or a [`GenerateError`].
//! The [`ErrorCategory`] of an error decides what the executor does next:
//! fatal categories stop the request immediately, retriable categories move
//! to the next candidate backend, and `Unknown` terminates without further
//! attempts.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced while driving a generation request through a backend.
#[derive(Error, Debug)]
pub enum GenerateError {
    /// The request was cancelled (user action, timeout, or surface teardown).
    #[error("aborted: {reason}")]
    Aborted {
        /// Why the request was cancelled (e.g. "cancelled", "idle_timeout").
        reason: String,
    },

    /// Authentication with the backend was rejected or no credential exists.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The backend returned a rate-limit response (HTTP 429).
    #[error("rate limited")]
    RateLimited {
        /// Suggested wait before retrying, in milliseconds, if the backend
        /// provided one.
        retry_after_ms: Option<u64>,
    },

    /// The backend returned a server-side error (HTTP 5xx).
    #[error("server error: HTTP {status}: {body}")]
    Server {
        /// The HTTP status code.
        status: u16,
        /// The response body, truncated by the transport.
        body: String,
    },

    /// The connection failed or dropped before the stream completed.
    #[error("network error: {0}")]
    Network(String),

    /// A transient failure worth retrying on another backend.
    #[error("transient error: {0}")]
    Transient(String),

    /// An unclassified failure. Never retried, to avoid surprising loops.
    #[error("unknown error: {0}")]
    Unknown(String),
}

impl GenerateError {
    /// Shorthand for [`GenerateError::Aborted`] with the given reason.
    pub fn aborted(reason: impl Into<String>) -> Self {
        Self::Aborted {
            reason: reason.into(),
        }
    }

    /// The classification bucket this error falls into.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Aborted { .. } => ErrorCategory::Abort,
            Self::Auth(_) => ErrorCategory::Auth,
            Self::RateLimited { .. } => ErrorCategory::RateLimit,
            Self::Server { .. } => ErrorCategory::Server,
            Self::Network(_) => ErrorCategory::Network,
            Self::Transient(_) => ErrorCategory::Transient,
            Self::Unknown(_) => ErrorCategory::Unknown,
        }
    }

    /// Fatal errors stop the request immediately: an aborted user action or
    /// a bad credential is not fixed by trying another backend.
    pub fn is_fatal(&self) -> bool {
        matches!(self.category(), ErrorCategory::Abort | ErrorCategory::Auth)
    }

    /// Retriable errors move the request to the next candidate backend.
    pub fn is_retriable(&self) -> bool {
        self.category().is_retriable()
    }

    /// Whether this error is an overload signal (HTTP 429 or 5xx) that
    /// should throttle future admissions for the backend.
    pub fn is_overload(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Server { .. })
    }

    /// The HTTP status carried by this error, if any.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Self::RateLimited { .. } => Some(429),
            Self::Server { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// The closed set of failure classifications used by the failover loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// User/timeout/unmount cancellation. Fatal, no failover.
    Abort,
    /// Missing or invalid credential. Fatal, no failover.
    Auth,
    /// Transient failure. Retriable.
    Transient,
    /// Rate limited by the backend. Retriable.
    RateLimit,
    /// Backend server error. Retriable.
    Server,
    /// Network-level failure. Retriable.
    Network,
    /// Unclassified. Terminal, no further attempts.
    Unknown,
}

impl ErrorCategory {
    /// Whether errors of this category trigger failover to the next backend.
    pub fn is_retriable(self) -> bool {
        matches!(
            self,
            Self::Transient | Self::RateLimit | Self::Server | Self::Network
        )
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Abort => "abort",
            Self::Auth => "auth",
            Self::Transient => "transient",
            Self::RateLimit => "rate_limit",
            Self::Server => "server",
            Self::Network => "network",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// A convenience alias for orchestrator operations.
pub type Result<T> = std::result::Result<T, GenerateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_aborted() {
        let err = GenerateError::aborted("idle_timeout");
        assert_eq!(err.to_string(), "aborted: idle_timeout");
    }

    #[test]
    fn display_server() {
        let err = GenerateError::Server {
            status: 503,
            body: "unavailable".into(),
        };
        assert_eq!(err.to_string(), "server error: HTTP 503: unavailable");
    }

    #[test]
    fn categories() {
        assert_eq!(GenerateError::aborted("x").category(), ErrorCategory::Abort);
        assert_eq!(
            GenerateError::Auth("bad key".into()).category(),
            ErrorCategory::Auth
        );
        assert_eq!(
            GenerateError::RateLimited {
                retry_after_ms: None
            }
            .category(),
            ErrorCategory::RateLimit
        );
        assert_eq!(
            GenerateError::Network("reset".into()).category(),
            ErrorCategory::Network
        );
        assert_eq!(
            GenerateError::Unknown("?".into()).category(),
            ErrorCategory::Unknown
        );
    }

    #[test]
    fn fatal_vs_retriable() {
        assert!(GenerateError::aborted("x").is_fatal());
        assert!(GenerateError::Auth("x".into()).is_fatal());
        assert!(!GenerateError::Network("x".into()).is_fatal());

        assert!(GenerateError::Network("x".into()).is_retriable());
        assert!(GenerateError::Transient("x".into()).is_retriable());
        assert!(GenerateError::RateLimited {
            retry_after_ms: Some(100)
        }
        .is_retriable());
        assert!(GenerateError::Server {
            status: 502,
            body: String::new()
        }
        .is_retriable());

        assert!(!GenerateError::Unknown("x".into()).is_retriable());
        assert!(!GenerateError::aborted("x").is_retriable());
        assert!(!GenerateError::Auth("x".into()).is_retriable());
    }

    #[test]
    fn overload_detection() {
        assert!(GenerateError::RateLimited {
            retry_after_ms: None
        }
        .is_overload());
        assert!(GenerateError::Server {
            status: 500,
            body: String::new()
        }
        .is_overload());
        assert!(!GenerateError::Network("x".into()).is_overload());
        assert!(!GenerateError::Auth("x".into()).is_overload());
    }

    #[test]
    fn http_status() {
        assert_eq!(
            GenerateError::RateLimited {
                retry_after_ms: None
            }
            .http_status(),
            Some(429)
        );
        assert_eq!(
            GenerateError::Server {
                status: 502,
                body: String::new()
            }
            .http_status(),
            Some(502)
        );
        assert_eq!(GenerateError::Network("timeout".into()).http_status(), None);
    }

    #[test]
    fn category_display_matches_serde() {
        let cat = ErrorCategory::RateLimit;
        assert_eq!(cat.to_string(), "rate_limit");
        assert_eq!(serde_json::to_string(&cat).unwrap(), "\"rate_limit\"");
    }
}
