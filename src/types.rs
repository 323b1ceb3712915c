//! Shared value types: messages, transport events, priorities, telemetry.
//!
//! [`TransportEvent`] is the closed tagged-variant type every backend emits
//! through its event sink. The executor matches on it exhaustively, so adding
//! an event kind is a compile-time-checked change.

use serde::{Deserialize, Serialize};

use crate::error::ErrorCategory;

/// A message in a chat conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    /// The role of the message author (e.g. "system", "user", "assistant").
    pub role: String,

    /// The content of the message.
    pub content: String,
}

impl Message {
    /// Create a message with role and content.
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    /// Create a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    /// Create an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }
}

/// Sampling configuration forwarded to the backend transport.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SamplingOptions {
    /// Maximum number of tokens to generate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Sampling temperature (0.0 = deterministic).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
}

/// Token usage counts reported by a backend during streaming.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    /// Tokens consumed by the prompt.
    pub input_tokens: u32,

    /// Tokens produced by the generation.
    pub output_tokens: u32,
}

/// Scheduling priority for an admitted unit of work.
///
/// Lower ordinal is served first: interactive user requests jump ahead of
/// test traffic, which jumps ahead of background work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// An interactive user request.
    User,
    /// A connectivity/smoke test request.
    Test,
    /// Background work (summarization, prefetch).
    Background,
}

/// The request handed to a backend's `stream` call.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    /// The orchestrator-assigned request id, monotonically increasing.
    pub request_id: u64,

    /// The model identifier to use on this backend.
    pub model: String,

    /// The conversation messages.
    pub messages: Vec<Message>,

    /// Sampling configuration.
    pub sampling: SamplingOptions,
}

/// A low-level event emitted by a backend transport while streaming.
///
/// Backends emit these through the event sink in order: zero or more of
/// each kind, terminated by the `stream` call returning. The executor is the
/// single consumer and matches exhaustively.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The request has been dispatched.
    Start,

    /// The connection handshake completed.
    Handshake,

    /// The first byte of the response arrived.
    FirstByte,

    /// A partial text chunk.
    Delta(String),

    /// Token usage counts, typically sent near the end of the stream.
    Usage(Usage),

    /// A non-terminal error detail observed mid-stream. Recorded as the
    /// last-seen error; the attempt outcome is decided by the `stream`
    /// call's return value.
    Error(String),
}

/// Why a request reached its terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinalReason {
    /// The request completed successfully.
    Ok,
    /// The request failed (fatal error or candidates exhausted).
    Error,
    /// The request was cancelled.
    Aborted,
}

/// The single terminal telemetry record emitted per logical request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalRecord {
    /// The request id.
    pub id: u64,

    /// The terminal outcome.
    pub reason: FinalReason,

    /// Wall-clock duration from submission to terminal state.
    pub duration_ms: u64,

    /// How many backend attempts were made.
    pub attempts: u32,

    /// The HTTP status of the final error, if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,

    /// The final error message, if the request did not succeed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Observability events broadcast by the executor to external sinks.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    /// The request moved to the next candidate backend after a retriable
    /// failure.
    Failover {
        /// The backend that failed.
        from: String,
        /// The backend being tried next.
        to: String,
        /// Why the previous attempt failed.
        reason: ErrorCategory,
        /// The attempt number that failed (1-based).
        attempt: u32,
    },

    /// The request reached a terminal state.
    Final(FinalRecord),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_helpers() {
        let sys = Message::system("You are helpful.");
        assert_eq!(sys.role, "system");
        assert_eq!(Message::user("hi").role, "user");
        assert_eq!(Message::assistant("ok").role, "assistant");
    }

    #[test]
    fn priority_ordering() {
        assert!(Priority::User < Priority::Test);
        assert!(Priority::Test < Priority::Background);
    }

    #[test]
    fn sampling_options_skip_none() {
        let json = serde_json::to_string(&SamplingOptions::default()).unwrap();
        assert_eq!(json, "{}");
    }

    #[test]
    fn final_record_serialization() {
        let record = FinalRecord {
            id: 7,
            reason: FinalReason::Ok,
            duration_ms: 1234,
            attempts: 2,
            http_status: None,
            error_message: None,
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains(r#""reason":"ok""#));
        assert!(!json.contains("http_status"));
        assert!(!json.contains("error_message"));
    }

    #[test]
    fn final_record_error_fields() {
        let record = FinalRecord {
            id: 8,
            reason: FinalReason::Error,
            duration_ms: 50,
            attempts: 3,
            http_status: Some(503),
            error_message: Some("unavailable".into()),
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains(r#""reason":"error""#));
        assert!(json.contains(r#""http_status":503"#));
    }
}
