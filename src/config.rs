//! Admission policies and executor timing configuration.
//!
//! Each backend identity gets an [`AdmissionPolicy`] describing its rate
//! limits. Policies can be overridden per backend at runtime; absent an
//! override, [`default_policy`] supplies built-in limits for the known
//! backend identities and a conservative fallback for everything else.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Rate-limit policy for one backend identity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct AdmissionPolicy {
    /// Sustained requests per minute.
    pub rpm: f64,

    /// Sustained tokens per minute.
    pub tpm: f64,

    /// Maximum request burst (the request-token bucket capacity).
    pub burst: f64,
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        Self {
            rpm: 60.0,
            tpm: 90_000.0,
            burst: 5.0,
        }
    }
}

/// Built-in admission limits per backend identity.
///
/// These are deliberately conservative; callers override them with
/// account-specific limits via `AdmissionScheduler::set_policy`.
pub fn default_policy(backend: &str) -> AdmissionPolicy {
    match backend {
        "openai" => AdmissionPolicy {
            rpm: 500.0,
            tpm: 200_000.0,
            burst: 20.0,
        },
        "anthropic" => AdmissionPolicy {
            rpm: 300.0,
            tpm: 160_000.0,
            burst: 10.0,
        },
        "groq" => AdmissionPolicy {
            rpm: 240.0,
            tpm: 120_000.0,
            burst: 10.0,
        },
        "openrouter" => AdmissionPolicy {
            rpm: 120.0,
            tpm: 100_000.0,
            burst: 8.0,
        },
        // Local backends are bounded by hardware, not quotas; keep a high
        // ceiling so the scheduler stays out of the way.
        "ollama" => AdmissionPolicy {
            rpm: 600.0,
            tpm: 1_000_000.0,
            burst: 30.0,
        },
        _ => AdmissionPolicy::default(),
    }
}

/// Timing configuration for the failover executor and its watchdogs.
#[derive(Debug, Clone, Copy)]
pub struct ExecutorConfig {
    /// How long to wait for the transport handshake before declaring
    /// `connect_timeout`.
    pub connect_timeout: Duration,

    /// How long to wait between stream events before declaring
    /// `stall_timeout`.
    pub stall_timeout: Duration,

    /// Cancel the request when no activity is seen for this long. A policy
    /// layer above the transport-level stall timeout.
    pub idle_timeout: Duration,

    /// Hard deadline for the whole request across all attempts.
    pub hard_deadline: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            stall_timeout: Duration::from_secs(20),
            idle_timeout: Duration::from_secs(25),
            hard_deadline: Duration::from_secs(120),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_known_backends() {
        assert_eq!(default_policy("openai").rpm, 500.0);
        assert_eq!(default_policy("anthropic").burst, 10.0);
        assert!(default_policy("ollama").tpm >= 1_000_000.0);
    }

    #[test]
    fn default_policy_unknown_backend_falls_back() {
        let policy = default_policy("some-new-backend");
        assert_eq!(policy, AdmissionPolicy::default());
    }

    #[test]
    fn executor_config_defaults() {
        let cfg = ExecutorConfig::default();
        assert_eq!(cfg.connect_timeout, Duration::from_secs(15));
        assert_eq!(cfg.stall_timeout, Duration::from_secs(20));
        assert_eq!(cfg.idle_timeout, Duration::from_secs(25));
        assert_eq!(cfg.hard_deadline, Duration::from_secs(120));
        // The idle policy sits above the stall watchdog, and the deadline
        // above everything.
        assert!(cfg.idle_timeout > cfg.stall_timeout);
        assert!(cfg.hard_deadline > cfg.idle_timeout);
    }

    #[test]
    fn admission_policy_serde_roundtrip() {
        let policy = AdmissionPolicy {
            rpm: 42.0,
            tpm: 1000.0,
            burst: 3.0,
        };
        let json = serde_json::to_string(&policy).unwrap();
        let parsed: AdmissionPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, policy);
    }
}
