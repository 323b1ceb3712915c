//! Continuously-refilling token bucket, the rate-limiting primitive behind
//! the admission scheduler.
//!
//! Each backend identity gets one bucket with two counters: request tokens
//! (bounded by the burst capacity) and a token budget (bounded by the
//! tokens-per-minute capacity). Refill is computed lazily from elapsed time
//! at read time; both counters stay clamped to `[0, capacity]`.

use std::time::Duration;

use tokio::time::Instant;

use crate::config::AdmissionPolicy;

/// Observable state of a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketStatus {
    /// The bucket can admit work.
    Idle,
    /// No request token is available.
    LimitedByRequests,
    /// The token budget cannot cover the estimated cost.
    LimitedByTokens,
    /// The backend signalled overload; admissions are held back.
    Backoff,
}

/// Why an admission attempt was refused, and when to try again.
#[derive(Debug, Clone, Copy)]
pub struct Blocked {
    /// The limiting condition.
    pub status: BucketStatus,
    /// Estimated wait until the condition clears.
    pub retry_in: Duration,
}

/// Read-only view of a bucket for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketSnapshot {
    /// The bucket's current status.
    pub status: BucketStatus,
    /// Remaining backoff, if the bucket is backing off.
    pub backoff_ms: Option<u64>,
}

/// A per-backend token bucket with lazy refill.
#[derive(Debug)]
pub struct TokenBucket {
    policy: AdmissionPolicy,
    request_tokens: f64,
    budget_tokens: f64,
    last_refill: Instant,
    status: BucketStatus,
    backoff_until: Option<Instant>,
}

impl TokenBucket {
    /// Create a full bucket under the given policy.
    pub fn new(policy: AdmissionPolicy, now: Instant) -> Self {
        Self {
            policy,
            request_tokens: policy.burst,
            budget_tokens: policy.tpm,
            last_refill: now,
            status: BucketStatus::Idle,
            backoff_until: None,
        }
    }

    /// Replace the policy, clamping current counters to the new capacities.
    pub fn set_policy(&mut self, policy: AdmissionPolicy, now: Instant) {
        self.refill(now);
        self.policy = policy;
        self.request_tokens = self.request_tokens.clamp(0.0, policy.burst);
        self.budget_tokens = self.budget_tokens.clamp(0.0, policy.tpm);
    }

    /// Accrue tokens for the time elapsed since the last refill.
    pub fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.request_tokens =
                (self.request_tokens + self.policy.rpm / 60.0 * elapsed).min(self.policy.burst);
            self.budget_tokens =
                (self.budget_tokens + self.policy.tpm / 60.0 * elapsed).min(self.policy.tpm);
            self.last_refill = now;
        }
        if let Some(until) = self.backoff_until {
            if now >= until {
                self.backoff_until = None;
                if self.status == BucketStatus::Backoff {
                    self.status = BucketStatus::Idle;
                }
            }
        }
    }

    /// Try to admit one request with the given estimated token cost.
    ///
    /// On success both counters are debited. On refusal, returns the limiting
    /// condition and an estimate of how long until it clears.
    pub fn try_admit(&mut self, cost: f64, now: Instant) -> Result<(), Blocked> {
        self.refill(now);

        if let Some(until) = self.backoff_until {
            self.status = BucketStatus::Backoff;
            return Err(Blocked {
                status: BucketStatus::Backoff,
                retry_in: until.saturating_duration_since(now),
            });
        }

        if self.request_tokens < 1.0 {
            self.status = BucketStatus::LimitedByRequests;
            let per_sec = (self.policy.rpm / 60.0).max(f64::EPSILON);
            let wait = (1.0 - self.request_tokens) / per_sec;
            return Err(Blocked {
                status: BucketStatus::LimitedByRequests,
                retry_in: Duration::from_secs_f64(wait),
            });
        }

        if self.budget_tokens < cost {
            self.status = BucketStatus::LimitedByTokens;
            let per_sec = (self.policy.tpm / 60.0).max(f64::EPSILON);
            let wait = (cost - self.budget_tokens) / per_sec;
            return Err(Blocked {
                status: BucketStatus::LimitedByTokens,
                retry_in: Duration::from_secs_f64(wait),
            });
        }

        self.request_tokens -= 1.0;
        self.budget_tokens -= cost;
        self.status = BucketStatus::Idle;
        Ok(())
    }

    /// Hold back admissions until `until`.
    pub fn begin_backoff(&mut self, until: Instant) {
        self.backoff_until = Some(until);
        self.status = BucketStatus::Backoff;
    }

    /// Read-only view for observability.
    pub fn snapshot(&self, now: Instant) -> BucketSnapshot {
        let backoff_ms = self
            .backoff_until
            .filter(|until| *until > now)
            .map(|until| until.saturating_duration_since(now).as_millis() as u64);
        BucketSnapshot {
            status: self.status,
            backoff_ms,
        }
    }

    #[cfg(test)]
    pub(crate) fn request_tokens(&self) -> f64 {
        self.request_tokens
    }

    #[cfg(test)]
    pub(crate) fn budget_tokens(&self) -> f64 {
        self.budget_tokens
    }
}
