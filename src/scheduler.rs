//! Per-backend admission scheduling: token-bucket rate limiting plus a
//! priority queue.
//!
//! Callers ask for admission via [`AdmissionScheduler::admit`] and await the
//! grant; queued jobs are served in priority order as their backend's bucket
//! refills. Overload signals from completed attempts (HTTP 429/5xx) push the
//! backend into bounded exponential backoff with jitter. The scheduler never
//! drops a live job; it only delays it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::bucket::{BucketSnapshot, TokenBucket};
use crate::config::{default_policy, AdmissionPolicy};
use crate::error::GenerateError;
use crate::types::Priority;

/// Default estimated token cost when the caller gives none.
const DEFAULT_COST: f64 = 1000.0;
/// Floor for estimated token cost.
const MIN_COST: f64 = 100.0;
/// Minimum delay before re-ticking when jobs are blocked, to avoid
/// busy-polling.
const MIN_TICK: Duration = Duration::from_millis(500);
/// Base backoff delay in milliseconds.
const BACKOFF_BASE_MS: u64 = 500;
/// Backoff cap in milliseconds.
const BACKOFF_CAP_MS: u64 = 30_000;

struct PendingJob {
    seq: u64,
    backend: String,
    cost: f64,
    priority: Priority,
    grant: oneshot::Sender<()>,
}

struct State {
    buckets: HashMap<String, TokenBucket>,
    queue: Vec<PendingJob>,
    next_seq: u64,
    wake_at: Option<Instant>,
}

impl State {
    fn bucket_mut(&mut self, backend: &str, now: Instant) -> &mut TokenBucket {
        self.buckets
            .entry(backend.to_owned())
            .or_insert_with(|| TokenBucket::new(default_policy(backend), now))
    }
}

/// Fair, rate-limited admission of work per backend.
///
/// Cloning is cheap; all clones share the same buckets and queue. Bucket
/// mutation happens only under the internal lock, preserving the no-negative
/// token invariant on multi-threaded runtimes.
#[derive(Clone)]
pub struct AdmissionScheduler {
    inner: Arc<Mutex<State>>,
}

impl Default for AdmissionScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl AdmissionScheduler {
    /// Create a scheduler with no queued work and no policy overrides.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(State {
                buckets: HashMap::new(),
                queue: Vec::new(),
                next_seq: 0,
                wake_at: None,
            })),
        }
    }

    /// Override the admission limits for a backend. Backends without an
    /// override use the built-in defaults for their identity.
    pub fn set_policy(&self, backend: &str, policy: AdmissionPolicy) {
        let now = Instant::now();
        {
            let mut state = self.inner.lock().expect("scheduler lock poisoned");
            match state.buckets.get_mut(backend) {
                Some(bucket) => bucket.set_policy(policy, now),
                None => {
                    state
                        .buckets
                        .insert(backend.to_owned(), TokenBucket::new(policy, now));
                }
            }
        }
        self.tick();
    }

    /// Queue a unit of work and await its admission grant.
    ///
    /// The job is enqueued immediately (before the returned future is
    /// polled) and served in priority order, lowest ordinal first, ties by
    /// submission sequence. Dropping the returned future abandons the job
    /// without debiting the bucket.
    pub fn admit(
        &self,
        backend: &str,
        estimated_tokens: Option<u32>,
        priority: Priority,
    ) -> impl Future<Output = ()> + Send {
        let cost = estimated_tokens
            .map_or(DEFAULT_COST, f64::from)
            .max(MIN_COST);
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.inner.lock().expect("scheduler lock poisoned");
            let seq = state.next_seq;
            state.next_seq += 1;
            state.queue.push(PendingJob {
                seq,
                backend: backend.to_owned(),
                cost,
                priority,
                grant: tx,
            });
            state.queue.sort_by_key(|j| (j.priority, j.seq));
        }
        self.tick();
        async move {
            // The sender is dropped only when the job was abandoned or the
            // scheduler torn down; either way the caller is going away too.
            let _ = rx.await;
        }
    }

    /// Tell the scheduler how an admitted attempt ended.
    ///
    /// Overload outcomes (rate limit or server error) put the backend's
    /// bucket into exponential backoff with jitter; everything else just
    /// re-runs the admission pass so the next queued job can start.
    pub fn report_outcome(&self, backend: &str, result: Result<(), &GenerateError>) {
        let backoff = match result {
            Err(err) if err.is_overload() => {
                let mut rng = rand::thread_rng();
                // A small random attempt count desynchronizes concurrent
                // retries better than a per-backend counter here.
                let attempt: u32 = rng.gen_range(0..=2);
                let jitter: u64 = rng.gen_range(0..=250);
                let delay_ms =
                    (BACKOFF_BASE_MS.saturating_mul(1 << attempt) + jitter).min(BACKOFF_CAP_MS);
                Some(Duration::from_millis(delay_ms))
            }
            _ => None,
        };

        if let Some(delay) = backoff {
            let now = Instant::now();
            {
                let mut state = self.inner.lock().expect("scheduler lock poisoned");
                state.bucket_mut(backend, now).begin_backoff(now + delay);
            }
            warn!(
                backend,
                backoff_ms = delay.as_millis() as u64,
                "backend overloaded, backing off admissions"
            );
            self.schedule_tick(delay);
        } else {
            self.tick();
        }
    }

    /// Read-only view of a backend's bucket, if one exists yet.
    pub fn snapshot(&self, backend: &str) -> Option<BucketSnapshot> {
        let state = self.inner.lock().expect("scheduler lock poisoned");
        state.buckets.get(backend).map(|b| b.snapshot(Instant::now()))
    }

    /// Number of jobs currently waiting for admission.
    pub fn queued(&self) -> usize {
        self.inner
            .lock()
            .expect("scheduler lock poisoned")
            .queue
            .len()
    }

    /// One admission pass over the queue in priority order.
    fn tick(&self) {
        let now = Instant::now();
        let mut min_wait: Option<Duration> = None;
        let queue_remaining;

        {
            let mut state = self.inner.lock().expect("scheduler lock poisoned");

            // Abandoned jobs (dropped receivers) leave without a debit.
            state.queue.retain(|job| !job.grant.is_closed());

            let mut remaining = Vec::with_capacity(state.queue.len());
            let jobs = std::mem::take(&mut state.queue);
            for job in jobs {
                let bucket = state.bucket_mut(&job.backend, now);
                match bucket.try_admit(job.cost, now) {
                    Ok(()) => {
                        debug!(backend = %job.backend, seq = job.seq, "job admitted");
                        let _ = job.grant.send(());
                    }
                    Err(blocked) => {
                        min_wait = Some(match min_wait {
                            Some(w) => w.min(blocked.retry_in),
                            None => blocked.retry_in,
                        });
                        remaining.push(job);
                    }
                }
            }
            queue_remaining = !remaining.is_empty();
            state.queue = remaining;
        }

        if queue_remaining {
            let delay = min_wait.unwrap_or(MIN_TICK).max(MIN_TICK);
            self.schedule_tick(delay);
        }
    }

    /// Arrange a future admission pass, coalescing with any earlier wakeup.
    fn schedule_tick(&self, delay: Duration) {
        let target = Instant::now() + delay;
        {
            let mut state = self.inner.lock().expect("scheduler lock poisoned");
            if state.wake_at.is_some_and(|at| at <= target) {
                return;
            }
            state.wake_at = Some(target);
        }
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(target).await;
            {
                let mut state = this.inner.lock().expect("scheduler lock poisoned");
                if state.wake_at == Some(target) {
                    state.wake_at = None;
                }
            }
            this.tick();
        });
    }
}

impl std::fmt::Debug for AdmissionScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock().expect("scheduler lock poisoned");
        f.debug_struct("AdmissionScheduler")
            .field("queued", &state.queue.len())
            .field("buckets", &state.buckets.keys().collect::<Vec<_>>())
            .finish()
    }
}
