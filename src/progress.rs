//! Transport progress tracking for one active attempt.
//!
//! [`StreamProgressTracker`] turns low-level transport events into a
//! monotonic [`StreamPhase`] plus two watchdog timers, so a hung connection
//! or a silently-stalled stream is detected the same way a hard error would
//! be. It is a pure progress tracker: it records what it is told and enforces
//! the timers, but makes no retry or failover decisions.
//!
//! Non-terminal phases are totally ordered; a transition is accepted only if
//! it moves strictly forward. Transitions to a terminal phase are always
//! accepted.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

/// The phase of one transport attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    /// No attempt in progress.
    Idle,
    /// The transport is connecting.
    Connecting,
    /// The connection handshake completed.
    Handshake,
    /// The first byte of the response arrived.
    FirstByte,
    /// Deltas are flowing.
    Streaming,
    /// The attempt finished successfully. Terminal.
    Completed,
    /// The attempt failed. Terminal.
    Error,
    /// The attempt was cancelled. Terminal.
    Aborted,
}

impl StreamPhase {
    /// Whether this phase is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Aborted)
    }

    /// Position in the non-terminal order. Terminal phases have no rank.
    fn rank(self) -> Option<u8> {
        match self {
            Self::Idle => Some(0),
            Self::Connecting => Some(1),
            Self::Handshake => Some(2),
            Self::FirstByte => Some(3),
            Self::Streaming => Some(4),
            Self::Completed | Self::Error | Self::Aborted => None,
        }
    }
}

/// The observable progress state: a phase plus a reason for terminal phases.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamProgress {
    /// The current phase.
    pub phase: StreamPhase,
    /// Why a terminal phase was entered (e.g. "connect_timeout").
    pub reason: Option<String>,
}

impl StreamProgress {
    fn idle() -> Self {
        Self {
            phase: StreamPhase::Idle,
            reason: None,
        }
    }
}

struct Timers {
    connect: Option<JoinHandle<()>>,
    stall: Option<JoinHandle<()>>,
    /// Bumped on every arm/cancel; an expiry only acts if its epoch is still
    /// current, so a late timer from a superseded attempt is a no-op.
    epoch: u64,
}

struct TrackerInner {
    tx: watch::Sender<StreamProgress>,
    timers: Mutex<Timers>,
    connect_timeout: Duration,
    stall_timeout: Duration,
}

impl TrackerInner {
    fn set_terminal(&self, phase: StreamPhase, reason: Option<String>) {
        debug_assert!(phase.is_terminal());
        self.tx.send_replace(StreamProgress { phase, reason });
    }

    fn expire(self: &Arc<Self>, epoch: u64, reason: &str) {
        // The lock is held across the send so a concurrent epoch bump
        // (on_final, reset, a fresh arm) cannot slip in between the check
        // and the terminal write.
        let timers = self.timers.lock().expect("progress timer lock poisoned");
        if timers.epoch != epoch {
            return;
        }
        tracing::warn!(reason, "stream watchdog expired");
        self.set_terminal(StreamPhase::Error, Some(reason.to_owned()));
        drop(timers);
    }
}

/// Tracks the transport progress of one active attempt.
///
/// Cloning is cheap; clones share the same state and timers.
#[derive(Clone)]
pub struct StreamProgressTracker {
    inner: Arc<TrackerInner>,
}

impl StreamProgressTracker {
    /// Create a tracker with the given watchdog timeouts.
    pub fn new(connect_timeout: Duration, stall_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                tx: watch::Sender::new(StreamProgress::idle()),
                timers: Mutex::new(Timers {
                    connect: None,
                    stall: None,
                    epoch: 0,
                }),
                connect_timeout,
                stall_timeout,
            }),
        }
    }

    /// A new attempt is starting: reset to `Connecting` and arm the connect
    /// watchdog. Any previous timers are cancelled.
    pub fn on_start(&self) {
        self.cancel_timers();
        self.inner.tx.send_replace(StreamProgress {
            phase: StreamPhase::Connecting,
            reason: None,
        });
        self.arm_connect();
    }

    /// The transport handshake completed: advance to `Handshake`, cancel the
    /// connect watchdog and arm the stall watchdog.
    pub fn on_connect(&self) {
        self.advance(StreamPhase::Handshake);
        self.arm_stall();
    }

    /// The first byte arrived: advance and re-arm the stall watchdog.
    pub fn on_first_byte(&self) {
        self.advance(StreamPhase::FirstByte);
        self.arm_stall();
    }

    /// A chunk arrived: advance to `Streaming` and re-arm the stall watchdog.
    /// Every chunk resets the watchdog, which is how silent mid-stream stalls
    /// are distinguished from slow-but-alive streams.
    pub fn on_delta(&self) {
        self.advance(StreamPhase::Streaming);
        self.arm_stall();
    }

    /// The attempt finished: cancel timers, phase `Completed`.
    pub fn on_final(&self) {
        self.cancel_timers();
        self.inner.set_terminal(StreamPhase::Completed, None);
    }

    /// The attempt failed: cancel timers, phase `Error` with the reason.
    pub fn on_error(&self, reason: impl Into<String>) {
        self.cancel_timers();
        self.inner
            .set_terminal(StreamPhase::Error, Some(reason.into()));
    }

    /// The attempt was cancelled: cancel timers, phase `Aborted`.
    pub fn abort(&self, why: impl Into<String>) {
        self.cancel_timers();
        self.inner.set_terminal(StreamPhase::Aborted, Some(why.into()));
    }

    /// Return to `Idle`, clearing the reason and timers.
    pub fn reset(&self) {
        self.cancel_timers();
        self.inner.tx.send_replace(StreamProgress::idle());
    }

    /// A snapshot of the current progress.
    pub fn current(&self) -> StreamProgress {
        self.inner.tx.borrow().clone()
    }

    /// Subscribe to progress transitions.
    pub fn subscribe(&self) -> watch::Receiver<StreamProgress> {
        self.inner.tx.subscribe()
    }

    /// Apply the monotonic-or-terminal transition rule for a non-terminal
    /// target phase. Regressions are silently rejected.
    fn advance(&self, next: StreamPhase) {
        self.inner.tx.send_if_modified(|current| {
            let accept = match (current.phase.rank(), next.rank()) {
                (Some(cur), Some(nxt)) => nxt > cur,
                // Current phase terminal: only another terminal may follow,
                // and those go through set_terminal.
                _ => false,
            };
            if accept {
                current.phase = next;
            }
            accept
        });
    }

    fn arm_connect(&self) {
        let mut timers = self
            .inner
            .timers
            .lock()
            .expect("progress timer lock poisoned");
        timers.epoch += 1;
        let epoch = timers.epoch;
        if let Some(handle) = timers.connect.take() {
            handle.abort();
        }
        if let Some(handle) = timers.stall.take() {
            handle.abort();
        }
        let inner = self.inner.clone();
        timers.connect = Some(tokio::spawn(async move {
            tokio::time::sleep(inner.connect_timeout).await;
            inner.expire(epoch, "connect_timeout");
        }));
    }

    fn arm_stall(&self) {
        let mut timers = self
            .inner
            .timers
            .lock()
            .expect("progress timer lock poisoned");
        timers.epoch += 1;
        let epoch = timers.epoch;
        if let Some(handle) = timers.connect.take() {
            handle.abort();
        }
        if let Some(handle) = timers.stall.take() {
            handle.abort();
        }
        let inner = self.inner.clone();
        timers.stall = Some(tokio::spawn(async move {
            tokio::time::sleep(inner.stall_timeout).await;
            inner.expire(epoch, "stall_timeout");
        }));
    }

    fn cancel_timers(&self) {
        let mut timers = self
            .inner
            .timers
            .lock()
            .expect("progress timer lock poisoned");
        timers.epoch += 1;
        if let Some(handle) = timers.connect.take() {
            handle.abort();
        }
        if let Some(handle) = timers.stall.take() {
            handle.abort();
        }
    }
}

impl Default for StreamProgressTracker {
    fn default() -> Self {
        Self::new(Duration::from_secs(15), Duration::from_secs(20))
    }
}

impl std::fmt::Debug for StreamProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamProgressTracker")
            .field("current", &self.current())
            .finish()
    }
}
