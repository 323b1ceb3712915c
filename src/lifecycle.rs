//! Conversation-turn state machine, independent of transport details.
//!
//! [`reduce`] is a pure function over five event kinds; the
//! [`ConversationLifecycle`] wrapper owns the current state and publishes
//! every transition through a `watch` channel so multiple surfaces can
//! observe one conversation without shared mutable access.
//!
//! The request-id guard on `Delta`/`Done` is the key invariant: events from
//! a superseded attempt are silently dropped rather than corrupting the
//! visible conversation state.

use tokio::sync::watch;
use tokio::time::Instant;

/// The coarse state of one conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationPhase {
    /// No turn in progress.
    Idle,
    /// A prompt has been submitted; no stream is open yet.
    Sending,
    /// A stream is open and deltas may arrive.
    Streaming,
}

/// The full conversation state, replaced wholesale on every transition.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationState {
    /// The coarse phase.
    pub phase: ConversationPhase,

    /// The active request id, used to discard stale events.
    pub request_id: Option<u64>,

    /// The submitted prompt text, trimmed.
    pub pending_text: String,

    /// When the last event for this turn was observed.
    pub last_activity: Option<Instant>,
}

impl ConversationState {
    /// The empty idle state.
    pub fn idle() -> Self {
        Self {
            phase: ConversationPhase::Idle,
            request_id: None,
            pending_text: String::new(),
            last_activity: None,
        }
    }
}

/// Events driving the conversation state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum ConversationEvent {
    /// A prompt was submitted.
    Send {
        /// The prompt text.
        text: String,
    },
    /// A stream was opened for the given request id.
    Open {
        /// The freshly assigned request id.
        request_id: u64,
    },
    /// A text chunk arrived for the given request id.
    Delta {
        /// The id of the request the chunk belongs to.
        request_id: u64,
    },
    /// The stream for the given request id completed.
    Done {
        /// The id of the completed request.
        request_id: u64,
    },
    /// The turn failed.
    Error,
    /// The turn was cancelled.
    Abort,
}

/// Apply one event to a conversation state, returning the next state.
///
/// Unlisted event/state combinations are no-ops: the input state is returned
/// unchanged. `Delta` and `Done` are ignored unless their request id matches
/// the active one.
pub fn reduce(
    state: &ConversationState,
    event: &ConversationEvent,
    now: Instant,
) -> ConversationState {
    match (state.phase, event) {
        (ConversationPhase::Idle, ConversationEvent::Send { text }) => ConversationState {
            phase: ConversationPhase::Sending,
            request_id: None,
            pending_text: text.trim().to_owned(),
            last_activity: Some(now),
        },
        (ConversationPhase::Sending, ConversationEvent::Open { request_id }) => {
            ConversationState {
                phase: ConversationPhase::Streaming,
                request_id: Some(*request_id),
                pending_text: state.pending_text.clone(),
                last_activity: Some(now),
            }
        }
        (ConversationPhase::Streaming, ConversationEvent::Delta { request_id })
            if state.request_id == Some(*request_id) =>
        {
            ConversationState {
                last_activity: Some(now),
                ..state.clone()
            }
        }
        (ConversationPhase::Streaming, ConversationEvent::Done { request_id })
            if state.request_id == Some(*request_id) =>
        {
            ConversationState::idle()
        }
        (
            ConversationPhase::Sending | ConversationPhase::Streaming,
            ConversationEvent::Error | ConversationEvent::Abort,
        ) => ConversationState::idle(),
        _ => state.clone(),
    }
}

/// Owns the conversation state for one surface and broadcasts transitions.
#[derive(Debug)]
pub struct ConversationLifecycle {
    tx: watch::Sender<ConversationState>,
}

impl Default for ConversationLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationLifecycle {
    /// Create a lifecycle starting in the idle state.
    pub fn new() -> Self {
        Self {
            tx: watch::Sender::new(ConversationState::idle()),
        }
    }

    /// Apply an event, replacing the state wholesale.
    pub fn apply(&self, event: &ConversationEvent) {
        let now = Instant::now();
        self.tx.send_modify(|state| *state = reduce(state, event, now));
    }

    /// A snapshot of the current state.
    pub fn current(&self) -> ConversationState {
        self.tx.borrow().clone()
    }

    /// Subscribe to state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ConversationState> {
        self.tx.subscribe()
    }
}
