//! The failover executor: one externally observable "generate" operation
//! with a single outcome.
//!
//! [`FailoverExecutor::start_generation`] computes an ordered list of
//! candidate backends, asks the [`AdmissionScheduler`] for each attempt,
//! drives the transport, feeds every event into the
//! [`StreamProgressTracker`] and [`ConversationLifecycle`], and either
//! retries on the next candidate or terminates the request. A request
//! resolves to exactly one of done/failed/aborted, even when cancellation
//! races a success.
//!
//! One executor serves one conversation surface: submissions queue FIFO
//! behind the active request. The scheduler is shared, so other surfaces may
//! have attempts admitted concurrently, bounded per backend.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::Duration;

use rand::Rng;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backend::BackendRegistry;
use crate::config::ExecutorConfig;
use crate::error::{ErrorCategory, GenerateError};
use crate::lifecycle::{ConversationEvent, ConversationLifecycle};
use crate::progress::StreamProgressTracker;
use crate::scheduler::AdmissionScheduler;
use crate::types::{
    FinalReason, FinalRecord, Message, OrchestratorEvent, Priority, SamplingOptions,
    TransportEvent, TransportRequest, Usage,
};

/// Parameters for one generation request.
#[derive(Debug, Clone)]
pub struct GenerateParams {
    /// The backend the caller wants to use first.
    pub backend: String,

    /// The model identifier for the transport.
    pub model: String,

    /// The prompt text for this turn.
    pub prompt: String,

    /// Prior conversation messages sent ahead of the prompt.
    pub history: Vec<Message>,

    /// Sampling configuration.
    pub sampling: SamplingOptions,

    /// Scheduling priority.
    pub priority: Priority,

    /// Estimated token cost for admission (default 1000, floor 100).
    pub estimated_tokens: Option<u32>,
}

impl GenerateParams {
    /// A user-priority request with no history and default sampling.
    pub fn new(
        backend: impl Into<String>,
        model: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            backend: backend.into(),
            model: model.into(),
            prompt: prompt.into(),
            history: Vec::new(),
            sampling: SamplingOptions::default(),
            priority: Priority::User,
            estimated_tokens: None,
        }
    }
}

/// Progress updates streamed to the caller of one generation request.
#[derive(Debug, Clone)]
pub enum GenerationUpdate {
    /// An attempt was admitted and its transport invoked.
    Started {
        /// The backend serving this attempt.
        backend: String,
        /// The attempt number (1-based).
        attempt: u32,
    },

    /// The first byte of the response arrived.
    FirstByte,

    /// A partial text chunk.
    Delta(String),

    /// The request moved to the next candidate backend.
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

    /// The request completed. Terminal.
    Completed {
        /// The accumulated generated text.
        text: String,
        /// Token usage, if the backend reported it.
        usage: Option<Usage>,
    },

    /// The request failed. Terminal.
    Failed {
        /// The final error's classification.
        category: ErrorCategory,
        /// The final error message.
        message: String,
        /// A user-facing notification.
        notice: String,
    },

    /// The request was cancelled. Terminal.
    Aborted {
        /// The cancellation reason (e.g. "cancelled", "idle_timeout").
        reason: String,
        /// A user-facing notification.
        notice: String,
    },
}

/// A live handle to one submitted generation request.
pub struct GenerationHandle {
    /// The request id assigned to this submission.
    pub request_id: u64,

    /// The conversation surface this request belongs to.
    pub group_key: String,

    /// Progress updates, ending with exactly one terminal update.
    pub updates: mpsc::Receiver<GenerationUpdate>,

    cancel: CancellationToken,
    cancel_reason: Arc<OnceLock<String>>,
    outcome: oneshot::Receiver<FinalRecord>,
}

impl GenerationHandle {
    /// Cancel the request with the neutral reason "cancelled".
    pub fn cancel(&self) {
        self.cancel_with("cancelled");
    }

    /// Cancel the request with a specific reason.
    ///
    /// The first cancellation reason wins; a later cancel with a different
    /// reason does not overwrite it.
    pub fn cancel_with(&self, reason: &str) {
        let _ = self.cancel_reason.set(reason.to_owned());
        self.cancel.cancel();
    }

    /// A clone of the cancellation token, usable after the handle is gone.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the terminal telemetry record, consuming the handle.
    ///
    /// Returns `None` only if the executor was torn down before the request
    /// resolved.
    pub async fn final_record(self) -> Option<FinalRecord> {
        self.outcome.await.ok()
    }
}

impl std::fmt::Debug for GenerationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationHandle")
            .field("request_id", &self.request_id)
            .field("group_key", &self.group_key)
            .finish()
    }
}

/// How one request ended, internal to the run loop.
enum Outcome {
    Success {
        text: String,
        usage: Option<Usage>,
    },
    Failed {
        error: GenerateError,
        /// The last mid-stream `error` event detail, surfaced alongside the
        /// attempt's own error message.
        detail: Option<String>,
    },
    Aborted(String),
}

struct ExecutorInner {
    registry: BackendRegistry,
    scheduler: AdmissionScheduler,
    lifecycle: ConversationLifecycle,
    progress: StreamProgressTracker,
    config: ExecutorConfig,
    group_key: String,
    next_request_id: AtomicU64,
    /// The id of the request currently allowed to mutate state; events from
    /// any other id are discarded at the sink.
    active_request: AtomicU64,
    telemetry: broadcast::Sender<OrchestratorEvent>,
    /// FIFO gate: one request at a time for this surface.
    gate: tokio::sync::Mutex<()>,
    /// Parent token; cancelling it tears down the surface (`unmount`).
    shutdown: CancellationToken,
}

/// Orchestrates generation requests for one conversation surface.
#[derive(Clone)]
pub struct FailoverExecutor {
    inner: Arc<ExecutorInner>,
}

impl FailoverExecutor {
    /// Create an executor over the given backends, sharing `scheduler` with
    /// any other surfaces.
    pub fn new(
        registry: BackendRegistry,
        scheduler: AdmissionScheduler,
        config: ExecutorConfig,
        group_key: impl Into<String>,
    ) -> Self {
        let (telemetry, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(ExecutorInner {
                registry,
                scheduler,
                lifecycle: ConversationLifecycle::new(),
                progress: StreamProgressTracker::new(
                    config.connect_timeout,
                    config.stall_timeout,
                ),
                config,
                group_key: group_key.into(),
                next_request_id: AtomicU64::new(0),
                active_request: AtomicU64::new(0),
                telemetry,
                gate: tokio::sync::Mutex::new(()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// The conversation lifecycle state machine for this surface.
    pub fn lifecycle(&self) -> &ConversationLifecycle {
        &self.inner.lifecycle
    }

    /// The stream progress tracker for this surface.
    pub fn progress(&self) -> &StreamProgressTracker {
        &self.inner.progress
    }

    /// The shared admission scheduler.
    pub fn scheduler(&self) -> &AdmissionScheduler {
        &self.inner.scheduler
    }

    /// Subscribe to failover and final telemetry events.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.inner.telemetry.subscribe()
    }

    /// Tear down the surface: the active and any queued requests resolve to
    /// aborted with reason "unmount".
    pub fn unmount(&self) {
        self.inner.shutdown.cancel();
    }

    /// Submit a generation request.
    ///
    /// The request queues behind any active request for this surface and
    /// behind the scheduler's per-backend admission. Must be called from
    /// within a tokio runtime.
    pub fn start_generation(&self, params: GenerateParams) -> GenerationHandle {
        let request_id = self.inner.next_request_id.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = self.inner.shutdown.child_token();
        let cancel_reason: Arc<OnceLock<String>> = Arc::new(OnceLock::new());
        let (updates_tx, updates_rx) = mpsc::channel(64);
        let (outcome_tx, outcome_rx) = oneshot::channel();

        let inner = self.inner.clone();
        let task_cancel = cancel.clone();
        let task_reason = cancel_reason.clone();
        tokio::spawn(async move {
            run(inner, params, request_id, task_cancel, task_reason, updates_tx, outcome_tx)
                .await;
        });

        GenerationHandle {
            request_id,
            group_key: self.inner.group_key.clone(),
            updates: updates_rx,
            cancel,
            cancel_reason,
            outcome: outcome_rx,
        }
    }
}

impl std::fmt::Debug for FailoverExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailoverExecutor")
            .field("group_key", &self.inner.group_key)
            .field("backends", &self.inner.registry.names())
            .finish()
    }
}

/// The per-request driver task.
async fn run(
    inner: Arc<ExecutorInner>,
    params: GenerateParams,
    request_id: u64,
    cancel: CancellationToken,
    reason_slot: Arc<OnceLock<String>>,
    updates: mpsc::Sender<GenerationUpdate>,
    outcome_tx: oneshot::Sender<FinalRecord>,
) {
    // One request at a time per surface; the tokio mutex queues waiters FIFO.
    let _gate = inner.gate.lock().await;
    let started = Instant::now();
    inner.active_request.store(request_id, Ordering::SeqCst);

    inner.lifecycle.apply(&ConversationEvent::Send {
        text: params.prompt.clone(),
    });
    inner.lifecycle.apply(&ConversationEvent::Open { request_id });

    // Outer timers: both resolve to cancellation with a distinct reason.
    let last_activity = Arc::new(StdMutex::new(Instant::now()));
    let idle_watch = {
        let last = last_activity.clone();
        let cancel = cancel.clone();
        let slot = reason_slot.clone();
        let timeout = inner.config.idle_timeout;
        tokio::spawn(async move {
            loop {
                let deadline = { *last.lock().expect("activity lock poisoned") } + timeout;
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep_until(deadline) => {
                        let idle_for =
                            last.lock().expect("activity lock poisoned").elapsed();
                        if idle_for >= timeout {
                            let _ = slot.set("idle_timeout".to_owned());
                            cancel.cancel();
                            return;
                        }
                    }
                }
            }
        })
    };
    let deadline_watch = {
        let cancel = cancel.clone();
        let slot = reason_slot.clone();
        let deadline = inner.config.hard_deadline;
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(deadline) => {
                    let _ = slot.set("deadline".to_owned());
                    cancel.cancel();
                }
            }
        })
    };

    let mut attempts = 0u32;
    let outcome = execute(
        &inner,
        &params,
        request_id,
        &cancel,
        &reason_slot,
        &updates,
        &last_activity,
        &mut attempts,
    )
    .await;

    idle_watch.abort();
    deadline_watch.abort();

    let duration_ms = started.elapsed().as_millis() as u64;
    let record = match outcome {
        Outcome::Success { text, usage } => {
            inner.lifecycle.apply(&ConversationEvent::Done { request_id });
            inner.progress.on_final();
            let _ = updates
                .send(GenerationUpdate::Completed { text, usage })
                .await;
            FinalRecord {
                id: request_id,
                reason: FinalReason::Ok,
                duration_ms,
                attempts,
                http_status: None,
                error_message: None,
            }
        }
        Outcome::Failed { error, detail } => {
            // The last mid-stream error detail often names the real cause
            // (a quota, a content filter) where the transport error only
            // says the connection died.
            let message = match detail {
                Some(detail) => format!("{error} (last stream error: {detail})"),
                None => error.to_string(),
            };
            warn!(request_id, error = %message, attempts, "generation failed");
            inner.lifecycle.apply(&ConversationEvent::Error);
            inner.progress.on_error(message.clone());
            let _ = updates
                .send(GenerationUpdate::Failed {
                    category: error.category(),
                    message: message.clone(),
                    notice: failure_notice(&error),
                })
                .await;
            FinalRecord {
                id: request_id,
                reason: FinalReason::Error,
                duration_ms,
                attempts,
                http_status: error.http_status(),
                error_message: Some(message),
            }
        }
        Outcome::Aborted(reason) => {
            debug!(request_id, reason = %reason, "generation aborted");
            inner.lifecycle.apply(&ConversationEvent::Abort);
            inner.progress.abort(reason.clone());
            let _ = updates
                .send(GenerationUpdate::Aborted {
                    notice: abort_notice(&reason).to_owned(),
                    reason: reason.clone(),
                })
                .await;
            FinalRecord {
                id: request_id,
                reason: FinalReason::Aborted,
                duration_ms,
                attempts,
                http_status: None,
                error_message: Some(reason),
            }
        }
    };

    let _ = inner.telemetry.send(OrchestratorEvent::Final(record.clone()));
    let _ = outcome_tx.send(record);
}

/// The candidate loop: admission, transport, classification, failover.
#[allow(clippy::too_many_arguments)]
async fn execute(
    inner: &Arc<ExecutorInner>,
    params: &GenerateParams,
    request_id: u64,
    cancel: &CancellationToken,
    reason_slot: &Arc<OnceLock<String>>,
    updates: &mpsc::Sender<GenerationUpdate>,
    last_activity: &Arc<StdMutex<Instant>>,
    attempts: &mut u32,
) -> Outcome {
    let candidates = inner.registry.candidate_order(&params.backend);
    if candidates.is_empty() {
        return Outcome::Failed {
            error: GenerateError::Unknown("no backends configured".into()),
            detail: None,
        };
    }

    let mut messages = params.history.clone();
    messages.push(Message::user(params.prompt.clone()));
    let request = TransportRequest {
        request_id,
        model: params.model.clone(),
        messages,
        sampling: params.sampling.clone(),
    };

    let mut accumulated = String::new();
    let mut usage: Option<Usage> = None;
    let mut last_detail: Option<String> = None;

    let total = candidates.len();
    for (idx, backend) in candidates.iter().enumerate() {
        *attempts += 1;

        // Admission may delay the attempt; stay cancellable while waiting.
        let admitted = inner
            .scheduler
            .admit(backend.name(), params.estimated_tokens, params.priority);
        tokio::select! {
            _ = cancel.cancelled() => {
                return Outcome::Aborted(abort_reason(reason_slot, None));
            }
            _ = admitted => {}
        }

        inner.progress.on_start();
        let _ = updates
            .send(GenerationUpdate::Started {
                backend: backend.name().to_owned(),
                attempt: *attempts,
            })
            .await;
        debug!(
            request_id,
            backend = %backend.name(),
            attempt = *attempts,
            "attempt admitted, opening transport"
        );

        let (events_tx, mut events_rx) = mpsc::channel::<TransportEvent>(64);
        let stream_fut = backend.stream(&request, events_tx, cancel.child_token());
        tokio::pin!(stream_fut);

        let result = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    break Err(GenerateError::aborted(abort_reason(reason_slot, None)));
                }
                res = &mut stream_fut => {
                    // Transport returned; the sink sender is dropped, so
                    // drain whatever it buffered before deciding.
                    while let Ok(event) = events_rx.try_recv() {
                        apply_event(
                            inner, request_id, event, &mut accumulated, &mut usage,
                            &mut last_detail, updates, last_activity,
                        )
                        .await;
                    }
                    break res;
                }
                Some(event) = events_rx.recv() => {
                    apply_event(
                        inner, request_id, event, &mut accumulated, &mut usage,
                        &mut last_detail, updates, last_activity,
                    )
                    .await;
                }
            }
        };

        match result {
            Ok(()) => {
                inner.scheduler.report_outcome(backend.name(), Ok(()));
                return Outcome::Success {
                    text: accumulated,
                    usage,
                };
            }
            Err(err) => {
                inner.scheduler.report_outcome(backend.name(), Err(&err));
                let category = err.category();
                match category {
                    ErrorCategory::Abort => {
                        return Outcome::Aborted(abort_reason(reason_slot, Some(&err)));
                    }
                    ErrorCategory::Auth | ErrorCategory::Unknown => {
                        return Outcome::Failed {
                            error: err,
                            detail: last_detail.take(),
                        };
                    }
                    ErrorCategory::Transient
                    | ErrorCategory::RateLimit
                    | ErrorCategory::Server
                    | ErrorCategory::Network => {
                        if idx + 1 >= total {
                            return Outcome::Failed {
                                error: err,
                                detail: last_detail.take(),
                            };
                        }
                        let next = candidates[idx + 1].name().to_owned();
                        warn!(
                            request_id,
                            from = %backend.name(),
                            to = %next,
                            reason = %category,
                            attempt = *attempts,
                            error = %err,
                            "attempt failed, failing over"
                        );
                        let _ = inner.telemetry.send(OrchestratorEvent::Failover {
                            from: backend.name().to_owned(),
                            to: next.clone(),
                            reason: category,
                            attempt: *attempts,
                        });
                        let _ = updates
                            .send(GenerationUpdate::Failover {
                                from: backend.name().to_owned(),
                                to: next,
                                reason: category,
                                attempt: *attempts,
                            })
                            .await;

                        // Small jitter so synchronized failures don't stampede
                        // the next backend.
                        let jitter =
                            Duration::from_millis(rand::thread_rng().gen_range(120..=280));
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                return Outcome::Aborted(abort_reason(reason_slot, None));
                            }
                            _ = tokio::time::sleep(jitter) => {}
                        }
                    }
                }
            }
        }
    }

    // Unreachable: the loop always returns on the last candidate.
    Outcome::Failed {
        error: GenerateError::Unknown("candidate loop exhausted".into()),
        detail: None,
    }
}

/// Forward one transport event into the trackers, the accumulator and the
/// caller's update stream. Events from a superseded request id are dropped.
#[allow(clippy::too_many_arguments)]
async fn apply_event(
    inner: &Arc<ExecutorInner>,
    request_id: u64,
    event: TransportEvent,
    accumulated: &mut String,
    usage: &mut Option<Usage>,
    last_detail: &mut Option<String>,
    updates: &mpsc::Sender<GenerationUpdate>,
    last_activity: &Arc<StdMutex<Instant>>,
) {
    if inner.active_request.load(Ordering::SeqCst) != request_id {
        debug!(request_id, "dropping event from superseded request");
        return;
    }

    match event {
        TransportEvent::Start => {
            debug!(request_id, "transport dispatched");
        }
        TransportEvent::Handshake => {
            inner.progress.on_connect();
        }
        TransportEvent::FirstByte => {
            inner.progress.on_first_byte();
            touch(last_activity);
            let _ = updates.send(GenerationUpdate::FirstByte).await;
        }
        TransportEvent::Delta(text) => {
            inner.progress.on_delta();
            inner
                .lifecycle
                .apply(&ConversationEvent::Delta { request_id });
            accumulated.push_str(&text);
            touch(last_activity);
            let _ = updates.send(GenerationUpdate::Delta(text)).await;
        }
        TransportEvent::Usage(u) => {
            *usage = Some(u);
        }
        TransportEvent::Error(detail) => {
            *last_detail = Some(detail);
        }
    }
}

fn touch(last_activity: &StdMutex<Instant>) {
    *last_activity.lock().expect("activity lock poisoned") = Instant::now();
}

/// Resolve the abort reason: an explicit cancel reason wins, then a reason
/// carried by the transport's own abort error, then "unmount" (the only path
/// that cancels without recording a reason).
fn abort_reason(slot: &OnceLock<String>, err: Option<&GenerateError>) -> String {
    if let Some(reason) = slot.get() {
        return reason.clone();
    }
    if let Some(GenerateError::Aborted { reason }) = err {
        return reason.clone();
    }
    "unmount".to_owned()
}

/// The user-facing notification for an abort reason.
fn abort_notice(reason: &str) -> &'static str {
    match reason {
        "idle_timeout" => "no response (timed out)",
        "deadline" => "exceeded time limit",
        _ => "generation cancelled",
    }
}

/// The user-facing notification for a terminal failure. Fatal credential
/// problems get a specific message; everything else stays generic.
fn failure_notice(err: &GenerateError) -> String {
    match err {
        GenerateError::Auth(detail) => format!("credential problem: {detail}"),
        _ => "generation failed".to_owned(),
    }
}
