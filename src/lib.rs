//! Request lifecycle and streaming orchestration over interchangeable
//! generative-text backends.
//!
//! This crate sits between a caller surface (a chat UI, a bot, a batch job)
//! and a set of [`Backend`] transports, and owns everything between "the user
//! pressed send" and "the request reached exactly one terminal state":
//! admission control, failover, progress tracking and conversation state.
//!
//! # Architecture
//!
//! - [`AdmissionScheduler`] rate-limits attempts per backend with dual
//!   token buckets (requests/min and tokens/min) plus overload backoff
//! - [`StreamProgressTracker`] turns transport events into a monotonic
//!   phase machine with connect and stall watchdogs
//! - [`ConversationLifecycle`] is the pure state machine for one
//!   conversation turn, observable through a watch channel
//! - [`FailoverExecutor`] ties it together: candidate ordering, the
//!   attempt loop, cancellation and terminal telemetry
//! - [`Backend`] is the trait a concrete provider transport implements
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use genrelay::{
//!     AdmissionScheduler, BackendRegistry, ExecutorConfig, FailoverExecutor,
//!     GenerateParams, GenerationUpdate,
//! };
//!
//! let registry = BackendRegistry::new(vec![openai, anthropic, ollama]);
//! let executor = FailoverExecutor::new(
//!     registry,
//!     AdmissionScheduler::new(),
//!     ExecutorConfig::default(),
//!     "chat",
//! );
//!
//! let mut handle = executor.start_generation(GenerateParams::new(
//!     "openai", "gpt-4o", "What is Rust?",
//! ));
//! while let Some(update) = handle.updates.recv().await {
//!     if let GenerationUpdate::Delta(text) = update {
//!         print!("{text}");
//!     }
//! }
//! ```

pub mod backend;
pub mod bucket;
pub mod config;
pub mod error;
pub mod executor;
pub mod lifecycle;
pub mod progress;
pub mod scheduler;
pub mod types;

pub use backend::{Backend, BackendRegistry};
pub use bucket::{Blocked, BucketSnapshot, BucketStatus, TokenBucket};
pub use config::{default_policy, AdmissionPolicy, ExecutorConfig};
pub use error::{ErrorCategory, GenerateError, Result};
pub use executor::{FailoverExecutor, GenerateParams, GenerationHandle, GenerationUpdate};
pub use lifecycle::{
    reduce, ConversationEvent, ConversationLifecycle, ConversationPhase, ConversationState,
};
pub use progress::{StreamPhase, StreamProgress, StreamProgressTracker};
pub use scheduler::AdmissionScheduler;
pub use types::{
    FinalReason, FinalRecord, Message, OrchestratorEvent, Priority, SamplingOptions,
    TransportEvent, TransportRequest, Usage,
};
