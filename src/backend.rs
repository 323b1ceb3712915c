//! The backend transport contract and the registry that orders candidates
//! for failover.
//!
//! A [`Backend`] wraps one interchangeable generative-text provider. The
//! orchestrator never sees wire formats: it hands the backend a
//! [`TransportRequest`], an event sink and a cancellation token, and consumes
//! the tagged [`TransportEvent`]s the backend emits.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::types::{TransportEvent, TransportRequest};

/// One generation backend the orchestrator can target.
///
/// Implementations handle protocol details for a specific provider. The
/// `stream` call must emit events through `events` in arrival order and stop
/// promptly when `cancel` fires; its return value decides the attempt's
/// outcome.
#[async_trait]
pub trait Backend: Send + Sync {
    /// The backend identity (e.g. "openai", "anthropic", "ollama").
    fn name(&self) -> &str;

    /// Whether a usable credential is present for this backend.
    fn has_credentials(&self) -> bool {
        true
    }

    /// Local backends need no credential and are ordered last among the
    /// failover candidates.
    fn is_local(&self) -> bool {
        false
    }

    /// Drive one streaming generation attempt.
    ///
    /// # Errors
    ///
    /// Returns a [`GenerateError`](crate::error::GenerateError) classified
    /// into the failover taxonomy; the executor decides from its category
    /// whether to retry on another backend.
    async fn stream(
        &self,
        request: &TransportRequest,
        events: mpsc::Sender<TransportEvent>,
        cancel: CancellationToken,
    ) -> Result<()>;
}

/// Holds the configured backends in their fixed default order and computes
/// the candidate order for a request.
pub struct BackendRegistry {
    backends: Vec<Arc<dyn Backend>>,
}

impl BackendRegistry {
    /// Create a registry. The argument order is the fixed default failover
    /// order.
    pub fn new(backends: Vec<Arc<dyn Backend>>) -> Self {
        Self { backends }
    }

    /// Look up a backend by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Backend>> {
        self.backends.iter().find(|b| b.name() == name).cloned()
    }

    /// The names of all registered backends, in default order.
    pub fn names(&self) -> Vec<&str> {
        self.backends.iter().map(|b| b.name()).collect()
    }

    /// Compute the ordered candidate list for a request.
    ///
    /// The requested backend comes first (even without credentials, so the
    /// failure surfaces as a specific auth error). The remaining backends
    /// follow in default order, filtered to those with usable credentials;
    /// local backends are always eligible and ordered last among equals.
    pub fn candidate_order(&self, requested: &str) -> Vec<Arc<dyn Backend>> {
        let mut candidates: Vec<Arc<dyn Backend>> = Vec::new();
        if let Some(backend) = self.get(requested) {
            candidates.push(backend);
        }

        let mut rest: Vec<Arc<dyn Backend>> = self
            .backends
            .iter()
            .filter(|b| b.name() != requested && (b.has_credentials() || b.is_local()))
            .cloned()
            .collect();
        // Stable: preserves default order within the local and non-local
        // groups.
        rest.sort_by_key(|b| b.is_local());
        candidates.extend(rest);
        candidates
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubBackend {
        name: &'static str,
        credentialed: bool,
        local: bool,
    }

    #[async_trait]
    impl Backend for StubBackend {
        fn name(&self) -> &str {
            self.name
        }
        fn has_credentials(&self) -> bool {
            self.credentialed
        }
        fn is_local(&self) -> bool {
            self.local
        }
        async fn stream(
            &self,
            _request: &TransportRequest,
            _events: mpsc::Sender<TransportEvent>,
            _cancel: CancellationToken,
        ) -> Result<()> {
            Ok(())
        }
    }

    fn stub(name: &'static str, credentialed: bool, local: bool) -> Arc<dyn Backend> {
        Arc::new(StubBackend {
            name,
            credentialed,
            local,
        })
    }

    fn registry() -> BackendRegistry {
        BackendRegistry::new(vec![
            stub("openai", true, false),
            stub("anthropic", true, false),
            stub("ollama", false, true),
            stub("groq", false, false),
        ])
    }

    #[test]
    fn requested_backend_first() {
        let order = registry().candidate_order("anthropic");
        let names: Vec<&str> = order.iter().map(|b| b.name()).collect();
        assert_eq!(names, vec!["anthropic", "openai", "ollama"]);
    }

    #[test]
    fn uncredentialed_backends_filtered_from_fallbacks() {
        let order = registry().candidate_order("openai");
        let names: Vec<&str> = order.iter().map(|b| b.name()).collect();
        // groq has no credentials and is not local: excluded.
        assert_eq!(names, vec!["openai", "anthropic", "ollama"]);
    }

    #[test]
    fn local_backend_ordered_last() {
        let reg = BackendRegistry::new(vec![
            stub("ollama", false, true),
            stub("openai", true, false),
        ]);
        let order = reg.candidate_order("openai");
        let names: Vec<&str> = order.iter().map(|b| b.name()).collect();
        assert_eq!(names, vec!["openai", "ollama"]);
    }

    #[test]
    fn requested_without_credentials_still_first() {
        // The attempt will fail with a specific auth error rather than
        // silently skipping the user's chosen backend.
        let order = registry().candidate_order("groq");
        let names: Vec<&str> = order.iter().map(|b| b.name()).collect();
        assert_eq!(names, vec!["groq", "openai", "anthropic", "ollama"]);
    }

    #[test]
    fn unknown_requested_backend_falls_back_to_defaults() {
        let order = registry().candidate_order("nonexistent");
        let names: Vec<&str> = order.iter().map(|b| b.name()).collect();
        assert_eq!(names, vec!["openai", "anthropic", "ollama"]);
    }

    #[test]
    fn get_and_names() {
        let reg = registry();
        assert_eq!(reg.get("openai").unwrap().name(), "openai");
        assert!(reg.get("nope").is_none());
        assert_eq!(reg.names(), vec!["openai", "anthropic", "ollama", "groq"]);
    }
}
