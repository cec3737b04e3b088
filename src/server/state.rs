//! Shared application state passed to all HTTP handlers.
//!
//! Everything is explicitly constructed here and handed to the router; there
//! is no ambient process-wide state, so tests instantiate an [`AppState`]
//! directly and seed its registry however they like.

use crate::config::Config;
use crate::core::http_client::HttpClientBuilder;
use crate::registry::BackendRegistry;
use crate::selection::SelectionEngine;
use crate::session::SessionStore;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

/// Hot-path counters that belong to the proxy itself rather than to any
/// backend: requests accepted but not yet connected upstream, and the total
/// number of failover retries.
#[derive(Debug, Default)]
pub struct ProxyStats {
    pending: AtomicI64,
    retries_total: AtomicU64,
}

impl ProxyStats {
    pub fn pending(&self) -> i64 {
        self.pending.load(Ordering::Relaxed).max(0)
    }

    pub fn retries_total(&self) -> u64 {
        self.retries_total.load(Ordering::Relaxed)
    }

    /// Count a request entering the pre-connect phase. The guard releases
    /// the slot when dropped, on connect or on any early exit.
    pub fn begin_pending(self: &Arc<Self>) -> PendingGuard {
        self.pending.fetch_add(1, Ordering::Relaxed);
        PendingGuard {
            stats: Arc::clone(self),
        }
    }

    pub fn record_retry(&self) {
        self.retries_total.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct PendingGuard {
    stats: Arc<ProxyStats>,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.stats.pending.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Shared state behind every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<BackendRegistry>,
    pub engine: Arc<SelectionEngine>,
    pub store: Arc<SessionStore>,
    pub stats: Arc<ProxyStats>,
    /// Passthrough client for relaying completions upstream.
    pub upstream: reqwest::Client,
}

impl AppState {
    /// Build state from configuration. The registry starts empty; callers
    /// seed it from `Config::endpoints` (or at runtime via the cluster
    /// collaborator).
    pub fn new(config: Config) -> Self {
        let upstream = HttpClientBuilder::passthrough(&config.proxy)
            .build()
            .unwrap_or_else(|_| {
                HttpClientBuilder::new()
                    .build()
                    .expect("default HTTP client")
            });
        let registry = Arc::new(BackendRegistry::new(config.proxy.max_in_flight));
        let engine = Arc::new(SelectionEngine::new(config.proxy.strategy.clone()));

        Self {
            config: Arc::new(config),
            registry,
            engine,
            store: Arc::new(SessionStore::new()),
            stats: Arc::new(ProxyStats::default()),
            upstream,
        }
    }

    /// State with the registry pre-populated from the configured models.
    pub fn with_seeded_registry(config: Config) -> Self {
        let state = Self::new(config);
        for descriptor in state.config.endpoints() {
            state.registry.upsert(descriptor);
        }
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_creation() {
        let state = AppState::new(Config::for_test());
        assert!(state.registry.snapshot().is_empty());
        assert_eq!(state.stats.pending(), 0);
    }

    #[test]
    fn test_seeded_registry_matches_config() {
        let mut config = Config::for_test();
        config.models[0].replicas = 3;
        let state = AppState::with_seeded_registry(config);
        assert_eq!(state.registry.snapshot().len(), 3);
        assert!(state.registry.has_model("llama"));
    }

    #[test]
    fn test_pending_guard_releases_on_drop() {
        let stats = Arc::new(ProxyStats::default());
        {
            let _guard = stats.begin_pending();
            assert_eq!(stats.pending(), 1);
        }
        assert_eq!(stats.pending(), 0);
    }
}
