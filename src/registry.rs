//! Backend registry: the live inventory of replicas.
//!
//! A process-wide mapping from backend id to [`Backend`] slot. Reads
//! (selection, metrics) never block writes beyond one field update: the map
//! is a `DashMap` of `Arc` slots, counters are atomics, and health
//! bookkeeping is a per-backend mutex, so operations on different backends
//! never serialize against each other.
//!
//! Changes fan out over a bounded broadcast channel. Slow consumers lag and
//! lose events; the dashboard reconstructs full state from the snapshot
//! endpoints, so lost events are acceptable.

use crate::backend::{
    Backend, BackendDescriptor, BackendId, BackendSnapshot, BackendState, ProbeOutcome,
};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Bounded fan-out capacity; laggards drop events rather than backpressure
/// registry writers.
pub const EVENT_CAPACITY: usize = 256;

/// Change events consumed by the metrics surface.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Added { id: BackendId, model_name: String },
    Removed { id: BackendId },
    StateChanged {
        id: BackendId,
        from: BackendState,
        to: BackendState,
    },
    LoadChanged { id: BackendId, load: f64 },
}

/// Receipt for one dispatched request. Holds the in-flight increment until
/// [`BackendRegistry::observe_end`] consumes it; dropping the token without
/// ending it releases the slot so the per-backend counter stays balanced
/// even on abandoned paths.
#[derive(Debug)]
pub struct InFlightToken {
    backend: Arc<Backend>,
    finished: bool,
}

impl InFlightToken {
    pub fn backend_id(&self) -> &str {
        &self.backend.id
    }

    pub fn endpoint(&self) -> String {
        self.backend.endpoint()
    }
}

impl Drop for InFlightToken {
    fn drop(&mut self) {
        if !self.finished {
            self.backend.release();
        }
    }
}

pub struct BackendRegistry {
    backends: DashMap<BackendId, Arc<Backend>>,
    events: broadcast::Sender<RegistryEvent>,
    /// Per-backend in-flight cap applied to new slots. `None` is unbounded.
    max_in_flight: Option<u32>,
}

impl BackendRegistry {
    pub fn new(max_in_flight: Option<u32>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            backends: DashMap::new(),
            events,
            max_in_flight,
        }
    }

    /// Insert a replica or update its endpoint-level fields. In-flight counts
    /// and latency statistics survive re-registration; a previously removed
    /// id comes back as `Unknown`.
    pub fn upsert(&self, descriptor: BackendDescriptor) {
        match self.backends.get(&descriptor.id) {
            Some(existing) => {
                existing.set_endpoint(descriptor.endpoint);
                if existing.state() == BackendState::Removed {
                    let old = existing.set_state(BackendState::Unknown);
                    info!(id = %descriptor.id, "backend re-registered");
                    self.emit(RegistryEvent::StateChanged {
                        id: descriptor.id,
                        from: old,
                        to: BackendState::Unknown,
                    });
                }
            }
            None => {
                let id = descriptor.id.clone();
                let model_name = descriptor.model_name.clone();
                let backend = Arc::new(Backend::new(descriptor, self.max_in_flight));
                self.backends.insert(id.clone(), backend);
                info!(id = %id, model = %model_name, "backend registered");
                self.emit(RegistryEvent::Added { id, model_name });
            }
        }
    }

    /// Mark a replica `Removed`. The slot is freed once its in-flight count
    /// drains to zero; it stops being selectable immediately.
    pub fn remove(&self, id: &str) {
        let Some(backend) = self.backends.get(id).map(|b| b.clone()) else {
            return;
        };
        let old = backend.set_state(BackendState::Removed);
        if old != BackendState::Removed {
            info!(id = %id, "backend removed");
            self.emit(RegistryEvent::StateChanged {
                id: id.to_string(),
                from: old,
                to: BackendState::Removed,
            });
        }
        drop(backend);
        self.reap(id);
    }

    pub fn get(&self, id: &str) -> Option<Arc<Backend>> {
        self.backends.get(id).map(|b| b.clone())
    }

    /// Whether any replica (in any state except `Removed`) serves the model.
    /// Distinguishes "unknown model" from "known but unavailable".
    pub fn has_model(&self, model_name: &str) -> bool {
        self.backends.iter().any(|entry| {
            entry.model_name == model_name && entry.state() != BackendState::Removed
        })
    }

    /// Model names with at least one selectable replica, sorted, for the
    /// aggregated `/v1/models` listing.
    pub fn models(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .backends
            .iter()
            .filter(|entry| entry.state().is_selectable())
            .map(|entry| entry.model_name.clone())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Snapshot of currently selectable candidates for one model, sorted by
    /// id so strategies see a stable order. Backends at their in-flight cap
    /// are filtered out for the duration.
    pub fn list_for_model(&self, model_name: &str) -> Vec<BackendSnapshot> {
        let mut candidates: Vec<BackendSnapshot> = self
            .backends
            .iter()
            .filter(|entry| {
                entry.model_name == model_name
                    && entry.state().is_selectable()
                    && !entry.at_capacity()
            })
            .map(|entry| entry.snapshot())
            .collect();
        candidates.sort_by(|a, b| a.id.cmp(&b.id));
        candidates
    }

    /// Full snapshot for the admin surface, sorted by id.
    pub fn snapshot(&self) -> Vec<BackendSnapshot> {
        let mut all: Vec<BackendSnapshot> =
            self.backends.iter().map(|entry| entry.snapshot()).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Outstanding proxied requests across all replicas.
    pub fn total_in_flight(&self) -> usize {
        self.backends.iter().map(|entry| entry.in_flight()).sum()
    }

    /// Atomically count a dispatch against a backend. Returns `None` for ids
    /// that are gone or already removed.
    pub fn observe_start(&self, id: &str) -> Option<InFlightToken> {
        let backend = self.backends.get(id).map(|b| b.clone())?;
        if backend.state() == BackendState::Removed {
            return None;
        }
        backend.begin_request();
        Some(InFlightToken {
            backend,
            finished: false,
        })
    }

    /// Complete a dispatch: decrement in-flight, fold the duration into the
    /// latency window and EMA, and track the failure streak.
    pub fn observe_end(&self, mut token: InFlightToken, duration_ms: f64, ok: bool) {
        token.finished = true;
        let backend = token.backend.clone();
        drop(token);

        if let Some((from, to)) = backend.end_request(duration_ms, ok) {
            warn!(id = %backend.id, ?from, ?to, "backend marked unhealthy from in-band failures");
            self.emit(RegistryEvent::StateChanged {
                id: backend.id.clone(),
                from,
                to,
            });
        }
        if backend.state() == BackendState::Removed {
            self.reap(&backend.id);
        }
    }

    /// Apply a probe result per the health transition rules.
    pub fn apply_probe(&self, id: &str, outcome: ProbeOutcome) {
        let Some(backend) = self.backends.get(id).map(|b| b.clone()) else {
            return;
        };
        let applied = backend.apply_probe(outcome);
        if let Some((from, to)) = applied.transition {
            info!(id = %id, ?from, ?to, "backend health transition");
            self.emit(RegistryEvent::StateChanged {
                id: id.to_string(),
                from,
                to,
            });
        }
        if let Some(load) = applied.load_changed {
            self.emit(RegistryEvent::LoadChanged {
                id: id.to_string(),
                load,
            });
        }
    }

    /// Lazy sequence of change events, in application order. The channel is
    /// bounded; consumers that fall behind observe a `Lagged` error and
    /// should resynchronize from [`BackendRegistry::snapshot`].
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: RegistryEvent) {
        // Send only fails with zero receivers, which is fine.
        let _ = self.events.send(event);
    }

    /// Free a removed slot once nothing is in flight against it.
    fn reap(&self, id: &str) {
        let drained = self
            .backends
            .get(id)
            .map(|b| b.state() == BackendState::Removed && b.in_flight() == 0)
            .unwrap_or(false);
        if drained {
            self.backends.remove(id);
            debug!(id = %id, "backend slot freed");
            self.emit(RegistryEvent::Removed { id: id.to_string() });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with(descriptors: &[(&str, usize, &str)]) -> BackendRegistry {
        let registry = BackendRegistry::new(None);
        for (model, index, endpoint) in descriptors {
            registry.upsert(BackendDescriptor::new(*model, *index, *endpoint));
        }
        registry
    }

    #[test]
    fn test_upsert_and_list() {
        let registry = registry_with(&[
            ("llama", 0, "127.0.0.1:9000"),
            ("llama", 1, "127.0.0.1:9001"),
            ("qwen", 0, "127.0.0.1:9100"),
        ]);

        let llama = registry.list_for_model("llama");
        assert_eq!(llama.len(), 2);
        assert_eq!(llama[0].id, "llama-0");
        assert_eq!(llama[1].id, "llama-1");
        assert_eq!(registry.models(), vec!["llama", "qwen"]);
        assert!(registry.has_model("qwen"));
        assert!(!registry.has_model("mistral"));
    }

    #[test]
    fn test_upsert_preserves_statistics() {
        let registry = registry_with(&[("llama", 0, "127.0.0.1:9000")]);
        let token = registry.observe_start("llama-0").unwrap();
        registry.observe_end(token, 50.0, true);

        registry.upsert(BackendDescriptor::new("llama", 0, "127.0.0.1:9999"));
        let snap = &registry.list_for_model("llama")[0];
        assert_eq!(snap.endpoint, "127.0.0.1:9999");
        assert_eq!(snap.ema_latency_ms, Some(50.0));
        assert_eq!(snap.latency_samples, 1);
    }

    #[test]
    fn test_observe_start_end_balance() {
        let registry = registry_with(&[("llama", 0, "127.0.0.1:9000")]);

        let t1 = registry.observe_start("llama-0").unwrap();
        let t2 = registry.observe_start("llama-0").unwrap();
        assert_eq!(registry.total_in_flight(), 2);

        registry.observe_end(t1, 10.0, true);
        registry.observe_end(t2, 20.0, false);
        assert_eq!(registry.total_in_flight(), 0);

        let snap = &registry.snapshot()[0];
        assert_eq!(snap.consecutive_failures, 1);
    }

    #[test]
    fn test_dropped_token_releases_in_flight() {
        let registry = registry_with(&[("llama", 0, "127.0.0.1:9000")]);
        {
            let _token = registry.observe_start("llama-0").unwrap();
            assert_eq!(registry.total_in_flight(), 1);
        }
        assert_eq!(registry.total_in_flight(), 0);
    }

    #[test]
    fn test_removed_backend_never_selectable() {
        let registry = registry_with(&[("llama", 0, "127.0.0.1:9000")]);
        registry.remove("llama-0");
        assert!(registry.list_for_model("llama").is_empty());
        assert!(registry.observe_start("llama-0").is_none());
        assert!(!registry.has_model("llama"));
    }

    #[test]
    fn test_removed_backend_freed_after_drain() {
        let registry = registry_with(&[("llama", 0, "127.0.0.1:9000")]);
        let token = registry.observe_start("llama-0").unwrap();

        registry.remove("llama-0");
        // Still draining; the slot survives until the request completes.
        assert!(registry.get("llama-0").is_some());

        registry.observe_end(token, 10.0, true);
        assert!(registry.get("llama-0").is_none());
    }

    #[test]
    fn test_capacity_filtering() {
        let registry = BackendRegistry::new(Some(1));
        registry.upsert(BackendDescriptor::new("llama", 0, "127.0.0.1:9000"));

        let _token = registry.observe_start("llama-0").unwrap();
        assert!(registry.list_for_model("llama").is_empty());
    }

    #[tokio::test]
    async fn test_events_emitted_in_application_order() {
        let registry = BackendRegistry::new(None);
        let mut events = registry.subscribe();

        registry.upsert(BackendDescriptor::new("llama", 0, "127.0.0.1:9000"));
        registry.apply_probe(
            "llama-0",
            ProbeOutcome {
                ok: true,
                gpu_utilization: Some(0.4),
            },
        );
        registry.remove("llama-0");

        assert!(matches!(
            events.recv().await.unwrap(),
            RegistryEvent::Added { .. }
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            RegistryEvent::StateChanged {
                to: BackendState::Healthy,
                ..
            }
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            RegistryEvent::LoadChanged { .. }
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            RegistryEvent::StateChanged {
                to: BackendState::Removed,
                ..
            }
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            RegistryEvent::Removed { .. }
        ));
    }
}
