//! Backend descriptors and per-replica live state.
//!
//! A [`Backend`] is one inference server replica reachable at one endpoint,
//! serving exactly one model. The registry holds these slots behind `Arc`;
//! the hot-path counters (`in_flight`, reported load) are atomics, and the
//! colder health bookkeeping (latency window, EMA, probe state) sits behind
//! a short-critical-section mutex so operations on different backends never
//! serialize against each other.

use crate::core::ring::Ring;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

/// Completed-request latency samples kept per backend.
pub const LATENCY_WINDOW: usize = 64;

/// Smoothing factor for the exponentially weighted latency.
pub const EMA_ALPHA: f64 = 0.2;

/// Consecutive failures at which a backend is marked unhealthy.
pub const UNHEALTHY_AFTER: u32 = 3;

pub type BackendId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendState {
    /// Initial state, before the first probe completes. Selectable so cold
    /// traffic can flow during bootstrap.
    Unknown,
    Healthy,
    Unhealthy,
    /// Administratively winding down; excluded from selection.
    Draining,
    /// Decommissioned; the slot is freed once in-flight drains.
    Removed,
}

impl BackendState {
    pub fn is_selectable(self) -> bool {
        matches!(self, BackendState::Unknown | BackendState::Healthy)
    }
}

/// Endpoint-level identity of a replica, as supplied by the cluster
/// collaborator. The id is derived from `(model_name, replica_index)` and is
/// stable across re-registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendDescriptor {
    pub id: BackendId,
    pub model_name: String,
    pub endpoint: String,
}

impl BackendDescriptor {
    pub fn new(model_name: impl Into<String>, replica_index: usize, endpoint: impl Into<String>) -> Self {
        let model_name = model_name.into();
        Self {
            id: format!("{model_name}-{replica_index}"),
            model_name,
            endpoint: endpoint.into(),
        }
    }
}

/// Outcome of one health probe, fed into the state machine.
#[derive(Debug, Clone, Copy)]
pub struct ProbeOutcome {
    pub ok: bool,
    /// Most recent reported GPU utilization; absent leaves load unchanged.
    pub gpu_utilization: Option<f64>,
}

/// What applying a probe changed, so the registry can fan out events.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProbeApplied {
    pub transition: Option<(BackendState, BackendState)>,
    pub load_changed: Option<f64>,
}

#[derive(Debug)]
struct HealthInner {
    state: BackendState,
    latency_window: Ring<f64>,
    ema_latency_ms: f64,
    consecutive_failures: u32,
    last_probe_at: Option<DateTime<Utc>>,
    last_ok_at: Option<DateTime<Utc>>,
}

/// Live per-replica slot.
#[derive(Debug)]
pub struct Backend {
    pub id: BackendId,
    pub model_name: String,
    endpoint: Mutex<String>,
    /// `None` means unbounded.
    pub max_in_flight: Option<u32>,
    in_flight: AtomicUsize,
    /// f64 bit pattern; NaN while no probe has reported a load.
    load_bits: AtomicU64,
    inner: Mutex<HealthInner>,
}

impl Backend {
    pub fn new(descriptor: BackendDescriptor, max_in_flight: Option<u32>) -> Self {
        Self {
            id: descriptor.id,
            model_name: descriptor.model_name,
            endpoint: Mutex::new(descriptor.endpoint),
            max_in_flight,
            in_flight: AtomicUsize::new(0),
            load_bits: AtomicU64::new(f64::NAN.to_bits()),
            inner: Mutex::new(HealthInner {
                state: BackendState::Unknown,
                latency_window: Ring::new(LATENCY_WINDOW),
                ema_latency_ms: f64::NAN,
                consecutive_failures: 0,
                last_probe_at: None,
                last_ok_at: None,
            }),
        }
    }

    pub fn endpoint(&self) -> String {
        self.endpoint.lock().expect("backend lock").clone()
    }

    /// Update endpoint-level fields from a re-registration. Statistics and
    /// in-flight counts are untouched.
    pub fn set_endpoint(&self, endpoint: String) {
        *self.endpoint.lock().expect("backend lock") = endpoint;
    }

    pub fn state(&self) -> BackendState {
        self.inner.lock().expect("backend lock").state
    }

    pub fn set_state(&self, state: BackendState) -> BackendState {
        let mut inner = self.inner.lock().expect("backend lock");
        std::mem::replace(&mut inner.state, state)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn load(&self) -> f64 {
        f64::from_bits(self.load_bits.load(Ordering::Relaxed))
    }

    /// Returns the previous value so callers can decide whether to fan out a
    /// load-changed event.
    pub fn set_load(&self, load: f64) -> f64 {
        f64::from_bits(self.load_bits.swap(load.to_bits(), Ordering::Relaxed))
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().expect("backend lock").consecutive_failures
    }

    pub fn ema_latency_ms(&self) -> f64 {
        self.inner.lock().expect("backend lock").ema_latency_ms
    }

    /// True when a per-backend cap is configured and currently reached.
    pub fn at_capacity(&self) -> bool {
        match self.max_in_flight {
            Some(cap) => self.in_flight() >= cap as usize,
            None => false,
        }
    }

    /// Count a dispatched request. Paired with [`Backend::end_request`].
    pub fn begin_request(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    /// Release an in-flight slot without recording a sample. Used when a
    /// token is dropped before any duration could be measured.
    pub(crate) fn release(&self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    /// Count a completed request: decrement in-flight, fold the duration into
    /// the latency window and EMA, and track the failure streak. Returns a
    /// state transition when an in-band failure streak crosses the unhealthy
    /// threshold.
    pub fn end_request(&self, duration_ms: f64, ok: bool) -> Option<(BackendState, BackendState)> {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);

        let mut inner = self.inner.lock().expect("backend lock");
        inner.latency_window.push(duration_ms);
        inner.ema_latency_ms = if inner.ema_latency_ms.is_nan() {
            duration_ms
        } else {
            EMA_ALPHA * duration_ms + (1.0 - EMA_ALPHA) * inner.ema_latency_ms
        };

        if ok {
            inner.consecutive_failures = 0;
            inner.last_ok_at = Some(Utc::now());
            None
        } else {
            Self::record_failure(&mut inner)
        }
    }

    /// Apply a probe result, reporting what changed.
    pub fn apply_probe(&self, outcome: ProbeOutcome) -> ProbeApplied {
        let mut applied = ProbeApplied::default();
        if let Some(load) = outcome.gpu_utilization {
            let previous = self.set_load(load);
            if previous.is_nan() || (previous - load).abs() > f64::EPSILON {
                applied.load_changed = Some(load);
            }
        }

        let mut inner = self.inner.lock().expect("backend lock");
        inner.last_probe_at = Some(Utc::now());

        applied.transition = if outcome.ok {
            inner.consecutive_failures = 0;
            inner.last_ok_at = Some(Utc::now());
            match inner.state {
                BackendState::Unknown | BackendState::Unhealthy => {
                    let old = inner.state;
                    inner.state = BackendState::Healthy;
                    Some((old, BackendState::Healthy))
                }
                _ => None,
            }
        } else {
            Self::record_failure(&mut inner)
        };
        applied
    }

    fn record_failure(inner: &mut HealthInner) -> Option<(BackendState, BackendState)> {
        inner.consecutive_failures += 1;
        if inner.consecutive_failures >= UNHEALTHY_AFTER
            && matches!(inner.state, BackendState::Unknown | BackendState::Healthy)
        {
            let old = inner.state;
            inner.state = BackendState::Unhealthy;
            Some((old, BackendState::Unhealthy))
        } else {
            None
        }
    }

    pub fn snapshot(&self) -> BackendSnapshot {
        let load = self.load();
        let inner = self.inner.lock().expect("backend lock");
        BackendSnapshot {
            id: self.id.clone(),
            model_name: self.model_name.clone(),
            endpoint: self.endpoint(),
            state: inner.state,
            in_flight: self.in_flight.load(Ordering::Relaxed),
            load: if load.is_nan() { None } else { Some(load) },
            ema_latency_ms: if inner.ema_latency_ms.is_nan() {
                None
            } else {
                Some(inner.ema_latency_ms)
            },
            latency_samples: inner.latency_window.len(),
            consecutive_failures: inner.consecutive_failures,
            last_probe_at: inner.last_probe_at,
            last_ok_at: inner.last_ok_at,
        }
    }
}

/// Immutable point-in-time view of a backend, used by the selection engine
/// and the admin surface. `None` stands in for the NaN sentinels so the JSON
/// form stays clean.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSnapshot {
    pub id: BackendId,
    pub model_name: String,
    pub endpoint: String,
    pub state: BackendState,
    pub in_flight: usize,
    pub load: Option<f64>,
    pub ema_latency_ms: Option<f64>,
    pub latency_samples: usize,
    pub consecutive_failures: u32,
    pub last_probe_at: Option<DateTime<Utc>>,
    pub last_ok_at: Option<DateTime<Utc>>,
}

impl BackendSnapshot {
    /// Load with the NaN sentinel restored, for strategy arithmetic.
    pub fn load_or_nan(&self) -> f64 {
        self.load.unwrap_or(f64::NAN)
    }

    /// EMA latency with NaN restored; strategies treat NaN as +∞.
    pub fn ema_or_nan(&self) -> f64 {
        self.ema_latency_ms.unwrap_or(f64::NAN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> Backend {
        Backend::new(BackendDescriptor::new("llama", 0, "127.0.0.1:9000"), None)
    }

    #[test]
    fn test_descriptor_id_derivation() {
        let d = BackendDescriptor::new("qwen", 2, "127.0.0.1:9102");
        assert_eq!(d.id, "qwen-2");
        assert_eq!(d.model_name, "qwen");
    }

    #[test]
    fn test_initial_state_is_unknown_and_selectable() {
        let b = backend();
        assert_eq!(b.state(), BackendState::Unknown);
        assert!(b.state().is_selectable());
        assert!(b.load().is_nan());
        assert_eq!(b.in_flight(), 0);
    }

    #[test]
    fn test_in_flight_counting() {
        let b = backend();
        b.begin_request();
        b.begin_request();
        assert_eq!(b.in_flight(), 2);
        b.end_request(10.0, true);
        assert_eq!(b.in_flight(), 1);
        b.end_request(20.0, true);
        assert_eq!(b.in_flight(), 0);
    }

    #[test]
    fn test_ema_seeds_with_first_sample() {
        let b = backend();
        b.begin_request();
        b.end_request(100.0, true);
        assert_eq!(b.ema_latency_ms(), 100.0);

        b.begin_request();
        b.end_request(200.0, true);
        // 0.2 * 200 + 0.8 * 100
        assert!((b.ema_latency_ms() - 120.0).abs() < 1e-9);
    }

    #[test]
    fn test_three_probe_failures_mark_unhealthy() {
        let b = backend();
        let fail = ProbeOutcome { ok: false, gpu_utilization: None };
        assert!(b.apply_probe(fail).transition.is_none());
        assert!(b.apply_probe(fail).transition.is_none());
        let applied = b.apply_probe(fail);
        assert_eq!(
            applied.transition,
            Some((BackendState::Unknown, BackendState::Unhealthy))
        );
        assert_eq!(b.state(), BackendState::Unhealthy);
        assert_eq!(b.consecutive_failures(), 3);
    }

    #[test]
    fn test_one_success_recovers_unhealthy() {
        let b = backend();
        let fail = ProbeOutcome { ok: false, gpu_utilization: None };
        for _ in 0..3 {
            b.apply_probe(fail);
        }
        assert_eq!(b.state(), BackendState::Unhealthy);

        let ok = ProbeOutcome { ok: true, gpu_utilization: Some(0.5) };
        let applied = b.apply_probe(ok);
        assert_eq!(
            applied.transition,
            Some((BackendState::Unhealthy, BackendState::Healthy))
        );
        assert_eq!(applied.load_changed, Some(0.5));
        assert_eq!(b.consecutive_failures(), 0);
        assert_eq!(b.load(), 0.5);
    }

    #[test]
    fn test_probe_without_load_leaves_load_unchanged() {
        let b = backend();
        b.set_load(0.7);
        b.apply_probe(ProbeOutcome { ok: true, gpu_utilization: None });
        assert_eq!(b.load(), 0.7);
    }

    #[test]
    fn test_in_band_failures_count_and_transition() {
        let b = backend();
        for _ in 0..3 {
            b.begin_request();
        }
        b.end_request(5.0, false);
        assert_eq!(b.consecutive_failures(), 1);
        b.end_request(5.0, false);
        let transition = b.end_request(5.0, false);
        assert_eq!(transition, Some((BackendState::Unknown, BackendState::Unhealthy)));
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let b = backend();
        b.begin_request();
        b.end_request(5.0, false);
        assert_eq!(b.consecutive_failures(), 1);
        b.begin_request();
        b.end_request(5.0, true);
        assert_eq!(b.consecutive_failures(), 0);
    }

    #[test]
    fn test_at_capacity() {
        let b = Backend::new(BackendDescriptor::new("llama", 0, "127.0.0.1:9000"), Some(1));
        assert!(!b.at_capacity());
        b.begin_request();
        assert!(b.at_capacity());
        b.end_request(1.0, true);
        assert!(!b.at_capacity());
    }

    #[test]
    fn test_snapshot_hides_nan_sentinels() {
        let b = backend();
        let snap = b.snapshot();
        assert!(snap.load.is_none());
        assert!(snap.ema_latency_ms.is_none());
        assert!(snap.load_or_nan().is_nan());
        assert!(snap.ema_or_nan().is_nan());
    }
}
