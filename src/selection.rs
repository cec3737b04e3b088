//! Selection engine: maps an inbound request to a backend replica.
//!
//! The four strategies are variants of one [`Strategy`] enum with a single
//! [`SelectionEngine::select`] operation. Selection is a pure function of
//! the candidate snapshot plus the engine's per-model round-robin counters:
//! identical inputs always produce identical choices, and ties always break
//! toward the lowest id. Selection never mutates the registry; the in-flight
//! increment happens in the forwarder via `observe_start`.

use crate::backend::BackendSnapshot;
use dashmap::DashMap;
use serde::de::{self, Deserializer};
use serde::Deserialize;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Guard against division by zero when normalizing composite terms.
const NORMALIZE_EPSILON: f64 = 1e-9;

const DEFAULT_LOAD_WEIGHT: f64 = 0.6;
const DEFAULT_IN_FLIGHT_WEIGHT: f64 = 0.3;
const DEFAULT_LATENCY_WEIGHT: f64 = 0.1;

/// Routing strategy. Deserializes from a bare name (`strategy: round_robin`)
/// or a tagged map carrying per-strategy knobs; unknown names are rejected
/// at configuration load.
#[derive(Debug, Clone, PartialEq)]
pub enum Strategy {
    /// Per-model monotonic counter over the candidate list sorted by id.
    RoundRobin,
    /// Fewest outstanding requests; ties by EMA latency, then id.
    LeastConnections,
    /// Lowest EMA latency (unknown treated as +∞); ties by in-flight, then id.
    LeastLatency,
    /// Weighted composite of load, in-flight, and EMA latency.
    LeastLoad {
        load_weight: f64,
        in_flight_weight: f64,
        latency_weight: f64,
    },
}

impl Default for Strategy {
    fn default() -> Self {
        Strategy::RoundRobin
    }
}

impl Strategy {
    pub fn name(&self) -> &'static str {
        match self {
            Strategy::RoundRobin => "round_robin",
            Strategy::LeastConnections => "least_connections",
            Strategy::LeastLatency => "least_latency",
            Strategy::LeastLoad { .. } => "least_load",
        }
    }

    pub fn from_name(name: &str) -> Result<Self, String> {
        match name {
            "round_robin" => Ok(Strategy::RoundRobin),
            "least_connections" => Ok(Strategy::LeastConnections),
            "least_latency" => Ok(Strategy::LeastLatency),
            "least_load" => Ok(Strategy::LeastLoad {
                load_weight: DEFAULT_LOAD_WEIGHT,
                in_flight_weight: DEFAULT_IN_FLIGHT_WEIGHT,
                latency_weight: DEFAULT_LATENCY_WEIGHT,
            }),
            other => Err(format!(
                "unknown strategy '{other}'; valid options are: round_robin, least_connections, least_latency, least_load"
            )),
        }
    }
}

impl<'de> Deserialize<'de> for Strategy {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(tag = "kind", rename_all = "snake_case")]
        enum Tagged {
            RoundRobin,
            LeastConnections,
            LeastLatency,
            LeastLoad {
                #[serde(default = "default_load_weight")]
                load_weight: f64,
                #[serde(default = "default_in_flight_weight")]
                in_flight_weight: f64,
                #[serde(default = "default_latency_weight")]
                latency_weight: f64,
            },
        }

        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Name(String),
            Tagged(Tagged),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Name(name) => Strategy::from_name(&name).map_err(de::Error::custom),
            Repr::Tagged(Tagged::RoundRobin) => Ok(Strategy::RoundRobin),
            Repr::Tagged(Tagged::LeastConnections) => Ok(Strategy::LeastConnections),
            Repr::Tagged(Tagged::LeastLatency) => Ok(Strategy::LeastLatency),
            Repr::Tagged(Tagged::LeastLoad {
                load_weight,
                in_flight_weight,
                latency_weight,
            }) => Ok(Strategy::LeastLoad {
                load_weight,
                in_flight_weight,
                latency_weight,
            }),
        }
    }
}

fn default_load_weight() -> f64 {
    DEFAULT_LOAD_WEIGHT
}
fn default_in_flight_weight() -> f64 {
    DEFAULT_IN_FLIGHT_WEIGHT
}
fn default_latency_weight() -> f64 {
    DEFAULT_LATENCY_WEIGHT
}

/// Routing hints accompanying one selection call. The session id is captured
/// for a future affinity strategy; no current strategy consults it.
#[derive(Debug, Clone, Copy, Default)]
pub struct SelectionContext<'a> {
    pub session_id: Option<&'a str>,
}

/// Strategy plus the per-model round-robin cursors.
pub struct SelectionEngine {
    strategy: Strategy,
    cursors: DashMap<String, AtomicUsize>,
}

impl SelectionEngine {
    pub fn new(strategy: Strategy) -> Self {
        Self {
            strategy,
            cursors: DashMap::new(),
        }
    }

    pub fn strategy(&self) -> &Strategy {
        &self.strategy
    }

    /// Choose a backend from `candidates` (already filtered to selectable
    /// replicas of one model, sorted by id). Returns `None` only for an
    /// empty candidate list.
    pub fn select<'a>(
        &self,
        model_name: &str,
        candidates: &'a [BackendSnapshot],
        _ctx: &SelectionContext<'_>,
    ) -> Option<&'a BackendSnapshot> {
        if candidates.is_empty() {
            return None;
        }

        let index = match &self.strategy {
            Strategy::RoundRobin => self.next_cursor(model_name) % candidates.len(),
            Strategy::LeastConnections => argmin_by(candidates, |c| {
                (c.in_flight as f64, nan_as_inf(c.ema_or_nan()))
            }),
            Strategy::LeastLatency => argmin_by(candidates, |c| {
                (nan_as_inf(c.ema_or_nan()), c.in_flight as f64)
            }),
            Strategy::LeastLoad {
                load_weight,
                in_flight_weight,
                latency_weight,
            } => {
                match composite_scores(candidates, *load_weight, *in_flight_weight, *latency_weight)
                {
                    Some(scores) => argmin_scores(&scores),
                    // No replica has ever reported a load.
                    None => argmin_by(candidates, |c| {
                        (c.in_flight as f64, nan_as_inf(c.ema_or_nan()))
                    }),
                }
            }
        };

        candidates.get(index)
    }

    /// Advance the model's round-robin cursor. Skipped candidates are not
    /// re-tried; the next call simply advances.
    fn next_cursor(&self, model_name: &str) -> usize {
        self.cursors
            .entry(model_name.to_string())
            .or_insert_with(|| AtomicUsize::new(0))
            .fetch_add(1, Ordering::Relaxed)
    }
}

fn nan_as_inf(value: f64) -> f64 {
    if value.is_nan() {
        f64::INFINITY
    } else {
        value
    }
}

/// Index of the lowest score; ties keep the earliest (lowest id).
fn argmin_scores(scores: &[f64]) -> usize {
    let mut best = 0;
    for (i, score) in scores.iter().enumerate().skip(1) {
        if *score < scores[best] {
            best = i;
        }
    }
    best
}

/// Index of the candidate minimizing `key`; ties keep the earliest (lowest
/// id, since candidates arrive sorted).
fn argmin_by(candidates: &[BackendSnapshot], key: impl Fn(&BackendSnapshot) -> (f64, f64)) -> usize {
    let mut best = 0;
    let mut best_key = key(&candidates[0]);
    for (i, candidate) in candidates.iter().enumerate().skip(1) {
        let k = key(candidate);
        if k.0 < best_key.0 || (k.0 == best_key.0 && k.1 < best_key.1) {
            best = i;
            best_key = k;
        }
    }
    best
}

/// Composite scores `w_l·load + w_c·norm(in_flight) + w_e·norm(ema)` per
/// candidate. Unknown loads take the mean of known loads; unknown latencies
/// take the mean of known latencies. Returns `None` when no candidate has a
/// known load, signalling the least-connections fallback.
fn composite_scores(
    candidates: &[BackendSnapshot],
    load_weight: f64,
    in_flight_weight: f64,
    latency_weight: f64,
) -> Option<Vec<f64>> {
    let known_loads: Vec<f64> = candidates.iter().filter_map(|c| c.load).collect();
    if known_loads.is_empty() {
        return None;
    }
    let mean_load = known_loads.iter().sum::<f64>() / known_loads.len() as f64;

    let known_emas: Vec<f64> = candidates.iter().filter_map(|c| c.ema_latency_ms).collect();
    let mean_ema = if known_emas.is_empty() {
        0.0
    } else {
        known_emas.iter().sum::<f64>() / known_emas.len() as f64
    };

    let loads: Vec<f64> = candidates
        .iter()
        .map(|c| c.load.unwrap_or(mean_load))
        .collect();
    let emas: Vec<f64> = candidates
        .iter()
        .map(|c| c.ema_latency_ms.unwrap_or(mean_ema))
        .collect();

    let max_in_flight = candidates
        .iter()
        .map(|c| c.in_flight as f64)
        .fold(0.0_f64, f64::max);
    let max_ema = emas.iter().copied().fold(0.0_f64, f64::max);

    Some(
        candidates
            .iter()
            .enumerate()
            .map(|(i, c)| {
                load_weight * loads[i]
                    + in_flight_weight * (c.in_flight as f64 / (max_in_flight + NORMALIZE_EPSILON))
                    + latency_weight * (emas[i] / (max_ema + NORMALIZE_EPSILON))
            })
            .collect(),
    )
}
