//! Per-session turn telemetry and bottleneck diagnosis.
//!
//! Every completed (or failed) proxied request produces one [`TurnRecord`],
//! appended to its session's ring and to a global rolling window. The store
//! answers the dashboard's session listing, per-session drill-down, queue
//! statistics, and the bottleneck report that classifies which pipeline
//! stage (pre / queue / inference / post) dominates end-to-end latency.
//!
//! Sessions idle past the expiry horizon are dropped by a periodic sweep.
//! Writes never fail the request that produced them.

use crate::core::ring::Ring;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// Turn records kept per session.
pub const SESSION_RING_CAPACITY: usize = 128;

/// Turn records kept in the global rolling window.
pub const GLOBAL_WINDOW_CAPACITY: usize = 4096;

/// Sessions idle longer than this are eligible for eviction.
pub const SESSION_EXPIRE: Duration = Duration::from_secs(30 * 60);

/// Cadence of the eviction sweep.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Window for the rolling requests-per-second figure.
const RATE_WINDOW_SECS: i64 = 60;

/// Mean load above which an inference-bound workload warrants more replicas.
const HIGH_LOAD_THRESHOLD: f64 = 0.85;

/// One request/response cycle, as observed by the forwarder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRecord {
    /// Identifiers from the routing headers; any may be empty.
    pub session_id: String,
    pub task_id: String,
    pub client_id: String,
    pub model_name: String,
    pub backend_id: String,
    /// Request acceptance to upstream connect.
    pub queue_wait_ms: f64,
    /// First upstream byte sent to last byte received.
    pub inference_ms: f64,
    /// Agent-reported, carried in request headers.
    pub pre_ms: f64,
    pub post_ms: f64,
    pub total_ms: f64,
    pub status_code: u16,
    pub streamed: bool,
    pub error_kind: Option<String>,
    /// Backend-reported GPU utilization at completion, when known.
    pub backend_load: Option<f64>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug)]
struct SessionEntry {
    turns: Ring<TurnRecord>,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
}

/// Listing row for the dashboard's session table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub turns: usize,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub mean_total_ms: f64,
    pub errors: usize,
}

/// Mean and p95 for one pipeline stage.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StageStats {
    pub mean_ms: f64,
    pub p95_ms: f64,
}

/// Bottleneck diagnosis over a session or the global window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BottleneckReport {
    pub scope: String,
    pub turns: usize,
    pub pre: StageStats,
    pub queue_wait: StageStats,
    pub inference: StageStats,
    pub post: StageStats,
    pub total_mean_ms: f64,
    pub mean_backend_load: Option<f64>,
    pub dominant_stage: Option<String>,
    pub suggestion: String,
}

/// Global counters surfaced at `/admin/queue`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub requests_per_s: f64,
    pub mean_latency_ms: f64,
}

pub struct SessionStore {
    sessions: DashMap<String, SessionEntry>,
    global: Mutex<Ring<TurnRecord>>,
    session_capacity: usize,
    expire: Duration,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::with_capacity(SESSION_RING_CAPACITY, GLOBAL_WINDOW_CAPACITY, SESSION_EXPIRE)
    }

    pub fn with_capacity(session_capacity: usize, global_capacity: usize, expire: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            global: Mutex::new(Ring::new(global_capacity)),
            session_capacity,
            expire,
        }
    }

    /// Append one finalized turn. Turns without a session id still count in
    /// the global window.
    pub fn record(&self, turn: TurnRecord) {
        if !turn.session_id.is_empty() {
            let now = Utc::now();
            let mut entry = self
                .sessions
                .entry(turn.session_id.clone())
                .or_insert_with(|| SessionEntry {
                    turns: Ring::new(self.session_capacity),
                    first_seen: now,
                    last_seen: now,
                });
            entry.last_seen = now;
            entry.turns.push(turn.clone());
        }
        self.global.lock().expect("global window lock").push(turn);
    }

    pub fn get_session(&self, session_id: &str) -> Option<Vec<TurnRecord>> {
        self.sessions.get(session_id).map(|entry| entry.turns.to_vec())
    }

    /// Session summaries sorted by `last_seen` descending.
    pub fn list_sessions(
        &self,
        limit: usize,
        since: Option<DateTime<Utc>>,
    ) -> Vec<SessionSummary> {
        let mut summaries: Vec<SessionSummary> = self
            .sessions
            .iter()
            .filter(|entry| since.map_or(true, |cutoff| entry.last_seen >= cutoff))
            .map(|entry| {
                let turns = entry.turns.len();
                let mean_total_ms = if turns == 0 {
                    0.0
                } else {
                    entry.turns.iter().map(|t| t.total_ms).sum::<f64>() / turns as f64
                };
                SessionSummary {
                    session_id: entry.key().clone(),
                    turns,
                    first_seen: entry.first_seen,
                    last_seen: entry.last_seen,
                    mean_total_ms,
                    errors: entry.turns.iter().filter(|t| t.error_kind.is_some()).count(),
                }
            })
            .collect();
        summaries.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        summaries.truncate(limit);
        summaries
    }

    /// Rolling request rate and mean latency over the last minute of the
    /// global window.
    pub fn queue_stats(&self) -> QueueStats {
        let cutoff = Utc::now() - ChronoDuration::seconds(RATE_WINDOW_SECS);
        let global = self.global.lock().expect("global window lock");

        let recent: Vec<&TurnRecord> = global
            .iter()
            .filter(|t| {
                let completed =
                    t.started_at + ChronoDuration::milliseconds(t.total_ms.max(0.0) as i64);
                completed >= cutoff
            })
            .collect();

        if recent.is_empty() {
            return QueueStats::default();
        }
        QueueStats {
            requests_per_s: recent.len() as f64 / RATE_WINDOW_SECS as f64,
            mean_latency_ms: recent.iter().map(|t| t.total_ms).sum::<f64>() / recent.len() as f64,
        }
    }

    /// Classify which stage dominates latency over the requested scope.
    pub fn bottleneck_report(&self, session_id: Option<&str>) -> BottleneckReport {
        let (scope, turns): (String, Vec<TurnRecord>) = match session_id {
            Some(id) => (
                id.to_string(),
                self.get_session(id).unwrap_or_default(),
            ),
            None => (
                "global".to_string(),
                self.global.lock().expect("global window lock").to_vec(),
            ),
        };

        if turns.is_empty() {
            return BottleneckReport {
                scope,
                turns: 0,
                pre: StageStats::default(),
                queue_wait: StageStats::default(),
                inference: StageStats::default(),
                post: StageStats::default(),
                total_mean_ms: 0.0,
                mean_backend_load: None,
                dominant_stage: None,
                suggestion: "no data".to_string(),
            };
        }

        let pre = stage_stats(&turns, |t| t.pre_ms);
        let queue_wait = stage_stats(&turns, |t| t.queue_wait_ms);
        let inference = stage_stats(&turns, |t| t.inference_ms);
        let post = stage_stats(&turns, |t| t.post_ms);
        let total_mean_ms = turns.iter().map(|t| t.total_ms).sum::<f64>() / turns.len() as f64;

        let known_loads: Vec<f64> = turns.iter().filter_map(|t| t.backend_load).collect();
        let mean_backend_load = if known_loads.is_empty() {
            None
        } else {
            Some(known_loads.iter().sum::<f64>() / known_loads.len() as f64)
        };

        let stages = [
            ("pre_ms", pre.mean_ms),
            ("queue_wait_ms", queue_wait.mean_ms),
            ("inference_ms", inference.mean_ms),
            ("post_ms", post.mean_ms),
        ];
        let threshold = total_mean_ms * 0.5;
        let dominant_stage = stages
            .iter()
            .filter(|(_, mean)| *mean > threshold)
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(name, _)| name.to_string());

        let inference_bound = dominant_stage.as_deref() == Some("inference_ms");
        let agent_bound = pre.mean_ms + post.mean_ms > threshold;
        let suggestion = if inference_bound && mean_backend_load.map_or(false, |l| l > HIGH_LOAD_THRESHOLD) {
            "increase replicas"
        } else if !inference_bound && agent_bound {
            "agent-bound; increase agent parallelism"
        } else {
            "balanced"
        };

        BottleneckReport {
            scope,
            turns: turns.len(),
            pre,
            queue_wait,
            inference,
            post,
            total_mean_ms,
            mean_backend_load,
            dominant_stage,
            suggestion: suggestion.to_string(),
        }
    }

    /// Drop sessions idle since before the expiry horizon, relative to `now`.
    /// Returns how many were evicted.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let horizon = now
            - ChronoDuration::from_std(self.expire).unwrap_or_else(|_| ChronoDuration::seconds(0));
        let before = self.sessions.len();
        self.sessions.retain(|_, entry| entry.last_seen >= horizon);
        let evicted = before - self.sessions.len();
        if evicted > 0 {
            debug!(evicted, "session sweep");
        }
        evicted
    }

    /// Periodic eviction driver.
    pub fn spawn_sweeper(store: Arc<SessionStore>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                store.sweep(Utc::now());
            }
        })
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

fn stage_stats(turns: &[TurnRecord], stage: impl Fn(&TurnRecord) -> f64) -> StageStats {
    let mut values: Vec<f64> = turns.iter().map(stage).collect();
    let mean_ms = values.iter().sum::<f64>() / values.len() as f64;
    values.sort_by(f64::total_cmp);
    let index = ((values.len() as f64 * 0.95).ceil() as usize).saturating_sub(1);
    StageStats {
        mean_ms,
        p95_ms: values[index.min(values.len() - 1)],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(session: &str, pre: f64, queue: f64, inference: f64, post: f64, load: f64) -> TurnRecord {
        TurnRecord {
            session_id: session.to_string(),
            task_id: String::new(),
            client_id: String::new(),
            model_name: "llama".to_string(),
            backend_id: "llama-0".to_string(),
            queue_wait_ms: queue,
            inference_ms: inference,
            pre_ms: pre,
            post_ms: post,
            total_ms: pre + queue + inference + post,
            status_code: 200,
            streamed: false,
            error_kind: None,
            backend_load: Some(load),
            started_at: Utc::now(),
        }
    }

    #[test]
    fn test_session_ring_is_bounded() {
        let store = SessionStore::with_capacity(4, 64, SESSION_EXPIRE);
        for _ in 0..10 {
            store.record(turn("s1", 1.0, 1.0, 1.0, 1.0, 0.1));
        }
        assert_eq!(store.get_session("s1").unwrap().len(), 4);
    }

    #[test]
    fn test_turns_without_session_only_hit_global_window() {
        let store = SessionStore::new();
        store.record(turn("", 1.0, 1.0, 1.0, 1.0, 0.1));
        assert!(store.list_sessions(10, None).is_empty());
        assert_eq!(store.bottleneck_report(None).turns, 1);
    }

    #[test]
    fn test_list_sessions_sorted_by_recency() {
        let store = SessionStore::new();
        store.record(turn("old", 1.0, 1.0, 1.0, 1.0, 0.1));
        std::thread::sleep(std::time::Duration::from_millis(5));
        store.record(turn("new", 1.0, 1.0, 1.0, 1.0, 0.1));

        let sessions = store.list_sessions(10, None);
        assert_eq!(sessions[0].session_id, "new");
        assert_eq!(sessions[1].session_id, "old");

        assert_eq!(store.list_sessions(1, None).len(), 1);
    }

    #[test]
    fn test_agent_bound_diagnosis() {
        let store = SessionStore::new();
        for _ in 0..50 {
            store.record(turn("s1", 400.0, 5.0, 200.0, 100.0, 0.4));
        }

        let report = store.bottleneck_report(None);
        assert_eq!(report.turns, 50);
        assert_eq!(report.dominant_stage.as_deref(), Some("pre_ms"));
        assert_eq!(report.suggestion, "agent-bound; increase agent parallelism");
        assert_eq!(report.pre.mean_ms, 400.0);
        assert_eq!(report.pre.p95_ms, 400.0);
    }

    #[test]
    fn test_inference_bound_high_load_suggests_replicas() {
        let store = SessionStore::new();
        for _ in 0..20 {
            store.record(turn("s1", 10.0, 5.0, 800.0, 10.0, 0.95));
        }

        let report = store.bottleneck_report(Some("s1"));
        assert_eq!(report.scope, "s1");
        assert_eq!(report.dominant_stage.as_deref(), Some("inference_ms"));
        assert_eq!(report.suggestion, "increase replicas");
    }

    #[test]
    fn test_inference_bound_low_load_is_balanced() {
        let store = SessionStore::new();
        for _ in 0..20 {
            store.record(turn("s1", 10.0, 5.0, 800.0, 10.0, 0.3));
        }
        assert_eq!(store.bottleneck_report(None).suggestion, "balanced");
    }

    #[test]
    fn test_empty_scope_reports_no_data() {
        let store = SessionStore::new();
        let report = store.bottleneck_report(Some("missing"));
        assert_eq!(report.turns, 0);
        assert_eq!(report.suggestion, "no data");
        assert!(report.dominant_stage.is_none());
    }

    #[test]
    fn test_sweep_evicts_idle_sessions() {
        let store = SessionStore::with_capacity(8, 64, Duration::from_secs(60));
        store.record(turn("s1", 1.0, 1.0, 1.0, 1.0, 0.1));

        assert_eq!(store.sweep(Utc::now()), 0);
        assert!(store.get_session("s1").is_some());

        let later = Utc::now() + ChronoDuration::seconds(120);
        assert_eq!(store.sweep(later), 1);
        assert!(store.get_session("s1").is_none());
    }

    #[test]
    fn test_queue_stats_over_recent_window() {
        let store = SessionStore::new();
        for _ in 0..30 {
            store.record(turn("s1", 0.0, 0.0, 100.0, 0.0, 0.2));
        }
        let stats = store.queue_stats();
        assert!((stats.requests_per_s - 0.5).abs() < 1e-9);
        assert_eq!(stats.mean_latency_ms, 100.0);
    }
}
