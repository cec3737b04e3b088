//! Periodic health probing of every registered backend.
//!
//! One driver task wakes every `health_check_interval_s` and probes all
//! backends concurrently; a slow replica cannot delay the others, and each
//! probe is independently bounded by `probe_timeout_s` on the probe client.
//! The first sweep runs immediately at startup, so replicas move out of
//! `Unknown` as soon as they answer; until then `Unknown` stays selectable
//! and cold traffic flows.

use crate::backend::{BackendState, ProbeOutcome};
use crate::registry::BackendRegistry;
use crate::schemas::LoadReport;
use futures_util::future::join_all;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub struct HealthMonitor {
    registry: Arc<BackendRegistry>,
    client: Client,
    interval: Duration,
}

impl HealthMonitor {
    pub fn new(registry: Arc<BackendRegistry>, client: Client, interval: Duration) -> Self {
        Self {
            registry,
            client,
            interval,
        }
    }

    /// Start the periodic driver. The returned handle aborts with the
    /// process; the monitor holds no state worth draining.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                // First tick completes immediately: the bootstrap sweep.
                ticker.tick().await;
                self.probe_all().await;
            }
        })
    }

    /// Probe every non-removed backend concurrently and apply the results.
    pub async fn probe_all(&self) {
        let targets: Vec<(String, String)> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|b| b.state != BackendState::Removed)
            .map(|b| (b.id, b.endpoint))
            .collect();

        join_all(
            targets
                .into_iter()
                .map(|(id, endpoint)| self.probe_one(id, endpoint)),
        )
        .await;
    }

    async fn probe_one(&self, id: String, endpoint: String) {
        let url = format!("http://{endpoint}/metrics/load");
        let outcome = match self.client.get(&url).send().await {
            Ok(response) if response.status().is_success() => {
                // Tolerate non-JSON and partial bodies; the load just stays
                // unchanged.
                let report = response.json::<LoadReport>().await.unwrap_or_default();
                ProbeOutcome {
                    ok: true,
                    gpu_utilization: report.gpu_utilization,
                }
            }
            Ok(response) => {
                debug!(id = %id, status = %response.status(), "load probe returned error status");
                ProbeOutcome {
                    ok: false,
                    gpu_utilization: None,
                }
            }
            Err(err) => {
                warn!(id = %id, error = %err, "load probe failed");
                ProbeOutcome {
                    ok: false,
                    gpu_utilization: None,
                }
            }
        };
        self.registry.apply_probe(&id, outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendDescriptor;
    use crate::config::ProxyConfig;
    use crate::core::http_client::HttpClientBuilder;

    #[tokio::test]
    async fn test_unreachable_backend_accumulates_failures() {
        let registry = Arc::new(BackendRegistry::new(None));
        // Port 1 refuses connections on any sane test host.
        registry.upsert(BackendDescriptor::new("llama", 0, "127.0.0.1:1"));

        let proxy = ProxyConfig {
            probe_timeout_s: 1,
            ..ProxyConfig::default()
        };
        let client = HttpClientBuilder::probe(&proxy).build().unwrap();
        let monitor = HealthMonitor::new(registry.clone(), client, Duration::from_secs(30));

        for _ in 0..3 {
            monitor.probe_all().await;
        }

        let snap = &registry.snapshot()[0];
        assert_eq!(snap.consecutive_failures, 3);
        assert_eq!(snap.state, BackendState::Unhealthy);
    }
}
