//! HTTP client factory.
//!
//! Centralized construction of the two egress clients so their settings stay
//! consistent: the passthrough client used to forward completions to backend
//! replicas, and the probe client used by the health monitor.
//!
//! The passthrough client carries no total request timeout (the forwarder
//! enforces the per-request deadline itself, because streaming responses may
//! legitimately outlive any fixed send timeout) and performs no response
//! decompression, so relayed bytes reach the client exactly as the upstream
//! produced them.

use crate::config::ProxyConfig;
use reqwest::Client;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HttpClientError {
    #[error("failed to build HTTP client: {0}")]
    Build(#[from] reqwest::Error),
}

/// Connection pool tuning shared by both clients.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_idle_per_host: usize,
    pub idle_timeout: Duration,
    pub keepalive: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
            keepalive: Some(Duration::from_secs(60)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Total request timeout. `None` leaves deadline enforcement to callers.
    pub timeout: Option<Duration>,
    pub connect_timeout: Duration,
    pub pool: PoolConfig,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_secs(30)),
            connect_timeout: Duration::from_secs(5),
            pool: PoolConfig::default(),
        }
    }
}

pub struct HttpClientBuilder {
    config: HttpClientConfig,
}

impl HttpClientBuilder {
    pub fn new() -> Self {
        Self {
            config: HttpClientConfig::default(),
        }
    }

    /// Client used to relay completion requests to replicas.
    pub fn passthrough(proxy: &ProxyConfig) -> Self {
        Self {
            config: HttpClientConfig {
                timeout: None,
                connect_timeout: Duration::from_secs(proxy.connect_timeout_s),
                pool: PoolConfig {
                    // Replicas see sustained traffic from one process; keep
                    // more warm connections than the default.
                    max_idle_per_host: 32,
                    idle_timeout: Duration::from_secs(120),
                    keepalive: Some(Duration::from_secs(60)),
                },
            },
        }
    }

    /// Client used by the health monitor. Probes are small and must fail
    /// fast, so the whole request is bounded by `probe_timeout_s`.
    pub fn probe(proxy: &ProxyConfig) -> Self {
        Self {
            config: HttpClientConfig {
                timeout: Some(Duration::from_secs(proxy.probe_timeout_s)),
                connect_timeout: Duration::from_secs(proxy.probe_timeout_s),
                pool: PoolConfig {
                    max_idle_per_host: 2,
                    idle_timeout: Duration::from_secs(60),
                    keepalive: None,
                },
            },
        }
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn pool_config(mut self, pool: PoolConfig) -> Self {
        self.config.pool = pool;
        self
    }

    pub fn build(self) -> Result<Client, HttpClientError> {
        let mut builder = Client::builder()
            .connect_timeout(self.config.connect_timeout)
            .pool_max_idle_per_host(self.config.pool.max_idle_per_host)
            .pool_idle_timeout(self.config.pool.idle_timeout);

        if let Some(timeout) = self.config.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(keepalive) = self.config.pool.keepalive {
            builder = builder.tcp_keepalive(keepalive);
        }

        builder.build().map_err(HttpClientError::from)
    }
}

impl Default for HttpClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}
