//! Configuration: CLI arguments, environment, and the structured YAML file.
//!
//! The command line carries only deployment-level switches (config path,
//! port override, log filter); everything else lives in the YAML file with
//! `proxy`, `models`, `cluster`, and `headers` sections. Unknown keys are
//! ignored so configs can be shared with the launcher tooling; missing
//! required keys and unknown strategy names fail the load with an explicit
//! path. Configuration is immutable after load.

use crate::backend::BackendDescriptor;
use crate::selection::Strategy;
use clap::Parser;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Command-line arguments and environment overrides.
#[derive(Debug, Clone, Parser)]
#[command(name = "agent-infra-proxy")]
#[command(about = "Load-balancing reverse proxy for pools of OpenAI-compatible LLM inference replicas")]
#[command(version)]
pub struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, env = "AGENT_INFRA_CONFIG", default_value = "agent-infra.yaml")]
    pub config: PathBuf,

    /// Override the configured listen port
    #[arg(short, long, env = "AGENT_INFRA_PORT")]
    pub port: Option<u16>,

    /// Log level filter (debug|info|warn|error)
    #[arg(long, env = "AGENT_INFRA_LOG", default_value = "info")]
    pub log_level: String,
}

impl Cli {
    /// Parse arguments after loading `.env` if present.
    pub fn parse_args() -> Self {
        let _ = dotenv::dotenv();
        Self::parse()
    }

    /// Initialize the tracing subscriber from the configured filter.
    pub fn init_logging(&self) {
        let filter = EnvFilter::try_new(&self.log_level)
            .unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init();
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub proxy: ProxyConfig,
    pub models: Vec<ModelConfig>,
    /// Opaque to the proxy; the cluster launcher owns its meaning.
    #[serde(default)]
    pub cluster: Option<serde_yaml::Value>,
    #[serde(default)]
    pub headers: HeaderConfig,
}

/// The `proxy` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub port: u16,
    pub strategy: Strategy,
    pub health_check_interval_s: u64,
    pub request_timeout_s: u64,
    pub probe_timeout_s: u64,
    pub connect_timeout_s: u64,
    pub max_retries: u32,
    /// Per-backend in-flight cap; `None` is unbounded.
    pub max_in_flight: Option<u32>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            strategy: Strategy::default(),
            health_check_interval_s: 30,
            request_timeout_s: 300,
            probe_timeout_s: 3,
            connect_timeout_s: 5,
            max_retries: 1,
            max_in_flight: None,
        }
    }
}

/// One entry of the `models` section. `tensor_parallel_size`,
/// `gpu_memory_utilization`, and `model_path` inform backend launch and are
/// opaque metadata to the proxy.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub name: String,
    pub base_port: u16,
    #[serde(default = "default_replicas")]
    pub replicas: u16,
    /// Replicas are reachable locally after tunneling.
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default)]
    pub tensor_parallel_size: Option<u32>,
    #[serde(default)]
    pub gpu_memory_utilization: Option<f64>,
    #[serde(default)]
    pub model_path: Option<String>,
}

fn default_replicas() -> u16 {
    1
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

/// Names of the routing headers; defaults match what agent harnesses send.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HeaderConfig {
    pub session: String,
    pub task: String,
    pub client: String,
    pub pre: String,
    pub post: String,
}

impl Default for HeaderConfig {
    fn default() -> Self {
        Self {
            session: "X-Session-ID".to_string(),
            task: "X-Task-ID".to_string(),
            client: "X-Client-ID".to_string(),
            pre: "X-Timing-Pre-Ms".to_string(),
            post: "X-Timing-Post-Ms".to_string(),
        }
    }
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.proxy.port == 0 {
            return Err(ConfigError::Invalid(
                "proxy.port must be a non-zero port number".to_string(),
            ));
        }
        if self.proxy.request_timeout_s == 0 {
            return Err(ConfigError::Invalid(
                "proxy.request_timeout_s must be greater than 0".to_string(),
            ));
        }
        if self.proxy.probe_timeout_s == 0 || self.proxy.connect_timeout_s == 0 {
            return Err(ConfigError::Invalid(
                "probe and connect timeouts must be greater than 0".to_string(),
            ));
        }
        if self.models.is_empty() {
            return Err(ConfigError::Invalid(
                "models must list at least one model".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for model in &self.models {
            if model.name.is_empty() {
                return Err(ConfigError::Invalid("model name cannot be empty".to_string()));
            }
            if !seen.insert(model.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate model name '{}'",
                    model.name
                )));
            }
            if model.replicas == 0 {
                return Err(ConfigError::Invalid(format!(
                    "model '{}' must have at least one replica",
                    model.name
                )));
            }
            if model.base_port as u32 + model.replicas as u32 > u16::MAX as u32 + 1 {
                return Err(ConfigError::Invalid(format!(
                    "model '{}' replica ports exceed the valid port range",
                    model.name
                )));
            }
            if let Some(tp) = model.tensor_parallel_size {
                if tp == 0 {
                    return Err(ConfigError::Invalid(format!(
                        "model '{}' tensor_parallel_size must be at least 1",
                        model.name
                    )));
                }
            }
            if let Some(util) = model.gpu_memory_utilization {
                if !(0.0..=1.0).contains(&util) {
                    return Err(ConfigError::Invalid(format!(
                        "model '{}' gpu_memory_utilization must be within [0, 1]",
                        model.name
                    )));
                }
            }
            let endpoint = format!("http://{}:{}", model.host, model.base_port);
            url::Url::parse(&endpoint).map_err(|err| {
                ConfigError::Invalid(format!(
                    "model '{}' host '{}' does not form a valid endpoint: {err}",
                    model.name, model.host
                ))
            })?;
        }
        Ok(())
    }

    /// Initial replica endpoints derived from the model list, one descriptor
    /// per `(model, replica_index)` at `host:base_port + index`.
    pub fn endpoints(&self) -> Vec<BackendDescriptor> {
        self.models
            .iter()
            .flat_map(|model| {
                (0..model.replicas).map(move |index| {
                    BackendDescriptor::new(
                        model.name.clone(),
                        index as usize,
                        format!("{}:{}", model.host, model.base_port + index),
                    )
                })
            })
            .collect()
    }

    /// Minimal configuration for tests.
    pub fn for_test() -> Self {
        Self {
            proxy: ProxyConfig::default(),
            models: vec![ModelConfig {
                name: "llama".to_string(),
                base_port: 9000,
                replicas: 1,
                host: default_host(),
                tensor_parallel_size: None,
                gpu_memory_utilization: None,
                model_path: None,
            }],
            cluster: None,
            headers: HeaderConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = "\
models:
  - name: llama
    base_port: 9000
";

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config: Config = serde_yaml::from_str(MINIMAL).unwrap();
        config.validate().unwrap();

        assert_eq!(config.proxy.port, 8080);
        assert_eq!(config.proxy.health_check_interval_s, 30);
        assert_eq!(config.proxy.request_timeout_s, 300);
        assert_eq!(config.proxy.probe_timeout_s, 3);
        assert_eq!(config.proxy.connect_timeout_s, 5);
        assert_eq!(config.proxy.max_retries, 1);
        assert_eq!(config.proxy.strategy, Strategy::RoundRobin);
        assert_eq!(config.headers.session, "X-Session-ID");
        assert_eq!(config.headers.pre, "X-Timing-Pre-Ms");
    }

    #[test]
    fn test_full_config_parses() {
        let yaml = "\
proxy:
  port: 9090
  strategy: least_connections
  health_check_interval_s: 10
  request_timeout_s: 120
  max_retries: 2
  max_in_flight: 64
models:
  - name: llama
    base_port: 9000
    replicas: 3
    tensor_parallel_size: 2
    gpu_memory_utilization: 0.9
    model_path: /models/llama
  - name: qwen
    base_port: 9100
cluster:
  partition: gpu
  nodes: 4
headers:
  session: X-Conversation-ID
";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.proxy.port, 9090);
        assert_eq!(config.proxy.strategy, Strategy::LeastConnections);
        assert_eq!(config.proxy.max_in_flight, Some(64));
        assert_eq!(config.models.len(), 2);
        assert_eq!(config.headers.session, "X-Conversation-ID");
        // Unchanged defaults alongside overrides.
        assert_eq!(config.headers.task, "X-Task-ID");
        assert!(config.cluster.is_some());
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let yaml = "\
proxy:
  port: 8080
  some_future_knob: true
models:
  - name: llama
    base_port: 9000
    launcher_hint: slurm
";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.proxy.port, 8080);
    }

    #[test]
    fn test_missing_models_is_an_error() {
        assert!(serde_yaml::from_str::<Config>("proxy:\n  port: 8080\n").is_err());
    }

    #[test]
    fn test_unknown_strategy_rejected_at_load() {
        let yaml = "\
proxy:
  strategy: quantum_annealing
models:
  - name: llama
    base_port: 9000
";
        let err = serde_yaml::from_str::<Config>(yaml);
        assert!(err.is_err());
    }

    #[test]
    fn test_validation_rejects_duplicates_and_zero_replicas() {
        let mut config = Config::for_test();
        config.models.push(config.models[0].clone());
        assert!(config.validate().is_err());

        let mut config = Config::for_test();
        config.models[0].replicas = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_endpoint_derivation() {
        let yaml = "\
models:
  - name: llama
    base_port: 9000
    replicas: 2
  - name: qwen
    base_port: 9100
";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let endpoints = config.endpoints();
        assert_eq!(endpoints.len(), 3);
        assert_eq!(endpoints[0].id, "llama-0");
        assert_eq!(endpoints[0].endpoint, "127.0.0.1:9000");
        assert_eq!(endpoints[1].id, "llama-1");
        assert_eq!(endpoints[1].endpoint, "127.0.0.1:9001");
        assert_eq!(endpoints[2].id, "qwen-0");
        assert_eq!(endpoints[2].endpoint, "127.0.0.1:9100");
    }
}
