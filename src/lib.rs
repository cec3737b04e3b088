//! # agent-infra-proxy
//!
//! Load-balancing reverse proxy for pools of GPU-backed, OpenAI-compatible
//! LLM inference replicas, built for multi-turn agent workloads. The proxy
//! accepts chat-completion requests, picks a replica from a dynamically
//! maintained pool, relays the request (streaming or not) byte-for-byte,
//! and records per-turn timing telemetry keyed by session/task/client
//! identifiers for bottleneck diagnosis.
//!
//! ## Architecture
//!
//! - [`registry`] - live inventory of replicas with health, load, and
//!   latency statistics
//! - [`health`] - periodic concurrent probing of every replica
//! - [`selection`] - four interchangeable routing strategies
//! - [`forward`] - the streaming relay with failover and turn capture
//! - [`session`] - per-session turn rings and the bottleneck report
//! - [`server`] - router, handlers, and the `/admin` dashboard surface
//! - [`config`] - CLI plus structured YAML configuration
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use agent_infra_proxy::{AppState, Config, create_router};
//! use std::net::SocketAddr;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::for_test(); // or Config::load(path)
//!     let state = AppState::with_seeded_registry(config);
//!     let app = create_router(state.clone());
//!
//!     let addr = SocketAddr::from(([0, 0, 0, 0], state.config.proxy.port));
//!     let listener = tokio::net::TcpListener::bind(addr).await?;
//!     axum::serve(listener, app).await?;
//!     Ok(())
//! }
//! ```

// Core infrastructure
pub mod core;
pub mod config;
pub mod error;
pub mod schemas;
pub mod shutdown;

// Domain modules
pub mod backend;
pub mod registry;
pub mod health;
pub mod selection;
pub mod session;
pub mod forward;

pub mod server;

// Re-export commonly used types for convenience
pub use backend::{Backend, BackendDescriptor, BackendSnapshot, BackendState};
pub use config::{Cli, Config, HeaderConfig, ModelConfig, ProxyConfig};
pub use error::ProxyError;
pub use health::HealthMonitor;
pub use registry::{BackendRegistry, RegistryEvent};
pub use selection::{SelectionContext, SelectionEngine, Strategy};
pub use server::{create_router, AppState};
pub use session::{BottleneckReport, SessionStore, TurnRecord};
pub use shutdown::{GracefulShutdown, ShutdownSignal};

/// The result type used throughout the library
pub type Result<T> = std::result::Result<T, ProxyError>;
