//! Shared infrastructure: the HTTP client factory used for upstream egress
//! and health probes, and the fixed-capacity ring buffer behind every
//! rolling window in the crate.

pub mod http_client;
pub mod ring;

pub use http_client::{HttpClientBuilder, HttpClientConfig, HttpClientError};
pub use ring::Ring;
