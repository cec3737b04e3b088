//! Graceful shutdown handling.
//!
//! The server stops accepting on SIGINT/SIGTERM, lets in-flight requests
//! drain, and maps the signal to the process exit code: 130 for an
//! interrupt, 0 for a clean stop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// SIGINT (Ctrl+C).
    Interrupt,
    /// SIGTERM, the orchestrator's clean stop.
    Terminate,
}

impl ShutdownSignal {
    pub fn exit_code(self) -> u8 {
        match self {
            ShutdownSignal::Interrupt => 130,
            ShutdownSignal::Terminate => 0,
        }
    }
}

#[derive(Clone, Default)]
pub struct GracefulShutdown {
    initiated: Arc<AtomicBool>,
}

impl GracefulShutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_initiated(&self) -> bool {
        self.initiated.load(Ordering::Relaxed)
    }

    pub fn initiate(&self) {
        self.initiated.store(true, Ordering::Relaxed);
    }

    /// Block until a shutdown signal arrives.
    #[cfg(unix)]
    pub async fn wait_for_signal(&self) -> ShutdownSignal {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm =
            signal(SignalKind::terminate()).expect("install SIGTERM handler");

        let received = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received SIGINT");
                ShutdownSignal::Interrupt
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM");
                ShutdownSignal::Terminate
            }
        };
        self.initiate();
        received
    }

    #[cfg(not(unix))]
    pub async fn wait_for_signal(&self) -> ShutdownSignal {
        let _ = tokio::signal::ctrl_c().await;
        info!("received interrupt");
        self.initiate();
        ShutdownSignal::Interrupt
    }
}
