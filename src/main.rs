//! Standalone proxy binary.
//!
//! Exit codes: 0 clean shutdown, 2 configuration error, 3 bind failure,
//! 130 interrupted.

use agent_infra_proxy::core::http_client::HttpClientBuilder;
use agent_infra_proxy::{
    create_router, AppState, Cli, Config, GracefulShutdown, HealthMonitor, SessionStore,
};
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse_args();
    cli.init_logging();

    let mut config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            error!("{err}");
            return ExitCode::from(2);
        }
    };
    if let Some(port) = cli.port {
        config.proxy.port = port;
    }

    let state = AppState::with_seeded_registry(config);
    info!(
        port = state.config.proxy.port,
        strategy = state.engine.strategy().name(),
        backends = state.registry.snapshot().len(),
        "starting agent-infra-proxy"
    );

    let probe_client = match HttpClientBuilder::probe(&state.config.proxy).build() {
        Ok(client) => client,
        Err(err) => {
            error!("failed to build probe client: {err}");
            return ExitCode::from(2);
        }
    };
    HealthMonitor::new(
        state.registry.clone(),
        probe_client,
        Duration::from_secs(state.config.proxy.health_check_interval_s),
    )
    .spawn();
    SessionStore::spawn_sweeper(Arc::clone(&state.store));

    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.proxy.port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("failed to bind {addr}: {err}");
            return ExitCode::from(3);
        }
    };
    info!("listening on http://{addr}");

    let shutdown = GracefulShutdown::new();
    let (signal_tx, mut signal_rx) = tokio::sync::oneshot::channel();
    let app = create_router(state);

    let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
        let signal = shutdown.wait_for_signal().await;
        info!("draining in-flight requests");
        let _ = signal_tx.send(signal);
    });

    if let Err(err) = serve.await {
        error!("server error: {err}");
        return ExitCode::FAILURE;
    }

    match signal_rx.try_recv() {
        Ok(signal) => {
            info!("shutdown complete");
            ExitCode::from(signal.exit_code())
        }
        Err(_) => ExitCode::SUCCESS,
    }
}
