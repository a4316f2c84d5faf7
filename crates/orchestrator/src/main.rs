use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use orchestrator::api::build_router;
use orchestrator::config::{Config, LogFormat};
use orchestrator::controller::Controller;
use orchestrator::runtime::BollardRuntime;

#[tokio::main]
async fn main() -> Result<()> {
    // Phase 1: thread-local tracing so config loading itself is observable.
    let _basic_tracing = init_tracing_basic();

    info!("starting acestream-orchestrator v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load().context("failed to load configuration")?;
    config.validate().context("configuration validation failed")?;

    // Phase 2: replace with the configured global subscriber.
    drop(_basic_tracing);
    init_tracing_from_config(&config);

    info!(bind = %config.server.bind_address, vpn_mode = ?config.vpn.mode, "configuration loaded");

    let runtime: Arc<dyn orchestrator::runtime::ContainerRuntime> =
        Arc::new(BollardRuntime::new(&config.runtime.docker_socket).context("failed to connect to container runtime")?);

    let controller = Controller::bootstrap(config, runtime);

    controller.run_startup_provisioning().await;

    let monitor = controller.build_monitor_loop();
    let monitor_shutdown = controller.shutdown_tx.subscribe();
    let monitor_handle = tokio::spawn(async move { monitor.run(monitor_shutdown).await });

    let vpn_handle = controller.spawn_vpn_health_sampler();
    let stats_handle = controller.spawn_stats_collector();

    let app = build_router(controller.clone());
    let addr: SocketAddr = controller.config.server.bind_address.parse().context("invalid server.bind_address")?;

    let listener = tokio::net::TcpListener::bind(&addr).await.context("failed to bind HTTP listener")?;
    info!(%addr, "acestream-orchestrator ready");

    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await.context("HTTP server error")?;

    info!("shutdown signal received, stopping background tasks");
    let _ = controller.shutdown_tx.send(true);

    if let Err(e) = monitor_handle.await {
        warn!(error = %e, "monitor loop task join failed");
    }
    if let Some(handle) = vpn_handle {
        if let Err(e) = handle.await {
            warn!(error = %e, "vpn health sampler task join failed");
        }
    }
    if let Err(e) = stats_handle.await {
        warn!(error = %e, "stats collector task join failed");
    }

    info!("acestream-orchestrator shut down gracefully");
    Ok(())
}

fn init_tracing_basic() -> tracing::subscriber::DefaultGuard {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,orchestrator=debug"));
    let subscriber = fmt().with_env_filter(filter).with_target(true).with_file(false).with_line_number(false).finish();
    tracing::subscriber::set_default(subscriber)
}

fn init_tracing_from_config(config: &Config) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format {
        LogFormat::Json => {
            let layer = fmt::layer().json().with_target(true).with_thread_ids(true);
            tracing_subscriber::registry().with(filter).with(layer).init();
        }
        LogFormat::Pretty => {
            let layer = fmt::layer().with_target(true);
            tracing_subscriber::registry().with(filter).with(layer).init();
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            warn!("received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            warn!("received SIGTERM, initiating graceful shutdown");
        }
    }
}
