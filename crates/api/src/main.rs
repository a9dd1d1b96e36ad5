use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;

use smfg_infra::AppConfig;
use smfg_observability::LogConfig;

use smfg_api::app::{build_app, services};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("failed to load configuration")?;
    smfg_observability::init(&LogConfig::new(&config.log_level, config.log_text));

    let services = match services::build_services(&config).await {
        Ok(s) => Arc::new(s),
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "failed to start services");
            return Err(e);
        }
    };
    let relay = services.spawn_relay(config.outbox_poll_interval);

    let app = build_app(services);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    tracing::info!(%addr, in_memory = config.in_memory, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    relay.shutdown().await;
    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
