use std::net::Ipv4Addr;
use std::sync::Arc;

use anyhow::Context;
use ragdomains::{api, config, domains::DomainService, logging};
use tokio::net::TcpListener;

const PORT_RANGE: std::ops::RangeInclusive<u16> = 4100..=4199;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    config::init_config();
    logging::init_tracing();
    let config = config::get_config();

    tokio::fs::create_dir_all(&config.data_dir)
        .await
        .with_context(|| format!("Failed to create data dir {}", config.data_dir.display()))?;
    let service = DomainService::from_config(config);
    let domains = service
        .list_domains()
        .await
        .context("Failed to scan existing domains")?;
    tracing::info!(
        domains = domains.len(),
        data_dir = %config.data_dir.display(),
        "Domain registry ready"
    );

    let (listener, port) = bind_listener(config.server_port).await?;
    tracing::info!("Listening on http://0.0.0.0:{}", port);
    axum::serve(listener, api::create_router(Arc::new(service)))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("Server stopped");
    Ok(())
}

/// Bind the configured port, or the first free port in [`PORT_RANGE`].
async fn bind_listener(fixed: Option<u16>) -> anyhow::Result<(TcpListener, u16)> {
    if let Some(port) = fixed {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))
            .await
            .with_context(|| format!("Failed to bind SERVER_PORT {port}"))?;
        return Ok((listener, port));
    }

    for port in PORT_RANGE {
        match TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await {
            Ok(listener) => return Ok((listener, port)),
            Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
                tracing::debug!(port, "Port already in use; trying next");
            }
            Err(err) => return Err(err).context(format!("Failed to bind port {port}")),
        }
    }
    anyhow::bail!(
        "No available port found in range {}-{}",
        PORT_RANGE.start(),
        PORT_RANGE.end()
    )
}

/// Resolve once Ctrl-C is received, letting in-flight requests (and their index writes) finish.
async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %error, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}
