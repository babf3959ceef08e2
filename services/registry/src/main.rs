//! Registry server binary.

use camino::Utf8PathBuf;
use clap::Parser;
use eyre::WrapErr;
use image_registry::{LogEvents, RegistryConfig};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

/// Serve an OCI image registry from the local filesystem.
#[derive(Debug, Parser)]
#[command(name = "registry-server", version)]
struct Args {
    /// Path to a TOML configuration file.
    #[arg(short, long, env = "REGISTRY_CONFIG")]
    config: Option<Utf8PathBuf>,

    /// Address to listen on, overriding the configuration file.
    #[arg(short, long, env = "REGISTRY_BIND")]
    bind: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => RegistryConfig::load(path)
            .await
            .wrap_err_with(|| format!("loading configuration from {path}"))?,
        None => RegistryConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.bind = bind;
    }

    let bind = config.bind;
    let registry = config.into_builder().events(LogEvents).build();

    let listener = TcpListener::bind(bind)
        .await
        .wrap_err_with(|| format!("binding {bind}"))?;
    tracing::info!("registry listening on http://{}", listener.local_addr()?);

    registry.serve(listener, shutdown_signal()).await?;
    tracing::info!("registry stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!("failed to listen for SIGTERM: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
