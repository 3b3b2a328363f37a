//! Server entry point: configuration, worker, router, listener.

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sotto_server::config::Config;
use sotto_server::handlers::api_router;
use sotto_server::state::{AppState, SharedState};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Bind address (overrides APP_HOST)
    #[arg(short = 'a', long)]
    host: Option<String>,

    /// Bind port (overrides APP_PORT)
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = Config::from_env().map_err(|err| anyhow::anyhow!(err))?;
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    info!("Starting Sotto relay server");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("Bind address: {}:{}", config.host, config.port);

    if config.tls_cert.is_some() && config.tls_key.is_some() {
        info!("TLS material configured; termination happens at the fronting proxy");
    } else {
        warn!("Running without TLS - only use for development!");
    }
    match &config.redis_uri {
        Some(uri) => info!(%uri, "cross-instance delivery over redis"),
        None => warn!("No redis configured; delivery stays in-process"),
    }

    let state: SharedState = Arc::new(AppState::new(config.clone()).await?);
    state.spawn_worker();

    let app = api_router(state);
    let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
    info!("Listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
