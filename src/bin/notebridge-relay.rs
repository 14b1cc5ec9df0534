//! Relay daemon: key directory plus encrypted message mirror over HTTP.

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use tracing_subscriber::{fmt, EnvFilter};

use notebridge_core::{db, relay, RelayConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let config = RelayConfig::parse();

    // Also installs the `log` bridge, so library records show up here.
    fmt()
        .with_env_filter(EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let pool = db::connect(&config.database_url)
        .await
        .with_context(|| format!("opening {}", config.database_url))?;
    let app = relay::router(relay::RelayState::new(pool));

    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("binding {}", config.listen))?;
    info!("notebridge relay listening on {}", config.listen);

    axum::serve(listener, app).await.context("relay server failed")?;
    Ok(())
}
