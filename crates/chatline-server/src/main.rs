//! # chatline-server
//!
//! Companion HTTP service for chatline clients. It holds the provider
//! secrets clients must never see:
//! - **Upload signing** for direct-to-object-storage uploads
//! - **Push dispatch** to the notification provider
//! - **Call tokens** for joining media rooms
//! - **Per-IP rate limiting** in front of all of it

mod api;
mod config;
mod error;
mod rate_limit;
mod signing;
mod token;

use std::time::Duration;

use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::api::AppState;
use crate::config::ServerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,chatline_server=debug")),
        )
        .init();

    info!("Starting chatline server v{}", env!("CARGO_PKG_VERSION"));

    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");
    let http_addr = config.http_addr;

    let state = AppState::new(config)?;

    // evict buckets idle for 10 minutes, every 5 minutes
    let limiter = state.rate_limiter.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        loop {
            interval.tick().await;
            limiter.purge_idle(Duration::from_secs(600)).await;
        }
    });

    tokio::select! {
        result = api::serve(state, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
