// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pairbridge relay server.

use anyhow::Context;
use pairbridge_relay::{RelayConfig, RelayState, build_app};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("pairbridge_relay=info")),
        )
        .init();

    let config = RelayConfig::from_env().context("failed to load relay configuration")?;
    let bind_addr = config.bind_addr;
    info!(
        bind_addr = %bind_addr,
        backend_url = %config.backend_url,
        access_token = config.access_token.is_some(),
        "Starting pairbridge relay"
    );

    let state = RelayState::new(config)?;
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", bind_addr))?;

    axum::serve(listener, build_app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("relay server failed")?;

    info!("Relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed to listen for shutdown signal");
    }
}
