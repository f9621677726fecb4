// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Statemachine Connector
//!
//! Runs the transfer process and contract negotiation loops against the
//! configured entity store until interrupted.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use statemachine_connector::config::Config;
use statemachine_connector::dispatcher::LoggingDispatcher;
use statemachine_connector::runtime::ConnectorRuntime;

const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "statemachine_connector=info,statemachine_core=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        connector_id = %config.connector_id,
        backend = config.store.kind(),
        lease_duration_ms = config.lease_duration.as_millis() as u64,
        "Starting statemachine connector"
    );

    let runtime = ConnectorRuntime::from_config(&config, Arc::new(LoggingDispatcher))
        .await?
        .build()?
        .start()
        .await;

    let mut health_check = tokio::time::interval(HEALTH_CHECK_INTERVAL);
    health_check.tick().await;

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                info!("Shutdown signal received");
                break;
            }
            _ = health_check.tick() => {
                let health = runtime.health();
                if !health.is_healthy() {
                    error!(
                        inactive = ?health.inactive_loops(),
                        "Process loops are not running"
                    );
                }
            }
        }
    }

    runtime.shutdown().await;

    info!("Statemachine connector shut down");

    Ok(())
}
