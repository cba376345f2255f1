// Copyright (C) 2025 The Stratus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stratus Manager - VM Instance Lifecycle Daemon
//!
//! Responsible for:
//! - Restart recovery of persisted instances
//! - Driving instance state machines through the backend executor
//! - Destroying instances past their termination time

use tracing::{info, warn};

use stratus_manager::config::Config;
use stratus_manager::runtime::{ManagerRuntime, home_from_config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stratus_manager=info,stratus_core=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        database = %config.database_url,
        initial_workers = config.initial_workers,
        max_workers = config.max_workers,
        unpropagate_enabled = config.unpropagate_enabled,
        "Starting Stratus Manager"
    );

    let home = home_from_config(&config).await?;

    let runtime = ManagerRuntime::builder()
        .home(home)
        .sweeper_config(config.sweeper_config())
        .build()?
        .start()
        .await?;

    info!("Stratus Manager ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("Stratus Manager shut down");

    Ok(())
}
