// Copyright (C) 2025 The Stratus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for stratus-manager.
//!
//! [`ManagerRuntime`] runs the instance home together with its background
//! workers inside an existing tokio application.
//!
//! ```rust,ignore
//! use stratus_manager::config::Config;
//! use stratus_manager::runtime::{ManagerRuntime, home_from_config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let home = home_from_config(&config).await?;
//!
//!     let runtime = ManagerRuntime::builder()
//!         .home(home)
//!         .sweeper_config(config.sweeper_config())
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... serve clients through runtime.home() ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use anyhow::Result;
use stratus_core::InstanceHome;
use stratus_core::executor::{CommandExecutor, MockExecutor, TaskExecutor};
use stratus_core::persistence::{MemoryPersistence, Persistence, SqlitePersistence};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::{Config, Database};
use crate::sweeper::{Sweeper, SweeperConfig};

/// Assemble an [`InstanceHome`] from the loaded configuration.
///
/// Opens the configured store (running migrations for SQLite) and picks the
/// command executor when a backend command is set, the mock otherwise.
pub async fn home_from_config(config: &Config) -> Result<Arc<InstanceHome>> {
    let persistence: Arc<dyn Persistence> = match config.database() {
        Database::Memory => {
            warn!("Using in-memory persistence; instance records will not survive a restart");
            Arc::new(MemoryPersistence::new())
        }
        Database::Sqlite(path) => {
            let persistence = SqlitePersistence::from_path(&path).await?;
            info!(path = %path.display(), "Opened SQLite instance store");
            Arc::new(persistence)
        }
    };

    let executor: Arc<dyn TaskExecutor> = match config.command_executor_config() {
        Some(command) => {
            info!(program = %command.program, "Using command backend executor");
            Arc::new(CommandExecutor::new(command))
        }
        None => {
            warn!("STRATUS_BACKEND_COMMAND not set; using mock backend executor");
            Arc::new(MockExecutor::new())
        }
    };

    let mut builder = InstanceHome::builder()
        .persistence(persistence)
        .executor(executor)
        .engine_config(config.engine_config())
        .dispatch_config(config.dispatch_config());
    if let Some(timeout) = config.lock_timeout {
        builder = builder.lock_timeout(timeout);
    }

    Ok(builder.build()?)
}

/// Builder for [`ManagerRuntime`].
pub struct ManagerRuntimeBuilder {
    home: Option<Arc<InstanceHome>>,
    sweeper_config: SweeperConfig,
    recover_on_start: bool,
}

impl Default for ManagerRuntimeBuilder {
    fn default() -> Self {
        Self {
            home: None,
            sweeper_config: SweeperConfig::default(),
            recover_on_start: true,
        }
    }
}

impl ManagerRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the instance home (required).
    pub fn home(mut self, home: Arc<InstanceHome>) -> Self {
        self.home = Some(home);
        self
    }

    /// Set the termination sweeper configuration.
    ///
    /// Default: sweep every 60 seconds, wait 2 minutes for destroys
    pub fn sweeper_config(mut self, config: SweeperConfig) -> Self {
        self.sweeper_config = config;
        self
    }

    /// Whether to run restart recovery before the workers start.
    ///
    /// Default: `true`
    pub fn recover_on_start(mut self, recover: bool) -> Self {
        self.recover_on_start = recover;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<ManagerRuntimeConfig> {
        let home = self
            .home
            .ok_or_else(|| anyhow::anyhow!("home is required"))?;

        Ok(ManagerRuntimeConfig {
            home,
            sweeper_config: self.sweeper_config,
            recover_on_start: self.recover_on_start,
        })
    }
}

/// Configuration for a [`ManagerRuntime`].
pub struct ManagerRuntimeConfig {
    home: Arc<InstanceHome>,
    sweeper_config: SweeperConfig,
    recover_on_start: bool,
}

impl ManagerRuntimeConfig {
    /// Recover persisted instances, then spawn the sweeper.
    pub async fn start(self) -> Result<ManagerRuntime> {
        if self.recover_on_start {
            let report = self.home.recover().await?;
            if !report.corrupted.is_empty() {
                warn!(
                    instances = ?report.corrupted,
                    "Instances interrupted by restart were marked corrupted"
                );
            }
            if !report.resumed.is_empty() {
                info!(
                    instances = ?report.resumed,
                    "Resumed transitions interrupted by restart"
                );
            }
        }

        let sweeper = Sweeper::new(self.home.clone(), self.sweeper_config);
        let sweeper_shutdown = sweeper.shutdown_handle();
        let sweeper_handle = tokio::spawn(async move {
            sweeper.run().await;
        });

        info!(
            recovered = self.recover_on_start,
            "ManagerRuntime started"
        );

        Ok(ManagerRuntime {
            home: self.home,
            sweeper_handle,
            sweeper_shutdown,
        })
    }
}

/// A running stratus manager that can be embedded in an application.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct ManagerRuntime {
    home: Arc<InstanceHome>,
    sweeper_handle: JoinHandle<()>,
    sweeper_shutdown: Arc<Notify>,
}

impl ManagerRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> ManagerRuntimeBuilder {
        ManagerRuntimeBuilder::new()
    }

    /// The instance home served by this runtime.
    pub fn home(&self) -> &Arc<InstanceHome> {
        &self.home
    }

    /// Check if the background workers are still running.
    pub fn is_running(&self) -> bool {
        !self.sweeper_handle.is_finished()
    }

    /// Gracefully shut down the runtime.
    ///
    /// Stops the sweeper, waits for it, then drains the dispatch pool and
    /// fails any pending lock waits.
    pub async fn shutdown(self) -> Result<()> {
        info!("ManagerRuntime shutting down...");

        self.sweeper_shutdown.notify_one();
        if let Err(e) = self.sweeper_handle.await {
            error!(error = %e, "Sweeper task panicked");
        }

        self.home.shutdown().await;

        info!("ManagerRuntime shutdown complete");
        Ok(())
    }
}
