// Copyright (C) 2025 The Stratus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker destroying instances past their termination time.
//!
//! Each cycle:
//! 1. Lists sweepable instances (id + termination time) from the home
//! 2. Keeps those whose deadline has passed
//! 3. Spawns one destroy per expired instance
//! 4. Waits for all of them up to `destroy_timeout`
//!
//! Failed or slow destroys are logged and left for the next cycle.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use stratus_core::{Error as CoreError, InstanceHome};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::Result;

/// Configuration for the termination sweeper.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Delay between sweeps.
    pub poll_interval: Duration,
    /// How long one sweep waits for its destroys to finish.
    pub destroy_timeout: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            destroy_timeout: Duration::from_secs(120),
        }
    }
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Instances destroyed (or already gone) during this sweep.
    pub destroyed: Vec<i64>,
    /// Instances whose destroy failed, with the error text.
    pub failed: Vec<(i64, String)>,
    /// Instances still being destroyed when the wait ran out.
    pub timed_out: Vec<i64>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.destroyed.is_empty() && self.failed.is_empty() && self.timed_out.is_empty()
    }
}

/// Background worker that destroys expired instances.
pub struct Sweeper {
    home: Arc<InstanceHome>,
    config: SweeperConfig,
    shutdown: Arc<Notify>,
}

impl Sweeper {
    pub fn new(home: Arc<InstanceHome>, config: SweeperConfig) -> Self {
        Self {
            home,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the sweep loop until the shutdown signal is received.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            destroy_timeout_secs = self.config.destroy_timeout.as_secs(),
            "Termination sweeper started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Termination sweeper received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    match self.sweep_once().await {
                        Ok(report) if !report.is_empty() => {
                            info!(
                                destroyed = report.destroyed.len(),
                                failed = report.failed.len(),
                                timed_out = report.timed_out.len(),
                                "Sweep completed"
                            );
                        }
                        Ok(_) => debug!("Sweep found no expired instances"),
                        Err(e) => error!(error = %e, "Failed to sweep expired instances"),
                    }
                }
            }
        }

        info!("Termination sweeper stopped");
    }

    /// Destroy every instance whose termination time has passed.
    pub async fn sweep_once(&self) -> Result<SweepReport> {
        let now = Utc::now();
        let expired: Vec<i64> = self
            .home
            .sweepable()
            .await?
            .into_iter()
            .filter(|entry| entry.is_expired(now))
            .map(|entry| entry.id)
            .collect();

        let mut report = SweepReport::default();
        if expired.is_empty() {
            return Ok(report);
        }

        debug!(count = expired.len(), "Destroying expired instances");

        let handles: Vec<_> = expired
            .into_iter()
            .map(|id| {
                let home = self.home.clone();
                (id, tokio::spawn(async move { home.destroy(id).await }))
            })
            .collect();

        // Stragglers keep running in the background; only the wait is bounded.
        let deadline = Instant::now() + self.config.destroy_timeout;
        for (id, handle) in handles {
            match tokio::time::timeout_at(deadline, handle).await {
                Ok(Ok(Ok(()))) => {
                    info!(instance_id = id, "Destroyed expired instance");
                    report.destroyed.push(id);
                }
                Ok(Ok(Err(CoreError::DoesNotExist { .. }))) => {
                    debug!(instance_id = id, "Expired instance already gone");
                    report.destroyed.push(id);
                }
                Ok(Ok(Err(e))) => {
                    warn!(instance_id = id, error = %e, "Failed to destroy expired instance");
                    report.failed.push((id, e.to_string()));
                }
                Ok(Err(e)) => {
                    error!(instance_id = id, error = %e, "Destroy task panicked");
                    report.failed.push((id, e.to_string()));
                }
                Err(_) => {
                    warn!(
                        instance_id = id,
                        timeout_secs = self.config.destroy_timeout.as_secs(),
                        "Timed out waiting for expired instance to be destroyed"
                    );
                    report.timed_out.push(id);
                }
            }
        }

        Ok(report)
    }
}
