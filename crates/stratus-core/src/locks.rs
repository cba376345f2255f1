// Copyright (C) 2025 The Stratus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-instance mutual exclusion.
//!
//! Every instance has two named locks: the primary lock (`"{id}"`) and the
//! destroy lock (`"destroy_{id}"`). [`LockManager::acquire`] is the only way
//! to take them and always takes the destroy lock first, so no caller can
//! invert the order. Waiting is interruptible: the optional timeout and
//! [`LockManager::shutdown`] both turn a pending wait into
//! [`Error::LockAcquisitionFailure`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, watch};
use tracing::debug;

use crate::error::{Error, Result};

type NamedLock = Arc<AsyncMutex<()>>;

/// Both locks of one instance, held together.
///
/// Dropping the guard releases the primary lock, then the destroy lock.
pub struct InstanceGuard {
    id: i64,
    _primary: OwnedMutexGuard<()>,
    _destroy: OwnedMutexGuard<()>,
}

impl InstanceGuard {
    pub fn instance_id(&self) -> i64 {
        self.id
    }
}

/// Registry of named async locks.
pub struct LockManager {
    locks: Mutex<HashMap<String, NamedLock>>,
    timeout: Option<Duration>,
    shutdown: watch::Sender<bool>,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new(None)
    }
}

impl LockManager {
    /// Create a lock manager; `timeout` bounds every wait when set.
    pub fn new(timeout: Option<Duration>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            locks: Mutex::new(HashMap::new()),
            timeout,
            shutdown,
        }
    }

    pub fn primary_key(id: i64) -> String {
        id.to_string()
    }

    pub fn destroy_key(id: i64) -> String {
        format!("destroy_{}", id)
    }

    /// Acquire the destroy lock and then the primary lock of an instance.
    pub async fn acquire(&self, id: i64) -> Result<InstanceGuard> {
        let destroy = self.acquire_key(Self::destroy_key(id)).await?;
        let primary = self.acquire_key(Self::primary_key(id)).await?;
        Ok(InstanceGuard {
            id,
            _primary: primary,
            _destroy: destroy,
        })
    }

    /// Drop the lock entries of a destroyed instance.
    ///
    /// Tasks still holding or waiting on the old locks keep them alive until
    /// they finish.
    pub fn forget(&self, id: i64) {
        if let Ok(mut locks) = self.locks.lock() {
            locks.remove(&Self::primary_key(id));
            locks.remove(&Self::destroy_key(id));
        }
    }

    /// Fail all pending and future acquisitions.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn named(&self, key: &str) -> Result<NamedLock> {
        let mut locks = self.locks.lock().map_err(|_| Error::LockAcquisitionFailure {
            key: key.to_string(),
            reason: "lock registry poisoned".to_string(),
        })?;
        Ok(locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone())
    }

    async fn acquire_key(&self, key: String) -> Result<OwnedMutexGuard<()>> {
        let failure = |reason: &str| Error::LockAcquisitionFailure {
            key: key.clone(),
            reason: reason.to_string(),
        };

        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow_and_update() {
            return Err(failure("lock manager is shut down"));
        }

        let lock = self.named(&key)?;
        let wait = async {
            match self.timeout {
                Some(limit) => tokio::time::timeout(limit, lock.lock_owned()).await.ok(),
                None => Some(lock.lock_owned().await),
            }
        };

        tokio::select! {
            biased;

            _ = wait_for_shutdown(&mut shutdown) => {
                debug!(key = %key, "Lock wait interrupted by shutdown");
                Err(failure("lock manager is shut down"))
            }

            guard = wait => guard.ok_or_else(|| failure("timed out waiting for lock")),
        }
    }
}

async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
