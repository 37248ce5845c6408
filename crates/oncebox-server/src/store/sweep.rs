//! Expiry reclamation.
//!
//! Stale records are evicted lazily whenever `peek` or `reveal` touches them,
//! and in bulk by a periodic sweep that bounds growth from secrets nobody
//! ever opens. Both paths delete through `Backend::delete_if_expired`, the
//! same atomic primitive a reveal uses, so a sweep never steals a record a
//! reveal has already claimed or vice versa.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::{task::JoinHandle, time};
use tracing::{debug, info, warn};

use super::codec;
use super::vault::Vault;
use crate::error::Result;
use crate::handle::Handle;

impl Vault {
    /// Lazy path: drop `key` if it is past its expiry at `now`.
    pub(crate) fn evict_stale(&self, key: &str, now: DateTime<Utc>) -> Result<()> {
        if self.backend.delete_if_expired(key, now)? {
            debug!(handle = %key, "lazy-evicted expired secret");
        }
        Ok(())
    }

    /// Remove every expired record. Returns the handles removed by this pass.
    pub fn prune(&self) -> Result<Vec<Handle>> {
        let now = self.now();
        let mut removed = Vec::new();

        for (key, raw) in self.backend.scan()? {
            match codec::decode(&raw) {
                Ok(record) if record.is_expired(now) => {}
                Ok(_) => continue,
                Err(e) => {
                    warn!(key = %key, error = %e, "skipping undecodable record");
                    continue;
                }
            }
            // A reveal may win the race between scan and delete; that's fine.
            if !self.backend.delete_if_expired(&key, now)? {
                continue;
            }
            match key.parse::<Handle>() {
                Ok(handle) => removed.push(handle),
                Err(_) => warn!(key = %key, "removed expired entry with a non-handle key"),
            }
        }

        if !removed.is_empty() {
            info!(removed = removed.len(), "pruned expired secrets");
        }
        Ok(removed)
    }

    /// Spawn a background task that calls `prune()` every `interval`.
    /// Backend I/O runs on the blocking pool.
    pub fn spawn_sweep(self, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.tick().await; // skip first immediate tick
            loop {
                ticker.tick().await;
                let vault = self.clone();
                match tokio::task::spawn_blocking(move || vault.prune()).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => warn!(error = %e, "background sweep error"),
                    Err(e) => warn!(error = %e, "background sweep task failed"),
                }
            }
        })
    }
}
