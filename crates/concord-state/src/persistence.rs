//! Persistence adapter - snapshot load/save against host storage

use std::sync::Arc;

use tokio::sync::Mutex;

use concord_core::{now_millis, ConcordResult, StateSnapshot};
use concord_transport::Storage;
use concord_wire::{decode_snapshot, encode_snapshot};

use crate::StateStore;

/// Default storage key for the persisted record
pub const DEFAULT_STORAGE_KEY: &str = "concord.state";

/// What a flush did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing dirty; storage untouched
    Clean,
    /// Snapshot at this version written
    Saved { version: u64 },
}

/// Loads and saves whole-state snapshots under a single key
pub struct PersistenceAdapter {
    storage: Arc<dyn Storage>,
    key: String,
    /// One write in flight at a time
    write_lock: Mutex<()>,
}

impl PersistenceAdapter {
    pub fn new(storage: Arc<dyn Storage>, key: impl Into<String>) -> Self {
        PersistenceAdapter {
            storage,
            key: key.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Load the persisted snapshot
    ///
    /// Returns `Ok(None)` when nothing was ever saved. A record that fails
    /// to decode is reported as an error; the caller decides whether to
    /// fall back to defaults.
    pub async fn load(&self) -> ConcordResult<Option<StateSnapshot>> {
        let Some(raw) = self.storage.read(&self.key).await? else {
            return Ok(None);
        };
        let snapshot = decode_snapshot(&raw)?;
        tracing::debug!(
            key = %self.key,
            version = snapshot.version,
            "loaded persisted state"
        );
        Ok(Some(snapshot))
    }

    /// Write a snapshot, replacing the previous record
    pub async fn save(&self, snapshot: &StateSnapshot) -> ConcordResult<()> {
        let _guard = self.write_lock.lock().await;
        self.write(snapshot).await
    }

    async fn write(&self, snapshot: &StateSnapshot) -> ConcordResult<()> {
        let encoded = encode_snapshot(snapshot, now_millis())?;
        self.storage.write(&self.key, &encoded).await
    }

    /// Save the store if anything is dirty
    ///
    /// On failure the dirty marks are kept so the next flush retries.
    pub async fn flush(&self, store: &StateStore) -> ConcordResult<FlushOutcome> {
        // Snapshot under the lock so an older snapshot never lands last
        let _guard = self.write_lock.lock().await;
        if !store.is_dirty() {
            return Ok(FlushOutcome::Clean);
        }

        let snapshot = store.snapshot();
        match self.write(&snapshot).await {
            Ok(()) => {
                store.mark_persisted(&snapshot);
                tracing::debug!(
                    context = %store.context(),
                    version = snapshot.version,
                    "persisted state"
                );
                Ok(FlushOutcome::Saved {
                    version: snapshot.version,
                })
            }
            Err(e) => {
                tracing::warn!(
                    context = %store.context(),
                    version = snapshot.version,
                    error = %e,
                    "persist failed; state stays dirty"
                );
                Err(e)
            }
        }
    }
}
