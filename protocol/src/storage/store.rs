//! The persisted request map backing each storage service.
//!
//! A [`DataStore`] is a `hash → latest request` map with three jobs:
//!
//! 1. **One coarse lock.** The add/remove decision is a compound
//!    check-then-write over a single entry, so the whole map sits behind one
//!    mutex per store. Stores are sharded by payload-type name, which bounds
//!    contention; do not "improve" this into per-key locking without
//!    re-proving the atomicity of the validation sequence.
//! 2. **Rate-limited persistence.** Gossip can hit a store hundreds of
//!    times a second; disk must not be hit at that rate. A write inside the
//!    minimum interval marks the store dirty and is coalesced into the next
//!    flush instead of being dropped.
//! 3. **Pruning on load.** Persisted snapshots are filtered before use:
//!    entries beyond the hard age limit or past their own TTL are dropped,
//!    and the newest `max_map_size` entries win if the snapshot is
//!    oversized. Live inserts enforce the cap reactively at add time.

use parking_lot::{Mutex, MutexGuard};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{now_millis, MAX_AGE, MIN_PERSIST_INTERVAL};
use crate::crypto::ContentHash;

/// Persisted blob key inside the store's sled tree.
const MAP_KEY: &[u8] = b"map";

/// Errors raised by store persistence. Validation of requests never lands
/// here; those are [`DataStorageResult`](super::result::DataStorageResult)s.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("store serialization error: {0}")]
    Serialization(String),
}

/// Behavior every stored request type (add or remove, authenticated or
/// mailbox) must expose to the generic map machinery.
pub trait DataRequest:
    Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// The sequence number later requests must exceed to supersede this
    /// entry. A stored remove request reports `u32::MAX`: once a key is
    /// removed it can never be re-added.
    fn sequence_number(&self) -> u32;

    /// Creation timestamp in Unix milliseconds. Used for pruning order and
    /// age limits only, never for conflict resolution.
    fn created_at(&self) -> u64;

    /// Whether the request's payload has outlived its TTL.
    fn is_expired(&self) -> bool;

    /// True for add requests, false for tombstones.
    fn is_add(&self) -> bool;
}

/// The persisted `hash → latest request` map of one store.
pub struct DataStore<R: DataRequest> {
    store_key: String,
    max_map_size: usize,
    map: Mutex<HashMap<ContentHash, R>>,
    tree: sled::Tree,
    dirty: AtomicBool,
    last_persist: Mutex<Instant>,
}

impl<R: DataRequest> DataStore<R> {
    /// Open a store over a sled tree, applying the persisted snapshot after
    /// pruning it.
    pub fn open(tree: sled::Tree, store_key: String, max_map_size: usize) -> Result<Self, StoreError> {
        let persisted: Vec<(ContentHash, R)> = match tree.get(MAP_KEY)? {
            Some(bytes) => bincode::deserialize(&bytes)
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
            None => Vec::new(),
        };
        let before = persisted.len();
        let pruned = maybe_prune_map(persisted, max_map_size, now_millis());
        if pruned.len() != before {
            debug!(
                store = %store_key,
                kept = pruned.len(),
                dropped = before - pruned.len(),
                "pruned persisted store snapshot"
            );
        }

        // Backdate the last-write mark so the first persist after open goes
        // straight to disk; only subsequent writes are rate-limited.
        let backdated = Instant::now()
            .checked_sub(MIN_PERSIST_INTERVAL)
            .unwrap_or_else(Instant::now);

        Ok(Self {
            store_key,
            max_map_size,
            map: Mutex::new(pruned.into_iter().collect()),
            tree,
            dirty: AtomicBool::new(false),
            last_persist: Mutex::new(backdated),
        })
    }

    pub fn store_key(&self) -> &str {
        &self.store_key
    }

    pub fn max_map_size(&self) -> usize {
        self.max_map_size
    }

    /// Take the store lock. Every compound check-then-write sequence in the
    /// storage services runs under this single guard.
    pub fn lock_map(&self) -> MutexGuard<'_, HashMap<ContentHash, R>> {
        self.map.lock()
    }

    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Request persistence of the current map state.
    ///
    /// If the minimum interval since the last disk write has elapsed, the
    /// snapshot is written immediately; otherwise the store is marked dirty
    /// and the next [`flush_if_dirty`](Self::flush_if_dirty) picks it up.
    pub fn persist(&self) {
        let mut last = self.last_persist.lock();
        if last.elapsed() >= MIN_PERSIST_INTERVAL {
            *last = Instant::now();
            drop(last);
            self.dirty.store(false, Ordering::Release);
            if let Err(e) = self.write_snapshot() {
                warn!(store = %self.store_key, error = %e, "store persistence failed");
            }
        } else {
            self.dirty.store(true, Ordering::Release);
        }
    }

    /// Write the snapshot if a coalesced persist request is pending. Called
    /// by the periodic flush task and on shutdown.
    pub fn flush_if_dirty(&self) {
        if self.dirty.swap(false, Ordering::AcqRel) {
            *self.last_persist.lock() = Instant::now();
            if let Err(e) = self.write_snapshot() {
                warn!(store = %self.store_key, error = %e, "store flush failed");
            }
        }
    }

    /// True if a persist request is waiting for the next flush.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    fn write_snapshot(&self) -> Result<(), StoreError> {
        let snapshot: Vec<(ContentHash, R)> = {
            let map = self.map.lock();
            map.iter().map(|(k, v)| (*k, v.clone())).collect()
        };
        let bytes =
            bincode::serialize(&snapshot).map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.tree.insert(MAP_KEY, bytes)?;
        self.tree.flush()?;
        Ok(())
    }
}

/// Prune a persisted snapshot: drop entries beyond the hard age limit, drop
/// add entries whose own TTL has lapsed, and keep at most `max_map_size`
/// entries preferring the newest by creation time.
pub fn maybe_prune_map<R: DataRequest>(
    entries: Vec<(ContentHash, R)>,
    max_map_size: usize,
    now: u64,
) -> Vec<(ContentHash, R)> {
    let max_age_millis = MAX_AGE.as_millis() as u64;
    let mut kept: Vec<(ContentHash, R)> = entries
        .into_iter()
        .filter(|(_, request)| now.saturating_sub(request.created_at()) <= max_age_millis)
        .filter(|(_, request)| !(request.is_add() && request.is_expired()))
        .collect();
    kept.sort_by(|a, b| b.1.created_at().cmp(&a.1.created_at()));
    kept.truncate(max_map_size);
    kept
}
