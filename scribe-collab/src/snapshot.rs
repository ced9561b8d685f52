//! Snapshot lifecycle: create, cache, load, save, prune.
//!
//! ```text
//! RoomManager ──► SnapshotManager ──(spawn_blocking)──► dyn SnapshotStorage
//!                       │
//!                       └── cache: room_id → latest Snapshot
//! ```
//!
//! Reads never fail a join: a storage error is logged and the room starts
//! from whatever the cache has (or nothing). Writes surface their error so
//! the caller can keep the room dirty and retry on the next pass.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use crate::protocol::now_millis;
use crate::storage::{Snapshot, SnapshotStorage, StorageError};
use crate::sync::{RoomDocument, SyncError};

/// Snapshot counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotStats {
    pub saved: u64,
    pub save_failures: u64,
    pub load_failures: u64,
    pub pruned: u64,
}

#[derive(Default)]
struct Counters {
    saved: AtomicU64,
    save_failures: AtomicU64,
    load_failures: AtomicU64,
    pruned: AtomicU64,
}

/// Creates, caches and persists room snapshots.
pub struct SnapshotManager {
    storage: Option<Arc<dyn SnapshotStorage>>,
    cache: RwLock<HashMap<String, Snapshot>>,
    counters: Counters,
}

impl SnapshotManager {
    /// Manager backed by `storage`.
    pub fn new(storage: Arc<dyn SnapshotStorage>) -> Self {
        Self::with_storage(Some(storage))
    }

    /// Manager with no durable storage; snapshots live in the cache only.
    pub fn in_memory() -> Self {
        Self::with_storage(None)
    }

    pub fn with_storage(storage: Option<Arc<dyn SnapshotStorage>>) -> Self {
        Self {
            storage,
            cache: RwLock::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    pub fn storage(&self) -> Option<&Arc<dyn SnapshotStorage>> {
        self.storage.as_ref()
    }

    /// Build a snapshot and record it in the cache.
    ///
    /// The cache keeps the newest snapshot per room; an older one never
    /// replaces it.
    pub fn create_snapshot(&self, room_id: &str, state: Vec<u8>, version: u64) -> Snapshot {
        let snapshot = Snapshot::new(room_id, state, version);
        self.cache_snapshot(&snapshot);
        snapshot
    }

    fn cache_snapshot(&self, snapshot: &Snapshot) {
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        match cache.get(&snapshot.room_id) {
            Some(existing) if !snapshot.is_newer_than(existing) => {}
            _ => {
                cache.insert(snapshot.room_id.clone(), snapshot.clone());
            }
        }
    }

    pub fn cached(&self, room_id: &str) -> Option<Snapshot> {
        let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
        cache.get(room_id).cloned()
    }

    pub fn cached_count(&self) -> usize {
        self.cache.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Forget a room's cached snapshot. Without durable storage the cache is
    /// the only copy, so nothing is evicted.
    pub fn evict(&self, room_id: &str) -> bool {
        if self.storage.is_none() {
            return false;
        }
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        cache.remove(room_id).is_some()
    }

    /// Latest snapshot of a room, from the cache or else from storage.
    ///
    /// Storage failures are logged and reported as "no snapshot".
    pub async fn load_snapshot(&self, room_id: &str) -> Option<Snapshot> {
        if let Some(snapshot) = self.cached(room_id) {
            log::trace!("Snapshot cache hit for room {room_id}");
            return Some(snapshot);
        }

        let storage = self.storage.clone()?;
        let room = room_id.to_string();
        let result = tokio::task::spawn_blocking(move || storage.load_latest(&room)).await;

        match result {
            Ok(Ok(Some(snapshot))) => {
                log::debug!(
                    "Loaded snapshot v{} for room {room_id} from storage",
                    snapshot.version
                );
                self.cache_snapshot(&snapshot);
                Some(snapshot)
            }
            Ok(Ok(None)) => None,
            Ok(Err(e)) => {
                self.counters.load_failures.fetch_add(1, Ordering::Relaxed);
                log::warn!("Failed to load snapshot for room {room_id}: {e}");
                None
            }
            Err(e) => {
                self.counters.load_failures.fetch_add(1, Ordering::Relaxed);
                log::warn!("Snapshot load task for room {room_id} failed: {e}");
                None
            }
        }
    }

    /// Persist a snapshot and cache it.
    ///
    /// The cache is updated even when the write fails, so the room can still
    /// be rematerialized in this process.
    pub async fn save_snapshot(&self, snapshot: Snapshot) -> Result<(), StorageError> {
        self.cache_snapshot(&snapshot);

        let Some(storage) = self.storage.clone() else {
            self.counters.saved.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        };

        let room_id = snapshot.room_id.clone();
        let version = snapshot.version;
        let result = tokio::task::spawn_blocking(move || storage.save(&snapshot))
            .await
            .unwrap_or_else(|e| Err(StorageError::Unavailable(e.to_string())));

        match &result {
            Ok(()) => {
                self.counters.saved.fetch_add(1, Ordering::Relaxed);
                log::info!("Saved snapshot v{version} for room {room_id}");
            }
            Err(e) => {
                self.counters.save_failures.fetch_add(1, Ordering::Relaxed);
                log::error!("Failed to save snapshot v{version} for room {room_id}: {e}");
            }
        }
        result
    }

    /// Merge a snapshot into a document.
    pub fn apply_snapshot(document: &mut RoomDocument, snapshot: &Snapshot) -> Result<(), SyncError> {
        document.merge_snapshot(&snapshot.document_state, snapshot.version)
    }

    /// Drop snapshots older than `max_age`, from the cache and from storage.
    ///
    /// The newest stored snapshot of every room survives. Cached entries are
    /// only evicted when durable storage can serve them again.
    pub async fn cleanup_old_snapshots(&self, max_age: Duration) -> Result<usize, StorageError> {
        let cutoff = now_millis().saturating_sub(max_age.as_millis() as u64);

        let Some(storage) = self.storage.clone() else {
            return Ok(0);
        };

        let evicted = {
            let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
            let before = cache.len();
            cache.retain(|_, snapshot| snapshot.timestamp >= cutoff);
            before - cache.len()
        };

        let deleted = tokio::task::spawn_blocking(move || storage.delete_older_than(cutoff))
            .await
            .unwrap_or_else(|e| Err(StorageError::Unavailable(e.to_string())))?;

        self.counters.pruned.fetch_add(deleted as u64, Ordering::Relaxed);
        if deleted > 0 || evicted > 0 {
            log::info!("Pruned {deleted} stored snapshots, evicted {evicted} cached");
        }
        Ok(deleted)
    }

    pub fn stats(&self) -> SnapshotStats {
        SnapshotStats {
            saved: self.counters.saved.load(Ordering::Relaxed),
            save_failures: self.counters.save_failures.load(Ordering::Relaxed),
            load_failures: self.counters.load_failures.load(Ordering::Relaxed),
            pruned: self.counters.pruned.load(Ordering::Relaxed),
        }
    }
}
