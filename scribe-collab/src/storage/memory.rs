//! In-memory snapshot store for tests and throwaway servers.

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

use super::{check_room_id, Snapshot, SnapshotStorage, StorageError};

/// Snapshots keyed by room, then version.
#[derive(Default)]
pub struct MemoryStorage {
    rooms: RwLock<HashMap<String, BTreeMap<u64, Snapshot>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored snapshots.
    pub fn len(&self) -> usize {
        self.rooms
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(BTreeMap::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SnapshotStorage for MemoryStorage {
    fn save(&self, snapshot: &Snapshot) -> Result<(), StorageError> {
        check_room_id(&snapshot.room_id)?;
        let mut rooms = self.rooms.write().unwrap_or_else(PoisonError::into_inner);
        let versions = rooms.entry(snapshot.room_id.clone()).or_default();
        if versions.contains_key(&snapshot.version) {
            return Err(StorageError::DuplicateVersion {
                room_id: snapshot.room_id.clone(),
                version: snapshot.version,
            });
        }
        versions.insert(snapshot.version, snapshot.clone());
        Ok(())
    }

    fn load_latest(&self, room_id: &str) -> Result<Option<Snapshot>, StorageError> {
        check_room_id(room_id)?;
        let rooms = self.rooms.read().unwrap_or_else(PoisonError::into_inner);
        Ok(rooms
            .get(room_id)
            .and_then(|versions| versions.values().next_back())
            .cloned())
    }

    fn list_versions(&self, room_id: &str) -> Result<Vec<u64>, StorageError> {
        check_room_id(room_id)?;
        let rooms = self.rooms.read().unwrap_or_else(PoisonError::into_inner);
        Ok(rooms
            .get(room_id)
            .map(|versions| versions.keys().copied().collect())
            .unwrap_or_default())
    }

    fn rooms(&self) -> Result<Vec<String>, StorageError> {
        let rooms = self.rooms.read().unwrap_or_else(PoisonError::into_inner);
        Ok(rooms
            .iter()
            .filter(|(_, versions)| !versions.is_empty())
            .map(|(room_id, _)| room_id.clone())
            .collect())
    }

    fn delete_older_than(&self, cutoff_millis: u64) -> Result<usize, StorageError> {
        let mut rooms = self.rooms.write().unwrap_or_else(PoisonError::into_inner);
        let mut deleted = 0;
        for versions in rooms.values_mut() {
            let newest = versions.keys().next_back().copied();
            let before = versions.len();
            versions.retain(|version, snapshot| {
                Some(*version) == newest || snapshot.timestamp >= cutoff_millis
            });
            deleted += before - versions.len();
        }
        Ok(deleted)
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
