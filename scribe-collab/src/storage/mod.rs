//! Pluggable persistence for room snapshots.
//!
//! ```text
//! SnapshotManager ──► dyn SnapshotStorage
//!                        ├── DatabaseStorage   (RocksDB: snapshots + room/created_at indexes)
//!                        ├── FilesystemStorage ({root}/{room}/{room}-{version}-{ts}.snapshot)
//!                        └── MemoryStorage     (tests, throwaway servers)
//! ```
//!
//! Backends are synchronous; callers run them on the blocking pool so a slow
//! disk never stalls message delivery. Snapshot blobs are LZ4-compressed at
//! rest.

pub mod fs;
pub mod memory;
pub mod rocks;

pub use fs::FilesystemStorage;
pub use memory::MemoryStorage;
pub use rocks::{DatabaseConfig, DatabaseStorage};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::config::{SnapshotConfig, StorageBackend};
use crate::protocol::{is_valid_room_id, now_millis};

/// A persisted, versioned serialization of a room's document.
///
/// Immutable once created; later snapshots supersede it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub room_id: String,
    /// Full yrs state encoded as a v1 update.
    pub document_state: Vec<u8>,
    pub version: u64,
    /// Creation time, milliseconds since the Unix epoch.
    pub timestamp: u64,
}

impl Snapshot {
    pub fn new(room_id: impl Into<String>, document_state: Vec<u8>, version: u64) -> Self {
        Self {
            room_id: room_id.into(),
            document_state,
            version,
            timestamp: now_millis(),
        }
    }

    /// Identifier derived from room, version and timestamp.
    pub fn id(&self) -> String {
        format!("{}-{}-{}", self.room_id, self.version, self.timestamp)
    }

    /// Newer snapshots win by version, then by timestamp.
    pub fn is_newer_than(&self, other: &Snapshot) -> bool {
        (self.version, self.timestamp) > (other.version, other.timestamp)
    }
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(String),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("snapshot version {version} already exists for room {room_id}")]
    DuplicateVersion { room_id: String, version: u64 },
    #[error("invalid room id: {0:?}")]
    InvalidRoomId(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::Io(e.to_string())
    }
}

/// A snapshot persistence backend.
pub trait SnapshotStorage: Send + Sync {
    /// Persist a snapshot. Fails with `DuplicateVersion` if the room already
    /// has a snapshot with the same version.
    fn save(&self, snapshot: &Snapshot) -> Result<(), StorageError>;

    /// Newest snapshot of a room, if any.
    fn load_latest(&self, room_id: &str) -> Result<Option<Snapshot>, StorageError>;

    /// Stored versions of a room in ascending order.
    fn list_versions(&self, room_id: &str) -> Result<Vec<u64>, StorageError>;

    /// Rooms with at least one stored snapshot.
    fn rooms(&self) -> Result<Vec<String>, StorageError>;

    /// Delete snapshots created before `cutoff_millis`, keeping the newest
    /// snapshot of every room. Returns the number deleted.
    fn delete_older_than(&self, cutoff_millis: u64) -> Result<usize, StorageError>;

    /// Short backend name for logs.
    fn backend(&self) -> &'static str;
}

pub(crate) fn check_room_id(room_id: &str) -> Result<(), StorageError> {
    if is_valid_room_id(room_id) {
        Ok(())
    } else {
        Err(StorageError::InvalidRoomId(room_id.to_string()))
    }
}

pub(crate) fn compress(state: &[u8]) -> Vec<u8> {
    lz4_flex::compress_prepend_size(state)
}

pub(crate) fn decompress(blob: &[u8]) -> Result<Vec<u8>, StorageError> {
    lz4_flex::decompress_size_prepended(blob).map_err(|e| StorageError::Compression(e.to_string()))
}

/// Open the backend selected by the snapshot configuration.
pub fn open_storage(config: &SnapshotConfig) -> Result<Arc<dyn SnapshotStorage>, StorageError> {
    let storage: Arc<dyn SnapshotStorage> = match config.storage {
        StorageBackend::Database => {
            Arc::new(DatabaseStorage::open(DatabaseConfig::new(&config.path))?)
        }
        StorageBackend::Filesystem => Arc::new(FilesystemStorage::open(&config.path)?),
        StorageBackend::Memory => Arc::new(MemoryStorage::new()),
    };
    log::info!(
        "Snapshot storage: {} at {}",
        storage.backend(),
        config.path.display()
    );
    Ok(storage)
}
