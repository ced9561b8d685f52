//! RocksDB-backed snapshot store.
//!
//! Column families:
//! - `snapshots`: `id` → bincode row (LZ4-compressed state, room, version, created_at)
//! - `snapshots_by_room`: `room_id 0x00 version:BE` → `id`
//! - `snapshots_by_created`: `created_at:BE id` → room index key
//!
//! The room index is ordered by version, so the latest snapshot of a room is
//! a single reverse seek. The creation index lets pruning walk only the rows
//! older than the cutoff.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamily, ColumnFamilyDescriptor, DBCompressionType,
    DBWithThreadMode, Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use super::{check_room_id, compress, decompress, Snapshot, SnapshotStorage, StorageError};

const CF_SNAPSHOTS: &str = "snapshots";
const CF_BY_ROOM: &str = "snapshots_by_room";
const CF_BY_CREATED: &str = "snapshots_by_created";

const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_BY_ROOM, CF_BY_CREATED];

const ROOM_SEPARATOR: u8 = 0x00;

/// Database backend configuration.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every snapshot write (default: true)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl DatabaseConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }

    /// Create config for testing (small caches, no fsync).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            block_cache_size: 8 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
            ..Self::new(path)
        }
    }
}

/// Row stored in the `snapshots` column family.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotRow {
    id: String,
    room_id: String,
    /// LZ4-compressed document state
    snapshot_data: Vec<u8>,
    version: u64,
    created_at: u64,
}

impl SnapshotRow {
    fn from_snapshot(snapshot: &Snapshot) -> Self {
        Self {
            id: snapshot.id(),
            room_id: snapshot.room_id.clone(),
            snapshot_data: compress(&snapshot.document_state),
            version: snapshot.version,
            created_at: snapshot.timestamp,
        }
    }

    fn into_snapshot(self) -> Result<Snapshot, StorageError> {
        Ok(Snapshot {
            document_state: decompress(&self.snapshot_data)?,
            room_id: self.room_id,
            version: self.version,
            timestamp: self.created_at,
        })
    }

    fn encode(&self) -> Result<Vec<u8>, StorageError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StorageError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StorageError> {
        let (row, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StorageError::Deserialization(e.to_string()))?;
        Ok(row)
    }
}

impl From<rocksdb::Error> for StorageError {
    fn from(e: rocksdb::Error) -> Self {
        StorageError::Database(e.to_string())
    }
}

/// RocksDB-backed snapshot storage.
pub struct DatabaseStorage {
    db: DBWithThreadMode<SingleThreaded>,
    config: DatabaseConfig,
    /// Serializes the duplicate check with the write that follows it.
    write_lock: Mutex<()>,
}

impl DatabaseStorage {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: DatabaseConfig) -> Result<Self, StorageError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::debug!("Opened snapshot database at {}", config.path.display());

        Ok(Self {
            db,
            config,
            write_lock: Mutex::new(()),
        })
    }

    fn cf_options(name: &str, config: &DatabaseConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            // Blobs are already LZ4 compressed.
            CF_SNAPSHOTS => opts.set_compression_type(DBCompressionType::None),
            _ => opts.set_compression_type(DBCompressionType::Lz4),
        }

        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily, StorageError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StorageError::Database(format!("Column family '{name}' not found")))
    }

    /// `room_id 0x00`
    fn room_prefix(room_id: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(room_id.len() + 1);
        key.extend_from_slice(room_id.as_bytes());
        key.push(ROOM_SEPARATOR);
        key
    }

    /// `room_id 0x00 version:BE`
    fn room_key(room_id: &str, version: u64) -> Vec<u8> {
        let mut key = Self::room_prefix(room_id);
        key.extend_from_slice(&version.to_be_bytes());
        key
    }

    /// `created_at:BE id`
    fn created_key(created_at: u64, id: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(8 + id.len());
        key.extend_from_slice(&created_at.to_be_bytes());
        key.extend_from_slice(id.as_bytes());
        key
    }

    fn split_room_key(key: &[u8]) -> Option<(&[u8], u64)> {
        if key.len() < 9 || key[key.len() - 9] != ROOM_SEPARATOR {
            return None;
        }
        let (room, rest) = key.split_at(key.len() - 9);
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&rest[1..]);
        Some((room, u64::from_be_bytes(buf)))
    }

    /// Room index key of the newest snapshot of a room.
    fn latest_room_key(&self, room_id: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let cf = self.cf(CF_BY_ROOM)?;
        let upper = Self::room_key(room_id, u64::MAX);
        let prefix = Self::room_prefix(room_id);

        let mut iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&upper, Direction::Reverse));
        match iter.next() {
            Some(item) => {
                let (key, _) = item?;
                Ok(key.starts_with(&prefix).then(|| key.to_vec()))
            }
            None => Ok(None),
        }
    }

    fn load_row(&self, id: &[u8]) -> Result<Option<SnapshotRow>, StorageError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        match self.db.get_cf(cf, id)? {
            Some(bytes) => Ok(Some(SnapshotRow::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StorageError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }
}

impl SnapshotStorage for DatabaseStorage {
    fn save(&self, snapshot: &Snapshot) -> Result<(), StorageError> {
        check_room_id(&snapshot.room_id)?;
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let cf_snapshots = self.cf(CF_SNAPSHOTS)?;
        let cf_by_room = self.cf(CF_BY_ROOM)?;
        let cf_by_created = self.cf(CF_BY_CREATED)?;

        let room_key = Self::room_key(&snapshot.room_id, snapshot.version);
        if self.db.get_cf(cf_by_room, &room_key)?.is_some() {
            return Err(StorageError::DuplicateVersion {
                room_id: snapshot.room_id.clone(),
                version: snapshot.version,
            });
        }

        let row = SnapshotRow::from_snapshot(snapshot);
        let mut batch = WriteBatch::default();
        batch.put_cf(cf_snapshots, row.id.as_bytes(), row.encode()?);
        batch.put_cf(cf_by_room, &room_key, row.id.as_bytes());
        batch.put_cf(
            cf_by_created,
            Self::created_key(row.created_at, &row.id),
            &room_key,
        );
        self.write(batch)?;

        log::trace!(
            "Stored snapshot {} ({} bytes compressed)",
            row.id,
            row.snapshot_data.len()
        );
        Ok(())
    }

    fn load_latest(&self, room_id: &str) -> Result<Option<Snapshot>, StorageError> {
        check_room_id(room_id)?;
        let Some(room_key) = self.latest_room_key(room_id)? else {
            return Ok(None);
        };
        let cf_by_room = self.cf(CF_BY_ROOM)?;
        let Some(id) = self.db.get_cf(cf_by_room, &room_key)? else {
            return Ok(None);
        };
        match self.load_row(&id)? {
            Some(row) => Ok(Some(row.into_snapshot()?)),
            None => Err(StorageError::Database(format!(
                "index entry for {room_id} points at missing snapshot"
            ))),
        }
    }

    fn list_versions(&self, room_id: &str) -> Result<Vec<u64>, StorageError> {
        check_room_id(room_id)?;
        let cf = self.cf(CF_BY_ROOM)?;
        let prefix = Self::room_prefix(room_id);

        let mut versions = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            if let Some((_, version)) = Self::split_room_key(&key) {
                versions.push(version);
            }
        }
        Ok(versions)
    }

    fn rooms(&self) -> Result<Vec<String>, StorageError> {
        let cf = self.cf(CF_BY_ROOM)?;
        let mut rooms: Vec<String> = Vec::new();

        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            let Some((room, _)) = Self::split_room_key(&key) else {
                continue;
            };
            let room = String::from_utf8_lossy(room);
            if rooms.last().map(String::as_str) != Some(&*room) {
                rooms.push(room.into_owned());
            }
        }
        Ok(rooms)
    }

    fn delete_older_than(&self, cutoff_millis: u64) -> Result<usize, StorageError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let cf_snapshots = self.cf(CF_SNAPSHOTS)?;
        let cf_by_room = self.cf(CF_BY_ROOM)?;
        let cf_by_created = self.cf(CF_BY_CREATED)?;

        let mut newest: HashMap<Vec<u8>, Option<Vec<u8>>> = HashMap::new();
        let mut batch = WriteBatch::default();
        let mut deleted = 0usize;

        for item in self.db.iterator_cf(cf_by_created, IteratorMode::Start) {
            let (created_key, room_key) = item?;
            if created_key.len() < 8 {
                continue;
            }
            let mut ts = [0u8; 8];
            ts.copy_from_slice(&created_key[..8]);
            if u64::from_be_bytes(ts) >= cutoff_millis {
                break;
            }

            let Some((room, _)) = Self::split_room_key(&room_key) else {
                continue;
            };
            if !newest.contains_key(room) {
                let room_id = String::from_utf8_lossy(room).into_owned();
                newest.insert(room.to_vec(), self.latest_room_key(&room_id)?);
            }
            if newest.get(room).and_then(Option::as_deref) == Some(&room_key[..]) {
                continue;
            }

            batch.delete_cf(cf_snapshots, &created_key[8..]);
            batch.delete_cf(cf_by_room, &room_key);
            batch.delete_cf(cf_by_created, &created_key);
            deleted += 1;
        }

        if deleted > 0 {
            self.write(batch)?;
        }
        Ok(deleted)
    }

    fn backend(&self) -> &'static str {
        "database"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::conformance;
    use std::cell::Cell;

    fn open(path: &Path) -> DatabaseStorage {
        DatabaseStorage::open(DatabaseConfig::for_testing(path)).unwrap()
    }

    #[test]
    fn test_conformance() {
        let dir = tempfile::tempdir().unwrap();
        let n = Cell::new(0);
        conformance::run_all(|| {
            n.set(n.get() + 1);
            open(&dir.path().join(n.get().to_string()))
        });
    }

    #[test]
    fn test_open_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        let store = open(&path);
        assert!(store.path().exists());
        assert_eq!(store.backend(), "database");
    }

    #[test]
    fn test_snapshots_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        {
            let store = open(&path);
            store
                .save(&conformance::snapshot("doc", 7, 1_000, b"persisted"))
                .unwrap();
        }
        let store = open(&path);
        let loaded = store.load_latest("doc").unwrap().unwrap();
        assert_eq!(loaded.version, 7);
        assert_eq!(loaded.document_state, b"persisted");
        assert_eq!(store.rooms().unwrap(), vec!["doc".to_string()]);
    }

    #[test]
    fn test_room_key_layout() {
        let key = DatabaseStorage::room_key("abc", 258);
        assert_eq!(&key[..4], b"abc\0");
        assert_eq!(DatabaseStorage::split_room_key(&key), Some((&b"abc"[..], 258)));
        assert_eq!(DatabaseStorage::split_room_key(b"short"), None);
    }

    #[test]
    fn test_large_snapshot_compresses() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir.path().join("db"));
        let state = vec![42u8; 1_000_000];
        store
            .save(&conformance::snapshot("big", 1, 5, &state))
            .unwrap();

        let row = store
            .load_row(b"big-1-5")
            .unwrap()
            .expect("row stored under its id");
        assert!(row.snapshot_data.len() < 100_000);
        assert_eq!(store.load_latest("big").unwrap().unwrap().document_state, state);
    }
}
