//! Filesystem snapshot store.
//!
//! One directory per room; each snapshot is a single LZ4-compressed file
//! named `{room_id}-{version}-{timestamp}.snapshot`. Writes go to a temp file
//! first and are renamed into place, so a crash never leaves a torn snapshot
//! under a real name.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use super::{check_room_id, compress, decompress, Snapshot, SnapshotStorage, StorageError};

const EXTENSION: &str = "snapshot";
const TEMP_SUFFIX: &str = ".tmp";

/// Snapshot storage rooted at a directory.
pub struct FilesystemStorage {
    root: PathBuf,
    write_lock: Mutex<()>,
}

/// `(version, timestamp, path)` of a stored snapshot file.
type Entry = (u64, u64, PathBuf);

impl FilesystemStorage {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn room_dir(&self, room_id: &str) -> PathBuf {
        self.root.join(room_id)
    }

    /// Parse `{room_id}-{version}-{timestamp}.snapshot`. The room prefix is
    /// stripped rather than split on, since room ids may contain dashes.
    fn parse_file_name(room_id: &str, name: &str) -> Option<(u64, u64)> {
        let stem = name.strip_suffix(EXTENSION)?.strip_suffix('.')?;
        let rest = stem.strip_prefix(room_id)?.strip_prefix('-')?;
        let (version, timestamp) = rest.split_once('-')?;
        Some((version.parse().ok()?, timestamp.parse().ok()?))
    }

    /// Snapshot files of a room, sorted by (version, timestamp).
    fn entries(&self, room_id: &str) -> Result<Vec<Entry>, StorageError> {
        let dir = self.room_dir(room_id);
        let read_dir = match fs::read_dir(&dir) {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        for dir_entry in read_dir {
            let dir_entry = dir_entry?;
            let name = dir_entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some((version, timestamp)) = Self::parse_file_name(room_id, name) {
                entries.push((version, timestamp, dir_entry.path()));
            }
        }
        entries.sort();
        Ok(entries)
    }

    fn read_snapshot(room_id: &str, entry: &Entry) -> Result<Snapshot, StorageError> {
        let (version, timestamp, path) = entry;
        let blob = fs::read(path)?;
        Ok(Snapshot {
            room_id: room_id.to_string(),
            document_state: decompress(&blob)?,
            version: *version,
            timestamp: *timestamp,
        })
    }
}

impl SnapshotStorage for FilesystemStorage {
    fn save(&self, snapshot: &Snapshot) -> Result<(), StorageError> {
        check_room_id(&snapshot.room_id)?;
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        if self
            .entries(&snapshot.room_id)?
            .iter()
            .any(|(version, _, _)| *version == snapshot.version)
        {
            return Err(StorageError::DuplicateVersion {
                room_id: snapshot.room_id.clone(),
                version: snapshot.version,
            });
        }

        let dir = self.room_dir(&snapshot.room_id);
        fs::create_dir_all(&dir)?;

        let file_name = format!("{}.{EXTENSION}", snapshot.id());
        let final_path = dir.join(&file_name);
        let temp_path = dir.join(format!("{file_name}{TEMP_SUFFIX}"));

        let mut file = fs::File::create(&temp_path)?;
        file.write_all(&compress(&snapshot.document_state))?;
        file.sync_all()?;
        drop(file);
        fs::rename(&temp_path, &final_path)?;

        log::trace!("Wrote snapshot {}", final_path.display());
        Ok(())
    }

    fn load_latest(&self, room_id: &str) -> Result<Option<Snapshot>, StorageError> {
        check_room_id(room_id)?;
        match self.entries(room_id)?.last() {
            Some(entry) => Ok(Some(Self::read_snapshot(room_id, entry)?)),
            None => Ok(None),
        }
    }

    fn list_versions(&self, room_id: &str) -> Result<Vec<u64>, StorageError> {
        check_room_id(room_id)?;
        Ok(self
            .entries(room_id)?
            .into_iter()
            .map(|(version, _, _)| version)
            .collect())
    }

    fn rooms(&self) -> Result<Vec<String>, StorageError> {
        let mut rooms = Vec::new();
        for dir_entry in fs::read_dir(&self.root)? {
            let dir_entry = dir_entry?;
            if !dir_entry.file_type()?.is_dir() {
                continue;
            }
            let Some(room_id) = dir_entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if !self.entries(&room_id)?.is_empty() {
                rooms.push(room_id);
            }
        }
        Ok(rooms)
    }

    fn delete_older_than(&self, cutoff_millis: u64) -> Result<usize, StorageError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut deleted = 0;
        for room_id in self.rooms()? {
            let mut entries = self.entries(&room_id)?;
            // Newest stays regardless of age.
            entries.pop();
            for (_, timestamp, path) in entries {
                if timestamp < cutoff_millis {
                    fs::remove_file(&path)?;
                    deleted += 1;
                }
            }
        }
        Ok(deleted)
    }

    fn backend(&self) -> &'static str {
        "filesystem"
    }
}
