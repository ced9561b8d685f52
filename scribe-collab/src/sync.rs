//! Authoritative CRDT state, one yrs `Doc` per room.
//!
//! ```text
//! SyncEngine
//!   documents: RwLock<HashMap<room_id, Arc<Mutex<RoomDocument>>>>
//!                │ (registry lock: lookup/insert/remove only)
//!                ▼
//!        RoomDocument { doc, version, updates_since_snapshot }
//!                (per-room lock: held for the duration of one merge)
//! ```
//!
//! Updates commute, so the engine never orders or rebases them. It only
//! merges and keeps a monotonic per-room version for snapshot bookkeeping.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use thiserror::Error;
use yrs::updates::decoder::Decode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use crate::protocol::ErrorCode;

/// Sync engine errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// The encoded update is structurally corrupt.
    #[error("corrupt update: {0}")]
    Merge(String),
    /// No document is materialized for the room.
    #[error("no document for room {0}")]
    UnknownRoom(String),
}

impl SyncError {
    pub fn code(&self) -> ErrorCode {
        match self {
            SyncError::Merge(_) => ErrorCode::MergeError,
            SyncError::UnknownRoom(_) => ErrorCode::RoomUnavailable,
        }
    }
}

/// Decode a v1 update and merge it into `doc`.
pub fn merge_update(doc: &Doc, update: &[u8]) -> Result<(), SyncError> {
    let update = Update::decode_v1(update).map_err(|e| SyncError::Merge(e.to_string()))?;
    let mut txn = doc.transact_mut();
    txn.apply_update(update)
        .map_err(|e| SyncError::Merge(e.to_string()))
}

/// Encode the whole document as a single update from the empty state.
pub fn encode_state(doc: &Doc) -> Vec<u8> {
    let txn = doc.transact();
    txn.encode_state_as_update_v1(&StateVector::default())
}

/// In-memory document of one room.
pub struct RoomDocument {
    doc: Doc,
    version: u64,
    updates_since_snapshot: u64,
}

impl Default for RoomDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl RoomDocument {
    pub fn new() -> Self {
        Self {
            doc: Doc::new(),
            version: 0,
            updates_since_snapshot: 0,
        }
    }

    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn updates_since_snapshot(&self) -> u64 {
        self.updates_since_snapshot
    }

    /// Merge raw snapshot bytes without counting them as an edit.
    ///
    /// The version only moves forward: a stale snapshot never lowers it.
    pub fn merge_snapshot(&mut self, state: &[u8], version: u64) -> Result<(), SyncError> {
        merge_update(&self.doc, state)?;
        self.version = self.version.max(version);
        Ok(())
    }

    /// Merge a client update and return the new version.
    pub fn apply(&mut self, update: &[u8]) -> Result<u64, SyncError> {
        merge_update(&self.doc, update)?;
        self.version += 1;
        self.updates_since_snapshot += 1;
        Ok(self.version)
    }

    pub fn encode_full_state(&self) -> Vec<u8> {
        encode_state(&self.doc)
    }

    /// Commit a snapshot point: bump the version and reset the edit counter.
    ///
    /// Returns the state and the version the snapshot must carry.
    pub fn commit_snapshot(&mut self) -> (Vec<u8>, u64) {
        self.version += 1;
        self.updates_since_snapshot = 0;
        (self.encode_full_state(), self.version)
    }

    /// Flag the document as having unsaved changes (after a failed write).
    pub fn mark_dirty(&mut self) {
        self.updates_since_snapshot = self.updates_since_snapshot.max(1);
    }
}

/// Registry of room documents.
#[derive(Default)]
pub struct SyncEngine {
    documents: RwLock<HashMap<String, Arc<Mutex<RoomDocument>>>>,
}

impl SyncEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a materialized document for a room, replacing any previous one.
    pub fn insert_document(&self, room_id: &str, document: RoomDocument) {
        let mut docs = self.documents.write().unwrap_or_else(PoisonError::into_inner);
        docs.insert(room_id.to_string(), Arc::new(Mutex::new(document)));
    }

    /// Drop a room's document, freeing its memory.
    pub fn remove_document(&self, room_id: &str) -> bool {
        let mut docs = self.documents.write().unwrap_or_else(PoisonError::into_inner);
        docs.remove(room_id).is_some()
    }

    pub fn contains(&self, room_id: &str) -> bool {
        let docs = self.documents.read().unwrap_or_else(PoisonError::into_inner);
        docs.contains_key(room_id)
    }

    pub fn document_count(&self) -> usize {
        self.documents.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn document(&self, room_id: &str) -> Result<Arc<Mutex<RoomDocument>>, SyncError> {
        let docs = self.documents.read().unwrap_or_else(PoisonError::into_inner);
        docs.get(room_id)
            .cloned()
            .ok_or_else(|| SyncError::UnknownRoom(room_id.to_string()))
    }

    /// Run `f` with exclusive access to one room's document.
    ///
    /// The registry lock is released before the document lock is taken.
    pub fn with_document<T>(
        &self,
        room_id: &str,
        f: impl FnOnce(&mut RoomDocument) -> T,
    ) -> Result<T, SyncError> {
        let document = self.document(room_id)?;
        let mut guard = document.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(f(&mut guard))
    }

    /// Merge an update into the room's document; returns the new version.
    pub fn apply_update(&self, room_id: &str, update: &[u8]) -> Result<u64, SyncError> {
        self.with_document(room_id, |doc| doc.apply(update))?
    }

    /// Full state for a newly joining client.
    pub fn encode_full_state(&self, room_id: &str) -> Result<Vec<u8>, SyncError> {
        self.with_document(room_id, |doc| doc.encode_full_state())
    }

    pub fn get_version(&self, room_id: &str) -> Result<u64, SyncError> {
        self.with_document(room_id, |doc| doc.version())
    }

    pub fn updates_since_snapshot(&self, room_id: &str) -> Result<u64, SyncError> {
        self.with_document(room_id, |doc| doc.updates_since_snapshot())
    }

    pub fn commit_snapshot(&self, room_id: &str) -> Result<(Vec<u8>, u64), SyncError> {
        self.with_document(room_id, |doc| doc.commit_snapshot())
    }

    pub fn mark_dirty(&self, room_id: &str) -> Result<(), SyncError> {
        self.with_document(room_id, |doc| doc.mark_dirty())
    }

    /// Rooms with edits not yet covered by a snapshot.
    pub fn dirty_rooms(&self) -> Vec<String> {
        let docs: Vec<(String, Arc<Mutex<RoomDocument>>)> = {
            let docs = self.documents.read().unwrap_or_else(PoisonError::into_inner);
            docs.iter().map(|(id, d)| (id.clone(), d.clone())).collect()
        };
        docs.into_iter()
            .filter(|(_, d)| {
                d.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .updates_since_snapshot()
                    > 0
            })
            .map(|(id, _)| id)
            .collect()
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::text_update;
    use super::*;
    use yrs::GetString;

    fn body(doc: &Doc) -> String {
        let txn = doc.transact();
        txn.get_text("body")
            .map(|t| t.get_string(&txn))
            .unwrap_or_default()
    }

    #[test]
    fn test_apply_update_bumps_version() {
        let engine = SyncEngine::new();
        engine.insert_document("r1", RoomDocument::new());
        assert_eq!(engine.get_version("r1").unwrap(), 0);

        let u1 = text_update(1, None, "hello");
        assert_eq!(engine.apply_update("r1", &u1).unwrap(), 1);
        assert_eq!(engine.get_version("r1").unwrap(), 1);
        assert_eq!(engine.updates_since_snapshot("r1").unwrap(), 1);
    }

    #[test]
    fn test_corrupt_update_is_merge_error() {
        let engine = SyncEngine::new();
        engine.insert_document("r1", RoomDocument::new());

        let err = engine.apply_update("r1", &[0xFF, 0xFF, 0xFF, 0xFF]).unwrap_err();
        assert!(matches!(err, SyncError::Merge(_)));
        assert_eq!(err.code(), ErrorCode::MergeError);
        assert!(engine.apply_update("r1", &[]).is_err());
        assert_eq!(engine.get_version("r1").unwrap(), 0);
    }

    #[test]
    fn test_unknown_room() {
        let engine = SyncEngine::new();
        assert_eq!(
            engine.get_version("nope").unwrap_err(),
            SyncError::UnknownRoom("nope".into())
        );
    }

    #[test]
    fn test_full_state_reproduces_document() {
        let engine = SyncEngine::new();
        engine.insert_document("r1", RoomDocument::new());
        let u1 = text_update(1, None, "abc");
        engine.apply_update("r1", &u1).unwrap();

        let state = engine.encode_full_state("r1").unwrap();
        let replica = Doc::new();
        merge_update(&replica, &state).unwrap();
        assert_eq!(body(&replica), "abc");
    }

    #[test]
    fn test_convergence_any_order_with_duplicates() {
        let u1 = text_update(1, None, "base ");
        let u2 = text_update(2, Some(&u1), "left ");
        let u3 = text_update(3, Some(&u1), "right ");

        let mut a = RoomDocument::new();
        for u in [&u1, &u2, &u3] {
            a.apply(u).unwrap();
        }

        let mut b = RoomDocument::new();
        for u in [&u3, &u2, &u1, &u3, &u1] {
            b.apply(u).unwrap();
        }

        assert_eq!(body(a.doc()), body(b.doc()));
        assert!(body(a.doc()).contains("base"));
        assert_eq!(
            a.doc().transact().state_vector(),
            b.doc().transact().state_vector()
        );
    }

    #[test]
    fn test_commit_snapshot_resets_counter() {
        let mut doc = RoomDocument::new();
        doc.apply(&text_update(1, None, "x")).unwrap();
        doc.apply(&text_update(2, None, "y")).unwrap();
        assert_eq!(doc.updates_since_snapshot(), 2);

        let (state, version) = doc.commit_snapshot();
        assert_eq!(version, 3);
        assert_eq!(doc.version(), 3);
        assert_eq!(doc.updates_since_snapshot(), 0);
        assert!(!state.is_empty());

        doc.mark_dirty();
        assert_eq!(doc.updates_since_snapshot(), 1);
    }

    #[test]
    fn test_merge_snapshot_never_lowers_version() {
        let mut doc = RoomDocument::new();
        let state = text_update(1, None, "snap");
        doc.merge_snapshot(&state, 10).unwrap();
        assert_eq!(doc.version(), 10);
        doc.merge_snapshot(&state, 4).unwrap();
        assert_eq!(doc.version(), 10);
        assert_eq!(doc.updates_since_snapshot(), 0);
        assert_eq!(body(doc.doc()), "snap");
    }

    #[test]
    fn test_dirty_rooms() {
        let engine = SyncEngine::new();
        engine.insert_document("clean", RoomDocument::new());
        engine.insert_document("dirty", RoomDocument::new());
        engine
            .apply_update("dirty", &text_update(1, None, "z"))
            .unwrap();

        assert_eq!(engine.dirty_rooms(), vec!["dirty".to_string()]);
        engine.commit_snapshot("dirty").unwrap();
        assert!(engine.dirty_rooms().is_empty());
        assert!(engine.remove_document("dirty"));
        assert_eq!(engine.document_count(), 1);
    }
}
