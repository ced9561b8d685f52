//! Room registry, lifecycle and fan-out.
//!
//! ```text
//!            join                      leave (last)                 timer fires
//! (absent) ───────► ACTIVE ◄──────────────────────► IDLE ───────────────────────► DESTROYED
//!                     ▲          join (cancels timer)   │  final snapshot, record hook,
//!                     └─────────────────────────────────┘  free document + presence
//! ```
//!
//! Locking:
//! - `rooms` (registry) is held only for lookup, insert and remove.
//! - Each `Room` has its own async mutex. Joins, leaves, update application
//!   and fan-out for one room are serialized on it; other rooms run in
//!   parallel.
//! - Registry → room is never nested. Expiry takes room → registry, which is
//!   the only nesting.
//!
//! Fan-out pushes pre-encoded frames into each participant's [`Outbox`]
//! and never waits on a socket.

use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::auth::{Identity, Permissions};
use crate::config::CollabConfig;
use crate::outbox::{Frame, Outbox, PushOutcome};
use crate::presence::{PresenceData, PresenceTracker};
use crate::protocol::{
    is_valid_room_id, now_millis, ErrorCode, Message, ParticipantInfo, PresenceEvent,
    PresenceMessage, RoomInfo,
};
use crate::snapshot::SnapshotManager;
use crate::sync::{RoomDocument, SyncEngine, SyncError};

/// Room type used when a client does not name one.
pub const DEFAULT_ROOM_TYPE: &str = "document";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoomError {
    #[error("room limit of {max} reached")]
    CapacityExceeded { max: usize },
    #[error("room {room_id} is full ({max} participants)")]
    RoomFull { room_id: String, max: usize },
    #[error("room {room_id} unavailable: {reason}")]
    RoomUnavailable { room_id: String, reason: String },
    #[error("invalid room id {0:?}")]
    InvalidRoomId(String),
    #[error("connection is not in room {0}")]
    NotJoined(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl RoomError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RoomError::CapacityExceeded { .. } => ErrorCode::CapacityExceeded,
            RoomError::RoomFull { .. } => ErrorCode::RoomFull,
            RoomError::RoomUnavailable { .. } => ErrorCode::RoomUnavailable,
            RoomError::InvalidRoomId(_) | RoomError::NotJoined(_) => ErrorCode::ProtocolError,
            RoomError::PermissionDenied(_) => ErrorCode::PermissionDenied,
            RoomError::Sync(e) => e.code(),
            RoomError::Internal(_) => ErrorCode::InternalError,
        }
    }
}

/// External document record store, handed the final state of a room when it
/// is destroyed.
pub trait RecordStore: Send + Sync {
    fn persist<'a>(
        &'a self,
        room_id: &'a str,
        state: &'a [u8],
        version: u64,
    ) -> BoxFuture<'a, Result<(), String>>;
}

/// One client connection, as seen by its room.
pub struct ClientConnection {
    pub id: String,
    pub user_id: String,
    pub username: String,
    pub role: String,
    pub room_id: String,
    /// Milliseconds since the Unix epoch.
    pub connected_at: u64,
    pub permissions: Permissions,
    last_activity: AtomicU64,
    outbox: Arc<Outbox>,
}

impl ClientConnection {
    pub fn new(identity: Identity, room_id: impl Into<String>, outbox: Arc<Outbox>) -> Self {
        let now = now_millis();
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: identity.user_id,
            username: identity.username,
            role: identity.role,
            room_id: room_id.into(),
            connected_at: now,
            permissions: identity.permissions,
            last_activity: AtomicU64::new(now),
            outbox,
        }
    }

    pub fn touch(&self) {
        self.last_activity.store(now_millis(), Ordering::Relaxed);
    }

    pub fn last_activity(&self) -> u64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    pub fn outbox(&self) -> &Arc<Outbox> {
        &self.outbox
    }

    /// Encode and queue a message for this connection only.
    pub fn send(&self, message: &Message) -> PushOutcome {
        match message.encode() {
            Ok(text) => self.outbox.push(Frame::from(text), message.delivery()),
            Err(e) => {
                log::error!("Failed to encode {} for {}: {e}", message.kind(), self.id);
                PushOutcome::Closed
            }
        }
    }

    pub fn info(&self) -> ParticipantInfo {
        ParticipantInfo {
            connection_id: self.id.clone(),
            user_id: self.user_id.clone(),
            username: self.username.clone(),
            role: self.role.clone(),
            can_edit: self.permissions.can_edit,
            connected_at: self.connected_at,
            last_activity: self.last_activity(),
        }
    }
}

/// What a newly joined client needs to seed its replica.
#[derive(Debug, Clone)]
pub struct RoomState {
    pub room: RoomInfo,
    pub document_state: Vec<u8>,
    pub version: u64,
}

/// Room manager settings.
#[derive(Debug, Clone)]
pub struct RoomSettings {
    pub max_rooms: usize,
    /// 0 = unlimited
    pub max_participants: usize,
    pub cleanup_timeout: Duration,
    /// Take threshold and final snapshots.
    pub snapshots_enabled: bool,
    pub max_updates: u64,
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self::from_config(&CollabConfig::default())
    }
}

impl RoomSettings {
    pub fn from_config(config: &CollabConfig) -> Self {
        Self {
            max_rooms: config.rooms.max_rooms,
            max_participants: config.rooms.max_participants,
            cleanup_timeout: config.cleanup_timeout(),
            snapshots_enabled: config.snapshots.enabled,
            max_updates: config.snapshots.max_updates,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Registered, document not loaded yet.
    Empty,
    Active,
    Idle,
    Destroyed,
}

struct RoomInner {
    phase: Phase,
    /// Bumped on every join and leave-to-idle; stale timers compare it.
    epoch: u64,
    participants: Vec<Arc<ClientConnection>>,
    idle_timer: Option<JoinHandle<()>>,
    last_activity: u64,
}

struct Room {
    id: String,
    room_type: String,
    created_at: u64,
    inner: Mutex<RoomInner>,
}

impl Room {
    fn new(id: &str, room_type: &str) -> Self {
        let now = now_millis();
        Self {
            id: id.to_string(),
            room_type: room_type.to_string(),
            created_at: now,
            inner: Mutex::new(RoomInner {
                phase: Phase::Empty,
                epoch: 0,
                participants: Vec::new(),
                idle_timer: None,
                last_activity: now,
            }),
        }
    }
}

#[derive(Default)]
struct Counters {
    rooms_created: AtomicU64,
    rooms_destroyed: AtomicU64,
    frames_dropped: AtomicU64,
    evictions: AtomicU64,
}

/// Room manager statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomStats {
    pub active_rooms: usize,
    pub rooms_created: u64,
    pub rooms_destroyed: u64,
    pub frames_dropped: u64,
    pub evictions: u64,
}

/// Registry of live rooms.
pub struct RoomManager {
    settings: RoomSettings,
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    sync: Arc<SyncEngine>,
    presence: Arc<PresenceTracker>,
    snapshots: Arc<SnapshotManager>,
    record_store: Option<Arc<dyn RecordStore>>,
    counters: Counters,
}

impl RoomManager {
    pub fn new(
        settings: RoomSettings,
        sync: Arc<SyncEngine>,
        presence: Arc<PresenceTracker>,
        snapshots: Arc<SnapshotManager>,
    ) -> Self {
        Self {
            settings,
            rooms: RwLock::new(HashMap::new()),
            sync,
            presence,
            snapshots,
            record_store: None,
            counters: Counters::default(),
        }
    }

    pub fn with_record_store(mut self, record_store: Arc<dyn RecordStore>) -> Self {
        self.record_store = Some(record_store);
        self
    }

    pub fn settings(&self) -> &RoomSettings {
        &self.settings
    }

    pub fn sync(&self) -> &Arc<SyncEngine> {
        &self.sync
    }

    pub fn presence(&self) -> &Arc<PresenceTracker> {
        &self.presence
    }

    pub fn snapshots(&self) -> &Arc<SnapshotManager> {
        &self.snapshots
    }

    /// Rooms in the registry, idle ones included.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn contains_room(&self, room_id: &str) -> bool {
        self.rooms.read().await.contains_key(room_id)
    }

    pub async fn participant_count(&self, room_id: &str) -> usize {
        match self.room(room_id).await {
            Some(room) => room.inner.lock().await.participants.len(),
            None => 0,
        }
    }

    /// Current summary of a live room.
    pub async fn room_info(&self, room_id: &str) -> Option<RoomInfo> {
        let room = self.room(room_id).await?;
        let inner = room.inner.lock().await;
        if matches!(inner.phase, Phase::Empty | Phase::Destroyed) {
            return None;
        }
        Some(RoomInfo {
            room_id: room.id.clone(),
            room_type: room.room_type.clone(),
            version: self.sync.get_version(&room.id).ok()?,
            created_at: room.created_at,
            last_activity: inner.last_activity,
            participants: inner.participants.iter().map(|c| c.info()).collect(),
        })
    }

    pub async fn stats(&self) -> RoomStats {
        RoomStats {
            active_rooms: self.room_count().await,
            rooms_created: self.counters.rooms_created.load(Ordering::Relaxed),
            rooms_destroyed: self.counters.rooms_destroyed.load(Ordering::Relaxed),
            frames_dropped: self.counters.frames_dropped.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
        }
    }

    async fn room(&self, room_id: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(room_id).cloned()
    }

    async fn get_or_create(&self, room_id: &str, room_type: &str) -> Result<Arc<Room>, RoomError> {
        if let Some(room) = self.room(room_id).await {
            return Ok(room);
        }

        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(room_id) {
            return Ok(room.clone());
        }
        if rooms.len() >= self.settings.max_rooms {
            log::warn!(
                "Refusing to create room {room_id}: limit of {} reached",
                self.settings.max_rooms
            );
            return Err(RoomError::CapacityExceeded {
                max: self.settings.max_rooms,
            });
        }
        let room = Arc::new(Room::new(room_id, room_type));
        rooms.insert(room_id.to_string(), room.clone());
        self.counters.rooms_created.fetch_add(1, Ordering::Relaxed);
        log::info!("Created room {room_id} ({room_type})");
        Ok(room)
    }

    async fn unregister(&self, room: &Arc<Room>) {
        let mut rooms = self.rooms.write().await;
        if rooms.get(&room.id).is_some_and(|r| Arc::ptr_eq(r, room)) {
            rooms.remove(&room.id);
        }
    }

    /// Load the room's document from its latest snapshot, or start empty.
    async fn materialize(&self, room_id: &str) -> Result<(), RoomError> {
        let mut document = RoomDocument::new();
        if let Some(snapshot) = self.snapshots.load_snapshot(room_id).await {
            SnapshotManager::apply_snapshot(&mut document, &snapshot).map_err(|e| {
                RoomError::RoomUnavailable {
                    room_id: room_id.to_string(),
                    reason: format!("snapshot v{} unreadable: {e}", snapshot.version),
                }
            })?;
            log::info!(
                "Materialized room {room_id} from snapshot v{}",
                snapshot.version
            );
        } else {
            log::debug!("Materialized room {room_id} empty");
        }
        self.sync.insert_document(room_id, document);
        Ok(())
    }

    /// Add a connection to a room, creating and loading the room if needed.
    ///
    /// On success the joiner's outbox already holds `CONTROL.room_state`
    /// followed by a full-state `SYNC`.
    pub async fn join_room(
        self: &Arc<Self>,
        room_id: &str,
        room_type: &str,
        connection: Arc<ClientConnection>,
    ) -> Result<RoomState, RoomError> {
        if !is_valid_room_id(room_id) {
            return Err(RoomError::InvalidRoomId(room_id.to_string()));
        }
        if !connection.permissions.can_view {
            return Err(RoomError::PermissionDenied(format!(
                "{} may not view room {room_id}",
                connection.user_id
            )));
        }

        loop {
            let room = self.get_or_create(room_id, room_type).await?;
            let mut inner = room.inner.lock().await;

            match inner.phase {
                // Expired while we waited for the lock; it is already out of
                // the registry, so the next lookup creates a fresh room.
                Phase::Destroyed => continue,
                Phase::Empty => {
                    if let Err(e) = self.materialize(room_id).await {
                        log::error!("Failed to materialize room {room_id}: {e}");
                        inner.phase = Phase::Destroyed;
                        drop(inner);
                        self.unregister(&room).await;
                        return Err(e);
                    }
                }
                Phase::Active | Phase::Idle => {}
            }

            let max = self.settings.max_participants;
            if max > 0 && inner.participants.len() >= max {
                return Err(RoomError::RoomFull {
                    room_id: room_id.to_string(),
                    max,
                });
            }

            if let Some(timer) = inner.idle_timer.take() {
                timer.abort();
                log::debug!("Room {room_id} reactivated, idle timer cancelled");
            }
            inner.phase = Phase::Active;
            inner.epoch += 1;
            inner.last_activity = now_millis();
            inner.participants.push(connection.clone());

            let newly_present = self
                .presence
                .get_presence(room_id, &connection.user_id)
                .is_none();
            if newly_present {
                self.presence.set_presence(
                    room_id,
                    PresenceData::new(&connection.user_id, &connection.username),
                );
            }

            let (document_state, version) = self
                .sync
                .with_document(room_id, |doc| (doc.encode_full_state(), doc.version()))?;

            let info = RoomInfo {
                room_id: room_id.to_string(),
                room_type: room.room_type.clone(),
                version,
                created_at: room.created_at,
                last_activity: inner.last_activity,
                participants: inner.participants.iter().map(|c| c.info()).collect(),
            };

            connection.send(&Message::room_state(info.clone()));
            connection.send(&Message::full_state(document_state.clone(), version));
            for other in self.presence.list_presence(room_id) {
                if other.user_id != connection.user_id {
                    connection.send(&Message::Presence(other.to_message(PresenceEvent::Joined)));
                }
            }

            if newly_present {
                if let Some(me) = self.presence.get_presence(room_id, &connection.user_id) {
                    let joined = Message::Presence(me.to_message(PresenceEvent::Joined));
                    self.fan_out(&inner, &joined, Some(&connection.id));
                }
            }

            log::info!(
                "{} ({}) joined room {room_id} as {}, {} participant(s), v{version}",
                connection.username,
                connection.user_id,
                connection.role,
                inner.participants.len()
            );

            return Ok(RoomState {
                room: info,
                document_state,
                version,
            });
        }
    }

    /// Remove a connection. The last one out starts the idle timer.
    ///
    /// Returns false if the connection was not in the room.
    pub async fn leave_room(self: &Arc<Self>, room_id: &str, connection_id: &str) -> bool {
        let Some(room) = self.room(room_id).await else {
            return false;
        };
        let mut inner = room.inner.lock().await;

        let Some(index) = inner.participants.iter().position(|c| c.id == connection_id) else {
            return false;
        };
        let connection = inner.participants.remove(index);
        connection.outbox().close();
        inner.last_activity = now_millis();

        let still_here = inner
            .participants
            .iter()
            .any(|c| c.user_id == connection.user_id);
        if !still_here {
            if let Some(presence) = self.presence.remove_presence(room_id, &connection.user_id) {
                let left = Message::Presence(presence.to_message(PresenceEvent::Left));
                self.fan_out(&inner, &left, None);
            }
        }

        log::info!(
            "{} ({}) left room {room_id}, {} participant(s) remain",
            connection.username,
            connection.user_id,
            inner.participants.len()
        );

        if inner.participants.is_empty() && inner.phase == Phase::Active {
            inner.phase = Phase::Idle;
            self.arm_idle_timer(&mut inner, room_id);
        }
        true
    }

    /// Start a fresh expiry countdown for an idle room. Replaces (without
    /// aborting) any previous handle, which may be the calling timer itself.
    fn arm_idle_timer(self: &Arc<Self>, inner: &mut RoomInner, room_id: &str) {
        inner.epoch += 1;
        let epoch = inner.epoch;
        let manager = Arc::clone(self);
        let id = room_id.to_string();
        let timeout = self.settings.cleanup_timeout;
        inner.idle_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            manager.expire_room(&id, epoch).await;
        }));
        log::debug!("Room {room_id} idle, expires in {timeout:?}");
    }

    /// Destroy an idle room whose timer (identified by `epoch`) fired.
    ///
    /// Returns false if the room was rejoined or already gone. If the final
    /// snapshot cannot be written the room stays idle with its document
    /// loaded and dirty, and the timer is re-armed to try again.
    pub async fn expire_room(self: &Arc<Self>, room_id: &str, epoch: u64) -> bool {
        let Some(room) = self.room(room_id).await else {
            return false;
        };
        let mut inner = room.inner.lock().await;
        if inner.phase != Phase::Idle || inner.epoch != epoch || !inner.participants.is_empty() {
            return false;
        }

        if self.settings.snapshots_enabled {
            if let Err(e) = self.snapshot_room(room_id, 1).await {
                log::error!("Final snapshot of room {room_id} failed, keeping it loaded: {e}");
                self.arm_idle_timer(&mut inner, room_id);
                return false;
            }
        }

        if let Some(record_store) = &self.record_store {
            match self
                .sync
                .with_document(room_id, |doc| (doc.encode_full_state(), doc.version()))
            {
                Ok((state, version)) => {
                    if let Err(e) = record_store.persist(room_id, &state, version).await {
                        log::error!("Record store rejected final state of room {room_id}: {e}");
                    }
                }
                Err(e) => log::warn!("No document to hand to record store for {room_id}: {e}"),
            }
        }

        inner.phase = Phase::Destroyed;
        inner.idle_timer = None;
        self.sync.remove_document(room_id);
        self.presence.clear_room(room_id);
        if self.settings.snapshots_enabled {
            self.snapshots.evict(room_id);
        }
        drop(inner);
        self.unregister(&room).await;
        self.counters.rooms_destroyed.fetch_add(1, Ordering::Relaxed);

        log::info!("Room {room_id} destroyed after idle timeout");
        true
    }

    /// Send a message to every participant except `exclude`.
    ///
    /// Returns how many participants it was queued for.
    pub async fn broadcast(&self, room_id: &str, message: &Message, exclude: Option<&str>) -> usize {
        let Some(room) = self.room(room_id).await else {
            return 0;
        };
        let inner = room.inner.lock().await;
        self.fan_out(&inner, message, exclude)
    }

    fn fan_out(&self, inner: &RoomInner, message: &Message, exclude: Option<&str>) -> usize {
        let frame: Frame = match message.encode() {
            Ok(text) => Frame::from(text),
            Err(e) => {
                log::error!("Failed to encode {} for broadcast: {e}", message.kind());
                return 0;
            }
        };
        let delivery = message.delivery();

        let mut queued = 0;
        for connection in &inner.participants {
            if exclude == Some(connection.id.as_str()) {
                continue;
            }
            match connection.outbox().push(frame.clone(), delivery) {
                PushOutcome::Queued => queued += 1,
                PushOutcome::DroppedOldest => {
                    queued += 1;
                    self.counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
                }
                PushOutcome::Evicted => {
                    self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                    log::warn!(
                        "Evicting slow consumer {} ({}) from room {}",
                        connection.id,
                        connection.user_id,
                        connection.room_id
                    );
                }
                PushOutcome::Closed => {}
            }
        }
        queued
    }

    async fn joined_room(
        &self,
        connection: &ClientConnection,
    ) -> Result<Arc<Room>, RoomError> {
        self.room(&connection.room_id)
            .await
            .ok_or_else(|| RoomError::NotJoined(connection.room_id.clone()))
    }

    fn check_member(inner: &RoomInner, connection: &ClientConnection) -> Result<(), RoomError> {
        if inner.participants.iter().any(|c| c.id == connection.id) {
            Ok(())
        } else {
            Err(RoomError::NotJoined(connection.room_id.clone()))
        }
    }

    /// Merge a client update and relay it to the rest of the room.
    ///
    /// Returns the new version. Crossing `max_updates` schedules a snapshot
    /// in the background.
    pub async fn apply_update(
        self: &Arc<Self>,
        connection: &ClientConnection,
        update: Vec<u8>,
    ) -> Result<u64, RoomError> {
        if !connection.permissions.can_edit {
            return Err(RoomError::PermissionDenied(format!(
                "{} is read-only in room {}",
                connection.user_id, connection.room_id
            )));
        }

        let room = self.joined_room(connection).await?;
        let mut inner = room.inner.lock().await;
        Self::check_member(&inner, connection)?;

        let room_id = room.id.as_str();
        let (version, pending) = self.sync.with_document(room_id, |doc| {
            doc.apply(&update)
                .map(|version| (version, doc.updates_since_snapshot()))
        })??;
        inner.last_activity = now_millis();

        let relay = Message::sync_update(update, version, connection.user_id.clone());
        let recipients = self.fan_out(&inner, &relay, Some(&connection.id));
        drop(inner);

        log::trace!(
            "Room {room_id} v{version}: update from {} relayed to {recipients}",
            connection.user_id
        );

        if self.settings.snapshots_enabled
            && self.settings.max_updates > 0
            && pending >= self.settings.max_updates
        {
            let manager = Arc::clone(self);
            let room_id = room_id.to_string();
            tokio::spawn(async move {
                if let Err(e) = manager.snapshot_room(&room_id, manager.settings.max_updates).await {
                    log::warn!("Threshold snapshot of room {room_id} failed: {e}");
                }
            });
        }

        Ok(version)
    }

    /// Record a presence change and relay it to the rest of the room.
    pub async fn update_presence(
        &self,
        connection: &ClientConnection,
        message: &PresenceMessage,
    ) -> Result<(), RoomError> {
        let room = self.joined_room(connection).await?;
        let inner = room.inner.lock().await;
        Self::check_member(&inner, connection)?;

        let presence =
            self.presence
                .apply(&room.id, &connection.user_id, &connection.username, message);
        // joined/left are server-generated.
        let event = match message.event {
            PresenceEvent::Joined | PresenceEvent::Left => PresenceEvent::Awareness,
            event => event,
        };
        let relay = Message::Presence(presence.to_message(event));
        self.fan_out(&inner, &relay, Some(&connection.id));
        Ok(())
    }

    /// Send the full current state to one connection.
    pub async fn resync(&self, connection: &ClientConnection) -> Result<u64, RoomError> {
        let room = self.joined_room(connection).await?;
        let inner = room.inner.lock().await;
        Self::check_member(&inner, connection)?;

        let (state, version) = self
            .sync
            .with_document(&room.id, |doc| (doc.encode_full_state(), doc.version()))?;
        connection.send(&Message::full_state(state, version));
        log::debug!("Resynced {} in room {} at v{version}", connection.id, room.id);
        Ok(version)
    }

    /// Commit and persist a snapshot if the room has at least `min_updates`
    /// unsnapshotted updates.
    ///
    /// Returns the snapshot version, or `None` if nothing was due. A failed
    /// write leaves the room dirty so a later pass retries.
    pub async fn snapshot_room(
        &self,
        room_id: &str,
        min_updates: u64,
    ) -> Result<Option<u64>, RoomError> {
        let committed = self.sync.with_document(room_id, |doc| {
            (doc.updates_since_snapshot() >= min_updates.max(1)).then(|| doc.commit_snapshot())
        })?;
        let Some((state, version)) = committed else {
            return Ok(None);
        };

        let snapshot = self.snapshots.create_snapshot(room_id, state, version);
        match self.snapshots.save_snapshot(snapshot).await {
            Ok(()) => Ok(Some(version)),
            Err(e) => {
                // The document may have been freed in the meantime; nothing to retry then.
                let _ = self.sync.mark_dirty(room_id);
                Err(RoomError::Internal(format!("snapshot v{version} not saved: {e}")))
            }
        }
    }

    /// Snapshot every room with pending updates. Returns how many were saved.
    pub async fn snapshot_dirty_rooms(&self) -> usize {
        let mut saved = 0;
        for room_id in self.sync.dirty_rooms() {
            match self.snapshot_room(&room_id, 1).await {
                Ok(Some(_)) => saved += 1,
                Ok(None) => {}
                Err(e) => log::warn!("Scheduled snapshot of room {room_id} failed: {e}"),
            }
        }
        saved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ControlEvent, CursorState, PresenceUser};
    use crate::storage::{MemoryStorage, Snapshot, SnapshotStorage, StorageError};
    use crate::sync::test_support::text_update;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;
    use yrs::{Doc, GetString, ReadTxn, Transact};

    fn settings() -> RoomSettings {
        RoomSettings {
            max_rooms: 10,
            max_participants: 0,
            cleanup_timeout: Duration::from_millis(50),
            snapshots_enabled: true,
            max_updates: 100,
        }
    }

    fn manager_with(settings: RoomSettings, storage: Arc<dyn SnapshotStorage>) -> Arc<RoomManager> {
        Arc::new(RoomManager::new(
            settings,
            Arc::new(SyncEngine::new()),
            Arc::new(PresenceTracker::new()),
            Arc::new(SnapshotManager::new(storage)),
        ))
    }

    fn manager() -> (Arc<RoomManager>, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        (manager_with(settings(), storage.clone()), storage)
    }

    fn connection(user: &str, room: &str, permissions: Permissions) -> Arc<ClientConnection> {
        Arc::new(ClientConnection::new(
            Identity::new(user, user.to_uppercase(), "editor", permissions),
            room,
            Arc::new(Outbox::new(64, 64)),
        ))
    }

    fn drain(connection: &ClientConnection) -> Vec<Message> {
        std::iter::from_fn(|| connection.outbox().try_recv())
            .map(|frame| Message::decode(&frame).unwrap())
            .collect()
    }

    struct FailingLoads;

    impl SnapshotStorage for FailingLoads {
        fn save(&self, _: &Snapshot) -> Result<(), StorageError> {
            Ok(())
        }
        fn load_latest(&self, _: &str) -> Result<Option<Snapshot>, StorageError> {
            Err(StorageError::Io("read failed".into()))
        }
        fn list_versions(&self, _: &str) -> Result<Vec<u64>, StorageError> {
            Ok(Vec::new())
        }
        fn rooms(&self) -> Result<Vec<String>, StorageError> {
            Ok(Vec::new())
        }
        fn delete_older_than(&self, _: u64) -> Result<usize, StorageError> {
            Ok(0)
        }
        fn backend(&self) -> &'static str {
            "failing"
        }
    }

    /// Memory storage whose next `failures` saves fail.
    struct FlakySaves {
        inner: MemoryStorage,
        failures: AtomicUsize,
    }

    impl FlakySaves {
        fn failing(failures: usize) -> Arc<Self> {
            Arc::new(Self {
                inner: MemoryStorage::new(),
                failures: AtomicUsize::new(failures),
            })
        }
    }

    impl SnapshotStorage for FlakySaves {
        fn save(&self, snapshot: &Snapshot) -> Result<(), StorageError> {
            let failing = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(StorageError::Io("write failed".into()));
            }
            self.inner.save(snapshot)
        }
        fn load_latest(&self, room_id: &str) -> Result<Option<Snapshot>, StorageError> {
            self.inner.load_latest(room_id)
        }
        fn list_versions(&self, room_id: &str) -> Result<Vec<u64>, StorageError> {
            self.inner.list_versions(room_id)
        }
        fn rooms(&self) -> Result<Vec<String>, StorageError> {
            self.inner.rooms()
        }
        fn delete_older_than(&self, cutoff_millis: u64) -> Result<usize, StorageError> {
            self.inner.delete_older_than(cutoff_millis)
        }
        fn backend(&self) -> &'static str {
            "flaky"
        }
    }

    fn body(state: &[u8]) -> String {
        let doc = Doc::new();
        crate::sync::merge_update(&doc, state).unwrap();
        let txn = doc.transact();
        txn.get_text("body")
            .map(|text| text.get_string(&txn))
            .unwrap_or_default()
    }

    #[derive(Default)]
    struct RecordingStore {
        calls: StdMutex<Vec<(String, u64)>>,
    }

    impl RecordStore for RecordingStore {
        fn persist<'a>(
            &'a self,
            room_id: &'a str,
            _state: &'a [u8],
            version: u64,
        ) -> BoxFuture<'a, Result<(), String>> {
            Box::pin(async move {
                self.calls.lock().unwrap().push((room_id.to_string(), version));
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn test_join_seeds_outbox() {
        let (manager, _) = manager();
        let a = connection("alice", "r1", Permissions::EDITOR);
        let state = manager.join_room("r1", DEFAULT_ROOM_TYPE, a.clone()).await.unwrap();
        assert_eq!(state.version, 0);
        assert_eq!(state.room.participants.len(), 1);

        let messages = drain(&a);
        assert!(matches!(
            &messages[0],
            Message::Control(c) if c.event == ControlEvent::RoomState
        ));
        match &messages[1] {
            Message::Sync(sync) => {
                assert_eq!(sync.version, Some(0));
                assert!(sync.update.is_some());
            }
            other => panic!("expected SYNC, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_two_client_versions() {
        let (manager, _) = manager();
        let a = connection("alice", "r1", Permissions::EDITOR);
        manager.join_room("r1", DEFAULT_ROOM_TYPE, a.clone()).await.unwrap();
        drain(&a);

        let u1 = text_update(1, None, "one ");
        assert_eq!(manager.apply_update(&a, u1.clone()).await.unwrap(), 1);
        assert!(drain(&a).is_empty());

        let b = connection("bob", "r1", Permissions::EDITOR);
        let joined = manager.join_room("r1", DEFAULT_ROOM_TYPE, b.clone()).await.unwrap();
        assert_eq!(joined.version, 1);
        drain(&b);

        let u2 = text_update(2, Some(&u1), "two ");
        let u3 = text_update(3, Some(&u1), "three ");
        manager.apply_update(&a, u2).await.unwrap();
        assert_eq!(manager.apply_update(&b, u3).await.unwrap(), 3);
        assert_eq!(manager.sync().get_version("r1").unwrap(), 3);

        let to_a: Vec<_> = drain(&a)
            .into_iter()
            .filter(|m| matches!(m, Message::Sync(_)))
            .collect();
        let to_b: Vec<_> = drain(&b)
            .into_iter()
            .filter(|m| matches!(m, Message::Sync(_)))
            .collect();
        assert_eq!(to_a.len(), 1);
        assert_eq!(to_b.len(), 1);
    }

    #[tokio::test]
    async fn test_capacity_exceeded() {
        let storage = Arc::new(MemoryStorage::new());
        let manager = manager_with(
            RoomSettings {
                max_rooms: 1,
                ..settings()
            },
            storage,
        );
        let a = connection("alice", "one", Permissions::EDITOR);
        manager.join_room("one", DEFAULT_ROOM_TYPE, a).await.unwrap();

        let b = connection("bob", "two", Permissions::EDITOR);
        let err = manager.join_room("two", DEFAULT_ROOM_TYPE, b).await.unwrap_err();
        assert_eq!(err, RoomError::CapacityExceeded { max: 1 });
        assert_eq!(err.code(), ErrorCode::CapacityExceeded);

        // Existing room still accepts joins.
        let c = connection("carol", "one", Permissions::EDITOR);
        assert!(manager.join_room("one", DEFAULT_ROOM_TYPE, c).await.is_ok());
    }

    #[tokio::test]
    async fn test_room_full() {
        let storage = Arc::new(MemoryStorage::new());
        let manager = manager_with(
            RoomSettings {
                max_participants: 1,
                ..settings()
            },
            storage,
        );
        manager
            .join_room("r", DEFAULT_ROOM_TYPE, connection("a", "r", Permissions::EDITOR))
            .await
            .unwrap();
        let err = manager
            .join_room("r", DEFAULT_ROOM_TYPE, connection("b", "r", Permissions::EDITOR))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::RoomFull);
    }

    #[tokio::test]
    async fn test_permissions() {
        let (manager, _) = manager();
        let blind = connection(
            "x",
            "r",
            Permissions {
                can_edit: false,
                can_view: false,
            },
        );
        let err = manager.join_room("r", DEFAULT_ROOM_TYPE, blind).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::PermissionDenied);

        let viewer = connection("v", "r", Permissions::VIEWER);
        manager.join_room("r", DEFAULT_ROOM_TYPE, viewer.clone()).await.unwrap();
        let err = manager
            .apply_update(&viewer, text_update(1, None, "nope"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::PermissionDenied);
        assert_eq!(manager.sync().get_version("r").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_corrupt_update_only_hurts_sender() {
        let (manager, _) = manager();
        let a = connection("a", "r", Permissions::EDITOR);
        let b = connection("b", "r", Permissions::EDITOR);
        manager.join_room("r", DEFAULT_ROOM_TYPE, a.clone()).await.unwrap();
        manager.join_room("r", DEFAULT_ROOM_TYPE, b.clone()).await.unwrap();
        drain(&a);
        drain(&b);

        let err = manager.apply_update(&a, vec![0xff, 0x00, 0x13]).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::MergeError);
        assert!(drain(&b).is_empty());
        assert_eq!(manager.sync().get_version("r").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_idle_room_expires_with_one_snapshot() {
        let (manager, storage) = manager();
        let a = connection("a", "r", Permissions::EDITOR);
        manager.join_room("r", DEFAULT_ROOM_TYPE, a.clone()).await.unwrap();
        manager.apply_update(&a, text_update(1, None, "keep me")).await.unwrap();
        assert!(manager.leave_room("r", &a.id).await);
        assert!(a.outbox().is_closed());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!manager.contains_room("r").await);
        assert!(!manager.sync().contains("r"));
        assert_eq!(storage.list_versions("r").unwrap(), vec![2]);
        assert_eq!(manager.stats().await.rooms_destroyed, 1);
        assert!(manager.snapshots().cached("r").is_none());

        // Rejoining rematerializes from that snapshot.
        let b = connection("b", "r", Permissions::EDITOR);
        let state = manager.join_room("r", DEFAULT_ROOM_TYPE, b).await.unwrap();
        assert_eq!(state.version, 2);
    }

    #[tokio::test]
    async fn test_rejoin_cancels_expiry() {
        let (manager, storage) = manager();
        let a = connection("a", "r", Permissions::EDITOR);
        manager.join_room("r", DEFAULT_ROOM_TYPE, a.clone()).await.unwrap();
        manager.leave_room("r", &a.id).await;

        let b = connection("b", "r", Permissions::EDITOR);
        manager.join_room("r", DEFAULT_ROOM_TYPE, b).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(manager.contains_room("r").await);
        assert!(storage.is_empty());
        // A stale timer epoch is ignored.
        assert!(!manager.expire_room("r", 0).await);
    }

    #[tokio::test]
    async fn test_failing_storage_still_joins_empty() {
        let manager = manager_with(settings(), Arc::new(FailingLoads));
        let a = connection("a", "r2", Permissions::EDITOR);
        let state = manager.join_room("r2", DEFAULT_ROOM_TYPE, a).await.unwrap();
        assert_eq!(state.version, 0);
        assert_eq!(manager.snapshots().stats().load_failures, 1);
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_room_unavailable() {
        let storage = Arc::new(MemoryStorage::new());
        storage
            .save(&Snapshot::new("bad", vec![0xde, 0xad], 3))
            .unwrap();
        let manager = manager_with(settings(), storage);

        let err = manager
            .join_room("bad", DEFAULT_ROOM_TYPE, connection("a", "bad", Permissions::EDITOR))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::RoomUnavailable);
        assert!(!manager.contains_room("bad").await);
    }

    #[tokio::test]
    async fn test_threshold_snapshot() {
        let storage = Arc::new(MemoryStorage::new());
        let manager = manager_with(
            RoomSettings {
                max_updates: 2,
                ..settings()
            },
            storage.clone(),
        );
        let a = connection("a", "r", Permissions::EDITOR);
        manager.join_room("r", DEFAULT_ROOM_TYPE, a.clone()).await.unwrap();
        manager.apply_update(&a, text_update(1, None, "x")).await.unwrap();
        manager.apply_update(&a, text_update(2, None, "y")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(storage.list_versions("r").unwrap(), vec![3]);
        assert_eq!(manager.sync().updates_since_snapshot("r").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_presence_relay_and_leave() {
        let (manager, _) = manager();
        let a = connection("a", "r", Permissions::EDITOR);
        let b = connection("b", "r", Permissions::EDITOR);
        manager.join_room("r", DEFAULT_ROOM_TYPE, a.clone()).await.unwrap();
        manager.join_room("r", DEFAULT_ROOM_TYPE, b.clone()).await.unwrap();

        // a hears b join.
        assert!(drain(&a).iter().any(|m| matches!(
            m,
            Message::Presence(p) if p.event == PresenceEvent::Joined && p.user.user_id == "b"
        )));
        drain(&b);

        let cursor = PresenceMessage {
            event: PresenceEvent::Cursor,
            user: PresenceUser {
                user_id: "b".into(),
                username: "B".into(),
                color: None,
            },
            cursor: Some(CursorState {
                position: 7,
                selection: None,
            }),
            awareness: None,
            idle: None,
            timestamp: None,
        };
        manager.update_presence(&b, &cursor).await.unwrap();
        let got = drain(&a);
        assert!(matches!(
            &got[..],
            [Message::Presence(p)] if p.cursor.map(|c| c.position) == Some(7)
        ));
        assert!(drain(&b).is_empty());

        manager.leave_room("r", &b.id).await;
        assert!(drain(&a).iter().any(|m| matches!(
            m,
            Message::Presence(p) if p.event == PresenceEvent::Left
        )));
        assert_eq!(manager.presence().list_presence("r").len(), 1);
    }

    #[tokio::test]
    async fn test_evicted_consumer_does_not_block_others() {
        let (manager, _) = manager();
        let slow = Arc::new(ClientConnection::new(
            Identity::new("slow", "Slow", "editor", Permissions::EDITOR),
            "r",
            Arc::new(Outbox::new(4, 3)),
        ));
        let fast = connection("fast", "r", Permissions::EDITOR);
        let writer = connection("w", "r", Permissions::EDITOR);
        for c in [&slow, &fast, &writer] {
            manager.join_room("r", DEFAULT_ROOM_TYPE, (*c).clone()).await.unwrap();
        }
        drain(&fast);

        for i in 0..5 {
            let update = text_update(10 + i, None, &format!("{i}"));
            manager.apply_update(&writer, update).await.unwrap();
        }

        assert!(slow.outbox().was_evicted());
        let synced = drain(&fast)
            .into_iter()
            .filter(|m| matches!(m, Message::Sync(_)))
            .count();
        assert_eq!(synced, 5);
        assert_eq!(manager.stats().await.evictions, 1);
    }

    #[tokio::test]
    async fn test_record_store_receives_final_state() {
        let storage = Arc::new(MemoryStorage::new());
        let records = Arc::new(RecordingStore::default());
        let manager = Arc::new(
            RoomManager::new(
                settings(),
                Arc::new(SyncEngine::new()),
                Arc::new(PresenceTracker::new()),
                Arc::new(SnapshotManager::new(storage)),
            )
            .with_record_store(records.clone()),
        );
        let a = connection("a", "r", Permissions::EDITOR);
        manager.join_room("r", DEFAULT_ROOM_TYPE, a.clone()).await.unwrap();
        manager.apply_update(&a, text_update(1, None, "z")).await.unwrap();
        manager.leave_room("r", &a.id).await;

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(*records.calls.lock().unwrap(), vec![("r".to_string(), 2)]);
    }

    #[tokio::test]
    async fn test_snapshot_dirty_rooms() {
        let (manager, storage) = manager();
        let a = connection("a", "r", Permissions::EDITOR);
        manager.join_room("r", DEFAULT_ROOM_TYPE, a.clone()).await.unwrap();
        assert_eq!(manager.snapshot_dirty_rooms().await, 0);

        manager.apply_update(&a, text_update(1, None, "q")).await.unwrap();
        assert_eq!(manager.snapshot_dirty_rooms().await, 1);
        assert_eq!(manager.snapshot_dirty_rooms().await, 0);
        assert_eq!(storage.list_versions("r").unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn test_failed_snapshot_retried_by_next_pass() {
        let storage = FlakySaves::failing(1);
        let manager = manager_with(settings(), storage.clone());
        let a = connection("a", "r", Permissions::EDITOR);
        manager.join_room("r", DEFAULT_ROOM_TYPE, a.clone()).await.unwrap();
        manager.apply_update(&a, text_update(1, None, "q")).await.unwrap();

        // v2 is committed but not written; the room stays dirty.
        assert_eq!(manager.snapshot_dirty_rooms().await, 0);
        assert!(storage.list_versions("r").unwrap().is_empty());
        assert_eq!(manager.sync().dirty_rooms(), vec!["r".to_string()]);

        assert_eq!(manager.snapshot_dirty_rooms().await, 1);
        assert_eq!(storage.list_versions("r").unwrap(), vec![3]);
        assert_eq!(manager.snapshot_dirty_rooms().await, 0);
        assert_eq!(manager.snapshots().stats().save_failures, 1);
    }

    #[tokio::test]
    async fn test_failed_final_snapshot_keeps_room_loaded() {
        let storage = FlakySaves::failing(usize::MAX);
        let manager = manager_with(settings(), storage.clone());
        let a = connection("a", "r", Permissions::EDITOR);
        manager.join_room("r", DEFAULT_ROOM_TYPE, a.clone()).await.unwrap();
        manager.apply_update(&a, text_update(1, None, "keep me")).await.unwrap();
        manager.leave_room("r", &a.id).await;

        // Several expiry attempts fail; nothing is thrown away.
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(manager.contains_room("r").await);
        assert!(manager.sync().contains("r"));
        assert_eq!(manager.sync().dirty_rooms(), vec!["r".to_string()]);
        assert_eq!(manager.stats().await.rooms_destroyed, 0);
        assert!(manager.snapshots().stats().save_failures >= 2);

        // Storage recovers; the re-armed timer saves and destroys the room.
        storage.failures.store(0, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!manager.contains_room("r").await);
        assert!(!manager.sync().contains("r"));
        assert_eq!(manager.stats().await.rooms_destroyed, 1);
        let versions = storage.list_versions("r").unwrap();
        assert_eq!(versions.len(), 1);

        // A restarted manager over the same storage sees the edit.
        let restarted = manager_with(settings(), storage);
        let b = connection("b", "r", Permissions::EDITOR);
        let state = restarted.join_room("r", DEFAULT_ROOM_TYPE, b).await.unwrap();
        assert_eq!(state.version, versions[0]);
        assert_eq!(body(&state.document_state), "keep me");
    }

    #[tokio::test]
    async fn test_room_info_reports_activity() {
        let (manager, _) = manager();
        assert!(manager.room_info("r").await.is_none());

        let a = connection("a", "r", Permissions::EDITOR);
        manager.join_room("r", DEFAULT_ROOM_TYPE, a.clone()).await.unwrap();
        let joined = manager.room_info("r").await.unwrap();
        assert!(joined.last_activity >= joined.created_at);
        assert_eq!(joined.participants[0].connected_at, a.connected_at);

        tokio::time::sleep(Duration::from_millis(5)).await;
        a.touch();
        manager.apply_update(&a, text_update(1, None, "x")).await.unwrap();
        let edited = manager.room_info("r").await.unwrap();
        assert_eq!(edited.version, 1);
        assert!(edited.last_activity > joined.last_activity);
        assert!(edited.participants[0].last_activity > a.connected_at);
    }
}
