//! Ephemeral presence: who is in a room and where their cursor is.
//!
//! ```text
//! PRESENCE from client
//!       │
//!       ▼
//! PresenceTracker::apply()      (last write wins per user)
//!       │
//!       ▼
//! RoomManager::broadcast()      (lossy lane, may be dropped under load)
//! ```
//!
//! Nothing here is persisted. A room's presence map is dropped together with
//! the room.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use crate::protocol::{now_millis, CursorState, PresenceEvent, PresenceMessage, PresenceUser};

/// Presence state of one user in one room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceData {
    pub user_id: String,
    pub username: String,
    /// `#rrggbb`, stable per user id.
    pub color: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<CursorState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub awareness: Option<serde_json::Value>,
    /// Last update, milliseconds since the Unix epoch.
    pub updated_at: u64,
}

impl PresenceData {
    pub fn new(user_id: impl Into<String>, username: impl Into<String>) -> Self {
        let user_id = user_id.into();
        Self {
            color: color_for_user(&user_id),
            user_id,
            username: username.into(),
            cursor: None,
            idle: None,
            awareness: None,
            updated_at: now_millis(),
        }
    }

    /// Identity block for outgoing PRESENCE messages.
    pub fn user(&self) -> PresenceUser {
        PresenceUser {
            user_id: self.user_id.clone(),
            username: self.username.clone(),
            color: Some(self.color.clone()),
        }
    }

    /// Outgoing PRESENCE message describing this user.
    pub fn to_message(&self, event: PresenceEvent) -> PresenceMessage {
        PresenceMessage {
            event,
            user: self.user(),
            cursor: self.cursor,
            awareness: self.awareness.clone(),
            idle: self.idle,
            timestamp: Some(self.updated_at),
        }
    }
}

/// Stable, visually distinct `#rrggbb` color for a user id.
///
/// The hue comes from an FNV-1a hash of the id, so the same user gets the
/// same color on every server and every restart.
pub fn color_for_user(user_id: &str) -> String {
    let hash = user_id
        .bytes()
        .fold(0xcbf2_9ce4_8422_2325u64, |hash, byte| {
            (hash ^ byte as u64).wrapping_mul(0x0000_0100_0000_01b3)
        });
    let hue = (hash % 360) as f32 / 360.0;
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
    format!(
        "#{:02x}{:02x}{:02x}",
        (r * 255.0).round() as u8,
        (g * 255.0).round() as u8,
        (b * 255.0).round() as u8
    )
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// Per-room presence maps.
#[derive(Default)]
pub struct PresenceTracker {
    rooms: RwLock<HashMap<String, HashMap<String, PresenceData>>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a user's presence.
    pub fn set_presence(&self, room_id: &str, data: PresenceData) {
        let mut rooms = self.rooms.write().unwrap_or_else(PoisonError::into_inner);
        rooms
            .entry(room_id.to_string())
            .or_default()
            .insert(data.user_id.clone(), data);
    }

    /// Fold a client PRESENCE message into the stored state and return the
    /// result. Fields the message omits keep their previous value.
    ///
    /// The identity is always the connection's, never what the client claims.
    pub fn apply(
        &self,
        room_id: &str,
        user_id: &str,
        username: &str,
        message: &PresenceMessage,
    ) -> PresenceData {
        let mut rooms = self.rooms.write().unwrap_or_else(PoisonError::into_inner);
        let entry = rooms
            .entry(room_id.to_string())
            .or_default()
            .entry(user_id.to_string())
            .or_insert_with(|| PresenceData::new(user_id, username));

        if message.cursor.is_some() {
            entry.cursor = message.cursor;
        }
        if message.awareness.is_some() {
            entry.awareness = message.awareness.clone();
        }
        if message.idle.is_some() {
            entry.idle = message.idle;
        }
        entry.updated_at = now_millis();
        entry.clone()
    }

    pub fn remove_presence(&self, room_id: &str, user_id: &str) -> Option<PresenceData> {
        let mut rooms = self.rooms.write().unwrap_or_else(PoisonError::into_inner);
        let users = rooms.get_mut(room_id)?;
        let removed = users.remove(user_id);
        if users.is_empty() {
            rooms.remove(room_id);
        }
        removed
    }

    pub fn get_presence(&self, room_id: &str, user_id: &str) -> Option<PresenceData> {
        let rooms = self.rooms.read().unwrap_or_else(PoisonError::into_inner);
        rooms.get(room_id)?.get(user_id).cloned()
    }

    /// Everyone present in a room, ordered by user id.
    pub fn list_presence(&self, room_id: &str) -> Vec<PresenceData> {
        let rooms = self.rooms.read().unwrap_or_else(PoisonError::into_inner);
        let mut users: Vec<PresenceData> = rooms
            .get(room_id)
            .map(|users| users.values().cloned().collect())
            .unwrap_or_default();
        users.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        users
    }

    /// Forget a whole room.
    pub fn clear_room(&self, room_id: &str) {
        let mut rooms = self.rooms.write().unwrap_or_else(PoisonError::into_inner);
        rooms.remove(room_id);
    }

    pub fn room_count(&self) -> usize {
        self.rooms.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}
