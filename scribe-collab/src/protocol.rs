//! JSON wire protocol for the collaboration socket.
//!
//! Every frame is one JSON text message tagged by `type`:
//! ```text
//! {"type":"SYNC","update":"<base64 yrs v1 update>","version":3,"from":"alice"}
//! {"type":"PRESENCE","event":"cursor","user":{"userId":"alice",...},"cursor":{"position":12}}
//! {"type":"CONTROL","event":"error","error":{"code":"merge_error","message":"..."}}
//! {"type":"PING"}
//! {"type":"PONG","timestamp":1700000000000}
//! ```
//!
//! The set of kinds is closed. Frames with a missing or unknown `type` are
//! rejected at decode time so the gateway can answer with `CONTROL.error`
//! instead of guessing.

use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use thiserror::Error;

/// Every `type` tag the server understands; one per [`Message::kind`].
pub const MESSAGE_TYPES: [&str; 5] = ["SYNC", "PRESENCE", "CONTROL", "PING", "PONG"];

/// Longest accepted room id.
pub const MAX_ROOM_ID_LEN: usize = 128;

/// Room ids address directories and database keys, so they are restricted
/// to `[A-Za-z0-9_.-]` and may not be `.` or `..`.
pub fn is_valid_room_id(room_id: &str) -> bool {
    !room_id.is_empty()
        && room_id.len() <= MAX_ROOM_ID_LEN
        && room_id != "."
        && room_id != ".."
        && room_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    /// CRDT delta, full-state seed, or (without `update`) a resync request.
    Sync(SyncMessage),
    /// Ephemeral cursor / awareness traffic.
    Presence(PresenceMessage),
    /// Server-originated room state, errors and notices.
    Control(ControlMessage),
    /// Liveness heartbeat from the client.
    Ping(PingMessage),
    /// Heartbeat reply.
    Pong(PongMessage),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMessage {
    /// Encoded yrs update (v1), base64 on the wire.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "opt_base64")]
    pub update: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    /// User id of the originating client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceEvent {
    Joined,
    Left,
    Cursor,
    Awareness,
}

/// Identity block carried by presence messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUser {
    pub user_id: String,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

/// Text selection as a pair of document offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub anchor: u64,
    pub head: u64,
}

/// Caret position inside the shared document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorState {
    pub position: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<Selection>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceMessage {
    pub event: PresenceEvent,
    pub user: PresenceUser,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<CursorState>,
    /// Free-form client awareness state, relayed untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub awareness: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlEvent {
    RoomState,
    Error,
    Notice,
}

/// Stable error codes surfaced to clients in `CONTROL.error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    CapacityExceeded,
    RoomFull,
    RoomUnavailable,
    MergeError,
    RateLimitExceeded,
    ProtocolError,
    PermissionDenied,
    Unauthenticated,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::CapacityExceeded => "capacity_exceeded",
            ErrorCode::RoomFull => "room_full",
            ErrorCode::RoomUnavailable => "room_unavailable",
            ErrorCode::MergeError => "merge_error",
            ErrorCode::RateLimitExceeded => "rate_limit_exceeded",
            ErrorCode::ProtocolError => "protocol_error",
            ErrorCode::PermissionDenied => "permission_denied",
            ErrorCode::Unauthenticated => "unauthenticated",
            ErrorCode::InternalError => "internal_error",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
}

/// Public view of one participant, as reported in `room_state`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantInfo {
    pub connection_id: String,
    pub user_id: String,
    pub username: String,
    pub role: String,
    pub can_edit: bool,
    #[serde(default)]
    pub connected_at: u64,
    /// Last inbound message from this connection.
    #[serde(default)]
    pub last_activity: u64,
}

/// Room summary sent to a client right after it joins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomInfo {
    pub room_id: String,
    pub room_type: String,
    pub version: u64,
    pub created_at: u64,
    /// Last join, leave or applied update.
    #[serde(default)]
    pub last_activity: u64,
    pub participants: Vec<ParticipantInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlMessage {
    pub event: ControlEvent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<RoomInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notice: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PingMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PongMessage {
    pub timestamp: u64,
}

/// How the outbound queue treats a message when a consumer falls behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Never dropped (SYNC, CONTROL).
    Reliable,
    /// Oldest entries dropped on overflow (PRESENCE, heartbeats).
    Lossy,
}

impl Message {
    /// Incremental update relayed from `from`.
    pub fn sync_update(update: Vec<u8>, version: u64, from: impl Into<String>) -> Self {
        Message::Sync(SyncMessage {
            update: Some(update),
            version: Some(version),
            from: Some(from.into()),
            timestamp: Some(now_millis()),
        })
    }

    /// Full document state used to seed a client replica.
    pub fn full_state(state: Vec<u8>, version: u64) -> Self {
        Message::Sync(SyncMessage {
            update: Some(state),
            version: Some(version),
            from: None,
            timestamp: Some(now_millis()),
        })
    }

    pub fn presence(
        event: PresenceEvent,
        user: PresenceUser,
        cursor: Option<CursorState>,
        awareness: Option<serde_json::Value>,
    ) -> Self {
        Message::Presence(PresenceMessage {
            event,
            user,
            cursor,
            awareness,
            idle: None,
            timestamp: Some(now_millis()),
        })
    }

    pub fn room_state(room: RoomInfo) -> Self {
        Message::Control(ControlMessage {
            event: ControlEvent::RoomState,
            room: Some(room),
            error: None,
            notice: None,
            timestamp: Some(now_millis()),
        })
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Message::Control(ControlMessage {
            event: ControlEvent::Error,
            room: None,
            error: Some(ErrorPayload {
                code,
                message: message.into(),
            }),
            notice: None,
            timestamp: Some(now_millis()),
        })
    }

    pub fn notice(text: impl Into<String>) -> Self {
        Message::Control(ControlMessage {
            event: ControlEvent::Notice,
            room: None,
            error: None,
            notice: Some(text.into()),
            timestamp: Some(now_millis()),
        })
    }

    pub fn ping() -> Self {
        Message::Ping(PingMessage {
            timestamp: Some(now_millis()),
        })
    }

    pub fn pong(timestamp: u64) -> Self {
        Message::Pong(PongMessage { timestamp })
    }

    /// Wire tag of this message.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Sync(_) => "SYNC",
            Message::Presence(_) => "PRESENCE",
            Message::Control(_) => "CONTROL",
            Message::Ping(_) => "PING",
            Message::Pong(_) => "PONG",
        }
    }

    pub fn delivery(&self) -> Delivery {
        match self {
            Message::Sync(_) | Message::Control(_) => Delivery::Reliable,
            Message::Presence(_) | Message::Ping(_) | Message::Pong(_) => Delivery::Lossy,
        }
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Parse a JSON text frame.
    ///
    /// The `type` tag is checked before the body so an unknown kind is
    /// reported as such rather than as a generic parse failure.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let tag = value
            .get("type")
            .and_then(serde_json::Value::as_str)
            .ok_or(ProtocolError::MissingType)?;
        if !MESSAGE_TYPES.contains(&tag) {
            return Err(ProtocolError::UnknownType(tag.to_string()));
        }
        serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("message has no string `type` field")]
    MissingType,
    #[error("unrecognized message type: {0}")]
    UnknownType(String),
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("binary frames are not supported")]
    BinaryFrame,
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl ProtocolError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ProtocolError::Serialization(_) => ErrorCode::InternalError,
            _ => ErrorCode::ProtocolError,
        }
    }
}

mod opt_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        encoded
            .map(|s| STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom))
            .transpose()
    }
}
