//! # scribe-collab: Realtime collaborative editing core
//!
//! Multiple clients edit one shared document over WebSocket. Concurrent
//! edits are merged with a CRDT (yrs), so the server never orders or rebases
//! them; it keeps one authoritative replica per room, fans updates out,
//! relays presence, and snapshots room state to durable storage.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐  JSON over WS   ┌─────────┐     ┌─────────────┐
//! │ Client A │ ◄─────────────► │         │     │ SyncEngine  │
//! └──────────┘                 │ Gateway │ ──► │ (yrs Doc)   │
//! ┌──────────┐                 │         │     ├─────────────┤
//! │ Client B │ ◄─────────────► │         │     │ Presence    │
//! └──────────┘                 └────┬────┘     ├─────────────┤
//!                                   │          │ Snapshots   │──► RocksDB / files
//!                                   ▼          └─────────────┘
//!                              RoomManager ─────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Message envelopes and their JSON wire format
//! - [`sync`]: Per-room CRDT documents and update merging
//! - [`presence`]: Ephemeral cursor and awareness state
//! - [`snapshot`] / [`storage`]: Snapshot lifecycle and backends
//! - [`room`]: Room registry, lifecycle and fan-out
//! - [`outbox`]: Per-connection outbound queue with backpressure
//! - [`auth`] / [`limits`]: Identity and rate limits
//! - [`gateway`]: WebSocket handshake and connection loop
//! - [`server`]: Listener and background maintenance
//! - [`config`]: TOML configuration

pub mod auth;
pub mod config;
pub mod gateway;
pub mod limits;
pub mod outbox;
pub mod presence;
pub mod protocol;
pub mod room;
pub mod server;
pub mod snapshot;
pub mod storage;
pub mod sync;

// Re-exports for convenience
pub use auth::{AuthError, Authenticator, Credentials, Identity, Permissions, StaticTokenAuthenticator};
pub use config::{CollabConfig, ConfigError, StorageBackend};
pub use gateway::{Gateway, GatewayStats};
pub use presence::{PresenceData, PresenceTracker};
pub use protocol::{ErrorCode, Message, ProtocolError};
pub use room::{ClientConnection, RecordStore, RoomError, RoomManager, RoomSettings, RoomState};
pub use server::{CollabServer, ServerError, ServerStats};
pub use snapshot::{SnapshotManager, SnapshotStats};
pub use storage::{Snapshot, SnapshotStorage, StorageError};
pub use sync::{RoomDocument, SyncEngine, SyncError};
