//! Collaboration server configuration.
//!
//! Loaded from TOML; every section and field has a default so a partial
//! file (or none at all) yields a runnable configuration:
//!
//! ```toml
//! host = "0.0.0.0"
//! port = 9090
//! path = "/collab"
//!
//! [rooms]
//! max_rooms = 1000
//! cleanup_timeout = 30
//!
//! [snapshots]
//! storage = "database"
//! path = "data/snapshots"
//!
//! [rate_limiting]
//! messages_per_second = 50
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollabConfig {
    /// When false the server does not bind at all.
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    /// URL prefix; clients connect to `{path}/{room_id}`.
    pub path: String,
    pub rooms: RoomsConfig,
    pub snapshots: SnapshotConfig,
    pub rate_limiting: RateLimitConfig,
    pub heartbeat: HeartbeatConfig,
    pub outbound: OutboundConfig,
    pub auth: AuthConfig,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 9090,
            path: "/collab".to_string(),
            rooms: RoomsConfig::default(),
            snapshots: SnapshotConfig::default(),
            rate_limiting: RateLimitConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            outbound: OutboundConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomsConfig {
    pub max_rooms: usize,
    /// Seconds an empty room lingers before it is snapshotted and destroyed.
    pub cleanup_timeout: u64,
    /// Participants allowed per room (0 = unlimited).
    pub max_participants: usize,
}

impl Default for RoomsConfig {
    fn default() -> Self {
        Self {
            max_rooms: 1000,
            cleanup_timeout: 30,
            max_participants: 100,
        }
    }
}

/// Snapshot persistence backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// RocksDB tables under `snapshots.path`.
    Database,
    /// One directory per room under `snapshots.path`.
    Filesystem,
    /// Process memory only (tests, throwaway servers).
    Memory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    pub enabled: bool,
    /// Seconds between scheduled snapshot passes.
    pub interval: u64,
    /// Applied updates that force a snapshot of a room.
    pub max_updates: u64,
    pub storage: StorageBackend,
    pub path: PathBuf,
    /// Snapshots older than this many seconds are pruned.
    pub max_age: u64,
    /// Seconds between pruning passes.
    pub cleanup_interval: u64,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: 60,
            max_updates: 100,
            storage: StorageBackend::Filesystem,
            path: PathBuf::from("scribe_data/snapshots"),
            max_age: 7 * 24 * 60 * 60,
            cleanup_interval: 60 * 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Inbound messages per second per connection (0 = unlimited).
    pub messages_per_second: u32,
    /// Concurrent connections per client IP (0 = unlimited).
    pub connections_per_ip: usize,
    /// Concurrent connections per user (0 = unlimited).
    pub connections_per_user: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            messages_per_second: 50,
            connections_per_ip: 20,
            connections_per_user: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Seconds without a PING before the connection is closed.
    pub timeout: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self { timeout: 60 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboundConfig {
    /// Queued presence/heartbeat frames per connection before the oldest drop.
    pub queue_capacity: usize,
    /// Queued SYNC/CONTROL frames after which a slow consumer is evicted.
    pub max_pending_sync: usize,
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            max_pending_sync: 4096,
        }
    }
}

/// Static credentials for the bundled token authenticator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Accept connections without a token as read-write guests.
    pub allow_anonymous: bool,
    pub tokens: Vec<TokenEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenEntry {
    pub token: String,
    pub user_id: String,
    pub username: String,
    #[serde(default = "default_role")]
    pub role: String,
    #[serde(default = "default_true")]
    pub can_edit: bool,
    #[serde(default = "default_true")]
    pub can_view: bool,
}

fn default_role() -> String {
    "editor".to_string()
}

fn default_true() -> bool {
    true
}

impl CollabConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: CollabConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Configuration for tests: in-memory snapshots, short timers.
    pub fn for_testing() -> Self {
        Self {
            port: 0,
            rooms: RoomsConfig {
                cleanup_timeout: 1,
                ..RoomsConfig::default()
            },
            snapshots: SnapshotConfig {
                storage: StorageBackend::Memory,
                ..SnapshotConfig::default()
            },
            auth: AuthConfig {
                allow_anonymous: true,
                tokens: Vec::new(),
            },
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "path must start with '/', got {:?}",
                self.path
            )));
        }
        if self.rooms.max_rooms == 0 {
            return Err(ConfigError::Invalid("rooms.max_rooms must be positive".into()));
        }
        if self.snapshots.enabled && self.snapshots.interval == 0 {
            return Err(ConfigError::Invalid("snapshots.interval must be positive".into()));
        }
        if self.snapshots.enabled && self.snapshots.cleanup_interval == 0 {
            return Err(ConfigError::Invalid(
                "snapshots.cleanup_interval must be positive".into(),
            ));
        }
        if self.heartbeat.timeout == 0 {
            return Err(ConfigError::Invalid("heartbeat.timeout must be positive".into()));
        }
        if self.outbound.queue_capacity == 0 || self.outbound.max_pending_sync == 0 {
            return Err(ConfigError::Invalid("outbound queue sizes must be positive".into()));
        }
        Ok(())
    }

    /// `host:port` for the listener.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Route prefix without a trailing slash.
    pub fn route_prefix(&self) -> &str {
        self.path.trim_end_matches('/')
    }

    pub fn cleanup_timeout(&self) -> Duration {
        Duration::from_secs(self.rooms.cleanup_timeout)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat.timeout)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshots.interval)
    }

    pub fn snapshot_max_age(&self) -> Duration {
        Duration::from_secs(self.snapshots.max_age)
    }

    pub fn snapshot_cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.snapshots.cleanup_interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = CollabConfig::default();
        assert!(config.enabled);
        assert_eq!(config.bind_addr(), "127.0.0.1:9090");
        assert_eq!(config.path, "/collab");
        assert_eq!(config.rooms.max_rooms, 1000);
        assert_eq!(config.rooms.cleanup_timeout, 30);
        assert_eq!(config.snapshots.storage, StorageBackend::Filesystem);
        assert_eq!(config.snapshots.max_updates, 100);
        assert_eq!(config.rate_limiting.messages_per_second, 50);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = CollabConfig::from_toml_str(
            r#"
            port = 7000

            [rooms]
            max_rooms = 5

            [snapshots]
            storage = "database"
            path = "/var/lib/scribe"

            [rate_limiting]
            connections_per_ip = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.port, 7000);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.rooms.max_rooms, 5);
        assert_eq!(config.rooms.cleanup_timeout, 30);
        assert_eq!(config.snapshots.storage, StorageBackend::Database);
        assert_eq!(config.snapshots.path, PathBuf::from("/var/lib/scribe"));
        assert_eq!(config.rate_limiting.connections_per_ip, 3);
        assert_eq!(config.rate_limiting.messages_per_second, 50);
    }

    #[test]
    fn test_auth_tokens() {
        let config = CollabConfig::from_toml_str(
            r#"
            [[auth.tokens]]
            token = "secret"
            user_id = "u1"
            username = "Ann"

            [[auth.tokens]]
            token = "viewer"
            user_id = "u2"
            username = "Bob"
            role = "viewer"
            can_edit = false
            "#,
        )
        .unwrap();

        assert_eq!(config.auth.tokens.len(), 2);
        assert_eq!(config.auth.tokens[0].role, "editor");
        assert!(config.auth.tokens[0].can_edit);
        assert!(!config.auth.tokens[1].can_edit);
        assert!(config.auth.tokens[1].can_view);
    }

    #[test]
    fn test_unknown_backend_rejected() {
        let err = CollabConfig::from_toml_str("[snapshots]\nstorage = \"s3\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_validation() {
        let mut config = CollabConfig::default();
        config.path = "collab".into();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = CollabConfig::default();
        config.rooms.max_rooms = 0;
        assert!(config.validate().is_err());

        let mut config = CollabConfig::default();
        config.snapshots.enabled = false;
        config.snapshots.interval = 0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_route_prefix_and_durations() {
        let mut config = CollabConfig::default();
        config.path = "/collab/".into();
        assert_eq!(config.route_prefix(), "/collab");
        assert_eq!(config.cleanup_timeout(), Duration::from_secs(30));
        assert_eq!(config.liveness_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_load_missing_file() {
        let err = CollabConfig::load("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
