//! Collaboration server: listener, connection tasks and maintenance.
//!
//! Architecture:
//! ```text
//!                    TcpListener
//!                        │ accept
//!                        ▼
//!              Gateway (one task per connection)
//!                        │
//!                        ▼
//!                   RoomManager ──────────┬──────────────┐
//!                        │                │              │
//!                        ▼                ▼              ▼
//!                   SyncEngine     PresenceTracker  SnapshotManager
//!                  (yrs Doc/room)                        │
//!                                                        ▼
//!                                          SnapshotStorage (RocksDB | files | memory)
//!
//! maintenance task: snapshot dirty rooms every `snapshots.interval`,
//!                   prune old snapshots every `snapshots.cleanup_interval`
//! ```

use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::auth::Authenticator;
use crate::config::{CollabConfig, ConfigError};
use crate::gateway::{Gateway, GatewayStats};
use crate::presence::PresenceTracker;
use crate::room::{RecordStore, RoomManager, RoomSettings, RoomStats};
use crate::snapshot::{SnapshotManager, SnapshotStats};
use crate::storage::{open_storage, StorageError};
use crate::sync::SyncEngine;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("snapshot storage: {0}")]
    Storage(#[from] StorageError),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub rooms: RoomStats,
    pub gateway: GatewayStats,
    pub snapshots: SnapshotStats,
    pub documents: usize,
}

/// The collaboration server.
pub struct CollabServer {
    config: Arc<CollabConfig>,
    rooms: Arc<RoomManager>,
    gateway: Arc<Gateway>,
}

impl CollabServer {
    /// Validate the configuration and open snapshot storage.
    pub fn new(
        config: CollabConfig,
        authenticator: Arc<dyn Authenticator>,
    ) -> Result<Self, ServerError> {
        Self::build(config, authenticator, None)
    }

    /// Like [`new`](Self::new), handing each destroyed room's final state to
    /// `record_store`.
    pub fn with_record_store(
        config: CollabConfig,
        authenticator: Arc<dyn Authenticator>,
        record_store: Arc<dyn RecordStore>,
    ) -> Result<Self, ServerError> {
        Self::build(config, authenticator, Some(record_store))
    }

    fn build(
        config: CollabConfig,
        authenticator: Arc<dyn Authenticator>,
        record_store: Option<Arc<dyn RecordStore>>,
    ) -> Result<Self, ServerError> {
        config.validate()?;

        let snapshots = if config.snapshots.enabled {
            SnapshotManager::new(open_storage(&config.snapshots)?)
        } else {
            log::info!("Snapshots disabled; room state lives only in memory");
            SnapshotManager::in_memory()
        };

        let mut rooms = RoomManager::new(
            RoomSettings::from_config(&config),
            Arc::new(SyncEngine::new()),
            Arc::new(PresenceTracker::new()),
            Arc::new(snapshots),
        );
        if let Some(record_store) = record_store {
            rooms = rooms.with_record_store(record_store);
        }
        let rooms = Arc::new(rooms);

        let config = Arc::new(config);
        let gateway = Arc::new(Gateway::new(config.clone(), rooms.clone(), authenticator));

        Ok(Self {
            config,
            rooms,
            gateway,
        })
    }

    pub fn config(&self) -> &CollabConfig {
        &self.config
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }

    pub async fn stats(&self) -> ServerStats {
        ServerStats {
            rooms: self.rooms.stats().await,
            gateway: self.gateway.stats(),
            snapshots: self.rooms.snapshots().stats(),
            documents: self.rooms.sync().document_count(),
        }
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        let addr = self.config.bind_addr();
        TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })
    }

    /// Bind and serve until `shutdown` resolves. Returns at once when the
    /// server is disabled in the configuration.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) -> Result<(), ServerError> {
        if !self.config.enabled {
            log::info!("Collaboration server disabled; not listening");
            return Ok(());
        }
        let listener = self.bind().await?;
        self.serve(listener, shutdown).await;
        Ok(())
    }

    /// Accept connections on `listener` until `shutdown` resolves, then flush
    /// pending snapshots.
    pub async fn serve(&self, listener: TcpListener, shutdown: impl Future<Output = ()>) {
        match listener.local_addr() {
            Ok(addr) => log::info!(
                "Collaboration server listening on ws://{addr}{}/{{room_id}}",
                self.config.route_prefix()
            ),
            Err(e) => log::warn!("Listening on unknown address: {e}"),
        }

        let maintenance = self.spawn_maintenance();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            log::debug!("New TCP connection from {addr}");
                            let gateway = self.gateway.clone();
                            tokio::spawn(async move {
                                if let Err(e) = gateway.handle_connection(stream, addr).await {
                                    log::error!("Connection error from {addr}: {e}");
                                }
                            });
                        }
                        Err(e) => log::warn!("Accept failed: {e}"),
                    }
                }
                _ = &mut shutdown => break,
            }
        }

        if let Some(maintenance) = maintenance {
            maintenance.abort();
        }
        let flushed = self.rooms.snapshot_dirty_rooms().await;
        log::info!("Collaboration server stopped, {flushed} room snapshot(s) flushed");
    }

    fn spawn_maintenance(&self) -> Option<JoinHandle<()>> {
        if !self.config.snapshots.enabled {
            return None;
        }
        let rooms = self.rooms.clone();
        let snapshot_every = self.config.snapshot_interval();
        let prune_every = self.config.snapshot_cleanup_interval();
        let max_age = self.config.snapshot_max_age();

        Some(tokio::spawn(async move {
            let start = tokio::time::Instant::now();
            let mut snapshot_tick = tokio::time::interval_at(start + snapshot_every, snapshot_every);
            let mut prune_tick = tokio::time::interval_at(start + prune_every, prune_every);

            loop {
                tokio::select! {
                    _ = snapshot_tick.tick() => {
                        let saved = rooms.snapshot_dirty_rooms().await;
                        if saved > 0 {
                            log::debug!("Periodic pass saved {saved} snapshot(s)");
                        }
                    }
                    _ = prune_tick.tick() => {
                        if let Err(e) = rooms.snapshots().cleanup_old_snapshots(max_age).await {
                            log::warn!("Snapshot pruning failed: {e}");
                        }
                    }
                }
            }
        }))
    }
}
