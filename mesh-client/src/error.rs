//! Error types for the mesh node.

use mesh_types::MessageError;

use crate::config::ConfigError;
use crate::identity::IdentityError;
use crate::store::StoreError;
use crate::sync_state::SyncStateError;
use crate::transport::TransportError;

/// Main error type for mesh node operations.
#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    /// The node is not running.
    #[error("mesh node not running")]
    NotRunning,

    /// Transport error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Message encoding or validation error.
    #[error("message error: {0}")]
    Message(#[from] MessageError),

    /// Identity could not be loaded or persisted.
    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),

    /// Sync timestamp could not be loaded or persisted.
    #[error("sync state error: {0}")]
    SyncState(#[from] SyncStateError),

    /// Inventory store error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
