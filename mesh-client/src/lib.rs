//! # mesh-client
//!
//! Mesh sync engine for prepper inventories.
//!
//! Nodes on the same local network find each other, keep a registry of live
//! connections and exchange full inventory snapshots, reconciled with
//! last-write-wins by record name. There is no server: every node is both
//! requester and responder.
//!
//! ## Features
//!
//! - **Transport Abstraction**: iroh QUIC with mDNS discovery, or an
//!   in-process network for tests
//! - **Pure State Machine**: lifecycle and conflict resolution come from
//!   mesh-core
//! - **Persistent Identity**: the node id survives restarts
//! - **Fail-open Merge**: one bad record never rejects a whole snapshot
//!
//! ## Example
//!
//! ```ignore
//! use mesh_client::{IrohTransport, MeshConfig, MeshNode, SqliteStore};
//!
//! let config = MeshConfig::from_file("mesh.toml".as_ref())?;
//! let store = SqliteStore::new(&config.store.database).await?;
//! let node = MeshNode::new(IrohTransport::new(), store, config.node_settings());
//!
//! let info = node.start().await?;
//! println!("listening as {}", info.local_id);
//!
//! node.request_sync().await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod identity;
pub mod merge;
pub mod node;
pub mod protocol;
pub mod store;
pub mod sync_state;
pub mod transport;

pub use config::{ConfigError, MeshConfig, NodeSettings};
pub use error::MeshError;
pub use identity::{IdentityError, IdentitySource, IdentityStore, NodeIdentity};
pub use merge::{MergeEngine, MergeRecordError, MergeSummary};
pub use node::{MeshNode, NodeEvent, NodeStatus, SyncRound};
pub use protocol::{MessageHandler, ProtocolHandler};
pub use store::{InventoryStore, MemoryStore, SqliteStore, StoreError};
pub use sync_state::{SyncStateError, SyncStateStore};
pub use transport::{
    IrohTransport, ListenConfig, MemoryNetwork, MemoryTransport, MeshStream, StartInfo,
    Transport, TransportError, TransportEvent,
};

pub use mesh_core::{EngineState, PeerRecord};
pub use mesh_types::{
    FoodItemRecord, InventoryPayload, InventorySnapshot, PeerId, PersonRecord, SyncRequest, Topic,
};

/// Current wall-clock time in epoch milliseconds.
pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
