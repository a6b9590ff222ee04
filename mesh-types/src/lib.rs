//! # mesh-types
//!
//! Wire format types for the prepper-mesh inventory sync protocol.
//!
//! This crate provides the foundational types shared by every prepper-mesh crate:
//! - [`PeerId`], [`Topic`] - Peer identity and protocol addressing
//! - [`SyncRequest`], [`InventoryPayload`] - Protocol messages
//! - [`FoodItemRecord`], [`PersonRecord`] - Inventory records keyed by name
//! - [`InventorySnapshot`] - Leniently decoded inbound inventory
//! - [`MessageError`] - Error types
//!
//! Every message travels as a single UTF-8 JSON document per stream.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod ids;
mod messages;
mod topic;

pub use error::MessageError;
pub use ids::PeerId;
pub use messages::{
    decode, encode, FoodItemRecord, InventoryPayload, InventorySnapshot, PersonRecord,
    SyncRequest, MAX_MESSAGE_SIZE,
};
pub use topic::{Topic, PRESENCE_PROTOCOL, PROTOCOL_NAMESPACE};
