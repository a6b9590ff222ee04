//! Protocol topics.
//!
//! Each topic maps to its own protocol identifier (`/prepper/{topic}`), and
//! every message on a topic is carried by a freshly opened stream.

use std::fmt;

/// Namespace prefix shared by every prepper-mesh protocol identifier.
pub const PROTOCOL_NAMESPACE: &str = "/prepper";

/// Protocol identifier of the long-lived presence connection between peers.
///
/// Presence connections carry no messages; their lifetime defines
/// "connected" for the peer registry.
pub const PRESENCE_PROTOCOL: &[u8] = b"/prepper/mesh/1";

/// A named message topic.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Topic(&'static str);

impl Topic {
    /// Ask a peer to push its inventory to us.
    pub const SYNC_REQUEST: Topic = Topic("sync-request");

    /// A full inventory snapshot pushed to a peer.
    pub const INVENTORY_DATA: Topic = Topic("inventory-data");

    /// Topics served by every node.
    pub const ALL: [Topic; 2] = [Topic::SYNC_REQUEST, Topic::INVENTORY_DATA];

    /// Define a topic by name.
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    /// Bare topic name, e.g. `sync-request`.
    pub fn name(&self) -> &'static str {
        self.0
    }

    /// Namespaced protocol identifier, e.g. `/prepper/sync-request`.
    pub fn protocol_id(&self) -> String {
        format!("{}/{}", PROTOCOL_NAMESPACE, self.0)
    }

    /// Look up a well-known topic from its protocol identifier.
    pub fn from_protocol_id(id: &[u8]) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|topic| topic.protocol_id().as_bytes() == id)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

impl fmt::Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Topic({})", self.0)
    }
}
