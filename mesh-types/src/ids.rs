//! Peer identity for prepper-mesh.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable, opaque identifier of a peer in the mesh.
///
/// This is the textual form of the peer's public key as produced by the
/// transport. The engine never interprets it beyond equality and ordering.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Create a PeerId from its textual form.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The textual form of this id.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form for log lines.
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(10)
            .map(|(i, _)| i)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.short())
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_serializes_as_plain_string() {
        let id = PeerId::new("k51qzi5uqu5d");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"k51qzi5uqu5d\"");

        let restored: PeerId = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, id);
    }

    #[test]
    fn debug_abbreviates() {
        let id = PeerId::new("abcdefghijklmnopqrstuvwxyz");
        assert_eq!(format!("{:?}", id), "PeerId(abcdefghij)");
        assert_eq!(id.to_string(), "abcdefghijklmnopqrstuvwxyz");
    }

    #[test]
    fn short_handles_short_ids() {
        let id = PeerId::new("abc");
        assert_eq!(id.short(), "abc");
    }
}
