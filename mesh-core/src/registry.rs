//! Peer registry.
//!
//! Tracks the peers with a live transport connection. Entries are created on
//! connect and removed on disconnect; readers always get copies.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use mesh_types::PeerId;

/// A connected peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    /// Remote node id
    pub id: PeerId,
    /// When the connection was recorded (epoch millis)
    pub connected_at: u64,
    /// Remote addresses as reported by the transport
    pub addresses: Vec<String>,
}

/// Result of recording a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// The peer was not in the registry.
    New,
    /// The peer was already present; its record was overwritten.
    Refreshed,
}

impl ConnectOutcome {
    /// True for a peer that was not previously registered.
    pub fn is_new(self) -> bool {
        matches!(self, Self::New)
    }
}

/// Synchronized map of connected peers.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: RwLock<HashMap<PeerId, PeerRecord>>,
}

impl PeerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a connection.
    ///
    /// A duplicate connect overwrites the record and reports `Refreshed`, so
    /// callers can fire "new peer" effects once per connection.
    pub fn on_connect(
        &self,
        id: PeerId,
        addresses: Vec<String>,
        connected_at: u64,
    ) -> ConnectOutcome {
        let record = PeerRecord {
            id: id.clone(),
            connected_at,
            addresses,
        };
        match self.write().insert(id, record) {
            Some(_) => ConnectOutcome::Refreshed,
            None => ConnectOutcome::New,
        }
    }

    /// Remove a peer. Returns false if it was not registered.
    pub fn on_disconnect(&self, id: &PeerId) -> bool {
        self.write().remove(id).is_some()
    }

    /// Copy of all records, ordered by connection time then id.
    pub fn snapshot(&self) -> Vec<PeerRecord> {
        let mut peers: Vec<PeerRecord> = self.read().values().cloned().collect();
        peers.sort_by(|a, b| {
            a.connected_at
                .cmp(&b.connected_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        peers
    }

    /// Ids of all connected peers, in snapshot order.
    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.snapshot().into_iter().map(|p| p.id).collect()
    }

    /// Look up a single peer.
    pub fn get(&self, id: &PeerId) -> Option<PeerRecord> {
        self.read().get(id).cloned()
    }

    /// Check whether a peer is connected.
    pub fn contains(&self, id: &PeerId) -> bool {
        self.read().contains_key(id)
    }

    /// Number of connected peers.
    pub fn count(&self) -> usize {
        self.read().len()
    }

    /// Remove every entry (used on engine stop).
    pub fn clear(&self) {
        self.write().clear();
    }

    // A panic while holding the lock cannot leave the map half-updated
    // (every mutation is a single HashMap call), so poisoning is ignored.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<PeerId, PeerRecord>> {
        self.peers.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<PeerId, PeerRecord>> {
        self.peers.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn peer(s: &str) -> PeerId {
        PeerId::new(s)
    }

    #[test]
    fn connect_then_disconnect() {
        let registry = PeerRegistry::new();
        assert_eq!(
            registry.on_connect(peer("a"), vec!["10.0.0.2:4000".into()], 1),
            ConnectOutcome::New
        );
        assert!(registry.contains(&peer("a")));
        assert_eq!(registry.count(), 1);

        assert!(registry.on_disconnect(&peer("a")));
        assert!(!registry.contains(&peer("a")));
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn duplicate_connect_is_refreshed() {
        let registry = PeerRegistry::new();
        assert!(registry.on_connect(peer("a"), vec![], 1).is_new());
        let outcome = registry.on_connect(peer("a"), vec!["10.0.0.3:4000".into()], 5);
        assert_eq!(outcome, ConnectOutcome::Refreshed);
        assert!(!outcome.is_new());

        assert_eq!(registry.count(), 1);
        let record = registry.get(&peer("a")).unwrap();
        assert_eq!(record.connected_at, 5);
        assert_eq!(record.addresses, vec!["10.0.0.3:4000".to_string()]);
    }

    #[test]
    fn disconnect_unknown_is_noop() {
        let registry = PeerRegistry::new();
        registry.on_connect(peer("a"), vec![], 1);
        assert!(!registry.on_disconnect(&peer("zzz")));
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn snapshot_ordered_by_connect_time_then_id() {
        let registry = PeerRegistry::new();
        registry.on_connect(peer("c"), vec![], 20);
        registry.on_connect(peer("b"), vec![], 10);
        registry.on_connect(peer("a"), vec![], 20);

        let ids: Vec<String> = registry
            .peer_ids()
            .into_iter()
            .map(|p| p.as_str().to_string())
            .collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
    }

    #[test]
    fn snapshot_is_a_copy() {
        let registry = PeerRegistry::new();
        registry.on_connect(peer("a"), vec![], 1);
        let snapshot = registry.snapshot();
        registry.clear();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn matches_live_connections_after_interleaving() {
        let registry = PeerRegistry::new();
        registry.on_connect(peer("a"), vec![], 1);
        registry.on_connect(peer("b"), vec![], 2);
        registry.on_disconnect(&peer("a"));
        registry.on_connect(peer("c"), vec![], 3);
        registry.on_connect(peer("a"), vec![], 4);
        registry.on_disconnect(&peer("b"));

        let ids: Vec<PeerId> = registry.peer_ids();
        assert_eq!(ids, vec![peer("c"), peer("a")]);
    }

    #[test]
    fn concurrent_connects() {
        let registry = Arc::new(PeerRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for j in 0..50 {
                        registry.on_connect(peer(&format!("peer-{i}-{j}")), vec![], j);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.count(), 400);
    }
}
