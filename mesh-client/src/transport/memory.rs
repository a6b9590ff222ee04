//! In-process transport for tests and demos.
//!
//! A [`MemoryNetwork`] plays the role of the local network: transports
//! started on it register under their node id, and explicit `link` /
//! `unlink` calls stand in for discovery plus connect and disconnect.
//! Streams are `tokio::io::duplex` pipes handed straight to the remote
//! handler.

use super::{
    ListenConfig, MeshStream, StartInfo, StreamHandler, TaskTracker, Transport, TransportError,
    TransportEvent, EVENT_CHANNEL_CAPACITY,
};
use async_trait::async_trait;
use mesh_types::{PeerId, Topic};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tokio::sync::{broadcast, watch};

/// Buffer size of each in-memory stream pipe.
const PIPE_CAPACITY: usize = 64 * 1024;

fn memory_address(id: &PeerId) -> String {
    format!("memory://{id}")
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Shared medium connecting [`MemoryTransport`]s.
#[derive(Debug, Default, Clone)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

#[derive(Debug, Default)]
struct NetworkInner {
    nodes: HashMap<PeerId, Arc<Shared>>,
    links: HashSet<(PeerId, PeerId)>,
}

fn link_key(a: &PeerId, b: &PeerId) -> (PeerId, PeerId) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

impl MemoryNetwork {
    /// Create an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a transport attached to this network.
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            network: self.clone(),
            shared: Arc::new(Shared::new()),
        }
    }

    /// Connect two started transports.
    ///
    /// Each side sees the other discovered and then connected. Linking an
    /// already linked pair does nothing.
    pub fn link(&self, a: &PeerId, b: &PeerId) -> Result<(), TransportError> {
        if a == b {
            return Err(TransportError::Dial {
                peer: b.clone(),
                reason: "cannot link a node to itself".into(),
            });
        }
        let (side_a, side_b) = {
            let mut inner = lock(&self.inner);
            let side_a = inner
                .nodes
                .get(a)
                .cloned()
                .ok_or_else(|| TransportError::UnknownPeer(a.clone()))?;
            let side_b = inner
                .nodes
                .get(b)
                .cloned()
                .ok_or_else(|| TransportError::UnknownPeer(b.clone()))?;
            if !inner.links.insert(link_key(a, b)) {
                return Ok(());
            }
            (side_a, side_b)
        };

        side_a.connected(b);
        side_b.connected(a);
        Ok(())
    }

    /// Disconnect two transports. Returns false if they were not linked.
    pub fn unlink(&self, a: &PeerId, b: &PeerId) -> bool {
        let sides = {
            let mut inner = lock(&self.inner);
            if !inner.links.remove(&link_key(a, b)) {
                return false;
            }
            (inner.nodes.get(a).cloned(), inner.nodes.get(b).cloned())
        };

        if let Some(side) = sides.0 {
            side.emit(TransportEvent::PeerDisconnected(b.clone()));
        }
        if let Some(side) = sides.1 {
            side.emit(TransportEvent::PeerDisconnected(a.clone()));
        }
        true
    }

    /// Report a linked pair connected again, as a transport does when a
    /// second connection to an already connected peer opens.
    pub fn announce(&self, a: &PeerId, b: &PeerId) -> Result<(), TransportError> {
        let (side_a, side_b) = {
            let inner = lock(&self.inner);
            if !inner.links.contains(&link_key(a, b)) {
                return Err(TransportError::UnknownPeer(b.clone()));
            }
            match (inner.nodes.get(a), inner.nodes.get(b)) {
                (Some(side_a), Some(side_b)) => (Arc::clone(side_a), Arc::clone(side_b)),
                _ => return Err(TransportError::UnknownPeer(b.clone())),
            }
        };

        side_a.connected(b);
        side_b.connected(a);
        Ok(())
    }

    /// Link every pair of started transports.
    pub fn link_all(&self) -> Result<(), TransportError> {
        let mut ids: Vec<PeerId> = lock(&self.inner).nodes.keys().cloned().collect();
        ids.sort();
        for (i, a) in ids.iter().enumerate() {
            for b in &ids[i + 1..] {
                self.link(a, b)?;
            }
        }
        Ok(())
    }

    /// Whether two transports are linked.
    pub fn is_linked(&self, a: &PeerId, b: &PeerId) -> bool {
        lock(&self.inner).links.contains(&link_key(a, b))
    }

    fn register(&self, id: &PeerId, shared: Arc<Shared>) -> Result<(), TransportError> {
        let mut inner = lock(&self.inner);
        if inner.nodes.contains_key(id) {
            return Err(TransportError::Start(format!(
                "node id {} already on the network",
                id.short()
            )));
        }
        inner.nodes.insert(id.clone(), shared);
        Ok(())
    }

    fn deregister(&self, id: &PeerId) {
        let peers: Vec<(PeerId, Arc<Shared>)> = {
            let mut inner = lock(&self.inner);
            inner.nodes.remove(id);
            let linked: Vec<PeerId> = inner
                .links
                .iter()
                .filter_map(|(a, b)| {
                    if a == id {
                        Some(b.clone())
                    } else if b == id {
                        Some(a.clone())
                    } else {
                        None
                    }
                })
                .collect();
            inner.links.retain(|(a, b)| a != id && b != id);
            linked
                .into_iter()
                .filter_map(|peer| inner.nodes.get(&peer).cloned().map(|s| (peer, s)))
                .collect()
        };

        for (_, side) in peers {
            side.emit(TransportEvent::PeerDisconnected(id.clone()));
        }
    }

    fn route(&self, from: &PeerId, to: &PeerId) -> Result<Arc<Shared>, TransportError> {
        let inner = lock(&self.inner);
        if !inner.links.contains(&link_key(from, to)) {
            return Err(TransportError::UnknownPeer(to.clone()));
        }
        inner
            .nodes
            .get(to)
            .cloned()
            .ok_or_else(|| TransportError::UnknownPeer(to.clone()))
    }
}

/// Per-transport state, shared with the network.
struct Shared {
    events_tx: broadcast::Sender<TransportEvent>,
    handlers: RwLock<HashMap<Topic, StreamHandler>>,
    running: AtomicBool,
    local_id: Mutex<Option<PeerId>>,
    failing: Mutex<HashSet<PeerId>>,
    outbound_open: watch::Sender<bool>,
    opened: Mutex<HashMap<Topic, usize>>,
    // Inbound handler tasks, aborted on stop
    inbound: TaskTracker,
}

impl std::fmt::Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared")
            .field("running", &self.running.load(Ordering::Relaxed))
            .field("local_id", &*lock(&self.local_id))
            .finish_non_exhaustive()
    }
}

impl Shared {
    fn new() -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (outbound_open, _) = watch::channel(true);
        Self {
            events_tx,
            handlers: RwLock::new(HashMap::new()),
            running: AtomicBool::new(false),
            local_id: Mutex::new(None),
            failing: Mutex::new(HashSet::new()),
            outbound_open,
            opened: Mutex::new(HashMap::new()),
            inbound: TaskTracker::default(),
        }
    }

    fn emit(&self, event: TransportEvent) {
        // No subscribers is fine
        let _ = self.events_tx.send(event);
    }

    fn connected(&self, peer: &PeerId) {
        self.emit(TransportEvent::PeerDiscovered(peer.clone()));
        self.emit(TransportEvent::PeerConnected {
            peer: peer.clone(),
            addresses: vec![memory_address(peer)],
        });
    }

    /// Hand an inbound stream to its handler on a task owned by this side.
    fn accept(&self, handler: StreamHandler, stream: MeshStream, from: PeerId) -> bool {
        if !self.running.load(Ordering::Acquire) {
            return false;
        }
        self.inbound.spawn(handler(stream, from));
        true
    }

    fn handler(&self, topic: Topic) -> Option<StreamHandler> {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&topic)
            .cloned()
    }
}

/// Transport over a [`MemoryNetwork`].
///
/// Clones share state, so a test can keep a handle for failure injection
/// after moving the transport into a node.
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    shared: Arc<Shared>,
}

impl MemoryTransport {
    /// Local id, once started.
    pub fn local_id(&self) -> Option<PeerId> {
        lock(&self.shared.local_id).clone()
    }

    /// Make every stream opened to `peer` fail with a dial error.
    pub fn fail_streams_to(&self, peer: &PeerId) {
        lock(&self.shared.failing).insert(peer.clone());
    }

    /// Undo [`fail_streams_to`](Self::fail_streams_to).
    pub fn restore_streams_to(&self, peer: &PeerId) {
        lock(&self.shared.failing).remove(peer);
    }

    /// Hold every outbound `open_stream` until [`resume_outbound`](Self::resume_outbound).
    pub fn pause_outbound(&self) {
        self.shared.outbound_open.send_replace(false);
    }

    /// Release held and future outbound streams.
    pub fn resume_outbound(&self) {
        self.shared.outbound_open.send_replace(true);
    }

    /// Number of outbound streams opened for a topic.
    pub fn opened_streams(&self, topic: Topic) -> usize {
        lock(&self.shared.opened).get(&topic).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn start(&self, config: &ListenConfig) -> Result<StartInfo, TransportError> {
        let id = config.identity.id().clone();
        if !self.shared.running.load(Ordering::Acquire) {
            self.network.register(&id, Arc::clone(&self.shared))?;
            *lock(&self.shared.local_id) = Some(id.clone());
            self.shared.running.store(true, Ordering::Release);
        }
        Ok(StartInfo {
            listen_addresses: vec![memory_address(&id)],
            local_id: id,
        })
    }

    async fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(id) = lock(&self.shared.local_id).clone() {
            self.network.deregister(&id);
        }
        self.shared.inbound.abort_all();
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.shared.events_tx.subscribe()
    }

    async fn open_stream(&self, peer: &PeerId, topic: Topic) -> Result<MeshStream, TransportError> {
        if !self.is_running() {
            return Err(TransportError::NotRunning);
        }

        let mut gate = self.shared.outbound_open.subscribe();
        gate.wait_for(|open| *open)
            .await
            .map_err(|_| TransportError::NotRunning)?;

        let local_id = self.local_id().ok_or(TransportError::NotRunning)?;
        if !self.is_running() {
            return Err(TransportError::NotRunning);
        }

        let remote = self.network.route(&local_id, peer)?;
        if lock(&self.shared.failing).contains(peer) {
            return Err(TransportError::Dial {
                peer: peer.clone(),
                reason: "injected failure".into(),
            });
        }
        let handler = remote.handler(topic).ok_or_else(|| {
            TransportError::Stream(format!("{} has no handler for {topic}", peer.short()))
        })?;

        let (local, far) = tokio::io::duplex(PIPE_CAPACITY);
        let (local_recv, local_send) = tokio::io::split(local);
        let (far_recv, far_send) = tokio::io::split(far);
        if !remote.accept(handler, MeshStream::new(far_send, far_recv), local_id) {
            return Err(TransportError::UnknownPeer(peer.clone()));
        }
        *lock(&self.shared.opened).entry(topic).or_insert(0) += 1;

        Ok(MeshStream::new(local_send, local_recv))
    }

    fn register_handler(&self, topic: Topic, handler: StreamHandler) {
        self.shared
            .handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(topic, handler);
    }

    fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }
}
