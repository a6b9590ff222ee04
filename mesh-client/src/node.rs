//! MeshNode - the sync orchestrator.
//!
//! Owns the transport, the peer registry and the inventory store, and ties
//! them together:
//!
//! - a newly connected peer gets our inventory pushed after a short delay
//! - `request_sync()` asks every connected peer to push theirs
//! - inbound `sync-request` messages are answered with our inventory
//! - inbound `inventory-data` messages are merged into the store
//!
//! Start and stop run through the [`EngineState`] machine from mesh-core;
//! the node only executes the actions it returns.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use futures_util::FutureExt;
use mesh_core::{Action, EngineState, LifecycleEvent, PeerRecord, PeerRegistry, SingleFlight};
use mesh_types::{decode, InventoryPayload, InventorySnapshot, PeerId, SyncRequest, Topic};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinSet;

use crate::config::NodeSettings;
use crate::error::MeshError;
use crate::identity::{create_private_dir, IdentityStore};
use crate::merge::{MergeEngine, MergeSummary};
use crate::now_millis;
use crate::protocol::{MessageHandler, ProtocolHandler};
use crate::store::InventoryStore;
use crate::sync_state::SyncStateStore;
use crate::transport::{ListenConfig, StartInfo, Transport, TransportEvent, EVENT_CHANNEL_CAPACITY};

/// Notifications for the host application.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeEvent {
    /// The node is listening.
    Started(StartInfo),
    /// The node shut down.
    Stopped,
    /// A peer was seen on the local network.
    PeerDiscovered(PeerId),
    /// A peer joined the registry.
    PeerConnected(PeerId),
    /// A peer left the registry.
    PeerDisconnected(PeerId),
    /// An inbound inventory was merged.
    InventoryMerged {
        /// Sender of the inventory.
        peer: PeerId,
        /// Merge counts.
        summary: MergeSummary,
    },
}

/// Outcome of [`MeshNode::request_sync`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncRound {
    /// A sync request went out to this many peers.
    Broadcast {
        /// Peers a request was attempted to.
        peers: usize,
    },
    /// Another sync round was already in progress.
    Skipped,
}

/// Point-in-time view of a node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeStatus {
    /// Lifecycle state.
    pub state: EngineState,
    /// Local id, while running.
    pub local_id: Option<PeerId>,
    /// Connected peers.
    pub peers: Vec<PeerRecord>,
    /// Last sync round (epoch millis, 0 = never).
    pub last_sync: u64,
}

impl NodeStatus {
    /// Whether the node is running.
    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }
}

/// A mesh sync node.
///
/// Cheap to clone; clones share the same node.
///
/// # Example
///
/// ```ignore
/// let node = MeshNode::new(IrohTransport::new(), store, NodeSettings::new("data/mesh"));
/// let mut events = node.subscribe();
/// node.start().await?;
///
/// while let Ok(event) = events.recv().await {
///     println!("{event:?}");
/// }
/// ```
pub struct MeshNode<T: Transport, S: InventoryStore> {
    inner: Arc<NodeInner<T, S>>,
}

impl<T: Transport, S: InventoryStore> Clone for MeshNode<T, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport, S: InventoryStore> std::fmt::Debug for MeshNode<T, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshNode")
            .field("state", &self.state())
            .field("local_id", &self.local_id())
            .field("peers", &self.inner.registry.count())
            .finish_non_exhaustive()
    }
}

struct NodeInner<T: Transport, S: InventoryStore> {
    transport: Arc<T>,
    store: Arc<S>,
    settings: NodeSettings,
    registry: Arc<PeerRegistry>,
    protocol: ProtocolHandler<T>,
    merge: MergeEngine<S>,
    identity_store: IdentityStore,
    sync_state: SyncStateStore,
    sync_latch: SingleFlight,
    state: Mutex<EngineState>,
    runtime: Mutex<Runtime>,
    // Serializes start() and stop()
    lifecycle: tokio::sync::Mutex<()>,
    events_tx: broadcast::Sender<NodeEvent>,
}

/// Resources that exist only while running.
#[derive(Default)]
struct Runtime {
    info: Option<StartInfo>,
    pending_events: Option<broadcast::Receiver<TransportEvent>>,
    tasks: JoinSet<()>,
}

impl<T: Transport, S: InventoryStore> MeshNode<T, S> {
    /// Create a stopped node.
    pub fn new(transport: T, store: S, settings: NodeSettings) -> Self {
        let transport = Arc::new(transport);
        let store = Arc::new(store);
        let registry = Arc::new(PeerRegistry::new());
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let inner = NodeInner {
            protocol: ProtocolHandler::new(
                Arc::clone(&transport),
                Arc::clone(&registry),
                settings.read_timeout,
            ),
            merge: MergeEngine::new(Arc::clone(&store)),
            identity_store: IdentityStore::new(&settings.data_dir),
            sync_state: SyncStateStore::new(&settings.data_dir),
            transport,
            store,
            settings,
            registry,
            sync_latch: SingleFlight::new(),
            state: Mutex::new(EngineState::new()),
            runtime: Mutex::new(Runtime::default()),
            lifecycle: tokio::sync::Mutex::new(()),
            events_tx,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Start listening, discovering and syncing.
    ///
    /// Returns the current [`StartInfo`] if the node is already running.
    ///
    /// # Errors
    ///
    /// Identity or data directory I/O failures, or the transport failing to
    /// start. The node is left stopped.
    pub async fn start(&self) -> Result<StartInfo, MeshError> {
        let _lifecycle = self.inner.lifecycle.lock().await;

        if self.state().is_running() {
            return self.inner.start_info().ok_or(MeshError::NotRunning);
        }

        let actions = self.inner.transition(LifecycleEvent::StartRequested);
        if let Err(e) = self.inner.perform(actions).await {
            tracing::error!(error = %e, "mesh node failed to start");
            let actions = self.inner.transition(LifecycleEvent::StartFailed);
            let _ = self.inner.perform(actions).await;
            return Err(e);
        }

        let actions = self.inner.transition(LifecycleEvent::StartSucceeded);
        self.inner.perform(actions).await?;

        let info = self.inner.start_info().ok_or(MeshError::NotRunning)?;
        tracing::info!(
            id = %info.local_id,
            addresses = ?info.listen_addresses,
            "mesh node started"
        );
        Ok(info)
    }

    /// Stop the node. Idempotent.
    pub async fn stop(&self) {
        let _lifecycle = self.inner.lifecycle.lock().await;

        let actions = self.inner.transition(LifecycleEvent::StopRequested);
        if actions.is_empty() {
            return;
        }
        if let Err(e) = self.inner.perform(actions).await {
            tracing::warn!(error = %e, "error while stopping mesh node");
        }
        let actions = self.inner.transition(LifecycleEvent::StopCompleted);
        if let Err(e) = self.inner.perform(actions).await {
            tracing::warn!(error = %e, "error while stopping mesh node");
        }
        tracing::info!("mesh node stopped");
    }

    /// Ask every connected peer to push its inventory to us.
    ///
    /// At most one round runs at a time; a concurrent call returns
    /// [`SyncRound::Skipped`] without sending anything.
    ///
    /// # Errors
    ///
    /// `NotRunning` if the node is stopped.
    pub async fn request_sync(&self) -> Result<SyncRound, MeshError> {
        if !self.state().is_running() {
            return Err(MeshError::NotRunning);
        }
        let Some(_round) = self.inner.sync_latch.try_acquire() else {
            tracing::debug!("sync already in progress, skipping request");
            return Ok(SyncRound::Skipped);
        };

        let last_sync = match self.inner.sync_state.load().await {
            Ok(timestamp) => timestamp,
            Err(e) => {
                tracing::warn!(error = %e, "could not read last sync time, using 0");
                0
            }
        };
        let request = SyncRequest {
            peer_id: self.local_id().ok_or(MeshError::NotRunning)?,
            timestamp: last_sync,
        };

        let peers = self
            .inner
            .protocol
            .broadcast(Topic::SYNC_REQUEST, &request)
            .await?;

        // Recorded whether or not any peer answers
        if let Err(e) = self.inner.sync_state.record(now_millis()).await {
            tracing::warn!(error = %e, "could not record sync time");
        }

        tracing::info!(peers, since = last_sync, "requested sync");
        Ok(SyncRound::Broadcast { peers })
    }

    /// Push the full local inventory to one peer.
    pub async fn share_inventory_with(&self, peer: &PeerId) -> Result<(), MeshError> {
        self.inner.share_inventory_with(peer).await
    }

    /// Connected peers, ordered by connection time.
    pub fn peers(&self) -> Vec<PeerRecord> {
        self.inner.registry.snapshot()
    }

    /// Local id, while running.
    pub fn local_id(&self) -> Option<PeerId> {
        self.inner.start_info().map(|info| info.local_id)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EngineState {
        *self.inner.lock_state()
    }

    /// Snapshot of state, peers and last sync time.
    pub async fn status(&self) -> NodeStatus {
        NodeStatus {
            state: self.state(),
            local_id: self.local_id(),
            peers: self.peers(),
            last_sync: self.inner.sync_state.load().await.unwrap_or(0),
        }
    }

    /// Subscribe to node events.
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.inner.events_tx.subscribe()
    }

    /// The inventory store.
    pub fn store(&self) -> &S {
        &self.inner.store
    }

    /// The transport.
    pub fn transport(&self) -> &T {
        &self.inner.transport
    }
}

impl<T: Transport, S: InventoryStore> NodeInner<T, S> {
    fn lock_state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn runtime(&self) -> MutexGuard<'_, Runtime> {
        self.runtime.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn start_info(&self) -> Option<StartInfo> {
        self.runtime().info.clone()
    }

    fn emit(&self, event: NodeEvent) {
        let _ = self.events_tx.send(event);
    }

    fn transition(&self, event: LifecycleEvent) -> Vec<Action> {
        let mut state = self.lock_state();
        let (next, actions) = state.on_event(event);
        if next != *state {
            tracing::debug!(from = ?*state, to = ?next, ?event, "lifecycle transition");
        }
        *state = next;
        actions
    }

    async fn perform(self: &Arc<Self>, actions: Vec<Action>) -> Result<(), MeshError> {
        for action in actions {
            match action {
                Action::StartTransport => self.start_transport().await?,
                Action::RegisterHandlers => self.register_handlers(),
                Action::SpawnEventLoop => self.spawn_event_loop(),
                Action::EmitStarted => {
                    if let Some(info) = self.start_info() {
                        self.emit(NodeEvent::Started(info));
                    }
                }
                Action::AbortTasks => self.runtime().tasks.abort_all(),
                Action::StopTransport => {
                    self.transport.stop().await;
                    let mut runtime = self.runtime();
                    runtime.info = None;
                    runtime.pending_events = None;
                }
                Action::ClearRegistry => self.registry.clear(),
                Action::EmitStopped => self.emit(NodeEvent::Stopped),
            }
        }
        Ok(())
    }

    async fn start_transport(&self) -> Result<(), MeshError> {
        create_private_dir(&self.settings.data_dir).await?;

        let (identity, source) = self.identity_store.load_or_create().await?;
        tracing::info!(id = %identity.id(), ?source, "node identity ready");

        // Subscribe first so no connection made during start is missed
        let events = self.transport.events();
        self.runtime().pending_events = Some(events);

        let config = ListenConfig {
            identity,
            port: self.settings.port,
            discovery: self.settings.discovery,
            discovery_interval: self.settings.discovery_interval,
            dial_timeout: self.settings.dial_timeout,
        };
        let info = self.transport.start(&config).await?;
        self.runtime().info = Some(info);
        Ok(())
    }

    fn register_handlers(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let on_sync_request: MessageHandler = Arc::new(move |bytes: Vec<u8>, peer: PeerId| {
            let weak = Weak::clone(&weak);
            async move {
                let inner = weak.upgrade().ok_or(MeshError::NotRunning)?;
                inner.on_sync_request(&bytes, peer).await
            }
            .boxed()
        });
        self.protocol
            .register_handler(Topic::SYNC_REQUEST, on_sync_request);

        let weak = Arc::downgrade(self);
        let on_inventory: MessageHandler = Arc::new(move |bytes: Vec<u8>, peer: PeerId| {
            let weak = Weak::clone(&weak);
            async move {
                let inner = weak.upgrade().ok_or(MeshError::NotRunning)?;
                inner.on_inventory_data(&bytes, peer).await
            }
            .boxed()
        });
        self.protocol
            .register_handler(Topic::INVENTORY_DATA, on_inventory);
    }

    fn spawn_event_loop(self: &Arc<Self>) {
        let mut runtime = self.runtime();
        let Some(events) = runtime.pending_events.take() else {
            tracing::warn!("no transport subscription, event loop not started");
            return;
        };
        runtime
            .tasks
            .spawn(event_loop(Arc::downgrade(self), events));
    }

    fn on_transport_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::PeerDiscovered(peer) => {
                tracing::debug!(peer = %peer.short(), "discovered peer");
                self.emit(NodeEvent::PeerDiscovered(peer));
            }
            TransportEvent::PeerConnected { peer, addresses } => {
                let outcome = self
                    .registry
                    .on_connect(peer.clone(), addresses, now_millis());
                if !outcome.is_new() {
                    tracing::debug!(peer = %peer.short(), "peer connection refreshed");
                    return;
                }
                tracing::info!(peer = %peer, peers = self.registry.count(), "peer connected");
                self.emit(NodeEvent::PeerConnected(peer.clone()));
                self.schedule_auto_push(peer);
            }
            TransportEvent::PeerDisconnected(peer) => {
                if self.registry.on_disconnect(&peer) {
                    tracing::info!(peer = %peer, peers = self.registry.count(), "peer disconnected");
                    self.emit(NodeEvent::PeerDisconnected(peer));
                }
            }
        }
    }

    fn schedule_auto_push(self: &Arc<Self>, peer: PeerId) {
        let weak = Arc::downgrade(self);
        let delay = self.settings.auto_push_delay;

        let mut runtime = self.runtime();
        while runtime.tasks.try_join_next().is_some() {}
        runtime.tasks.spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if let Err(e) = inner.share_inventory_with(&peer).await {
                tracing::warn!(peer = %peer.short(), error = %e, "automatic inventory push failed");
            }
        });
    }

    async fn share_inventory_with(&self, peer: &PeerId) -> Result<(), MeshError> {
        let food_items = self.store.list_food_items().await?;
        let people = self.store.list_people().await?;
        let payload = InventoryPayload {
            food_items,
            people,
            timestamp: now_millis(),
        };

        self.protocol
            .send(peer, Topic::INVENTORY_DATA, &payload)
            .await?;

        tracing::info!(
            peer = %peer.short(),
            food_items = payload.food_items.len(),
            people = payload.people.len(),
            "shared inventory"
        );
        Ok(())
    }

    async fn on_sync_request(&self, bytes: &[u8], peer: PeerId) -> Result<(), MeshError> {
        match decode::<SyncRequest>(bytes) {
            Ok(request) => tracing::info!(
                peer = %peer.short(),
                since = request.timestamp,
                "received sync request"
            ),
            Err(e) => tracing::debug!(peer = %peer.short(), error = %e, "sync request body unreadable"),
        }
        self.share_inventory_with(&peer).await
    }

    async fn on_inventory_data(&self, bytes: &[u8], peer: PeerId) -> Result<(), MeshError> {
        let snapshot = InventorySnapshot::from_bytes(bytes)?;
        let summary = self.merge.merge(&snapshot).await;

        tracing::info!(
            peer = %peer.short(),
            created = summary.created,
            updated = summary.updated,
            skipped = summary.skipped,
            failed = summary.failed,
            "merged inventory"
        );
        self.emit(NodeEvent::InventoryMerged { peer, summary });
        Ok(())
    }
}

async fn event_loop<T: Transport, S: InventoryStore>(
    inner: Weak<NodeInner<T, S>>,
    mut events: broadcast::Receiver<TransportEvent>,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "transport events lagged");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.on_transport_event(event);
    }
}
