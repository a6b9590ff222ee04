//! IrohTransport - local-network P2P transport using iroh QUIC.
//!
//! Peers are found with mDNS. Each discovered peer is dialed on the presence
//! protocol, and the lifetime of presence connections defines "connected":
//! the first open connection to a peer reports it connected, the last one to
//! close reports it disconnected. Messages travel on separate connections,
//! one per message, using the topic's own protocol identifier.

use super::{
    ListenConfig, MeshStream, StartInfo, StreamHandler, TaskTracker, Transport, TransportError,
    TransportEvent, EVENT_CHANNEL_CAPACITY,
};
use ::iroh::discovery::mdns::{DiscoveryEvent, MdnsDiscovery};
use ::iroh::endpoint::Connection;
use ::iroh::protocol::{AcceptError, ProtocolHandler, Router};
use ::iroh::{Endpoint, EndpointId, RelayMode};
use async_trait::async_trait;
use futures_util::StreamExt;
use mesh_types::{PeerId, Topic, PRESENCE_PROTOCOL};
use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

type HandlerMap = Arc<RwLock<HashMap<Topic, StreamHandler>>>;

/// Transport over iroh QUIC with mDNS discovery.
///
/// # Example
///
/// ```ignore
/// let transport = IrohTransport::new();
/// let info = transport.start(&ListenConfig::new(identity)).await?;
/// println!("listening as {} on {:?}", info.local_id, info.listen_addresses);
/// ```
pub struct IrohTransport {
    events_tx: broadcast::Sender<TransportEvent>,
    handlers: HandlerMap,
    presence: Arc<Presence>,
    // Inbound handlers and presence dials, aborted on stop
    tasks: TaskTracker,
    running: tokio::sync::Mutex<Option<Running>>,
    is_running: AtomicBool,
}

/// Resources owned while started.
struct Running {
    endpoint: Endpoint,
    router: Router,
    tasks: Vec<JoinHandle<()>>,
    dial_timeout: Duration,
    info: StartInfo,
}

impl std::fmt::Debug for IrohTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IrohTransport")
            .field("running", &self.is_running.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Default for IrohTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl IrohTransport {
    /// Create a stopped transport. Nothing is bound until `start()`.
    pub fn new() -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            presence: Arc::new(Presence::new(events_tx.clone())),
            events_tx,
            handlers: Arc::new(RwLock::new(HashMap::new())),
            tasks: TaskTracker::default(),
            running: tokio::sync::Mutex::new(None),
            is_running: AtomicBool::new(false),
        }
    }

    /// Parse a peer id into an iroh endpoint id.
    fn parse_peer(peer: &PeerId) -> Result<EndpointId, TransportError> {
        peer.as_str()
            .parse::<EndpointId>()
            .map_err(|e| TransportError::Dial {
                peer: peer.clone(),
                reason: format!("invalid endpoint id: {e}"),
            })
    }

    async fn endpoint_for_send(&self) -> Result<(Endpoint, Duration), TransportError> {
        let running = self.running.lock().await;
        let running = running.as_ref().ok_or(TransportError::NotRunning)?;
        Ok((running.endpoint.clone(), running.dial_timeout))
    }
}

#[async_trait]
impl Transport for IrohTransport {
    async fn start(&self, config: &ListenConfig) -> Result<StartInfo, TransportError> {
        let mut running = self.running.lock().await;
        if let Some(running) = running.as_ref() {
            return Ok(running.info.clone());
        }

        let endpoint = Endpoint::builder()
            .secret_key(config.identity.secret_key())
            .relay_mode(RelayMode::Disabled)
            .bind_addr_v4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.port))
            .bind()
            .await
            .map_err(|e| TransportError::Start(format!("failed to bind endpoint: {e}")))?;

        let local_id = PeerId::new(endpoint.id().to_string());
        let generation = self.presence.reset(local_id.clone());

        let mut router = Router::builder(endpoint.clone()).accept(
            PRESENCE_PROTOCOL,
            PresenceProtocol {
                presence: Arc::clone(&self.presence),
            },
        );
        for topic in Topic::ALL {
            router = router.accept(
                topic.protocol_id().into_bytes(),
                TopicProtocol {
                    topic,
                    handlers: Arc::clone(&self.handlers),
                    tasks: self.tasks.clone(),
                },
            );
        }
        let router = router.spawn();

        let mut tasks = Vec::new();
        if config.discovery {
            let mdns = match MdnsDiscovery::builder().build(endpoint.id()) {
                Ok(mdns) => mdns,
                Err(e) => {
                    let _ = router.shutdown().await;
                    return Err(TransportError::Start(format!("mDNS unavailable: {e}")));
                }
            };
            endpoint.discovery().add(mdns.clone());

            let dialer = Dialer {
                endpoint: endpoint.clone(),
                presence: Arc::clone(&self.presence),
                dial_timeout: config.dial_timeout,
                generation,
                tasks: self.tasks.clone(),
            };
            tasks.push(tokio::spawn(discovery_loop(mdns, dialer.clone())));
            tasks.push(tokio::spawn(dial_loop(dialer, config.discovery_interval)));
        }

        let listen_addresses = endpoint
            .bound_sockets()
            .into_iter()
            .map(|addr| addr.to_string())
            .collect();
        let info = StartInfo {
            local_id,
            listen_addresses,
        };

        tracing::info!(
            id = %info.local_id,
            addresses = ?info.listen_addresses,
            discovery = config.discovery,
            "iroh transport listening"
        );

        *running = Some(Running {
            endpoint,
            router,
            tasks,
            dial_timeout: config.dial_timeout,
            info: info.clone(),
        });
        self.is_running.store(true, Ordering::Release);
        Ok(info)
    }

    async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        self.is_running.store(false, Ordering::Release);

        for task in &running.tasks {
            task.abort();
        }
        // Closes the endpoint and with it every connection
        if let Err(e) = running.router.shutdown().await {
            tracing::warn!(error = ?e, "router shutdown failed");
        }
        self.tasks.abort_all();
        self.presence.reset_stopped();
        tracing::info!(id = %running.info.local_id, "iroh transport stopped");
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events_tx.subscribe()
    }

    async fn open_stream(&self, peer: &PeerId, topic: Topic) -> Result<MeshStream, TransportError> {
        let (endpoint, dial_timeout) = self.endpoint_for_send().await?;
        if !self.presence.is_connected(peer) {
            return Err(TransportError::UnknownPeer(peer.clone()));
        }
        let target = Self::parse_peer(peer)?;
        let alpn = topic.protocol_id();

        let conn = tokio::time::timeout(dial_timeout, endpoint.connect(target, alpn.as_bytes()))
            .await
            .map_err(|_| TransportError::Timeout(dial_timeout))?
            .map_err(|e| TransportError::Dial {
                peer: peer.clone(),
                reason: e.to_string(),
            })?;

        let (send, recv) = conn
            .open_bi()
            .await
            .map_err(|e| TransportError::Stream(format!("failed to open stream: {e}")))?;

        Ok(MeshStream::new(send, recv).with_keepalive(conn))
    }

    fn register_handler(&self, topic: Topic, handler: StreamHandler) {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(topic, handler);
    }

    fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }
}

/// Accepts message connections for one topic.
#[derive(Clone)]
struct TopicProtocol {
    topic: Topic,
    handlers: HandlerMap,
    tasks: TaskTracker,
}

impl std::fmt::Debug for TopicProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicProtocol")
            .field("topic", &self.topic)
            .finish()
    }
}

impl ProtocolHandler for TopicProtocol {
    async fn accept(&self, connection: Connection) -> Result<(), AcceptError> {
        let peer = PeerId::new(connection.remote_id().to_string());

        // The sender closes the connection once its message is acknowledged
        while let Ok((send, recv)) = connection.accept_bi().await {
            let handler = self
                .handlers
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .get(&self.topic)
                .cloned();
            let Some(handler) = handler else {
                tracing::warn!(topic = %self.topic, peer = %peer.short(), "no handler registered, dropping stream");
                connection.close(1u32.into(), b"no handler");
                break;
            };
            let stream = MeshStream::new(send, recv).with_keepalive(connection.clone());
            self.tasks.spawn(handler(stream, peer.clone()));
        }
        Ok(())
    }
}

/// Accepts inbound presence connections and holds them until closed.
#[derive(Debug, Clone)]
struct PresenceProtocol {
    presence: Arc<Presence>,
}

impl ProtocolHandler for PresenceProtocol {
    async fn accept(&self, connection: Connection) -> Result<(), AcceptError> {
        let generation = self.presence.generation();
        hold_presence(Arc::clone(&self.presence), connection, generation).await;
        Ok(())
    }
}

async fn hold_presence(presence: Arc<Presence>, connection: Connection, generation: u64) {
    let peer = PeerId::new(connection.remote_id().to_string());
    presence.connection_opened(&peer, generation);
    let reason = connection.closed().await;
    tracing::debug!(peer = %peer.short(), %reason, "presence connection closed");
    presence.connection_closed(&peer, generation);
}

/// Everything needed to dial a discovered peer.
#[derive(Clone)]
struct Dialer {
    endpoint: Endpoint,
    presence: Arc<Presence>,
    dial_timeout: Duration,
    generation: u64,
    tasks: TaskTracker,
}

impl Dialer {
    fn spawn_dial(&self, peer: PeerId) {
        let dialer = self.clone();
        self.tasks.spawn(async move {
            let outcome = dialer.dial(&peer).await;
            dialer.presence.end_dial(&peer);
            match outcome {
                Ok(connection) => {
                    hold_presence(Arc::clone(&dialer.presence), connection, dialer.generation)
                        .await
                }
                Err(e) => tracing::debug!(peer = %peer.short(), error = %e, "presence dial failed"),
            }
        });
    }

    async fn dial(&self, peer: &PeerId) -> Result<Connection, TransportError> {
        let target = IrohTransport::parse_peer(peer)?;
        tokio::time::timeout(
            self.dial_timeout,
            self.endpoint.connect(target, PRESENCE_PROTOCOL),
        )
        .await
        .map_err(|_| TransportError::Timeout(self.dial_timeout))?
        .map_err(|e| TransportError::Dial {
            peer: peer.clone(),
            reason: e.to_string(),
        })
    }
}

/// Turns mDNS announcements into discovery events and first dials.
async fn discovery_loop(mdns: MdnsDiscovery, dialer: Dialer) {
    let mut events = mdns.subscribe().await;
    while let Some(event) = events.next().await {
        match event {
            DiscoveryEvent::Discovered { endpoint_info, .. } => {
                let peer = PeerId::new(endpoint_info.endpoint_id.to_string());
                let addresses = endpoint_info
                    .data
                    .ip_addrs()
                    .map(|addr| addr.to_string())
                    .collect();
                if dialer.presence.discovered(&peer, addresses) && dialer.presence.begin_dial(&peer)
                {
                    dialer.spawn_dial(peer);
                }
            }
            DiscoveryEvent::Expired { endpoint_id } => {
                dialer
                    .presence
                    .expired(&PeerId::new(endpoint_id.to_string()));
            }
        }
    }
    tracing::debug!("mDNS event stream ended");
}

/// Redials discovered peers that have no presence connection.
async fn dial_loop(dialer: Dialer, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        for peer in dialer.presence.dial_candidates() {
            dialer.spawn_dial(peer);
        }
    }
}

/// Presence bookkeeping: discovered peers, in-flight dials and the number
/// of open presence connections per peer.
///
/// Every start bumps the generation; connections from an earlier start
/// that close late no longer affect the counts.
#[derive(Debug)]
struct Presence {
    events_tx: broadcast::Sender<TransportEvent>,
    state: Mutex<PresenceState>,
}

#[derive(Debug, Default)]
struct PresenceState {
    generation: u64,
    local: Option<PeerId>,
    connections: HashMap<PeerId, usize>,
    discovered: HashMap<PeerId, Vec<String>>,
    dialing: HashSet<PeerId>,
}

impl Presence {
    fn new(events_tx: broadcast::Sender<TransportEvent>) -> Self {
        Self {
            events_tx,
            state: Mutex::new(PresenceState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PresenceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events_tx.send(event);
    }

    /// Start a new generation for `local`. Returns the generation.
    fn reset(&self, local: PeerId) -> u64 {
        let mut state = self.lock();
        let generation = state.generation + 1;
        *state = PresenceState {
            generation,
            local: Some(local),
            ..PresenceState::default()
        };
        generation
    }

    /// Forget everything after a stop.
    fn reset_stopped(&self) {
        let mut state = self.lock();
        let generation = state.generation + 1;
        *state = PresenceState {
            generation,
            ..PresenceState::default()
        };
    }

    fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Record an mDNS sighting. Returns true for a peer not seen before.
    fn discovered(&self, peer: &PeerId, addresses: Vec<String>) -> bool {
        let mut state = self.lock();
        if state.local.as_ref() == Some(peer) {
            return false;
        }
        let is_new = state.discovered.insert(peer.clone(), addresses).is_none();
        drop(state);
        if is_new {
            tracing::debug!(peer = %peer.short(), "peer discovered");
            self.emit(TransportEvent::PeerDiscovered(peer.clone()));
        }
        is_new
    }

    fn expired(&self, peer: &PeerId) {
        self.lock().discovered.remove(peer);
    }

    /// Claim a dial slot for a discovered, unconnected peer.
    fn begin_dial(&self, peer: &PeerId) -> bool {
        let mut state = self.lock();
        if state.connections.contains_key(peer) || !state.discovered.contains_key(peer) {
            return false;
        }
        state.dialing.insert(peer.clone())
    }

    fn end_dial(&self, peer: &PeerId) {
        self.lock().dialing.remove(peer);
    }

    /// Claim dial slots for every discovered peer that needs one.
    fn dial_candidates(&self) -> Vec<PeerId> {
        let mut state = self.lock();
        let candidates: Vec<PeerId> = state
            .discovered
            .keys()
            .filter(|peer| !state.connections.contains_key(*peer) && !state.dialing.contains(*peer))
            .cloned()
            .collect();
        state.dialing.extend(candidates.iter().cloned());
        candidates
    }

    fn is_connected(&self, peer: &PeerId) -> bool {
        self.lock().connections.contains_key(peer)
    }

    fn connection_opened(&self, peer: &PeerId, generation: u64) {
        let mut state = self.lock();
        if state.generation != generation {
            return;
        }
        let count = state.connections.entry(peer.clone()).or_insert(0);
        *count += 1;
        if *count > 1 {
            return;
        }
        let addresses = state.discovered.get(peer).cloned().unwrap_or_default();
        drop(state);
        self.emit(TransportEvent::PeerConnected {
            peer: peer.clone(),
            addresses,
        });
    }

    fn connection_closed(&self, peer: &PeerId, generation: u64) {
        let mut state = self.lock();
        if state.generation != generation {
            return;
        }
        let Some(count) = state.connections.get_mut(peer) else {
            return;
        };
        *count -= 1;
        if *count > 0 {
            return;
        }
        state.connections.remove(peer);
        drop(state);
        self.emit(TransportEvent::PeerDisconnected(peer.clone()));
    }
}
