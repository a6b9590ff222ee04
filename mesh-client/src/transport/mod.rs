//! Transport abstraction for prepper-mesh.
//!
//! A transport discovers peers, keeps track of which ones are connected and
//! carries one message per bidirectional stream.
//!
//! # Design
//!
//! - `start()` begins listening and discovery under the node identity
//! - `events()` reports discovered, connected and disconnected peers
//! - `open_stream()` opens a fresh stream to a connected peer for one topic
//! - `register_handler()` installs the callback for inbound streams of a topic
//!
//! Two implementations are provided: [`IrohTransport`] (QUIC with mDNS
//! discovery) and [`MemoryTransport`] (in-process, for tests).

mod iroh;
mod memory;

pub use self::iroh::IrohTransport;
pub use memory::{MemoryNetwork, MemoryTransport};

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use mesh_types::{PeerId, Topic};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;
use tokio::task::JoinSet;

use crate::identity::NodeIdentity;

/// Capacity of transport event channels.
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Listening could not be set up (e.g. port in use).
    #[error("transport failed to start: {0}")]
    Start(String),

    /// The transport is stopped.
    #[error("transport not running")]
    NotRunning,

    /// The peer is not connected.
    #[error("unknown peer: {0}")]
    UnknownPeer(PeerId),

    /// Connecting to the peer failed.
    #[error("dial to {peer} failed: {reason}")]
    Dial {
        /// Target peer.
        peer: PeerId,
        /// Failure description.
        reason: String,
    },

    /// Reading or writing a stream failed.
    #[error("stream error: {0}")]
    Stream(String),

    /// The operation did not complete in time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// Peer lifecycle notifications from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A peer was seen on the local network.
    PeerDiscovered(PeerId),
    /// A peer now has a live connection.
    PeerConnected {
        /// Remote node id.
        peer: PeerId,
        /// Remote addresses, if known.
        addresses: Vec<String>,
    },
    /// The last connection to a peer closed.
    PeerDisconnected(PeerId),
}

/// Settings for [`Transport::start`].
#[derive(Debug, Clone)]
pub struct ListenConfig {
    /// Node key; its public half becomes the local id.
    pub identity: NodeIdentity,
    /// Listen port, 0 for OS-assigned.
    pub port: u16,
    /// Whether to look for peers on the local network.
    pub discovery: bool,
    /// How often discovered peers are dialed.
    pub discovery_interval: Duration,
    /// Upper bound on establishing a connection.
    pub dial_timeout: Duration,
}

impl ListenConfig {
    /// Listen on an OS-assigned port with default timings.
    pub fn new(identity: NodeIdentity) -> Self {
        Self {
            identity,
            port: 0,
            discovery: true,
            discovery_interval: Duration::from_secs(20),
            dial_timeout: Duration::from_secs(30),
        }
    }
}

/// Result of a successful start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartInfo {
    /// Local node id.
    pub local_id: PeerId,
    /// Addresses the transport listens on.
    pub listen_addresses: Vec<String>,
}

/// One bidirectional stream carrying a single message.
///
/// Closing the write half (`shutdown`) marks the end of the message.
pub struct MeshStream {
    /// Outbound half.
    pub send: Box<dyn AsyncWrite + Send + Unpin>,
    /// Inbound half.
    pub recv: Box<dyn AsyncRead + Send + Unpin>,
    // Transport resources that must outlive the stream halves.
    _keepalive: Option<Box<dyn Any + Send>>,
}

impl MeshStream {
    /// Wrap a pair of stream halves.
    pub fn new(
        send: impl AsyncWrite + Send + Unpin + 'static,
        recv: impl AsyncRead + Send + Unpin + 'static,
    ) -> Self {
        Self {
            send: Box::new(send),
            recv: Box::new(recv),
            _keepalive: None,
        }
    }

    /// Keep `resource` alive for as long as the stream.
    pub(crate) fn with_keepalive(mut self, resource: impl Any + Send) -> Self {
        self._keepalive = Some(Box::new(resource));
        self
    }
}

impl fmt::Debug for MeshStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MeshStream").finish_non_exhaustive()
    }
}

/// Tasks spawned on behalf of a transport: inbound handlers and dials.
///
/// Clones share the same set. `abort_all` on stop cancels whatever is still
/// in flight.
#[derive(Clone, Default)]
pub(crate) struct TaskTracker {
    tasks: Arc<Mutex<JoinSet<()>>>,
}

impl TaskTracker {
    fn lock(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn spawn(&self, task: impl Future<Output = ()> + Send + 'static) {
        let mut tasks = self.lock();
        while tasks.try_join_next().is_some() {}
        tasks.spawn(task);
    }

    pub(crate) fn abort_all(&self) {
        self.lock().abort_all();
    }
}

impl fmt::Debug for TaskTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskTracker")
            .field("tasks", &self.lock().len())
            .finish()
    }
}

/// Callback for inbound streams. Runs on its own task and owns the stream.
pub type StreamHandler = Arc<dyn Fn(MeshStream, PeerId) -> BoxFuture<'static, ()> + Send + Sync>;

/// Transport trait for discovering peers and exchanging messages.
///
/// Implementations handle the underlying connection mechanism
/// (iroh QUIC, in-memory, etc).
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Start listening and discovering under the given identity.
    async fn start(&self, config: &ListenConfig) -> Result<StartInfo, TransportError>;

    /// Stop listening and close all connections. Idempotent.
    async fn stop(&self);

    /// Subscribe to peer events.
    ///
    /// Subscriptions stay valid across stop and restart.
    fn events(&self) -> broadcast::Receiver<TransportEvent>;

    /// Open a new stream to a connected peer for one topic.
    async fn open_stream(&self, peer: &PeerId, topic: Topic) -> Result<MeshStream, TransportError>;

    /// Install the handler for inbound streams of a topic, replacing any
    /// previous one.
    fn register_handler(&self, topic: Topic, handler: StreamHandler);

    /// Whether the transport is started.
    fn is_running(&self) -> bool;
}
