//! Message exchange on top of a [`Transport`].
//!
//! Every message travels on its own stream. The sender writes the JSON body,
//! closes its write side and waits for the receiver to close the other side,
//! which acknowledges that the whole message was read.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{join_all, BoxFuture};
use futures_util::FutureExt;
use mesh_core::PeerRegistry;
use mesh_types::{encode, MessageError, PeerId, Topic, MAX_MESSAGE_SIZE};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

use crate::error::MeshError;
use crate::transport::{MeshStream, StreamHandler, Transport, TransportError};

/// Application callback for a fully received message.
///
/// Errors are logged by the receiving task and never reach the sender.
pub type MessageHandler =
    Arc<dyn Fn(Vec<u8>, PeerId) -> BoxFuture<'static, Result<(), MeshError>> + Send + Sync>;

/// Sends and receives single-message streams.
pub struct ProtocolHandler<T: Transport> {
    transport: Arc<T>,
    registry: Arc<PeerRegistry>,
    read_timeout: Duration,
}

impl<T: Transport> std::fmt::Debug for ProtocolHandler<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolHandler")
            .field("peers", &self.registry.count())
            .field("read_timeout", &self.read_timeout)
            .finish_non_exhaustive()
    }
}

impl<T: Transport> ProtocolHandler<T> {
    /// Create a handler over `transport`, broadcasting to the peers in `registry`.
    pub fn new(transport: Arc<T>, registry: Arc<PeerRegistry>, read_timeout: Duration) -> Self {
        Self {
            transport,
            registry,
            read_timeout,
        }
    }

    /// Send one message to `peer` and wait for its acknowledgement.
    ///
    /// # Errors
    ///
    /// `NotRunning` when the transport is stopped; transport errors such as
    /// `UnknownPeer`, `Dial` or `Timeout` otherwise.
    pub async fn send<M: Serialize>(
        &self,
        peer: &PeerId,
        topic: Topic,
        message: &M,
    ) -> Result<(), MeshError> {
        if !self.transport.is_running() {
            return Err(MeshError::NotRunning);
        }
        let bytes = encode(message)?;
        self.send_bytes(peer, topic, &bytes).await
    }

    /// Send one message to every registered peer concurrently.
    ///
    /// Individual failures are logged and ignored. Returns the number of
    /// peers a send was attempted to.
    pub async fn broadcast<M: Serialize>(
        &self,
        topic: Topic,
        message: &M,
    ) -> Result<usize, MeshError> {
        if !self.transport.is_running() {
            return Err(MeshError::NotRunning);
        }
        let bytes = encode(message)?;
        let peers = self.registry.peer_ids();

        let sends = peers.iter().map(|peer| {
            let bytes = &bytes;
            async move {
                if let Err(e) = self.send_bytes(peer, topic, bytes).await {
                    tracing::debug!(peer = %peer.short(), %topic, error = %e, "broadcast send failed");
                }
            }
        });
        join_all(sends).await;

        Ok(peers.len())
    }

    /// Install `handler` for inbound messages on `topic`.
    ///
    /// The handler runs after the message has been read in full and the
    /// stream closed.
    pub fn register_handler(&self, topic: Topic, handler: MessageHandler) {
        let read_timeout = self.read_timeout;
        let wrapped: StreamHandler = Arc::new(move |stream: MeshStream, peer: PeerId| {
            let handler = Arc::clone(&handler);
            receive(stream, peer, topic, read_timeout, handler).boxed()
        });
        self.transport.register_handler(topic, wrapped);
    }

    async fn send_bytes(&self, peer: &PeerId, topic: Topic, bytes: &[u8]) -> Result<(), MeshError> {
        let mut stream = self.transport.open_stream(peer, topic).await?;

        stream.send.write_all(bytes).await.map_err(stream_error)?;
        stream.send.shutdown().await.map_err(stream_error)?;

        // The remote closes its side once the whole message is read
        let mut ack = Vec::new();
        tokio::time::timeout(self.read_timeout, stream.recv.read_to_end(&mut ack))
            .await
            .map_err(|_| TransportError::Timeout(self.read_timeout))?
            .map_err(stream_error)?;

        tracing::debug!(peer = %peer.short(), %topic, bytes = bytes.len(), "message sent");
        Ok(())
    }
}

fn stream_error(e: std::io::Error) -> TransportError {
    TransportError::Stream(e.to_string())
}

async fn receive(
    mut stream: MeshStream,
    peer: PeerId,
    topic: Topic,
    read_timeout: Duration,
    handler: MessageHandler,
) {
    let read = read_message(&mut stream.recv, read_timeout).await;

    if let Err(e) = stream.send.shutdown().await {
        tracing::debug!(peer = %peer.short(), %topic, error = %e, "failed to close inbound stream");
    }
    drop(stream);

    let bytes = match read {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(peer = %peer.short(), %topic, error = %e, "dropping inbound message");
            return;
        }
    };

    tracing::debug!(peer = %peer.short(), %topic, bytes = bytes.len(), "message received");
    if let Err(e) = handler(bytes, peer.clone()).await {
        tracing::error!(peer = %peer.short(), %topic, error = %e, "message handler failed");
    }
}

/// Read a whole message, rejecting anything over [`MAX_MESSAGE_SIZE`].
async fn read_message<R>(recv: &mut R, read_timeout: Duration) -> Result<Vec<u8>, MeshError>
where
    R: AsyncRead + Unpin,
{
    let mut bytes = Vec::new();
    let limit = MAX_MESSAGE_SIZE as u64 + 1;

    tokio::time::timeout(read_timeout, recv.take(limit).read_to_end(&mut bytes))
        .await
        .map_err(|_| TransportError::Timeout(read_timeout))?
        .map_err(stream_error)?;

    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(MessageError::TooLarge {
            size: bytes.len(),
            limit: MAX_MESSAGE_SIZE,
        }
        .into());
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::NodeIdentity;
    use crate::transport::{ListenConfig, MemoryNetwork, MemoryTransport};
    use mesh_types::SyncRequest;
    use tokio::sync::mpsc;

    struct Node {
        transport: Arc<MemoryTransport>,
        protocol: ProtocolHandler<MemoryTransport>,
        registry: Arc<PeerRegistry>,
        id: PeerId,
    }

    async fn node(network: &MemoryNetwork) -> Node {
        let transport = Arc::new(network.transport());
        let identity = NodeIdentity::generate().unwrap();
        let info = transport.start(&ListenConfig::new(identity)).await.unwrap();
        let registry = Arc::new(PeerRegistry::new());
        Node {
            protocol: ProtocolHandler::new(
                Arc::clone(&transport),
                Arc::clone(&registry),
                Duration::from_secs(5),
            ),
            transport,
            registry,
            id: info.local_id,
        }
    }

    fn forwarding_handler(tx: mpsc::UnboundedSender<(Vec<u8>, PeerId)>) -> MessageHandler {
        Arc::new(move |bytes: Vec<u8>, peer: PeerId| {
            let tx = tx.clone();
            async move {
                let _ = tx.send((bytes, peer));
                Ok(())
            }
            .boxed()
        })
    }

    fn request(id: &PeerId) -> SyncRequest {
        SyncRequest {
            peer_id: id.clone(),
            timestamp: 42,
        }
    }

    #[tokio::test]
    async fn send_delivers_message_and_sender() {
        let network = MemoryNetwork::new();
        let a = node(&network).await;
        let b = node(&network).await;
        network.link(&a.id, &b.id).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        b.protocol
            .register_handler(Topic::SYNC_REQUEST, forwarding_handler(tx));

        a.protocol
            .send(&b.id, Topic::SYNC_REQUEST, &request(&a.id))
            .await
            .unwrap();

        let (bytes, from) = rx.recv().await.unwrap();
        assert_eq!(from, a.id);
        let decoded: SyncRequest = mesh_types::decode(&bytes).unwrap();
        assert_eq!(decoded, request(&a.id));
    }

    #[tokio::test]
    async fn send_when_stopped_is_not_running() {
        let network = MemoryNetwork::new();
        let a = node(&network).await;
        a.transport.stop().await;

        let result = a
            .protocol
            .send(&PeerId::new("anyone"), Topic::SYNC_REQUEST, &request(&a.id))
            .await;
        assert!(matches!(result, Err(MeshError::NotRunning)));
    }

    #[tokio::test]
    async fn send_to_unknown_peer_fails() {
        let network = MemoryNetwork::new();
        let a = node(&network).await;

        let result = a
            .protocol
            .send(&PeerId::new("stranger"), Topic::SYNC_REQUEST, &request(&a.id))
            .await;
        assert!(matches!(
            result,
            Err(MeshError::Transport(TransportError::UnknownPeer(_)))
        ));
    }

    #[tokio::test]
    async fn handler_error_does_not_reach_sender() {
        let network = MemoryNetwork::new();
        let a = node(&network).await;
        let b = node(&network).await;
        network.link(&a.id, &b.id).unwrap();

        b.protocol.register_handler(
            Topic::SYNC_REQUEST,
            Arc::new(|_bytes: Vec<u8>, _peer: PeerId| {
                async { Err::<(), _>(MeshError::NotRunning) }.boxed()
            }),
        );

        a.protocol
            .send(&b.id, Topic::SYNC_REQUEST, &request(&a.id))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn broadcast_counts_failing_peers() {
        let network = MemoryNetwork::new();
        let a = node(&network).await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut others: Vec<Node> = Vec::new();
        for _ in 0..4 {
            let peer = node(&network).await;
            peer.protocol
                .register_handler(Topic::SYNC_REQUEST, forwarding_handler(tx.clone()));
            network.link(&a.id, &peer.id).unwrap();
            a.registry.on_connect(peer.id.clone(), vec![], 0);
            others.push(peer);
        }
        a.transport.fail_streams_to(&others[0].id);
        a.transport.fail_streams_to(&others[1].id);

        let attempted = a
            .protocol
            .broadcast(Topic::SYNC_REQUEST, &request(&a.id))
            .await
            .unwrap();
        assert_eq!(attempted, 4);

        for _ in 0..2 {
            tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_without_peers_attempts_none() {
        let network = MemoryNetwork::new();
        let a = node(&network).await;
        let attempted = a
            .protocol
            .broadcast(Topic::INVENTORY_DATA, &request(&a.id))
            .await
            .unwrap();
        assert_eq!(attempted, 0);
    }

    #[tokio::test]
    async fn oversized_message_is_rejected_on_read() {
        let (mut near, mut far) = tokio::io::duplex(64 * 1024);
        let writer = tokio::spawn(async move {
            let chunk = vec![b'x'; 64 * 1024];
            for _ in 0..=(MAX_MESSAGE_SIZE / chunk.len()) {
                if near.write_all(&chunk).await.is_err() {
                    break;
                }
            }
            let _ = near.shutdown().await;
        });

        let result = read_message(&mut far, Duration::from_secs(5)).await;
        assert!(matches!(
            result,
            Err(MeshError::Message(MessageError::TooLarge { .. }))
        ));
        drop(far);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn slow_sender_times_out() {
        let (_near, mut far) = tokio::io::duplex(1024);
        let result = read_message(&mut far, Duration::from_millis(20)).await;
        assert!(matches!(
            result,
            Err(MeshError::Transport(TransportError::Timeout(_)))
        ));
    }
}
