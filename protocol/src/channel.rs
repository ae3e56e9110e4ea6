//! Network channels
//!
//! A [`NetworkChannel`] is one live connection to a peer. Outbound packets are
//! queued on two unbounded queues drained by the connection's writer task:
//! prioritized packets always go first. Each channel owns its query manager
//! and a listener registry chained to the transport-wide one.

use std::{
    fmt,
    future::Future,
    net::{Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    error::{ProtocolError, ProtocolResult},
    listener::PacketListenerRegistry,
    packet::Packet,
    query::{QueryPacketManager, DEFAULT_QUERY_TIMEOUT},
};

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_channel_id() -> u64 {
    NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed)
}

/// A packet waiting for the writer, with an optional write acknowledgement.
pub(crate) struct Outbound {
    pub(crate) packet: Packet,
    pub(crate) written: Option<oneshot::Sender<ProtocolResult<()>>>,
}

impl Outbound {
    pub(crate) fn acknowledge(self, result: ProtocolResult<()>) -> Packet {
        if let Some(written) = self.written {
            let _ = written.send(result);
        }
        self.packet
    }
}

/// Sending half of a channel's outbound queues.
#[derive(Clone)]
pub(crate) struct PacketWriter {
    channel_id: u64,
    normal: mpsc::UnboundedSender<Outbound>,
    priority: mpsc::UnboundedSender<Outbound>,
    cancel: CancellationToken,
}

impl PacketWriter {
    /// A writer and its queue, not yet attached to a connection.
    #[cfg(test)]
    pub(crate) fn unbound(channel_id: u64) -> (Self, OutboundQueue) {
        Self::with_cancel(channel_id, CancellationToken::new())
    }

    fn with_cancel(channel_id: u64, cancel: CancellationToken) -> (Self, OutboundQueue) {
        let (normal_tx, normal_rx) = mpsc::unbounded_channel();
        let (priority_tx, priority_rx) = mpsc::unbounded_channel();
        (
            Self {
                channel_id,
                normal: normal_tx,
                priority: priority_tx,
                cancel,
            },
            OutboundQueue {
                normal: normal_rx,
                priority: priority_rx,
            },
        )
    }

    pub(crate) fn write(
        &self,
        packet: Packet,
        written: Option<oneshot::Sender<ProtocolResult<()>>>,
    ) -> ProtocolResult<()> {
        if packet.is_empty() {
            return Err(ProtocolError::EmptyPacketAccess);
        }
        if self.cancel.is_cancelled() {
            return Err(ProtocolError::ChannelClosed(self.channel_id));
        }
        let queue = if packet.is_prioritized() {
            &self.priority
        } else {
            &self.normal
        };
        queue
            .send(Outbound { packet, written })
            .map_err(|_| ProtocolError::ChannelClosed(self.channel_id))
    }
}

impl fmt::Debug for PacketWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketWriter")
            .field("channel_id", &self.channel_id)
            .finish()
    }
}

/// Receiving half of a channel's outbound queues.
///
/// The transport drains it into the socket. A channel created with
/// [`NetworkChannel::loopback`] hands it to the caller instead, which lets
/// tests observe everything written to the channel.
pub struct OutboundQueue {
    normal: mpsc::UnboundedReceiver<Outbound>,
    priority: mpsc::UnboundedReceiver<Outbound>,
}

impl OutboundQueue {
    pub(crate) async fn next(&mut self) -> Option<Outbound> {
        tokio::select! {
            biased;
            Some(outbound) = self.priority.recv() => Some(outbound),
            Some(outbound) = self.normal.recv() => Some(outbound),
            else => None,
        }
    }

    /// Wait for the next written packet, acknowledging the write.
    pub async fn next_packet(&mut self) -> Option<Packet> {
        let outbound = self.next().await?;
        Some(outbound.acknowledge(Ok(())))
    }

    /// The next written packet if one is queued.
    pub fn try_next_packet(&mut self) -> Option<Packet> {
        let outbound = self
            .priority
            .try_recv()
            .or_else(|_| self.normal.try_recv())
            .ok()?;
        Some(outbound.acknowledge(Ok(())))
    }
}

/// One live connection to a peer node.
pub struct NetworkChannel {
    id: u64,
    remote_addr: SocketAddr,
    client_side: bool,
    writer: PacketWriter,
    query_manager: QueryPacketManager,
    registry: Arc<PacketListenerRegistry>,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl NetworkChannel {
    pub(crate) fn new(
        remote_addr: SocketAddr,
        client_side: bool,
        query_timeout: Duration,
        registry: Arc<PacketListenerRegistry>,
    ) -> (Arc<Self>, OutboundQueue) {
        let id = next_channel_id();
        let cancel = CancellationToken::new();
        let (writer, queue) = PacketWriter::with_cancel(id, cancel.clone());
        let channel = Arc::new(Self {
            id,
            remote_addr,
            client_side,
            query_manager: QueryPacketManager::new(writer.clone(), query_timeout),
            writer,
            registry,
            closed: AtomicBool::new(false),
            cancel,
        });
        (channel, queue)
    }

    /// A channel without a socket. Everything written to it is delivered to
    /// the returned queue.
    pub fn loopback(query_timeout: Duration) -> (Arc<Self>, OutboundQueue) {
        Self::new(
            SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            true,
            query_timeout,
            Arc::new(PacketListenerRegistry::new()),
        )
    }

    /// A channel without a socket or outbound queue, for dispatching inbound
    /// packets only. It reports itself active, but every write and query
    /// fails with [`ProtocolError::ChannelClosed`].
    pub fn detached() -> Arc<Self> {
        Self::loopback(DEFAULT_QUERY_TIMEOUT).0
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Whether this side opened the connection.
    pub fn is_client_side(&self) -> bool {
        self.client_side
    }

    pub fn query_manager(&self) -> &QueryPacketManager {
        &self.query_manager
    }

    pub fn packet_registry(&self) -> &Arc<PacketListenerRegistry> {
        &self.registry
    }

    pub fn is_active(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    /// Queue `packet` for writing without waiting for it to hit the socket.
    pub fn send_packet(&self, packet: Packet) -> ProtocolResult<()> {
        self.writer.write(packet, None)
    }

    /// Queue `packet` and wait until the writer has flushed it.
    pub async fn send_packet_sync(&self, packet: Packet) -> ProtocolResult<()> {
        let (tx, rx) = oneshot::channel();
        self.writer.write(packet, Some(tx))?;
        rx.await
            .unwrap_or(Err(ProtocolError::ChannelClosed(self.id)))
    }

    /// Send `packet` as a query through this channel's query manager.
    pub fn send_query(
        &self,
        packet: Packet,
    ) -> impl Future<Output = ProtocolResult<Packet>> + Send + 'static {
        self.query_manager.send_query_packet(packet)
    }

    /// Close the channel. Pending queries are cancelled and the connection
    /// tasks stop. Calling it again has no effect.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        let cancelled = self.query_manager.cancel_all();
        debug!(
            channel = self.id,
            remote = %self.remote_addr,
            cancelled_queries = cancelled,
            "Network channel closed"
        );
    }

    /// Resolves once the channel is closed.
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }
}

impl fmt::Debug for NetworkChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkChannel")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("client_side", &self.client_side)
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    #[tokio::test]
    async fn test_prioritized_packets_jump_the_queue() {
        let (channel, mut queue) = NetworkChannel::loopback(DEFAULT_QUERY_TIMEOUT);
        channel.send_packet(Packet::new(20, Bytes::new())).unwrap();
        channel.send_packet(Packet::new(21, Bytes::new())).unwrap();
        channel
            .send_packet(Packet::prioritized(22, Bytes::new()))
            .unwrap();

        let order: Vec<i32> = vec![
            queue.next_packet().await.unwrap().channel(),
            queue.next_packet().await.unwrap().channel(),
            queue.next_packet().await.unwrap().channel(),
        ];
        assert_eq!(order, vec![22, 20, 21]);
    }

    #[tokio::test]
    async fn test_send_sync_waits_for_writer() {
        let (channel, mut queue) = NetworkChannel::loopback(DEFAULT_QUERY_TIMEOUT);
        let writer = tokio::spawn(async move { queue.next_packet().await });

        channel
            .send_packet_sync(Packet::new(20, Bytes::from_static(b"x")))
            .await
            .unwrap();
        let written = writer.await.unwrap().unwrap();
        assert_eq!(written.channel(), 20);
    }

    #[tokio::test]
    async fn test_detached_channel_rejects_writes() {
        let channel = NetworkChannel::detached();
        assert!(channel.is_active());
        assert!(matches!(
            channel.send_packet(Packet::new(1, Bytes::new())),
            Err(ProtocolError::ChannelClosed(id)) if id == channel.id()
        ));
        assert!(matches!(
            channel.send_query(Packet::new(1, Bytes::new())).await,
            Err(ProtocolError::ChannelClosed(_))
        ));
        assert_eq!(channel.query_manager().waiting_handler_count(), 0);
    }

    #[tokio::test]
    async fn test_close_cancels_queries_and_rejects_writes() {
        let (channel, _queue) = NetworkChannel::loopback(DEFAULT_QUERY_TIMEOUT);
        let query = channel.send_query(Packet::new(1, Bytes::new()));

        channel.close();
        channel.close();
        assert!(!channel.is_active());
        assert!(matches!(query.await, Err(ProtocolError::QueryCancelled(_))));
        assert!(matches!(
            channel.send_packet(Packet::new(1, Bytes::new())),
            Err(ProtocolError::ChannelClosed(_))
        ));
        channel.closed().await;
    }

    #[test]
    fn test_empty_packet_cannot_be_sent() {
        let (channel, _queue) = NetworkChannel::loopback(DEFAULT_QUERY_TIMEOUT);
        assert!(matches!(
            channel.send_packet(Packet::empty()),
            Err(ProtocolError::EmptyPacketAccess)
        ));
    }
}
