//! TCP transport
//!
//! [`NetworkServer`] accepts peer connections, [`NetworkClient`] opens them.
//! Both turn a socket into a [`NetworkChannel`] driven by two tasks:
//! - writer: drains the channel's outbound queues into the framed sink
//! - reader: routes query responses to the query manager, everything else to
//!   the channel handler and then the listener registry
//!
//! Either task ending closes the channel; the reader then reports the close to
//! the channel handler.

use std::{
    fmt,
    net::SocketAddr,
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::{codec::Framed, sync::CancellationToken};
use tracing::{debug, info, warn};

use crate::{
    channel::{NetworkChannel, OutboundQueue},
    codec::{PacketCodec, MAX_FRAME_SIZE},
    error::{ProtocolError, ProtocolResult},
    listener::PacketListenerRegistry,
    packet::{Packet, QUERY_RESPONSE_CHANNEL},
    query::DEFAULT_QUERY_TIMEOUT,
};

/// A host name or address plus port, as written in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HostAndPort {
    pub host: String,
    pub port: u16,
}

impl HostAndPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for HostAndPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for HostAndPort {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| ProtocolError::Malformed(format!("missing port in address '{}'", s)))?;
        let port = port
            .parse::<u16>()
            .map_err(|e| ProtocolError::Malformed(format!("invalid port in '{}': {}", s, e)))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(ProtocolError::Malformed(format!(
                "missing host in address '{}'",
                s
            )));
        }
        Ok(Self::new(host, port))
    }
}

impl From<SocketAddr> for HostAndPort {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub query_timeout: Duration,
    pub connect_timeout: Duration,
    pub max_frame_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            connect_timeout: Duration::from_secs(5),
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

/// Connection lifecycle callbacks. Called on the connection's reader task;
/// implementations must not block.
pub trait NetworkChannelHandler: Send + Sync {
    /// A new channel is about to start reading. Returning an error closes it.
    fn handle_channel_initialize(&self, _channel: &Arc<NetworkChannel>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Sees every non-response packet before the listener registry. Return
    /// false to consume the packet.
    fn handle_packet_receive(&self, _channel: &Arc<NetworkChannel>, _packet: &Packet) -> bool {
        true
    }

    /// The channel has been closed, by either side.
    fn handle_channel_close(&self, _channel: &Arc<NetworkChannel>) {}
}

/// State shared by the client and the server side.
struct TransportInner {
    config: TransportConfig,
    registry: Arc<PacketListenerRegistry>,
    handler: RwLock<Option<Arc<dyn NetworkChannelHandler>>>,
    channels: DashMap<u64, Arc<NetworkChannel>>,
    cancel: CancellationToken,
}

impl TransportInner {
    fn new(config: TransportConfig) -> Self {
        Self {
            config,
            registry: Arc::new(PacketListenerRegistry::new()),
            handler: RwLock::new(None),
            channels: DashMap::new(),
            cancel: CancellationToken::new(),
        }
    }

    fn handler(&self) -> Option<Arc<dyn NetworkChannelHandler>> {
        self.handler.read().clone()
    }

    fn channels(&self) -> Vec<Arc<NetworkChannel>> {
        self.channels
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    fn close(&self) {
        self.cancel.cancel();
        for channel in self.channels() {
            channel.close();
        }
    }

    /// Wrap an established socket into a channel and start its tasks.
    fn open_channel(
        self: &Arc<Self>,
        stream: TcpStream,
        client_side: bool,
    ) -> ProtocolResult<Arc<NetworkChannel>> {
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {}", e);
        }
        let remote_addr = stream.peer_addr()?;
        let registry = Arc::new(PacketListenerRegistry::with_parent(self.registry.clone()));
        let (channel, queue) = NetworkChannel::new(
            remote_addr,
            client_side,
            self.config.query_timeout,
            registry,
        );

        let codec = PacketCodec::with_max_frame_size(self.config.max_frame_size);
        let (sink, stream) = Framed::new(stream, codec).split();
        self.channels.insert(channel.id(), channel.clone());
        tokio::spawn(write_loop(channel.clone(), sink, queue));

        if let Some(handler) = self.handler() {
            if let Err(e) = handler.handle_channel_initialize(&channel) {
                warn!(
                    channel = channel.id(),
                    remote = %remote_addr,
                    "Channel rejected during initialization: {:#}",
                    e
                );
                channel.close();
                self.channels.remove(&channel.id());
                return Err(ProtocolError::ChannelClosed(channel.id()));
            }
        }

        tokio::spawn(read_loop(self.clone(), channel.clone(), stream));
        debug!(
            channel = channel.id(),
            remote = %remote_addr,
            client_side,
            "Network channel opened"
        );
        Ok(channel)
    }

    fn dispatch(&self, channel: &Arc<NetworkChannel>, packet: Packet) {
        if packet.channel() == QUERY_RESPONSE_CHANNEL && packet.is_query() {
            if !channel.query_manager().handle_query_response(packet) {
                debug!(channel = channel.id(), "Dropping response to unknown query");
            }
            return;
        }

        if let Some(handler) = self.handler() {
            if !handler.handle_packet_receive(channel, &packet) {
                return;
            }
        }

        match channel.packet_registry().handle_packet(channel, &packet) {
            Ok(true) => {}
            Ok(false) => debug!(
                channel = channel.id(),
                packet_channel = packet.channel(),
                "No listener for packet"
            ),
            Err(e) => warn!(channel = channel.id(), "{}", e),
        }
    }
}

type PacketSink = futures::stream::SplitSink<Framed<TcpStream, PacketCodec>, Packet>;
type PacketStream = futures::stream::SplitStream<Framed<TcpStream, PacketCodec>>;

async fn write_loop(channel: Arc<NetworkChannel>, mut sink: PacketSink, mut queue: OutboundQueue) {
    loop {
        let outbound = tokio::select! {
            _ = channel.closed() => break,
            outbound = queue.next() => match outbound {
                Some(outbound) => outbound,
                None => break,
            },
        };

        match sink.send(outbound.packet.clone()).await {
            Ok(()) => {
                outbound.acknowledge(Ok(()));
            }
            Err(e) => {
                warn!(channel = channel.id(), "Failed to write packet: {}", e);
                outbound.acknowledge(Err(e));
                break;
            }
        }
    }
    channel.close();
}

async fn read_loop(inner: Arc<TransportInner>, channel: Arc<NetworkChannel>, mut stream: PacketStream) {
    loop {
        let next = tokio::select! {
            _ = channel.closed() => break,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(packet)) => inner.dispatch(&channel, packet),
            Some(Err(e)) => {
                warn!(channel = channel.id(), "Failed to read packet: {}", e);
                break;
            }
            None => {
                debug!(channel = channel.id(), "Peer closed the connection");
                break;
            }
        }
    }

    channel.close();
    inner.channels.remove(&channel.id());
    if let Some(handler) = inner.handler() {
        handler.handle_channel_close(&channel);
    }
}

async fn accept_loop(inner: Arc<TransportInner>, listener: TcpListener, local_addr: SocketAddr) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    debug!("Accepted connection from {}", peer_addr);
                    if let Err(e) = inner.open_channel(stream, false) {
                        warn!("Failed to open channel for {}: {}", peer_addr, e);
                    }
                }
                Err(e) => {
                    warn!("Failed to accept connection on {}: {}", local_addr, e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            _ = inner.cancel.cancelled() => {
                info!("Listener on {} shutting down", local_addr);
                break;
            }
        }
    }
}

/// Accepts connections from peer nodes.
pub struct NetworkServer {
    inner: Arc<TransportInner>,
}

impl NetworkServer {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            inner: Arc::new(TransportInner::new(config)),
        }
    }

    /// Listeners shared by every accepted channel.
    pub fn packet_registry(&self) -> &Arc<PacketListenerRegistry> {
        &self.inner.registry
    }

    pub fn set_channel_handler(&self, handler: Arc<dyn NetworkChannelHandler>) {
        *self.inner.handler.write() = Some(handler);
    }

    /// Bind `address` and accept connections on it in the background.
    /// Returns the bound address (useful with port 0).
    pub async fn bind(&self, address: &HostAndPort) -> ProtocolResult<SocketAddr> {
        let listener = TcpListener::bind((address.host.as_str(), address.port))
            .await
            .map_err(|source| ProtocolError::ConnectionFailed {
                address: address.to_string(),
                source,
            })?;
        let local_addr = listener.local_addr()?;
        info!("Network server listening on {}", local_addr);
        tokio::spawn(accept_loop(self.inner.clone(), listener, local_addr));
        Ok(local_addr)
    }

    pub fn channels(&self) -> Vec<Arc<NetworkChannel>> {
        self.inner.channels()
    }

    /// Stop accepting and close every accepted channel.
    pub fn close(&self) {
        self.inner.close();
    }
}

/// Opens connections to peer nodes.
pub struct NetworkClient {
    inner: Arc<TransportInner>,
}

impl NetworkClient {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            inner: Arc::new(TransportInner::new(config)),
        }
    }

    /// Listeners shared by every opened channel.
    pub fn packet_registry(&self) -> &Arc<PacketListenerRegistry> {
        &self.inner.registry
    }

    pub fn set_channel_handler(&self, handler: Arc<dyn NetworkChannelHandler>) {
        *self.inner.handler.write() = Some(handler);
    }

    pub async fn connect(&self, target: &HostAndPort) -> ProtocolResult<Arc<NetworkChannel>> {
        let connect = TcpStream::connect((target.host.as_str(), target.port));
        let stream = match tokio::time::timeout(self.inner.config.connect_timeout, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(ProtocolError::ConnectionFailed {
                    address: target.to_string(),
                    source,
                })
            }
            Err(_) => {
                return Err(ProtocolError::ConnectionFailed {
                    address: target.to_string(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "connect timed out",
                    ),
                })
            }
        };
        self.inner.open_channel(stream, true)
    }

    pub fn channels(&self) -> Vec<Arc<NetworkChannel>> {
        self.inner.channels()
    }

    /// Close every channel this client opened.
    pub fn close(&self) {
        self.inner.close();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use bytes::Bytes;
    use parking_lot::Mutex;

    use super::*;

    #[test]
    fn test_host_and_port_parsing() {
        let parsed: HostAndPort = "node-1.local:1410".parse().unwrap();
        assert_eq!(parsed, HostAndPort::new("node-1.local", 1410));
        assert_eq!(parsed.to_string(), "node-1.local:1410");

        let v6: HostAndPort = "[::1]:1410".parse().unwrap();
        assert_eq!(v6.host, "::1");
        assert_eq!(v6.to_string(), "[::1]:1410");

        assert!("no-port".parse::<HostAndPort>().is_err());
        assert!("host:99999".parse::<HostAndPort>().is_err());
    }

    #[derive(Default)]
    struct CountingHandler {
        closed: AtomicUsize,
    }

    impl NetworkChannelHandler for CountingHandler {
        fn handle_channel_close(&self, _channel: &Arc<NetworkChannel>) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_query_over_tcp() {
        let server = NetworkServer::new(TransportConfig::default());
        server.packet_registry().add_listener(
            20,
            Arc::new(|channel: &Arc<NetworkChannel>, packet: &Packet| {
                let mut reply = b"echo:".to_vec();
                reply.extend_from_slice(packet.content()?);
                channel.send_packet(packet.response(reply)?)?;
                Ok(())
            }),
            None,
        );
        let addr = server
            .bind(&HostAndPort::new("127.0.0.1", 0))
            .await
            .unwrap();

        let client = NetworkClient::new(TransportConfig::default());
        let channel = client.connect(&HostAndPort::from(addr)).await.unwrap();
        assert!(channel.is_client_side());

        let response = channel
            .send_query(Packet::new(20, Bytes::from_static(b"hi")))
            .await
            .unwrap();
        assert_eq!(response.content().unwrap().as_ref(), b"echo:hi");

        client.close();
        server.close();
    }

    #[tokio::test]
    async fn test_one_way_packets_arrive_in_order() {
        let received = Arc::new(Mutex::new(Vec::new()));
        let server = NetworkServer::new(TransportConfig::default());
        let sink = received.clone();
        server.packet_registry().add_listener(
            21,
            Arc::new(move |_: &Arc<NetworkChannel>, packet: &Packet| {
                sink.lock().push(packet.content()?.clone());
                Ok(())
            }),
            None,
        );
        let addr = server
            .bind(&HostAndPort::new("127.0.0.1", 0))
            .await
            .unwrap();

        let client = NetworkClient::new(TransportConfig::default());
        let channel = client.connect(&HostAndPort::from(addr)).await.unwrap();
        for i in 0u8..10 {
            channel
                .send_packet_sync(Packet::new(21, vec![i]))
                .await
                .unwrap();
        }

        for _ in 0..100 {
            if received.lock().len() == 10 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let received = received.lock();
        assert_eq!(received.len(), 10);
        for (i, payload) in received.iter().enumerate() {
            assert_eq!(payload.as_ref(), &[i as u8]);
        }
    }

    #[tokio::test]
    async fn test_remote_close_is_reported() {
        let server = NetworkServer::new(TransportConfig::default());
        let handler = Arc::new(CountingHandler::default());
        server.set_channel_handler(handler.clone());
        let addr = server
            .bind(&HostAndPort::new("127.0.0.1", 0))
            .await
            .unwrap();

        let client = NetworkClient::new(TransportConfig::default());
        let channel = client.connect(&HostAndPort::from(addr)).await.unwrap();
        let pending = channel.send_query(Packet::new(99, Bytes::new()));

        for _ in 0..100 {
            if !server.channels().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        server.close();

        assert!(matches!(
            pending.await,
            Err(ProtocolError::QueryCancelled(_))
        ));
        for _ in 0..100 {
            if handler.closed.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(handler.closed.load(Ordering::SeqCst), 1);
        assert!(!channel.is_active());
    }

    #[tokio::test]
    async fn test_connect_failure_names_address() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = NetworkClient::new(TransportConfig::default());
        match client.connect(&HostAndPort::from(addr)).await {
            Err(ProtocolError::ConnectionFailed { address, .. }) => {
                assert_eq!(address, addr.to_string());
            }
            other => panic!("expected connection failure, got {:?}", other),
        }
    }
}
