//! Chunked byte-stream transfer
//!
//! A sender splits a byte source into chunks on [`CHUNKED_PACKET_CHANNEL`] and
//! pushes them to every target channel in parallel. Chunk layout:
//! ```text
//! uuid session | string transfer_channel | u32 index | bool final | byte-array extra | byte-array data
//! ```
//! Extra data only travels with chunk 0. The final chunk carries no data and
//! is sent as a query; the receiver answers with a single status byte once the
//! registered [`TransferHandler`] has consumed the assembled payload.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::Arc,
};

use bytes::{BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use futures::future::{self, BoxFuture, FutureExt};
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    buffer::{DataBufReader, DataBufWriter},
    channel::NetworkChannel,
    error::{ProtocolError, ProtocolResult},
    listener::PacketListener,
    packet::{Packet, CHUNKED_PACKET_CHANNEL},
};

/// Default chunk payload size (50 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 50 * 1024;

/// Outcome of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferStatus {
    Success,
    Failure,
    AlreadyExists,
}

impl TransferStatus {
    pub fn to_byte(self) -> u8 {
        match self {
            TransferStatus::Success => 0,
            TransferStatus::Failure => 1,
            TransferStatus::AlreadyExists => 2,
        }
    }

    pub fn from_byte(value: u8) -> ProtocolResult<Self> {
        match value {
            0 => Ok(TransferStatus::Success),
            1 => Ok(TransferStatus::Failure),
            2 => Ok(TransferStatus::AlreadyExists),
            other => Err(ProtocolError::Transfer(format!(
                "unknown transfer status byte {}",
                other
            ))),
        }
    }

    /// Combine the outcomes of two peers. Failure beats AlreadyExists beats
    /// Success.
    pub fn merge(self, other: TransferStatus) -> TransferStatus {
        use TransferStatus::*;
        match (self, other) {
            (Failure, _) | (_, Failure) => Failure,
            (AlreadyExists, _) | (_, AlreadyExists) => AlreadyExists,
            _ => Success,
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferStatus::Success => f.write_str("success"),
            TransferStatus::Failure => f.write_str("failure"),
            TransferStatus::AlreadyExists => f.write_str("already exists"),
        }
    }
}

/// Resolves to the aggregated status of all target channels.
pub type TransferFuture = BoxFuture<'static, TransferStatus>;

/// What a receiver knows about a transfer session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSessionInformation {
    pub session_id: Uuid,
    pub transfer_channel: String,
    pub extra_data: Bytes,
}

struct Chunk {
    session_id: Uuid,
    transfer_channel: String,
    index: u32,
    last: bool,
    extra_data: Bytes,
    data: Bytes,
}

impl Chunk {
    fn to_packet(&self) -> Packet {
        let mut buf = BytesMut::with_capacity(
            16 + 4 + self.transfer_channel.len() + 4 + 1 + 8 + self.extra_data.len() + self.data.len(),
        );
        buf.write_uuid(&self.session_id);
        buf.write_string(&self.transfer_channel);
        buf.put_u32(self.index);
        buf.write_bool(self.last);
        buf.write_bytes(&self.extra_data);
        buf.write_bytes(&self.data);
        Packet::new(CHUNKED_PACKET_CHANNEL, buf.freeze())
    }

    fn from_packet(packet: &Packet) -> ProtocolResult<Self> {
        let mut content = packet.content()?.clone();
        Ok(Self {
            session_id: content.read_uuid()?,
            transfer_channel: content.read_string()?,
            index: content.read_u32()?,
            last: content.read_bool()?,
            extra_data: content.read_bytes()?,
            data: content.read_bytes()?,
        })
    }
}

/// Streams a byte source to a set of channels.
pub struct ChunkedPacketSender {
    session_id: Uuid,
    transfer_channel: String,
    extra_data: Bytes,
    channels: Vec<Arc<NetworkChannel>>,
    source: Box<dyn AsyncRead + Send + Unpin>,
    chunk_size: usize,
}

impl ChunkedPacketSender {
    pub fn for_file_transfer() -> ChunkedPacketSenderBuilder {
        ChunkedPacketSenderBuilder::default()
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Start the transfer in the background.
    ///
    /// Without target channels the returned future is immediately
    /// [`TransferStatus::Success`] and the source is never read.
    pub fn transfer_chunked_data(self) -> TransferFuture {
        if self.channels.is_empty() {
            return future::ready(TransferStatus::Success).boxed();
        }
        let session_id = self.session_id;
        let handle = tokio::spawn(self.run());
        async move {
            handle.await.unwrap_or_else(|e| {
                warn!(session = %session_id, "Chunked transfer task failed: {}", e);
                TransferStatus::Failure
            })
        }
        .boxed()
    }

    async fn run(mut self) -> TransferStatus {
        let mut buf = vec![0u8; self.chunk_size];
        let mut live: Vec<Arc<NetworkChannel>> = self.channels.clone();
        let mut status = TransferStatus::Success;
        let mut index = 0u32;

        loop {
            let read = match read_chunk(&mut self.source, &mut buf).await {
                Ok(read) => read,
                Err(e) => {
                    warn!(session = %self.session_id, "Failed to read transfer source: {}", e);
                    status = TransferStatus::Failure;
                    break;
                }
            };
            if read == 0 {
                break;
            }

            let packet = self
                .chunk(index, false, Bytes::copy_from_slice(&buf[..read]))
                .to_packet();
            let results = future::join_all(
                live.iter()
                    .map(|channel| channel.send_packet_sync(packet.clone())),
            )
            .await;

            let mut still_live = Vec::with_capacity(live.len());
            for (channel, result) in live.into_iter().zip(results) {
                match result {
                    Ok(()) => still_live.push(channel),
                    Err(e) => {
                        warn!(
                            session = %self.session_id,
                            channel = channel.id(),
                            "Dropping transfer target: {}",
                            e
                        );
                        status = TransferStatus::Failure;
                    }
                }
            }
            live = still_live;
            if live.is_empty() {
                return TransferStatus::Failure;
            }
            index += 1;
        }

        let last = self.chunk(index, true, Bytes::new()).to_packet();
        let responses =
            future::join_all(live.iter().map(|channel| channel.send_query(last.clone()))).await;
        for response in responses {
            status = status.merge(response_status(response));
        }

        debug!(
            session = %self.session_id,
            transfer_channel = %self.transfer_channel,
            chunks = index + 1,
            %status,
            "Chunked transfer finished"
        );
        status
    }

    fn chunk(&self, index: u32, last: bool, data: Bytes) -> Chunk {
        Chunk {
            session_id: self.session_id,
            transfer_channel: self.transfer_channel.clone(),
            index,
            last,
            extra_data: if index == 0 {
                self.extra_data.clone()
            } else {
                Bytes::new()
            },
            data,
        }
    }
}

fn response_status(response: ProtocolResult<Packet>) -> TransferStatus {
    let packet = match response {
        Ok(packet) if !packet.is_empty() => packet,
        Ok(_) => return TransferStatus::Failure,
        Err(e) => {
            debug!("Transfer completion query failed: {}", e);
            return TransferStatus::Failure;
        }
    };
    match packet.content().map(|content| content.first().copied()) {
        Ok(Some(byte)) => TransferStatus::from_byte(byte).unwrap_or(TransferStatus::Failure),
        _ => TransferStatus::Failure,
    }
}

/// Fill `buf` as far as the source allows. Returns 0 only at end of input.
async fn read_chunk<R>(source: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        let read = source.read(&mut buf[filled..]).await?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    Ok(filled)
}

#[derive(Default)]
pub struct ChunkedPacketSenderBuilder {
    transfer_channel: Option<String>,
    extra_data: Bytes,
    channels: Vec<Arc<NetworkChannel>>,
    source: Option<Box<dyn AsyncRead + Send + Unpin>>,
    chunk_size: Option<usize>,
}

impl ChunkedPacketSenderBuilder {
    /// Name of the receiving [`TransferHandler`].
    pub fn transfer_channel(mut self, name: impl Into<String>) -> Self {
        self.transfer_channel = Some(name.into());
        self
    }

    pub fn extra_data(mut self, extra_data: impl Into<Bytes>) -> Self {
        self.extra_data = extra_data.into();
        self
    }

    pub fn to_channels(mut self, channels: Vec<Arc<NetworkChannel>>) -> Self {
        self.channels = channels;
        self
    }

    pub fn source<R>(mut self, source: R) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }

    pub fn build(self) -> ProtocolResult<ChunkedPacketSender> {
        let transfer_channel = self
            .transfer_channel
            .ok_or_else(|| ProtocolError::Transfer("no transfer channel given".to_string()))?;
        let source = self
            .source
            .ok_or_else(|| ProtocolError::Transfer("no source given".to_string()))?;
        let chunk_size = self.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE);
        if chunk_size == 0 {
            return Err(ProtocolError::Transfer(
                "chunk size must be positive".to_string(),
            ));
        }
        Ok(ChunkedPacketSender {
            session_id: Uuid::new_v4(),
            transfer_channel,
            extra_data: self.extra_data,
            channels: self.channels,
            source,
            chunk_size,
        })
    }
}

/// Consumes the assembled payload of a finished transfer.
///
/// Runs on the blocking thread pool, so file I/O is fine here.
pub trait TransferHandler: Send + Sync {
    fn handle_transfer(&self, info: &ChunkSessionInformation, data: Bytes) -> TransferStatus;
}

impl<F> TransferHandler for F
where
    F: Fn(&ChunkSessionInformation, Bytes) -> TransferStatus + Send + Sync,
{
    fn handle_transfer(&self, info: &ChunkSessionInformation, data: Bytes) -> TransferStatus {
        self(info, data)
    }
}

#[derive(Default)]
struct ReceiverSession {
    network_channel: u64,
    transfer_channel: String,
    extra_data: Option<Bytes>,
    chunks: BTreeMap<u32, Bytes>,
}

/// Receiving end of chunked transfers; register it on
/// [`CHUNKED_PACKET_CHANNEL`].
#[derive(Default)]
pub struct ChunkedTransferListener {
    handlers: RwLock<HashMap<String, Arc<dyn TransferHandler>>>,
    sessions: DashMap<Uuid, ReceiverSession>,
}

impl ChunkedTransferListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_handler(
        &self,
        transfer_channel: impl Into<String>,
        handler: Arc<dyn TransferHandler>,
    ) {
        self.handlers.write().insert(transfer_channel.into(), handler);
    }

    pub fn unregister_handler(&self, transfer_channel: &str) -> bool {
        self.handlers.write().remove(transfer_channel).is_some()
    }

    pub fn open_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Drop the partially received sessions that arrived on `channel_id`.
    /// Call this when the network channel closes; those transfers can never
    /// complete.
    pub fn discard_channel_sessions(&self, channel_id: u64) -> usize {
        let before = self.sessions.len();
        self.sessions
            .retain(|_, session| session.network_channel != channel_id);
        let discarded = before.saturating_sub(self.sessions.len());
        if discarded > 0 {
            debug!(channel = channel_id, discarded, "Discarded unfinished chunked transfers");
        }
        discarded
    }

    fn accept_chunk(
        &self,
        channel_id: u64,
        chunk: Chunk,
    ) -> Option<(ChunkSessionInformation, ProtocolResult<Bytes>)> {
        let mut session = self.sessions.entry(chunk.session_id).or_default();
        session.network_channel = channel_id;
        session.transfer_channel = chunk.transfer_channel;
        if chunk.index == 0 {
            session.extra_data = Some(chunk.extra_data);
        }
        if !chunk.last {
            // a repeated chunk replaces the earlier copy
            session.chunks.insert(chunk.index, chunk.data);
            return None;
        }
        drop(session);

        let (_, session) = self.sessions.remove(&chunk.session_id)?;
        let info = ChunkSessionInformation {
            session_id: chunk.session_id,
            transfer_channel: session.transfer_channel.clone(),
            extra_data: session.extra_data.clone().unwrap_or_default(),
        };
        Some((info, assemble(session, chunk.index)))
    }
}

fn assemble(session: ReceiverSession, chunk_count: u32) -> ProtocolResult<Bytes> {
    if session.extra_data.is_none() {
        return Err(ProtocolError::Transfer("first chunk never arrived".to_string()));
    }
    if session.chunks.len() != chunk_count as usize
        || session.chunks.keys().next_back().is_some_and(|last| *last + 1 != chunk_count)
    {
        return Err(ProtocolError::Transfer(format!(
            "expected {} chunks, received {}",
            chunk_count,
            session.chunks.len()
        )));
    }
    let total = session.chunks.values().map(Bytes::len).sum();
    let mut data = BytesMut::with_capacity(total);
    for chunk in session.chunks.into_values() {
        data.extend_from_slice(&chunk);
    }
    Ok(data.freeze())
}

impl PacketListener for ChunkedTransferListener {
    fn handle(&self, channel: &Arc<NetworkChannel>, packet: &Packet) -> anyhow::Result<()> {
        let chunk = Chunk::from_packet(packet)?;
        let Some((info, data)) = self.accept_chunk(channel.id(), chunk) else {
            return Ok(());
        };

        let handler = self.handlers.read().get(&info.transfer_channel).cloned();
        let query = packet.is_query().then(|| packet.clone());
        let channel = channel.clone();

        tokio::spawn(async move {
            let status = match (handler, data) {
                (Some(handler), Ok(data)) => {
                    let info = info.clone();
                    tokio::task::spawn_blocking(move || handler.handle_transfer(&info, data))
                        .await
                        .unwrap_or(TransferStatus::Failure)
                }
                (None, _) => {
                    warn!(
                        transfer_channel = %info.transfer_channel,
                        "No handler for chunked transfer"
                    );
                    TransferStatus::Failure
                }
                (_, Err(e)) => {
                    warn!(session = %info.session_id, "Incomplete chunked transfer: {}", e);
                    TransferStatus::Failure
                }
            };

            debug!(
                session = %info.session_id,
                transfer_channel = %info.transfer_channel,
                %status,
                "Chunked transfer received"
            );
            if let Some(query) = query {
                match query.response(vec![status.to_byte()]) {
                    Ok(response) => {
                        if let Err(e) = channel.send_packet(response) {
                            debug!("Failed to answer chunked transfer: {}", e);
                        }
                    }
                    Err(e) => warn!("Failed to build transfer response: {}", e),
                }
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::*;
    use crate::{channel::OutboundQueue, query::DEFAULT_QUERY_TIMEOUT};

    #[test]
    fn test_status_merge_prefers_failure() {
        use TransferStatus::*;
        assert_eq!(Success.merge(Success), Success);
        assert_eq!(Success.merge(AlreadyExists), AlreadyExists);
        assert_eq!(AlreadyExists.merge(Failure), Failure);
        assert_eq!(Failure.merge(Success), Failure);
        assert!(TransferStatus::from_byte(9).is_err());
    }

    #[tokio::test]
    async fn test_no_targets_succeeds_without_reading() {
        struct PanicReader;
        impl AsyncRead for PanicReader {
            fn poll_read(
                self: std::pin::Pin<&mut Self>,
                _cx: &mut std::task::Context<'_>,
                _buf: &mut tokio::io::ReadBuf<'_>,
            ) -> std::task::Poll<std::io::Result<()>> {
                panic!("source must not be read without targets");
            }
        }

        let status = ChunkedPacketSender::for_file_transfer()
            .transfer_channel("deploy_static_service")
            .source(PanicReader)
            .build()
            .unwrap()
            .transfer_chunked_data()
            .await;
        assert_eq!(status, TransferStatus::Success);
    }

    #[test]
    fn test_builder_requires_channel_and_source() {
        assert!(ChunkedPacketSender::for_file_transfer()
            .source(&b""[..])
            .build()
            .is_err());
        assert!(ChunkedPacketSender::for_file_transfer()
            .transfer_channel("x")
            .build()
            .is_err());
    }

    /// Relay everything the sender writes into a receiving listener, the way
    /// a real connection would, and route the status responses back.
    async fn relay(
        sender_channel: Arc<NetworkChannel>,
        mut queue: OutboundQueue,
        listener: Arc<ChunkedTransferListener>,
        reorder: bool,
    ) {
        let (receiver_channel, mut receiver_queue) = NetworkChannel::loopback(DEFAULT_QUERY_TIMEOUT);
        let mut held = Vec::new();
        while let Some(packet) = queue.next_packet().await {
            let chunk = Chunk::from_packet(&packet).unwrap();
            if reorder && !chunk.last {
                held.push(packet);
                continue;
            }
            for early in held.drain(..).rev() {
                listener.handle(&receiver_channel, &early).unwrap();
            }
            listener.handle(&receiver_channel, &packet).unwrap();
            if chunk.last {
                let response = receiver_queue.next_packet().await.unwrap();
                sender_channel.query_manager().handle_query_response(response);
                return;
            }
        }
    }

    #[tokio::test]
    async fn test_transfer_reassembles_out_of_order_chunks() {
        let received = Arc::new(Mutex::new(None));
        let listener = Arc::new(ChunkedTransferListener::new());
        let sink = received.clone();
        listener.register_handler(
            "deploy_static_service",
            Arc::new(move |info: &ChunkSessionInformation, data: Bytes| {
                *sink.lock() = Some((info.extra_data.clone(), data));
                TransferStatus::Success
            }),
        );

        let payload: Vec<u8> = (0..2500u32).map(|i| (i % 251) as u8).collect();
        let (channel, queue) = NetworkChannel::loopback(Duration::from_secs(5));
        let relay = tokio::spawn(relay(channel.clone(), queue, listener.clone(), true));

        let status = ChunkedPacketSender::for_file_transfer()
            .transfer_channel("deploy_static_service")
            .extra_data(Bytes::from_static(b"meta"))
            .to_channels(vec![channel])
            .source(std::io::Cursor::new(payload.clone()))
            .chunk_size(1000)
            .build()
            .unwrap()
            .transfer_chunked_data()
            .await;
        relay.await.unwrap();

        assert_eq!(status, TransferStatus::Success);
        let (extra, data) = received.lock().take().unwrap();
        assert_eq!(extra.as_ref(), b"meta");
        assert_eq!(data.as_ref(), payload.as_slice());
        assert_eq!(listener.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_handler_status_is_reported() {
        let listener = Arc::new(ChunkedTransferListener::new());
        listener.register_handler(
            "deploy_service_template",
            Arc::new(|_: &ChunkSessionInformation, _: Bytes| TransferStatus::AlreadyExists),
        );

        let (channel, queue) = NetworkChannel::loopback(Duration::from_secs(5));
        let relay = tokio::spawn(relay(channel.clone(), queue, listener, false));
        let status = ChunkedPacketSender::for_file_transfer()
            .transfer_channel("deploy_service_template")
            .to_channels(vec![channel])
            .source(&b"abc"[..])
            .build()
            .unwrap()
            .transfer_chunked_data()
            .await;
        relay.await.unwrap();
        assert_eq!(status, TransferStatus::AlreadyExists);
    }

    #[tokio::test]
    async fn test_unknown_transfer_channel_fails() {
        let listener = Arc::new(ChunkedTransferListener::new());
        let (channel, queue) = NetworkChannel::loopback(Duration::from_secs(5));
        let relay = tokio::spawn(relay(channel.clone(), queue, listener, false));
        let status = ChunkedPacketSender::for_file_transfer()
            .transfer_channel("nobody_listens")
            .to_channels(vec![channel])
            .source(&b"abc"[..])
            .build()
            .unwrap()
            .transfer_chunked_data()
            .await;
        relay.await.unwrap();
        assert_eq!(status, TransferStatus::Failure);
    }

    #[test]
    fn test_missing_chunk_is_detected() {
        let mut session = ReceiverSession {
            extra_data: Some(Bytes::new()),
            ..Default::default()
        };
        session.chunks.insert(0, Bytes::from_static(b"a"));
        session.chunks.insert(2, Bytes::from_static(b"c"));
        assert!(assemble(session, 3).is_err());
    }

    #[test]
    fn test_closed_channel_sessions_are_discarded() {
        let listener = ChunkedTransferListener::new();
        let (first, _first_queue) = NetworkChannel::loopback(DEFAULT_QUERY_TIMEOUT);
        let (second, _second_queue) = NetworkChannel::loopback(DEFAULT_QUERY_TIMEOUT);

        for (channel, session_id) in [(&first, Uuid::new_v4()), (&second, Uuid::new_v4())] {
            let chunk = Chunk {
                session_id,
                transfer_channel: "deploy_static_service".to_string(),
                index: 0,
                last: false,
                extra_data: Bytes::new(),
                data: Bytes::from(vec![7u8; 1024]),
            };
            listener.handle(channel, &chunk.to_packet()).unwrap();
        }
        assert_eq!(listener.open_sessions(), 2);

        first.close();
        assert_eq!(listener.discard_channel_sessions(first.id()), 1);
        assert_eq!(listener.open_sessions(), 1);
        assert_eq!(listener.discard_channel_sessions(first.id()), 0);
        assert_eq!(listener.discard_channel_sessions(second.id()), 1);
        assert_eq!(listener.open_sessions(), 0);
    }
}
