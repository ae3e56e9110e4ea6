//! CloudNet Packet Protocol
//!
//! This crate provides the wire layer cluster nodes talk over:
//! - Immutable packets with optional correlation ids and a reserved empty packet
//! - Length-prefixed binary framing for tokio streams
//! - Ordered, parent-chained packet listener dispatch
//! - Query/response correlation with bounded timeouts
//! - TCP client/server transport producing shared network channels
//! - Control channel messages and chunked byte-stream transfer

pub mod buffer;
pub mod channel;
pub mod chunk;
pub mod codec;
pub mod error;
pub mod listener;
pub mod message;
pub mod packet;
pub mod query;
pub mod transport;

pub use buffer::{DataBufReader, DataBufWriter};
pub use channel::{NetworkChannel, OutboundQueue};
pub use chunk::{
    ChunkSessionInformation, ChunkedPacketSender, ChunkedPacketSenderBuilder, ChunkedTransferListener, TransferFuture,
    TransferHandler, TransferStatus,
};
pub use codec::PacketCodec;
pub use error::{ProtocolError, ProtocolResult};
pub use listener::{ListenerHandle, PacketListener, PacketListenerRegistry};
pub use message::ChannelMessage;
pub use packet::{
    Packet, CHUNKED_PACKET_CHANNEL, INTERNAL_AUTHORIZATION_CHANNEL, INTERNAL_MSG_CHANNEL,
    NODE_INFO_CHANNEL, QUERY_RESPONSE_CHANNEL,
};
pub use query::QueryPacketManager;
pub use transport::{
    HostAndPort, NetworkChannelHandler, NetworkClient, NetworkServer, TransportConfig,
};
