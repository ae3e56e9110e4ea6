//! Named control messages on [`INTERNAL_MSG_CHANNEL`]
//!
//! Layout: `string message | byte-array content`.

use bytes::{Bytes, BytesMut};

use crate::{
    buffer::{DataBufReader, DataBufWriter},
    error::ProtocolResult,
    packet::{Packet, INTERNAL_MSG_CHANNEL},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMessage {
    pub message: String,
    pub content: Bytes,
}

impl ChannelMessage {
    pub fn new(message: impl Into<String>, content: impl Into<Bytes>) -> Self {
        Self {
            message: message.into(),
            content: content.into(),
        }
    }

    /// A message without content.
    pub fn named(message: impl Into<String>) -> Self {
        Self::new(message, Bytes::new())
    }

    fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8 + self.message.len() + self.content.len());
        buf.write_string(&self.message);
        buf.write_bytes(&self.content);
        buf.freeze()
    }

    pub fn to_packet(&self) -> Packet {
        Packet::new(INTERNAL_MSG_CHANNEL, self.encode())
    }

    /// Same as [`to_packet`](Self::to_packet), but the packet skips the
    /// normal outbound queue.
    pub fn to_prioritized_packet(&self) -> Packet {
        Packet::prioritized(INTERNAL_MSG_CHANNEL, self.encode())
    }

    pub fn from_packet(packet: &Packet) -> ProtocolResult<Self> {
        let mut content = packet.content()?.clone();
        let message = content.read_string()?;
        let content = content.read_bytes()?;
        Ok(Self { message, content })
    }
}
