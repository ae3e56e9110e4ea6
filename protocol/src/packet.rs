//! Packets
//!
//! A packet is the unit of cross-node communication. One structure covers
//! both flavors:
//! - one-way: no correlation id, delivered to every listener of its channel
//! - query: carries a correlation id; the reply copies the id and travels on
//!   [`QUERY_RESPONSE_CHANNEL`]
//!
//! [`Packet::empty`] is the reserved "no answer available" marker. Reading its
//! content or building a response from it fails loudly.

use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{ProtocolError, ProtocolResult};

/// Channel of query responses and of the empty packet.
pub const QUERY_RESPONSE_CHANNEL: i32 = -1;
/// Node authorization handshake.
pub const INTERNAL_AUTHORIZATION_CHANNEL: i32 = 0;
/// Named control messages between nodes.
pub const INTERNAL_MSG_CHANNEL: i32 = 1;
/// Node snapshot heartbeats.
pub const NODE_INFO_CHANNEL: i32 = 2;
/// Chunked byte-stream transfers.
pub const CHUNKED_PACKET_CHANNEL: i32 = 3;

/// An immutable wire message.
#[derive(Clone, PartialEq, Eq)]
pub struct Packet {
    channel: i32,
    content: Bytes,
    unique_id: Option<Uuid>,
    prioritized: bool,
    creation: DateTime<Utc>,
    empty: bool,
}

impl Packet {
    pub fn new(channel: i32, content: impl Into<Bytes>) -> Self {
        Self {
            channel,
            content: content.into(),
            unique_id: None,
            prioritized: false,
            creation: Utc::now(),
            empty: false,
        }
    }

    /// A packet that skips the normal outbound queue of a channel.
    ///
    /// Use sparingly: a steady stream of prioritized packets starves all
    /// other traffic on the connection.
    pub fn prioritized(channel: i32, content: impl Into<Bytes>) -> Self {
        Self {
            prioritized: true,
            ..Self::new(channel, content)
        }
    }

    /// The reserved "no answer available" packet: response channel, no
    /// correlation id, epoch creation time.
    pub fn empty() -> Self {
        Self {
            channel: QUERY_RESPONSE_CHANNEL,
            content: Bytes::new(),
            unique_id: None,
            prioritized: false,
            creation: DateTime::<Utc>::UNIX_EPOCH,
            empty: true,
        }
    }

    /// Rebuild a packet read off the wire.
    pub(crate) fn from_wire(
        channel: i32,
        content: Bytes,
        unique_id: Option<Uuid>,
        prioritized: bool,
        creation: DateTime<Utc>,
    ) -> Self {
        Self {
            channel,
            content,
            unique_id,
            prioritized,
            creation,
            empty: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.empty
    }

    pub fn channel(&self) -> i32 {
        self.channel
    }

    /// The payload of this packet.
    ///
    /// # Errors
    /// [`ProtocolError::EmptyPacketAccess`] for the empty packet.
    pub fn content(&self) -> ProtocolResult<&Bytes> {
        if self.empty {
            return Err(ProtocolError::EmptyPacketAccess);
        }
        Ok(&self.content)
    }

    /// Consume the packet and take ownership of the payload.
    pub fn into_content(self) -> ProtocolResult<Bytes> {
        if self.empty {
            return Err(ProtocolError::EmptyPacketAccess);
        }
        Ok(self.content)
    }

    pub fn readable_bytes(&self) -> usize {
        self.content.len()
    }

    pub fn unique_id(&self) -> Option<Uuid> {
        self.unique_id
    }

    pub fn is_query(&self) -> bool {
        self.unique_id.is_some()
    }

    pub fn is_prioritized(&self) -> bool {
        self.prioritized
    }

    pub fn creation(&self) -> DateTime<Utc> {
        self.creation
    }

    /// Overwrite the correlation id. Only the query manager assigns ids.
    pub(crate) fn set_unique_id(&mut self, unique_id: Uuid) {
        self.unique_id = Some(unique_id);
    }

    /// Build the response to this query packet.
    ///
    /// # Errors
    /// - [`ProtocolError::EmptyPacketAccess`] when called on the empty packet
    /// - [`ProtocolError::NotAQuery`] when this packet has no correlation id
    pub fn response(&self, content: impl Into<Bytes>) -> ProtocolResult<Packet> {
        if self.empty {
            return Err(ProtocolError::EmptyPacketAccess);
        }
        let unique_id = self
            .unique_id
            .ok_or(ProtocolError::NotAQuery(self.channel))?;
        let mut response = Packet::new(QUERY_RESPONSE_CHANNEL, content);
        response.unique_id = Some(unique_id);
        response.prioritized = self.prioritized;
        Ok(response)
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.empty {
            return f.write_str("Packet(EMPTY)");
        }
        f.debug_struct("Packet")
            .field("channel", &self.channel)
            .field("bytes", &self.content.len())
            .field("unique_id", &self.unique_id)
            .field("prioritized", &self.prioritized)
            .field("creation", &self.creation)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_packet_rejects_content_access() {
        let empty = Packet::empty();
        assert!(empty.is_empty());
        assert_eq!(empty.channel(), QUERY_RESPONSE_CHANNEL);
        assert_eq!(empty.creation(), DateTime::<Utc>::UNIX_EPOCH);
        assert!(empty.unique_id().is_none());
        assert!(matches!(
            empty.content(),
            Err(ProtocolError::EmptyPacketAccess)
        ));
        assert!(matches!(
            empty.clone().into_content(),
            Err(ProtocolError::EmptyPacketAccess)
        ));
        assert!(matches!(
            empty.response(Bytes::new()),
            Err(ProtocolError::EmptyPacketAccess)
        ));
    }

    #[test]
    fn test_zero_length_packet_is_not_the_empty_packet() {
        let packet = Packet::new(QUERY_RESPONSE_CHANNEL, Bytes::new());
        assert!(!packet.is_empty());
        assert_eq!(packet.content().unwrap().len(), 0);
    }

    #[test]
    fn test_response_copies_correlation_id() {
        let id = Uuid::new_v4();
        let mut query = Packet::new(INTERNAL_MSG_CHANNEL, Bytes::from_static(b"q"));
        query.set_unique_id(id);

        let response = query.response(Bytes::from_static(b"a")).unwrap();
        assert_eq!(response.channel(), QUERY_RESPONSE_CHANNEL);
        assert_eq!(response.unique_id(), Some(id));
        assert_eq!(response.content().unwrap().as_ref(), b"a");
    }

    #[test]
    fn test_response_requires_query() {
        let packet = Packet::new(7, Bytes::new());
        assert!(matches!(
            packet.response(Bytes::new()),
            Err(ProtocolError::NotAQuery(7))
        ));
    }

    #[test]
    fn test_prioritized_flag() {
        assert!(Packet::prioritized(1, Bytes::new()).is_prioritized());
        assert!(!Packet::new(1, Bytes::new()).is_prioritized());
    }
}
