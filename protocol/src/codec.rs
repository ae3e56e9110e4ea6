//! Packet framing codec
//!
//! Wire format (17 bytes overhead, 33 with a correlation id):
//! ```text
//! [u32 BE: frame_len][i32 BE: channel][u8: flags][16 bytes: uuid if flags & 1][i64 BE: creation millis][payload]
//! ```
//! `frame_len` counts every byte after itself. Flag bit 0 marks a correlation
//! id, bit 1 a prioritized packet. The decoded payload is a zero-copy slice of
//! the receive buffer.

use bytes::{Buf, BufMut, BytesMut};
use chrono::DateTime;
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    buffer::{DataBufReader, DataBufWriter},
    error::{ProtocolError, ProtocolResult},
    packet::Packet,
};

/// Maximum frame size (16 MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const FLAG_HAS_UNIQUE_ID: u8 = 0b01;
const FLAG_PRIORITIZED: u8 = 0b10;

/// channel + flags + creation millis
const FIXED_HEADER_SIZE: usize = 4 + 1 + 8;
const UNIQUE_ID_SIZE: usize = 16;

#[derive(Debug, Clone)]
pub struct PacketCodec {
    max_frame_size: usize,
}

impl PacketCodec {
    pub fn new() -> Self {
        Self::with_max_frame_size(MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    fn check_size(&self, size: usize) -> ProtocolResult<()> {
        if size > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size,
                max: self.max_frame_size,
            });
        }
        Ok(())
    }
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }

        // Peek at the frame length without consuming
        let frame_len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        self.check_size(frame_len)?;
        if frame_len < FIXED_HEADER_SIZE {
            return Err(ProtocolError::Malformed(format!(
                "frame of {} bytes is shorter than the fixed header",
                frame_len
            )));
        }

        if src.len() < 4 + frame_len {
            src.reserve(4 + frame_len - src.len());
            return Ok(None);
        }

        src.advance(4);
        let mut frame = src.split_to(frame_len).freeze();

        let channel = frame.read_i32()?;
        let flags = frame.read_u8()?;
        let unique_id = if flags & FLAG_HAS_UNIQUE_ID != 0 {
            Some(frame.read_uuid()?)
        } else {
            None
        };
        let creation_millis = frame.read_i64()?;
        let creation = DateTime::from_timestamp_millis(creation_millis).ok_or_else(|| {
            ProtocolError::Malformed(format!("invalid creation time {}", creation_millis))
        })?;

        // whatever is left is the payload
        Ok(Some(Packet::from_wire(
            channel,
            frame,
            unique_id,
            flags & FLAG_PRIORITIZED != 0,
            creation,
        )))
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let content = item.content()?;
        let id_size = if item.unique_id().is_some() {
            UNIQUE_ID_SIZE
        } else {
            0
        };
        let frame_len = FIXED_HEADER_SIZE + id_size + content.len();
        self.check_size(frame_len)?;

        let mut flags = 0u8;
        if item.unique_id().is_some() {
            flags |= FLAG_HAS_UNIQUE_ID;
        }
        if item.is_prioritized() {
            flags |= FLAG_PRIORITIZED;
        }

        dst.reserve(4 + frame_len);
        dst.put_u32(frame_len as u32);
        dst.put_i32(item.channel());
        dst.put_u8(flags);
        if let Some(unique_id) = item.unique_id() {
            dst.write_uuid(&unique_id);
        }
        dst.put_i64(item.creation().timestamp_millis());
        dst.put_slice(content);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use uuid::Uuid;

    use super::*;

    #[test]
    fn test_query_packet_survives_framing() {
        let mut codec = PacketCodec::new();
        let mut packet = Packet::prioritized(5, Bytes::from_static(b"payload"));
        let id = Uuid::new_v4();
        packet.set_unique_id(id);

        let mut buf = BytesMut::new();
        codec.encode(packet.clone(), &mut buf).unwrap();
        assert_eq!(buf.len(), 4 + FIXED_HEADER_SIZE + UNIQUE_ID_SIZE + 7);

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.channel(), 5);
        assert_eq!(decoded.unique_id(), Some(id));
        assert!(decoded.is_prioritized());
        assert_eq!(decoded.content().unwrap().as_ref(), b"payload");
        assert_eq!(
            decoded.creation().timestamp_millis(),
            packet.creation().timestamp_millis()
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frames_wait_for_more_data() {
        let mut codec = PacketCodec::new();
        let mut full = BytesMut::new();
        codec
            .encode(Packet::new(9, Bytes::from_static(b"abcdef")), &mut full)
            .unwrap();
        codec
            .encode(Packet::new(10, Bytes::from_static(b"xyz")), &mut full)
            .unwrap();

        let mut src = BytesMut::new();
        src.extend_from_slice(&full[..3]);
        assert!(codec.decode(&mut src).unwrap().is_none());
        src.extend_from_slice(&full[3..10]);
        assert!(codec.decode(&mut src).unwrap().is_none());
        src.extend_from_slice(&full[10..]);

        let first = codec.decode(&mut src).unwrap().unwrap();
        let second = codec.decode(&mut src).unwrap().unwrap();
        assert_eq!(first.channel(), 9);
        assert_eq!(second.channel(), 10);
        assert!(second.unique_id().is_none());
        assert!(codec.decode(&mut src).unwrap().is_none());
    }

    #[test]
    fn test_empty_packet_is_never_encoded() {
        let mut codec = PacketCodec::new();
        let mut buf = BytesMut::new();
        assert!(matches!(
            codec.encode(Packet::empty(), &mut buf),
            Err(ProtocolError::EmptyPacketAccess)
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_oversized_frames_are_rejected() {
        let mut codec = PacketCodec::with_max_frame_size(32);
        let mut buf = BytesMut::new();
        assert!(matches!(
            codec.encode(Packet::new(1, vec![0u8; 64]), &mut buf),
            Err(ProtocolError::FrameTooLarge { .. })
        ));

        let mut src = BytesMut::new();
        src.put_u32(1024);
        assert!(matches!(
            codec.decode(&mut src),
            Err(ProtocolError::FrameTooLarge { size: 1024, max: 32 })
        ));
    }

    #[test]
    fn test_truncated_header_is_malformed() {
        let mut codec = PacketCodec::new();
        let mut src = BytesMut::new();
        src.put_u32(3);
        src.put_slice(&[0, 0, 0]);
        assert!(matches!(
            codec.decode(&mut src),
            Err(ProtocolError::Malformed(_))
        ));
    }
}
