//! Binary buffer primitives
//!
//! Extension traits over [`bytes::BufMut`] / [`bytes::Buf`] writing the
//! big-endian primitives every payload in the protocol is composed of:
//! - bool: one byte, 0 or 1
//! - string / byte array: u32 length followed by the raw bytes (strings are UTF-8)
//! - string list: u32 count followed by strings
//! - uuid: 16 raw bytes
//!
//! Reads never panic on short input; they fail with
//! [`ProtocolError::BufferUnderflow`].

use bytes::{Buf, BufMut, Bytes};
use uuid::Uuid;

use crate::error::{ProtocolError, ProtocolResult};

pub trait DataBufWriter: BufMut {
    fn write_bool(&mut self, value: bool) {
        self.put_u8(u8::from(value));
    }

    fn write_string(&mut self, value: &str) {
        self.write_bytes(value.as_bytes());
    }

    fn write_bytes(&mut self, value: &[u8]) {
        self.put_u32(value.len() as u32);
        self.put_slice(value);
    }

    fn write_string_list<S: AsRef<str>>(&mut self, values: &[S]) {
        self.put_u32(values.len() as u32);
        for value in values {
            self.write_string(value.as_ref());
        }
    }

    fn write_uuid(&mut self, value: &Uuid) {
        self.put_slice(value.as_bytes());
    }
}

impl<T: BufMut + ?Sized> DataBufWriter for T {}

pub trait DataBufReader: Buf {
    fn ensure_readable(&self, needed: usize) -> ProtocolResult<()> {
        let remaining = self.remaining();
        if remaining < needed {
            return Err(ProtocolError::BufferUnderflow { needed, remaining });
        }
        Ok(())
    }

    fn read_bool(&mut self) -> ProtocolResult<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(ProtocolError::Malformed(format!(
                "invalid boolean byte {other}"
            ))),
        }
    }

    fn read_u8(&mut self) -> ProtocolResult<u8> {
        self.ensure_readable(1)?;
        Ok(self.get_u8())
    }

    fn read_u32(&mut self) -> ProtocolResult<u32> {
        self.ensure_readable(4)?;
        Ok(self.get_u32())
    }

    fn read_i32(&mut self) -> ProtocolResult<i32> {
        self.ensure_readable(4)?;
        Ok(self.get_i32())
    }

    fn read_i64(&mut self) -> ProtocolResult<i64> {
        self.ensure_readable(8)?;
        Ok(self.get_i64())
    }

    fn read_bytes(&mut self) -> ProtocolResult<Bytes> {
        let len = self.read_u32()? as usize;
        self.ensure_readable(len)?;
        Ok(self.copy_to_bytes(len))
    }

    fn read_string(&mut self) -> ProtocolResult<String> {
        let bytes = self.read_bytes()?;
        Ok(String::from_utf8(bytes.to_vec())?)
    }

    fn read_string_list(&mut self) -> ProtocolResult<Vec<String>> {
        let count = self.read_u32()? as usize;
        // each entry needs at least its length prefix
        self.ensure_readable(count.saturating_mul(4))?;
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            values.push(self.read_string()?);
        }
        Ok(values)
    }

    fn read_uuid(&mut self) -> ProtocolResult<Uuid> {
        self.ensure_readable(16)?;
        let mut raw = [0u8; 16];
        self.copy_to_slice(&mut raw);
        Ok(Uuid::from_bytes(raw))
    }
}

impl<T: Buf + ?Sized> DataBufReader for T {}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use super::*;

    #[test]
    fn test_mixed_payload_reads_back_in_order() {
        let id = Uuid::new_v4();
        let mut buf = BytesMut::new();
        buf.write_string("deploy_static_service");
        buf.write_bool(true);
        buf.write_uuid(&id);
        buf.write_string_list(&["line one", "line two"]);
        buf.write_bytes(&[1, 2, 3]);

        let mut reader = buf.freeze();
        assert_eq!(reader.read_string().unwrap(), "deploy_static_service");
        assert!(reader.read_bool().unwrap());
        assert_eq!(reader.read_uuid().unwrap(), id);
        assert_eq!(
            reader.read_string_list().unwrap(),
            vec!["line one".to_string(), "line two".to_string()]
        );
        assert_eq!(reader.read_bytes().unwrap().as_ref(), &[1, 2, 3]);
        assert!(!reader.has_remaining());
    }

    #[test]
    fn test_short_reads_fail_explicitly() {
        let mut buf = BytesMut::new();
        buf.put_u32(10);
        buf.put_slice(b"abc");

        let mut reader = buf.freeze();
        match reader.read_string() {
            Err(ProtocolError::BufferUnderflow { needed, remaining }) => {
                assert_eq!(needed, 10);
                assert_eq!(remaining, 3);
            }
            other => panic!("expected underflow, got {:?}", other),
        }

        let mut empty = Bytes::new();
        assert!(matches!(
            empty.read_bool(),
            Err(ProtocolError::BufferUnderflow { .. })
        ));
    }

    #[test]
    fn test_invalid_bool_byte_is_malformed() {
        let mut reader = Bytes::from_static(&[7]);
        assert!(matches!(reader.read_bool(), Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn test_invalid_utf8_is_rejected() {
        let mut buf = BytesMut::new();
        buf.write_bytes(&[0xff, 0xfe]);
        let mut reader = buf.freeze();
        assert!(matches!(
            reader.read_string(),
            Err(ProtocolError::InvalidString(_))
        ));
    }
}
