//! Protocol error types.
//!
//! Misuse of the reserved empty packet is a programming error and always
//! surfaces as [`ProtocolError::EmptyPacketAccess`]; it is never turned into
//! empty bytes.

use thiserror::Error;
use uuid::Uuid;

pub type ProtocolResult<T> = Result<T, ProtocolError>;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("attempted to access the content of the empty packet")]
    EmptyPacketAccess,

    #[error("packet on channel {0} carries no correlation id, cannot build a response")]
    NotAQuery(i32),

    #[error("buffer underflow: needed {needed} bytes, {remaining} remaining")]
    BufferUnderflow { needed: usize, remaining: usize },

    #[error("invalid utf-8 in string field: {0}")]
    InvalidString(#[from] std::string::FromUtf8Error),

    #[error("malformed packet: {0}")]
    Malformed(String),

    #[error("frame of {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge { size: usize, max: usize },

    #[error("network channel {0} is closed")]
    ChannelClosed(u64),

    #[error("query {0} was cancelled before a response arrived")]
    QueryCancelled(Uuid),

    #[error("{count} packet listener(s) failed on channel {channel}")]
    ListenerFailures { channel: i32, count: usize },

    #[error("connection to {address} failed: {source}")]
    ConnectionFailed {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid transfer: {0}")]
    Transfer(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
