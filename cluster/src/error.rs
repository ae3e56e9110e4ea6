//! Cluster error types.

use cloudnet_protocol::ProtocolError;
use thiserror::Error;

pub type ClusterResult<T> = Result<T, ClusterError>;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("node {0} has no listen addresses configured")]
    NoListeners(String),

    #[error("node {0} is not available")]
    NodeUnavailable(String),

    #[error("node {0} is not known to this cluster")]
    UnknownNode(String),

    #[error("the local node can only be set to READY, requested {0}")]
    IllegalStateTransition(String),

    #[error("no available node to select as head node")]
    NoAvailableNode,

    #[error("invalid cluster configuration: {0}")]
    InvalidConfig(String),

    #[error("handshake with {node} failed: {reason}")]
    Handshake { node: String, reason: String },

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
