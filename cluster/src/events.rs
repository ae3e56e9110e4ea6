//! Events published on the node's [`EventManager`](cloudnet_events::EventManager).

use std::sync::Arc;

use crate::snapshot::NodeInfoSnapshot;

/// Fired before a freshly built local snapshot is installed. Listeners may
/// adjust it, typically by adding properties.
#[derive(Debug)]
pub struct LocalNodeSnapshotConfigureEvent {
    pub snapshot: NodeInfoSnapshot,
}

/// A remote node delivered a new snapshot.
#[derive(Debug, Clone)]
pub struct NodeSnapshotUpdateEvent {
    pub node_id: String,
    pub snapshot: Arc<NodeInfoSnapshot>,
    /// First snapshot since the node connected
    pub first: bool,
}

/// A remote node completed the handshake and is ready.
#[derive(Debug, Clone)]
pub struct NodeServerReadyEvent {
    pub node_id: String,
}

#[derive(Debug, Clone)]
pub struct NodeServerDisconnectEvent {
    pub node_id: String,
}

/// Head election picked a different node.
#[derive(Debug, Clone)]
pub struct HeadNodeChangeEvent {
    pub previous: Option<String>,
    pub current: String,
}
