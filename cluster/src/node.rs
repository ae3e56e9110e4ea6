//! Node servers
//!
//! A [`NodeServer`] is either the local node or a remote peer. Both share a
//! [`NodeCore`] holding identity, state and snapshots. Every field is swapped
//! as a whole value, so readers never observe a half-updated node.

use std::{fmt, sync::Arc};

use arc_swap::ArcSwap;
use cloudnet_protocol::NetworkChannel;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::{
    error::ClusterResult,
    local::LocalNodeServer,
    remote::RemoteNodeServer,
    snapshot::{NodeIdentity, NodeInfoSnapshot},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeServerState {
    Unavailable,
    Ready,
}

impl fmt::Display for NodeServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeServerState::Unavailable => f.write_str("UNAVAILABLE"),
            NodeServerState::Ready => f.write_str("READY"),
        }
    }
}

#[derive(Debug, Default)]
struct SnapshotPair {
    current: Option<Arc<NodeInfoSnapshot>>,
    previous: Option<Arc<NodeInfoSnapshot>>,
}

/// State shared by both node variants.
pub(crate) struct NodeCore {
    identity: ArcSwap<NodeIdentity>,
    state: Mutex<(NodeServerState, Instant)>,
    snapshots: ArcSwap<SnapshotPair>,
    last_node_info_update: Mutex<Instant>,
}

impl NodeCore {
    pub(crate) fn new(identity: NodeIdentity) -> Self {
        Self {
            identity: ArcSwap::from_pointee(identity),
            state: Mutex::new((NodeServerState::Unavailable, Instant::now())),
            snapshots: ArcSwap::from_pointee(SnapshotPair::default()),
            last_node_info_update: Mutex::new(Instant::now()),
        }
    }

    pub(crate) fn identity(&self) -> Arc<NodeIdentity> {
        self.identity.load_full()
    }

    pub(crate) fn set_identity(&self, identity: NodeIdentity) {
        self.identity.store(Arc::new(identity));
    }

    pub(crate) fn state(&self) -> NodeServerState {
        self.state.lock().0
    }

    /// Returns the state the node was in before.
    pub(crate) fn set_state(&self, state: NodeServerState) -> NodeServerState {
        let mut guard = self.state.lock();
        let previous = guard.0;
        *guard = (state, Instant::now());
        previous
    }

    pub(crate) fn last_state_change(&self) -> Instant {
        self.state.lock().1
    }

    pub(crate) fn current_snapshot(&self) -> Option<Arc<NodeInfoSnapshot>> {
        self.snapshots.load().current.clone()
    }

    pub(crate) fn previous_snapshot(&self) -> Option<Arc<NodeInfoSnapshot>> {
        self.snapshots.load().previous.clone()
    }

    pub(crate) fn last_node_info_update(&self) -> Instant {
        *self.last_node_info_update.lock()
    }

    /// Refresh the liveness timestamp without touching the snapshots.
    pub(crate) fn touch(&self) {
        *self.last_node_info_update.lock() = Instant::now();
    }

    /// Install `snapshot`, or reset both snapshots when `None`.
    ///
    /// The first snapshot after a reset becomes both current and previous;
    /// later ones push the current snapshot to previous. Returns true when
    /// this installed the first snapshot.
    pub(crate) fn update_snapshot(&self, snapshot: Option<Arc<NodeInfoSnapshot>>) -> bool {
        let before = self.snapshots.rcu(|pair| match &snapshot {
            Some(snapshot) => SnapshotPair {
                current: Some(snapshot.clone()),
                previous: Some(pair.current.clone().unwrap_or_else(|| snapshot.clone())),
            },
            None => SnapshotPair::default(),
        });
        *self.last_node_info_update.lock() = Instant::now();
        snapshot.is_some() && before.current.is_none()
    }
}

/// Either the local node or a remote peer.
pub enum NodeServer {
    Local(LocalNodeServer),
    Remote(RemoteNodeServer),
}

impl NodeServer {
    pub(crate) fn core(&self) -> &NodeCore {
        match self {
            NodeServer::Local(local) => local.core(),
            NodeServer::Remote(remote) => remote.core(),
        }
    }

    pub fn unique_id(&self) -> String {
        self.core().identity().unique_id.clone()
    }

    pub fn identity(&self) -> Arc<NodeIdentity> {
        self.core().identity()
    }

    pub fn is_local(&self) -> bool {
        matches!(self, NodeServer::Local(_))
    }

    pub fn as_local(&self) -> Option<&LocalNodeServer> {
        match self {
            NodeServer::Local(local) => Some(local),
            NodeServer::Remote(_) => None,
        }
    }

    pub fn as_remote(&self) -> Option<&RemoteNodeServer> {
        match self {
            NodeServer::Local(_) => None,
            NodeServer::Remote(remote) => Some(remote),
        }
    }

    pub fn state(&self) -> NodeServerState {
        self.core().state()
    }

    pub fn last_state_change(&self) -> Instant {
        self.core().last_state_change()
    }

    /// Ready with a current snapshot (and, for remote nodes, a live channel).
    pub fn available(&self) -> bool {
        match self {
            NodeServer::Local(local) => local.available(),
            NodeServer::Remote(remote) => remote.available(),
        }
    }

    pub fn draining(&self) -> bool {
        match self {
            NodeServer::Local(local) => local.draining(),
            NodeServer::Remote(_) => self
                .node_info_snapshot()
                .is_some_and(|snapshot| snapshot.draining),
        }
    }

    /// Whether this node is the head node in the local view of the cluster.
    pub fn head(&self) -> bool {
        match self {
            NodeServer::Local(local) => local.head(),
            NodeServer::Remote(remote) => remote.head(),
        }
    }

    pub fn node_info_snapshot(&self) -> Option<Arc<NodeInfoSnapshot>> {
        self.core().current_snapshot()
    }

    pub fn last_node_info_snapshot(&self) -> Option<Arc<NodeInfoSnapshot>> {
        self.core().previous_snapshot()
    }

    pub fn last_node_info_update(&self) -> Instant {
        self.core().last_node_info_update()
    }

    /// Live channel to the node. Always `None` for the local node.
    pub fn channel(&self) -> Option<Arc<NetworkChannel>> {
        match self {
            NodeServer::Local(_) => None,
            NodeServer::Remote(remote) => remote.channel(),
        }
    }

    /// Connect to the node. A no-op for the local node.
    pub async fn connect(&self) -> ClusterResult<()> {
        match self {
            NodeServer::Local(_) => Ok(()),
            NodeServer::Remote(remote) => remote.connect().await,
        }
    }

    /// Install a new snapshot, or reset both snapshots with `None`.
    pub fn update_node_info_snapshot(&self, snapshot: Option<NodeInfoSnapshot>) {
        match self {
            NodeServer::Local(local) => local.update_node_info_snapshot(snapshot),
            NodeServer::Remote(remote) => remote.update_node_info_snapshot(snapshot),
        }
    }

    pub fn drain(&self, drain: bool) -> ClusterResult<()> {
        match self {
            NodeServer::Local(local) => {
                local.drain(drain);
                Ok(())
            }
            NodeServer::Remote(remote) => remote.drain(drain),
        }
    }

    pub async fn shutdown(&self) -> ClusterResult<()> {
        match self {
            NodeServer::Local(local) => local.shutdown(),
            NodeServer::Remote(remote) => remote.shutdown().await,
        }
    }

    pub async fn send_command_line(&self, command_line: &str) -> ClusterResult<Vec<String>> {
        match self {
            NodeServer::Local(local) => local.send_command_line(command_line),
            NodeServer::Remote(remote) => remote.send_command_line(command_line).await,
        }
    }

    /// Disconnect the node. The local node is never closed.
    pub fn close(&self) {
        if let NodeServer::Remote(remote) = self {
            remote.close();
        }
    }
}

impl fmt::Debug for NodeServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(if self.is_local() {
            "LocalNodeServer"
        } else {
            "RemoteNodeServer"
        })
        .field("unique_id", &self.unique_id())
        .field("state", &self.state())
        .field("available", &self.available())
        .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_shift_and_reset() {
        let core = NodeCore::new(NodeIdentity::new("Node-1", Vec::new()));
        let first = Arc::new(NodeInfoSnapshot::new(1, 1));
        let second = Arc::new(NodeInfoSnapshot::new(2, 1));

        assert!(core.update_snapshot(Some(first.clone())));
        assert_eq!(core.current_snapshot(), Some(first.clone()));
        assert_eq!(core.previous_snapshot(), Some(first.clone()));

        assert!(!core.update_snapshot(Some(second.clone())));
        assert_eq!(core.current_snapshot(), Some(second));
        assert_eq!(core.previous_snapshot(), Some(first));

        assert!(!core.update_snapshot(None));
        assert!(core.current_snapshot().is_none());
        assert!(core.previous_snapshot().is_none());

        // resetting twice leaves the node empty
        core.update_snapshot(None);
        assert!(core.current_snapshot().is_none());
        assert!(core.previous_snapshot().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_change_is_timestamped() {
        let core = NodeCore::new(NodeIdentity::new("Node-1", Vec::new()));
        let created = core.last_state_change();
        tokio::time::advance(std::time::Duration::from_secs(3)).await;

        assert_eq!(
            core.set_state(NodeServerState::Ready),
            NodeServerState::Unavailable
        );
        assert_eq!(core.state(), NodeServerState::Ready);
        assert_eq!(core.last_state_change() - created, std::time::Duration::from_secs(3));
    }
}
