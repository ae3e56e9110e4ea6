use std::sync::{Arc, Weak};

use arc_swap::ArcSwapOption;
use bytes::BytesMut;
use cloudnet_protocol::{
    ChannelMessage, DataBufReader, DataBufWriter, NetworkChannel, Packet,
    INTERNAL_AUTHORIZATION_CHANNEL,
};
use rand::seq::IndexedRandom;
use tracing::{debug, info, warn};

use crate::{
    context::ClusterContext,
    error::{ClusterError, ClusterResult},
    events::{NodeServerReadyEvent, NodeSnapshotUpdateEvent},
    handler::{
        CHANGE_DRAINING_STATE, CLUSTER_NODE_SHUTDOWN, REQUEST_INITIAL_CLUSTER_DATA,
        SEND_COMMAND_LINE, SYNC_CLUSTER_DATA,
    },
    node::{NodeCore, NodeServerState},
    provider::NodeServerProvider,
    snapshot::{NodeHandshake, NodeIdentity, NodeInfoSnapshot, WireValue},
};

/// A peer node, reached over a [`NetworkChannel`].
pub struct RemoteNodeServer {
    core: NodeCore,
    channel: ArcSwapOption<NetworkChannel>,
    context: Arc<ClusterContext>,
    provider: Weak<NodeServerProvider>,
}

impl RemoteNodeServer {
    pub(crate) fn new(
        identity: NodeIdentity,
        context: Arc<ClusterContext>,
        provider: Weak<NodeServerProvider>,
    ) -> Self {
        Self {
            core: NodeCore::new(identity),
            channel: ArcSwapOption::empty(),
            context,
            provider,
        }
    }

    pub(crate) fn core(&self) -> &NodeCore {
        &self.core
    }

    fn unique_id(&self) -> String {
        self.core.identity().unique_id.clone()
    }

    pub fn channel(&self) -> Option<Arc<NetworkChannel>> {
        self.channel.load_full()
    }

    fn live_channel(&self) -> Option<Arc<NetworkChannel>> {
        self.channel().filter(|channel| channel.is_active())
    }

    pub fn available(&self) -> bool {
        self.live_channel().is_some()
            && self.core.state() == NodeServerState::Ready
            && self.core.current_snapshot().is_some()
    }

    pub fn head(&self) -> bool {
        let id = self.unique_id();
        self.provider.upgrade().is_some_and(|provider| {
            provider
                .head_node()
                .is_some_and(|head| head.unique_id() == id)
        })
    }

    fn require_channel(&self) -> ClusterResult<Arc<NetworkChannel>> {
        if !self.available() {
            return Err(ClusterError::NodeUnavailable(self.unique_id()));
        }
        self.live_channel()
            .ok_or_else(|| ClusterError::NodeUnavailable(self.unique_id()))
    }

    /// Open a connection to one of the node's listeners and authenticate.
    pub async fn connect(&self) -> ClusterResult<()> {
        let identity = self.core.identity();
        let target = identity
            .listeners
            .choose(&mut rand::rng())
            .cloned()
            .ok_or_else(|| ClusterError::NoListeners(identity.unique_id.clone()))?;

        debug!(node = %identity.unique_id, %target, "Connecting to node");
        let channel = self.context.client.connect(&target).await?;
        let bound = match self.handshake(&channel).await {
            Ok(true) => {
                info!(node = %identity.unique_id, %target, "Connected to node");
                channel
            }
            Ok(false) => match self.live_channel() {
                Some(bound) => {
                    debug!(
                        node = %identity.unique_id,
                        unbound = channel.id(),
                        "Keeping the connection opened by the node"
                    );
                    bound
                }
                None => {
                    channel.close();
                    return Err(ClusterError::NodeUnavailable(identity.unique_id.clone()));
                }
            },
            Err(e) => {
                channel.close();
                match self.live_channel() {
                    Some(bound) if bound.id() != channel.id() => {
                        debug!(
                            node = %identity.unique_id,
                            "Already connected, dropped the extra connection: {}",
                            e
                        );
                        bound
                    }
                    _ => return Err(e),
                }
            }
        };
        if self.head() {
            self.request_initial_cluster_data(&bound).await;
        }
        Ok(())
    }

    async fn handshake(&self, channel: &Arc<NetworkChannel>) -> ClusterResult<bool> {
        let expected = self.unique_id();
        let local_snapshot = self
            .provider
            .upgrade()
            .and_then(|provider| provider.local_node().node_info_snapshot())
            .map(|snapshot| snapshot.as_ref().clone());
        let config = &self.context.config;
        let request =
            NodeHandshake::accepted(config.cluster_id.clone(), config.identity.clone(), local_snapshot);

        let response = channel
            .send_query(Packet::new(INTERNAL_AUTHORIZATION_CHANNEL, request.to_bytes()))
            .await?;
        if response.is_empty() {
            return Err(ClusterError::Handshake {
                node: expected,
                reason: "no response before the query timeout".to_string(),
            });
        }

        let reply = NodeHandshake::from_bytes(response.content()?)?;
        if !reply.accepted {
            return Err(ClusterError::Handshake {
                node: expected,
                reason: "rejected by the remote node".to_string(),
            });
        }
        if reply.cluster_id != config.cluster_id {
            return Err(ClusterError::Handshake {
                node: expected,
                reason: format!("remote node belongs to cluster {}", reply.cluster_id),
            });
        }
        if reply.identity.unique_id != expected {
            return Err(ClusterError::Handshake {
                node: expected,
                reason: format!("remote node identifies as {}", reply.identity.unique_id),
            });
        }
        self.bind(channel.clone(), reply.identity, reply.snapshot)
    }

    /// Of two connections between the same pair of nodes, both sides keep the
    /// one opened by the node with the smaller id.
    fn preferred(&self, channel: &NetworkChannel) -> bool {
        let opened_locally = channel.is_client_side();
        (self.context.config.identity.unique_id < self.unique_id()) == opened_locally
    }

    /// Attach an authenticated channel and mark the node ready.
    ///
    /// If the node already holds a live channel, the preferred of the two is
    /// kept. A losing channel is never closed here while the peer may still
    /// have it bound: the node with the smaller id closes it once its own
    /// connection is bound on both ends. Returns `Ok(false)` when a client
    /// side channel lost and is left for the peer to close. A losing server
    /// side channel fails with a handshake error.
    pub(crate) fn bind(
        &self,
        channel: Arc<NetworkChannel>,
        identity: NodeIdentity,
        snapshot: Option<NodeInfoSnapshot>,
    ) -> ClusterResult<bool> {
        let replaced = loop {
            let current = self.channel.load_full();
            let existing = current.clone().filter(|existing| existing.is_active());
            if let Some(existing) = &existing {
                if !self.preferred(&channel) || self.preferred(existing) {
                    if channel.is_client_side() && !self.preferred(&channel) {
                        return Ok(false);
                    }
                    return Err(ClusterError::Handshake {
                        node: identity.unique_id,
                        reason: "node is already connected".to_string(),
                    });
                }
            }

            let previous = self.channel.compare_and_swap(&current, Some(channel.clone()));
            let previous_id = (*previous).as_ref().map(|previous| previous.id());
            if previous_id == current.as_ref().map(|current| current.id()) {
                break existing;
            }
        };
        if let Some(replaced) = &replaced {
            debug!(
                node = %identity.unique_id,
                kept = channel.id(),
                dropped = replaced.id(),
                "Replaced duplicate node connection"
            );
            if channel.is_client_side() {
                replaced.close();
            }
        }

        // configured listeners win over the addresses a peer advertises
        if self.core.identity().listeners.is_empty() {
            self.core.set_identity(identity);
        }
        self.core.touch();
        self.core.set_state(NodeServerState::Ready);
        if let Some(snapshot) = snapshot {
            self.update_node_info_snapshot(Some(snapshot));
        }

        let node_id = self.unique_id();
        debug!(node = %node_id, channel = channel.id(), "Bound channel to node");
        if replaced.is_some() {
            return Ok(true);
        }
        let mut event = NodeServerReadyEvent { node_id };
        if let Err(e) = self.context.events.call_event(&mut event) {
            warn!(node = %event.node_id, "Ready listeners failed: {}", e);
        }
        Ok(true)
    }

    pub fn update_node_info_snapshot(&self, snapshot: Option<NodeInfoSnapshot>) {
        let Some(snapshot) = snapshot else {
            self.core.update_snapshot(None);
            return;
        };

        let snapshot = Arc::new(snapshot);
        let first = self.core.update_snapshot(Some(snapshot.clone()));
        let mut event = NodeSnapshotUpdateEvent {
            node_id: self.unique_id(),
            snapshot,
            first,
        };
        if let Err(e) = self.context.events.call_event(&mut event) {
            warn!(node = %event.node_id, "Snapshot update listeners failed: {}", e);
        }

        if first {
            if let Some(provider) = self.provider.upgrade() {
                if let Err(e) = provider.select_head_node() {
                    debug!("Head election after first snapshot failed: {}", e);
                }
            }
        }
    }

    pub fn drain(&self, drain: bool) -> ClusterResult<()> {
        let channel = self.require_channel()?;
        let mut content = BytesMut::with_capacity(1);
        content.write_bool(drain);
        channel.send_packet(ChannelMessage::new(CHANGE_DRAINING_STATE, content.freeze()).to_packet())?;
        Ok(())
    }

    /// Ask the node to terminate. Resolves once the node acknowledged or the
    /// query timed out.
    pub async fn shutdown(&self) -> ClusterResult<()> {
        let channel = self.require_channel()?;
        let response = channel
            .send_query(ChannelMessage::named(CLUSTER_NODE_SHUTDOWN).to_prioritized_packet())
            .await?;
        if response.is_empty() {
            warn!(node = %self.unique_id(), "Node did not acknowledge the shutdown request");
        }
        Ok(())
    }

    /// Run a command on the node. Yields no lines when the node failed to
    /// answer in time.
    pub async fn send_command_line(&self, command_line: &str) -> ClusterResult<Vec<String>> {
        let channel = self.require_channel()?;
        let mut content = BytesMut::with_capacity(4 + command_line.len());
        content.write_string(command_line);

        let response = match channel
            .send_query(ChannelMessage::new(SEND_COMMAND_LINE, content.freeze()).to_packet())
            .await
        {
            Ok(response) if !response.is_empty() => response,
            Ok(_) => {
                debug!(node = %self.unique_id(), "Command line query timed out");
                return Ok(Vec::new());
            }
            Err(e) => {
                debug!(node = %self.unique_id(), "Command line query failed: {}", e);
                return Ok(Vec::new());
            }
        };

        let mut content = response.into_content()?;
        match content.read_string_list() {
            Ok(lines) => Ok(lines),
            Err(e) => {
                warn!(node = %self.unique_id(), "Malformed command line response: {}", e);
                Ok(Vec::new())
            }
        }
    }

    /// Push all local sync data to this node.
    pub fn sync_cluster_data(&self, force: bool) -> ClusterResult<()> {
        let channel = self.require_channel()?;
        let blob = self.context.sync.prepare_cluster_data(force, &[]);
        channel.send_packet(ChannelMessage::new(SYNC_CLUSTER_DATA, blob).to_packet())?;
        Ok(())
    }

    async fn request_initial_cluster_data(&self, channel: &Arc<NetworkChannel>) {
        let response = match channel
            .send_query(ChannelMessage::named(REQUEST_INITIAL_CLUSTER_DATA).to_packet())
            .await
        {
            Ok(response) if !response.is_empty() => response,
            Ok(_) => {
                warn!(node = %self.unique_id(), "Head node did not send initial cluster data");
                return;
            }
            Err(e) => {
                warn!(node = %self.unique_id(), "Failed to request initial cluster data: {}", e);
                return;
            }
        };

        let result = response
            .into_content()
            .map_err(ClusterError::from)
            .and_then(|blob| self.context.sync.handle(blob));
        match result {
            Ok(Some(local)) => {
                let message = ChannelMessage::new(SYNC_CLUSTER_DATA, local);
                if let Err(e) = channel.send_packet(message.to_packet()) {
                    debug!(node = %self.unique_id(), "Failed to return local sync data: {}", e);
                }
            }
            Ok(None) => {}
            Err(e) => warn!(node = %self.unique_id(), "Failed to apply initial cluster data: {}", e),
        }
    }

    /// Disconnect the node. Calling it on a disconnected node has no effect.
    pub fn close(&self) {
        let channel = self.channel.swap(None);
        let was_ready = self.core.set_state(NodeServerState::Unavailable) == NodeServerState::Ready;
        if channel.is_none() && !was_ready && self.core.current_snapshot().is_none() {
            return;
        }

        if let Some(channel) = channel {
            channel.close();
        }
        self.core.update_snapshot(None);
        self.context.disconnect.handle_node_disconnect(&self.unique_id());

        if let Some(provider) = self.provider.upgrade() {
            if let Err(e) = provider.select_head_node() {
                debug!("Head election after disconnect failed: {}", e);
            }
        }
    }
}
