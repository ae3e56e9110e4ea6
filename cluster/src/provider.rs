//! Node server provider
//!
//! Owns the local node and every known remote node, elects the head node and
//! drives the periodic heartbeat and disconnect tracking. Cluster wide
//! operations fan out over the channels of all available remote nodes.
//!
//! Head election is local: every node computes its own view from the
//! snapshots it has seen, and views converge as snapshots propagate.

use std::{
    collections::BTreeMap,
    sync::{Arc, Weak},
};

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use chrono::Utc;
use cloudnet_events::EventManager;
use cloudnet_protocol::{
    ChannelMessage, ChunkSessionInformation, ChunkedPacketSender, ChunkedTransferListener,
    NetworkChannel, NetworkClient, NetworkServer, Packet, PacketListenerRegistry, TransferFuture,
    TransferStatus, CHUNKED_PACKET_CHANNEL, INTERNAL_AUTHORIZATION_CHANNEL, INTERNAL_MSG_CHANNEL,
    NODE_INFO_CHANNEL,
};
use futures::future::{self, FutureExt};
use parking_lot::{Mutex, RwLock};
use tokio::{io::AsyncRead, sync::watch, task::JoinHandle, time::Instant};
use tracing::{debug, info, warn};

use crate::{
    collaborators::{Collaborators, ServiceTemplate},
    config::ClusterConfig,
    context::ClusterContext,
    disconnect::NodeDisconnectHandler,
    error::{ClusterError, ClusterResult},
    events::HeadNodeChangeEvent,
    handler::{
        self, AuthorizationListener, ControlMessageListener, NodeChannelHandler,
        NodeInfoListener, DEPLOY_SERVICE_TEMPLATE, DEPLOY_STATIC_SERVICE, SYNC_CLUSTER_DATA,
    },
    local::LocalNodeServer,
    metrics,
    node::{NodeServer, NodeServerState},
    process::ProcessCollector,
    remote::RemoteNodeServer,
    snapshot::{NodeIdentity, WireValue},
    sync::{DataSyncHandler, DataSyncRegistry},
    tasks,
};

/// Sync key of the built-in handler that spreads node identities.
pub const CLUSTER_NODES_SYNC_KEY: &str = "cluster_nodes";

pub struct NodeServerProvider {
    context: Arc<ClusterContext>,
    local: Arc<NodeServer>,
    remotes: RwLock<BTreeMap<String, Arc<NodeServer>>>,
    head: ArcSwapOption<NodeServer>,
    election: Mutex<()>,
    transfers: Arc<ChunkedTransferListener>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    weak: Weak<NodeServerProvider>,
}

impl NodeServerProvider {
    /// Create the provider and register every statically configured peer.
    ///
    /// Packet listeners and the connection handler are installed on `client`
    /// right away. Use [`attach_server`](Self::attach_server) for the
    /// accepting side.
    pub fn new(
        config: ClusterConfig,
        events: Arc<EventManager>,
        client: Arc<NetworkClient>,
        sync: Arc<DataSyncRegistry>,
        collaborators: Collaborators,
    ) -> Arc<Self> {
        Self::with_startup_millis(
            config,
            events,
            client,
            sync,
            collaborators,
            Utc::now().timestamp_millis(),
        )
    }

    pub(crate) fn with_startup_millis(
        config: ClusterConfig,
        events: Arc<EventManager>,
        client: Arc<NetworkClient>,
        sync: Arc<DataSyncRegistry>,
        collaborators: Collaborators,
        startup_millis: i64,
    ) -> Arc<Self> {
        let context = Arc::new(ClusterContext {
            disconnect: NodeDisconnectHandler::new(
                events.clone(),
                collaborators.service_manager.clone(),
            ),
            process: ProcessCollector::new(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            config,
            events,
            client,
            sync,
            collaborators,
        });

        let provider = Arc::new_cyclic(|weak: &Weak<Self>| {
            let local = LocalNodeServer::new(context.clone(), weak.clone(), startup_millis);
            let (shutdown_tx, _) = watch::channel(false);
            Self {
                transfers: Arc::new(deployment_listener(&context)),
                context,
                local: Arc::new(NodeServer::Local(local)),
                remotes: RwLock::new(BTreeMap::new()),
                head: ArcSwapOption::empty(),
                election: Mutex::new(()),
                shutdown_tx,
                tasks: Mutex::new(Vec::new()),
                weak: weak.clone(),
            }
        });

        for identity in provider.context.config.nodes.clone() {
            provider.register_node(identity);
        }
        provider.register_cluster_nodes_handler();

        let client = &provider.context.client;
        client.set_channel_handler(Arc::new(NodeChannelHandler::new(provider.weak.clone())));
        provider.install_listeners(client.packet_registry());
        provider
    }

    /// Install the connection handler and packet listeners on `server`.
    pub fn attach_server(&self, server: &NetworkServer) {
        server.set_channel_handler(Arc::new(NodeChannelHandler::new(self.weak.clone())));
        self.install_listeners(server.packet_registry());
    }

    fn install_listeners(&self, registry: &PacketListenerRegistry) {
        registry.add_listener(
            INTERNAL_AUTHORIZATION_CHANNEL,
            Arc::new(AuthorizationListener::new(self.weak.clone())),
            None,
        );
        registry.add_listener(
            INTERNAL_MSG_CHANNEL,
            Arc::new(ControlMessageListener::new(self.weak.clone())),
            None,
        );
        registry.add_listener(
            NODE_INFO_CHANNEL,
            Arc::new(NodeInfoListener::new(self.weak.clone())),
            None,
        );
        registry.add_listener(CHUNKED_PACKET_CHANNEL, self.transfers.clone(), None);
    }

    fn register_cluster_nodes_handler(&self) {
        let data = self.weak.clone();
        let current = self.weak.clone();
        let writer = self.weak.clone();
        let handler = DataSyncHandler::new(
            CLUSTER_NODES_SYNC_KEY,
            move || {
                data.upgrade()
                    .map(|provider| {
                        provider
                            .nodes()
                            .iter()
                            .map(|node| node.identity().as_ref().clone())
                            .collect()
                    })
                    .unwrap_or_default()
            },
            move |incoming: &NodeIdentity| {
                current
                    .upgrade()
                    .and_then(|provider| provider.node(&incoming.unique_id))
                    .map(|node| node.identity().as_ref().clone())
            },
            move |identity: NodeIdentity| {
                if let Some(provider) = writer.upgrade() {
                    provider.apply_synced_identity(identity);
                }
            },
        )
        .with_name(|identity| identity.unique_id.clone());

        if !self.context.sync.register_handler(handler, None) {
            debug!("Cluster node sync handler is already registered");
        }
    }

    fn apply_synced_identity(&self, identity: NodeIdentity) {
        if identity.unique_id == self.local.unique_id() {
            return;
        }
        match self.node(&identity.unique_id) {
            Some(node) => node.core().set_identity(identity),
            None => {
                info!(node = %identity.unique_id, "Learned about node through cluster sync");
                self.register_node(identity);
            }
        }
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.context.config
    }

    pub fn events(&self) -> &Arc<EventManager> {
        &self.context.events
    }

    pub fn sync_registry(&self) -> &Arc<DataSyncRegistry> {
        &self.context.sync
    }

    pub fn transfer_listener(&self) -> &Arc<ChunkedTransferListener> {
        &self.transfers
    }

    pub fn local_node(&self) -> Arc<NodeServer> {
        self.local.clone()
    }

    /// The head node in this node's view, if an election succeeded.
    pub fn head_node(&self) -> Option<Arc<NodeServer>> {
        self.head.load_full()
    }

    pub fn node(&self, unique_id: &str) -> Option<Arc<NodeServer>> {
        if self.local.unique_id() == unique_id {
            return Some(self.local.clone());
        }
        self.remotes.read().get(unique_id).cloned()
    }

    /// Local node first, then remote nodes ordered by id.
    pub fn nodes(&self) -> Vec<Arc<NodeServer>> {
        let remotes = self.remotes.read();
        let mut nodes = Vec::with_capacity(remotes.len() + 1);
        nodes.push(self.local.clone());
        nodes.extend(remotes.values().cloned());
        nodes
    }

    pub fn remote_nodes(&self) -> Vec<Arc<NodeServer>> {
        self.remotes.read().values().cloned().collect()
    }

    pub fn available_nodes(&self) -> Vec<Arc<NodeServer>> {
        self.nodes()
            .into_iter()
            .filter(|node| node.available())
            .collect()
    }

    /// The remote node bound to `channel`.
    pub fn node_by_channel(&self, channel: &NetworkChannel) -> Option<Arc<NodeServer>> {
        self.remotes
            .read()
            .values()
            .find(|node| node.channel().is_some_and(|bound| bound.id() == channel.id()))
            .cloned()
    }

    /// Add a remote node. Returns false if the id is taken.
    pub fn register_node(&self, identity: NodeIdentity) -> bool {
        if identity.unique_id == self.local.unique_id() {
            return false;
        }
        let mut remotes = self.remotes.write();
        if remotes.contains_key(&identity.unique_id) {
            return false;
        }
        info!(node = %identity.unique_id, "Registered node");
        let unique_id = identity.unique_id.clone();
        let node = RemoteNodeServer::new(identity, self.context.clone(), self.weak.clone());
        remotes.insert(unique_id, Arc::new(NodeServer::Remote(node)));
        true
    }

    pub fn register_nodes(&self, identities: impl IntoIterator<Item = NodeIdentity>) -> usize {
        identities
            .into_iter()
            .filter(|identity| self.register_node(identity.clone()))
            .count()
    }

    /// Remove and close a remote node.
    pub fn unregister_node(&self, unique_id: &str) -> Option<Arc<NodeServer>> {
        let node = self.remotes.write().remove(unique_id)?;
        info!(node = %unique_id, "Unregistered node");
        node.close();
        if let Err(e) = self.select_head_node() {
            debug!("Head election after unregistering {} failed: {}", unique_id, e);
        }
        Some(node)
    }

    /// Elect the available node with the earliest startup time as head.
    ///
    /// Equal startup times fall back to the smaller node id. Fails when no
    /// node is available, which clears the head.
    pub fn select_head_node(&self) -> ClusterResult<Arc<NodeServer>> {
        let election = self.election.lock();
        let available = self.available_nodes();
        let head = available
            .iter()
            .filter_map(|node| {
                let startup = node.node_info_snapshot()?.startup_millis;
                Some(((startup, node.unique_id()), node))
            })
            .min_by(|(a, _), (b, _)| a.cmp(b))
            .map(|(_, node)| node.clone());

        let Some(head) = head else {
            self.head.store(None);
            drop(election);
            metrics::record_available_nodes(0);
            return Err(ClusterError::NoAvailableNode);
        };
        let previous = self.head.swap(Some(head.clone()));
        drop(election);

        metrics::record_available_nodes(available.len());
        let previous = previous.map(|node| node.unique_id());
        let current = head.unique_id();
        if previous.as_deref() != Some(current.as_str()) {
            info!(head = %current, previous = ?previous, "Head node changed");
            metrics::record_head_change(&current);
            let mut event = HeadNodeChangeEvent { previous, current };
            if let Err(e) = self.context.events.call_event(&mut event) {
                warn!("Head change listeners failed: {}", e);
            }
        }
        Ok(head)
    }

    /// Mark the local node ready and start the heartbeat and disconnect
    /// tracking tasks.
    pub fn start(&self) -> ClusterResult<()> {
        self.context.config.validate()?;
        if let NodeServer::Local(local) = self.local.as_ref() {
            local.set_state(NodeServerState::Ready)?;
        }

        let config = &self.context.config;
        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(tasks::run_heartbeat(
            self.weak.clone(),
            config.heartbeat_interval(),
            self.shutdown_tx.subscribe(),
        )));
        tasks.push(tokio::spawn(tasks::run_disconnect_tracker(
            self.weak.clone(),
            config.disconnect_check_interval(),
            self.shutdown_tx.subscribe(),
        )));
        info!(node = %self.local.unique_id(), "Node server provider started");
        Ok(())
    }

    /// Connect to every remote node that is not available yet. Failures are
    /// logged and not retried. Returns how many connections succeeded.
    pub async fn connect_nodes(&self) -> usize {
        let pending: Vec<_> = self
            .remote_nodes()
            .into_iter()
            .filter(|node| !node.available())
            .collect();
        let results = future::join_all(pending.iter().map(|node| async move {
            match node.connect().await {
                Ok(()) => true,
                Err(e) => {
                    warn!(node = %node.unique_id(), "Failed to connect to node: {}", e);
                    false
                }
            }
        }))
        .await;
        results.into_iter().filter(|connected| *connected).count()
    }

    /// Refresh the local snapshot and send it to every connected peer.
    /// Returns the number of peers reached.
    pub fn publish_local_snapshot(&self) -> usize {
        let NodeServer::Local(local) = self.local.as_ref() else {
            return 0;
        };
        let snapshot = local.update_local_snapshot();
        let peers = self.send_packet(Packet::new(NODE_INFO_CHANNEL, snapshot.to_bytes()));
        metrics::record_heartbeat_sent(peers);
        peers
    }

    /// Close every remote node that has a channel but sent no snapshot within
    /// the node timeout. Returns how many were closed.
    pub fn close_unresponsive_nodes(&self) -> usize {
        let timeout = self.context.config.node_timeout();
        let now = Instant::now();
        let mut closed = 0;
        for node in self.remote_nodes() {
            if node.channel().is_none() {
                continue;
            }
            let silence = now.saturating_duration_since(node.last_node_info_update());
            if silence > timeout {
                warn!(
                    node = %node.unique_id(),
                    silence_ms = silence.as_millis() as u64,
                    "Node sent no snapshot in time, disconnecting"
                );
                node.close();
                closed += 1;
            }
        }
        closed
    }

    /// Channels of all available remote nodes.
    pub fn connected_node_channels(&self) -> Vec<Arc<NetworkChannel>> {
        self.remote_nodes()
            .iter()
            .filter(|node| node.available())
            .filter_map(|node| node.channel())
            .collect()
    }

    /// Queue `packet` on every connected channel. Returns how many accepted it.
    pub fn send_packet(&self, packet: Packet) -> usize {
        self.connected_node_channels()
            .into_iter()
            .filter(|channel| match channel.send_packet(packet.clone()) {
                Ok(()) => true,
                Err(e) => {
                    debug!(channel = channel.id(), "Skipping channel: {}", e);
                    false
                }
            })
            .count()
    }

    /// Like [`send_packet`](Self::send_packet), but waits until every channel
    /// has written the packet.
    pub async fn send_packet_sync(&self, packet: Packet) -> usize {
        let channels = self.connected_node_channels();
        let results = future::join_all(
            channels
                .iter()
                .map(|channel| channel.send_packet_sync(packet.clone())),
        )
        .await;
        results.into_iter().filter(Result::is_ok).count()
    }

    /// Broadcast the data of every sync handler to the cluster. Returns the
    /// number of peers reached.
    pub fn sync_data_into_cluster(&self, force: bool) -> usize {
        let blob = self.context.sync.prepare_cluster_data(force, &[]);
        self.send_packet(ChannelMessage::new(SYNC_CLUSTER_DATA, blob).to_packet())
    }

    /// Stream a template archive to every connected peer.
    ///
    /// Completes with [`TransferStatus::Success`] right away when no peer is
    /// connected.
    pub fn deploy_template_to_cluster<R>(
        &self,
        template: &ServiceTemplate,
        source: R,
        overwrite: bool,
    ) -> TransferFuture
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        self.deploy_to_cluster(
            DEPLOY_SERVICE_TEMPLATE,
            handler::encode_template_deployment(template, overwrite),
            source,
        )
    }

    /// Stream the files of a static service to every connected peer.
    pub fn deploy_static_service_to_cluster<R>(
        &self,
        service_name: &str,
        source: R,
        overwrite: bool,
    ) -> TransferFuture
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        self.deploy_to_cluster(
            DEPLOY_STATIC_SERVICE,
            handler::encode_static_service_deployment(service_name, overwrite),
            source,
        )
    }

    fn deploy_to_cluster<R>(&self, transfer_channel: &str, extra_data: Bytes, source: R) -> TransferFuture
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let channels = self.connected_node_channels();
        if channels.is_empty() {
            debug!(%transfer_channel, "No connected nodes, nothing to deploy");
            return future::ready(TransferStatus::Success).boxed();
        }

        let sender = ChunkedPacketSender::for_file_transfer()
            .transfer_channel(transfer_channel)
            .extra_data(extra_data)
            .to_channels(channels)
            .source(source)
            .chunk_size(self.context.config.chunk_size)
            .build();
        match sender {
            Ok(sender) => {
                info!(
                    %transfer_channel,
                    session = %sender.session_id(),
                    "Deploying to cluster"
                );
                sender.transfer_chunked_data()
            }
            Err(e) => {
                warn!(%transfer_channel, "Failed to start cluster deployment: {}", e);
                future::ready(TransferStatus::Failure).boxed()
            }
        }
    }

    /// Close every remote node, elect the head once more and stop the
    /// background tasks. The local node stays ready.
    pub fn close(&self) {
        for node in self.remote_nodes() {
            node.close();
        }
        if let Err(e) = self.select_head_node() {
            debug!("Head election on close failed: {}", e);
        }

        self.shutdown_tx.send_replace(true);
        self.tasks.lock().clear();
        self.context.sync.unregister_handler(CLUSTER_NODES_SYNC_KEY);
        info!(node = %self.local.unique_id(), "Node server provider closed");
    }
}

fn deployment_listener(context: &ClusterContext) -> ChunkedTransferListener {
    let listener = ChunkedTransferListener::new();

    let sink = context.collaborators.deployment_sink.clone();
    listener.register_handler(
        DEPLOY_SERVICE_TEMPLATE,
        Arc::new(move |info: &ChunkSessionInformation, data: Bytes| {
            handler::deploy_template(sink.as_ref(), info, data)
        }),
    );

    let sink = context.collaborators.deployment_sink.clone();
    listener.register_handler(
        DEPLOY_STATIC_SERVICE,
        Arc::new(move |info: &ChunkSessionInformation, data: Bytes| {
            handler::deploy_static_service(sink.as_ref(), info, data)
        }),
    );
    listener
}

impl std::fmt::Debug for NodeServerProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeServerProvider")
            .field("local", &self.local)
            .field("remotes", &self.remotes.read().keys().collect::<Vec<_>>())
            .field("head", &self.head_node().map(|node| node.unique_id()))
            .finish()
    }
}
