//! Packet handlers installed on every node connection
//!
//! Unauthenticated channels may only talk on the authorization channel. Every
//! other packet is dropped until the handshake bound the channel to a node.

use std::sync::{Arc, Weak};

use anyhow::{anyhow, Context};
use bytes::{Bytes, BytesMut};
use cloudnet_protocol::{
    ChannelMessage, ChunkSessionInformation, DataBufReader, DataBufWriter, NetworkChannel,
    NetworkChannelHandler, Packet, PacketListener, ProtocolResult, TransferStatus,
    INTERNAL_AUTHORIZATION_CHANNEL,
};
use tracing::{debug, info, warn};

use crate::{
    collaborators::{DeploymentSink, ServiceTemplate},
    provider::NodeServerProvider,
    snapshot::{NodeHandshake, NodeInfoSnapshot, WireValue},
};

pub const CLUSTER_NODE_SHUTDOWN: &str = "cluster_node_shutdown";
pub const CHANGE_DRAINING_STATE: &str = "change_draining_state";
pub const SYNC_CLUSTER_DATA: &str = "sync_cluster_data";
pub const SEND_COMMAND_LINE: &str = "send_command_line";
pub const REQUEST_INITIAL_CLUSTER_DATA: &str = "request_initial_cluster_data";

pub const DEPLOY_SERVICE_TEMPLATE: &str = "deploy_service_template";
pub const DEPLOY_STATIC_SERVICE: &str = "deploy_static_service";

fn upgrade(provider: &Weak<NodeServerProvider>) -> anyhow::Result<Arc<NodeServerProvider>> {
    provider
        .upgrade()
        .ok_or_else(|| anyhow!("node server provider is closed"))
}

/// Connection lifecycle hooks for client and server transports.
pub(crate) struct NodeChannelHandler {
    provider: Weak<NodeServerProvider>,
}

impl NodeChannelHandler {
    pub(crate) fn new(provider: Weak<NodeServerProvider>) -> Self {
        Self { provider }
    }
}

impl NetworkChannelHandler for NodeChannelHandler {
    fn handle_packet_receive(&self, channel: &Arc<NetworkChannel>, packet: &Packet) -> bool {
        if packet.channel() == INTERNAL_AUTHORIZATION_CHANNEL {
            return true;
        }
        let Some(provider) = self.provider.upgrade() else {
            return false;
        };
        if provider.node_by_channel(channel).is_some() {
            return true;
        }
        debug!(
            channel = channel.id(),
            packet_channel = packet.channel(),
            "Dropping packet from unauthorized channel"
        );
        false
    }

    fn handle_channel_close(&self, channel: &Arc<NetworkChannel>) {
        let Some(provider) = self.provider.upgrade() else {
            return;
        };
        provider.transfer_listener().discard_channel_sessions(channel.id());
        if let Some(node) = provider.node_by_channel(channel) {
            info!(node = %node.unique_id(), "Connection to node lost");
            node.close();
        }
    }
}

/// Accepts handshakes from connecting peers.
pub(crate) struct AuthorizationListener {
    provider: Weak<NodeServerProvider>,
}

impl AuthorizationListener {
    pub(crate) fn new(provider: Weak<NodeServerProvider>) -> Self {
        Self { provider }
    }
}

impl PacketListener for AuthorizationListener {
    fn handle(&self, channel: &Arc<NetworkChannel>, packet: &Packet) -> anyhow::Result<()> {
        if channel.is_client_side() || !packet.is_query() {
            return Ok(());
        }
        let provider = upgrade(&self.provider)?;
        let request = NodeHandshake::from_bytes(packet.content()?)?;
        let node_id = request.identity.unique_id.clone();
        let cluster_id = provider.config().cluster_id.clone();

        let bound = if request.cluster_id != cluster_id {
            Err(format!("node belongs to cluster {}", request.cluster_id))
        } else {
            match provider.node(&node_id) {
                Some(node) => match node.as_remote() {
                    Some(remote) => remote
                        .bind(channel.clone(), request.identity, request.snapshot)
                        .map_err(|e| e.to_string()),
                    None => Err("peer claims the local node id".to_string()),
                },
                None => Err("unknown node".to_string()),
            }
        };

        let local = provider.local_node();
        match bound {
            Ok(_) => {
                info!(node = %node_id, remote = %channel.remote_addr(), "Node authenticated");
                let reply = NodeHandshake::accepted(
                    cluster_id,
                    local.identity().as_ref().clone(),
                    local.node_info_snapshot().map(|snapshot| snapshot.as_ref().clone()),
                );
                channel.send_packet(packet.response(reply.to_bytes())?)?;
            }
            Err(reason) => {
                warn!(node = %node_id, remote = %channel.remote_addr(), %reason, "Rejected node");
                let reply = NodeHandshake::rejected(cluster_id, local.identity().as_ref().clone());
                let response = packet.response(reply.to_bytes())?;
                let channel = channel.clone();
                tokio::spawn(async move {
                    if let Err(e) = channel.send_packet_sync(response).await {
                        debug!(channel = channel.id(), "Failed to send handshake rejection: {}", e);
                    }
                    channel.close();
                });
            }
        }
        Ok(())
    }
}

/// Handles the named control messages.
pub(crate) struct ControlMessageListener {
    provider: Weak<NodeServerProvider>,
}

impl ControlMessageListener {
    pub(crate) fn new(provider: Weak<NodeServerProvider>) -> Self {
        Self { provider }
    }
}

impl PacketListener for ControlMessageListener {
    fn handle(&self, channel: &Arc<NetworkChannel>, packet: &Packet) -> anyhow::Result<()> {
        let provider = upgrade(&self.provider)?;
        let ChannelMessage {
            message,
            mut content,
        } = ChannelMessage::from_packet(packet)?;

        match message.as_str() {
            CLUSTER_NODE_SHUTDOWN => {
                let response = packet
                    .is_query()
                    .then(|| packet.response(Bytes::new()))
                    .transpose()?;
                let channel = channel.clone();
                tokio::spawn(async move {
                    if let Some(response) = response {
                        if let Err(e) = channel.send_packet_sync(response).await {
                            debug!("Failed to acknowledge shutdown request: {}", e);
                        }
                    }
                    if let Err(e) = provider.local_node().shutdown().await {
                        warn!("Local shutdown failed: {}", e);
                    }
                });
            }
            CHANGE_DRAINING_STATE => {
                let drain = content.read_bool()?;
                provider.local_node().drain(drain)?;
            }
            SYNC_CLUSTER_DATA => {
                if let Some(local) = provider.sync_registry().handle(content)? {
                    if packet.is_query() {
                        channel.send_packet(packet.response(local)?)?;
                    } else {
                        channel.send_packet(ChannelMessage::new(SYNC_CLUSTER_DATA, local).to_packet())?;
                    }
                }
            }
            SEND_COMMAND_LINE => {
                let command_line = content.read_string()?;
                let response = packet.is_query().then(|| packet.clone());
                let channel = channel.clone();
                tokio::spawn(async move {
                    let lines = provider
                        .local_node()
                        .send_command_line(&command_line)
                        .await
                        .unwrap_or_default();
                    if let Some(query) = response {
                        let mut content = BytesMut::new();
                        content.write_string_list(lines.as_slice());
                        match query.response(content.freeze()) {
                            Ok(response) => {
                                if let Err(e) = channel.send_packet(response) {
                                    debug!("Failed to answer command line query: {}", e);
                                }
                            }
                            Err(e) => warn!("Failed to build command line response: {}", e),
                        }
                    }
                });
            }
            REQUEST_INITIAL_CLUSTER_DATA => {
                if packet.is_query() {
                    let blob = provider.sync_registry().prepare_cluster_data(true, &[]);
                    channel.send_packet(packet.response(blob)?)?;
                }
            }
            other => debug!(message = %other, "Ignoring unknown control message"),
        }
        Ok(())
    }
}

/// Routes snapshot heartbeats to the node bound to the channel.
pub(crate) struct NodeInfoListener {
    provider: Weak<NodeServerProvider>,
}

impl NodeInfoListener {
    pub(crate) fn new(provider: Weak<NodeServerProvider>) -> Self {
        Self { provider }
    }
}

impl PacketListener for NodeInfoListener {
    fn handle(&self, channel: &Arc<NetworkChannel>, packet: &Packet) -> anyhow::Result<()> {
        let provider = upgrade(&self.provider)?;
        let Some(node) = provider.node_by_channel(channel) else {
            debug!(channel = channel.id(), "Dropping snapshot from unbound channel");
            return Ok(());
        };
        let snapshot = NodeInfoSnapshot::from_bytes(packet.content()?)
            .with_context(|| format!("invalid snapshot from {}", node.unique_id()))?;
        node.update_node_info_snapshot(Some(snapshot));
        Ok(())
    }
}

/// Extra data of a `deploy_service_template` transfer.
pub(crate) fn encode_template_deployment(template: &ServiceTemplate, overwrite: bool) -> Bytes {
    let mut buf = BytesMut::new();
    buf.write_string(&template.storage);
    buf.write_string(&template.prefix);
    buf.write_string(&template.name);
    buf.write_bool(overwrite);
    buf.freeze()
}

/// Extra data of a `deploy_static_service` transfer.
pub(crate) fn encode_static_service_deployment(name: &str, overwrite: bool) -> Bytes {
    let mut buf = BytesMut::new();
    buf.write_string(name);
    buf.write_bool(overwrite);
    buf.freeze()
}

fn read_template_header(extra: &mut Bytes) -> ProtocolResult<(ServiceTemplate, bool)> {
    let template = ServiceTemplate::new(extra.read_string()?, extra.read_string()?, extra.read_string()?);
    Ok((template, extra.read_bool()?))
}

fn read_static_service_header(extra: &mut Bytes) -> ProtocolResult<(String, bool)> {
    Ok((extra.read_string()?, extra.read_bool()?))
}

pub(crate) fn deploy_template(
    sink: &dyn DeploymentSink,
    info: &ChunkSessionInformation,
    data: Bytes,
) -> TransferStatus {
    let mut extra = info.extra_data.clone();
    let header = read_template_header(&mut extra);

    match header {
        Ok((template, overwrite)) => {
            info!(%template, overwrite, bytes = data.len(), "Received template deployment");
            sink.deploy_template(&template, overwrite, data)
        }
        Err(e) => {
            warn!(session = %info.session_id, "Malformed template deployment header: {}", e);
            TransferStatus::Failure
        }
    }
}

pub(crate) fn deploy_static_service(
    sink: &dyn DeploymentSink,
    info: &ChunkSessionInformation,
    data: Bytes,
) -> TransferStatus {
    let mut extra = info.extra_data.clone();
    let header = read_static_service_header(&mut extra);

    match header {
        Ok((name, overwrite)) => {
            info!(service = %name, overwrite, bytes = data.len(), "Received static service deployment");
            sink.deploy_static_service(&name, overwrite, data)
        }
        Err(e) => {
            warn!(session = %info.session_id, "Malformed static service deployment header: {}", e);
            TransferStatus::Failure
        }
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use uuid::Uuid;

    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        templates: Mutex<Vec<(ServiceTemplate, bool, Bytes)>>,
        services: Mutex<Vec<(String, bool, Bytes)>>,
    }

    impl DeploymentSink for RecordingSink {
        fn deploy_template(
            &self,
            template: &ServiceTemplate,
            overwrite: bool,
            data: Bytes,
        ) -> TransferStatus {
            self.templates.lock().push((template.clone(), overwrite, data));
            TransferStatus::Success
        }

        fn deploy_static_service(&self, name: &str, overwrite: bool, data: Bytes) -> TransferStatus {
            self.services.lock().push((name.to_string(), overwrite, data));
            TransferStatus::AlreadyExists
        }
    }

    fn session(extra_data: Bytes) -> ChunkSessionInformation {
        ChunkSessionInformation {
            session_id: Uuid::new_v4(),
            transfer_channel: DEPLOY_SERVICE_TEMPLATE.to_string(),
            extra_data,
        }
    }

    #[test]
    fn test_template_deployment_header() {
        let sink = RecordingSink::default();
        let template = ServiceTemplate::new("local", "Lobby", "default");
        let info = session(encode_template_deployment(&template, true));

        let status = deploy_template(&sink, &info, Bytes::from_static(b"zip"));
        assert_eq!(status, TransferStatus::Success);

        let templates = sink.templates.lock();
        assert_eq!(templates.len(), 1);
        assert_eq!(templates[0].0, template);
        assert!(templates[0].1);
        assert_eq!(templates[0].2.as_ref(), b"zip");
    }

    #[test]
    fn test_static_service_deployment_header() {
        let sink = RecordingSink::default();
        let info = session(encode_static_service_deployment("Lobby-1", false));

        let status = deploy_static_service(&sink, &info, Bytes::from_static(b"data"));
        assert_eq!(status, TransferStatus::AlreadyExists);
        assert_eq!(sink.services.lock()[0].0, "Lobby-1");
        assert!(!sink.services.lock()[0].1);
    }

    #[test]
    fn test_truncated_header_fails() {
        let sink = RecordingSink::default();
        let info = session(Bytes::from_static(&[0, 0, 0, 5, b'l']));

        assert_eq!(
            deploy_template(&sink, &info, Bytes::new()),
            TransferStatus::Failure
        );
        assert!(sink.templates.lock().is_empty());
    }
}
