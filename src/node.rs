//! Node bootstrap and run loop.

use std::sync::Arc;

use anyhow::Context;
use cloudnet_cluster::{Collaborators, DataSyncRegistry, NodeServerProvider, ShutdownHook};
use cloudnet_events::EventManager;
use cloudnet_protocol::{NetworkClient, NetworkServer, TransportConfig};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::{
    commands::NodeCommandExecutor, config::NodeConfig, services::StandaloneServiceManager,
    templates::DirectoryDeploymentSink,
};

/// Signals the run loop to stop, used for remote shutdown requests.
#[derive(Debug)]
pub struct ShutdownSignal {
    tx: watch::Sender<bool>,
}

impl ShutdownSignal {
    pub fn channel() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, rx)
    }
}

impl ShutdownHook for ShutdownSignal {
    fn shutdown(&self) {
        self.tx.send_replace(true);
    }
}

/// A running node: transports plus the cluster provider.
pub struct Node {
    provider: Arc<NodeServerProvider>,
    server: NetworkServer,
    client: Arc<NetworkClient>,
    shutdown: watch::Receiver<bool>,
}

impl Node {
    /// Build every component, bind the listeners, mark the local node ready
    /// and connect to the configured peers.
    pub async fn start(config: NodeConfig) -> anyhow::Result<Self> {
        config.validate().context("invalid node configuration")?;
        let cluster = config.cluster;
        let transport = TransportConfig {
            query_timeout: cluster.query_timeout(),
            ..Default::default()
        };

        let events = Arc::new(EventManager::new());
        let client = Arc::new(NetworkClient::new(transport.clone()));
        let server = NetworkServer::new(transport);
        let sync = Arc::new(DataSyncRegistry::new(cluster.sync_conflict_policy));

        let commands = Arc::new(NodeCommandExecutor::new());
        let (shutdown_hook, shutdown) = ShutdownSignal::channel();
        let collaborators = Collaborators {
            command_executor: commands.clone(),
            service_manager: Arc::new(StandaloneServiceManager),
            shutdown_hook: Arc::new(shutdown_hook),
            deployment_sink: Arc::new(DirectoryDeploymentSink::new(
                config.storage.template_directory,
                config.storage.static_service_directory,
            )),
        };

        let listeners = cluster.identity.listeners.clone();
        let provider = NodeServerProvider::new(cluster, events, client.clone(), sync, collaborators);
        commands.attach(Arc::downgrade(&provider));
        provider.attach_server(&server);

        for listener in &listeners {
            let addr = server
                .bind(listener)
                .await
                .with_context(|| format!("failed to bind listener {}", listener))?;
            info!(%addr, "Listening for cluster connections");
        }

        provider.start().context("failed to mark the local node ready")?;
        let known = provider.remote_nodes().len();
        let connected = provider.connect_nodes().await;
        info!(
            node = %provider.local_node().unique_id(),
            connected,
            known,
            head = ?provider.head_node().map(|head| head.unique_id()),
            "Node started"
        );

        Ok(Self {
            provider,
            server,
            client,
            shutdown,
        })
    }

    pub fn provider(&self) -> &Arc<NodeServerProvider> {
        &self.provider
    }

    /// Resolves when a peer asked this node to shut down.
    pub async fn shutdown_requested(&mut self) {
        if self.shutdown.wait_for(|requested| *requested).await.is_err() {
            warn!("Shutdown signal dropped");
        }
    }

    /// Run until Ctrl-C or a shutdown request, then close everything.
    pub async fn run(mut self) -> anyhow::Result<()> {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("failed to listen for Ctrl-C")?;
                info!("Received Ctrl-C, shutting down");
            }
            _ = self.shutdown_requested() => {
                info!("Shutdown requested by the cluster");
            }
        }
        self.close();
        Ok(())
    }

    pub fn close(&self) {
        self.provider.close();
        self.server.close();
        self.client.close();
        info!("Node stopped");
    }
}
