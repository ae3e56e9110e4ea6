//! Shared fixtures for the cluster scenario tests.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Once,
    },
    time::Duration,
};

use bytes::Bytes;
use cloudnet_events::EventManager;
use cloudnet_protocol::{
    HostAndPort, NetworkChannel, NetworkClient, OutboundQueue, TransferStatus, TransportConfig,
};
use parking_lot::Mutex;
use tracing_subscriber::{
    filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

use crate::{
    collaborators::{
        Collaborators, CommandExecutor, DeploymentSink, ServiceManager, ServiceTemplate,
        ShutdownHook,
    },
    config::{ClusterConfig, SyncConflictPolicy},
    node::NodeServer,
    provider::NodeServerProvider,
    snapshot::{NodeIdentity, NodeInfoSnapshot},
    sync::DataSyncRegistry,
};

static INIT: Once = Once::new();

pub fn init_test_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer())
            .with(
                EnvFilter::builder()
                    .with_default_directive(LevelFilter::INFO.into())
                    .from_env_lossy(),
            )
            .try_init();
    });
}

/// Everything the stub collaborators observed.
#[derive(Default)]
pub struct Recorder {
    pub commands: Mutex<Vec<String>>,
    pub disconnected: Mutex<Vec<String>>,
    pub shutdowns: AtomicUsize,
    pub templates: Mutex<Vec<(ServiceTemplate, bool, Bytes)>>,
    pub static_services: Mutex<Vec<(String, bool, Bytes)>>,
}

impl Recorder {
    pub fn shutdown_count(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

struct StubCollaborator {
    node_id: String,
    recorder: Arc<Recorder>,
}

impl CommandExecutor for StubCollaborator {
    fn execute(&self, command_line: &str) -> Vec<String> {
        self.recorder.commands.lock().push(command_line.to_string());
        vec![format!("{} executed {}", self.node_id, command_line)]
    }
}

impl ServiceManager for StubCollaborator {
    fn local_service_count(&self) -> u32 {
        2
    }

    fn reserved_memory(&self) -> u64 {
        512
    }

    fn handle_node_disconnect(&self, node_id: &str) {
        self.recorder.disconnected.lock().push(node_id.to_string());
    }
}

impl ShutdownHook for StubCollaborator {
    fn shutdown(&self) {
        self.recorder.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

impl DeploymentSink for StubCollaborator {
    fn deploy_template(&self, template: &ServiceTemplate, overwrite: bool, data: Bytes) -> TransferStatus {
        let mut templates = self.recorder.templates.lock();
        if !overwrite && templates.iter().any(|(existing, _, _)| existing == template) {
            return TransferStatus::AlreadyExists;
        }
        templates.push((template.clone(), overwrite, data));
        TransferStatus::Success
    }

    fn deploy_static_service(&self, name: &str, overwrite: bool, data: Bytes) -> TransferStatus {
        self.recorder
            .static_services
            .lock()
            .push((name.to_string(), overwrite, data));
        TransferStatus::Success
    }
}

pub fn stub_collaborators(node_id: &str) -> (Collaborators, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    let stub = Arc::new(StubCollaborator {
        node_id: node_id.to_string(),
        recorder: recorder.clone(),
    });
    let collaborators = Collaborators {
        command_executor: stub.clone(),
        service_manager: stub.clone(),
        shutdown_hook: stub.clone(),
        deployment_sink: stub,
    };
    (collaborators, recorder)
}

pub fn test_config(node_id: &str, listener: Option<HostAndPort>, peers: Vec<NodeIdentity>) -> ClusterConfig {
    ClusterConfig {
        identity: NodeIdentity::new(node_id, listener.into_iter().collect()),
        nodes: peers,
        query_timeout_ms: 2_000,
        chunk_size: 16,
        ..Default::default()
    }
}

pub struct TestCluster {
    pub provider: Arc<NodeServerProvider>,
    pub client: Arc<NetworkClient>,
    pub events: Arc<EventManager>,
    pub recorder: Arc<Recorder>,
}

impl TestCluster {
    pub fn new(config: ClusterConfig, startup_millis: i64) -> Self {
        let events = Arc::new(EventManager::new());
        let client = Arc::new(NetworkClient::new(TransportConfig {
            query_timeout: config.query_timeout(),
            ..Default::default()
        }));
        let sync = Arc::new(DataSyncRegistry::new(SyncConflictPolicy::AcceptTheirs));
        let (collaborators, recorder) = stub_collaborators(&config.identity.unique_id);
        let provider = NodeServerProvider::with_startup_millis(
            config,
            events.clone(),
            client.clone(),
            sync,
            collaborators,
            startup_millis,
        );
        Self {
            provider,
            client,
            events,
            recorder,
        }
    }

    /// A provider named `Local` with remote peers that have no listeners.
    pub fn with_peers(startup_millis: i64, peers: &[&str]) -> Self {
        let peers = peers
            .iter()
            .map(|id| NodeIdentity::new(*id, Vec::new()))
            .collect();
        Self::new(test_config("Local", None, peers), startup_millis)
    }

    pub fn node(&self, id: &str) -> Arc<NodeServer> {
        self.provider.node(id).expect("node should be registered")
    }

    pub fn head_id(&self) -> Option<String> {
        self.provider.head_node().map(|node| node.unique_id())
    }

    /// Bind a socketless channel to `id` and deliver a first snapshot.
    pub fn connect_loopback(&self, id: &str, startup_millis: i64) -> (Arc<NetworkChannel>, OutboundQueue) {
        let (channel, queue) = NetworkChannel::loopback(Duration::from_secs(2));
        let node = self.node(id);
        node.as_remote()
            .expect("remote node")
            .bind(
                channel.clone(),
                NodeIdentity::new(id, Vec::new()),
                Some(NodeInfoSnapshot::new(startup_millis, startup_millis)),
            )
            .expect("bind should succeed");
        (channel, queue)
    }
}

/// Poll `condition` until it holds, panicking after two seconds.
pub async fn wait_until<F>(condition: F)
where
    F: Fn() -> bool,
{
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not met in time");
}
