use std::sync::Arc;

use cloudnet_events::EventManager;
use cloudnet_protocol::NetworkClient;

use crate::{
    collaborators::Collaborators, config::ClusterConfig, disconnect::NodeDisconnectHandler,
    process::ProcessCollector, sync::DataSyncRegistry,
};

/// Everything the provider and its nodes share.
pub(crate) struct ClusterContext {
    pub config: ClusterConfig,
    pub events: Arc<EventManager>,
    pub client: Arc<NetworkClient>,
    pub sync: Arc<DataSyncRegistry>,
    pub collaborators: Collaborators,
    pub process: ProcessCollector,
    pub disconnect: NodeDisconnectHandler,
    /// Reported in every local snapshot.
    pub version: String,
}
