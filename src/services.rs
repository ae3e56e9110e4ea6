use cloudnet_cluster::ServiceManager;
use tracing::info;

/// Service manager of a node that runs no services of its own.
#[derive(Debug, Default)]
pub struct StandaloneServiceManager;

impl ServiceManager for StandaloneServiceManager {
    fn local_service_count(&self) -> u32 {
        0
    }

    fn reserved_memory(&self) -> u64 {
        0
    }

    fn handle_node_disconnect(&self, node_id: &str) {
        info!(node = %node_id, "Node left the cluster, no services to clean up");
    }
}
