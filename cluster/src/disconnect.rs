use std::sync::Arc;

use cloudnet_events::EventManager;
use tracing::{info, warn};

use crate::{collaborators::ServiceManager, events::NodeServerDisconnectEvent, metrics};

/// Cleans up after a remote node is lost.
pub struct NodeDisconnectHandler {
    events: Arc<EventManager>,
    service_manager: Arc<dyn ServiceManager>,
}

impl NodeDisconnectHandler {
    pub fn new(events: Arc<EventManager>, service_manager: Arc<dyn ServiceManager>) -> Self {
        Self {
            events,
            service_manager,
        }
    }

    pub fn handle_node_disconnect(&self, node_id: &str) {
        info!(node = %node_id, "Node disconnected from the cluster");
        metrics::record_node_disconnect(node_id);

        let mut event = NodeServerDisconnectEvent {
            node_id: node_id.to_string(),
        };
        if let Err(e) = self.events.call_event(&mut event) {
            warn!(node = %node_id, "Disconnect listeners failed: {}", e);
        }
        self.service_manager.handle_node_disconnect(node_id);
    }
}
