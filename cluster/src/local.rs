use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Weak,
};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::{
    context::ClusterContext,
    error::{ClusterError, ClusterResult},
    events::LocalNodeSnapshotConfigureEvent,
    node::{NodeCore, NodeServerState},
    provider::NodeServerProvider,
    snapshot::NodeInfoSnapshot,
};

/// The node this process runs.
pub struct LocalNodeServer {
    core: NodeCore,
    draining: AtomicBool,
    startup_millis: i64,
    context: Arc<ClusterContext>,
    provider: Weak<NodeServerProvider>,
}

impl LocalNodeServer {
    pub(crate) fn new(
        context: Arc<ClusterContext>,
        provider: Weak<NodeServerProvider>,
        startup_millis: i64,
    ) -> Self {
        Self {
            core: NodeCore::new(context.config.identity.clone()),
            draining: AtomicBool::new(false),
            startup_millis,
            context,
            provider,
        }
    }

    pub(crate) fn core(&self) -> &NodeCore {
        &self.core
    }

    pub fn startup_millis(&self) -> i64 {
        self.startup_millis
    }

    pub fn available(&self) -> bool {
        self.core.state() == NodeServerState::Ready && self.core.current_snapshot().is_some()
    }

    pub fn draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    pub fn head(&self) -> bool {
        self.provider.upgrade().is_some_and(|provider| {
            provider
                .head_node()
                .is_some_and(|head| head.is_local())
        })
    }

    /// Explicitly move the local node to `state`.
    ///
    /// Only [`NodeServerState::Ready`] is accepted: the local node never
    /// becomes unavailable on its own. A node without a snapshot gets one
    /// first, then head election runs.
    pub fn set_state(&self, state: NodeServerState) -> ClusterResult<()> {
        if state != NodeServerState::Ready {
            return Err(ClusterError::IllegalStateTransition(state.to_string()));
        }
        if self.core.current_snapshot().is_none() {
            self.update_local_snapshot();
        }
        if self.core.set_state(NodeServerState::Ready) != NodeServerState::Ready {
            info!(node = %self.core.identity().unique_id, "Local node is ready");
        }

        if let Some(provider) = self.provider.upgrade() {
            provider.select_head_node()?;
        }
        Ok(())
    }

    pub fn update_node_info_snapshot(&self, snapshot: Option<NodeInfoSnapshot>) {
        self.core.update_snapshot(snapshot.map(Arc::new));
    }

    /// Build a fresh snapshot, let listeners adjust it and install it.
    pub fn update_local_snapshot(&self) -> Arc<NodeInfoSnapshot> {
        let config = &self.context.config;
        let services = &self.context.collaborators.service_manager;
        let process = self.context.process.collect();

        let mut snapshot = NodeInfoSnapshot::new(Utc::now().timestamp_millis(), self.startup_millis);
        snapshot.max_memory = config.max_memory_mb;
        snapshot.used_memory = process.memory_bytes / (1024 * 1024);
        snapshot.reserved_memory = services.reserved_memory();
        snapshot.current_services_count = services.local_service_count();
        snapshot.draining = self.draining();
        snapshot.version = self.context.version.clone();
        snapshot.process = process;
        snapshot.max_cpu_usage_to_start_services = config.max_cpu_usage_to_start_services;
        if let Some(previous) = self.core.current_snapshot() {
            snapshot.modules = previous.modules.clone();
        }

        let mut event = LocalNodeSnapshotConfigureEvent { snapshot };
        if let Err(e) = self.context.events.call_event(&mut event) {
            warn!("Snapshot configure listeners failed: {}", e);
        }

        let snapshot = Arc::new(event.snapshot);
        self.core.update_snapshot(Some(snapshot.clone()));
        snapshot
    }

    pub fn drain(&self, drain: bool) {
        if self.draining.swap(drain, Ordering::AcqRel) != drain {
            info!(draining = drain, "Changed local draining state");
        }
    }

    pub fn shutdown(&self) -> ClusterResult<()> {
        info!("Shutting down the local node");
        self.context.collaborators.shutdown_hook.shutdown();
        Ok(())
    }

    pub fn send_command_line(&self, command_line: &str) -> ClusterResult<Vec<String>> {
        debug!(command = %command_line, "Executing command line");
        Ok(self.context.collaborators.command_executor.execute(command_line))
    }
}
