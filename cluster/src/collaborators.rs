//! Interfaces to the node subsystems the cluster core only consumes.

use std::{fmt, sync::Arc};

use bytes::Bytes;
use cloudnet_protocol::TransferStatus;

/// Runs console commands for `send_command_line`.
pub trait CommandExecutor: Send + Sync {
    fn execute(&self, command_line: &str) -> Vec<String>;
}

/// Local service facts used in snapshots and on node loss.
pub trait ServiceManager: Send + Sync {
    fn local_service_count(&self) -> u32;

    /// Memory reserved by local services, in megabytes.
    fn reserved_memory(&self) -> u64;

    /// Forget every service that was hosted on the lost node.
    fn handle_node_disconnect(&self, node_id: &str);
}

/// Terminates the local node process.
pub trait ShutdownHook: Send + Sync {
    fn shutdown(&self);
}

/// Identifies a template inside a template storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceTemplate {
    pub storage: String,
    pub prefix: String,
    pub name: String,
}

impl ServiceTemplate {
    pub fn new(
        storage: impl Into<String>,
        prefix: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            storage: storage.into(),
            prefix: prefix.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ServiceTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.storage, self.prefix, self.name)
    }
}

/// Receives archives deployed to this node by a peer. Called on the blocking
/// thread pool.
pub trait DeploymentSink: Send + Sync {
    fn deploy_template(&self, template: &ServiceTemplate, overwrite: bool, data: Bytes)
        -> TransferStatus;

    fn deploy_static_service(&self, name: &str, overwrite: bool, data: Bytes) -> TransferStatus;
}

#[derive(Clone)]
pub struct Collaborators {
    pub command_executor: Arc<dyn CommandExecutor>,
    pub service_manager: Arc<dyn ServiceManager>,
    pub shutdown_hook: Arc<dyn ShutdownHook>,
    pub deployment_sink: Arc<dyn DeploymentSink>,
}
