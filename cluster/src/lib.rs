//! CloudNet Cluster Coordination
//!
//! This crate keeps a set of cooperating nodes in agreement about who is part
//! of the cluster:
//! - Local and remote node servers with identity, state and snapshots
//! - Heuristic head election on the earliest startup time
//! - Snapshot heartbeats and disconnect tracking
//! - Keyed data synchronization with configurable conflict handling
//! - Chunked template and static service deployment to all peers

pub mod collaborators;
pub mod config;
mod context;
pub mod disconnect;
pub mod error;
pub mod events;
pub mod handler;
pub mod local;
pub mod metrics;
pub mod node;
pub mod process;
pub mod provider;
pub mod remote;
pub mod snapshot;
pub mod sync;
mod tasks;

#[cfg(test)]
mod tests;

pub use collaborators::{
    Collaborators, CommandExecutor, DeploymentSink, ServiceManager, ServiceTemplate, ShutdownHook,
};
pub use config::{ClusterConfig, SyncConflictPolicy};
pub use disconnect::NodeDisconnectHandler;
pub use error::{ClusterError, ClusterResult};
pub use events::{
    HeadNodeChangeEvent, LocalNodeSnapshotConfigureEvent, NodeServerDisconnectEvent,
    NodeServerReadyEvent, NodeSnapshotUpdateEvent,
};
pub use local::LocalNodeServer;
pub use node::{NodeServer, NodeServerState};
pub use process::{ProcessCollector, ProcessSnapshot};
pub use provider::{NodeServerProvider, CLUSTER_NODES_SYNC_KEY};
pub use remote::RemoteNodeServer;
pub use snapshot::{ModuleDescriptor, NodeHandshake, NodeIdentity, NodeInfoSnapshot};
pub use sync::{DataSyncHandler, DataSyncRegistry};
