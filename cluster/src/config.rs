//! Cluster configuration.

use std::time::Duration;

use cloudnet_protocol::HostAndPort;
use serde::{Deserialize, Serialize};

use crate::{
    error::{ClusterError, ClusterResult},
    snapshot::NodeIdentity,
};

/// How an incoming sync entry is applied when the local value differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncConflictPolicy {
    /// Overwrite the local value with the incoming one.
    #[default]
    AcceptTheirs,
    /// Keep the local value and send it back to the sender.
    KeepLocal,
    /// Leave the local value alone.
    Skip,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Shared by every node of one cluster; handshakes from other clusters
    /// are rejected
    #[serde(default = "default_cluster_id")]
    pub cluster_id: String,

    /// This node
    #[serde(default = "default_identity")]
    pub identity: NodeIdentity,

    /// Statically known peers
    #[serde(default)]
    pub nodes: Vec<NodeIdentity>,

    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    #[serde(default = "default_disconnect_check_interval_ms")]
    pub disconnect_check_interval_ms: u64,

    /// A peer without snapshot updates for this long is disconnected
    #[serde(default = "default_node_timeout_ms")]
    pub node_timeout_ms: u64,

    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,

    #[serde(default = "default_max_memory_mb")]
    pub max_memory_mb: u64,

    #[serde(default = "default_max_cpu_usage")]
    pub max_cpu_usage_to_start_services: f64,

    #[serde(default)]
    pub sync_conflict_policy: SyncConflictPolicy,

    /// Payload bytes per chunk of a cluster deployment
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

fn default_cluster_id() -> String {
    "cloudnet".to_string()
}

fn default_identity() -> NodeIdentity {
    NodeIdentity::new("Node-1", vec![HostAndPort::new("0.0.0.0", 1410)])
}

fn default_heartbeat_interval_ms() -> u64 {
    1_000
}

fn default_disconnect_check_interval_ms() -> u64 {
    5_000
}

fn default_node_timeout_ms() -> u64 {
    30_000
}

fn default_query_timeout_ms() -> u64 {
    30_000
}

fn default_max_memory_mb() -> u64 {
    2_048
}

fn default_max_cpu_usage() -> f64 {
    90.0
}

fn default_chunk_size() -> usize {
    50 * 1024
}

impl ClusterConfig {
    /// Reject settings the node cannot run with.
    pub fn validate(&self) -> ClusterResult<()> {
        let invalid = |reason: &str| Err(ClusterError::InvalidConfig(reason.to_string()));
        if self.cluster_id.trim().is_empty() {
            return invalid("cluster_id must not be empty");
        }
        if self.identity.unique_id.trim().is_empty() {
            return invalid("identity.unique_id must not be empty");
        }
        for (name, value) in [
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("disconnect_check_interval_ms", self.disconnect_check_interval_ms),
            ("node_timeout_ms", self.node_timeout_ms),
            ("query_timeout_ms", self.query_timeout_ms),
        ] {
            if value == 0 {
                return Err(ClusterError::InvalidConfig(format!("{} must be positive", name)));
            }
        }
        if self.chunk_size == 0 {
            return invalid("chunk_size must be positive");
        }
        let max_cpu = self.max_cpu_usage_to_start_services;
        if max_cpu.is_nan() || max_cpu < 0.0 {
            return invalid("max_cpu_usage_to_start_services must not be negative");
        }
        if let Some(node) = self
            .nodes
            .iter()
            .find(|node| node.unique_id == self.identity.unique_id)
        {
            return Err(ClusterError::InvalidConfig(format!(
                "peer {} uses the id of this node",
                node.unique_id
            )));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn disconnect_check_interval(&self) -> Duration {
        Duration::from_millis(self.disconnect_check_interval_ms)
    }

    pub fn node_timeout(&self) -> Duration {
        Duration::from_millis(self.node_timeout_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            cluster_id: default_cluster_id(),
            identity: default_identity(),
            nodes: Vec::new(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            disconnect_check_interval_ms: default_disconnect_check_interval_ms(),
            node_timeout_ms: default_node_timeout_ms(),
            query_timeout_ms: default_query_timeout_ms(),
            max_memory_mb: default_max_memory_mb(),
            max_cpu_usage_to_start_services: default_max_cpu_usage(),
            sync_conflict_policy: SyncConflictPolicy::default(),
            chunk_size: default_chunk_size(),
        }
    }
}
