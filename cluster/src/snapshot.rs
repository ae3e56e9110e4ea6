//! Node identity and info snapshots
//!
//! Both travel between nodes as bincode. A snapshot is produced only by the
//! node it describes and is never mutated after creation.

use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;
use cloudnet_protocol::HostAndPort;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{error::ClusterResult, process::ProcessSnapshot};

/// Transparent value <-> bytes conversion for everything sent as bincode.
pub(crate) trait WireValue: Serialize + DeserializeOwned {
    fn to_bytes(&self) -> Bytes {
        Bytes::from(bincode::serialize(self).expect("Serialization should never fail for valid types"))
    }

    fn from_bytes(bytes: &[u8]) -> ClusterResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

impl<T> WireValue for T where T: Serialize + DeserializeOwned {}

/// Static description of a node: its id and where it listens.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub unique_id: String,
    #[serde(default)]
    pub listeners: Vec<HostAndPort>,
}

impl NodeIdentity {
    pub fn new(unique_id: impl Into<String>, listeners: Vec<HostAndPort>) -> Self {
        Self {
            unique_id: unique_id.into(),
            listeners,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    pub group: String,
    pub name: String,
    pub version: String,
}

/// Point-in-time fact sheet about one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfoSnapshot {
    pub creation_millis: i64,
    pub startup_millis: i64,
    /// Memory limits and usage in megabytes.
    pub max_memory: u64,
    pub used_memory: u64,
    pub reserved_memory: u64,
    pub current_services_count: u32,
    pub draining: bool,
    pub version: String,
    pub process: ProcessSnapshot,
    pub max_cpu_usage_to_start_services: f64,
    pub modules: BTreeSet<ModuleDescriptor>,
    pub properties: BTreeMap<String, String>,
}

impl NodeInfoSnapshot {
    /// A snapshot carrying only the timing information, everything else at
    /// its zero value.
    pub fn new(creation_millis: i64, startup_millis: i64) -> Self {
        Self {
            creation_millis,
            startup_millis,
            max_memory: 0,
            used_memory: 0,
            reserved_memory: 0,
            current_services_count: 0,
            draining: false,
            version: String::new(),
            process: ProcessSnapshot::default(),
            max_cpu_usage_to_start_services: 100.0,
            modules: BTreeSet::new(),
            properties: BTreeMap::new(),
        }
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Whether the node reports itself as able to start another service.
    pub fn accepts_services(&self) -> bool {
        !self.draining
            && f64::from(self.process.system_cpu_usage) <= self.max_cpu_usage_to_start_services
            && self.used_memory + self.reserved_memory < self.max_memory
    }
}

/// Exchanged on the authorization channel when a connection is established.
/// Both sides must belong to the same cluster id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeHandshake {
    pub accepted: bool,
    pub cluster_id: String,
    pub identity: NodeIdentity,
    pub snapshot: Option<NodeInfoSnapshot>,
}

impl NodeHandshake {
    pub fn accepted(
        cluster_id: impl Into<String>,
        identity: NodeIdentity,
        snapshot: Option<NodeInfoSnapshot>,
    ) -> Self {
        Self {
            accepted: true,
            cluster_id: cluster_id.into(),
            identity,
            snapshot,
        }
    }

    pub fn rejected(cluster_id: impl Into<String>, identity: NodeIdentity) -> Self {
        Self {
            accepted: false,
            cluster_id: cluster_id.into(),
            identity,
            snapshot: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_wire_value() {
        let mut snapshot = NodeInfoSnapshot::new(2_000, 1_000);
        snapshot.max_memory = 4096;
        snapshot.modules.insert(ModuleDescriptor {
            group: "eu.cloudnetservice".to_string(),
            name: "signs".to_string(),
            version: "4.0.0".to_string(),
        });
        snapshot
            .properties
            .insert("region".to_string(), "eu-west".to_string());

        let decoded = NodeInfoSnapshot::from_bytes(&snapshot.to_bytes()).unwrap();
        assert_eq!(decoded, snapshot);
        assert_eq!(decoded.property("region"), Some("eu-west"));
    }

    #[test]
    fn test_garbage_is_a_codec_error() {
        assert!(NodeInfoSnapshot::from_bytes(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_accepts_services() {
        let mut snapshot = NodeInfoSnapshot::new(0, 0);
        snapshot.max_memory = 1024;
        snapshot.used_memory = 512;
        assert!(snapshot.accepts_services());

        snapshot.reserved_memory = 512;
        assert!(!snapshot.accepts_services());

        snapshot.reserved_memory = 0;
        snapshot.draining = true;
        assert!(!snapshot.accepts_services());
    }
}
