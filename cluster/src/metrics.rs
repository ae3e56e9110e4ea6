//! Cluster metrics
//!
//! Recorded through the `metrics` facade; nothing is exported unless the host
//! installs a recorder.

use metrics::{counter, gauge};

pub fn record_available_nodes(count: usize) {
    gauge!("cloudnet_cluster_nodes_available").set(count as f64);
}

pub fn record_head_change(head: &str) {
    counter!("cloudnet_cluster_head_changes_total", "head" => head.to_string()).increment(1);
}

pub fn record_heartbeat_sent(peers: usize) {
    counter!("cloudnet_cluster_heartbeats_sent_total").increment(peers as u64);
}

pub fn record_node_disconnect(node: &str) {
    counter!("cloudnet_cluster_node_disconnects_total", "node" => node.to_string()).increment(1);
}
