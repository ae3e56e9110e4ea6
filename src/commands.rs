//! Console commands answered for `send_command_line`.

use std::sync::{Arc, OnceLock, Weak};

use cloudnet_cluster::{CommandExecutor, NodeServer, NodeServerProvider};
use tracing::debug;

const HELP: &[&str] = &[
    "nodes    list every known node with its state",
    "head     show the current head node",
    "version  show the node version",
    "help     show this help",
];

/// Executes the built-in node commands against the cluster view of this
/// node. Commands before [`attach`](Self::attach) only see an empty cluster.
#[derive(Default)]
pub struct NodeCommandExecutor {
    provider: OnceLock<Weak<NodeServerProvider>>,
}

impl NodeCommandExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// The provider is built with this executor, so it is attached afterwards.
    pub fn attach(&self, provider: Weak<NodeServerProvider>) {
        if self.provider.set(provider).is_err() {
            debug!("Command executor is already attached");
        }
    }

    fn provider(&self) -> Option<Arc<NodeServerProvider>> {
        self.provider.get().and_then(Weak::upgrade)
    }

    fn describe(node: &NodeServer) -> String {
        let snapshot = node.node_info_snapshot();
        let services = snapshot
            .as_ref()
            .map_or(0, |snapshot| snapshot.current_services_count);
        let memory = snapshot.as_ref().map_or_else(
            || "-".to_string(),
            |snapshot| format!("{}/{} MB", snapshot.used_memory + snapshot.reserved_memory, snapshot.max_memory),
        );

        let mut flags = Vec::new();
        if node.is_local() {
            flags.push("local");
        }
        if node.head() {
            flags.push("head");
        }
        if node.draining() {
            flags.push("draining");
        }

        format!(
            "{} [{}] services={} memory={}{}",
            node.unique_id(),
            node.state(),
            services,
            memory,
            if flags.is_empty() {
                String::new()
            } else {
                format!(" ({})", flags.join(", "))
            }
        )
    }
}

impl CommandExecutor for NodeCommandExecutor {
    fn execute(&self, command_line: &str) -> Vec<String> {
        let mut args = command_line.split_whitespace();
        let Some(command) = args.next() else {
            return Vec::new();
        };

        match command.to_ascii_lowercase().as_str() {
            "nodes" => self
                .provider()
                .map(|provider| provider.nodes().iter().map(|node| Self::describe(node)).collect())
                .unwrap_or_default(),
            "head" => match self.provider().and_then(|provider| provider.head_node()) {
                Some(head) => vec![format!("Head node: {}", head.unique_id())],
                None => vec!["No head node elected".to_string()],
            },
            "version" => vec![format!("cloudnet-node {}", env!("CARGO_PKG_VERSION"))],
            "help" => HELP.iter().map(|line| line.to_string()).collect(),
            other => vec![format!("Unknown command '{}', try 'help'", other)],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commands_without_provider() {
        let executor = NodeCommandExecutor::new();
        assert!(executor.execute("nodes").is_empty());
        assert_eq!(executor.execute("head"), vec!["No head node elected"]);
        assert_eq!(executor.execute("help").len(), HELP.len());
        assert!(executor.execute("   ").is_empty());
        assert_eq!(
            executor.execute("Version"),
            vec![format!("cloudnet-node {}", env!("CARGO_PKG_VERSION"))]
        );
        assert_eq!(
            executor.execute("stop now"),
            vec!["Unknown command 'stop', try 'help'"]
        );
    }
}
