use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use cloudnet_node::{config::NodeConfig, logging, node::Node};

#[derive(Parser, Debug)]
#[command(name = "cloudnet-node", version, about = "CloudNet cluster node")]
struct CliArgs {
    /// Path of the YAML configuration file, created with defaults if missing
    #[arg(long, env = "CLOUDNET_CONFIG", default_value = "config.yml")]
    config: PathBuf,

    /// Overrides `logging.level`
    #[arg(long)]
    log_level: Option<String>,

    /// Log JSON lines instead of text
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    let mut config = NodeConfig::load(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    if args.log_json {
        config.logging.json = true;
    }
    let _log_guard = logging::init_logging(&config.logging)?;

    let node = Node::start(config).await?;
    node.run().await
}
