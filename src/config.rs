//! Node configuration file.
//!
//! A single YAML document holding the cluster section, logging and the
//! directories deployments are written to. Every field has a default, so an
//! empty file is a valid configuration.

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use cloudnet_cluster::ClusterConfig;
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of text
    #[serde(default)]
    pub json: bool,

    /// Write a daily rolling log file into this directory
    #[serde(default)]
    pub directory: Option<PathBuf>,

    #[serde(default = "default_file_prefix")]
    pub file_prefix: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_file_prefix() -> String {
    "cloudnet-node.log".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            directory: None,
            file_prefix: default_file_prefix(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub cluster: ClusterConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub storage: StorageConfig,
}

/// Where archives deployed by other nodes end up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_template_directory")]
    pub template_directory: PathBuf,

    #[serde(default = "default_static_service_directory")]
    pub static_service_directory: PathBuf,
}

fn default_template_directory() -> PathBuf {
    PathBuf::from("local/templates")
}

fn default_static_service_directory() -> PathBuf {
    PathBuf::from("local/services")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            template_directory: default_template_directory(),
            static_service_directory: default_static_service_directory(),
        }
    }
}

impl NodeConfig {
    /// Read the configuration at `path`. A missing file yields the defaults,
    /// which are written back so they can be edited.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            let config = Self::default();
            config.save(path)?;
            info!(path = %path.display(), "Wrote default configuration");
            return Ok(config);
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_yaml(&content).with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        // an empty document deserializes to unit, not an empty mapping
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.cluster.validate()?;
        Ok(())
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let content = serde_yaml::to_string(self)?;
        fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))
    }
}
