//! Filesystem target for template and static service deployments.
//!
//! Archives are stored as received:
//! ```text
//! <template_directory>/<storage>/<prefix>/<name>.zip
//! <static_service_directory>/<name>.zip
//! ```

use std::{
    fs,
    io,
    path::{Component, Path, PathBuf},
};

use bytes::Bytes;
use cloudnet_cluster::{DeploymentSink, ServiceTemplate};
use cloudnet_protocol::TransferStatus;
use tracing::{info, warn};

const ARCHIVE_EXTENSION: &str = "zip";

#[derive(Debug, Clone)]
pub struct DirectoryDeploymentSink {
    template_directory: PathBuf,
    static_service_directory: PathBuf,
}

/// A name must stay a single path segment below its directory.
fn is_plain_segment(segment: &str) -> bool {
    let mut components = Path::new(segment).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

fn write_archive(target: &Path, overwrite: bool, data: &[u8]) -> io::Result<TransferStatus> {
    if target.exists() && !overwrite {
        return Ok(TransferStatus::AlreadyExists);
    }
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(target, data)?;
    Ok(TransferStatus::Success)
}

impl DirectoryDeploymentSink {
    pub fn new(template_directory: impl Into<PathBuf>, static_service_directory: impl Into<PathBuf>) -> Self {
        Self {
            template_directory: template_directory.into(),
            static_service_directory: static_service_directory.into(),
        }
    }

    pub fn template_path(&self, template: &ServiceTemplate) -> Option<PathBuf> {
        let segments = [&template.storage, &template.prefix, &template.name];
        if !segments.iter().all(|segment| is_plain_segment(segment)) {
            return None;
        }
        Some(
            self.template_directory
                .join(&template.storage)
                .join(&template.prefix)
                .join(format!("{}.{}", template.name, ARCHIVE_EXTENSION)),
        )
    }

    pub fn static_service_path(&self, name: &str) -> Option<PathBuf> {
        is_plain_segment(name).then(|| {
            self.static_service_directory
                .join(format!("{}.{}", name, ARCHIVE_EXTENSION))
        })
    }

    fn store(&self, target: Option<PathBuf>, what: &str, overwrite: bool, data: &[u8]) -> TransferStatus {
        let Some(target) = target else {
            warn!(%what, "Refusing deployment outside of the storage directory");
            return TransferStatus::Failure;
        };
        match write_archive(&target, overwrite, data) {
            Ok(TransferStatus::Success) => {
                info!(%what, path = %target.display(), bytes = data.len(), "Stored deployment");
                TransferStatus::Success
            }
            Ok(status) => {
                info!(%what, path = %target.display(), "Deployment exists and overwrite is off");
                status
            }
            Err(e) => {
                warn!(%what, path = %target.display(), "Failed to store deployment: {}", e);
                TransferStatus::Failure
            }
        }
    }
}

impl DeploymentSink for DirectoryDeploymentSink {
    fn deploy_template(&self, template: &ServiceTemplate, overwrite: bool, data: Bytes) -> TransferStatus {
        self.store(self.template_path(template), &template.to_string(), overwrite, &data)
    }

    fn deploy_static_service(&self, name: &str, overwrite: bool, data: Bytes) -> TransferStatus {
        self.store(self.static_service_path(name), name, overwrite, &data)
    }
}
