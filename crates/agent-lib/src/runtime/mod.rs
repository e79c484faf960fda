//! Container runtime enumeration
//!
//! Runtimes are only used to identify containers and find their cgroup
//! parent; I/O control never goes through them. Both implementations read
//! the runtime's state directory on disk.

mod containerd;
mod docker;

pub use containerd::{ContainerdRuntime, DEFAULT_CONTAINERD_STATE_DIR};
pub use docker::{DockerRuntime, DEFAULT_DOCKER_STATE_DIR};

use crate::models::RuntimeContainer;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// Supported runtimes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    #[default]
    Containerd,
    Docker,
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeKind::Containerd => f.write_str("containerd"),
            RuntimeKind::Docker => f.write_str("docker"),
        }
    }
}

/// Read access to the node's container runtime
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Running workload containers (sandboxes excluded)
    async fn list_containers(&self) -> Result<Vec<RuntimeContainer>>;

    /// Look up one container, `None` if the runtime has no record of it
    async fn inspect(&self, container_id: &str) -> Result<Option<RuntimeContainer>>;

    /// The container's cgroup parent spec
    async fn cgroup_parent(&self, container_id: &str) -> Result<Option<String>> {
        Ok(self
            .inspect(container_id)
            .await?
            .map(|c| c.cgroup_parent))
    }
}

/// Build the runtime reader for `kind`, using its default state dir if unset
pub fn create_runtime(kind: RuntimeKind, state_dir: Option<&str>) -> Arc<dyn ContainerRuntime> {
    match kind {
        RuntimeKind::Containerd => Arc::new(ContainerdRuntime::new(
            state_dir.unwrap_or(DEFAULT_CONTAINERD_STATE_DIR),
        )),
        RuntimeKind::Docker => Arc::new(DockerRuntime::new(
            state_dir.unwrap_or(DEFAULT_DOCKER_STATE_DIR),
        )),
    }
}

/// Subdirectory names that look like container IDs
async fn container_dirs(state_dir: &Path) -> Result<Vec<String>> {
    let mut entries = tokio::fs::read_dir(state_dir)
        .await
        .with_context(|| format!("Failed to read runtime state dir {}", state_dir.display()))?;

    let mut ids = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if !name.is_empty() && !name.starts_with('.') {
                ids.push(name.to_string());
            }
        }
    }
    ids.sort();
    Ok(ids)
}
