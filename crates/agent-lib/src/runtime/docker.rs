//! Docker container state reader
//!
//! Reads `<state_dir>/<id>/config.v2.json` for identity and run state, and
//! `hostconfig.json` for the cgroup parent.

use super::{container_dirs, ContainerRuntime};
use crate::models::RuntimeContainer;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

pub const DEFAULT_DOCKER_STATE_DIR: &str = "/var/lib/docker/containers";

/// Label dockershim puts on pod sandbox containers
const CONTAINER_TYPE_LABEL: &str = "io.kubernetes.docker.type";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ConfigV2 {
    #[serde(default)]
    name: String,
    #[serde(default)]
    config: ContainerConfig,
    #[serde(default)]
    state: ContainerState,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerConfig {
    #[serde(default)]
    image: String,
    #[serde(default)]
    labels: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerState {
    #[serde(default)]
    running: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HostConfig {
    #[serde(default)]
    cgroup_parent: String,
}

pub struct DockerRuntime {
    state_dir: PathBuf,
}

impl DockerRuntime {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    async fn read(&self, id: &str) -> Result<Option<(ConfigV2, HostConfig)>> {
        let dir = self.state_dir.join(id);
        let Some(config) = read_json::<ConfigV2>(&dir.join("config.v2.json")).await? else {
            return Ok(None);
        };
        let host = read_json::<HostConfig>(&dir.join("hostconfig.json"))
            .await?
            .unwrap_or_default();
        Ok(Some((config, host)))
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list_containers(&self) -> Result<Vec<RuntimeContainer>> {
        let mut containers = Vec::new();
        for id in container_dirs(&self.state_dir).await? {
            match self.read(&id).await {
                Ok(Some((config, host))) => {
                    let is_sandbox = config
                        .config
                        .labels
                        .as_ref()
                        .and_then(|l| l.get(CONTAINER_TYPE_LABEL))
                        .is_some_and(|t| t == "podsandbox");
                    if config.state.running && !is_sandbox {
                        containers.push(to_container(&id, config, host));
                    }
                }
                Ok(None) => {}
                Err(e) => debug!(container_id = %id, error = %e, "Skipping unreadable container"),
            }
        }
        Ok(containers)
    }

    async fn inspect(&self, container_id: &str) -> Result<Option<RuntimeContainer>> {
        Ok(self
            .read(container_id)
            .await?
            .map(|(config, host)| to_container(container_id, config, host)))
    }
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
    };
    let value = serde_json::from_str(&content)
        .with_context(|| format!("Invalid JSON in {}", path.display()))?;
    Ok(Some(value))
}

fn to_container(id: &str, config: ConfigV2, host: HostConfig) -> RuntimeContainer {
    RuntimeContainer {
        id: id.to_string(),
        name: config.name.trim_start_matches('/').to_string(),
        image: config.config.image,
        cgroup_parent: docker_cgroup_parent(&host.cgroup_parent, id),
        annotations: config.config.labels.unwrap_or_default(),
    }
}

/// Express Docker's systemd-driver parent as a `<slice>:docker:<id>` triple
///
/// With the systemd cgroup driver the parent is a bare slice name and the
/// container lives in `docker-<id>.scope` beneath it.
fn docker_cgroup_parent(parent: &str, id: &str) -> String {
    if !parent.starts_with('/') && parent.ends_with(".slice") {
        format!("{parent}:docker:{id}")
    } else {
        parent.to_string()
    }
}
