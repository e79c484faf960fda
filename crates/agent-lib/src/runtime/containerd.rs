//! containerd task state reader
//!
//! Each running task has an OCI bundle under the k8s.io namespace state dir:
//! `<state_dir>/<id>/config.json`. The bundle carries `linux.cgroupsPath` and
//! the CRI annotations naming the container and image.

use super::{container_dirs, ContainerRuntime};
use crate::models::RuntimeContainer;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::fs;
use tracing::debug;

pub const DEFAULT_CONTAINERD_STATE_DIR: &str = "/run/containerd/io.containerd.runtime.v2.task/k8s.io";

const CONTAINER_NAME_ANNOTATION: &str = "io.kubernetes.cri.container-name";
const CONTAINER_TYPE_ANNOTATION: &str = "io.kubernetes.cri.container-type";
const IMAGE_NAME_ANNOTATION: &str = "io.kubernetes.cri.image-name";

#[derive(Debug, Default, Deserialize)]
struct OciSpec {
    #[serde(default)]
    linux: Option<OciLinux>,
    #[serde(default)]
    annotations: BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OciLinux {
    #[serde(default)]
    cgroups_path: Option<String>,
}

pub struct ContainerdRuntime {
    state_dir: PathBuf,
}

impl ContainerdRuntime {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    async fn read_bundle(&self, id: &str) -> Result<Option<OciSpec>> {
        let path = self.state_dir.join(id).join("config.json");
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()));
            }
        };

        let spec = serde_json::from_str(&content)
            .with_context(|| format!("Invalid OCI spec {}", path.display()))?;
        Ok(Some(spec))
    }
}

#[async_trait]
impl ContainerRuntime for ContainerdRuntime {
    async fn list_containers(&self) -> Result<Vec<RuntimeContainer>> {
        let mut containers = Vec::new();
        for id in container_dirs(&self.state_dir).await? {
            match self.read_bundle(&id).await {
                Ok(Some(spec)) => {
                    let is_sandbox = spec
                        .annotations
                        .get(CONTAINER_TYPE_ANNOTATION)
                        .is_some_and(|t| t == "sandbox");
                    if !is_sandbox {
                        containers.push(to_container(&id, spec));
                    }
                }
                Ok(None) => {}
                Err(e) => debug!(container_id = %id, error = %e, "Skipping unreadable bundle"),
            }
        }
        Ok(containers)
    }

    async fn inspect(&self, container_id: &str) -> Result<Option<RuntimeContainer>> {
        Ok(self
            .read_bundle(container_id)
            .await?
            .map(|spec| to_container(container_id, spec)))
    }
}

fn to_container(id: &str, spec: OciSpec) -> RuntimeContainer {
    let cgroups_path = spec
        .linux
        .and_then(|l| l.cgroups_path)
        .unwrap_or_default();

    RuntimeContainer {
        id: id.to_string(),
        name: spec
            .annotations
            .get(CONTAINER_NAME_ANNOTATION)
            .cloned()
            .unwrap_or_default(),
        image: spec
            .annotations
            .get(IMAGE_NAME_ANNOTATION)
            .cloned()
            .unwrap_or_default(),
        cgroup_parent: cgroup_parent_of(&cgroups_path, id),
        annotations: spec.annotations,
    }
}

/// Reduce a cgroupfs-driver cgroupsPath to its parent
///
/// With the cgroupfs driver containerd records the full path including the
/// container ID; systemd triples are returned unchanged.
fn cgroup_parent_of(cgroups_path: &str, id: &str) -> String {
    if cgroups_path.contains(':') {
        return cgroups_path.to_string();
    }
    cgroups_path
        .strip_suffix(id)
        .map(|parent| parent.trim_end_matches('/'))
        .filter(|parent| !parent.is_empty())
        .unwrap_or(cgroups_path)
        .to_string()
}
