//! `PodStore` backed by the Kubernetes API server

use super::{AnnotationPatch, PodStore};
use crate::collector::parse_container_id;
use crate::models::{PodContainer, PodInfo};
use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use std::path::Path;
use tracing::{debug, info};

/// Pods on one node, read and patched through the API server
#[derive(Clone)]
pub struct KubePodStore {
    client: Client,
    node_name: String,
}

impl KubePodStore {
    pub fn new(client: Client, node_name: impl Into<String>) -> Self {
        Self {
            client,
            node_name: node_name.into(),
        }
    }

    /// Connect with an explicit kubeconfig, or in-cluster / default config
    pub async fn connect(kubeconfig: Option<&Path>, node_name: impl Into<String>) -> Result<Self> {
        let client = match kubeconfig {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path)
                    .with_context(|| format!("Failed to read kubeconfig {}", path.display()))?;
                let config =
                    Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                        .await
                        .context("Failed to build config from kubeconfig")?;
                Client::try_from(config).context("Failed to create Kubernetes client")?
            }
            None => Client::try_default()
                .await
                .context("Failed to create Kubernetes client")?,
        };

        let store = Self::new(client, node_name);
        info!(node = %store.node_name, "Connected to Kubernetes API");
        Ok(store)
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }
}

#[async_trait]
impl PodStore for KubePodStore {
    async fn list_node_pods(&self) -> Result<Vec<PodInfo>> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let params = ListParams::default().fields(&format!("spec.nodeName={}", self.node_name));

        let pods = api
            .list(&params)
            .await
            .with_context(|| format!("Failed to list pods on node {}", self.node_name))?;

        let pods: Vec<PodInfo> = pods
            .items
            .iter()
            .filter(|pod| !is_terminated(pod))
            .map(pod_info_from)
            .collect();
        debug!(count = pods.len(), "Listed node pods");
        Ok(pods)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<PodInfo>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pod = api
            .get_opt(name)
            .await
            .with_context(|| format!("Failed to get pod {namespace}/{name}"))?;
        Ok(pod.as_ref().map(pod_info_from))
    }

    async fn patch_annotations(
        &self,
        namespace: &str,
        name: &str,
        changes: &AnnotationPatch,
    ) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({
            "metadata": {
                "annotations": changes,
            }
        });

        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .with_context(|| format!("Failed to patch annotations on {namespace}/{name}"))?;
        Ok(())
    }
}

fn is_terminated(pod: &Pod) -> bool {
    matches!(
        pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        Some("Succeeded") | Some("Failed")
    )
}

/// Reduce an API pod to the fields the engine uses
pub fn pod_info_from(pod: &Pod) -> PodInfo {
    let meta = &pod.metadata;
    let containers = pod
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .map(|statuses| {
            statuses
                .iter()
                .map(|cs| PodContainer {
                    name: cs.name.clone(),
                    container_id: cs
                        .container_id
                        .as_deref()
                        .map(parse_container_id)
                        .unwrap_or_default(),
                })
                .collect()
        })
        .unwrap_or_default();

    PodInfo {
        name: meta.name.clone().unwrap_or_default(),
        namespace: meta.namespace.clone().unwrap_or_default(),
        uid: meta.uid.clone().unwrap_or_default(),
        labels: meta.labels.clone().unwrap_or_default(),
        annotations: meta.annotations.clone().unwrap_or_default(),
        containers,
    }
}
