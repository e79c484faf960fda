//! Kubernetes Pod access
//!
//! The engine reads pods scheduled on this node and persists limit state in
//! their annotations. Updates are read-modify-write; last writer wins.

pub mod annotations;
mod client;

pub use annotations::{AnnotationPatch, merge_annotations};
pub use client::{pod_info_from, KubePodStore};

use crate::models::PodInfo;
use anyhow::Result;
use async_trait::async_trait;

/// Pod lookups and annotation updates
#[async_trait]
pub trait PodStore: Send + Sync {
    /// Pods scheduled on this node
    async fn list_node_pods(&self) -> Result<Vec<PodInfo>>;

    /// Fetch one pod, `None` if it no longer exists
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<PodInfo>>;

    /// Merge annotation changes into a pod; `None` values delete keys
    async fn patch_annotations(
        &self,
        namespace: &str,
        name: &str,
        changes: &AnnotationPatch,
    ) -> Result<()>;
}
