//! Kubelet node summary
//!
//! Only the fields the agent reads are modeled; everything else in the
//! payload is ignored.

use crate::models::{CollectedSample, IoStats, PodInfo};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeSummary {
    #[serde(default)]
    pub pods: Vec<PodStats>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodStats {
    pub pod_ref: PodReference,
    #[serde(default)]
    pub containers: Vec<ContainerStats>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodReference {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub uid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerStats {
    pub name: String,
    #[serde(default)]
    pub diskio: Option<DiskIoStats>,
}

/// Cumulative block I/O counters for one container
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskIoStats {
    #[serde(default)]
    pub read_ops: u64,
    #[serde(default)]
    pub write_ops: u64,
    #[serde(default)]
    pub read_bytes: u64,
    #[serde(default)]
    pub write_bytes: u64,
}

impl NodeSummary {
    /// True when at least one container carries disk I/O counters
    pub fn has_disk_io(&self) -> bool {
        self.pods
            .iter()
            .flat_map(|p| &p.containers)
            .any(|c| c.diskio.is_some())
    }
}

/// Attribute summary counters to container IDs using the pod list
///
/// Summary entries identify containers by name; the pod's container
/// statuses supply the runtime ID. Containers without a known ID are skipped.
pub fn samples_from_summary(
    summary: &NodeSummary,
    pods: &[PodInfo],
    now: DateTime<Utc>,
) -> Vec<CollectedSample> {
    let mut samples = Vec::new();

    for pod_stats in &summary.pods {
        let Some(pod) = pods.iter().find(|p| {
            p.name == pod_stats.pod_ref.name && p.namespace == pod_stats.pod_ref.namespace
        }) else {
            continue;
        };

        for container in &pod_stats.containers {
            let Some(io) = container.diskio else {
                continue;
            };
            let Some(status) = pod
                .containers
                .iter()
                .find(|c| c.name == container.name && !c.container_id.is_empty())
            else {
                continue;
            };

            samples.push(CollectedSample {
                container_id: status.container_id.clone(),
                container_name: container.name.clone(),
                pod_name: pod.name.clone(),
                namespace: pod.namespace.clone(),
                stats: IoStats::new(now, io.read_ops, io.write_ops, io.read_bytes, io.write_bytes),
            });
        }
    }

    samples
}
