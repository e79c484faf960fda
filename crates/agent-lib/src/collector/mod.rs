//! Per-container I/O counter collection from the kubelet
//!
//! Two strategies are tried in order:
//! - The node summary (`/stats/summary`), attributed by container name
//! - cAdvisor metrics (`/metrics/cadvisor`), attributed by container ID
//!
//! The second runs when the first errors, lists no pods, or carries no disk
//! I/O counters.

mod cadvisor;
mod container_id;
mod kubelet;
mod summary;

pub use cadvisor::{parse_cadvisor_metrics, samples_from_cadvisor, FsCounters};
pub use container_id::{extract_container_id, parse_container_id};
pub use kubelet::{KubeletClient, KubeletConfig};
pub use summary::{
    samples_from_summary, ContainerStats, DiskIoStats, NodeSummary, PodReference, PodStats,
};

use crate::error::{Result, SmartLimitError};
use crate::models::{CollectedSample, PodInfo};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Source of raw kubelet I/O data
#[async_trait]
pub trait IoMetricsSource: Send + Sync {
    /// Fetch the kubelet node summary
    async fn node_summary(&self) -> anyhow::Result<NodeSummary>;

    /// Fetch the cAdvisor Prometheus exposition text
    async fn cadvisor_metrics(&self) -> anyhow::Result<String>;
}

/// Which strategy produced a collection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionStrategy {
    Summary,
    Cadvisor,
}

impl fmt::Display for CollectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectionStrategy::Summary => f.write_str("summary"),
            CollectionStrategy::Cadvisor => f.write_str("cadvisor"),
        }
    }
}

/// Samples from one collection pass
#[derive(Debug, Clone)]
pub struct Collection {
    pub strategy: CollectionStrategy,
    pub samples: Vec<CollectedSample>,
}

/// Collects one sample per running container on the node
#[derive(Clone)]
pub struct IoCollector {
    source: Arc<dyn IoMetricsSource>,
}

impl IoCollector {
    pub fn new(source: Arc<dyn IoMetricsSource>) -> Self {
        Self { source }
    }

    /// Collect samples for the given pods, stamped with `now`
    pub async fn collect(&self, pods: &[PodInfo], now: DateTime<Utc>) -> Result<Collection> {
        let summary_error = match self.source.node_summary().await {
            Ok(summary) if !summary.pods.is_empty() && summary.has_disk_io() => {
                let samples = samples_from_summary(&summary, pods, now);
                debug!(samples = samples.len(), "Collected samples from node summary");
                return Ok(Collection {
                    strategy: CollectionStrategy::Summary,
                    samples,
                });
            }
            Ok(summary) => {
                debug!(
                    pods = summary.pods.len(),
                    "Node summary carries no disk I/O, falling back to cAdvisor"
                );
                "summary carried no disk I/O".to_string()
            }
            Err(e) => {
                warn!(error = %e, "Node summary unavailable, falling back to cAdvisor");
                format!("{e:#}")
            }
        };

        match self.source.cadvisor_metrics().await {
            Ok(text) => {
                let counters = parse_cadvisor_metrics(&text);
                let samples = samples_from_cadvisor(&counters, pods, now);
                debug!(samples = samples.len(), "Collected samples from cAdvisor");
                Ok(Collection {
                    strategy: CollectionStrategy::Cadvisor,
                    samples,
                })
            }
            Err(e) => Err(SmartLimitError::ExternalDataUnavailable {
                message: format!("summary: {summary_error}; cadvisor: {e:#}"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PodContainer;

    const ID: &str = "abc123def456789012345678901234567890123456789012345678901234abcd";

    struct FakeSource {
        summary: Option<NodeSummary>,
        cadvisor: Option<String>,
    }

    #[async_trait]
    impl IoMetricsSource for FakeSource {
        async fn node_summary(&self) -> anyhow::Result<NodeSummary> {
            self.summary
                .clone()
                .ok_or_else(|| anyhow::anyhow!("summary down"))
        }

        async fn cadvisor_metrics(&self) -> anyhow::Result<String> {
            self.cadvisor
                .clone()
                .ok_or_else(|| anyhow::anyhow!("cadvisor down"))
        }
    }

    fn pods() -> Vec<PodInfo> {
        vec![PodInfo {
            name: "web".to_string(),
            namespace: "default".to_string(),
            containers: vec![PodContainer {
                name: "app".to_string(),
                container_id: ID.to_string(),
            }],
            ..Default::default()
        }]
    }

    fn summary_with_io() -> NodeSummary {
        NodeSummary {
            pods: vec![PodStats {
                pod_ref: PodReference {
                    name: "web".to_string(),
                    namespace: "default".to_string(),
                    uid: String::new(),
                },
                containers: vec![ContainerStats {
                    name: "app".to_string(),
                    diskio: Some(DiskIoStats {
                        read_ops: 5,
                        ..Default::default()
                    }),
                }],
            }],
        }
    }

    fn cadvisor_text() -> String {
        format!("container_fs_writes_total{{container=\"app\",id=\"/kubepods/pod1/{ID}\"}} 42\n")
    }

    #[tokio::test]
    async fn test_summary_preferred() {
        let collector = IoCollector::new(Arc::new(FakeSource {
            summary: Some(summary_with_io()),
            cadvisor: Some(cadvisor_text()),
        }));

        let collection = collector.collect(&pods(), Utc::now()).await.unwrap();
        assert_eq!(collection.strategy, CollectionStrategy::Summary);
        assert_eq!(collection.samples.len(), 1);
        assert_eq!(collection.samples[0].stats.read_ops, 5);
    }

    #[tokio::test]
    async fn test_fallback_on_summary_error() {
        let collector = IoCollector::new(Arc::new(FakeSource {
            summary: None,
            cadvisor: Some(cadvisor_text()),
        }));

        let collection = collector.collect(&pods(), Utc::now()).await.unwrap();
        assert_eq!(collection.strategy, CollectionStrategy::Cadvisor);
        assert_eq!(collection.samples[0].stats.write_ops, 42);
    }

    #[tokio::test]
    async fn test_fallback_on_empty_summary() {
        let collector = IoCollector::new(Arc::new(FakeSource {
            summary: Some(NodeSummary::default()),
            cadvisor: Some(cadvisor_text()),
        }));

        let collection = collector.collect(&pods(), Utc::now()).await.unwrap();
        assert_eq!(collection.strategy, CollectionStrategy::Cadvisor);
    }

    #[tokio::test]
    async fn test_both_strategies_fail() {
        let collector = IoCollector::new(Arc::new(FakeSource {
            summary: None,
            cadvisor: None,
        }));

        let err = collector.collect(&pods(), Utc::now()).await.unwrap_err();
        assert!(matches!(err, SmartLimitError::ExternalDataUnavailable { .. }));
        assert!(err.to_string().contains("cadvisor down"));
    }
}
