//! Engine tests against in-memory collaborators and a mock cgroup v2 tree

use super::*;
use crate::cgroup::{CgroupLimiter, StaticDevice};
use crate::collector::{
    ContainerStats, DiskIoStats, IoMetricsSource, NodeSummary, PodReference, PodStats,
};
use crate::error::SmartLimitError;
use crate::health::{Component, ComponentStatus, HealthRegistry};
use crate::k8s::annotations::annotation_key;
use crate::k8s::{merge_annotations, AnnotationPatch, PodStore};
use crate::models::{CgroupVersion, LimitResult, PodContainer, PodInfo, RuntimeContainer};
use crate::observability::AgentMetrics;
use crate::runtime::ContainerRuntime;
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::fs;

const ID: &str = "abc123def456789012345678901234567890123456789012345678901234abcd";
const PARENT: &str = "/kubepods/burstable/pod1";
const PREFIX: &str = "smartlimit.io";
/// A container id the runtime does not know
const GONE: &str = "gone";

struct FakeSource {
    counters: Mutex<BTreeMap<(String, String), DiskIoStats>>,
}

impl FakeSource {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            counters: Mutex::new(BTreeMap::new()),
        })
    }

    fn set(&self, namespace: &str, pod: &str, read_ops: u64) {
        self.counters.lock().unwrap().insert(
            (namespace.to_string(), pod.to_string()),
            DiskIoStats {
                read_ops,
                ..Default::default()
            },
        );
    }
}

#[async_trait]
impl IoMetricsSource for FakeSource {
    async fn node_summary(&self) -> anyhow::Result<NodeSummary> {
        let counters = self.counters.lock().unwrap();
        Ok(NodeSummary {
            pods: counters
                .iter()
                .map(|((namespace, name), io)| PodStats {
                    pod_ref: PodReference {
                        name: name.clone(),
                        namespace: namespace.clone(),
                        uid: String::new(),
                    },
                    containers: vec![ContainerStats {
                        name: "app".to_string(),
                        diskio: Some(*io),
                    }],
                })
                .collect(),
        })
    }

    async fn cadvisor_metrics(&self) -> anyhow::Result<String> {
        anyhow::bail!("cadvisor disabled in tests")
    }
}

#[derive(Default)]
struct FakePods {
    pods: Mutex<Vec<PodInfo>>,
    fail_list: AtomicBool,
    patches: AtomicUsize,
}

impl FakePods {
    fn with(pods: Vec<PodInfo>) -> Arc<Self> {
        Arc::new(Self {
            pods: Mutex::new(pods),
            ..Default::default()
        })
    }

    fn annotations(&self, namespace: &str, name: &str) -> BTreeMap<String, String> {
        self.pods
            .lock()
            .unwrap()
            .iter()
            .find(|p| p.namespace == namespace && p.name == name)
            .map(|p| p.annotations.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl PodStore for FakePods {
    async fn list_node_pods(&self) -> anyhow::Result<Vec<PodInfo>> {
        if self.fail_list.load(Ordering::SeqCst) {
            anyhow::bail!("apiserver unreachable");
        }
        Ok(self.pods.lock().unwrap().clone())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> anyhow::Result<Option<PodInfo>> {
        Ok(self
            .pods
            .lock()
            .unwrap()
            .iter()
            .find(|p| p.namespace == namespace && p.name == name)
            .cloned())
    }

    async fn patch_annotations(
        &self,
        namespace: &str,
        name: &str,
        changes: &AnnotationPatch,
    ) -> anyhow::Result<()> {
        self.patches.fetch_add(1, Ordering::SeqCst);
        let mut pods = self.pods.lock().unwrap();
        let pod = pods
            .iter_mut()
            .find(|p| p.namespace == namespace && p.name == name)
            .ok_or_else(|| anyhow::anyhow!("pod {namespace}/{name} not found"))?;
        merge_annotations(&mut pod.annotations, changes);
        Ok(())
    }
}

/// Knows every container except [`GONE`] under the same cgroup parent
struct FakeRuntime;

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn list_containers(&self) -> anyhow::Result<Vec<RuntimeContainer>> {
        Ok(Vec::new())
    }

    async fn inspect(&self, container_id: &str) -> anyhow::Result<Option<RuntimeContainer>> {
        if container_id == GONE {
            return Ok(None);
        }
        Ok(Some(RuntimeContainer {
            id: container_id.to_string(),
            cgroup_parent: PARENT.to_string(),
            ..Default::default()
        }))
    }
}

fn pod(name: &str, namespace: &str, container_id: &str) -> PodInfo {
    PodInfo {
        name: name.to_string(),
        namespace: namespace.to_string(),
        containers: vec![PodContainer {
            name: "app".to_string(),
            container_id: container_id.to_string(),
        }],
        ..Default::default()
    }
}

fn config() -> SmartLimitConfig {
    SmartLimitConfig {
        remove_delay_secs: 120,
        remove_check_interval_secs: 60,
        ..Default::default()
    }
}

fn t(minutes: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap() + Duration::minutes(minutes)
}

async fn cgroup_dir(root: &TempDir, container_id: &str) -> PathBuf {
    let path = root
        .path()
        .join(PARENT.trim_start_matches('/'))
        .join(container_id);
    fs::create_dir_all(&path).await.unwrap();
    path
}

struct Harness {
    manager: SmartLimitManager,
    source: Arc<FakeSource>,
    pods: Arc<FakePods>,
    root: TempDir,
}

fn harness(config: SmartLimitConfig, pods: Vec<PodInfo>) -> Harness {
    let root = TempDir::new().unwrap();
    let source = FakeSource::new();
    let pods = FakePods::with(pods);

    let manager = SmartLimitManager::builder()
        .config(config)
        .metrics_source(source.clone())
        .pod_store(pods.clone())
        .runtime(Arc::new(FakeRuntime))
        .limiter(CgroupLimiter::new(root.path(), CgroupVersion::V2))
        .device_resolver(Arc::new(StaticDevice::new("8:0").unwrap()))
        .node_name("node-1")
        .build()
        .unwrap();

    Harness {
        manager,
        source,
        pods,
        root,
    }
}

#[tokio::test]
async fn test_limit_lifecycle() {
    let h = harness(config(), vec![pod("web", "default", ID)]);
    let dir = cgroup_dir(&h.root, ID).await;

    h.source.set("default", "web", 0);
    let report = h.manager.tick(t(0)).await;
    assert_eq!(report.samples, 1);
    assert_eq!(report.applied, 0);

    // 120000 ops over 60s is 2000 IOPS against a 1000 threshold
    h.source.set("default", "web", 120_000);
    let report = h.manager.tick(t(1)).await;
    assert_eq!(report.applied, 1);

    let io_max = fs::read_to_string(dir.join("io.max")).await.unwrap();
    assert_eq!(
        io_max,
        "8:0 riops=500 wiops=500 rbps=52428800 wbps=52428800"
    );

    let status = h.manager.limit_status(ID).unwrap();
    assert!(status.is_limited);
    assert_eq!(status.triggered_by, "15m");
    assert_eq!(status.applied_at, t(1));
    assert_eq!(status.limit_result.read_iops, 500);

    let annotations = h.pods.annotations("default", "web");
    assert_eq!(
        annotations.get(&annotation_key(PREFIX, "container-ids")),
        Some(&ID.to_string())
    );
    assert_eq!(
        annotations.get(&annotation_key(PREFIX, "read-iops-limit")),
        Some(&"500".to_string())
    );
    assert_eq!(
        annotations.get(&annotation_key(PREFIX, "trend-read-iops-15m")),
        Some(&"2000".to_string())
    );

    // Trend mean decays 1000, 667, 500, 400; the bar is 1000 * 0.5
    for minute in 2..=4 {
        let report = h.manager.tick(t(minute)).await;
        assert_eq!(report.released, 0, "held at minute {minute}");
    }
    assert!(h.manager.limit_status(ID).unwrap().below_threshold_since.is_none());

    h.manager.tick(t(5)).await;
    assert_eq!(
        h.manager.limit_status(ID).unwrap().below_threshold_since,
        Some(t(5))
    );
    h.manager.tick(t(6)).await;
    assert!(h.manager.limit_status(ID).is_some());

    let report = h.manager.tick(t(7)).await;
    assert_eq!(report.released, 1);
    assert!(h.manager.limit_status(ID).is_none());

    let io_max = fs::read_to_string(dir.join("io.max")).await.unwrap();
    assert_eq!(io_max, "8:0 riops=max wiops=max rbps=max wbps=max");

    let annotations = h.pods.annotations("default", "web");
    assert_eq!(
        annotations.get(&annotation_key(PREFIX, "limit-removed")),
        Some(&"true".to_string())
    );
    assert!(!annotations.contains_key(&annotation_key(PREFIX, "container-ids")));
}

#[tokio::test]
async fn test_failed_apply_is_retried() {
    let h = harness(config(), vec![pod("web", "default", ID)]);

    h.source.set("default", "web", 0);
    h.manager.tick(t(0)).await;

    // No cgroup directory yet, so the write fails and nothing is recorded
    h.source.set("default", "web", 120_000);
    let report = h.manager.tick(t(1)).await;
    assert_eq!(report.applied, 0);
    assert_eq!(report.errors, 1);
    assert!(h.manager.limit_status(ID).is_none());
    assert_eq!(h.pods.patches.load(Ordering::SeqCst), 0);

    let dir = cgroup_dir(&h.root, ID).await;
    h.source.set("default", "web", 240_000);
    let report = h.manager.tick(t(2)).await;
    assert_eq!(report.applied, 1);
    assert!(h.manager.limit_status(ID).is_some());
    assert!(fs::metadata(dir.join("io.max")).await.is_ok());
}

#[tokio::test]
async fn test_excluded_namespace_is_never_tracked() {
    let h = harness(config(), vec![pod("coredns", "kube-system", ID)]);
    cgroup_dir(&h.root, ID).await;

    h.source.set("kube-system", "coredns", 0);
    h.manager.tick(t(0)).await;
    h.source.set("kube-system", "coredns", 600_000);
    let report = h.manager.tick(t(1)).await;

    assert_eq!(report.samples, 0);
    assert_eq!(report.applied, 0);
    assert!(h.manager.history().is_empty());
}

#[tokio::test]
async fn test_restore_limit_status() {
    let mut limited = pod("web", "default", ID);
    let limits = [
        ("read-iops-limit", "500"),
        ("write-iops-limit", "400"),
        ("read-bps-limit", "0"),
        ("write-bps-limit", "1048576"),
        ("triggered-by", "30m"),
        ("applied-at", "2024-05-01T11:00:00Z"),
        ("container-ids", ID),
    ];
    for (name, value) in limits {
        limited
            .annotations
            .insert(annotation_key(PREFIX, name), value.to_string());
    }

    let mut released = pod("db", "default", "other");
    released
        .annotations
        .insert(annotation_key(PREFIX, "read-iops-limit"), "500".to_string());
    released
        .annotations
        .insert(annotation_key(PREFIX, "limit-removed"), "true".to_string());

    let untouched = pod("cache", "default", "third");

    let h = harness(config(), vec![limited, released, untouched]);
    let restored = h.manager.restore_limit_status().await.unwrap();
    assert_eq!(restored, 1);

    let status = h.manager.limit_status(ID).unwrap();
    assert_eq!(status.triggered_by, "30m");
    assert_eq!(status.applied_at, t(-60));
    assert_eq!(
        status.limit_result,
        LimitResult {
            read_iops: 500,
            write_iops: 400,
            read_bps: 0,
            write_bps: 1048576,
        }
    );
    assert!(h.manager.limit_status("other").is_none());
    assert!(h.manager.limit_status("third").is_none());

    // Restoring never writes cgroups
    let path = h.root.path().join(PARENT.trim_start_matches('/')).join(ID);
    assert!(fs::metadata(path).await.is_err());
}

#[tokio::test]
async fn test_restore_without_id_list_covers_all_containers() {
    let mut limited = pod("web", "default", ID);
    limited
        .annotations
        .insert(annotation_key(PREFIX, "read-iops-limit"), "500".to_string());

    let h = harness(config(), vec![limited]);
    assert_eq!(h.manager.restore_limit_status().await.unwrap(), 1);
    assert_eq!(h.manager.limited_containers()[0].container_id, ID);
}

#[tokio::test]
async fn test_list_failure_degrades_kubernetes_health() {
    let health = HealthRegistry::new();

    let root = TempDir::new().unwrap();
    let pods = FakePods::with(vec![pod("web", "default", ID)]);
    pods.fail_list.store(true, Ordering::SeqCst);

    let manager = SmartLimitManager::builder()
        .config(config())
        .metrics_source(FakeSource::new())
        .pod_store(pods.clone())
        .runtime(Arc::new(FakeRuntime))
        .limiter(CgroupLimiter::new(root.path(), CgroupVersion::V2))
        .device_resolver(Arc::new(StaticDevice::new("8:0").unwrap()))
        .health(health.clone())
        .metrics(AgentMetrics::new().unwrap())
        .build()
        .unwrap();

    let report = manager.tick(t(0)).await;
    assert_eq!(report.errors, 1);
    let response = health.health().await;
    assert_eq!(
        response.components[&Component::Kubernetes].status,
        ComponentStatus::Degraded
    );

    pods.fail_list.store(false, Ordering::SeqCst);
    manager.tick(t(1)).await;
    let response = health.health().await;
    assert_eq!(
        response.components[&Component::Kubernetes].status,
        ComponentStatus::Healthy
    );

    assert_eq!(manager.restore_limit_status().await.unwrap(), 0);
}

#[tokio::test]
async fn test_cleanup_releases_evicted_limit() {
    let config = SmartLimitConfig {
        history_retention_secs: 600,
        ..config()
    };
    let h = harness(config, vec![pod("web", "default", ID)]);
    let dir = cgroup_dir(&h.root, ID).await;

    h.source.set("default", "web", 0);
    h.manager.tick(t(0)).await;
    h.source.set("default", "web", 120_000);
    h.manager.tick(t(1)).await;
    assert!(h.manager.limit_status(ID).is_some());

    assert!(h.manager.cleanup(t(5)).await.is_empty());
    assert!(h.manager.limit_status(ID).is_some());

    let evicted = h.manager.cleanup(t(20)).await;
    assert_eq!(evicted, vec![ID.to_string()]);
    assert!(h.manager.limit_status(ID).is_none());
    assert!(h.manager.history().is_empty());

    let io_max = fs::read_to_string(dir.join("io.max")).await.unwrap();
    assert_eq!(io_max, "8:0 riops=max wiops=max rbps=max wbps=max");
    let annotations = h.pods.annotations("default", "web");
    assert_eq!(
        annotations.get(&annotation_key(PREFIX, "limit-removed")),
        Some(&"true".to_string())
    );
}

#[tokio::test]
async fn test_restored_limit_without_samples_is_released() {
    // Restarted under a new id while the agent was down
    let mut limited = pod("web", "default", "new-id");
    for (name, value) in [("read-iops-limit", "500"), ("container-ids", GONE)] {
        limited
            .annotations
            .insert(annotation_key(PREFIX, name), value.to_string());
    }

    let config = SmartLimitConfig {
        history_retention_secs: 600,
        ..config()
    };
    let h = harness(config, vec![limited]);
    assert_eq!(h.manager.restore_limit_status_at(t(0)).await.unwrap(), 1);

    for minute in 1..=5 {
        h.manager.tick(t(minute)).await;
    }
    h.manager.cleanup(t(5)).await;
    assert!(h.manager.limit_status(GONE).is_some());

    h.manager.tick(t(11)).await;
    h.manager.cleanup(t(11)).await;
    assert!(h.manager.limit_status(GONE).is_none());
    assert!(h.manager.limited_containers().is_empty());

    let annotations = h.pods.annotations("default", "web");
    assert_eq!(
        annotations.get(&annotation_key(PREFIX, "limit-removed")),
        Some(&"true".to_string())
    );
    assert!(!annotations.contains_key(&annotation_key(PREFIX, "container-ids")));

    // Nothing left to restore on the next start
    assert_eq!(h.manager.restore_limit_status_at(t(12)).await.unwrap(), 0);
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let h = harness(config(), vec![pod("web", "default", ID)]);
    let manager = Arc::new(h.manager);
    let tasks = manager.start();

    manager.stop();
    manager.stop();
    assert!(manager.is_stopped());

    tokio::time::timeout(std::time::Duration::from_secs(5), tasks.join())
        .await
        .expect("engine loops did not exit");
}

#[tokio::test]
async fn test_builder_requires_collaborators() {
    let result = SmartLimitManager::builder()
        .pod_store(FakePods::with(Vec::new()))
        .build();
    assert!(matches!(
        result,
        Err(SmartLimitError::MissingDependency("metrics source"))
    ));

    let result = SmartLimitManager::builder()
        .metrics_source(FakeSource::new())
        .pod_store(FakePods::with(Vec::new()))
        .runtime(Arc::new(FakeRuntime))
        .build();
    assert!(matches!(
        result,
        Err(SmartLimitError::MissingDependency("cgroup limiter"))
    ));
}
