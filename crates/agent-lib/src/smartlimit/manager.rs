//! The throttling engine
//!
//! Two periodic tasks share the engine's registries:
//! - monitor: collect -> analyze -> limit or release -> persist
//! - cleanup: evict idle histories, prune rate samples, release limits nothing
//!   samples anymore
//!
//! Limit state lives in memory and is mirrored into Pod annotations so it can
//! be rebuilt with [`SmartLimitManager::restore_limit_status`] after a restart.

use super::decision::{evaluate_release, should_apply_limit, LimitTrigger, ReleaseDecision};
use super::{ExclusionPolicy, SmartLimitConfig};
use crate::cgroup::{CgroupLimiter, DeviceResolver};
use crate::collector::{CollectionStrategy, IoCollector, IoMetricsSource};
use crate::error::{Result, SmartLimitError};
use crate::health::{Component, HealthRegistry};
use crate::history::HistoryStore;
use crate::k8s::annotations::{
    container_limits, decode_limit, encode_limit, encode_release, has_prefix, is_limit_removed,
    limited_container_ids, ContainerLimit, ContainerLimits,
};
use crate::k8s::PodStore;
use crate::models::{CgroupEndpoint, IoTrend, LimitStatus, PodInfo, RateSample, TrendWindow};
use crate::observability::{AgentMetrics, StructuredLogger};
use crate::rate::{window_start, RateCalculator};
use crate::runtime::ContainerRuntime;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// What one monitor tick did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub samples: usize,
    pub applied: usize,
    pub released: usize,
    pub errors: usize,
}

/// Handles of the two engine tasks
pub struct EngineTasks {
    pub monitor: JoinHandle<()>,
    pub cleanup: JoinHandle<()>,
}

impl EngineTasks {
    /// Wait for both loops to exit
    pub async fn join(self) {
        let _ = tokio::join!(self.monitor, self.cleanup);
    }
}

/// Adaptive per-container I/O throttling engine
pub struct SmartLimitManager {
    config: SmartLimitConfig,
    collector: IoCollector,
    pods: Arc<dyn PodStore>,
    runtime: Arc<dyn ContainerRuntime>,
    limiter: CgroupLimiter,
    devices: Arc<dyn DeviceResolver>,
    policy: ExclusionPolicy,
    history: HistoryStore,
    rates: RateCalculator,
    statuses: DashMap<String, LimitStatus>,
    metrics: Option<AgentMetrics>,
    health: Option<HealthRegistry>,
    logger: StructuredLogger,
    stopped: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl SmartLimitManager {
    pub fn builder() -> SmartLimitManagerBuilder {
        SmartLimitManagerBuilder::new()
    }

    pub fn config(&self) -> &SmartLimitConfig {
        &self.config
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    pub fn limiter(&self) -> &CgroupLimiter {
        &self.limiter
    }

    /// Current limit state of a container
    pub fn limit_status(&self, container_id: &str) -> Option<LimitStatus> {
        self.statuses.get(container_id).map(|s| s.clone())
    }

    /// All currently limited containers
    pub fn limited_containers(&self) -> Vec<LimitStatus> {
        let mut statuses: Vec<LimitStatus> =
            self.statuses.iter().map(|s| s.value().clone()).collect();
        statuses.sort_by(|a, b| a.container_id.cmp(&b.container_id));
        statuses
    }

    /// Head-to-tail rate averaged over the trend windows that have data
    pub fn current_rate(&self, container_id: &str) -> Result<RateSample> {
        self.current_rate_at(container_id, Utc::now())
    }

    pub fn current_rate_at(&self, container_id: &str, now: DateTime<Utc>) -> Result<RateSample> {
        let windows: Vec<Duration> = TrendWindow::ALL
            .iter()
            .filter_map(|w| w.duration().to_std().ok())
            .collect();
        self.rates.average_rate_at(container_id, &windows, now)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Spawn the monitor and cleanup loops
    pub fn start(self: &Arc<Self>) -> EngineTasks {
        EngineTasks {
            monitor: tokio::spawn(Arc::clone(self).run_monitor_loop()),
            cleanup: tokio::spawn(Arc::clone(self).run_cleanup_loop()),
        }
    }

    /// Signal both loops to exit; safe to call more than once
    ///
    /// In-flight kubelet requests and cgroup writes run to completion.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.send_replace(true);
        info!("Stopping SmartLimit engine");
    }

    async fn run_monitor_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            return;
        }

        info!(
            interval_secs = self.config.monitor_interval_secs,
            "Starting I/O monitor loop"
        );
        let mut ticker = interval(self.config.monitor_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.tick(Utc::now()).await;
                    debug!(
                        samples = report.samples,
                        applied = report.applied,
                        released = report.released,
                        errors = report.errors,
                        "Monitor tick complete"
                    );
                }
                _ = shutdown.changed() => {
                    info!("Shutting down I/O monitor loop");
                    break;
                }
            }
        }
    }

    async fn run_cleanup_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            return;
        }

        let mut ticker = interval(self.config.cleanup_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick fires immediately and there is nothing to clean yet
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.cleanup(Utc::now()).await;
                }
                _ = shutdown.changed() => {
                    info!("Shutting down history cleanup loop");
                    break;
                }
            }
        }
    }

    /// One monitor pass: collect, then analyze and act
    pub async fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();

        let pods = match self.pods.list_node_pods().await {
            Ok(pods) => {
                self.set_health(Component::Kubernetes, None).await;
                pods
            }
            Err(e) => {
                warn!(error = %e, "Failed to list node pods, skipping tick");
                self.set_health(Component::Kubernetes, Some(format!("{e:#}")))
                    .await;
                report.errors += 1;
                return report;
            }
        };

        match self.collect(&pods, now).await {
            Ok(samples) => report.samples = samples,
            Err(_) => report.errors += 1,
        }

        let outcome = self.analyze_and_limit(now).await;
        report.applied = outcome.applied;
        report.released = outcome.released;
        report.errors += outcome.errors;

        if let Some(metrics) = &self.metrics {
            metrics.set_containers_monitored(self.history.len() as i64);
            metrics.set_containers_limited(self.statuses.len() as i64);
        }
        report
    }

    /// Collect one sample per non-excluded container into history
    pub async fn collect(&self, pods: &[PodInfo], now: DateTime<Utc>) -> Result<usize> {
        let monitored: Vec<PodInfo> = pods
            .iter()
            .filter(|pod| !self.policy.is_excluded(pod))
            .cloned()
            .collect();

        let start = Instant::now();
        let result = self.collector.collect(&monitored, now).await;
        if let Some(metrics) = &self.metrics {
            metrics.observe_collection_latency(start.elapsed().as_secs_f64());
        }

        let collection = match result {
            Ok(collection) => collection,
            Err(e) => {
                warn!(error = %e, "I/O collection failed");
                if let Some(metrics) = &self.metrics {
                    metrics.inc_collection_errors();
                }
                self.set_health(Component::Collector, Some(e.to_string()))
                    .await;
                return Err(e);
            }
        };

        if collection.strategy == CollectionStrategy::Cadvisor {
            if let Some(metrics) = &self.metrics {
                metrics.inc_fallback_collections();
            }
        }
        self.set_health(Component::Collector, None).await;

        let count = collection.samples.len();
        for sample in collection.samples {
            self.rates.record(&sample.container_id, sample.stats.clone());
            self.history.append(
                &sample.container_id,
                &sample.pod_name,
                &sample.namespace,
                sample.stats,
            );
        }

        debug!(samples = count, strategy = %collection.strategy, "Recorded I/O samples");
        Ok(count)
    }

    /// Evaluate every tracked container against the thresholds
    pub async fn analyze_and_limit(&self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();

        for (history, trend) in self.history.trend_all(now) {
            let id = history.container_id.as_str();

            // Guard released before any await
            let release = self
                .statuses
                .get_mut(id)
                .map(|mut status| evaluate_release(&mut status, &trend, &self.config, now));

            match release {
                Some(ReleaseDecision::Release) => match self.remove_limit(id, now).await {
                    Ok(()) => report.released += 1,
                    Err(e) => {
                        self.report_failure("remove", id, &history.pod_name, &history.namespace, &e);
                        report.errors += 1;
                    }
                },
                Some(ReleaseDecision::Cooling) => {
                    debug!(container_id = %id, "Below release threshold, waiting out delay");
                }
                Some(ReleaseDecision::Hold | ReleaseDecision::NotDue) => {}
                None => {
                    let Some(trigger) = should_apply_limit(&trend, &self.config) else {
                        continue;
                    };
                    match self
                        .apply_limit(id, &history.pod_name, &history.namespace, &trend, trigger, now)
                        .await
                    {
                        Ok(_) => report.applied += 1,
                        Err(e) => {
                            self.report_failure(
                                "apply",
                                id,
                                &history.pod_name,
                                &history.namespace,
                                &e,
                            );
                            report.errors += 1;
                        }
                    }
                }
            }
        }

        report
    }

    /// Throttle a container and record the decision
    ///
    /// Nothing is recorded unless the cgroup write succeeds. An annotation
    /// failure leaves the limit in place and is only logged.
    pub async fn apply_limit(
        &self,
        container_id: &str,
        pod_name: &str,
        namespace: &str,
        trend: &IoTrend,
        trigger: LimitTrigger,
        now: DateTime<Utc>,
    ) -> Result<LimitStatus> {
        let limits = self.config.limits(trigger.window);
        let endpoint = self.endpoint(container_id).await?;

        let written = self.limiter.set_limits(&endpoint, &limits).await;
        self.set_health(Component::Limiter, written.as_ref().err().map(ToString::to_string))
            .await;
        written?;

        if let Ok(rate) = self.current_rate_at(container_id, now) {
            debug!(
                container_id = %container_id,
                read_iops = rate.read_iops,
                write_iops = rate.write_iops,
                read_bps = rate.read_bps,
                write_bps = rate.write_bps,
                "Current I/O rate at limit time"
            );
        }

        let status = LimitStatus {
            container_id: container_id.to_string(),
            pod_name: pod_name.to_string(),
            namespace: namespace.to_string(),
            is_limited: true,
            triggered_by: trigger.window.label().to_string(),
            trigger_reason: trigger.to_string(),
            limit_result: limits,
            applied_at: now,
            last_check_at: now,
            below_threshold_since: None,
        };
        self.statuses
            .insert(container_id.to_string(), status.clone());

        if let Some(metrics) = &self.metrics {
            metrics.inc_limits_applied();
        }
        self.logger.log_limit_applied(
            container_id,
            pod_name,
            namespace,
            &status.triggered_by,
            &status.trigger_reason,
            &limits,
        );

        if let Err(e) = self.persist_limit(&status, trend).await {
            self.report_failure("annotate", container_id, pod_name, namespace, &e);
        }

        Ok(status)
    }

    /// Lift a container's throttle and mark the release in annotations
    ///
    /// A container the runtime no longer knows has no cgroup left to reset.
    pub async fn remove_limit(&self, container_id: &str, now: DateTime<Utc>) -> Result<()> {
        let Some(status) = self.limit_status(container_id) else {
            return Ok(());
        };

        match self.endpoint(container_id).await {
            Ok(endpoint) => {
                let written = self.limiter.reset_limits(&endpoint).await;
                self.set_health(Component::Limiter, written.as_ref().err().map(ToString::to_string))
                    .await;
                written?;
            }
            Err(SmartLimitError::UnknownContainer { .. }) => {
                debug!(container_id = %container_id, "Container gone, nothing to reset");
            }
            Err(e) => return Err(e),
        }

        self.statuses.remove(container_id);
        if let Some(metrics) = &self.metrics {
            metrics.inc_limits_removed();
        }
        self.logger.log_limit_removed(
            container_id,
            &status.pod_name,
            &status.namespace,
            (now - status.applied_at).num_seconds(),
        );

        if let Err(e) = self.persist_release(&status).await {
            self.report_failure(
                "annotate",
                container_id,
                &status.pod_name,
                &status.namespace,
                &e,
            );
        }
        Ok(())
    }

    /// Rebuild limit state from the annotations of this node's pods
    ///
    /// cgroups are not rewritten; the throttles applied before the restart
    /// are assumed to still be in place. Returns the number restored.
    pub async fn restore_limit_status(&self) -> Result<usize> {
        self.restore_limit_status_at(Utc::now()).await
    }

    pub async fn restore_limit_status_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let pods = self.pods.list_node_pods().await.map_err(|e| {
            SmartLimitError::Kubernetes {
                namespace: String::new(),
                pod_name: String::new(),
                message: format!("{e:#}"),
            }
        })?;

        let prefix = &self.config.annotation_prefix;
        let mut restored = 0;

        for pod in &pods {
            if !has_prefix(&pod.annotations, prefix) || is_limit_removed(&pod.annotations, prefix)
            {
                continue;
            }

            let ids = limited_container_ids(&pod.annotations, prefix).unwrap_or_else(|| {
                pod.containers
                    .iter()
                    .filter(|c| !c.container_id.is_empty())
                    .map(|c| c.container_id.clone())
                    .collect()
            });

            for id in ids {
                let status =
                    decode_limit(&pod.annotations, prefix, &id, &pod.name, &pod.namespace, now);
                self.verify_restored(&status).await;

                if let Some(metrics) = &self.metrics {
                    metrics.inc_limits_restored();
                }
                self.logger.log_limit_restored(
                    &id,
                    &pod.name,
                    &pod.namespace,
                    &status.triggered_by,
                    &status.limit_result,
                );
                self.statuses.insert(id, status);
                restored += 1;
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.set_containers_limited(self.statuses.len() as i64);
        }
        info!(restored, pods = pods.len(), "Restored limit status from annotations");
        Ok(restored)
    }

    /// Drop idle histories and old rate samples, then release orphaned limits
    ///
    /// A limit is orphaned when its container's history was just evicted, or
    /// when no sample has arrived for it within the retention window since it
    /// was last checked or restored. Release goes through [`Self::remove_limit`]
    /// so the Pod annotations are updated as well; a failed release still drops
    /// the in-memory state.
    pub async fn cleanup(&self, now: DateTime<Utc>) -> Vec<String> {
        let retention = self.history.retention();
        let evicted = self.history.evict_stale(now);
        self.rates.prune_at(retention, now);

        let cutoff = window_start(now, retention);
        let orphaned: Vec<LimitStatus> = self
            .statuses
            .iter()
            .filter(|s| {
                evicted.contains(s.key())
                    || (!self.history.contains(s.key()) && s.last_check_at < cutoff)
            })
            .map(|s| s.value().clone())
            .collect();

        for status in &orphaned {
            let id = status.container_id.as_str();
            debug!(container_id = %id, "Releasing limit of container without recent samples");
            if let Err(e) = self.remove_limit(id, now).await {
                self.statuses.remove(id);
                self.report_failure("remove", id, &status.pod_name, &status.namespace, &e);
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.set_containers_monitored(self.history.len() as i64);
            metrics.set_containers_limited(self.statuses.len() as i64);
        }
        if !evicted.is_empty() || !orphaned.is_empty() {
            info!(
                evicted = evicted.len(),
                released = orphaned.len(),
                "Cleaned up stale container state"
            );
        }
        evicted
    }

    /// Resolve where a container's throttles live
    async fn endpoint(&self, container_id: &str) -> Result<CgroupEndpoint> {
        let parent = self
            .runtime
            .cgroup_parent(container_id)
            .await
            .map_err(|e| SmartLimitError::Runtime {
                container_id: container_id.to_string(),
                message: format!("{e:#}"),
            })?
            .ok_or_else(|| SmartLimitError::UnknownContainer {
                container_id: container_id.to_string(),
            })?;

        let device = self
            .devices
            .device_for(container_id)
            .await
            .map_err(|e| SmartLimitError::DeviceUnavailable {
                container_id: container_id.to_string(),
                message: format!("{e:#}"),
            })?;

        self.limiter.endpoint(container_id, &parent, &device)
    }

    /// Warn when a restored limit does not match the cgroup on disk
    async fn verify_restored(&self, status: &LimitStatus) {
        let Ok(endpoint) = self.endpoint(&status.container_id).await else {
            return;
        };
        match self.limiter.read_limits(&endpoint).await {
            Ok(on_disk) if on_disk != status.limit_result => {
                warn!(
                    container_id = %status.container_id,
                    path = %endpoint.path.display(),
                    expected = ?status.limit_result,
                    actual = ?on_disk,
                    "Restored limit differs from cgroup state"
                );
            }
            Ok(_) => {}
            Err(e) => {
                debug!(container_id = %status.container_id, error = %e, "Could not read back limits");
            }
        }
    }

    async fn persist_limit(&self, status: &LimitStatus, trend: &IoTrend) -> Result<()> {
        let prefix = &self.config.annotation_prefix;
        let Some(pod) = self.fetch_pod(&status.namespace, &status.pod_name).await? else {
            return Ok(());
        };

        let (mut ids, mut records) = if is_limit_removed(&pod.annotations, prefix) {
            (Vec::new(), ContainerLimits::new())
        } else {
            (
                limited_container_ids(&pod.annotations, prefix).unwrap_or_default(),
                container_limits(&pod.annotations, prefix),
            )
        };
        if !ids.contains(&status.container_id) {
            ids.push(status.container_id.clone());
        }
        records.retain(|id, _| ids.contains(id));
        records.insert(status.container_id.clone(), ContainerLimit::from(status));

        let patch = encode_limit(prefix, status, trend, &ids, &records);
        self.patch_pod(&status.namespace, &status.pod_name, &patch)
            .await
    }

    async fn persist_release(&self, status: &LimitStatus) -> Result<()> {
        let prefix = &self.config.annotation_prefix;
        let Some(pod) = self.fetch_pod(&status.namespace, &status.pod_name).await? else {
            return Ok(());
        };

        let remaining: Vec<String> = limited_container_ids(&pod.annotations, prefix)
            .unwrap_or_default()
            .into_iter()
            .filter(|id| id != &status.container_id)
            .collect();
        let mut records = container_limits(&pod.annotations, prefix);
        records.retain(|id, _| remaining.contains(id));

        let patch = encode_release(prefix, &remaining, &records);
        self.patch_pod(&status.namespace, &status.pod_name, &patch)
            .await
    }

    async fn fetch_pod(&self, namespace: &str, name: &str) -> Result<Option<PodInfo>> {
        let result = self.pods.get_pod(namespace, name).await;
        if let Some(health) = &self.health {
            health.record_outcome(Component::Kubernetes, &result).await;
        }
        result.map_err(|e| kube_error(namespace, name, e))
    }

    async fn patch_pod(
        &self,
        namespace: &str,
        name: &str,
        patch: &crate::k8s::AnnotationPatch,
    ) -> Result<()> {
        self.pods
            .patch_annotations(namespace, name, patch)
            .await
            .map_err(|e| kube_error(namespace, name, e))
    }

    fn report_failure(
        &self,
        operation: &str,
        container_id: &str,
        pod_name: &str,
        namespace: &str,
        error: &SmartLimitError,
    ) {
        if let Some(metrics) = &self.metrics {
            metrics.inc_limit_errors(operation);
        }
        self.logger
            .log_limit_failure(operation, container_id, pod_name, namespace, error);
    }

    /// `None` marks the component healthy, `Some(message)` degraded
    async fn set_health(&self, component: Component, problem: Option<String>) {
        let Some(health) = &self.health else {
            return;
        };
        match problem {
            None => health.record_success(component).await,
            Some(message) => health.record_failure(component, message).await,
        }
    }
}

fn kube_error(namespace: &str, name: &str, error: anyhow::Error) -> SmartLimitError {
    SmartLimitError::Kubernetes {
        namespace: namespace.to_string(),
        pod_name: name.to_string(),
        message: format!("{error:#}"),
    }
}

/// Builder for the throttling engine
pub struct SmartLimitManagerBuilder {
    config: SmartLimitConfig,
    metrics_source: Option<Arc<dyn IoMetricsSource>>,
    pods: Option<Arc<dyn PodStore>>,
    runtime: Option<Arc<dyn ContainerRuntime>>,
    limiter: Option<CgroupLimiter>,
    devices: Option<Arc<dyn DeviceResolver>>,
    metrics: Option<AgentMetrics>,
    health: Option<HealthRegistry>,
    node_name: String,
}

impl SmartLimitManagerBuilder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Self {
            config: SmartLimitConfig::default(),
            metrics_source: None,
            pods: None,
            runtime: None,
            limiter: None,
            devices: None,
            metrics: None,
            health: None,
            node_name: String::new(),
        }
    }

    pub fn config(mut self, config: SmartLimitConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the kubelet I/O data source
    pub fn metrics_source(mut self, source: Arc<dyn IoMetricsSource>) -> Self {
        self.metrics_source = Some(source);
        self
    }

    pub fn pod_store(mut self, pods: Arc<dyn PodStore>) -> Self {
        self.pods = Some(pods);
        self
    }

    pub fn runtime(mut self, runtime: Arc<dyn ContainerRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn limiter(mut self, limiter: CgroupLimiter) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn device_resolver(mut self, devices: Arc<dyn DeviceResolver>) -> Self {
        self.devices = Some(devices);
        self
    }

    /// Set the Prometheus metrics handle (optional)
    pub fn metrics(mut self, metrics: AgentMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Set the health registry to report component status to (optional)
    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn node_name(mut self, node_name: impl Into<String>) -> Self {
        self.node_name = node_name.into();
        self
    }

    /// Build the engine; every collaborator except metrics and health is required
    pub fn build(self) -> Result<SmartLimitManager> {
        let source = self
            .metrics_source
            .ok_or(SmartLimitError::MissingDependency("metrics source"))?;
        let pods = self
            .pods
            .ok_or(SmartLimitError::MissingDependency("pod store"))?;
        let runtime = self
            .runtime
            .ok_or(SmartLimitError::MissingDependency("container runtime"))?;
        let limiter = self
            .limiter
            .ok_or(SmartLimitError::MissingDependency("cgroup limiter"))?;
        let devices = self
            .devices
            .ok_or(SmartLimitError::MissingDependency("device resolver"))?;

        let (shutdown, _) = watch::channel(false);

        Ok(SmartLimitManager {
            collector: IoCollector::new(source),
            pods,
            runtime,
            limiter,
            devices,
            policy: ExclusionPolicy::from_config(&self.config),
            history: HistoryStore::new(self.config.history_retention()),
            rates: RateCalculator::new(self.config.rate_capacity),
            statuses: DashMap::new(),
            metrics: self.metrics,
            health: self.health,
            logger: StructuredLogger::new(self.node_name),
            stopped: AtomicBool::new(false),
            shutdown,
            config: self.config,
        })
    }
}

impl Default for SmartLimitManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
