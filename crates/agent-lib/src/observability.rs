//! Observability infrastructure for the throttling agent
//!
//! Provides:
//! - Prometheus self-metrics (collection latency, monitored/limited containers, limit actions)
//! - Structured JSON logging of limit lifecycle events with tracing

use crate::models::LimitResult;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;
use tracing::{info, warn};

/// Histogram buckets for collection latency (in seconds)
const LATENCY_BUCKETS: &[f64] = &[0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];

struct AgentMetricsInner {
    collection_latency_seconds: Histogram,
    containers_monitored: IntGauge,
    containers_limited: IntGauge,
    limits_applied: IntCounter,
    limits_removed: IntCounter,
    limits_restored: IntCounter,
    collection_errors: IntCounter,
    limit_errors: IntCounterVec,
    fallback_collections: IntCounter,
}

/// Agent metrics for Prometheus exposition
///
/// Clones share the same underlying metrics and registry.
#[derive(Clone)]
pub struct AgentMetrics {
    registry: Registry,
    inner: Arc<AgentMetricsInner>,
}

impl AgentMetrics {
    /// Create the metrics and register them in a fresh registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let inner = AgentMetricsInner {
            collection_latency_seconds: Histogram::with_opts(
                HistogramOpts::new(
                    "smartlimit_collection_latency_seconds",
                    "Time spent collecting I/O counters from the kubelet",
                )
                .buckets(LATENCY_BUCKETS.to_vec()),
            )?,
            containers_monitored: IntGauge::new(
                "smartlimit_containers_monitored",
                "Number of containers with I/O history",
            )?,
            containers_limited: IntGauge::new(
                "smartlimit_containers_limited",
                "Number of containers currently throttled",
            )?,
            limits_applied: IntCounter::new(
                "smartlimit_limits_applied_total",
                "Total number of I/O limits applied",
            )?,
            limits_removed: IntCounter::new(
                "smartlimit_limits_removed_total",
                "Total number of I/O limits released",
            )?,
            limits_restored: IntCounter::new(
                "smartlimit_limits_restored_total",
                "Total number of limit states restored from annotations",
            )?,
            collection_errors: IntCounter::new(
                "smartlimit_collection_errors_total",
                "Total number of failed collection passes",
            )?,
            limit_errors: IntCounterVec::new(
                Opts::new(
                    "smartlimit_limit_errors_total",
                    "Total number of failed limit operations",
                ),
                &["operation"],
            )?,
            fallback_collections: IntCounter::new(
                "smartlimit_fallback_collections_total",
                "Total number of collections served by cAdvisor fallback",
            )?,
        };

        registry.register(Box::new(inner.collection_latency_seconds.clone()))?;
        registry.register(Box::new(inner.containers_monitored.clone()))?;
        registry.register(Box::new(inner.containers_limited.clone()))?;
        registry.register(Box::new(inner.limits_applied.clone()))?;
        registry.register(Box::new(inner.limits_removed.clone()))?;
        registry.register(Box::new(inner.limits_restored.clone()))?;
        registry.register(Box::new(inner.collection_errors.clone()))?;
        registry.register(Box::new(inner.limit_errors.clone()))?;
        registry.register(Box::new(inner.fallback_collections.clone()))?;

        Ok(Self {
            registry,
            inner: Arc::new(inner),
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render all metrics in the Prometheus text format
    pub fn encode(&self) -> prometheus::Result<Vec<u8>> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }

    /// Record a collection latency observation
    pub fn observe_collection_latency(&self, duration_secs: f64) {
        self.inner.collection_latency_seconds.observe(duration_secs);
    }

    pub fn set_containers_monitored(&self, count: i64) {
        self.inner.containers_monitored.set(count);
    }

    pub fn set_containers_limited(&self, count: i64) {
        self.inner.containers_limited.set(count);
    }

    pub fn inc_limits_applied(&self) {
        self.inner.limits_applied.inc();
    }

    pub fn inc_limits_removed(&self) {
        self.inner.limits_removed.inc();
    }

    pub fn inc_limits_restored(&self) {
        self.inner.limits_restored.inc();
    }

    pub fn inc_collection_errors(&self) {
        self.inner.collection_errors.inc();
    }

    /// Count a failed `apply`, `remove` or `annotate` operation
    pub fn inc_limit_errors(&self, operation: &str) {
        self.inner
            .limit_errors
            .with_label_values(&[operation])
            .inc();
    }

    pub fn inc_fallback_collections(&self) {
        self.inner.fallback_collections.inc();
    }
}

/// Structured logger for agent events
///
/// Provides consistent JSON-formatted logging for limit actions and other
/// significant events.
#[derive(Clone)]
pub struct StructuredLogger {
    node_name: String,
}

impl StructuredLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    /// Log a newly applied limit
    pub fn log_limit_applied(
        &self,
        container_id: &str,
        pod_name: &str,
        namespace: &str,
        triggered_by: &str,
        reason: &str,
        limits: &LimitResult,
    ) {
        info!(
            event = "limit_applied",
            node = %self.node_name,
            container_id = %container_id,
            pod_name = %pod_name,
            namespace = %namespace,
            triggered_by = %triggered_by,
            reason = %reason,
            read_iops = limits.read_iops,
            write_iops = limits.write_iops,
            read_bps = limits.read_bps,
            write_bps = limits.write_bps,
            "Applied I/O limit"
        );
    }

    /// Log a released limit
    pub fn log_limit_removed(
        &self,
        container_id: &str,
        pod_name: &str,
        namespace: &str,
        limited_secs: i64,
    ) {
        info!(
            event = "limit_removed",
            node = %self.node_name,
            container_id = %container_id,
            pod_name = %pod_name,
            namespace = %namespace,
            limited_secs = limited_secs,
            "Removed I/O limit"
        );
    }

    /// Log a limit state rebuilt from annotations
    pub fn log_limit_restored(
        &self,
        container_id: &str,
        pod_name: &str,
        namespace: &str,
        triggered_by: &str,
        limits: &LimitResult,
    ) {
        info!(
            event = "limit_restored",
            node = %self.node_name,
            container_id = %container_id,
            pod_name = %pod_name,
            namespace = %namespace,
            triggered_by = %triggered_by,
            read_iops = limits.read_iops,
            write_iops = limits.write_iops,
            read_bps = limits.read_bps,
            write_bps = limits.write_bps,
            "Restored I/O limit state"
        );
    }

    /// Log a limit operation that failed and will be retried next tick
    pub fn log_limit_failure(
        &self,
        operation: &str,
        container_id: &str,
        pod_name: &str,
        namespace: &str,
        error: &dyn std::fmt::Display,
    ) {
        warn!(
            event = "limit_failed",
            node = %self.node_name,
            operation = %operation,
            container_id = %container_id,
            pod_name = %pod_name,
            namespace = %namespace,
            error = %error,
            "I/O limit operation failed"
        );
    }

    /// Log agent startup
    pub fn log_startup(&self, version: &str, cgroup_version: &str) {
        info!(
            event = "agent_started",
            node = %self.node_name,
            agent_version = %version,
            cgroup_version = %cgroup_version,
            "SmartLimit agent started"
        );
    }

    /// Log agent shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            node = %self.node_name,
            reason = %reason,
            "SmartLimit agent shutting down"
        );
    }
}
