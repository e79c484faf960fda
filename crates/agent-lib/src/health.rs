//! Component health for liveness and readiness probes
//!
//! The engine reports the outcome of every collection pass, cgroup write and
//! API server call here. A failed pass marks its component degraded until the
//! next success; the agent only turns unhealthy when something is marked so
//! explicitly. Readiness additionally waits for limit state recovery.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Parts of the agent with independent failure modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Component {
    /// Kubelet I/O collection
    Collector,
    /// cgroup throttle writes
    Limiter,
    /// Pod listing and annotation updates
    Kubernetes,
}

impl Component {
    pub const ALL: [Component; 3] = [
        Component::Collector,
        Component::Limiter,
        Component::Kubernetes,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Collector => "collector",
            Component::Limiter => "limiter",
            Component::Kubernetes => "kubernetes",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered by severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// The last pass failed; the next tick retries
    Degraded,
    Unhealthy,
}

impl ComponentStatus {
    /// Returns true if the component is at least partially operational
    pub fn is_operational(&self) -> bool {
        !matches!(self, ComponentStatus::Unhealthy)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Failures since the last success
    pub consecutive_failures: u32,
    pub last_check: DateTime<Utc>,
}

impl ComponentHealth {
    fn healthy() -> Self {
        Self {
            status: ComponentStatus::Healthy,
            message: None,
            consecutive_failures: 0,
            last_check: Utc::now(),
        }
    }

    fn fail(&mut self, status: ComponentStatus, message: String) {
        self.status = status;
        self.message = Some(message);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_check = Utc::now();
    }
}

/// Body of `/healthz`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: BTreeMap<Component, ComponentHealth>,
}

impl HealthResponse {
    /// The most severe component status, healthy when there are none
    pub fn overall(components: &BTreeMap<Component, ComponentHealth>) -> ComponentStatus {
        components
            .values()
            .map(|c| c.status)
            .max()
            .unwrap_or(ComponentStatus::Healthy)
    }
}

/// Body of `/readyz`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug)]
struct RegistryState {
    components: BTreeMap<Component, ComponentHealth>,
    recovered: bool,
}

/// Shared health state; clones observe the same registry
#[derive(Debug, Clone)]
pub struct HealthRegistry {
    state: Arc<RwLock<RegistryState>>,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthRegistry {
    /// Every component starts healthy; readiness starts false
    pub fn new() -> Self {
        let components = Component::ALL
            .into_iter()
            .map(|c| (c, ComponentHealth::healthy()))
            .collect();
        Self {
            state: Arc::new(RwLock::new(RegistryState {
                components,
                recovered: false,
            })),
        }
    }

    pub async fn record_success(&self, component: Component) {
        let mut state = self.state.write().await;
        state.components.insert(component, ComponentHealth::healthy());
    }

    /// Mark a component degraded after a failed pass
    pub async fn record_failure(&self, component: Component, message: impl Into<String>) {
        self.fail(component, ComponentStatus::Degraded, message.into())
            .await;
    }

    pub async fn set_unhealthy(&self, component: Component, message: impl Into<String>) {
        self.fail(component, ComponentStatus::Unhealthy, message.into())
            .await;
    }

    /// `record_success` or `record_failure` depending on the outcome
    pub async fn record_outcome<T, E: fmt::Display>(
        &self,
        component: Component,
        outcome: &Result<T, E>,
    ) {
        match outcome {
            Ok(_) => self.record_success(component).await,
            Err(e) => self.record_failure(component, e.to_string()).await,
        }
    }

    async fn fail(&self, component: Component, status: ComponentStatus, message: String) {
        let mut state = self.state.write().await;
        state
            .components
            .entry(component)
            .or_insert_with(ComponentHealth::healthy)
            .fail(status, message);
    }

    /// Set once limit state has been recovered from annotations
    pub async fn set_ready(&self, ready: bool) {
        self.state.write().await.recovered = ready;
    }

    pub async fn component(&self, component: Component) -> Option<ComponentHealth> {
        self.state.read().await.components.get(&component).cloned()
    }

    pub async fn health(&self) -> HealthResponse {
        let components = self.state.read().await.components.clone();
        HealthResponse {
            status: HealthResponse::overall(&components),
            components,
        }
    }

    pub async fn readiness(&self) -> ReadinessResponse {
        let state = self.state.read().await;
        let reason = if !state.recovered {
            Some("Limit state not yet restored".to_string())
        } else {
            state
                .components
                .iter()
                .find(|(_, h)| !h.status.is_operational())
                .map(|(c, _)| format!("Component {c} unhealthy"))
        };

        ReadinessResponse {
            ready: reason.is_none(),
            reason,
        }
    }
}
