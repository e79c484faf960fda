//! SmartLimit agent library
//!
//! This crate provides the core functionality for:
//! - Block I/O collection from the kubelet (summary API with cAdvisor fallback)
//! - Rate and multi-window trend analysis
//! - Adaptive cgroup throttling with hysteresis on release
//! - Limit state persistence in Pod annotations
//! - Health checks and observability

pub mod cgroup;
pub mod collector;
pub mod error;
pub mod health;
pub mod history;
pub mod k8s;
pub mod models;
pub mod observability;
pub mod rate;
pub mod runtime;
pub mod smartlimit;

pub use error::{Result, SmartLimitError};
pub use health::{
    Component, ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse,
    ReadinessResponse,
};
pub use models::*;
pub use observability::{AgentMetrics, StructuredLogger};
pub use smartlimit::{SmartLimitConfig, SmartLimitManager};
