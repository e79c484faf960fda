//! Adaptive I/O throttling
//!
//! Decides when a container's sustained block I/O warrants a cgroup throttle
//! and when it has been quiet long enough to lift it again.

mod config;
pub mod decision;
mod manager;
mod policy;

#[cfg(test)]
mod tests;

pub use config::{SmartLimitConfig, Thresholds, WindowPolicies, WindowPolicy};
pub use decision::{
    evaluate_release, is_below_release_threshold, should_apply_limit, LimitTrigger,
    ReleaseDecision,
};
pub use manager::{EngineTasks, SmartLimitManager, SmartLimitManagerBuilder, TickReport};
pub use policy::ExclusionPolicy;
