//! Error taxonomy for the throttling engine
//!
//! Every variant is local to a single container. The engine logs it with the
//! container identity and moves on to the next container; nothing here aborts
//! a monitor tick.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors produced by the rate, trend, cgroup and decision layers
#[derive(Debug, Error)]
pub enum SmartLimitError {
    /// Fewer than two usable samples inside a window
    #[error("insufficient data for container {container_id} over {window:?}")]
    InsufficientData {
        container_id: String,
        window: Duration,
    },

    /// Every requested window was insufficient
    #[error("no valid rate data for container {container_id}")]
    NoValidData { container_id: String },

    /// A cgroup parent spec could not be decoded
    #[error("invalid cgroup spec {spec:?}: {reason}")]
    InvalidCgroupSpec { spec: String, reason: String },

    /// Writing a cgroup control file failed
    #[error("failed to write {}: {source}", path.display())]
    CgroupWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Both kubelet collection strategies failed
    #[error("external I/O data unavailable: {message}")]
    ExternalDataUnavailable { message: String },

    /// The container runtime has no record of the container
    #[error("container {container_id} not known to the runtime")]
    UnknownContainer { container_id: String },

    /// Reading the runtime's record of a container failed
    #[error("runtime lookup failed for container {container_id}: {message}")]
    Runtime {
        container_id: String,
        message: String,
    },

    /// No block device could be determined for the container's throttles
    #[error("no block device for container {container_id}: {message}")]
    DeviceUnavailable {
        container_id: String,
        message: String,
    },

    /// Kubernetes API call failed
    #[error("kubernetes API error for {namespace}/{pod_name}: {message}")]
    Kubernetes {
        namespace: String,
        pod_name: String,
        message: String,
    },

    /// Engine constructed without a required collaborator
    #[error("missing required dependency: {0}")]
    MissingDependency(&'static str),
}

pub type Result<T> = std::result::Result<T, SmartLimitError>;
