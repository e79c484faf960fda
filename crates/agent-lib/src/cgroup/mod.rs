//! cgroup limit control
//!
//! Resolves a container's control directory and writes or clears block I/O
//! throttles. Supports both cgroup v2 (unified hierarchy, `io.max`) and
//! cgroup v1 (`blkio` subsystem) with automatic detection.

mod device;
mod path;
mod v1;
mod v2;

#[cfg(test)]
mod tests;

pub use device::{DeviceResolver, MountinfoDeviceResolver, StaticDevice};
pub use path::{
    convert_systemd_cgroup_path, expand_slice, is_systemd_cgroup_path, resolve_path,
    systemd_cgroup_path, BLKIO_SUBSYSTEM, DEFAULT_CGROUP_ROOT,
};
pub use v1::parse_device_value;
pub use v2::{format_io_max, format_io_max_reset, parse_io_max};

use crate::error::Result;
use crate::models::{CgroupEndpoint, CgroupVersion, LimitResult};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::info;

/// Detect which cgroup version is mounted at `cgroup_root`
pub async fn detect_cgroup_version(cgroup_root: &Path) -> Option<CgroupVersion> {
    // cgroup v2 unified hierarchy exposes cgroup.controllers at the root
    let v2_controllers = cgroup_root.join("cgroup.controllers");
    if fs::metadata(&v2_controllers).await.is_ok() {
        return Some(CgroupVersion::V2);
    }

    let v1_blkio = cgroup_root.join(BLKIO_SUBSYSTEM);
    if fs::metadata(&v1_blkio).await.is_ok() {
        return Some(CgroupVersion::V1);
    }

    None
}

/// Writes and clears I/O throttles under one cgroup mount
#[derive(Debug, Clone)]
pub struct CgroupLimiter {
    root: PathBuf,
    version: CgroupVersion,
}

impl CgroupLimiter {
    pub fn new(root: impl Into<PathBuf>, version: CgroupVersion) -> Self {
        Self {
            root: root.into(),
            version,
        }
    }

    /// Create a limiter for the version detected at `root`, defaulting to v2
    pub async fn detect(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let version = match detect_cgroup_version(&root).await {
            Some(version) => {
                info!(version = %version, root = %root.display(), "Detected cgroup version");
                version
            }
            None => {
                tracing::warn!(root = %root.display(), "Could not detect cgroup version, defaulting to v2");
                CgroupVersion::V2
            }
        };
        Self::new(root, version)
    }

    pub fn version(&self) -> CgroupVersion {
        self.version
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve the control directory for a container
    pub fn resolve_path(&self, container_id: &str, cgroup_parent: &str) -> Result<PathBuf> {
        resolve_path(&self.root, self.version, container_id, cgroup_parent)
    }

    /// Resolve a full endpoint for a limit operation
    pub fn endpoint(
        &self,
        container_id: &str,
        cgroup_parent: &str,
        device: &str,
    ) -> Result<CgroupEndpoint> {
        Ok(CgroupEndpoint {
            version: self.version,
            path: self.resolve_path(container_id, cgroup_parent)?,
            device: device.to_string(),
        })
    }

    /// Apply the non-zero limits; zero leaves that direction unlimited
    pub async fn set_limits(&self, endpoint: &CgroupEndpoint, limits: &LimitResult) -> Result<()> {
        match endpoint.version {
            CgroupVersion::V1 => v1::write_limits(&endpoint.path, &endpoint.device, limits).await,
            CgroupVersion::V2 => v2::write_limits(&endpoint.path, &endpoint.device, limits).await,
        }
    }

    /// Lift every throttle for the endpoint's device
    pub async fn reset_limits(&self, endpoint: &CgroupEndpoint) -> Result<()> {
        match endpoint.version {
            CgroupVersion::V1 => v1::clear_limits(&endpoint.path, &endpoint.device).await,
            CgroupVersion::V2 => v2::clear_limits(&endpoint.path, &endpoint.device).await,
        }
    }

    /// Read the throttles currently written for the endpoint's device
    pub async fn read_limits(&self, endpoint: &CgroupEndpoint) -> anyhow::Result<LimitResult> {
        match endpoint.version {
            CgroupVersion::V1 => v1::read_limits(&endpoint.path, &endpoint.device).await,
            CgroupVersion::V2 => v2::read_limits(&endpoint.path, &endpoint.device).await,
        }
    }
}
