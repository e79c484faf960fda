//! Block device resolution for throttle rules
//!
//! Throttle files are keyed by `major:minor`. The device is either configured
//! explicitly or derived from the filesystem holding the container runtime's
//! data directory.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::OnceCell;
use tracing::debug;

/// Supplies the `major:minor` device a container's I/O lands on
#[async_trait]
pub trait DeviceResolver: Send + Sync {
    async fn device_for(&self, container_id: &str) -> Result<String>;
}

/// Fixed device from configuration
#[derive(Debug, Clone)]
pub struct StaticDevice(String);

impl StaticDevice {
    pub fn new(device: impl Into<String>) -> Result<Self> {
        let device = device.into();
        parse_major_minor(&device)
            .with_context(|| format!("Invalid device identifier {device:?}"))?;
        Ok(Self(device))
    }
}

#[async_trait]
impl DeviceResolver for StaticDevice {
    async fn device_for(&self, _container_id: &str) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// Resolves the whole-disk device backing a data directory
///
/// The lookup runs once and is cached: every container on the node writes
/// through the same runtime data directory.
pub struct MountinfoDeviceResolver {
    data_root: PathBuf,
    mountinfo_path: PathBuf,
    sys_root: PathBuf,
    resolved: OnceCell<String>,
}

impl MountinfoDeviceResolver {
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self::with_paths(data_root, "/proc/self/mountinfo", "/sys")
    }

    /// Create resolver with custom proc/sys locations (for testing)
    pub fn with_paths(
        data_root: impl Into<PathBuf>,
        mountinfo_path: impl Into<PathBuf>,
        sys_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            data_root: data_root.into(),
            mountinfo_path: mountinfo_path.into(),
            sys_root: sys_root.into(),
            resolved: OnceCell::new(),
        }
    }

    async fn resolve(&self) -> Result<String> {
        let content = fs::read_to_string(&self.mountinfo_path)
            .await
            .with_context(|| format!("Failed to read {}", self.mountinfo_path.display()))?;

        let device = find_mount_device(&content, &self.data_root).with_context(|| {
            format!("No mount found for {}", self.data_root.display())
        })?;

        let (major, _) = parse_major_minor(&device)?;
        if major == 0 {
            anyhow::bail!(
                "{} is not backed by a block device ({})",
                self.data_root.display(),
                device
            );
        }

        let disk = self.whole_disk(&device).await.unwrap_or(device);
        debug!(data_root = %self.data_root.display(), device = %disk, "Resolved block device");
        Ok(disk)
    }

    /// Partitions cannot carry throttles; map them to the parent disk
    async fn whole_disk(&self, device: &str) -> Option<String> {
        let dev_dir = self.sys_root.join("dev/block").join(device);
        if fs::metadata(dev_dir.join("partition")).await.is_err() {
            return Some(device.to_string());
        }

        let real = fs::canonicalize(&dev_dir).await.ok()?;
        let parent_dev = real.parent()?.join("dev");
        let content = fs::read_to_string(parent_dev).await.ok()?;
        Some(content.trim().to_string())
    }
}

#[async_trait]
impl DeviceResolver for MountinfoDeviceResolver {
    async fn device_for(&self, _container_id: &str) -> Result<String> {
        self.resolved
            .get_or_try_init(|| self.resolve())
            .await
            .cloned()
    }
}

/// Find the `major:minor` of the longest mount point containing `path`
///
/// mountinfo fields: `id parent major:minor root mount_point ...`
pub fn find_mount_device(mountinfo: &str, path: &Path) -> Option<String> {
    mountinfo
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 5 {
                return None;
            }
            let mount_point = PathBuf::from(unescape_mount_path(fields[4]));
            path.starts_with(&mount_point)
                .then(|| (mount_point.components().count(), fields[2].to_string()))
        })
        .max_by_key(|(depth, _)| *depth)
        .map(|(_, device)| device)
}

/// Parse `major:minor`
pub fn parse_major_minor(device: &str) -> Result<(u32, u32)> {
    let (major, minor) = device
        .split_once(':')
        .with_context(|| format!("Missing ':' in device {device:?}"))?;
    Ok((
        major.trim().parse().context("Invalid major number")?,
        minor.trim().parse().context("Invalid minor number")?,
    ))
}

/// mountinfo escapes space, tab, newline and backslash as octal
fn unescape_mount_path(raw: &str) -> String {
    raw.replace("\\040", " ")
        .replace("\\011", "\t")
        .replace("\\012", "\n")
        .replace("\\134", "\\")
}
