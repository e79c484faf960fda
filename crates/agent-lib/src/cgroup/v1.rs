//! cgroup v1 blkio throttling
//!
//! The legacy hierarchy keeps one file per throttled metric:
//! - blkio.throttle.read_iops_device
//! - blkio.throttle.write_iops_device
//! - blkio.throttle.read_bps_device
//! - blkio.throttle.write_bps_device
//!
//! Each line is `<major>:<minor> <value>`; writing a value of 0 removes the
//! rule for that device.

use crate::error::{Result, SmartLimitError};
use crate::models::LimitResult;
use anyhow::Context;
use std::io::ErrorKind;
use std::path::Path;
use tokio::fs;
use tracing::debug;

pub const READ_IOPS_FILE: &str = "blkio.throttle.read_iops_device";
pub const WRITE_IOPS_FILE: &str = "blkio.throttle.write_iops_device";
pub const READ_BPS_FILE: &str = "blkio.throttle.read_bps_device";
pub const WRITE_BPS_FILE: &str = "blkio.throttle.write_bps_device";

/// Write every non-zero limit to its throttle file
pub async fn write_limits(cgroup_path: &Path, device: &str, limits: &LimitResult) -> Result<()> {
    for (file, value) in files_for(limits) {
        if value == 0 {
            continue;
        }
        write_rule(cgroup_path, file, device, value).await?;
    }
    Ok(())
}

/// Remove the throttle rule for `device` from all four files
pub async fn clear_limits(cgroup_path: &Path, device: &str) -> Result<()> {
    for (file, _) in files_for(&LimitResult::default()) {
        write_rule(cgroup_path, file, device, 0).await?;
    }
    Ok(())
}

/// Read the rules currently in effect for `device`
///
/// A missing throttle file means no rule; a missing cgroup directory is an error.
pub async fn read_limits(cgroup_path: &Path, device: &str) -> anyhow::Result<LimitResult> {
    fs::metadata(cgroup_path)
        .await
        .with_context(|| format!("Failed to stat cgroup {}", cgroup_path.display()))?;

    let mut limits = LimitResult::default();
    for file in [READ_IOPS_FILE, WRITE_IOPS_FILE, READ_BPS_FILE, WRITE_BPS_FILE] {
        let path = cgroup_path.join(file);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => String::new(),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()))
            }
        };
        let value = parse_device_value(&content, device).unwrap_or(0);
        match file {
            READ_IOPS_FILE => limits.read_iops = value,
            WRITE_IOPS_FILE => limits.write_iops = value,
            READ_BPS_FILE => limits.read_bps = value,
            _ => limits.write_bps = value,
        }
    }
    Ok(limits)
}

/// Find `device`'s value in `<major>:<minor> <value>` lines
pub fn parse_device_value(content: &str, device: &str) -> Option<u64> {
    content.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some(dev), Some(value)) if dev == device => value.parse().ok(),
            _ => None,
        }
    })
}

fn files_for(limits: &LimitResult) -> [(&'static str, u64); 4] {
    [
        (READ_IOPS_FILE, limits.read_iops),
        (WRITE_IOPS_FILE, limits.write_iops),
        (READ_BPS_FILE, limits.read_bps),
        (WRITE_BPS_FILE, limits.write_bps),
    ]
}

async fn write_rule(cgroup_path: &Path, file: &str, device: &str, value: u64) -> Result<()> {
    let path = cgroup_path.join(file);
    let line = format!("{device} {value}");
    fs::write(&path, &line)
        .await
        .map_err(|source| SmartLimitError::CgroupWrite {
            path: path.clone(),
            source,
        })?;
    debug!(path = %path.display(), rule = %line, "Wrote blkio throttle rule");
    Ok(())
}
