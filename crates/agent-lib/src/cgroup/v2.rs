//! cgroup v2 io.max throttling
//!
//! The unified hierarchy takes a single `io.max` line per device:
//! `<major>:<minor> riops=<v> wiops=<v> rbps=<v> wbps=<v>`. Keys left out
//! keep their current setting; `max` means unlimited.

use crate::error::{Result, SmartLimitError};
use crate::models::LimitResult;
use anyhow::Context;
use std::path::Path;
use tokio::fs;
use tracing::debug;

pub const IO_MAX_FILE: &str = "io.max";

/// Format an io.max line carrying only the non-zero limits
///
/// Returns `None` when every limit is zero, since io.max needs at least one key.
pub fn format_io_max(device: &str, limits: &LimitResult) -> Option<String> {
    let keys: Vec<String> = [
        ("riops", limits.read_iops),
        ("wiops", limits.write_iops),
        ("rbps", limits.read_bps),
        ("wbps", limits.write_bps),
    ]
    .into_iter()
    .filter(|(_, value)| *value > 0)
    .map(|(key, value)| format!("{key}={value}"))
    .collect();

    if keys.is_empty() {
        return None;
    }

    Some(format!("{device} {}", keys.join(" ")))
}

/// Line that lifts every limit for `device`
pub fn format_io_max_reset(device: &str) -> String {
    format!("{device} riops=max wiops=max rbps=max wbps=max")
}

/// Parse `device`'s entry in io.max contents; `max` reads as 0 (unlimited)
pub fn parse_io_max(content: &str, device: &str) -> Option<LimitResult> {
    let line = content
        .lines()
        .find(|line| line.split_whitespace().next() == Some(device))?;

    let mut limits = LimitResult::default();
    for pair in line.split_whitespace().skip(1) {
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        let value = value.parse::<u64>().unwrap_or(0);
        match key {
            "riops" => limits.read_iops = value,
            "wiops" => limits.write_iops = value,
            "rbps" => limits.read_bps = value,
            "wbps" => limits.write_bps = value,
            _ => {}
        }
    }

    Some(limits)
}

pub async fn write_limits(cgroup_path: &Path, device: &str, limits: &LimitResult) -> Result<()> {
    match format_io_max(device, limits) {
        Some(line) => write_io_max(cgroup_path, &line).await,
        None => {
            debug!(path = %cgroup_path.display(), "No non-zero limits, leaving io.max untouched");
            Ok(())
        }
    }
}

pub async fn clear_limits(cgroup_path: &Path, device: &str) -> Result<()> {
    write_io_max(cgroup_path, &format_io_max_reset(device)).await
}

/// Parse the device's current io.max line; no line means unlimited
pub async fn read_limits(cgroup_path: &Path, device: &str) -> anyhow::Result<LimitResult> {
    let path = cgroup_path.join(IO_MAX_FILE);
    let content = fs::read_to_string(&path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(parse_io_max(&content, device).unwrap_or_default())
}

async fn write_io_max(cgroup_path: &Path, line: &str) -> Result<()> {
    let path = cgroup_path.join(IO_MAX_FILE);
    fs::write(&path, line)
        .await
        .map_err(|source| SmartLimitError::CgroupWrite {
            path: path.clone(),
            source,
        })?;
    debug!(path = %path.display(), line = %line, "Wrote io.max");
    Ok(())
}
