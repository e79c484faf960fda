//! cgroup control-directory resolution
//!
//! Container runtimes describe a container's cgroup in one of two ways:
//!
//! - a plain parent path (`/kubepods/besteffort/pod<uid>` or
//!   `kubepods/burstable/pod<uid>`) to which the container ID is appended;
//! - a systemd triple `<slice>.slice:<prefix>:<id>`, where the dash-joined
//!   slice name encodes one nesting level per segment
//!   (`kubelet-kubepods-besteffort.slice` lives under
//!   `kubelet.slice/kubelet-kubepods.slice/`) and the container itself is a
//!   `<prefix>-<id>.scope` unit.

use crate::error::{Result, SmartLimitError};
use crate::models::CgroupVersion;
use std::path::{Path, PathBuf};

/// Default cgroup mount point
pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// v1 subsystem holding the throttle files
pub const BLKIO_SUBSYSTEM: &str = "blkio";

/// True for containerd's systemd-style cgroupsPath
pub fn is_systemd_cgroup_path(spec: &str) -> bool {
    spec.contains(".slice:") && spec.contains("cri-containerd")
}

/// Convert a systemd triple to its directory under the default root
///
/// `kubelet-kubepods-besteffort-pod<uid>.slice:cri-containerd:<id>` becomes
/// `/sys/fs/cgroup/kubelet.slice/kubelet-kubepods.slice/kubelet-kubepods-besteffort.slice/kubelet-kubepods-besteffort-pod<uid>.slice/cri-containerd-<id>.scope/`.
pub fn convert_systemd_cgroup_path(spec: &str) -> Result<String> {
    systemd_cgroup_path(DEFAULT_CGROUP_ROOT, spec)
}

/// Convert a systemd triple to its directory under `root`
pub fn systemd_cgroup_path(root: &str, spec: &str) -> Result<String> {
    let parts: Vec<&str> = spec.split(':').collect();
    if parts.len() != 3 {
        return Err(invalid(
            spec,
            format!("expected 3 colon-separated parts, found {}", parts.len()),
        ));
    }

    let (slice, prefix, id) = (parts[0], parts[1], parts[2]);
    if prefix.is_empty() || id.is_empty() {
        return Err(invalid(spec, "empty scope prefix or container id"));
    }

    let mut path = root.trim_end_matches('/').to_string();
    for unit in expand_slice(slice).map_err(|reason| invalid(spec, reason))? {
        path.push('/');
        path.push_str(&unit);
    }
    path.push_str(&format!("/{prefix}-{id}.scope/"));

    Ok(path)
}

/// Expand `a-b-c.slice` into `["a.slice", "a-b.slice", "a-b-c.slice"]`
pub fn expand_slice(slice: &str) -> std::result::Result<Vec<String>, String> {
    let name = slice
        .strip_suffix(".slice")
        .ok_or_else(|| format!("slice {slice:?} does not end in .slice"))?;

    if name.is_empty() {
        return Err("empty slice name".to_string());
    }

    let mut units = Vec::new();
    let mut acc = String::new();
    for segment in name.split('-') {
        if segment.is_empty() {
            return Err(format!("empty segment in slice {slice:?}"));
        }
        if !acc.is_empty() {
            acc.push('-');
        }
        acc.push_str(segment);
        units.push(format!("{acc}.slice"));
    }

    Ok(units)
}

/// Resolve the control directory for a container
///
/// `cgroup_parent` is the runtime's cgroup description, either a parent path
/// or a systemd triple. The result is recomputed on every call since systemd
/// may re-parent units.
pub fn resolve_path(
    root: &Path,
    version: CgroupVersion,
    container_id: &str,
    cgroup_parent: &str,
) -> Result<PathBuf> {
    let base = match version {
        CgroupVersion::V1 => root.join(BLKIO_SUBSYSTEM),
        CgroupVersion::V2 => root.to_path_buf(),
    };

    if uses_systemd_encoding(cgroup_parent) {
        let base = base.to_string_lossy();
        return systemd_cgroup_path(&base, cgroup_parent).map(PathBuf::from);
    }

    if container_id.is_empty() {
        return Err(invalid(cgroup_parent, "empty container id"));
    }

    Ok(base
        .join(cgroup_parent.trim_start_matches('/'))
        .join(container_id))
}

/// containerd's cgroupsPath, or the same triple built for Docker's systemd driver
fn uses_systemd_encoding(spec: &str) -> bool {
    is_systemd_cgroup_path(spec) || (!spec.starts_with('/') && spec.contains(".slice:"))
}

fn invalid(spec: &str, reason: impl Into<String>) -> SmartLimitError {
    SmartLimitError::InvalidCgroupSpec {
        spec: spec.to_string(),
        reason: reason.into(),
    }
}
