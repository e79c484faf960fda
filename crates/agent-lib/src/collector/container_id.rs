//! Container ID normalization
//!
//! Pod status reports IDs as `<runtime>://<id>`, while cAdvisor embeds them
//! in cgroup paths:
//! - Docker cgroupfs: /kubepods/burstable/pod<uid>/<id>
//! - Docker systemd: /kubepods.slice/.../docker-<id>.scope
//! - containerd: /kubelet.slice/.../cri-containerd-<id>.scope
//! - CRI-O: /kubepods.slice/.../crio-<id>.scope

/// Strip a single `docker://` or `containerd://` prefix
pub fn parse_container_id(raw: &str) -> String {
    raw.strip_prefix("docker://")
        .or_else(|| raw.strip_prefix("containerd://"))
        .unwrap_or(raw)
        .to_string()
}

/// Extract a bare container ID from a cgroup path or prefixed ID
pub fn extract_container_id(value: &str) -> Option<String> {
    if value.contains("://") {
        let id = parse_container_id(value);
        return (!id.is_empty() && !id.contains("://")).then_some(id);
    }

    for part in value.split('/').rev() {
        let unit = part.strip_suffix(".scope").unwrap_or(part);
        for prefix in ["cri-containerd-", "docker-", "crio-"] {
            if let Some(id) = unit.strip_prefix(prefix) {
                if is_container_id(id) {
                    return Some(id.to_string());
                }
            }
        }

        // Docker cgroupfs format: plain 64-char hex ID
        if is_container_id(part) {
            return Some(part.to_string());
        }
    }

    None
}

fn is_container_id(s: &str) -> bool {
    s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit())
}
