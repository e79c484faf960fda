//! Limit state persisted in Pod annotations
//!
//! Keys live under a configurable prefix (`<prefix>/<name>`). Numbers are
//! base-10 strings; absent or unparsable values read back as 0. A patch maps
//! keys to `Some(value)` to set and `None` to delete.
//!
//! The flat limit keys describe the most recent limit in the pod. Each limited
//! container also has its own record in the `container-limits` JSON map, which
//! takes precedence on restore.

use crate::models::{IoTrend, LimitResult, LimitStatus, TrendWindow};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const READ_IOPS_LIMIT: &str = "read-iops-limit";
pub const WRITE_IOPS_LIMIT: &str = "write-iops-limit";
pub const READ_BPS_LIMIT: &str = "read-bps-limit";
pub const WRITE_BPS_LIMIT: &str = "write-bps-limit";
pub const TRIGGERED_BY: &str = "triggered-by";
pub const TRIGGER_REASON: &str = "trigger-reason";
pub const TREND_READ_IOPS_15M: &str = "trend-read-iops-15m";
pub const TREND_WRITE_IOPS_15M: &str = "trend-write-iops-15m";
pub const TREND_READ_BPS_15M: &str = "trend-read-bps-15m";
pub const TREND_WRITE_BPS_15M: &str = "trend-write-bps-15m";
pub const LIMIT_REMOVED: &str = "limit-removed";
pub const APPLIED_AT: &str = "applied-at";
/// Comma-separated IDs of the pod's containers currently limited
pub const CONTAINER_IDS: &str = "container-ids";
/// JSON map of container ID to [`ContainerLimit`]
pub const CONTAINER_LIMITS: &str = "container-limits";

/// One container's limit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerLimit {
    #[serde(flatten)]
    pub limits: LimitResult,
    pub triggered_by: String,
    #[serde(default)]
    pub trigger_reason: String,
    pub applied_at: DateTime<Utc>,
}

impl From<&LimitStatus> for ContainerLimit {
    fn from(status: &LimitStatus) -> Self {
        Self {
            limits: status.limit_result,
            triggered_by: status.triggered_by.clone(),
            trigger_reason: status.trigger_reason.clone(),
            applied_at: status.applied_at,
        }
    }
}

pub type ContainerLimits = BTreeMap<String, ContainerLimit>;

/// Annotation changes: `Some` sets a key, `None` deletes it
pub type AnnotationPatch = BTreeMap<String, Option<String>>;

pub fn annotation_key(prefix: &str, name: &str) -> String {
    format!("{}/{}", prefix.trim_end_matches('/'), name)
}

/// True if any annotation lives under the prefix
pub fn has_prefix(annotations: &BTreeMap<String, String>, prefix: &str) -> bool {
    let scope = annotation_key(prefix, "");
    annotations.keys().any(|k| k.starts_with(&scope))
}

pub fn is_limit_removed(annotations: &BTreeMap<String, String>, prefix: &str) -> bool {
    annotations
        .get(&annotation_key(prefix, LIMIT_REMOVED))
        .is_some_and(|v| v == "true")
}

/// Container IDs recorded as limited, if the pod carries the list
pub fn limited_container_ids(
    annotations: &BTreeMap<String, String>,
    prefix: &str,
) -> Option<Vec<String>> {
    annotations
        .get(&annotation_key(prefix, CONTAINER_IDS))
        .map(|v| split_ids(v))
}

/// Per-container limit records; empty when absent or malformed
pub fn container_limits(annotations: &BTreeMap<String, String>, prefix: &str) -> ContainerLimits {
    annotations
        .get(&annotation_key(prefix, CONTAINER_LIMITS))
        .and_then(|v| serde_json::from_str(v).ok())
        .unwrap_or_default()
}

fn split_ids(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Changes recording a newly applied limit
///
/// `container_ids` is the full list of limited containers in the pod after
/// this application and `records` holds their limit records. Clears any
/// earlier `limit-removed` marker.
pub fn encode_limit(
    prefix: &str,
    status: &LimitStatus,
    trend: &IoTrend,
    container_ids: &[String],
    records: &ContainerLimits,
) -> AnnotationPatch {
    let limits = &status.limit_result;
    let recent = trend.window(TrendWindow::FifteenMinutes);
    let mut patch = AnnotationPatch::new();
    let mut set = |name: &str, value: String| {
        patch.insert(annotation_key(prefix, name), Some(value));
    };

    set(READ_IOPS_LIMIT, limits.read_iops.to_string());
    set(WRITE_IOPS_LIMIT, limits.write_iops.to_string());
    set(READ_BPS_LIMIT, limits.read_bps.to_string());
    set(WRITE_BPS_LIMIT, limits.write_bps.to_string());
    set(TRIGGERED_BY, status.triggered_by.clone());
    set(TRIGGER_REASON, status.trigger_reason.clone());
    set(TREND_READ_IOPS_15M, round_rate(recent.read_iops));
    set(TREND_WRITE_IOPS_15M, round_rate(recent.write_iops));
    set(TREND_READ_BPS_15M, round_rate(recent.read_bps));
    set(TREND_WRITE_BPS_15M, round_rate(recent.write_bps));
    set(
        APPLIED_AT,
        status.applied_at.to_rfc3339_opts(SecondsFormat::Secs, true),
    );
    set(CONTAINER_IDS, container_ids.join(","));
    if let Ok(json) = serde_json::to_string(records) {
        set(CONTAINER_LIMITS, json);
    }

    patch.insert(annotation_key(prefix, LIMIT_REMOVED), None);
    patch
}

/// Changes recording a released limit
///
/// `remaining_ids` are the pod's containers still limited and `records`
/// their limit records. The pod is marked released once none remain; trend
/// annotations are left for audit.
pub fn encode_release(
    prefix: &str,
    remaining_ids: &[String],
    records: &ContainerLimits,
) -> AnnotationPatch {
    let mut patch = AnnotationPatch::new();
    if remaining_ids.is_empty() {
        patch.insert(annotation_key(prefix, CONTAINER_IDS), None);
        patch.insert(annotation_key(prefix, CONTAINER_LIMITS), None);
        patch.insert(
            annotation_key(prefix, LIMIT_REMOVED),
            Some("true".to_string()),
        );
    } else {
        patch.insert(
            annotation_key(prefix, CONTAINER_IDS),
            Some(remaining_ids.join(",")),
        );
        let json = if records.is_empty() {
            None
        } else {
            serde_json::to_string(records).ok()
        };
        patch.insert(annotation_key(prefix, CONTAINER_LIMITS), json);
    }
    patch
}

/// Rebuild a container's limit status from its pod's annotations
///
/// The container's own record is used when present, otherwise the pod-level
/// keys. `now` stands in for `last_check_at`, and for `applied_at` when that
/// key is absent or malformed.
pub fn decode_limit(
    annotations: &BTreeMap<String, String>,
    prefix: &str,
    container_id: &str,
    pod_name: &str,
    namespace: &str,
    now: DateTime<Utc>,
) -> LimitStatus {
    if let Some(record) = container_limits(annotations, prefix).remove(container_id) {
        return LimitStatus {
            container_id: container_id.to_string(),
            pod_name: pod_name.to_string(),
            namespace: namespace.to_string(),
            is_limited: true,
            triggered_by: record.triggered_by,
            trigger_reason: record.trigger_reason,
            limit_result: record.limits,
            applied_at: record.applied_at,
            last_check_at: now,
            below_threshold_since: None,
        };
    }

    let get = |name: &str| annotations.get(&annotation_key(prefix, name));
    let int = |name: &str| parse_u64_or_zero(get(name).map(String::as_str));

    let applied_at = get(APPLIED_AT)
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or(now);

    LimitStatus {
        container_id: container_id.to_string(),
        pod_name: pod_name.to_string(),
        namespace: namespace.to_string(),
        is_limited: true,
        triggered_by: get(TRIGGERED_BY).cloned().unwrap_or_default(),
        trigger_reason: get(TRIGGER_REASON).cloned().unwrap_or_default(),
        limit_result: LimitResult {
            read_iops: int(READ_IOPS_LIMIT),
            write_iops: int(WRITE_IOPS_LIMIT),
            read_bps: int(READ_BPS_LIMIT),
            write_bps: int(WRITE_BPS_LIMIT),
        },
        applied_at,
        last_check_at: now,
        below_threshold_since: None,
    }
}

/// Parse a base-10 annotation value, 0 when absent or malformed
pub fn parse_u64_or_zero(value: Option<&str>) -> u64 {
    value.and_then(|v| v.trim().parse().ok()).unwrap_or(0)
}

/// Apply a patch to an annotation map the way a JSON merge patch would
pub fn merge_annotations(annotations: &mut BTreeMap<String, String>, patch: &AnnotationPatch) {
    for (key, value) in patch {
        match value {
            Some(value) => {
                annotations.insert(key.clone(), value.clone());
            }
            None => {
                annotations.remove(key);
            }
        }
    }
}

fn round_rate(value: f64) -> String {
    (value.max(0.0).round() as u64).to_string()
}
