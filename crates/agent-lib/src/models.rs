//! Core data models for the throttling agent

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// One observation of cumulative block I/O counters for a container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IoStats {
    pub timestamp: DateTime<Utc>,
    pub read_ops: u64,
    pub write_ops: u64,
    pub read_bytes: u64,
    pub write_bytes: u64,
}

impl IoStats {
    pub fn new(
        timestamp: DateTime<Utc>,
        read_ops: u64,
        write_ops: u64,
        read_bytes: u64,
        write_bytes: u64,
    ) -> Self {
        Self {
            timestamp,
            read_ops,
            write_ops,
            read_bytes,
            write_bytes,
        }
    }
}

/// Rates derived from two samples
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateSample {
    pub container_id: String,
    pub timestamp: DateTime<Utc>,
    pub read_iops: f64,
    pub write_iops: f64,
    pub read_bps: f64,
    pub write_bps: f64,
}

/// Read/write IOPS and BPS for one lookback window
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowRates {
    pub read_iops: f64,
    pub write_iops: f64,
    pub read_bps: f64,
    pub write_bps: f64,
}

impl WindowRates {
    /// Negative rates come from counter resets and carry no load signal
    pub fn clamped(self) -> Self {
        Self {
            read_iops: self.read_iops.max(0.0),
            write_iops: self.write_iops.max(0.0),
            read_bps: self.read_bps.max(0.0),
            write_bps: self.write_bps.max(0.0),
        }
    }
}

/// Fixed trend windows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TrendWindow {
    #[serde(rename = "15m")]
    FifteenMinutes,
    #[serde(rename = "30m")]
    ThirtyMinutes,
    #[serde(rename = "60m")]
    SixtyMinutes,
}

impl TrendWindow {
    /// All windows in evaluation order
    pub const ALL: [TrendWindow; 3] = [
        TrendWindow::FifteenMinutes,
        TrendWindow::ThirtyMinutes,
        TrendWindow::SixtyMinutes,
    ];

    pub fn duration(&self) -> chrono::Duration {
        match self {
            TrendWindow::FifteenMinutes => chrono::Duration::minutes(15),
            TrendWindow::ThirtyMinutes => chrono::Duration::minutes(30),
            TrendWindow::SixtyMinutes => chrono::Duration::minutes(60),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            TrendWindow::FifteenMinutes => "15m",
            TrendWindow::ThirtyMinutes => "30m",
            TrendWindow::SixtyMinutes => "60m",
        }
    }
}

impl fmt::Display for TrendWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Average rates over the 15m/30m/60m windows
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct IoTrend {
    pub read_iops_15m: f64,
    pub write_iops_15m: f64,
    pub read_bps_15m: f64,
    pub write_bps_15m: f64,
    pub read_iops_30m: f64,
    pub write_iops_30m: f64,
    pub read_bps_30m: f64,
    pub write_bps_30m: f64,
    pub read_iops_60m: f64,
    pub write_iops_60m: f64,
    pub read_bps_60m: f64,
    pub write_bps_60m: f64,
}

impl IoTrend {
    pub fn window(&self, window: TrendWindow) -> WindowRates {
        match window {
            TrendWindow::FifteenMinutes => WindowRates {
                read_iops: self.read_iops_15m,
                write_iops: self.write_iops_15m,
                read_bps: self.read_bps_15m,
                write_bps: self.write_bps_15m,
            },
            TrendWindow::ThirtyMinutes => WindowRates {
                read_iops: self.read_iops_30m,
                write_iops: self.write_iops_30m,
                read_bps: self.read_bps_30m,
                write_bps: self.write_bps_30m,
            },
            TrendWindow::SixtyMinutes => WindowRates {
                read_iops: self.read_iops_60m,
                write_iops: self.write_iops_60m,
                read_bps: self.read_bps_60m,
                write_bps: self.write_bps_60m,
            },
        }
    }

    pub fn set_window(&mut self, window: TrendWindow, rates: WindowRates) {
        match window {
            TrendWindow::FifteenMinutes => {
                self.read_iops_15m = rates.read_iops;
                self.write_iops_15m = rates.write_iops;
                self.read_bps_15m = rates.read_bps;
                self.write_bps_15m = rates.write_bps;
            }
            TrendWindow::ThirtyMinutes => {
                self.read_iops_30m = rates.read_iops;
                self.write_iops_30m = rates.write_iops;
                self.read_bps_30m = rates.read_bps;
                self.write_bps_30m = rates.write_bps;
            }
            TrendWindow::SixtyMinutes => {
                self.read_iops_60m = rates.read_iops;
                self.write_iops_60m = rates.write_iops;
                self.read_bps_60m = rates.read_bps;
                self.write_bps_60m = rates.write_bps;
            }
        }
    }

    /// Copy with every negative field raised to zero
    pub fn clamped(&self) -> Self {
        let mut out = Self::default();
        for window in TrendWindow::ALL {
            out.set_window(window, self.window(window).clamped());
        }
        out
    }
}

/// Throttle values applied to a container (0 = unlimited)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitResult {
    pub read_iops: u64,
    pub write_iops: u64,
    pub read_bps: u64,
    pub write_bps: u64,
}

impl LimitResult {
    pub fn is_empty(&self) -> bool {
        self.read_iops == 0 && self.write_iops == 0 && self.read_bps == 0 && self.write_bps == 0
    }
}

/// Decision state for a limited container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitStatus {
    pub container_id: String,
    pub pod_name: String,
    pub namespace: String,
    pub is_limited: bool,
    pub triggered_by: String,
    pub trigger_reason: String,
    pub limit_result: LimitResult,
    pub applied_at: DateTime<Utc>,
    pub last_check_at: DateTime<Utc>,
    /// Start of the current below-release-threshold streak; in memory only
    #[serde(skip)]
    pub below_threshold_since: Option<DateTime<Utc>>,
}

/// cgroup hierarchy version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CgroupVersion {
    V1,
    V2,
}

impl fmt::Display for CgroupVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CgroupVersion::V1 => f.write_str("v1"),
            CgroupVersion::V2 => f.write_str("v2"),
        }
    }
}

/// Resolved target for a limit operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgroupEndpoint {
    pub version: CgroupVersion,
    pub path: PathBuf,
    /// Block device as `major:minor`
    pub device: String,
}

/// Pod as seen by the agent, reduced to what the engine needs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PodInfo {
    pub name: String,
    pub namespace: String,
    pub uid: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub containers: Vec<PodContainer>,
}

/// Container status entry of a pod
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PodContainer {
    pub name: String,
    /// Bare container ID with any runtime prefix stripped
    pub container_id: String,
}

/// A sample attributed to a pod, ready for the history store
#[derive(Debug, Clone, PartialEq)]
pub struct CollectedSample {
    pub container_id: String,
    pub container_name: String,
    pub pod_name: String,
    pub namespace: String,
    pub stats: IoStats,
}

/// Container record from the runtime
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeContainer {
    pub id: String,
    pub name: String,
    pub image: String,
    pub cgroup_parent: String,
    pub annotations: BTreeMap<String, String>,
}
