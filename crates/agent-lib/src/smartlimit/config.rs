//! Throttling engine configuration

use crate::models::{LimitResult, TrendWindow};
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const MIB: u64 = 1024 * 1024;

/// Threshold and limit overrides for one trend window
///
/// Unset fields fall back to the legacy single thresholds and the auto limits.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowPolicy {
    #[serde(default)]
    pub iops_threshold: Option<f64>,
    #[serde(default)]
    pub bps_threshold: Option<f64>,
    #[serde(default)]
    pub limit_iops: Option<u64>,
    #[serde(default)]
    pub limit_bps: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowPolicies {
    #[serde(rename = "15m", default)]
    pub fifteen_minutes: WindowPolicy,
    #[serde(rename = "30m", default)]
    pub thirty_minutes: WindowPolicy,
    #[serde(rename = "60m", default)]
    pub sixty_minutes: WindowPolicy,
}

impl WindowPolicies {
    pub fn get(&self, window: TrendWindow) -> &WindowPolicy {
        match window {
            TrendWindow::FifteenMinutes => &self.fifteen_minutes,
            TrendWindow::ThirtyMinutes => &self.thirty_minutes,
            TrendWindow::SixtyMinutes => &self.sixty_minutes,
        }
    }
}

/// Trigger thresholds for one window
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub iops: f64,
    pub bps: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmartLimitConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_secs: u64,

    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,

    /// How long samples and idle histories are kept
    #[serde(default = "default_history_retention")]
    pub history_retention_secs: u64,

    /// Legacy single IOPS threshold used for windows without an override
    #[serde(default = "default_iops_threshold")]
    pub iops_threshold: f64,

    /// Legacy single BPS threshold used for windows without an override
    #[serde(default = "default_bps_threshold")]
    pub bps_threshold: f64,

    #[serde(default)]
    pub windows: WindowPolicies,

    #[serde(default = "default_auto_limit_iops")]
    pub auto_limit_iops: u64,

    #[serde(default = "default_auto_limit_bps")]
    pub auto_limit_bps: u64,

    /// Fraction of the trigger threshold the trend must stay under to release
    #[serde(default = "default_remove_threshold")]
    pub remove_threshold: f64,

    #[serde(default = "default_remove_delay")]
    pub remove_delay_secs: u64,

    #[serde(default = "default_remove_check_interval")]
    pub remove_check_interval_secs: u64,

    #[serde(default = "default_annotation_prefix")]
    pub annotation_prefix: String,

    #[serde(default = "default_exclude_namespaces")]
    pub exclude_namespaces: Vec<String>,

    /// `key` or `key=value` pod label selectors
    #[serde(default)]
    pub exclude_labels: Vec<String>,

    /// Pod name substrings
    #[serde(default)]
    pub exclude_keywords: Vec<String>,

    /// Samples kept per container by the rate calculator
    #[serde(default = "default_rate_capacity")]
    pub rate_capacity: usize,
}

fn default_enabled() -> bool {
    true
}

fn default_monitor_interval() -> u64 {
    60
}

fn default_cleanup_interval() -> u64 {
    600
}

fn default_history_retention() -> u64 {
    7200
}

fn default_iops_threshold() -> f64 {
    1000.0
}

fn default_bps_threshold() -> f64 {
    (100 * MIB) as f64
}

fn default_auto_limit_iops() -> u64 {
    500
}

fn default_auto_limit_bps() -> u64 {
    50 * MIB
}

fn default_remove_threshold() -> f64 {
    0.5
}

fn default_remove_delay() -> u64 {
    300
}

fn default_remove_check_interval() -> u64 {
    60
}

fn default_annotation_prefix() -> String {
    "smartlimit.io".to_string()
}

fn default_exclude_namespaces() -> Vec<String> {
    vec!["kube-system".to_string()]
}

fn default_rate_capacity() -> usize {
    crate::rate::DEFAULT_CAPACITY
}

impl Default for SmartLimitConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            monitor_interval_secs: default_monitor_interval(),
            cleanup_interval_secs: default_cleanup_interval(),
            history_retention_secs: default_history_retention(),
            iops_threshold: default_iops_threshold(),
            bps_threshold: default_bps_threshold(),
            windows: WindowPolicies::default(),
            auto_limit_iops: default_auto_limit_iops(),
            auto_limit_bps: default_auto_limit_bps(),
            remove_threshold: default_remove_threshold(),
            remove_delay_secs: default_remove_delay(),
            remove_check_interval_secs: default_remove_check_interval(),
            annotation_prefix: default_annotation_prefix(),
            exclude_namespaces: default_exclude_namespaces(),
            exclude_labels: Vec::new(),
            exclude_keywords: Vec::new(),
            rate_capacity: default_rate_capacity(),
        }
    }
}

impl SmartLimitConfig {
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn history_retention(&self) -> Duration {
        Duration::from_secs(self.history_retention_secs)
    }

    pub fn remove_delay(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.remove_delay_secs as i64)
    }

    pub fn remove_check_interval(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.remove_check_interval_secs as i64)
    }

    /// Trigger thresholds for a window, falling back to the legacy values
    pub fn thresholds(&self, window: TrendWindow) -> Thresholds {
        let policy = self.windows.get(window);
        Thresholds {
            iops: policy.iops_threshold.unwrap_or(self.iops_threshold),
            bps: policy.bps_threshold.unwrap_or(self.bps_threshold),
        }
    }

    /// Limits applied when `window` triggers
    pub fn limits(&self, window: TrendWindow) -> LimitResult {
        let policy = self.windows.get(window);
        let iops = policy.limit_iops.unwrap_or(self.auto_limit_iops);
        let bps = policy.limit_bps.unwrap_or(self.auto_limit_bps);
        LimitResult {
            read_iops: iops,
            write_iops: iops,
            read_bps: bps,
            write_bps: bps,
        }
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if !(self.remove_threshold > 0.0 && self.remove_threshold <= 1.0) {
            bail!(
                "remove_threshold must be in (0, 1], got {}",
                self.remove_threshold
            );
        }
        if self.monitor_interval_secs == 0 {
            bail!("monitor_interval_secs must be non-zero");
        }
        if self.cleanup_interval_secs == 0 {
            bail!("cleanup_interval_secs must be non-zero");
        }
        if self.history_retention_secs == 0 {
            bail!("history_retention_secs must be non-zero");
        }
        for window in TrendWindow::ALL {
            let t = self.thresholds(window);
            if t.iops <= 0.0 || t.bps <= 0.0 {
                bail!("thresholds for window {} must be positive", window);
            }
            if self.limits(window).is_empty() {
                bail!("limits for window {} are all zero", window);
            }
        }
        if self.annotation_prefix.trim_matches('/').is_empty() {
            bail!("annotation_prefix must not be empty");
        }
        Ok(())
    }

    /// Non-fatal configuration concerns worth logging at startup
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        let longest = TrendWindow::SixtyMinutes.duration().num_seconds() as u64;
        if self.history_retention_secs < longest {
            warnings.push(format!(
                "history_retention_secs {} is shorter than the 60m trend window",
                self.history_retention_secs
            ));
        }
        if self.monitor_interval_secs > TrendWindow::FifteenMinutes.duration().num_seconds() as u64
        {
            warnings.push(
                "monitor interval exceeds the 15m window; that window will rarely have data"
                    .to_string(),
            );
        }
        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SmartLimitConfig::default();
        assert!(config.enabled);
        assert_eq!(config.monitor_interval(), Duration::from_secs(60));
        assert_eq!(config.exclude_namespaces, vec!["kube-system"]);
        assert_eq!(config.auto_limit_bps, 52428800);
        assert!(config.validate().is_ok());
        assert!(config.warnings().is_empty());
    }

    #[test]
    fn test_window_overrides_fall_back_to_legacy() {
        let config: SmartLimitConfig = serde_json::from_value(serde_json::json!({
            "iops_threshold": 800.0,
            "windows": {
                "30m": {"iops_threshold": 400.0, "limit_iops": 200},
                "60m": {"bps_threshold": 1048576.0, "limit_bps": 1048576}
            }
        }))
        .unwrap();

        assert_eq!(config.thresholds(TrendWindow::FifteenMinutes).iops, 800.0);
        assert_eq!(config.thresholds(TrendWindow::ThirtyMinutes).iops, 400.0);
        assert_eq!(config.thresholds(TrendWindow::SixtyMinutes).bps, 1048576.0);

        let limits = config.limits(TrendWindow::ThirtyMinutes);
        assert_eq!(limits.read_iops, 200);
        assert_eq!(limits.write_bps, config.auto_limit_bps);

        let limits = config.limits(TrendWindow::SixtyMinutes);
        assert_eq!(limits.read_iops, 500);
        assert_eq!(limits.read_bps, 1048576);
    }

    #[test]
    fn test_validate_remove_threshold() {
        let mut config = SmartLimitConfig::default();
        config.remove_threshold = 0.0;
        assert!(config.validate().is_err());
        config.remove_threshold = 1.5;
        assert!(config.validate().is_err());
        config.remove_threshold = 1.0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_intervals_and_limits() {
        let mut config = SmartLimitConfig {
            monitor_interval_secs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        config.monitor_interval_secs = 60;
        config.auto_limit_iops = 0;
        config.auto_limit_bps = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_short_retention_warns() {
        let config = SmartLimitConfig {
            history_retention_secs: 1800,
            ..Default::default()
        };
        assert_eq!(config.warnings().len(), 1);
    }
}
