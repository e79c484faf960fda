//! Threshold decisions
//!
//! Pure functions over a trend and the configuration. Trend steps that span a
//! counter reset already count as zero; trends are also clamped here so a
//! hand-built negative trend never reads as load.

use super::SmartLimitConfig;
use crate::models::{IoTrend, LimitStatus, TrendWindow, WindowRates};
use chrono::{DateTime, Utc};
use std::fmt;

/// The window and metric that crossed its threshold
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LimitTrigger {
    pub window: TrendWindow,
    pub metric: &'static str,
    pub value: f64,
    pub threshold: f64,
}

impl fmt::Display for LimitTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {:.2} > {:.2}",
            self.window, self.metric, self.value, self.threshold
        )
    }
}

/// Outcome of a release check on a limited container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseDecision {
    /// The check interval has not elapsed since the last check
    NotDue,
    /// Load is still at or above the release bar
    Hold,
    /// Below the release bar, but not yet for the full delay
    Cooling,
    Release,
}

fn metrics(rates: &WindowRates) -> [(&'static str, f64, bool); 4] {
    [
        ("read_iops", rates.read_iops, true),
        ("write_iops", rates.write_iops, true),
        ("read_bps", rates.read_bps, false),
        ("write_bps", rates.write_bps, false),
    ]
}

/// First window, in 15m/30m/60m order, with a metric above its threshold
pub fn should_apply_limit(trend: &IoTrend, config: &SmartLimitConfig) -> Option<LimitTrigger> {
    let trend = trend.clamped();
    TrendWindow::ALL.into_iter().find_map(|window| {
        let thresholds = config.thresholds(window);
        metrics(&trend.window(window))
            .into_iter()
            .find_map(|(metric, value, is_iops)| {
                let threshold = if is_iops { thresholds.iops } else { thresholds.bps };
                (value > threshold).then_some(LimitTrigger {
                    window,
                    metric,
                    value,
                    threshold,
                })
            })
    })
}

/// True when every window and metric is under `threshold * remove_threshold`
pub fn is_below_release_threshold(trend: &IoTrend, config: &SmartLimitConfig) -> bool {
    let trend = trend.clamped();
    TrendWindow::ALL.into_iter().all(|window| {
        let thresholds = config.thresholds(window);
        metrics(&trend.window(window))
            .into_iter()
            .all(|(_, value, is_iops)| {
                let threshold = if is_iops { thresholds.iops } else { thresholds.bps };
                value < threshold * config.remove_threshold
            })
    })
}

/// Advance a limited container's release hysteresis
///
/// Runs at most once per `remove_check_interval`. The below-threshold streak
/// starts at the first check that finds load under the bar and resets on any
/// check above it; release requires the streak to last `remove_delay`.
pub fn evaluate_release(
    status: &mut LimitStatus,
    trend: &IoTrend,
    config: &SmartLimitConfig,
    now: DateTime<Utc>,
) -> ReleaseDecision {
    if now - status.last_check_at < config.remove_check_interval() {
        return ReleaseDecision::NotDue;
    }
    status.last_check_at = now;

    if !is_below_release_threshold(trend, config) {
        status.below_threshold_since = None;
        return ReleaseDecision::Hold;
    }

    let since = *status.below_threshold_since.get_or_insert(now);
    if now - since >= config.remove_delay() {
        ReleaseDecision::Release
    } else {
        ReleaseDecision::Cooling
    }
}
