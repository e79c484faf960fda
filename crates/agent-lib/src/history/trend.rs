//! Multi-window trend analysis
//!
//! Unlike the rate calculator, which takes a single head-to-tail delta, the
//! trend for a window is the unweighted mean of every per-step rate whose
//! later sample falls inside the window. A step whose counter went backwards
//! (container restart) counts as zero.

use crate::models::{IoStats, IoTrend, TrendWindow, WindowRates};
use chrono::{DateTime, Utc};

/// Compute the 15m/30m/60m trend from time-ordered samples
pub fn compute_trend(samples: &[IoStats], now: DateTime<Utc>) -> IoTrend {
    let mut trend = IoTrend::default();
    for window in TrendWindow::ALL {
        trend.set_window(window, window_rates(samples, now, window.duration()));
    }
    trend
}

/// Mean per-step rates for consecutive pairs ending after `now - window`
///
/// Pairs with zero or negative elapsed time are skipped. Negative counter
/// deltas contribute zero. No qualifying pair yields all-zero rates.
pub fn window_rates(
    samples: &[IoStats],
    now: DateTime<Utc>,
    window: chrono::Duration,
) -> WindowRates {
    let cutoff = now.checked_sub_signed(window).unwrap_or(DateTime::<Utc>::MIN_UTC);

    let mut sum = WindowRates::default();
    let mut pairs = 0usize;

    for pair in samples.windows(2) {
        let (prev, cur) = (&pair[0], &pair[1]);
        if cur.timestamp <= cutoff {
            continue;
        }

        let elapsed = (cur.timestamp - prev.timestamp).num_milliseconds() as f64 / 1000.0;
        if elapsed <= 0.0 {
            continue;
        }

        sum.read_iops += step(prev.read_ops, cur.read_ops) / elapsed;
        sum.write_iops += step(prev.write_ops, cur.write_ops) / elapsed;
        sum.read_bps += step(prev.read_bytes, cur.read_bytes) / elapsed;
        sum.write_bps += step(prev.write_bytes, cur.write_bytes) / elapsed;
        pairs += 1;
    }

    if pairs == 0 {
        return WindowRates::default();
    }

    let n = pairs as f64;
    WindowRates {
        read_iops: sum.read_iops / n,
        write_iops: sum.write_iops / n,
        read_bps: sum.read_bps / n,
        write_bps: sum.write_bps / n,
    }
}

fn step(prev: u64, cur: u64) -> f64 {
    cur.saturating_sub(prev) as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::seconds(secs)
    }

    #[test]
    fn test_three_sample_series() {
        let samples = vec![
            IoStats::new(at(0), 100, 100, 1000, 1000),
            IoStats::new(at(60), 300, 300, 3000, 3000),
            IoStats::new(at(120), 500, 500, 5000, 5000),
        ];

        let trend = compute_trend(&samples, at(120));
        assert!(trend.read_iops_15m > 0.0);
        // 200 ops per 60s step
        assert!((trend.read_iops_15m - 200.0 / 60.0).abs() < 1e-9);
        assert!((trend.write_bps_15m - 2000.0 / 60.0).abs() < 1e-9);
        assert_eq!(trend.read_iops_15m, trend.read_iops_60m);
    }

    #[test]
    fn test_mean_of_steps_not_endpoints() {
        // Uneven spacing: head-to-tail would give 300/40, mean-of-steps differs
        let samples = vec![
            IoStats::new(at(0), 0, 0, 0, 0),
            IoStats::new(at(10), 100, 0, 0, 0),
            IoStats::new(at(40), 300, 0, 0, 0),
        ];

        let rates = window_rates(&samples, at(40), chrono::Duration::minutes(15));
        let expected = (100.0 / 10.0 + 200.0 / 30.0) / 2.0;
        assert!((rates.read_iops - expected).abs() < 1e-9);
    }

    #[test]
    fn test_window_excludes_old_pairs() {
        // A burst 45 minutes ago, then an idle gap, then a small step
        let samples = vec![
            IoStats::new(at(0), 0, 0, 0, 0),
            IoStats::new(at(60), 6000, 0, 0, 0),
            IoStats::new(at(60 * 45), 6000, 0, 0, 0),
            IoStats::new(at(60 * 46), 6060, 0, 0, 0),
        ];
        let now = at(60 * 46);

        let trend = compute_trend(&samples, now);
        // The idle step ends inside the 15m window, so it counts: (0 + 1) / 2
        assert!((trend.read_iops_15m - 0.5).abs() < 1e-9);
        // 60m window includes the burst as well: (100 + 0 + 1) / 3
        assert!((trend.read_iops_60m - 101.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_window_is_zero() {
        let samples = vec![IoStats::new(at(0), 10, 10, 10, 10)];
        let trend = compute_trend(&samples, at(0));
        assert_eq!(trend, IoTrend::default());

        let trend = compute_trend(&[], at(0));
        assert_eq!(trend, IoTrend::default());
    }

    #[test]
    fn test_counter_reset_step_counts_as_zero() {
        let samples = vec![
            IoStats::new(at(0), 1000, 0, 0, 0),
            IoStats::new(at(10), 0, 0, 0, 0),
        ];
        let trend = compute_trend(&samples, at(10));
        assert_eq!(trend.read_iops_15m, 0.0);
    }

    #[test]
    fn test_reset_during_sustained_load_keeps_trend_high() {
        // 3000 read IOPS for ten minutes, container restarted at minute 5
        let mut samples = Vec::new();
        let mut ops = 10_000_000u64;
        for minute in 0..=10 {
            if minute == 5 {
                ops = 0;
            } else if minute > 0 {
                ops += 3000 * 60;
            }
            samples.push(IoStats::new(at(minute * 60), ops, 0, 0, 0));
        }

        let trend = compute_trend(&samples, at(600));
        // Nine busy steps and one zeroed reset step
        assert!((trend.read_iops_15m - 2700.0).abs() < 1e-9);
        assert_eq!(trend.read_iops_15m, trend.read_iops_60m);
    }
}
