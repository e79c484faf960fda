//! Counter-to-rate conversion
//!
//! Keeps a bounded ring of cumulative I/O counters per container and turns
//! them into IOPS/BPS over one or several lookback windows. A rate is always
//! the head-to-tail delta of the samples inside the window divided by the
//! elapsed seconds between them.

use crate::error::{Result, SmartLimitError};
use crate::models::{IoStats, RateSample};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

/// Default number of samples kept per container
pub const DEFAULT_CAPACITY: usize = 100;

/// Per-container rate calculator
pub struct RateCalculator {
    capacity: usize,
    samples: RwLock<HashMap<String, VecDeque<IoStats>>>,
}

impl Default for RateCalculator {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl RateCalculator {
    /// Create a calculator keeping at most `capacity` samples per container
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(2),
            samples: RwLock::new(HashMap::new()),
        }
    }

    /// Append a sample, dropping the oldest one when the ring is full
    pub fn record(&self, container_id: &str, stats: IoStats) {
        let mut samples = self.samples.write().unwrap_or_else(PoisonError::into_inner);
        let ring = samples
            .entry(container_id.to_string())
            .or_insert_with(|| VecDeque::with_capacity(self.capacity));

        if ring.len() >= self.capacity {
            ring.pop_front();
        }
        ring.push_back(stats);
    }

    /// Rate over `window` ending now
    pub fn rate(&self, container_id: &str, window: Duration) -> Result<RateSample> {
        self.rate_at(container_id, window, Utc::now())
    }

    /// Rate over `window` ending at `now`
    ///
    /// Uses the first and last sample strictly newer than `now - window`.
    /// Counter resets show up as negative rates; interpreting them is up to
    /// the caller.
    pub fn rate_at(
        &self,
        container_id: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<RateSample> {
        let insufficient = || SmartLimitError::InsufficientData {
            container_id: container_id.to_string(),
            window,
        };

        let samples = self.samples.read().unwrap_or_else(PoisonError::into_inner);
        let ring = samples.get(container_id).ok_or_else(insufficient)?;

        let cutoff = window_start(now, window);
        let mut in_window = ring.iter().filter(|s| s.timestamp > cutoff);
        let earliest = in_window.next().ok_or_else(insufficient)?;
        let latest = in_window.last().ok_or_else(insufficient)?;

        let elapsed = (latest.timestamp - earliest.timestamp).num_milliseconds() as f64 / 1000.0;
        if elapsed <= 0.0 {
            return Err(insufficient());
        }

        Ok(RateSample {
            container_id: container_id.to_string(),
            timestamp: latest.timestamp,
            read_iops: delta(earliest.read_ops, latest.read_ops) / elapsed,
            write_iops: delta(earliest.write_ops, latest.write_ops) / elapsed,
            read_bps: delta(earliest.read_bytes, latest.read_bytes) / elapsed,
            write_bps: delta(earliest.write_bytes, latest.write_bytes) / elapsed,
        })
    }

    /// Mean of the per-window rates that could be computed
    pub fn average_rate(&self, container_id: &str, windows: &[Duration]) -> Result<RateSample> {
        self.average_rate_at(container_id, windows, Utc::now())
    }

    /// Mean of the per-window rates at `now`; fails only if every window fails
    pub fn average_rate_at(
        &self,
        container_id: &str,
        windows: &[Duration],
        now: DateTime<Utc>,
    ) -> Result<RateSample> {
        let rates: Vec<RateSample> = windows
            .iter()
            .filter_map(|w| self.rate_at(container_id, *w, now).ok())
            .collect();

        if rates.is_empty() {
            return Err(SmartLimitError::NoValidData {
                container_id: container_id.to_string(),
            });
        }

        let n = rates.len() as f64;
        let timestamp = rates
            .iter()
            .map(|r| r.timestamp)
            .max()
            .unwrap_or(now);

        Ok(RateSample {
            container_id: container_id.to_string(),
            timestamp,
            read_iops: rates.iter().map(|r| r.read_iops).sum::<f64>() / n,
            write_iops: rates.iter().map(|r| r.write_iops).sum::<f64>() / n,
            read_bps: rates.iter().map(|r| r.read_bps).sum::<f64>() / n,
            write_bps: rates.iter().map(|r| r.write_bps).sum::<f64>() / n,
        })
    }

    /// Drop samples older than `max_age` and forget empty containers
    pub fn prune(&self, max_age: Duration) {
        self.prune_at(max_age, Utc::now());
    }

    pub fn prune_at(&self, max_age: Duration, now: DateTime<Utc>) {
        let cutoff = window_start(now, max_age);
        let mut samples = self.samples.write().unwrap_or_else(PoisonError::into_inner);

        for ring in samples.values_mut() {
            while ring.front().is_some_and(|s| s.timestamp < cutoff) {
                ring.pop_front();
            }
        }
        samples.retain(|_, ring| !ring.is_empty());
    }

    /// Number of samples held for a container
    pub fn sample_count(&self, container_id: &str) -> usize {
        self.samples
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(container_id)
            .map_or(0, VecDeque::len)
    }

    /// Number of tracked containers
    pub fn len(&self) -> usize {
        self.samples.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// `now - window`, saturating at the earliest representable instant
pub(crate) fn window_start(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|w| now.checked_sub_signed(w))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn delta(earlier: u64, later: u64) -> f64 {
    later as f64 - earlier as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn stats(offset_secs: i64, ops: u64, bytes: u64) -> IoStats {
        IoStats::new(
            base() + chrono::Duration::seconds(offset_secs),
            ops,
            ops * 2,
            bytes,
            bytes * 2,
        )
    }

    #[test]
    fn test_rate_uses_window_endpoints() {
        let calc = RateCalculator::default();
        calc.record("c1", stats(0, 0, 0));
        calc.record("c1", stats(60, 600, 6000));
        calc.record("c1", stats(120, 1200, 12000));
        calc.record("c1", stats(180, 2400, 24000));

        let now = base() + chrono::Duration::seconds(180);
        // Window of 130s covers samples at 60, 120 and 180
        let rate = calc
            .rate_at("c1", Duration::from_secs(130), now)
            .unwrap();

        assert!((rate.read_iops - 15.0).abs() < 1e-9);
        assert!((rate.write_iops - 30.0).abs() < 1e-9);
        assert!((rate.read_bps - 150.0).abs() < 1e-9);
        assert!((rate.write_bps - 300.0).abs() < 1e-9);
        assert_eq!(rate.timestamp, now);
    }

    #[test]
    fn test_rate_monotonic_series_is_non_negative() {
        let calc = RateCalculator::default();
        for i in 0..10 {
            calc.record("c1", stats(i * 10, (i as u64) * 50, (i as u64) * 4096));
        }
        let now = base() + chrono::Duration::seconds(90);
        let rate = calc.rate_at("c1", Duration::from_secs(3600), now).unwrap();

        assert!(rate.read_iops >= 0.0);
        assert!((rate.read_iops - 450.0 / 90.0).abs() < 1e-9);
        assert!((rate.read_bps - 4096.0 * 9.0 / 90.0).abs() < 1e-9);
    }

    #[test]
    fn test_rate_single_sample_is_insufficient() {
        let calc = RateCalculator::default();
        calc.record("c1", stats(0, 10, 10));

        let result = calc.rate_at("c1", Duration::from_secs(60), base());
        assert!(matches!(
            result,
            Err(SmartLimitError::InsufficientData { .. })
        ));

        let result = calc.rate_at("missing", Duration::from_secs(60), base());
        assert!(matches!(
            result,
            Err(SmartLimitError::InsufficientData { .. })
        ));
    }

    #[test]
    fn test_rate_zero_elapsed_is_insufficient() {
        let calc = RateCalculator::default();
        calc.record("c1", stats(0, 10, 10));
        calc.record("c1", stats(0, 20, 20));

        let result = calc.rate_at("c1", Duration::from_secs(60), base());
        assert!(matches!(
            result,
            Err(SmartLimitError::InsufficientData { .. })
        ));
    }

    #[test]
    fn test_rate_surfaces_counter_reset() {
        let calc = RateCalculator::default();
        calc.record("c1", stats(0, 1000, 1000));
        calc.record("c1", stats(10, 0, 0));

        let rate = calc
            .rate_at("c1", Duration::from_secs(60), base() + chrono::Duration::seconds(10))
            .unwrap();
        assert!(rate.read_iops < 0.0);
        assert!((rate.read_iops + 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_capacity_drops_oldest() {
        let calc = RateCalculator::new(3);
        for i in 0..5 {
            calc.record("c1", stats(i, i as u64, 0));
        }
        assert_eq!(calc.sample_count("c1"), 3);

        // Oldest retained sample is t=2
        let rate = calc
            .rate_at("c1", Duration::from_secs(3600), base() + chrono::Duration::seconds(4))
            .unwrap();
        assert!((rate.read_iops - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_average_rate_ignores_failed_windows() {
        let calc = RateCalculator::default();
        calc.record("c1", stats(0, 0, 0));
        calc.record("c1", stats(100, 1000, 0));
        calc.record("c1", stats(110, 1300, 0));

        let now = base() + chrono::Duration::seconds(110);
        // 5s window: only one sample -> fails
        // 20s window: 100..110 -> 30 iops
        // 200s window: 0..110 -> 1300/110 iops
        let windows = [
            Duration::from_secs(5),
            Duration::from_secs(20),
            Duration::from_secs(200),
        ];
        let avg = calc.average_rate_at("c1", &windows, now).unwrap();
        let expected = (30.0 + 1300.0 / 110.0) / 2.0;
        assert!((avg.read_iops - expected).abs() < 1e-9);
    }

    #[test]
    fn test_average_rate_no_valid_data() {
        let calc = RateCalculator::default();
        calc.record("c1", stats(0, 0, 0));

        let result = calc.average_rate_at(
            "c1",
            &[Duration::from_secs(5), Duration::from_secs(10)],
            base(),
        );
        assert!(matches!(result, Err(SmartLimitError::NoValidData { .. })));
    }

    #[test]
    fn test_prune_removes_old_samples_and_empty_containers() {
        let calc = RateCalculator::default();
        calc.record("old", stats(0, 0, 0));
        calc.record("mixed", stats(0, 0, 0));
        calc.record("mixed", stats(500, 10, 0));

        calc.prune_at(Duration::from_secs(100), base() + chrono::Duration::seconds(550));

        assert_eq!(calc.sample_count("old"), 0);
        assert_eq!(calc.sample_count("mixed"), 1);
        assert_eq!(calc.len(), 1);
    }
}
