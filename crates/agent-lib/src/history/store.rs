//! Retention-bounded sample store

use super::compute_trend;
use crate::models::{IoStats, IoTrend};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

/// Samples and identity for one container
#[derive(Debug, Clone)]
pub struct ContainerIoHistory {
    pub container_id: String,
    pub pod_name: String,
    pub namespace: String,
    pub samples: VecDeque<IoStats>,
    pub last_update: DateTime<Utc>,
}

impl ContainerIoHistory {
    fn new(container_id: &str, pod_name: &str, namespace: &str, now: DateTime<Utc>) -> Self {
        Self {
            container_id: container_id.to_string(),
            pod_name: pod_name.to_string(),
            namespace: namespace.to_string(),
            samples: VecDeque::new(),
            last_update: now,
        }
    }

    /// Drop front samples older than `cutoff`
    fn evict_before(&mut self, cutoff: DateTime<Utc>) {
        while self.samples.front().is_some_and(|s| s.timestamp < cutoff) {
            self.samples.pop_front();
        }
    }
}

/// Registry of container histories
///
/// The map handles structural changes; each entry carries its own lock so
/// one container can be appended to while others are being analyzed.
pub struct HistoryStore {
    histories: DashMap<String, Arc<Mutex<ContainerIoHistory>>>,
    retention: Duration,
}

impl HistoryStore {
    pub fn new(retention: Duration) -> Self {
        Self {
            histories: DashMap::new(),
            retention,
        }
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Append a sample, creating the history on first sight
    ///
    /// Samples older than the retention window, measured from the appended
    /// sample's timestamp, are evicted immediately.
    pub fn append(&self, container_id: &str, pod_name: &str, namespace: &str, sample: IoStats) {
        let entry = self
            .histories
            .entry(container_id.to_string())
            .or_insert_with(|| {
                debug!(container_id = %container_id, pod_name = %pod_name, "Tracking new container history");
                Arc::new(Mutex::new(ContainerIoHistory::new(
                    container_id,
                    pod_name,
                    namespace,
                    sample.timestamp,
                )))
            })
            .clone();

        let mut history = entry.lock().unwrap_or_else(PoisonError::into_inner);
        let cutoff = crate::rate::window_start(sample.timestamp, self.retention);
        history.last_update = sample.timestamp;
        history.pod_name = pod_name.to_string();
        history.namespace = namespace.to_string();
        history.samples.push_back(sample);
        history.evict_before(cutoff);
    }

    /// Point-in-time copy of one history
    pub fn snapshot(&self, container_id: &str) -> Option<ContainerIoHistory> {
        let entry = self.histories.get(container_id).map(|e| e.value().clone())?;
        let history = entry.lock().unwrap_or_else(PoisonError::into_inner);
        Some(history.clone())
    }

    /// Trend for one container
    pub fn trend(&self, container_id: &str, now: DateTime<Utc>) -> Option<IoTrend> {
        self.snapshot(container_id)
            .map(|mut h| compute_trend(h.samples.make_contiguous(), now))
    }

    /// Trends for every tracked container
    ///
    /// Each history is copied under its own lock, then analyzed unlocked.
    pub fn trend_all(&self, now: DateTime<Utc>) -> Vec<(ContainerIoHistory, IoTrend)> {
        let entries: Vec<Arc<Mutex<ContainerIoHistory>>> =
            self.histories.iter().map(|e| e.value().clone()).collect();

        entries
            .into_iter()
            .map(|entry| entry.lock().unwrap_or_else(PoisonError::into_inner).clone())
            .map(|mut history| {
                let trend = compute_trend(history.samples.make_contiguous(), now);
                (history, trend)
            })
            .collect()
    }

    /// Remove containers not updated within the retention window
    ///
    /// Returns the evicted container IDs.
    pub fn evict_stale(&self, now: DateTime<Utc>) -> Vec<String> {
        let cutoff = crate::rate::window_start(now, self.retention);
        let stale: Vec<String> = self
            .histories
            .iter()
            .filter(|e| {
                e.value()
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .last_update
                    < cutoff
            })
            .map(|e| e.key().clone())
            .collect();

        for id in &stale {
            debug!(container_id = %id, "Evicting stale container history");
            self.histories.remove(id);
        }

        stale
    }

    pub fn contains(&self, container_id: &str) -> bool {
        self.histories.contains_key(container_id)
    }

    pub fn len(&self) -> usize {
        self.histories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.histories.is_empty()
    }
}
