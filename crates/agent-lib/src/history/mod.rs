//! Per-container I/O history and trend analysis
//!
//! The store keeps a retention-bounded, time-ordered series of cumulative
//! counters per container. The analyzer turns a snapshot of that series into
//! average per-step rates over the fixed 15m/30m/60m windows.

mod store;
mod trend;

pub use store::{ContainerIoHistory, HistoryStore};
pub use trend::{compute_trend, window_rates};
