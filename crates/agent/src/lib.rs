//! SmartLimit agent process: configuration and the health/metrics API

pub mod api;
pub mod config;
