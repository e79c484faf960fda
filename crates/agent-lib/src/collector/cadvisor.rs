//! cAdvisor Prometheus text parsing
//!
//! The kubelet's `/metrics/cadvisor` endpoint exposes per-device filesystem
//! counters. Series are summed across devices per container:
//! - container_fs_reads_total / container_fs_writes_total
//! - container_fs_reads_bytes_total / container_fs_writes_bytes_total

use super::container_id::{extract_container_id, parse_container_id};
use crate::models::{CollectedSample, IoStats, PodInfo};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};

pub const FS_READS_TOTAL: &str = "container_fs_reads_total";
pub const FS_WRITES_TOTAL: &str = "container_fs_writes_total";
pub const FS_READS_BYTES_TOTAL: &str = "container_fs_reads_bytes_total";
pub const FS_WRITES_BYTES_TOTAL: &str = "container_fs_writes_bytes_total";

/// Summed filesystem counters for one container
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FsCounters {
    pub read_ops: u64,
    pub write_ops: u64,
    pub read_bytes: u64,
    pub write_bytes: u64,
}

/// One parsed exposition line
#[derive(Debug, Clone, PartialEq)]
struct Series<'a> {
    name: &'a str,
    labels: HashMap<String, String>,
    value: f64,
}

/// Parse cAdvisor text into per-container counters keyed by bare container ID
///
/// Pod-level cgroups (empty or `POD` container label) and series without a
/// recognizable container ID are skipped.
pub fn parse_cadvisor_metrics(text: &str) -> HashMap<String, FsCounters> {
    let mut counters: HashMap<String, FsCounters> = HashMap::new();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some(series) = parse_line(line) else {
            continue;
        };
        if !matches!(
            series.name,
            FS_READS_TOTAL | FS_WRITES_TOTAL | FS_READS_BYTES_TOTAL | FS_WRITES_BYTES_TOTAL
        ) {
            continue;
        }

        if let Some(container) = series.labels.get("container") {
            if container.is_empty() || container == "POD" {
                continue;
            }
        }

        let Some(id) = series_container_id(&series.labels) else {
            continue;
        };

        let value = if series.value.is_finite() && series.value > 0.0 {
            series.value as u64
        } else {
            0
        };

        let entry = counters.entry(id).or_default();
        match series.name {
            FS_READS_TOTAL => entry.read_ops = entry.read_ops.saturating_add(value),
            FS_WRITES_TOTAL => entry.write_ops = entry.write_ops.saturating_add(value),
            FS_READS_BYTES_TOTAL => entry.read_bytes = entry.read_bytes.saturating_add(value),
            FS_WRITES_BYTES_TOTAL => entry.write_bytes = entry.write_bytes.saturating_add(value),
            _ => {}
        }
    }

    counters
}

/// Attribute parsed counters to pods via the pod list's container IDs
pub fn samples_from_cadvisor(
    counters: &HashMap<String, FsCounters>,
    pods: &[PodInfo],
    now: DateTime<Utc>,
) -> Vec<CollectedSample> {
    let index: BTreeMap<&str, (&PodInfo, &str)> = pods
        .iter()
        .flat_map(|pod| {
            pod.containers
                .iter()
                .filter(|c| !c.container_id.is_empty())
                .map(move |c| (c.container_id.as_str(), (pod, c.name.as_str())))
        })
        .collect();

    let mut samples: Vec<CollectedSample> = counters
        .iter()
        .filter_map(|(id, fs)| {
            let (pod, container_name) = index.get(id.as_str())?;
            Some(CollectedSample {
                container_id: id.clone(),
                container_name: container_name.to_string(),
                pod_name: pod.name.clone(),
                namespace: pod.namespace.clone(),
                stats: IoStats::new(now, fs.read_ops, fs.write_ops, fs.read_bytes, fs.write_bytes),
            })
        })
        .collect();

    samples.sort_by(|a, b| a.container_id.cmp(&b.container_id));
    samples
}

fn series_container_id(labels: &HashMap<String, String>) -> Option<String> {
    if let Some(raw) = labels.get("container_id").filter(|v| !v.is_empty()) {
        let id = parse_container_id(raw);
        if !id.is_empty() {
            return Some(id);
        }
    }
    labels.get("id").and_then(|path| extract_container_id(path))
}

/// Parse `name{k="v",...} value [timestamp]`
fn parse_line(line: &str) -> Option<Series<'_>> {
    let name_end = line.find(|c: char| c == '{' || c.is_whitespace())?;
    let name = &line[..name_end];

    let (labels, rest) = if line[name_end..].starts_with('{') {
        let (labels, consumed) = parse_labels(&line[name_end + 1..])?;
        (labels, &line[name_end + 1 + consumed..])
    } else {
        (HashMap::new(), &line[name_end..])
    };

    let value = rest.split_whitespace().next()?.parse::<f64>().ok()?;
    Some(Series {
        name,
        labels,
        value,
    })
}

/// Parse a label set up to and including the closing brace
///
/// Returns the labels and the number of bytes consumed.
fn parse_labels(input: &str) -> Option<(HashMap<String, String>, usize)> {
    let mut labels = HashMap::new();
    let mut chars = input.char_indices().peekable();

    loop {
        while let Some((_, c)) = chars.peek() {
            if *c == ',' || c.is_whitespace() {
                chars.next();
            } else {
                break;
            }
        }

        let (start, c) = chars.next()?;
        if c == '}' {
            return Some((labels, start + 1));
        }

        let mut key = String::from(c);
        loop {
            let (_, c) = chars.next()?;
            if c == '=' {
                break;
            }
            key.push(c);
        }

        if chars.next()?.1 != '"' {
            return None;
        }

        let mut value = String::new();
        loop {
            let (_, c) = chars.next()?;
            match c {
                '"' => break,
                '\\' => match chars.next()?.1 {
                    'n' => value.push('\n'),
                    other => value.push(other),
                },
                other => value.push(other),
            }
        }

        labels.insert(key.trim().to_string(), value);
    }
}
