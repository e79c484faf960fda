//! Which pods the engine leaves alone

use super::SmartLimitConfig;
use crate::models::PodInfo;

/// Pod exclusion by namespace, label and name keyword
#[derive(Debug, Clone, Default)]
pub struct ExclusionPolicy {
    namespaces: Vec<String>,
    labels: Vec<LabelSelector>,
    keywords: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum LabelSelector {
    Exists(String),
    Equals(String, String),
}

impl LabelSelector {
    fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        Some(match raw.split_once('=') {
            Some((key, value)) => LabelSelector::Equals(key.trim().into(), value.trim().into()),
            None => LabelSelector::Exists(raw.to_string()),
        })
    }

    fn matches(&self, pod: &PodInfo) -> bool {
        match self {
            LabelSelector::Exists(key) => pod.labels.contains_key(key),
            LabelSelector::Equals(key, value) => pod.labels.get(key) == Some(value),
        }
    }
}

impl ExclusionPolicy {
    pub fn new(namespaces: &[String], labels: &[String], keywords: &[String]) -> Self {
        Self {
            namespaces: namespaces.to_vec(),
            labels: labels.iter().filter_map(|l| LabelSelector::parse(l)).collect(),
            keywords: keywords
                .iter()
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty())
                .collect(),
        }
    }

    pub fn from_config(config: &SmartLimitConfig) -> Self {
        Self::new(
            &config.exclude_namespaces,
            &config.exclude_labels,
            &config.exclude_keywords,
        )
    }

    pub fn is_excluded(&self, pod: &PodInfo) -> bool {
        self.namespaces.iter().any(|ns| ns == &pod.namespace)
            || self.labels.iter().any(|l| l.matches(pod))
            || self.keywords.iter().any(|k| pod.name.contains(k.as_str()))
    }
}
