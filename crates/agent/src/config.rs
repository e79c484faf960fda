//! Agent configuration
//!
//! An optional file named by `SMARTLIMIT_CONFIG` is layered under environment
//! variables such as `SMARTLIMIT_SMART_LIMIT__IOPS_THRESHOLD=2000`.

use anyhow::{Context, Result};
use serde::Deserialize;
use smartlimit_lib::collector::KubeletConfig;
use smartlimit_lib::models::CgroupVersion;
use smartlimit_lib::runtime::RuntimeKind;
use smartlimit_lib::smartlimit::SmartLimitConfig;
use std::path::PathBuf;
use std::time::Duration;

const CONFIG_PATH_VAR: &str = "SMARTLIMIT_CONFIG";

/// Environment keys holding comma-separated lists
const LIST_KEYS: [&str; 3] = [
    "smart_limit.exclude_namespaces",
    "smart_limit.exclude_labels",
    "smart_limit.exclude_keywords",
];

/// Agent configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub agent: AgentSettings,
    #[serde(default)]
    pub kubelet: KubeletSettings,
    #[serde(default)]
    pub cgroup: CgroupSettings,
    #[serde(default)]
    pub runtime: RuntimeSettings,
    #[serde(default)]
    pub smart_limit: SmartLimitConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentSettings {
    /// Node name from Kubernetes downward API
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Explicit kubeconfig; in-cluster config otherwise
    #[serde(default)]
    pub kubeconfig: Option<PathBuf>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            node_name: default_node_name(),
            api_port: default_api_port(),
            kubeconfig: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct KubeletSettings {
    #[serde(default = "default_kubelet_host")]
    pub host: String,
    #[serde(default = "default_kubelet_port")]
    pub port: u16,
    #[serde(default = "default_token_path")]
    pub token_path: Option<PathBuf>,
    #[serde(default = "default_insecure_skip_verify")]
    pub insecure_skip_verify: bool,
    #[serde(default = "default_kubelet_timeout")]
    pub timeout_secs: u64,
}

impl Default for KubeletSettings {
    fn default() -> Self {
        Self {
            host: default_kubelet_host(),
            port: default_kubelet_port(),
            token_path: default_token_path(),
            insecure_skip_verify: default_insecure_skip_verify(),
            timeout_secs: default_kubelet_timeout(),
        }
    }
}

impl KubeletSettings {
    pub fn client_config(&self) -> KubeletConfig {
        KubeletConfig {
            host: self.host.clone(),
            port: self.port,
            token_path: self.token_path.clone(),
            insecure_skip_verify: self.insecure_skip_verify,
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}

/// Which cgroup hierarchy to drive
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CgroupVersionSetting {
    #[default]
    Auto,
    V1,
    V2,
}

impl CgroupVersionSetting {
    /// `None` means detect from the filesystem
    pub fn fixed(&self) -> Option<CgroupVersion> {
        match self {
            CgroupVersionSetting::Auto => None,
            CgroupVersionSetting::V1 => Some(CgroupVersion::V1),
            CgroupVersionSetting::V2 => Some(CgroupVersion::V2),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CgroupSettings {
    #[serde(default = "default_cgroup_root")]
    pub root: PathBuf,
    #[serde(default)]
    pub version: CgroupVersionSetting,
    /// `major:minor` of the throttled device; resolved from `data_root` if unset
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default = "default_data_root")]
    pub data_root: PathBuf,
}

impl Default for CgroupSettings {
    fn default() -> Self {
        Self {
            root: default_cgroup_root(),
            version: CgroupVersionSetting::default(),
            device: None,
            data_root: default_data_root(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuntimeSettings {
    #[serde(default)]
    pub kind: RuntimeKind,
    /// Runtime state directory; the runtime's default if unset
    #[serde(default)]
    pub state_dir: Option<String>,
}

fn default_node_name() -> String {
    std::env::var("NODE_NAME").unwrap_or_else(|_| "unknown".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_kubelet_host() -> String {
    std::env::var("NODE_IP").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_kubelet_port() -> u16 {
    10250
}

fn default_token_path() -> Option<PathBuf> {
    KubeletConfig::default().token_path
}

fn default_insecure_skip_verify() -> bool {
    true
}

fn default_kubelet_timeout() -> u64 {
    30
}

fn default_cgroup_root() -> PathBuf {
    PathBuf::from(smartlimit_lib::cgroup::DEFAULT_CGROUP_ROOT)
}

fn default_data_root() -> PathBuf {
    PathBuf::from("/var/lib/containerd")
}

impl AgentConfig {
    /// Load configuration from the optional file and the environment
    pub fn load() -> Result<Self> {
        Self::load_from(std::env::var(CONFIG_PATH_VAR).ok().map(PathBuf::from))
    }

    pub fn load_from(path: Option<PathBuf>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = &path {
            builder = builder.add_source(config::File::from(path.as_path()).required(true));
        }

        let mut environment = config::Environment::with_prefix("SMARTLIMIT")
            .prefix_separator("_")
            .separator("__")
            .list_separator(",")
            .try_parsing(true);
        for key in LIST_KEYS {
            environment = environment.with_list_parse_key(key);
        }

        let config: AgentConfig = builder
            .add_source(environment)
            .build()
            .context("Failed to load configuration")?
            .try_deserialize()
            .context("Invalid configuration")?;

        config.smart_limit.validate()?;
        Ok(config)
    }
}
