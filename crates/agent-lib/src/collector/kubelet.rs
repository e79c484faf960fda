//! HTTP client for the node's kubelet

use super::summary::NodeSummary;
use super::IoMetricsSource;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Connection settings for the kubelet's authenticated port
#[derive(Debug, Clone)]
pub struct KubeletConfig {
    pub host: String,
    pub port: u16,
    /// Service account token sent as a bearer credential
    pub token_path: Option<PathBuf>,
    pub insecure_skip_verify: bool,
    pub timeout: Duration,
}

impl Default for KubeletConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 10250,
            token_path: Some(PathBuf::from(
                "/var/run/secrets/kubernetes.io/serviceaccount/token",
            )),
            insecure_skip_verify: true,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Reads node summary and cAdvisor metrics from the kubelet
pub struct KubeletClient {
    client: Client,
    base_url: Url,
    token_path: Option<PathBuf>,
}

impl KubeletClient {
    pub fn new(config: &KubeletConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .danger_accept_invalid_certs(config.insecure_skip_verify)
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = Url::parse(&format!("https://{}:{}/", config.host, config.port))
            .context("Invalid kubelet address")?;

        Ok(Self {
            client,
            base_url,
            token_path: config.token_path.clone(),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// The token is re-read per request; projected tokens rotate on disk
    async fn token(&self) -> Option<String> {
        let path = self.token_path.as_ref()?;
        match tokio::fs::read_to_string(path).await {
            Ok(token) => Some(token.trim().to_string()),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "No kubelet token available");
                None
            }
        }
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response> {
        let url = self.base_url.join(path).context("Invalid path")?;

        let mut request = self.client.get(url);
        if let Some(token) = self.token().await {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to query kubelet {path}"))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Kubelet error on {} ({}): {}", path, status, body);
        }

        Ok(response)
    }
}

#[async_trait]
impl IoMetricsSource for KubeletClient {
    async fn node_summary(&self) -> Result<NodeSummary> {
        self.get("stats/summary")
            .await?
            .json()
            .await
            .context("Failed to parse node summary")
    }

    async fn cadvisor_metrics(&self) -> Result<String> {
        self.get("metrics/cadvisor")
            .await?
            .text()
            .await
            .context("Failed to read cAdvisor metrics")
    }
}
