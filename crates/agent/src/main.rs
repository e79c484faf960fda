//! SmartLimit Agent - adaptive per-container disk I/O throttling
//!
//! This binary runs as a DaemonSet on each Kubernetes node, watching
//! container block I/O through the kubelet and throttling sustained heavy
//! writers and readers through cgroups.

use anyhow::{Context, Result};
use smartlimit_agent::{api, config::AgentConfig};
use smartlimit_lib::{
    cgroup::{CgroupLimiter, DeviceResolver, MountinfoDeviceResolver, StaticDevice},
    collector::KubeletClient,
    health::{Component, HealthRegistry},
    k8s::KubePodStore,
    observability::{AgentMetrics, StructuredLogger},
    runtime::create_runtime,
    smartlimit::SmartLimitManager,
};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting smartlimit-agent");

    let config = AgentConfig::load()?;
    for warning in config.smart_limit.warnings() {
        warn!(warning = %warning, "Configuration warning");
    }
    info!(
        node_name = %config.agent.node_name,
        runtime = %config.runtime.kind,
        "Agent configured"
    );

    let health_registry = HealthRegistry::new();

    let metrics = AgentMetrics::new().context("Failed to register metrics")?;
    let logger = StructuredLogger::new(&config.agent.node_name);

    // Liveness and metrics are served while the engine is still starting
    let app_state = Arc::new(api::AppState::new(health_registry.clone(), metrics.clone()));
    let api_handle = tokio::spawn(api::serve(config.agent.api_port, app_state));

    if !config.smart_limit.enabled {
        warn!("SmartLimit disabled by configuration, serving health endpoints only");
        health_registry.set_ready(true).await;
        tokio::signal::ctrl_c().await?;
        logger.log_shutdown("SIGINT received");
        api_handle.abort();
        return Ok(());
    }

    let source = Arc::new(KubeletClient::new(&config.kubelet.client_config())?);
    let pods = Arc::new(
        KubePodStore::connect(config.agent.kubeconfig.as_deref(), &config.agent.node_name)
            .await?,
    );
    let runtime = create_runtime(config.runtime.kind, config.runtime.state_dir.as_deref());

    let limiter = match config.cgroup.version.fixed() {
        Some(version) => CgroupLimiter::new(&config.cgroup.root, version),
        None => CgroupLimiter::detect(&config.cgroup.root).await,
    };
    let devices: Arc<dyn DeviceResolver> = match &config.cgroup.device {
        Some(device) => Arc::new(StaticDevice::new(device.as_str())?),
        None => Arc::new(MountinfoDeviceResolver::new(&config.cgroup.data_root)),
    };

    logger.log_startup(AGENT_VERSION, &limiter.version().to_string());

    let manager = Arc::new(
        SmartLimitManager::builder()
            .config(config.smart_limit.clone())
            .metrics_source(source)
            .pod_store(pods)
            .runtime(runtime)
            .limiter(limiter)
            .device_resolver(devices)
            .metrics(metrics)
            .health(health_registry.clone())
            .node_name(&config.agent.node_name)
            .build()?,
    );

    // Ready once recovery has run, even if it failed
    match manager.restore_limit_status().await {
        Ok(restored) => info!(restored, "Limit state recovered"),
        Err(e) => {
            error!(error = %e, "Failed to restore limit state from annotations");
            health_registry
                .record_failure(Component::Kubernetes, e.to_string())
                .await;
        }
    }
    health_registry.set_ready(true).await;

    let tasks = manager.start();

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            logger.log_shutdown("SIGINT received");
        }
        result = api_handle => {
            match result {
                Ok(Err(e)) => error!(error = %e, "API server failed"),
                Err(e) => error!(error = %e, "API server task panicked"),
                Ok(Ok(())) => {}
            }
            logger.log_shutdown("API server stopped");
        }
    }

    manager.stop();
    tasks.join().await;
    info!("Shutdown complete");

    Ok(())
}
