//! Kubernetes client module
//!
//! Builds kube-rs clients for the root cluster and for each project
//! partition, and adapts them to the collector's client seams.
//!
//! Proxy settings come from the kubeconfig `proxy-url` field or the standard
//! `HTTP_PROXY` / `HTTPS_PROXY` / `NO_PROXY` environment variables.

mod discovery;
mod events;
mod metadata;

pub use discovery::KubeDiscoveryClient;
pub use events::KubeEventRecorder;
pub use metadata::KubeMetadataClient;

use anyhow::{Context, Result};
use kube::config::KubeConfigOptions;
use kube::{Client, Config};
use tracing::debug;

/// Client for the root partition
///
/// Uses the default loading strategy:
/// 1. In-cluster config (if running in a pod)
/// 2. KUBECONFIG environment variable
/// 3. ~/.kube/config
pub async fn create_client() -> Result<Client> {
    let config = Config::infer()
        .await
        .context("Failed to infer Kubernetes configuration")?;
    debug!(cluster_url = %config.cluster_url, "Connecting to root cluster");
    Client::try_from(config).context("Failed to create Kubernetes client")
}

/// Client for a named kubeconfig context
pub async fn create_client_for_context(context: &str) -> Result<Client> {
    let options = KubeConfigOptions {
        context: Some(context.to_string()),
        ..Default::default()
    };
    let config = Config::from_kubeconfig(&options)
        .await
        .with_context(|| format!("Failed to load kubeconfig context '{}'", context))?;
    debug!(context, cluster_url = %config.cluster_url, "Connecting to partition cluster");
    Client::try_from(config)
        .with_context(|| format!("Failed to create client for context '{}'", context))
}
