//! `projectgc run`

use crate::cli::logging::init_logging;
use crate::config::{Config, ConfigLoader};
use crate::gc::{
    DiscoveryClient, DiscoveryResourceMapper, GarbageCollector, PartitionId, PartitionSpec,
    serve_debug,
};
use crate::kube::{self, KubeDiscoveryClient, KubeEventRecorder, KubeMetadataClient};
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Overrides accepted on the command line
#[derive(Debug, Default, Clone)]
pub struct RunOptions {
    pub config: Option<PathBuf>,
    pub workers: Option<usize>,
    pub debug_address: Option<String>,
}

/// Load and validate configuration with command line overrides applied
pub fn resolve_config(options: &RunOptions) -> Result<Config> {
    let mut config =
        ConfigLoader::load(options.config.as_deref()).context("Failed to load configuration")?;
    if let Some(workers) = options.workers {
        config.workers = workers;
    }
    if let Some(address) = &options.debug_address {
        config.debug.address = address.clone();
    }
    ConfigLoader::validate(&config).context("Invalid configuration")?;
    Ok(config)
}

fn partition_spec(
    id: PartitionId,
    client: ::kube::Client,
    config: &Config,
    informers_started: watch::Receiver<bool>,
) -> (PartitionSpec, Arc<dyn DiscoveryClient>) {
    let discovery: Arc<dyn DiscoveryClient> = Arc::new(KubeDiscoveryClient::new(client.clone()));
    let spec = PartitionSpec {
        id,
        client: Arc::new(KubeMetadataClient::new(client)),
        mapper: Arc::new(DiscoveryResourceMapper::new(discovery.clone())),
        discovery: discovery.clone(),
        ignored_resources: config.ignored_resources(),
        informers_started,
        initial_sync_timeout: config.initial_sync_timeout(),
    };
    (spec, discovery)
}

/// Run the collector until Ctrl-C
pub async fn run(options: RunOptions) -> Result<()> {
    let config = resolve_config(&options)?;
    init_logging(&config.logger.level, config.logger.json);
    info!(
        workers = config.workers,
        partitions = config.partitions.len() + 1,
        "Starting projectgc"
    );

    let ctx = CancellationToken::new();
    {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl-C, shutting down");
            }
            ctx.cancel();
        });
    }

    let recorder = Arc::new(KubeEventRecorder::new("projectgc"));
    let gc = Arc::new(GarbageCollector::with_recorder(
        config.collector_options(),
        recorder.clone(),
    ));
    let (informers_started_tx, informers_started) = watch::channel(false);
    // Monitors are created stopped; release them before waiting on any sync.
    informers_started_tx.send_replace(true);

    let root_client = kube::create_client().await?;
    recorder.register(PartitionId::Root, root_client.clone());
    let (root_spec, root_discovery) =
        partition_spec(PartitionId::Root, root_client, &config, informers_started.clone());
    gc.add_partition(&ctx, root_spec)
        .await
        .context("Failed to register root partition")?;

    for partition in &config.partitions {
        let id = PartitionId::project(partition.id.as_str());
        let client = match kube::create_client_for_context(&partition.context).await {
            Ok(client) => client,
            Err(e) => {
                error!(partition = %id, error = %e, "Skipping partition");
                continue;
            }
        };
        recorder.register(id.clone(), client.clone());
        let (spec, _) = partition_spec(id.clone(), client, &config, informers_started.clone());
        if let Err(e) = gc.add_partition(&ctx, spec).await {
            error!(partition = %id, error = %e, "Failed to register partition");
        }
    }

    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(gc.clone().run(ctx.clone(), config.workers)));
    tasks.push(tokio::spawn(gc.clone().sync(
        ctx.clone(),
        root_discovery,
        config.sync_period(),
    )));

    if config.debug.enabled {
        let address: SocketAddr = config
            .debug
            .address
            .parse()
            .with_context(|| format!("Invalid debug address '{}'", config.debug.address))?;
        let gc = gc.clone();
        let ctx = ctx.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = serve_debug(address, gc, ctx).await {
                error!(%address, error = %e, "Debug server failed");
            }
        }));
    }

    ctx.cancelled().await;
    for result in futures::future::join_all(tasks).await {
        if let Err(e) = result {
            error!(error = %e, "Task panicked during shutdown");
        }
    }
    drop(informers_started_tx);
    info!("projectgc stopped");
    Ok(())
}
