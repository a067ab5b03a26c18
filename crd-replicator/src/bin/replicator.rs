//! CRD replicator binary.
//!
//! Runs the replication engine against the in-cluster (or kubeconfig)
//! client, fed by `PeerCluster` and `ReplicationPolicy` objects.

use clap::Parser;
use crd_replicator::connector::KubePeerConnector;
use crd_replicator::controller::{KubePhaseReporter, watch_peer_clusters, watch_policies};
use crd_replicator::observability::{LogFormat, init_tracing};
use crd_replicator::store::KubeObjectApi;
use crd_replicator::{PeerCluster, ReplicationEngine, ReplicationPolicy, ReplicatorConfig};
use kube::{Client, CustomResourceExt};
use std::path::PathBuf;
use std::sync::Arc;

/// Replicate custom resources to peer clusters.
#[derive(Debug, Parser)]
#[command(name = "crd-replicator", version, about)]
struct Args {
    /// YAML configuration file.
    #[arg(long, env = "REPLICATOR_CONFIG")]
    config: Option<PathBuf>,

    /// Identifier of the local cluster. Overrides the file.
    #[arg(long, env = "REPLICATOR_CLUSTER_ID")]
    cluster_id: Option<String>,

    /// Only replicate objects of this namespace. Overrides the file.
    #[arg(long, env = "REPLICATOR_NAMESPACE")]
    namespace: Option<String>,

    /// Namespace of PeerCluster objects and their Secrets. Overrides the file.
    #[arg(long, env = "REPLICATOR_PEER_NAMESPACE")]
    peer_namespace: Option<String>,

    /// Print the CRDs as YAML and exit.
    #[arg(long)]
    generate_crds: bool,

    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty, env = "REPLICATOR_LOG_FORMAT")]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.generate_crds {
        generate_crds()?;
        return Ok(());
    }

    init_tracing(args.log_format)?;

    let mut config = match &args.config {
        Some(path) => ReplicatorConfig::from_file(path)?,
        None => ReplicatorConfig::default(),
    };
    if let Some(cluster_id) = args.cluster_id {
        config.cluster_id = cluster_id;
    }
    if let Some(namespace) = args.namespace {
        config.namespace = Some(namespace);
    }
    if let Some(peer_namespace) = args.peer_namespace {
        config.peer_namespace = peer_namespace;
    }
    config.check()?;

    tracing::info!(cluster = %config.cluster_id, "Starting CRD replicator");

    let client = Client::try_default().await?;
    tracing::info!("Connected to Kubernetes cluster");

    let peer_namespace = config.peer_namespace.clone();
    let engine = ReplicationEngine::builder(config)
        .local(Arc::new(KubeObjectApi::new(client.clone())))
        .connector(Arc::new(KubePeerConnector::new(client.clone(), &peer_namespace)))
        .reporter(Arc::new(KubePhaseReporter::new(client.clone(), &peer_namespace)))
        .start()
        .await?;

    let peers = tokio::spawn(watch_peer_clusters(client.clone(), peer_namespace.clone(), engine.clone()));
    let policies = tokio::spawn(watch_policies(client, engine.clone()));

    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("Shutdown signal received");
        }
        result = peers => {
            tracing::error!(result = ?result, "PeerCluster watcher exited");
        }
        result = policies => {
            tracing::error!(result = ?result, "ReplicationPolicy watcher exited");
        }
    }

    engine.shutdown().await;
    tracing::info!("CRD replicator stopped");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Generate CRD YAML.
fn generate_crds() -> anyhow::Result<()> {
    println!("---");
    println!("{}", serde_yaml::to_string(&PeerCluster::crd())?);
    println!("---");
    println!("{}", serde_yaml::to_string(&ReplicationPolicy::crd())?);
    Ok(())
}
