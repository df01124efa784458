//! Steward operator - etcd cluster lifecycle management

use std::collections::HashMap;
use std::sync::Arc;

use clap::Parser;
use futures::TryStreamExt;
use kube::runtime::watcher::{self, Event};
use kube::{Api, Client, CustomResourceExt, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use steward::backup::{BackupCoordinator, SidecarBackup};
use steward::cluster::{Cluster, Config};
use steward::crd::EtcdCluster;
use steward::etcd::EtcdMembershipClient;
use steward::k8s::KubeOrchestrator;

/// Steward - Kubernetes operator managing replicated etcd clusters
#[derive(Parser, Debug)]
#[command(name = "steward", version, about, long_about = None)]
struct Cli {
    /// Generate the CRD manifest and exit
    #[arg(long)]
    crd: bool,

    /// Namespace to watch; watches all namespaces when unset
    #[arg(long, env = "WATCH_NAMESPACE")]
    namespace: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&EtcdCluster::crd())?;
        println!("{crd}");
        return Ok(());
    }

    info!("steward operator starting");

    let client = Client::try_default().await?;
    let api: Api<EtcdCluster> = match &cli.namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };

    let stop = CancellationToken::new();
    let mut clusters: HashMap<String, Cluster> = HashMap::new();

    let mut stream = std::pin::pin!(watcher::watcher(api, watcher::Config::default()));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received, leaving managed clusters in place");
                break;
            }
            event = stream.try_next() => match event? {
                Some(Event::Apply(obj) | Event::InitApply(obj)) => {
                    handle_apply(&client, &stop, &mut clusters, obj).await;
                }
                Some(Event::Delete(obj)) => {
                    if let Some(cluster) = clusters.remove(&resource_key(&obj)) {
                        info!(cluster = cluster.name(), "cluster resource deleted");
                        if let Err(e) = cluster.delete() {
                            error!(cluster = cluster.name(), error = %e, "failed to deliver delete event");
                        }
                        cluster.stopped().await;
                    }
                }
                Some(Event::Init | Event::InitDone) => {}
                None => break,
            }
        }
    }

    // Stop every loop without tearing clusters down; they survive restarts.
    stop.cancel();
    for (_, cluster) in clusters {
        cluster.stopped().await;
    }

    info!("steward operator stopped");
    Ok(())
}

fn resource_key(obj: &EtcdCluster) -> String {
    format!(
        "{}/{}",
        obj.namespace().unwrap_or_else(|| "default".to_string()),
        obj.name_any()
    )
}

async fn handle_apply(
    client: &Client,
    stop: &CancellationToken,
    clusters: &mut HashMap<String, Cluster>,
    obj: EtcdCluster,
) {
    let key = resource_key(&obj);

    if let Some(existing) = clusters.get(&key) {
        if let Err(e) = existing.update(obj) {
            error!(cluster = existing.name(), error = %e, "failed to deliver spec update");
        }
        return;
    }

    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    let backup = obj
        .spec
        .backup
        .as_ref()
        .map(|_| Arc::new(SidecarBackup::new(&name, &namespace)) as Arc<dyn BackupCoordinator>);
    let config = Config::new(
        Arc::new(KubeOrchestrator::new(client.clone(), &obj)),
        Arc::new(EtcdMembershipClient::new()),
        backup,
    );

    // A resource that already carries a status belongs to a cluster that
    // predates this process; re-adopt it instead of bootstrapping again.
    let result = if obj.status.is_some() {
        info!(cluster = %name, "re-adopting existing cluster");
        Cluster::restore(config, obj, stop.child_token()).await
    } else {
        info!(cluster = %name, "creating cluster");
        Cluster::create(config, obj, stop.child_token()).await
    };

    match result {
        Ok(cluster) => {
            clusters.insert(key, cluster);
        }
        Err(e) => {
            warn!(cluster = %name, error = %e, "failed to start cluster; will retry on the next resource event");
        }
    }
}
