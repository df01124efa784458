//! Orchestrator adapter
//!
//! Everything the reconciler asks of Kubernetes goes through the
//! [`Orchestrator`] trait: per-member services, member pods, label-filtered
//! pod listings, the client-facing service, and status persistence. The
//! real implementation is [`KubeOrchestrator`].
//!
//! Create and delete operations are idempotent: "already exists" on create
//! and "not found" on delete count as success, everything else propagates
//! to the reconciler, which logs it and retries on the next tick.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EmptyDirVolumeSource, Pod, PodSpec, Service, ServicePort,
    ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::backup::RecoveryHint;
use crate::crd::EtcdCluster;
use crate::member::Member;
use crate::{Result, ETCD_CLIENT_PORT, ETCD_PEER_PORT};

/// Repository of the etcd container images
const ETCD_IMAGE_REPO: &str = "quay.io/coreos/etcd";

/// Where the etcd container keeps its write-ahead log and snapshots
const DATA_DIR: &str = "/var/etcd/data";

/// Mount point of the shared data volume
const ETCD_VOLUME_DIR: &str = "/var/etcd";

/// True for errors Kubernetes reports when the resource already exists
pub fn is_already_exists(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}

/// True for errors Kubernetes reports when the resource does not exist
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// Coarse pod phase as the reconciler sees it
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PodPhase {
    /// The pod is scheduled and its containers run
    Running,
    /// The pod exists but is still materializing
    Pending,
    /// Any terminal or unknown phase; ignored by the reconciler
    Other,
}

impl PodPhase {
    fn from_kube(phase: Option<&str>) -> Self {
        match phase {
            Some("Running") => Self::Running,
            Some("Pending") => Self::Pending,
            _ => Self::Other,
        }
    }
}

/// One workload instance of this cluster, as listed by the orchestrator
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodSummary {
    /// Pod name; equals the member name
    pub name: String,
    /// Coarse phase
    pub phase: PodPhase,
    /// etcd version the pod runs, parsed from its image tag
    pub version: Option<String>,
}

/// Cluster-state flag passed to a new member's etcd process
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemberState {
    /// First member of a brand-new cluster; gets a bootstrap token
    New,
    /// Joining an existing cluster
    Existing,
}

impl MemberState {
    /// The value etcd's `--initial-cluster-state` flag expects
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Existing => "existing",
        }
    }
}

/// Everything needed to materialize one member's pod
#[derive(Clone, Debug, PartialEq)]
pub struct MemberPod {
    /// The member this pod runs
    pub member: Member,
    /// `name=peerURL` pairs of the membership the process boots into
    pub initial_cluster: Vec<String>,
    /// Cluster-state flag
    pub state: MemberState,
    /// Bootstrap token; empty unless `state` is `New`
    pub token: String,
    /// etcd image tag to run
    pub version: String,
    /// When set, the pod fetches and restores this snapshot before etcd starts
    pub recovery: Option<RecoveryHint>,
    /// Run on the host network, for self-hosted seed members
    pub self_hosted: bool,
}

/// Operations the reconciler needs from the orchestrator
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Create the per-member service giving `member_name` a stable DNS name.
    /// Must happen before the member's pod so peer DNS resolves at startup.
    async fn create_member_service(&self, member_name: String) -> Result<()>;

    /// Delete a service by name; missing services count as deleted
    async fn delete_service(&self, name: String) -> Result<()>;

    /// Create one member pod
    async fn create_member_pod(&self, pod: MemberPod) -> Result<()>;

    /// Delete a pod by name with immediate termination; missing pods count
    /// as deleted
    async fn delete_pod(&self, name: String) -> Result<()>;

    /// List this cluster's pods (by cluster label), with phase and version
    async fn list_pods(&self) -> Result<Vec<PodSummary>>;

    /// Publish the client-facing service that load-balances over all members
    async fn create_client_service(&self) -> Result<()>;

    /// Delete the client-facing service
    async fn delete_client_service(&self) -> Result<()>;

    /// Persist the cluster resource's status subresource.
    ///
    /// Returns the updated resource so the caller carries the fresh
    /// resourceVersion into its next write (optimistic concurrency).
    async fn update_status(&self, cluster: EtcdCluster) -> Result<EtcdCluster>;
}

/// Real orchestrator adapter bound to one cluster in one namespace
pub struct KubeOrchestrator {
    client: Client,
    cluster_name: String,
    namespace: String,
    owner: Option<OwnerReference>,
}

impl KubeOrchestrator {
    /// Create an adapter for the given cluster resource
    pub fn new(client: Client, cluster: &EtcdCluster) -> Self {
        Self {
            client,
            cluster_name: cluster.name_any(),
            namespace: cluster.namespace().unwrap_or_else(|| "default".to_string()),
            owner: cluster.controller_owner_ref(&()),
        }
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn services(&self) -> Api<Service> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn cluster_selector(&self) -> String {
        format!("app=etcd,etcd_cluster={}", self.cluster_name)
    }

    fn metadata(&self, name: &str, labels: BTreeMap<String, String>) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(self.namespace.clone()),
            labels: Some(labels),
            owner_references: self.owner.clone().map(|o| vec![o]),
            ..Default::default()
        }
    }
}

#[async_trait]
impl Orchestrator for KubeOrchestrator {
    async fn create_member_service(&self, member_name: String) -> Result<()> {
        let labels = member_labels(&self.cluster_name, &member_name);
        let svc = Service {
            metadata: self.metadata(&member_name, labels.clone()),
            spec: Some(ServiceSpec {
                selector: Some(labels),
                ports: Some(vec![
                    ServicePort {
                        name: Some("client".to_string()),
                        port: ETCD_CLIENT_PORT,
                        ..Default::default()
                    },
                    ServicePort {
                        name: Some("peer".to_string()),
                        port: ETCD_PEER_PORT,
                        ..Default::default()
                    },
                ]),
                ..Default::default()
            }),
            ..Default::default()
        };

        match self.services().create(&PostParams::default(), &svc).await {
            Ok(_) => {
                debug!(service = %member_name, "member service created");
                Ok(())
            }
            Err(e) if is_already_exists(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_service(&self, name: String) -> Result<()> {
        match self.services().delete(&name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_member_pod(&self, pod: MemberPod) -> Result<()> {
        let name = pod.member.name.clone();
        let built = build_member_pod(
            &pod,
            self.metadata(&name, member_labels(&self.cluster_name, &name)),
        );
        self.pods().create(&PostParams::default(), &built).await?;
        debug!(pod = %name, state = pod.state.as_str(), "member pod created");
        Ok(())
    }

    async fn delete_pod(&self, name: String) -> Result<()> {
        let dp = DeleteParams {
            grace_period_seconds: Some(0),
            ..Default::default()
        };
        match self.pods().delete(&name, &dp).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_pods(&self) -> Result<Vec<PodSummary>> {
        let lp = ListParams::default().labels(&self.cluster_selector());
        let pods = self.pods().list(&lp).await?;
        Ok(pods
            .items
            .iter()
            .map(|p| PodSummary {
                name: p.name_any(),
                phase: PodPhase::from_kube(
                    p.status.as_ref().and_then(|s| s.phase.as_deref()),
                ),
                version: pod_etcd_version(p),
            })
            .collect())
    }

    async fn create_client_service(&self) -> Result<()> {
        let svc = Service {
            metadata: self.metadata(
                &self.cluster_name,
                cluster_labels(&self.cluster_name),
            ),
            spec: Some(ServiceSpec {
                selector: Some(cluster_labels(&self.cluster_name)),
                ports: Some(vec![ServicePort {
                    name: Some("client".to_string()),
                    port: ETCD_CLIENT_PORT,
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };

        match self.services().create(&PostParams::default(), &svc).await {
            Ok(_) => {
                debug!(service = %self.cluster_name, "client service created");
                Ok(())
            }
            Err(e) if is_already_exists(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_client_service(&self) -> Result<()> {
        self.delete_service(self.cluster_name.clone()).await
    }

    async fn update_status(&self, cluster: EtcdCluster) -> Result<EtcdCluster> {
        let api: Api<EtcdCluster> = Api::namespaced(self.client.clone(), &self.namespace);
        let name = cluster.name_any();
        let data = serde_json::to_vec(&cluster)?;
        let updated = api
            .replace_status(&name, &PostParams::default(), data)
            .await?;
        Ok(updated)
    }
}

/// The etcd image for a version tag
pub fn etcd_image(version: &str) -> String {
    format!("{ETCD_IMAGE_REPO}:{version}")
}

/// Parse the etcd version a pod runs out of its container image tag
fn pod_etcd_version(pod: &Pod) -> Option<String> {
    pod.spec
        .as_ref()?
        .containers
        .iter()
        .find(|c| c.name == "etcd")?
        .image
        .as_ref()?
        .rsplit_once(':')
        .map(|(_, tag)| tag.to_string())
}

fn cluster_labels(cluster: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert("app".to_string(), "etcd".to_string());
    labels.insert("etcd_cluster".to_string(), cluster.to_string());
    labels
}

fn member_labels(cluster: &str, member: &str) -> BTreeMap<String, String> {
    let mut labels = cluster_labels(cluster);
    labels.insert("etcd_node".to_string(), member.to_string());
    labels
}

fn build_member_pod(pod: &MemberPod, metadata: ObjectMeta) -> Pod {
    let m = &pod.member;
    let mut command = vec![
        "/usr/local/bin/etcd".to_string(),
        format!("--data-dir={DATA_DIR}"),
        format!("--name={}", m.name),
        format!("--initial-advertise-peer-urls={}", m.peer_url()),
        format!("--listen-peer-urls=http://0.0.0.0:{ETCD_PEER_PORT}"),
        format!("--listen-client-urls=http://0.0.0.0:{ETCD_CLIENT_PORT}"),
        format!("--advertise-client-urls={}", m.client_url()),
        format!("--initial-cluster={}", pod.initial_cluster.join(",")),
        format!("--initial-cluster-state={}", pod.state.as_str()),
    ];
    if matches!(pod.state, MemberState::New) {
        command.push(format!("--initial-cluster-token={}", pod.token));
    }

    let data_mount = VolumeMount {
        name: "etcd-data".to_string(),
        mount_path: ETCD_VOLUME_DIR.to_string(),
        ..Default::default()
    };

    let etcd_container = Container {
        name: "etcd".to_string(),
        image: Some(etcd_image(&pod.version)),
        command: Some(command),
        ports: Some(vec![
            ContainerPort {
                name: Some("client".to_string()),
                container_port: ETCD_CLIENT_PORT,
                ..Default::default()
            },
            ContainerPort {
                name: Some("peer".to_string()),
                container_port: ETCD_PEER_PORT,
                ..Default::default()
            },
        ]),
        volume_mounts: Some(vec![data_mount.clone()]),
        ..Default::default()
    };

    let init_containers = pod.recovery.as_ref().map(|hint| {
        let snapshot = format!("{ETCD_VOLUME_DIR}/latest.snapshot");
        vec![
            Container {
                name: "fetch-backup".to_string(),
                image: Some("busybox:1.37".to_string()),
                command: Some(vec![
                    "wget".to_string(),
                    "-O".to_string(),
                    snapshot.clone(),
                    hint.snapshot_url.clone(),
                ]),
                volume_mounts: Some(vec![data_mount.clone()]),
                ..Default::default()
            },
            Container {
                name: "restore-datadir".to_string(),
                image: Some(etcd_image(&pod.version)),
                command: Some(vec![
                    "/bin/sh".to_string(),
                    "-ec".to_string(),
                    format!(
                        "ETCDCTL_API=3 etcdctl snapshot restore {snapshot} \
                         --name {name} \
                         --initial-cluster {cluster} \
                         --initial-cluster-token {token} \
                         --initial-advertise-peer-urls {peer} \
                         --data-dir {DATA_DIR}",
                        name = m.name,
                        cluster = pod.initial_cluster.join(","),
                        token = pod.token,
                        peer = m.peer_url(),
                    ),
                ]),
                volume_mounts: Some(vec![data_mount]),
                ..Default::default()
            },
        ]
    });

    Pod {
        metadata,
        spec: Some(PodSpec {
            containers: vec![etcd_container],
            init_containers,
            restart_policy: Some("Never".to_string()),
            host_network: pod.self_hosted.then_some(true),
            dns_policy: pod
                .self_hosted
                .then(|| "ClusterFirstWithHostNet".to_string()),
            volumes: Some(vec![Volume {
                name: "etcd-data".to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}
