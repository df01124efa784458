//! Per-cluster reconciliation core
//!
//! Every `EtcdCluster` resource gets one [`Cluster`]: a handle to a
//! dedicated task that owns all mutable state for that cluster and drives
//! it through its lifecycle. External input reaches the task only through
//! the bounded event queue (`update` / `delete`) and the stop token;
//! everything else the task learns by observing the orchestrator and the
//! data plane on a fixed tick.
//!
//! The tick loop makes at most one membership-changing decision per tick,
//! so a healthy cluster of size >= 3 never transits through a state that
//! breaks quorum.

mod reconcile;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use kube::ResourceExt;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backup::BackupCoordinator;
use crate::crd::{EtcdCluster, EtcdClusterSpec, EtcdClusterStatus, FailureReason};
use crate::etcd::MembershipClient;
use crate::k8s::{MemberPod, MemberState, Orchestrator, PodPhase, PodSummary};
use crate::member::{member_name, Member, MemberSet};
use crate::retry::{retry, RetryConfig};
use crate::{Error, Result, EVENT_QUEUE_CAPACITY, RECONCILE_INTERVAL_SECS};

/// External collaborators a cluster core runs against
#[derive(Clone)]
pub struct Config {
    /// Orchestrator adapter bound to this cluster
    pub orchestrator: Arc<dyn Orchestrator>,
    /// Data-plane membership client
    pub membership: Arc<dyn MembershipClient>,
    /// Backup coordinator; required when the spec carries a backup policy
    pub backup: Option<Arc<dyn BackupCoordinator>>,
    /// Interval between reconciliation ticks
    pub reconcile_interval: Duration,
}

impl Config {
    /// Config with the default tick interval
    pub fn new(
        orchestrator: Arc<dyn Orchestrator>,
        membership: Arc<dyn MembershipClient>,
        backup: Option<Arc<dyn BackupCoordinator>>,
    ) -> Self {
        Self {
            orchestrator,
            membership,
            backup,
            reconcile_interval: Duration::from_secs(RECONCILE_INTERVAL_SECS),
        }
    }
}

#[derive(Debug)]
enum ClusterEvent {
    Modify(Box<EtcdCluster>),
    Delete,
}

/// Handle to one cluster's reconciliation task
#[derive(Debug)]
pub struct Cluster {
    name: String,
    event_tx: mpsc::Sender<ClusterEvent>,
    last_spec: Mutex<EtcdClusterSpec>,
    handle: JoinHandle<()>,
}

impl Cluster {
    /// Create a fresh cluster: validate the spec, attach the backup
    /// coordinator if configured, create the seed member (unless the spec
    /// carries a restore marker) and the client service, then start the
    /// reconciliation loop.
    ///
    /// On error nothing is spawned; resources created before the failing
    /// step are not rolled back (their owner references let the
    /// orchestrator's garbage collector sweep them with the resource).
    pub async fn create(
        config: Config,
        resource: EtcdCluster,
        stop: CancellationToken,
    ) -> Result<Self> {
        Self::new(config, resource, stop, true).await
    }

    /// Like [`Cluster::create`] but without seed-member creation: the first
    /// tick observes zero running pods and enters disaster recovery.
    pub async fn restore(
        config: Config,
        resource: EtcdCluster,
        stop: CancellationToken,
    ) -> Result<Self> {
        Self::new(config, resource, stop, false).await
    }

    async fn new(
        config: Config,
        resource: EtcdCluster,
        stop: CancellationToken,
        is_new_cluster: bool,
    ) -> Result<Self> {
        resource.spec.validate()?;
        let name = resource.name_any();

        let backup = if resource.spec.backup.is_some() {
            Some(config.backup.ok_or_else(|| {
                Error::validation("spec has a backup policy but no coordinator was provided")
            })?)
        } else {
            None
        };

        let spec = resource.spec.clone();
        let status = resource.status.clone().unwrap_or_default();
        let mut core = ClusterCore {
            name: name.clone(),
            orchestrator: config.orchestrator,
            membership: config.membership,
            backup,
            resource,
            spec: spec.clone(),
            status,
            members: MemberSet::new(),
            id_counter: 0,
            reconcile_interval: config.reconcile_interval,
        };

        if is_new_cluster {
            if let Some(b) = &core.backup {
                b.setup().await?;
            }
            if core.spec.restore.is_none() {
                core.prepare_seed_member().await?;
            }
            core.orchestrator.create_client_service().await?;
        }

        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let handle = tokio::spawn(core.run(event_rx, stop));

        Ok(Self {
            name,
            event_tx,
            last_spec: Mutex::new(spec),
            handle,
        })
    }

    /// Name of the managed cluster
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Deliver a spec change.
    ///
    /// Only changes to `size`, `paused`, or `version` are forwarded; all
    /// other field changes are ignored to avoid spurious churn. The change
    /// takes effect on the loop's next timer tick.
    pub fn update(&self, resource: EtcdCluster) -> Result<()> {
        let mut last = self.last_spec.lock().expect("spec lock poisoned");
        if !resource.spec.differs_for_reconciler(&last) {
            return Ok(());
        }
        *last = resource.spec.clone();
        drop(last);
        self.send(ClusterEvent::Modify(Box::new(resource)))
    }

    /// Ask the loop to unwind and tear down everything it owns
    pub fn delete(&self) -> Result<()> {
        self.send(ClusterEvent::Delete)
    }

    /// Wait for the reconciliation task to finish
    pub async fn stopped(self) {
        let _ = self.handle.await;
    }

    fn send(&self, event: ClusterEvent) -> Result<()> {
        match self.event_tx.try_send(event) {
            Ok(()) => Ok(()),
            // The loop already stopped; the event has nowhere to go.
            Err(TrySendError::Closed(event)) => {
                debug!(cluster = %self.name, ?event, "loop stopped, dropping event");
                Ok(())
            }
            Err(TrySendError::Full(_)) => Err(Error::EventQueueFull(self.name.clone())),
        }
    }
}

enum TickOutcome {
    Continue,
    Fatal,
}

/// State owned exclusively by the reconciliation task
struct ClusterCore {
    name: String,
    orchestrator: Arc<dyn Orchestrator>,
    membership: Arc<dyn MembershipClient>,
    backup: Option<Arc<dyn BackupCoordinator>>,
    /// Latest observed copy of the declarative resource; carries the
    /// resourceVersion for optimistic-concurrency status writes
    resource: EtcdCluster,
    spec: EtcdClusterSpec,
    status: EtcdClusterStatus,
    /// Data-plane membership as of the last successful sync
    members: MemberSet,
    /// Next member ordinal; never decreases for the cluster's lifetime
    id_counter: u64,
    reconcile_interval: Duration,
}

impl ClusterCore {
    async fn run(mut self, mut events: mpsc::Receiver<ClusterEvent>, stop: CancellationToken) {
        let mut need_delete = false;
        self.status.set_phase_running();

        let mut ticker = tokio::time::interval(self.reconcile_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first interval tick completes immediately; consume it so the
        // first reconciliation happens a full interval after startup.
        ticker.tick().await;

        info!(cluster = %self.name, "reconciliation loop started");

        loop {
            tokio::select! {
                _ = stop.cancelled() => {
                    // Controller shutdown: the cluster outlives this process.
                    info!(cluster = %self.name, "stop signal received, leaving cluster resources in place");
                    break;
                }
                event = events.recv() => match event {
                    Some(ClusterEvent::Modify(resource)) => {
                        info!(
                            cluster = %self.name,
                            size = resource.spec.size,
                            version = %resource.spec.version,
                            paused = resource.spec.paused,
                            "spec updated"
                        );
                        self.spec = resource.spec.clone();
                        self.resource = *resource;
                    }
                    Some(ClusterEvent::Delete) => {
                        need_delete = true;
                        break;
                    }
                    None => {
                        // Every handle dropped; treat like a stop signal.
                        break;
                    }
                },
                _ = ticker.tick() => {
                    if let TickOutcome::Fatal = self.tick().await {
                        break;
                    }
                }
            }
        }

        self.teardown(need_delete).await;
    }

    /// One reconciliation tick
    async fn tick(&mut self) -> TickOutcome {
        if self.spec.paused {
            self.status.pause_control();
            info!(cluster = %self.name, "control is paused, skipping reconciliation");
            self.persist_status().await;
            return TickOutcome::Continue;
        }
        self.status.control();

        let pods = match self.orchestrator.list_pods().await {
            Ok(pods) => pods,
            Err(e) => {
                error!(cluster = %self.name, error = %e, "failed to poll pods");
                return TickOutcome::Continue;
            }
        };
        let (running, pending): (Vec<PodSummary>, Vec<PodSummary>) = pods
            .into_iter()
            .filter(|p| matches!(p.phase, PodPhase::Running | PodPhase::Pending))
            .partition(|p| p.phase == PodPhase::Running);

        if !pending.is_empty() {
            // A previous decision is still materializing.
            info!(
                cluster = %self.name,
                running = running.len(),
                pending = pending.len(),
                "pods still pending, skipping reconciliation"
            );
            return TickOutcome::Continue;
        }

        if running.is_empty() {
            warn!(cluster = %self.name, "all etcd pods are dead, trying to recover from backup");
            match self.disaster_recovery().await {
                Ok(()) => {}
                Err(Error::NoBackup) => {
                    error!(
                        cluster = %self.name,
                        "cluster cannot be recovered: all members are dead and there is no backup"
                    );
                    self.status.set_reason(FailureReason::NoBackup);
                    return TickOutcome::Fatal;
                }
                Err(e) => {
                    error!(cluster = %self.name, error = %e, "recovery failed, will retry");
                }
            }
            return TickOutcome::Continue;
        }

        match self.reconcile(&running).await {
            Ok(()) => {}
            Err(e) if e.is_not_ready() => {
                info!(cluster = %self.name, reason = %e, "skipping reconciliation");
            }
            Err(e) if e.is_fatal() => {
                error!(cluster = %self.name, error = %e, "exiting on fatal error");
                return TickOutcome::Fatal;
            }
            Err(e) => {
                error!(cluster = %self.name, error = %e, "failed to reconcile");
            }
        }

        self.persist_status().await;
        TickOutcome::Continue
    }

    /// Recover a cluster whose members are all gone by seeding a fresh
    /// member from the latest snapshot
    async fn disaster_recovery(&mut self) -> Result<()> {
        let backup = self.backup.as_ref().ok_or(Error::NoBackup)?;
        if !backup.latest_snapshot_exists().await? {
            return Err(Error::NoBackup);
        }

        // Sweep residual state so the recovered seed starts alone.
        for member in self.members.clone().iter() {
            self.remove_pod_and_service(&member.name).await?;
        }
        self.members = MemberSet::new();

        self.restore_seed_member().await
    }

    // =========================================================================
    // Seed-member creation
    // =========================================================================

    /// Create the first member of a fresh cluster, choosing between the
    /// plain, self-hosted, and boot-member-migration paths
    async fn prepare_seed_member(&mut self) -> Result<()> {
        match self.spec.self_hosted.clone() {
            None => self.start_seed_member(false, false).await,
            Some(sh) => match sh.boot_member() {
                None => self.start_seed_member(false, true).await,
                Some(endpoint) => self.migrate_boot_member(endpoint).await,
            },
        }
    }

    async fn restore_seed_member(&mut self) -> Result<()> {
        self.start_seed_member(true, false).await
    }

    async fn start_seed_member(&mut self, recover_from_backup: bool, self_hosted: bool) -> Result<()> {
        let member = Member::named(member_name(&self.name, self.id_counter));
        let members = MemberSet::with_member(member.clone());
        if let Err(e) = self
            .create_pod_and_service(&members, &member, MemberState::New, recover_from_backup, self_hosted)
            .await
        {
            error!(cluster = %self.name, member = %member.name, error = %e, "failed to create seed member");
            return Err(e);
        }
        self.id_counter += 1;
        info!(cluster = %self.name, member = %member.name, "cluster created with seed member");
        Ok(())
    }

    /// Register the first managed member with an existing external boot
    /// member, then start its pod against that cluster
    async fn migrate_boot_member(&mut self, boot_endpoint: &str) -> Result<()> {
        let member = Member::named(member_name(&self.name, self.id_counter));
        info!(
            cluster = %self.name,
            member = %member.name,
            endpoint = boot_endpoint,
            "migrating boot member into managed cluster"
        );

        let added = self
            .membership
            .member_add(vec![boot_endpoint.to_string()], member.peer_urls.clone())
            .await?;

        // The freshly added member has no name yet on the data plane; use
        // ours when assembling the bootstrap peer list.
        let initial_cluster = added
            .members
            .iter()
            .map(|rm| {
                let name = if rm.id == added.added_id {
                    member.name.as_str()
                } else {
                    rm.name.as_str()
                };
                let peer = rm.peer_urls.first().map(String::as_str).unwrap_or_default();
                format!("{name}={peer}")
            })
            .collect();

        self.orchestrator
            .create_member_service(member.name.clone())
            .await?;
        self.orchestrator
            .create_member_pod(MemberPod {
                member: member.clone(),
                initial_cluster,
                state: MemberState::Existing,
                token: String::new(),
                version: self.spec.version.clone(),
                recovery: None,
                self_hosted: true,
            })
            .await?;

        self.id_counter += 1;
        info!(cluster = %self.name, member = %member.name, "boot member migrated");
        Ok(())
    }

    /// Create a member's service, then its pod. The service must exist
    /// first so peer DNS resolves when the process starts.
    async fn create_pod_and_service(
        &self,
        members: &MemberSet,
        member: &Member,
        state: MemberState,
        recover_from_backup: bool,
        self_hosted: bool,
    ) -> Result<()> {
        self.orchestrator
            .create_member_service(member.name.clone())
            .await?;

        let token = match state {
            MemberState::New => Uuid::new_v4().to_string(),
            MemberState::Existing => String::new(),
        };
        let recovery = if recover_from_backup {
            self.backup.as_ref().map(|b| b.recovery_hint())
        } else {
            None
        };

        self.orchestrator
            .create_member_pod(MemberPod {
                member: member.clone(),
                initial_cluster: members.peer_url_pairs(),
                state,
                token,
                version: self.spec.version.clone(),
                recovery,
                self_hosted,
            })
            .await
    }

    async fn remove_pod_and_service(&self, name: &str) -> Result<()> {
        self.orchestrator.delete_service(name.to_string()).await?;
        self.orchestrator.delete_pod(name.to_string()).await
    }

    // =========================================================================
    // Status persistence and teardown
    // =========================================================================

    /// Persist the in-memory status when it drifted from the resource.
    /// Best-effort: failures are logged and retried on the next tick.
    async fn persist_status(&mut self) {
        if self.resource.status.as_ref() == Some(&self.status) {
            return;
        }
        let mut updated = self.resource.clone();
        updated.status = Some(self.status.clone());
        match self.orchestrator.update_status(updated).await {
            Ok(resource) => self.resource = resource,
            Err(e) => warn!(cluster = %self.name, error = %e, "failed to update cluster status"),
        }
    }

    /// Runs after the loop exits, on every path.
    ///
    /// With `need_delete` (a Delete event) every owned resource is removed
    /// best-effort. In all cases the resource is closed out by marking it
    /// Failed, retrying the write at a fixed interval until it lands.
    async fn teardown(mut self, need_delete: bool) {
        if need_delete {
            info!(cluster = %self.name, "deleting cluster");
            self.delete_resources().await;
        }

        self.status.set_phase_failed();
        let mut final_resource = self.resource.clone();
        final_resource.status = Some(self.status.clone());
        // The loop is gone and nothing else writes this status; write
        // unconditionally so a stale resourceVersion cannot wedge the retry.
        final_resource.metadata.resource_version = None;

        let orchestrator = self.orchestrator.clone();
        let config = RetryConfig::fixed(Duration::from_secs(5));
        let _ = retry(&config, "persist terminal status", || {
            let orchestrator = orchestrator.clone();
            let resource = final_resource.clone();
            async move { orchestrator.update_status(resource).await }
        })
        .await;

        info!(cluster = %self.name, "reconciliation loop stopped");
    }

    async fn delete_resources(&mut self) {
        match self.orchestrator.list_pods().await {
            Ok(pods) => {
                for pod in pods {
                    if let Err(e) = self.remove_pod_and_service(&pod.name).await {
                        error!(
                            cluster = %self.name,
                            pod = %pod.name,
                            error = %e,
                            "cluster deletion: failed to delete pod and service"
                        );
                    }
                }
            }
            Err(e) => {
                error!(cluster = %self.name, error = %e, "cluster deletion: cannot list pods");
            }
        }

        if let Err(e) = self.orchestrator.delete_client_service().await {
            error!(cluster = %self.name, error = %e, "cluster deletion: failed to delete client service");
        }

        if let Some(backup) = &self.backup {
            if let Err(e) = backup.cleanup().await {
                error!(cluster = %self.name, error = %e, "cluster deletion: backup cleanup failed");
            }
        }
    }
}
