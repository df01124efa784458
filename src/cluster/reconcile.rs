//! Membership reconciliation
//!
//! One reconciliation pass compares three views of the cluster: the
//! data-plane membership (what etcd believes), the orchestrator's running
//! pods (what actually executes), and the declared spec (what the user
//! wants). Disagreements between the first two are repaired before the
//! spec is considered, and only one membership-changing action fires per
//! tick.

use tracing::{debug, info, warn};

use crate::k8s::{MemberPod, MemberState, PodSummary};
use crate::member::{member_name, member_ordinal, Member, MemberSet};
use crate::{Error, Result, ETCD_CLIENT_PORT};

use super::ClusterCore;

impl ClusterCore {
    /// Reconcile the data-plane membership and the spec against the set of
    /// running pods. At most one of member-repair, resize, or upgrade runs
    /// per call.
    pub(super) async fn reconcile(&mut self, running: &[PodSummary]) -> Result<()> {
        debug!(cluster = %self.name, running = running.len(), "reconciling membership");

        let endpoints = client_endpoints(running);
        self.sync_members(endpoints.clone()).await?;

        let pod_view: MemberSet = running.iter().map(|p| Member::named(&p.name)).collect();

        // Members the data plane knows but no pod backs: dead. They must be
        // removed before any addition so quorum math stays honest.
        let dead = self.members.diff(&pod_view);
        if let Some(victim) = dead.any() {
            let victim = victim.clone();
            warn!(cluster = %self.name, member = %victim.name, "removing dead member");
            return self.remove_member(&endpoints, &victim).await;
        }

        // Pods no member claims: orphans. One corrective action per tick,
        // same as the dead-member branch above.
        let orphans = pod_view.diff(&self.members);
        if let Some(orphan) = orphans.any() {
            warn!(cluster = %self.name, pod = %orphan.name, "deleting orphaned pod");
            self.orchestrator.delete_pod(orphan.name.clone()).await?;
            return Ok(());
        }

        // Views agree; move the membership toward the spec one step at a time.
        let desired = self.spec.size as usize;
        if self.members.size() < desired {
            return self.add_one_member(&endpoints).await;
        }
        if self.members.size() > desired {
            if let Some(victim) = self.members.any() {
                let victim = victim.clone();
                info!(cluster = %self.name, member = %victim.name, "removing one member to reach desired size");
                return self.remove_member(&endpoints, &victim).await;
            }
        }
        self.upgrade_one_member(running).await
    }

    /// Synchronize the in-memory membership with the data plane and advance
    /// the name counter past every observed member.
    async fn sync_members(&mut self, endpoints: Vec<String>) -> Result<()> {
        let listed = self.membership.member_list(endpoints).await?;

        let mut members = MemberSet::new();
        for rm in &listed {
            if rm.name.is_empty() {
                // The member has not finished joining the quorum.
                return Err(Error::not_ready(format!(
                    "member {:016x} has no name yet",
                    rm.id
                )));
            }
            let ordinal = member_ordinal(&rm.name)?;
            self.id_counter = self.id_counter.max(ordinal + 1);
            members.add(Member {
                name: rm.name.clone(),
                id: rm.id,
                peer_urls: rm.peer_urls.clone(),
                client_urls: rm.client_urls.clone(),
            });
        }
        self.members = members;
        Ok(())
    }

    /// Register and start one new member
    async fn add_one_member(&mut self, endpoints: &[String]) -> Result<()> {
        let mut member = Member::named(member_name(&self.name, self.id_counter));
        let added = self
            .membership
            .member_add(endpoints.to_vec(), member.peer_urls.clone())
            .await?;
        member.id = added.added_id;
        self.members.add(member.clone());

        self.create_pod_and_service(
            &self.members,
            &member,
            MemberState::Existing,
            false,
            false,
        )
        .await?;

        self.id_counter += 1;
        info!(cluster = %self.name, member = %member.name, "added member");
        Ok(())
    }

    /// Remove one member: data plane first, then its lingering resources
    pub(super) async fn remove_member(
        &mut self,
        endpoints: &[String],
        victim: &Member,
    ) -> Result<()> {
        self.membership
            .member_remove(endpoints.to_vec(), victim.id)
            .await?;
        self.members.remove(&victim.name);
        self.remove_pod_and_service(&victim.name).await?;
        info!(cluster = %self.name, member = %victim.name, "removed member");
        Ok(())
    }

    /// Replace at most one pod whose image version lags the spec
    async fn upgrade_one_member(&mut self, running: &[PodSummary]) -> Result<()> {
        for pod in running {
            let Some(version) = &pod.version else { continue };
            if *version == self.spec.version {
                continue;
            }
            let Some(member) = self.members.get(&pod.name).cloned() else {
                continue;
            };
            info!(
                cluster = %self.name,
                member = %member.name,
                from = %version,
                to = %self.spec.version,
                "upgrading member"
            );

            self.orchestrator.delete_pod(pod.name.clone()).await?;
            self.orchestrator
                .create_member_pod(MemberPod {
                    member,
                    initial_cluster: self.members.peer_url_pairs(),
                    state: MemberState::Existing,
                    token: String::new(),
                    version: self.spec.version.clone(),
                    recovery: None,
                    self_hosted: false,
                })
                .await?;
            return Ok(());
        }
        Ok(())
    }
}

/// Client endpoints of the running pods, for dialing the quorum client
fn client_endpoints(running: &[PodSummary]) -> Vec<String> {
    running
        .iter()
        .map(|p| format!("http://{}:{ETCD_CLIENT_PORT}", p.name))
        .collect()
}
