//! EtcdCluster Custom Resource Definition
//!
//! An EtcdCluster declares one replicated etcd deployment. The spec is the
//! desired state (size, version, backup policy); the status subresource is
//! written back exclusively by the cluster's reconciliation loop.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{BackupSpec, ClusterPhase, FailureReason, RestoreSpec, SelfHostedSpec};

fn default_version() -> String {
    "3.5.21".to_string()
}

/// Specification for an EtcdCluster
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "steward.dev",
    version = "v1alpha1",
    kind = "EtcdCluster",
    plural = "etcdclusters",
    shortname = "etcd",
    status = "EtcdClusterStatus",
    namespaced,
    printcolumn = r#"{"name":"Size","type":"integer","jsonPath":".spec.size"}"#,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct EtcdClusterSpec {
    /// Desired member count. Odd values keep quorum cheap but are not
    /// enforced here.
    pub size: i32,

    /// Target etcd image version (image tag)
    #[serde(default = "default_version")]
    pub version: String,

    /// When true, periodic reconciliation is suppressed; delete and modify
    /// events are still observed
    #[serde(default)]
    pub paused: bool,

    /// Backup policy; absence means no backup coordinator is attached and
    /// disaster recovery is impossible
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<BackupSpec>,

    /// Restore marker: this cluster was created to restore from an existing
    /// backup rather than bootstrap fresh
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore: Option<RestoreSpec>,

    /// Self-hosted bootstrap configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_hosted: Option<SelfHostedSpec>,
}

impl EtcdClusterSpec {
    /// Validate the cluster specification.
    ///
    /// Called once at cluster creation; a spec that fails here never gets a
    /// reconciliation loop.
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.size <= 0 {
            return Err(crate::Error::validation(format!(
                "size must be positive, got {}",
                self.size
            )));
        }
        if self.version.is_empty() {
            return Err(crate::Error::validation("version must not be empty"));
        }
        if self.restore.is_some() && self.self_hosted.is_some() {
            // A restored cluster re-enters through disaster recovery and
            // never runs a seed path, so a self-hosted seed is meaningless.
            return Err(crate::Error::validation(
                "restore and selfHosted are mutually exclusive",
            ));
        }
        if self.restore.is_some() && self.backup.is_none() {
            return Err(crate::Error::validation(
                "restore requires a backup policy to restore from",
            ));
        }
        Ok(())
    }

    /// True when any field the reconciler acts on differs between the two
    /// specs. All other field changes are ignored to avoid spurious churn.
    pub fn differs_for_reconciler(&self, other: &EtcdClusterSpec) -> bool {
        self.size != other.size || self.paused != other.paused || self.version != other.version
    }
}

/// Status for an EtcdCluster, written back by the reconciliation loop
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EtcdClusterStatus {
    /// Current lifecycle phase
    #[serde(default)]
    pub phase: ClusterPhase,

    /// Why the cluster failed, when phase is `Failed`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,

    /// Number of reconciliation ticks that performed control decisions
    #[serde(default)]
    pub control_ticks: u32,

    /// Number of reconciliation ticks skipped because control was paused
    #[serde(default)]
    pub paused_ticks: u32,
}

impl EtcdClusterStatus {
    /// Mark the loop as actively ticking
    pub fn set_phase_running(&mut self) {
        self.phase = ClusterPhase::Running;
    }

    /// Mark the cluster terminally failed
    pub fn set_phase_failed(&mut self) {
        self.phase = ClusterPhase::Failed;
    }

    /// Record the failure reason
    pub fn set_reason(&mut self, reason: FailureReason) {
        self.reason = Some(reason);
    }

    /// Record one active control tick
    pub fn control(&mut self) {
        self.phase = ClusterPhase::Running;
        self.control_ticks = self.control_ticks.wrapping_add(1);
    }

    /// Record one tick skipped because control is paused
    pub fn pause_control(&mut self) {
        self.phase = ClusterPhase::Paused;
        self.paused_ticks = self.paused_ticks.wrapping_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_spec() -> EtcdClusterSpec {
        EtcdClusterSpec {
            size: 3,
            version: "3.5.21".to_string(),
            paused: false,
            backup: None,
            restore: None,
            self_hosted: None,
        }
    }

    // =========================================================================
    // Spec Validation
    // =========================================================================

    #[test]
    fn a_plain_three_member_spec_is_valid() {
        assert!(valid_spec().validate().is_ok());
    }

    #[test]
    fn zero_or_negative_size_is_rejected() {
        let mut spec = valid_spec();
        spec.size = 0;
        assert!(spec.validate().is_err());
        spec.size = -3;
        assert!(spec.validate().is_err());
    }

    #[test]
    fn empty_version_is_rejected() {
        let mut spec = valid_spec();
        spec.version = String::new();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn restore_without_backup_policy_is_rejected() {
        let mut spec = valid_spec();
        spec.restore = Some(RestoreSpec::default());
        assert!(spec.validate().is_err());

        spec.backup = Some(BackupSpec {
            max_snapshots: 5,
            storage_type: Default::default(),
        });
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn restore_and_self_hosted_are_mutually_exclusive() {
        let mut spec = valid_spec();
        spec.backup = Some(BackupSpec {
            max_snapshots: 5,
            storage_type: Default::default(),
        });
        spec.restore = Some(RestoreSpec::default());
        spec.self_hosted = Some(SelfHostedSpec::default());
        assert!(spec.validate().is_err());
    }

    // =========================================================================
    // Update Filtering
    // =========================================================================
    //
    // The reconciler only cares about size, paused, and version. Any other
    // spec change must not generate an event.

    #[test]
    fn size_paused_and_version_changes_are_interesting() {
        let base = valid_spec();

        let mut grown = base.clone();
        grown.size = 5;
        assert!(grown.differs_for_reconciler(&base));

        let mut paused = base.clone();
        paused.paused = true;
        assert!(paused.differs_for_reconciler(&base));

        let mut upgraded = base.clone();
        upgraded.version = "3.6.0".to_string();
        assert!(upgraded.differs_for_reconciler(&base));
    }

    #[test]
    fn backup_policy_changes_are_not_interesting() {
        let base = valid_spec();
        let mut changed = base.clone();
        changed.backup = Some(BackupSpec {
            max_snapshots: 7,
            storage_type: Default::default(),
        });
        assert!(!changed.differs_for_reconciler(&base));
    }

    // =========================================================================
    // Status Bookkeeping
    // =========================================================================

    #[test]
    fn control_counters_track_active_and_paused_ticks() {
        let mut status = EtcdClusterStatus::default();
        assert_eq!(status.phase, ClusterPhase::Creating);

        status.control();
        status.control();
        assert_eq!(status.phase, ClusterPhase::Running);
        assert_eq!(status.control_ticks, 2);

        status.pause_control();
        assert_eq!(status.phase, ClusterPhase::Paused);
        assert_eq!(status.paused_ticks, 1);

        status.set_phase_failed();
        status.set_reason(FailureReason::NoBackup);
        assert_eq!(status.phase, ClusterPhase::Failed);
        assert_eq!(status.reason, Some(FailureReason::NoBackup));
    }
}
