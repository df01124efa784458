//! Supporting types for the EtcdCluster CRD

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Lifecycle phase of a managed cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ClusterPhase {
    /// Initial resources are being created; the loop is not yet in steady state
    #[default]
    Creating,
    /// The reconciliation loop is actively ticking
    Running,
    /// Reconciliation is suppressed by `spec.paused`
    Paused,
    /// The loop has terminated; requires operator intervention
    Failed,
}

impl std::fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Creating => write!(f, "Creating"),
            Self::Running => write!(f, "Running"),
            Self::Paused => write!(f, "Paused"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Reason a cluster entered the `Failed` phase
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum FailureReason {
    /// Every member died and no backup was available to recover from
    NoBackup,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoBackup => write!(f, "NoBackup"),
        }
    }
}

/// Backup configuration for a cluster
///
/// Presence of this block attaches a backup coordinator at cluster creation;
/// without it, disaster recovery is impossible.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupSpec {
    /// Maximum number of snapshots the coordinator retains
    pub max_snapshots: i32,

    /// Where snapshots are stored
    #[serde(default)]
    pub storage_type: StorageType,
}

/// Storage backend the backup coordinator writes snapshots to
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub enum StorageType {
    /// A persistent volume owned by the backup sidecar
    #[default]
    PersistentVolume,
    /// An S3-compatible object store
    S3,
}

/// Marker indicating this cluster restores from an existing backup instead
/// of bootstrapping fresh
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RestoreSpec {
    /// Name of the cluster whose backup to restore from; defaults to this
    /// cluster's own name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_cluster_name: Option<String>,
}

/// Self-hosted bootstrap configuration
///
/// With an empty boot endpoint the seed member is bootstrapped fresh on the
/// orchestrator's own control plane; with an endpoint set, an existing
/// external etcd member is migrated into the managed cluster.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SelfHostedSpec {
    /// Client endpoint of an existing external boot member to migrate from.
    /// Empty means fresh self-hosted bootstrap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boot_member_client_endpoint: Option<String>,
}

impl SelfHostedSpec {
    /// Returns the boot-member endpoint when this is a migration, `None`
    /// for a fresh self-hosted bootstrap
    pub fn boot_member(&self) -> Option<&str> {
        self.boot_member_client_endpoint
            .as_deref()
            .filter(|e| !e.is_empty())
    }
}
