//! Custom Resource Definitions for Steward

mod cluster;
mod types;

pub use cluster::{EtcdCluster, EtcdClusterSpec, EtcdClusterStatus};
pub use types::{BackupSpec, ClusterPhase, FailureReason, RestoreSpec, SelfHostedSpec, StorageType};
