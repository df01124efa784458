//! Backup coordinator contract
//!
//! The reconciler needs exactly three things from the backup subsystem:
//! durable context at cluster creation ([`BackupCoordinator::setup`]),
//! teardown on cluster delete ([`BackupCoordinator::cleanup`]), and the
//! answer to "does a snapshot exist that a dead cluster can recover from?"
//! plus the URL a fresh pod fetches it from. Everything else about the
//! subsystem (snapshot encoding, object-store client, retention) stays
//! behind this trait.
//!
//! [`SidecarBackup`] is the implementation against the conventional
//! per-cluster backup sidecar service.

use async_trait::async_trait;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::{Error, Result, BACKUP_SIDECAR_PORT};

/// Instruction attached to a fresh member pod so it restores a snapshot
/// before the etcd process starts
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecoveryHint {
    /// URL the pod fetches the latest snapshot from
    pub snapshot_url: String,
}

/// What the reconciler requires from the backup subsystem
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BackupCoordinator: Send + Sync {
    /// Establish durable backup context for a new cluster
    async fn setup(&self) -> Result<()>;

    /// Tear down backup state when the cluster is deleted (best-effort)
    async fn cleanup(&self) -> Result<()>;

    /// Whether a snapshot exists that disaster recovery can seed from
    async fn latest_snapshot_exists(&self) -> Result<bool>;

    /// The recovery instruction for a fresh pod
    fn recovery_hint(&self) -> RecoveryHint;
}

/// Coordinator backed by the per-cluster backup sidecar service.
///
/// The sidecar owns snapshot storage and retention; this side only probes
/// `HEAD <base>/v1/backup` for existence and hands the same URL to
/// recovering pods.
pub struct SidecarBackup {
    snapshot_url: String,
    http: reqwest::Client,
}

impl SidecarBackup {
    /// Coordinator for `cluster` in `namespace`, using the conventional
    /// sidecar service DNS name
    pub fn new(cluster: &str, namespace: &str) -> Self {
        let snapshot_url = format!(
            "http://{cluster}-backup-sidecar.{namespace}.svc:{BACKUP_SIDECAR_PORT}/v1/backup"
        );
        Self::with_url(snapshot_url)
    }

    /// Coordinator against an explicit snapshot URL
    pub fn with_url(snapshot_url: String) -> Self {
        Self {
            snapshot_url,
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl BackupCoordinator for SidecarBackup {
    async fn setup(&self) -> Result<()> {
        // The sidecar deployment is provisioned by the backup subsystem
        // itself; at creation time this side only records the location.
        info!(url = %self.snapshot_url, "backup coordinator attached");
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        let resp = self
            .http
            .delete(&self.snapshot_url)
            .send()
            .await
            .map_err(|e| Error::backup(e.to_string()))?;
        debug!(status = %resp.status(), "backup cleanup requested");
        Ok(())
    }

    async fn latest_snapshot_exists(&self) -> Result<bool> {
        let resp = self
            .http
            .head(&self.snapshot_url)
            .send()
            .await
            .map_err(|e| Error::backup(e.to_string()))?;
        match resp.status() {
            s if s.is_success() => Ok(true),
            reqwest::StatusCode::NOT_FOUND => Ok(false),
            s => Err(Error::backup(format!("snapshot probe returned {s}"))),
        }
    }

    fn recovery_hint(&self) -> RecoveryHint {
        RecoveryHint {
            snapshot_url: self.snapshot_url.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sidecar_url_follows_the_service_convention() {
        let backup = SidecarBackup::new("example", "prod");
        assert_eq!(
            backup.recovery_hint().snapshot_url,
            "http://example-backup-sidecar.prod.svc:19999/v1/backup"
        );
    }

    #[test]
    fn recovery_hint_points_at_the_probed_url() {
        // The URL a recovering pod fetches must be the URL whose existence
        // was just probed, or recovery races against retention.
        let backup = SidecarBackup::with_url("http://backup.test/v1/backup".to_string());
        assert_eq!(
            backup.recovery_hint().snapshot_url,
            "http://backup.test/v1/backup"
        );
    }
}
