//! Error types for the Steward operator

use thiserror::Error;

/// Main error type for Steward operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Data-plane (etcd) API error
    #[error("etcd error: {0}")]
    Etcd(#[from] etcd_client::Error),

    /// Validation error for cluster specs
    #[error("validation error: {0}")]
    Validation(String),

    /// The data plane or orchestrator is not ready for a decision yet;
    /// the current reconciliation tick is skipped and retried later
    #[error("not ready: {0}")]
    NotReady(String),

    /// All members are gone and no backup exists to recover from
    #[error("all members are dead and no backup exists")]
    NoBackup,

    /// A member name does not follow the `<cluster>-<4-digit-counter>`
    /// convention; fatal for the owning cluster
    #[error("malformed member name: {0}")]
    BadMemberName(String),

    /// Backup coordinator error
    #[error("backup coordinator error: {0}")]
    Backup(String),

    /// The cluster event queue is full; indicates a control-plane bug
    #[error("event queue full for cluster {0}")]
    EventQueueFull(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a not-ready error with the given message
    pub fn not_ready(msg: impl Into<String>) -> Self {
        Self::NotReady(msg.into())
    }

    /// Create a backup coordinator error with the given message
    pub fn backup(msg: impl Into<String>) -> Self {
        Self::Backup(msg.into())
    }

    /// Whether this error must terminate the owning cluster's
    /// reconciliation loop.
    ///
    /// Fatal errors mark the cluster `Failed` but never destroy its
    /// resources, leaving room for operator intervention.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::NoBackup | Self::BadMemberName(_))
    }

    /// Whether this error means "try again on the next tick" rather than
    /// an actual failure
    pub fn is_not_ready(&self) -> bool {
        matches!(self, Self::NotReady(_))
    }
}
