//! Data-plane membership client
//!
//! The reconciler never talks to etcd directly; it goes through the
//! [`MembershipClient`] trait so tests can script the data plane. The real
//! implementation dials a quorum client against the endpoints passed per
//! call (the set of live members changes between ticks) with bounded
//! connect and request timeouts.

use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{Client, ConnectOptions};

#[cfg(test)]
use mockall::automock;

use crate::{Result, DEFAULT_REQUEST_TIMEOUT_SECS};

/// A member as reported by the data plane
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeMember {
    /// Data-plane member id
    pub id: u64,
    /// Member name; empty until the member process has joined the quorum
    pub name: String,
    /// Peer URLs
    pub peer_urls: Vec<String>,
    /// Client URLs
    pub client_urls: Vec<String>,
}

/// Result of registering a new member
#[derive(Clone, Debug)]
pub struct MemberAddResult {
    /// Id assigned to the new member
    pub added_id: u64,
    /// The full membership after the add, including the unnamed new member
    pub members: Vec<RuntimeMember>,
}

/// Quorum client for membership operations, with bounded timeouts
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MembershipClient: Send + Sync {
    /// List the current members of the cluster reachable at `endpoints`
    async fn member_list(&self, endpoints: Vec<String>) -> Result<Vec<RuntimeMember>>;

    /// Register a new member by its peer URLs
    async fn member_add(
        &self,
        endpoints: Vec<String>,
        peer_urls: Vec<String>,
    ) -> Result<MemberAddResult>;

    /// Remove a member by id
    async fn member_remove(&self, endpoints: Vec<String>, id: u64) -> Result<()>;
}

/// Real membership client wrapping `etcd-client`
#[derive(Clone, Debug)]
pub struct EtcdMembershipClient {
    request_timeout: Duration,
}

impl Default for EtcdMembershipClient {
    fn default() -> Self {
        Self::new()
    }
}

impl EtcdMembershipClient {
    /// Create a client with the default request timeout
    pub fn new() -> Self {
        Self {
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
        }
    }

    async fn connect(&self, endpoints: &[String]) -> Result<Client> {
        let options = ConnectOptions::new()
            .with_timeout(self.request_timeout)
            .with_connect_timeout(self.request_timeout);
        Ok(Client::connect(endpoints, Some(options)).await?)
    }
}

fn convert(m: &etcd_client::Member) -> RuntimeMember {
    RuntimeMember {
        id: m.id(),
        name: m.name().to_string(),
        peer_urls: m.peer_urls().to_vec(),
        client_urls: m.client_urls().to_vec(),
    }
}

#[async_trait]
impl MembershipClient for EtcdMembershipClient {
    async fn member_list(&self, endpoints: Vec<String>) -> Result<Vec<RuntimeMember>> {
        let mut client = self.connect(&endpoints).await?;
        let resp = client.member_list().await?;
        Ok(resp.members().iter().map(convert).collect())
    }

    async fn member_add(
        &self,
        endpoints: Vec<String>,
        peer_urls: Vec<String>,
    ) -> Result<MemberAddResult> {
        let mut client = self.connect(&endpoints).await?;
        let resp = client.member_add(peer_urls, None).await?;
        let added_id = resp.member().map(|m| m.id()).unwrap_or_default();
        Ok(MemberAddResult {
            added_id,
            members: resp.member_list().iter().map(convert).collect(),
        })
    }

    async fn member_remove(&self, endpoints: Vec<String>, id: u64) -> Result<()> {
        let mut client = self.connect(&endpoints).await?;
        client.member_remove(id).await?;
        Ok(())
    }
}
