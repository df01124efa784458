//! etcd member model
//!
//! Value types for one consensus-group member and the set of currently
//! known members, plus the pure helpers the reconciler builds its decisions
//! on: peer-URL pairs for bootstrap, quorum size, set difference between two
//! membership views, and the `<cluster>-<4-digit-counter>` naming scheme.

use std::collections::BTreeMap;

use crate::{Error, Result, ETCD_CLIENT_PORT, ETCD_PEER_PORT};

/// One member of a managed etcd cluster.
///
/// The name doubles as the DNS name of the member's per-member service, so
/// peer URLs stay valid across pod restarts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Member {
    /// Member name, `<cluster>-<4-digit-counter>`
    pub name: String,
    /// Data-plane member id, assigned by etcd on join; zero until known
    pub id: u64,
    /// Peer URLs as reported by the data plane
    pub peer_urls: Vec<String>,
    /// Client URLs as reported by the data plane
    pub client_urls: Vec<String>,
}

impl Member {
    /// Create a member known only by name, deriving its URLs from the
    /// per-member service DNS name
    pub fn named(name: impl Into<String>) -> Self {
        let name = name.into();
        let peer = format!("http://{name}:{ETCD_PEER_PORT}");
        let client = format!("http://{name}:{ETCD_CLIENT_PORT}");
        Self {
            name,
            id: 0,
            peer_urls: vec![peer],
            client_urls: vec![client],
        }
    }

    /// The member's primary peer URL
    pub fn peer_url(&self) -> &str {
        &self.peer_urls[0]
    }

    /// The member's primary client URL
    pub fn client_url(&self) -> &str {
        &self.client_urls[0]
    }
}

/// Format the name of member number `ordinal` of `cluster`
pub fn member_name(cluster: &str, ordinal: u64) -> String {
    format!("{cluster}-{ordinal:04}")
}

/// Extract the counter from a member name.
///
/// The counter is the substring after the last `-`, parsed as decimal. A
/// name that does not parse is a programming error somewhere in the naming
/// path and is fatal for the owning cluster.
pub fn member_ordinal(name: &str) -> Result<u64> {
    let suffix = name
        .rsplit_once('-')
        .map(|(_, s)| s)
        .ok_or_else(|| Error::BadMemberName(name.to_string()))?;
    suffix
        .parse::<u64>()
        .map_err(|_| Error::BadMemberName(name.to_string()))
}

/// Unordered set of members, keyed by name
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MemberSet {
    members: BTreeMap<String, Member>,
}

impl MemberSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a set holding a single member
    pub fn with_member(member: Member) -> Self {
        let mut set = Self::new();
        set.add(member);
        set
    }

    /// Insert a member, replacing any member of the same name
    pub fn add(&mut self, member: Member) {
        self.members.insert(member.name.clone(), member);
    }

    /// Remove a member by name
    pub fn remove(&mut self, name: &str) -> Option<Member> {
        self.members.remove(name)
    }

    /// Look up a member by name
    pub fn get(&self, name: &str) -> Option<&Member> {
        self.members.get(name)
    }

    /// Whether the set contains a member of this name
    pub fn contains(&self, name: &str) -> bool {
        self.members.contains_key(name)
    }

    /// Number of members
    pub fn size(&self) -> usize {
        self.members.len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Iterate over the members
    pub fn iter(&self) -> impl Iterator<Item = &Member> {
        self.members.values()
    }

    /// An arbitrary member, used when the reconciler must shrink by one
    pub fn any(&self) -> Option<&Member> {
        self.members.values().next()
    }

    /// Members present in `self` but not in `other`, by name
    pub fn diff(&self, other: &MemberSet) -> MemberSet {
        let members = self
            .members
            .iter()
            .filter(|(name, _)| !other.contains(name))
            .map(|(name, m)| (name.clone(), m.clone()))
            .collect();
        MemberSet { members }
    }

    /// `name=peerURL` pairs for every member, the form etcd's
    /// `--initial-cluster` flag expects
    pub fn peer_url_pairs(&self) -> Vec<String> {
        self.members
            .values()
            .map(|m| format!("{}={}", m.name, m.peer_url()))
            .collect()
    }

    /// Smallest number of members that still forms a quorum
    pub fn quorum(&self) -> usize {
        self.members.len() / 2 + 1
    }
}

impl FromIterator<Member> for MemberSet {
    fn from_iter<I: IntoIterator<Item = Member>>(iter: I) -> Self {
        let mut set = Self::new();
        for m in iter {
            set.add(m);
        }
        set
    }
}
