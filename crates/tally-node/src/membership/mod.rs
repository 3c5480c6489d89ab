//! Peer membership.
//!
//! The bootstrap path consumes membership only through
//! [`MembershipProvider`]: it asks the provider to contact seeds and reads a
//! point-in-time list of visible peers. [`GossipMembership`] is the UDP
//! gossip implementation used by the binary; [`StaticMembership`] serves a
//! fixed list and is handy in tests and fixed deployments.

pub mod service;
pub mod types;

use std::net::SocketAddr;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::Error;

pub use service::GossipMembership;
pub use types::{GossipMember, GossipMessage, MemberState};

/// A visible member of the fleet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub node_id: String,
    pub membership_addr: String,
}

impl PeerRecord {
    pub fn new(node_id: impl Into<String>, membership_addr: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            membership_addr: membership_addr.into(),
        }
    }
}

/// Source of the eventually consistent peer list.
#[async_trait]
pub trait MembershipProvider: Send + Sync {
    /// Contact `seeds`, best effort. Returns how many were reached.
    async fn join(&self, seeds: &[SocketAddr]) -> Result<usize, Error>;

    /// Current members, including this node, in no particular order.
    fn members(&self) -> Vec<PeerRecord>;
}

/// Membership backed by a fixed, replaceable list.
#[derive(Debug, Default)]
pub struct StaticMembership {
    peers: RwLock<Vec<PeerRecord>>,
}

impl StaticMembership {
    pub fn new(peers: Vec<PeerRecord>) -> Self {
        Self {
            peers: RwLock::new(peers),
        }
    }

    /// Replace the member list.
    pub fn set(&self, peers: Vec<PeerRecord>) {
        *self.peers.write() = peers;
    }
}

#[async_trait]
impl MembershipProvider for StaticMembership {
    async fn join(&self, _seeds: &[SocketAddr]) -> Result<usize, Error> {
        Ok(0)
    }

    fn members(&self) -> Vec<PeerRecord> {
        self.peers.read().clone()
    }
}
