use std::net::SocketAddr;
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Liveness of a gossip member as seen locally.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MemberState {
    Alive,
    Suspect,
    Dead,
}

/// One gossip member.
///
/// `incarnation` orders conflicting claims about the same node id; a node
/// picks a fresh, larger incarnation every time it starts so that its new
/// address replaces the one peers remember.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipMember {
    pub node_id: String,
    pub addr: SocketAddr,
    pub state: MemberState,
    pub incarnation: u64,

    #[serde(skip)]
    pub last_seen: Option<Instant>,
}

/// Gossip wire protocol, one JSON document per UDP datagram.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GossipMessage {
    /// Sent to a seed; answered with an `Ack` carrying the full member list.
    Join { member: GossipMember },

    Ping { from: String, incarnation: u64 },

    Ack {
        from: String,
        incarnation: u64,
        members: Vec<GossipMember>,
    },
}
