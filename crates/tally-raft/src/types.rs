//! Core type definitions for openraft integration.

use std::fmt;
use std::io::Cursor;

use serde::{Deserialize, Serialize};

/// Node identifier type.
pub type NodeId = u64;

/// Type alias for the openraft Raft instance with our configuration.
pub type CounterRaft = openraft::Raft<TypeConfig>;

/// Type alias for log entry.
pub type LogEntry = openraft::Entry<TypeConfig>;

/// Type alias for log ID.
pub type LogId = openraft::LogId<NodeId>;

/// Type alias for vote.
pub type Vote = openraft::Vote<NodeId>;

/// Type alias for membership.
pub type Membership = openraft::Membership<NodeId, ClusterNode>;

/// Type alias for stored membership.
pub type StoredMembership = openraft::StoredMembership<NodeId, ClusterNode>;

/// Type alias for snapshot metadata.
pub type SnapshotMeta = openraft::SnapshotMeta<NodeId, ClusterNode>;

openraft::declare_raft_types!(
    /// Tally Raft type configuration.
    pub TypeConfig:
        D = Command,
        R = CounterResponse,
        NodeId = NodeId,
        Node = ClusterNode,
        Entry = openraft::Entry<TypeConfig>,
        SnapshotData = Cursor<Vec<u8>>,
        AsyncRuntime = openraft::TokioRuntime,
);

/// Derive the numeric Raft id for a node name.
///
/// The string name stays the only identity input; the Raft id is the first
/// eight bytes of its blake3 digest.
pub fn raft_node_id(name: &str) -> NodeId {
    let digest = blake3::hash(name.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_be_bytes(bytes)
}

/// Membership record stored by openraft for each node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterNode {
    /// String node identifier.
    pub name: String,
    /// Address of the node's Raft RPC listener.
    pub raft_addr: String,
    /// Address of the node's admin API.
    pub http_addr: String,
}

impl ClusterNode {
    /// Create a membership record.
    pub fn new(
        name: impl Into<String>,
        raft_addr: impl Into<String>,
        http_addr: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            raft_addr: raft_addr.into(),
            http_addr: http_addr.into(),
        }
    }

    /// The numeric Raft id for this record.
    pub fn raft_id(&self) -> NodeId {
        raft_node_id(&self.name)
    }
}

impl fmt::Display for ClusterNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{} (http {})", self.name, self.raft_addr, self.http_addr)
    }
}

/// Op tag recognised by the counter state machine.
pub const OP_INCREMENT: &str = "increment";

/// Command replicated through the Raft log.
///
/// The op is an open string tag rather than an enum so that a log entry
/// written by a newer node still decodes here; unknown ops are skipped by the
/// state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    /// Operation tag.
    pub op: String,
    /// Client-supplied id used to deduplicate retried writes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl Command {
    /// Create a command with an arbitrary op tag.
    pub fn new(op: impl Into<String>) -> Self {
        Self {
            op: op.into(),
            request_id: None,
        }
    }

    /// Create an increment command.
    pub fn increment() -> Self {
        Self::new(OP_INCREMENT)
    }

    /// Attach a client request id.
    pub fn with_request_id(mut self, request_id: Option<String>) -> Self {
        self.request_id = request_id.filter(|id| !id.is_empty());
        self
    }

    /// Whether this is an increment.
    pub fn is_increment(&self) -> bool {
        self.op == OP_INCREMENT
    }
}

/// Result of applying a command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterResponse {
    /// Counter value after the command, `None` when the command was ignored.
    pub value: Option<u64>,
    /// True when the request id had already been applied.
    #[serde(default)]
    pub deduplicated: bool,
}

impl CounterResponse {
    /// Response carrying a counter value.
    pub fn value(value: u64) -> Self {
        Self {
            value: Some(value),
            deduplicated: false,
        }
    }

    /// Response for a replayed request id.
    pub fn replayed(value: u64) -> Self {
        Self {
            value: Some(value),
            deduplicated: true,
        }
    }

    /// Response for entries that produce no value.
    pub fn none() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increment_wire_shape() {
        let json = serde_json::to_string(&Command::increment()).unwrap();
        assert_eq!(json, r#"{"op":"increment"}"#);

        let with_id = Command::increment().with_request_id(Some("req-1".into()));
        let json = serde_json::to_string(&with_id).unwrap();
        assert_eq!(json, r#"{"op":"increment","request_id":"req-1"}"#);
    }

    #[test]
    fn test_unknown_op_still_decodes() {
        let cmd: Command = serde_json::from_str(r#"{"op":"decrement","extra":1}"#).unwrap();
        assert_eq!(cmd.op, "decrement");
        assert!(!cmd.is_increment());
        assert!(cmd.request_id.is_none());
    }

    #[test]
    fn test_empty_request_id_is_dropped() {
        let cmd = Command::increment().with_request_id(Some(String::new()));
        assert!(cmd.request_id.is_none());
    }

    #[test]
    fn test_raft_node_id_is_stable() {
        assert_eq!(raft_node_id("node1"), raft_node_id("node1"));
        assert_ne!(raft_node_id("node1"), raft_node_id("node2"));

        let node = ClusterNode::new("node1", "127.0.0.1:9001", "127.0.0.1:9000");
        assert_eq!(node.raft_id(), raft_node_id("node1"));
        assert_eq!(node.to_string(), "node1@127.0.0.1:9001 (http 127.0.0.1:9000)");
    }

    #[test]
    fn test_counter_response_constructors() {
        assert_eq!(CounterResponse::value(3).value, Some(3));
        assert!(!CounterResponse::value(3).deduplicated);
        assert!(CounterResponse::replayed(3).deduplicated);
        assert_eq!(CounterResponse::none().value, None);
    }
}
