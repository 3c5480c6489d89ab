//! JSON request and response types for the admin API.

use serde::{Deserialize, Serialize};
use tally_raft::RaftClusterManager;

/// Leader record inside [`ClusterState`]. Empty strings when no leader is known.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderJson {
    #[serde(default)]
    pub consensus_address: String,
    #[serde(default, rename = "nodeID")]
    pub node_id: String,
    #[serde(default)]
    pub http_address: String,
}

/// One consensus configuration member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberJson {
    pub id: String,
    pub address: String,
    /// `voter` or `nonvoter`.
    pub role: String,
}

/// Snapshot of the local view of the consensus group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterState {
    #[serde(default)]
    pub last_log_index: u64,
    #[serde(default)]
    pub leader: LeaderJson,
    #[serde(default)]
    pub members: Vec<MemberJson>,
    #[serde(default)]
    pub role: String,
}

impl ClusterState {
    /// Build the status view from the engine's current metrics.
    pub fn from_cluster(cluster: &RaftClusterManager) -> Self {
        let leader = cluster
            .current_leader()
            .map(|(_, node)| LeaderJson {
                consensus_address: node.raft_addr,
                node_id: node.name,
                http_address: node.http_addr,
            })
            .unwrap_or_default();

        let members = cluster
            .roster()
            .entries()
            .iter()
            .map(|entry| MemberJson {
                id: entry.node.name.clone(),
                address: entry.node.raft_addr.clone(),
                role: if entry.voter { "voter" } else { "nonvoter" }.to_string(),
            })
            .collect();

        Self {
            last_log_index: cluster.last_log_index(),
            leader,
            members,
            role: cluster.role(),
        }
    }

    /// Admin address of the leader, if this view names one.
    pub fn leader_http_addr(&self) -> Option<&str> {
        Some(self.leader.http_address.as_str()).filter(|addr| !addr.is_empty())
    }
}

/// Counter value response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterJson {
    pub counter: u64,
}

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Always `ok` while the process serves requests.
    pub status: String,
    pub version: String,
    pub node_id: String,
    /// Whether this node has founded or joined a group.
    pub consensus_started: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_state_field_names() {
        let state = ClusterState {
            last_log_index: 7,
            leader: LeaderJson {
                consensus_address: "127.0.0.1:9001".into(),
                node_id: "node1".into(),
                http_address: "127.0.0.1:9000".into(),
            },
            members: vec![MemberJson {
                id: "node1".into(),
                address: "127.0.0.1:9001".into(),
                role: "voter".into(),
            }],
            role: "Leader".into(),
        };

        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(value["lastLogIndex"], 7);
        assert_eq!(value["leader"]["nodeID"], "node1");
        assert_eq!(value["leader"]["consensusAddress"], "127.0.0.1:9001");
        assert_eq!(value["leader"]["httpAddress"], "127.0.0.1:9000");
        assert_eq!(value["members"][0]["role"], "voter");
        assert_eq!(value["role"], "Leader");
    }

    #[test]
    fn test_leader_http_addr() {
        let mut state: ClusterState = serde_json::from_str(r#"{"role":"Follower"}"#).unwrap();
        assert_eq!(state.leader_http_addr(), None);

        state.leader.http_address = "127.0.0.1:9000".into();
        assert_eq!(state.leader_http_addr(), Some("127.0.0.1:9000"));
    }
}
