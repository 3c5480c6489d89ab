//! Cluster membership views and join planning.

use std::collections::BTreeSet;

use crate::types::{raft_node_id, ClusterNode, Membership, NodeId};

/// One member of the consensus configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterEntry {
    pub id: NodeId,
    pub node: ClusterNode,
    pub voter: bool,
}

/// Point-in-time view of the consensus configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Roster {
    entries: Vec<RosterEntry>,
}

/// What the leader has to do to admit a joining node as a voter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinPlan {
    /// Already a voter at the same address.
    AlreadyVoter,
    /// Known learner at the same address; only promotion is missing.
    Promote(NodeId),
    /// Same id at a different consensus address: the stale record is
    /// replaced before the node is admitted.
    Replace { previous: RosterEntry },
    /// Unknown node: add as learner, wait for catch-up, promote.
    Add,
}

impl Roster {
    /// Build a roster from an openraft membership config.
    pub fn from_membership(membership: &Membership) -> Self {
        let voters: BTreeSet<NodeId> = membership.voter_ids().collect();
        let entries = membership
            .nodes()
            .map(|(id, node)| RosterEntry {
                id: *id,
                node: node.clone(),
                voter: voters.contains(id),
            })
            .collect();
        Self { entries }
    }

    pub fn entries(&self) -> &[RosterEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: NodeId) -> Option<&RosterEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&RosterEntry> {
        self.entries.iter().find(|e| e.node.name == name)
    }

    pub fn voter_ids(&self) -> BTreeSet<NodeId> {
        self.entries.iter().filter(|e| e.voter).map(|e| e.id).collect()
    }

    /// Decide how to admit `name` reachable at `raft_addr`.
    pub fn plan_join(&self, name: &str, raft_addr: &str) -> JoinPlan {
        match self.get(raft_node_id(name)) {
            None => JoinPlan::Add,
            Some(existing) if existing.node.raft_addr != raft_addr => JoinPlan::Replace {
                previous: existing.clone(),
            },
            Some(existing) if existing.voter => JoinPlan::AlreadyVoter,
            Some(existing) => JoinPlan::Promote(existing.id),
        }
    }
}
