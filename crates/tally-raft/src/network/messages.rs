//! Raft RPC wire messages.
//!
//! Requests and replies carry openraft's own RPC types (serialized with its
//! `serde` feature) so nothing is lost between the two engines.

use openraft::error::{InstallSnapshotError, RaftError};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use serde::{Deserialize, Serialize};

use crate::types::{NodeId, TypeConfig};

/// Request sent from one node's Raft engine to another.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RaftRequest {
    Vote(VoteRequest<NodeId>),
    AppendEntries(AppendEntriesRequest<TypeConfig>),
    InstallSnapshot(InstallSnapshotRequest<TypeConfig>),
}

impl RaftRequest {
    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            RaftRequest::Vote(_) => "vote",
            RaftRequest::AppendEntries(_) => "append_entries",
            RaftRequest::InstallSnapshot(_) => "install_snapshot",
        }
    }
}

/// Reply to a [`RaftRequest`], carrying the remote engine's result.
#[derive(Debug, Serialize, Deserialize)]
pub enum RaftReply {
    Vote(Result<VoteResponse<NodeId>, RaftError<NodeId>>),
    AppendEntries(Result<AppendEntriesResponse<NodeId>, RaftError<NodeId>>),
    InstallSnapshot(
        Result<InstallSnapshotResponse<NodeId>, RaftError<NodeId, InstallSnapshotError>>,
    ),
    /// The server could not decode the request.
    Rejected(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use openraft::{CommittedLeaderId, LogId, Vote};

    #[test]
    fn test_vote_request_wire() {
        let vote = Vote::new(1, 5);
        let last_log_id = Some(LogId::new(CommittedLeaderId::new(1, 5), 10));
        let request = RaftRequest::Vote(VoteRequest::new(vote, last_log_id));
        assert_eq!(request.kind(), "vote");

        let bytes = serde_json::to_vec(&request).unwrap();
        match serde_json::from_slice::<RaftRequest>(&bytes).unwrap() {
            RaftRequest::Vote(req) => {
                assert_eq!(req.vote, vote);
                assert_eq!(req.last_log_id, last_log_id);
            }
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[test]
    fn test_conflict_reply_survives_the_wire() {
        let reply = RaftReply::AppendEntries(Ok(AppendEntriesResponse::Conflict));
        let bytes = serde_json::to_vec(&reply).unwrap();

        match serde_json::from_slice::<RaftReply>(&bytes).unwrap() {
            RaftReply::AppendEntries(Ok(AppendEntriesResponse::Conflict)) => {}
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[test]
    fn test_higher_vote_reply() {
        let reply = RaftReply::AppendEntries(Ok(AppendEntriesResponse::HigherVote(Vote::new(
            4, 2,
        ))));
        let bytes = serde_json::to_vec(&reply).unwrap();

        match serde_json::from_slice::<RaftReply>(&bytes).unwrap() {
            RaftReply::AppendEntries(Ok(AppendEntriesResponse::HigherVote(vote))) => {
                assert_eq!(vote, Vote::new(4, 2));
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }
}
