//! NNG-based Raft network client.

use std::time::Duration;

use nng::options::{Options, RecvTimeout, SendTimeout};
use nng::{Protocol, Socket};
use openraft::error::{
    InstallSnapshotError, NetworkError, RPCError, RaftError, RemoteError, Unreachable,
};
use openraft::network::{RPCOption, RaftNetwork};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};

use crate::error::RaftError as TallyRaftError;
use crate::network::messages::{RaftReply, RaftRequest};
use crate::types::{ClusterNode, NodeId, TypeConfig};

type RpcResult<T, E = RaftError<NodeId>> = Result<T, RPCError<NodeId, ClusterNode, E>>;

/// Connection from this node's engine to one target node.
pub struct NngRaftNetwork {
    target: NodeId,
    node: ClusterNode,
    timeout: Duration,
}

impl NngRaftNetwork {
    /// Create a client for the given target.
    pub fn new(target: NodeId, node: ClusterNode) -> Self {
        Self {
            target,
            node,
            timeout: Duration::from_secs(5),
        }
    }

    /// Set the per-RPC timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The target's Raft id.
    pub fn target(&self) -> NodeId {
        self.target
    }

    fn url(&self) -> String {
        format!("tcp://{}", self.node.raft_addr)
    }

    fn send_sync(url: &str, timeout: Duration, request: &RaftRequest) -> Result<RaftReply, TallyRaftError> {
        let socket = Socket::new(Protocol::Req0)
            .map_err(|e| TallyRaftError::Network(format!("failed to create socket: {e}")))?;
        socket
            .set_opt::<SendTimeout>(Some(timeout))
            .map_err(|e| TallyRaftError::Network(format!("failed to set send timeout: {e}")))?;
        socket
            .set_opt::<RecvTimeout>(Some(timeout))
            .map_err(|e| TallyRaftError::Network(format!("failed to set recv timeout: {e}")))?;
        socket
            .dial(url)
            .map_err(|e| TallyRaftError::Network(format!("failed to connect to {url}: {e}")))?;

        let payload = serde_json::to_vec(request)?;
        socket
            .send(nng::Message::from(payload.as_slice()))
            .map_err(|(_, e)| TallyRaftError::Network(format!("send to {url} failed: {e}")))?;

        let reply = socket
            .recv()
            .map_err(|e| TallyRaftError::Network(format!("recv from {url} failed: {e}")))?;
        Ok(serde_json::from_slice(reply.as_slice())?)
    }

    /// Send one request on a blocking thread.
    async fn send(&self, request: RaftRequest, option: &RPCOption) -> Result<RaftReply, TallyRaftError> {
        let url = self.url();
        let timeout = self.timeout.min(option.hard_ttl());
        let kind = request.kind();

        let reply = tokio::task::spawn_blocking(move || Self::send_sync(&url, timeout, &request))
            .await
            .map_err(|e| TallyRaftError::Internal(format!("rpc task failed: {e}")))?;

        if let Err(e) = &reply {
            tracing::debug!(target_node = self.target, rpc = kind, error = %e, "raft rpc failed");
        }
        reply
    }

    fn unexpected<E: std::error::Error>(&self, reply: RaftReply) -> RPCError<NodeId, ClusterNode, E> {
        let detail = match reply {
            RaftReply::Rejected(reason) => format!("request rejected by {}: {reason}", self.node.name),
            other => format!("unexpected reply from {}: {other:?}", self.node.name),
        };
        RPCError::Network(NetworkError::new(&TallyRaftError::Network(detail)))
    }

    fn remote<T, E>(&self, result: Result<T, RaftError<NodeId, E>>) -> RpcResult<T, RaftError<NodeId, E>>
    where
        E: std::error::Error,
    {
        result.map_err(|e| RPCError::RemoteError(RemoteError::new_with_node(self.target, self.node.clone(), e)))
    }
}

impl RaftNetwork<TypeConfig> for NngRaftNetwork {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        option: RPCOption,
    ) -> RpcResult<AppendEntriesResponse<NodeId>> {
        match self.send(RaftRequest::AppendEntries(rpc), &option).await {
            Ok(RaftReply::AppendEntries(result)) => self.remote(result),
            Ok(other) => Err(self.unexpected(other)),
            Err(e) => Err(RPCError::Unreachable(Unreachable::new(&e))),
        }
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        option: RPCOption,
    ) -> RpcResult<InstallSnapshotResponse<NodeId>, RaftError<NodeId, InstallSnapshotError>> {
        match self.send(RaftRequest::InstallSnapshot(rpc), &option).await {
            Ok(RaftReply::InstallSnapshot(result)) => self.remote(result),
            Ok(other) => Err(self.unexpected(other)),
            Err(e) => Err(RPCError::Unreachable(Unreachable::new(&e))),
        }
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<NodeId>,
        option: RPCOption,
    ) -> RpcResult<VoteResponse<NodeId>> {
        match self.send(RaftRequest::Vote(rpc), &option).await {
            Ok(RaftReply::Vote(result)) => self.remote(result),
            Ok(other) => Err(self.unexpected(other)),
            Err(e) => Err(RPCError::Unreachable(Unreachable::new(&e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node() -> ClusterNode {
        ClusterNode::new("node2", "192.168.1.10:9003", "192.168.1.10:9002")
    }

    #[test]
    fn test_url_uses_raft_addr() {
        let network = NngRaftNetwork::new(2, node());
        assert_eq!(network.url(), "tcp://192.168.1.10:9003");
        assert_eq!(network.target(), 2);
    }

    #[test]
    fn test_timeout_configuration() {
        let network = NngRaftNetwork::new(2, node()).with_timeout(Duration::from_millis(750));
        assert_eq!(network.timeout, Duration::from_millis(750));
    }

    #[test]
    fn test_send_to_closed_port_fails() {
        let request = RaftRequest::Vote(VoteRequest::new(openraft::Vote::new(1, 1), None));
        let result = NngRaftNetwork::send_sync(
            "tcp://127.0.0.1:1",
            Duration::from_millis(200),
            &request,
        );
        assert!(matches!(result, Err(TallyRaftError::Network(_))));
    }
}
