//! Factory for creating Raft network connections.

use std::time::Duration;

use openraft::network::RaftNetworkFactory;

use crate::network::transport::NngRaftNetwork;
use crate::types::{ClusterNode, NodeId, TypeConfig};

/// Creates NNG clients for the nodes openraft replicates to.
pub struct NngNetworkFactory {
    node_id: NodeId,
    rpc_timeout: Duration,
}

impl NngNetworkFactory {
    pub fn new(node_id: NodeId, rpc_timeout: Duration) -> Self {
        Self {
            node_id,
            rpc_timeout,
        }
    }
}

impl RaftNetworkFactory<TypeConfig> for NngNetworkFactory {
    type Network = NngRaftNetwork;

    async fn new_client(&mut self, target: NodeId, node: &ClusterNode) -> Self::Network {
        tracing::debug!(
            from = self.node_id,
            to = target,
            name = %node.name,
            addr = %node.raft_addr,
            "creating raft client"
        );
        NngRaftNetwork::new(target, node.clone()).with_timeout(self.rpc_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_factory_creates_client() {
        let mut factory = NngNetworkFactory::new(1, Duration::from_secs(1));
        let node = ClusterNode::new("node2", "127.0.0.1:9003", "127.0.0.1:9002");

        let network = factory.new_client(2, &node).await;
        assert_eq!(network.target(), 2);
    }
}
