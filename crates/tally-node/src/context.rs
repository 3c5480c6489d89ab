//! Per-process node state shared by the orchestrator and the admin API.

use std::sync::{Arc, OnceLock};

use tally_raft::{RaftClusterManager, SharedRaftClusterManager};
use tokio::sync::OnceCell;

use crate::config::{NodeConfig, NodeIdentity};
use crate::error::{AppError, Error};
use crate::membership::MembershipProvider;

/// Owns the consensus engine of this process.
///
/// The engine is constructed at most once. It is reachable from the admin
/// API only after [`register_handlers`](Self::register_handlers), which
/// marks the node as started and succeeds at most once.
pub struct NodeContext {
    config: NodeConfig,
    identity: NodeIdentity,
    membership: Arc<dyn MembershipProvider>,
    engine: OnceCell<SharedRaftClusterManager>,
    started: OnceLock<()>,
}

impl NodeContext {
    pub fn new(config: NodeConfig, membership: Arc<dyn MembershipProvider>) -> Self {
        let identity = config.identity();
        Self {
            config,
            identity,
            membership,
            engine: OnceCell::new(),
            started: OnceLock::new(),
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn membership(&self) -> &Arc<dyn MembershipProvider> {
        &self.membership
    }

    /// Sorted ids of the visible members, this node included.
    pub fn membership_view(&self) -> Vec<String> {
        let mut view: Vec<String> = self
            .membership
            .members()
            .into_iter()
            .map(|peer| peer.node_id)
            .chain(std::iter::once(self.identity.node_id.clone()))
            .collect();
        view.sort();
        view.dedup();
        view
    }

    /// The engine, constructing it on first use.
    ///
    /// A failed construction leaves the cell empty so a later tick may retry.
    pub async fn engine(&self) -> Result<&SharedRaftClusterManager, Error> {
        self.engine
            .get_or_try_init(|| async {
                let manager = RaftClusterManager::new(self.config.raft_config()).await?;
                Ok::<_, Error>(Arc::new(manager))
            })
            .await
    }

    /// The engine if it has been constructed.
    pub fn existing_engine(&self) -> Option<&SharedRaftClusterManager> {
        self.engine.get()
    }

    /// Expose the engine through the admin API.
    pub fn register_handlers(&self) -> Result<(), Error> {
        if self.engine.get().is_none() {
            return Err(Error::Config(
                "handlers registered before the engine exists".to_string(),
            ));
        }
        self.started.set(()).map_err(|_| Error::AlreadyStarted)?;
        tracing::info!(node = %self.identity.node_id, "admin handlers registered");
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.started.get().is_some()
    }

    /// The engine, for admin handlers. Fails until the node has started.
    pub fn cluster(&self) -> Result<&SharedRaftClusterManager, AppError> {
        if !self.is_started() {
            return Err(AppError::NotStarted);
        }
        self.engine.get().ok_or(AppError::NotStarted)
    }

    /// Stop the engine if it was ever constructed.
    pub async fn shutdown(&self) -> Result<(), Error> {
        if let Some(engine) = self.engine.get() {
            engine.shutdown().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::{PeerRecord, StaticMembership};

    fn free_addr() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_not_started_until_registered() {
        let dir = tempfile::tempdir().unwrap();
        let config = NodeConfig::new("node1", "127.0.0.1:9000", free_addr(), "127.0.0.1:7946")
            .with_data_dir(dir.path());
        let membership = Arc::new(StaticMembership::new(vec![PeerRecord::new("node2", "x")]));
        let context = NodeContext::new(config, membership);
        assert_eq!(context.membership_view(), vec!["node1", "node2"]);

        assert!(matches!(context.cluster(), Err(AppError::NotStarted)));
        assert!(context.register_handlers().is_err());

        let first = context.engine().await.unwrap().clone();
        let second = context.engine().await.unwrap().clone();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(matches!(context.cluster(), Err(AppError::NotStarted)));

        context.register_handlers().unwrap();
        assert!(context.is_started());
        assert!(context.cluster().is_ok());
        assert!(matches!(
            context.register_handlers(),
            Err(Error::AlreadyStarted)
        ));

        context.shutdown().await.unwrap();
    }
}
