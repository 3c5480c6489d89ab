//! Raft cluster manager.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use openraft::error::{ClientWriteError, ForwardToLeader};
use openraft::{ChangeMembers, Raft};
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::cluster::membership::{JoinPlan, Roster};
use crate::config::RaftConfig;
use crate::error::RaftError;
use crate::network::factory::NngNetworkFactory;
use crate::network::server::RaftTransport;
use crate::storage::log_storage::SledRaftLogStorage;
use crate::storage::state_machine::{CounterHandle, CounterStateMachine};
use crate::types::{raft_node_id, ClusterNode, Command, CounterRaft, CounterResponse, NodeId};

type WriteError = openraft::error::RaftError<NodeId, ClientWriteError<NodeId, ClusterNode>>;

/// Type alias for shared cluster manager.
pub type SharedRaftClusterManager = Arc<RaftClusterManager>;

/// Owns the local Raft engine and everything it needs.
///
/// Constructing the manager opens the node's sled store, binds the Raft
/// transport and starts the engine. It never founds or joins a group on its
/// own; callers decide between [`initialize_single`](Self::initialize_single)
/// and asking a leader to [`join_voter`](Self::join_voter) this node.
pub struct RaftClusterManager {
    node_id: NodeId,
    node: ClusterNode,
    raft: CounterRaft,
    counter: CounterHandle,
    config: RaftConfig,
    had_prior_state: bool,
    transport_shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

impl RaftClusterManager {
    /// Open storage, bind the transport and start the engine.
    pub async fn new(config: RaftConfig) -> Result<Self, RaftError> {
        let node_dir = config.node_dir();
        std::fs::create_dir_all(&node_dir).map_err(|e| {
            RaftError::Initialization(format!(
                "failed to create data dir {}: {e}",
                node_dir.display()
            ))
        })?;

        let db = Arc::new(sled::open(config.store_path())?);
        let log_storage = SledRaftLogStorage::open(db.clone())?;
        let had_prior_state = log_storage.has_state()?;

        let state_machine = CounterStateMachine::open(&db, config.snapshot_dir())?;
        let counter = state_machine.handle();

        let raft_config = Arc::new(
            openraft::Config {
                cluster_name: "tally".to_string(),
                heartbeat_interval: config.heartbeat_interval_ms,
                election_timeout_min: config.election_timeout_min_ms,
                election_timeout_max: config.election_timeout_max_ms,
                max_payload_entries: config.max_entries_per_append,
                snapshot_policy: openraft::SnapshotPolicy::LogsSinceLast(
                    config.snapshot_threshold,
                ),
                ..Default::default()
            }
            .validate()
            .map_err(|e| RaftError::Initialization(e.to_string()))?,
        );

        let node_id = config.node_id();
        let transport = RaftTransport::bind(node_id, &config.raft_listen_addr)?;
        let network = NngNetworkFactory::new(node_id, config.rpc_timeout);

        let raft = Raft::new(node_id, raft_config, network, log_storage, state_machine)
            .await
            .map_err(|e| RaftError::Initialization(e.to_string()))?;

        let handle = transport.spawn(raft.clone());

        tracing::info!(
            node = %config.node_name,
            node_id,
            prior_state = had_prior_state,
            "raft engine started"
        );

        Ok(Self {
            node_id,
            node: config.cluster_node(),
            raft,
            counter,
            config,
            had_prior_state,
            transport_shutdown: Mutex::new(Some(handle.shutdown)),
        })
    }

    /// Whether the store held Raft state before this process started.
    pub fn has_prior_state(&self) -> bool {
        self.had_prior_state
    }

    /// Found a new group with this node as the single voter.
    pub async fn initialize_single(&self) -> Result<(), RaftError> {
        let members = BTreeMap::from([(self.node_id, self.node.clone())]);
        self.raft
            .initialize(members)
            .await
            .map_err(|e| RaftError::Initialization(e.to_string()))?;

        tracing::info!(node = %self.node.name, "initialized single-voter cluster");
        Ok(())
    }

    /// Submit a command and wait for it to be applied.
    ///
    /// Fails with [`RaftError::NotLeader`] on followers and with
    /// [`RaftError::Timeout`] when the commit does not land within the
    /// configured apply timeout. A timed-out command may still commit later.
    pub async fn apply(&self, command: Command) -> Result<CounterResponse, RaftError> {
        let write = self.raft.client_write(command);
        match tokio::time::timeout(self.config.apply_timeout, write).await {
            Ok(Ok(response)) => Ok(response.data),
            Ok(Err(e)) => Err(map_write_error(e, RaftError::Write)),
            Err(_) => Err(RaftError::Timeout(format!(
                "command not applied within {:?}",
                self.config.apply_timeout
            ))),
        }
    }

    /// Admit `name` as a voter. Must run on the leader.
    pub async fn join_voter(
        &self,
        name: &str,
        raft_addr: &str,
        http_addr: &str,
    ) -> Result<JoinPlan, RaftError> {
        let id = raft_node_id(name);
        let node = ClusterNode::new(name, raft_addr, http_addr);
        let plan = self.roster().plan_join(name, raft_addr);

        tracing::info!(node = %node, ?plan, "admitting node");

        let admit = async {
            match &plan {
                JoinPlan::AlreadyVoter => {}
                JoinPlan::Promote(id) => {
                    self.change_membership(ChangeMembers::AddVoterIds(BTreeSet::from([*id])))
                        .await?;
                }
                JoinPlan::Replace { previous } => {
                    tracing::warn!(
                        node = %name,
                        stale = %previous.node.raft_addr,
                        fresh = %raft_addr,
                        "replacing stale membership record"
                    );
                    self.change_membership(ChangeMembers::SetNodes(BTreeMap::from([(
                        id,
                        node.clone(),
                    )])))
                    .await?;
                    if !previous.voter {
                        self.change_membership(ChangeMembers::AddVoterIds(BTreeSet::from([id])))
                            .await?;
                    }
                }
                JoinPlan::Add => {
                    self.raft
                        .add_learner(id, node.clone(), true)
                        .await
                        .map_err(|e| map_write_error(e, RaftError::MembershipChange))?;
                    self.change_membership(ChangeMembers::AddVoterIds(BTreeSet::from([id])))
                        .await?;
                }
            }
            Ok::<(), RaftError>(())
        };

        self.bounded(self.config.membership_timeout, admit).await??;
        Ok(plan)
    }

    async fn change_membership(
        &self,
        change: ChangeMembers<NodeId, ClusterNode>,
    ) -> Result<(), RaftError> {
        self.raft
            .change_membership(change, true)
            .await
            .map_err(|e| map_write_error(e, RaftError::MembershipChange))?;
        Ok(())
    }

    async fn bounded<F: Future>(&self, limit: Duration, fut: F) -> Result<F::Output, RaftError> {
        tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| RaftError::Timeout(format!("membership change exceeded {limit:?}")))
    }

    /// Whether this node currently leads.
    pub fn is_leader(&self) -> bool {
        self.raft.metrics().borrow().current_leader == Some(self.node_id)
    }

    /// The leader this node currently knows of, with its membership record.
    pub fn current_leader(&self) -> Option<(NodeId, ClusterNode)> {
        let metrics = self.raft.metrics().borrow().clone();
        let leader = metrics.current_leader?;
        let node = metrics
            .membership_config
            .membership()
            .get_node(&leader)
            .cloned()?;
        Some((leader, node))
    }

    /// Engine role as a display string (`Leader`, `Follower`, ...).
    pub fn role(&self) -> String {
        format!("{:?}", self.raft.metrics().borrow().state)
    }

    /// Index of the last entry in the local log.
    pub fn last_log_index(&self) -> u64 {
        self.raft.metrics().borrow().last_log_index.unwrap_or(0)
    }

    /// Current consensus configuration.
    pub fn roster(&self) -> Roster {
        let metrics = self.raft.metrics().borrow().clone();
        Roster::from_membership(metrics.membership_config.membership())
    }

    /// Wait until some node is known as leader.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<NodeId, RaftError> {
        let metrics = self
            .raft
            .wait(Some(timeout))
            .metrics(|m| m.current_leader.is_some(), "leader known")
            .await
            .map_err(|e| RaftError::Timeout(e.to_string()))?;
        metrics.current_leader.ok_or(RaftError::NoLeader)
    }

    /// Ask the engine to build a snapshot now.
    pub async fn trigger_snapshot(&self) -> Result<(), RaftError> {
        self.raft
            .trigger()
            .snapshot()
            .await
            .map_err(|e| RaftError::Snapshot(e.to_string()))
    }

    /// Handle to the counter for reads and manual backup/restore.
    pub fn counter(&self) -> &CounterHandle {
        &self.counter
    }

    /// This node's membership record.
    pub fn node(&self) -> &ClusterNode {
        &self.node
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn config(&self) -> &RaftConfig {
        &self.config
    }

    /// Stop the engine and the transport.
    pub async fn shutdown(&self) -> Result<(), RaftError> {
        if let Some(tx) = self.transport_shutdown.lock().take() {
            let _ = tx.send(());
        }
        self.raft
            .shutdown()
            .await
            .map_err(|e| RaftError::Internal(format!("shutdown failed: {e}")))?;

        tracing::info!(node = %self.node.name, "raft engine shut down");
        Ok(())
    }
}

fn map_write_error(err: WriteError, other: fn(String) -> RaftError) -> RaftError {
    let forward: Option<&ForwardToLeader<NodeId, ClusterNode>> = err.forward_to_leader();
    match forward {
        Some(forward) => RaftError::NotLeader {
            leader_name: forward.leader_node.as_ref().map(|n| n.name.clone()),
            leader_http_addr: forward.leader_node.as_ref().map(|n| n.http_addr.clone()),
        },
        None => other(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn free_addr() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().to_string()
    }

    fn test_config(name: &str, dir: &std::path::Path) -> RaftConfig {
        RaftConfig::new(name)
            .with_raft_addr(free_addr())
            .with_http_addr("127.0.0.1:1")
            .with_heartbeat_interval_ms(50)
            .with_election_timeout_ms(150, 300)
            .with_data_dir(dir)
    }

    #[tokio::test]
    async fn test_follower_write_is_not_leader() {
        let dir = tempfile::tempdir().unwrap();
        let manager = RaftClusterManager::new(test_config("node1", dir.path()))
            .await
            .unwrap();

        assert!(!manager.has_prior_state());
        assert!(!manager.is_leader());
        assert!(manager.current_leader().is_none());

        let err = manager.apply(Command::increment()).await.unwrap_err();
        assert!(err.is_not_leader(), "unexpected error: {err}");

        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_single_voter_roster() {
        let dir = tempfile::tempdir().unwrap();
        let manager = RaftClusterManager::new(test_config("node1", dir.path()))
            .await
            .unwrap();

        manager.initialize_single().await.unwrap();
        manager.wait_for_leader(Duration::from_secs(5)).await.unwrap();

        assert!(manager.is_leader());
        assert_eq!(manager.role(), "Leader");
        let (leader_id, leader) = manager.current_leader().unwrap();
        assert_eq!(leader_id, manager.node_id());
        assert_eq!(leader.http_addr, "127.0.0.1:1");

        let roster = manager.roster();
        assert_eq!(roster.entries().len(), 1);
        assert!(roster.find_by_name("node1").unwrap().voter);

        let plan = manager
            .join_voter("node1", &manager.node().raft_addr.clone(), "127.0.0.1:1")
            .await
            .unwrap();
        assert_eq!(plan, JoinPlan::AlreadyVoter);

        manager.shutdown().await.unwrap();
    }
}
