//! Tally Raft - consensus for the tally replicated counter using openraft.
//!
//! This crate wires openraft to the pieces a counter node needs:
//! - [`SledRaftLogStorage`] - persistent log, vote and commit index in sled
//! - [`CounterStateMachine`] - applies `increment` commands to a single counter
//! - [`NngRaftNetwork`] - Raft RPCs over NNG request/reply sockets
//! - [`RaftClusterManager`] - the constructed-once engine handle used by the node
//!
//! # Usage
//!
//! ```ignore
//! use tally_raft::{Command, RaftClusterManager, RaftConfig};
//!
//! let config = RaftConfig::new("node1")
//!     .with_raft_addr("127.0.0.1:9001")
//!     .with_http_addr("127.0.0.1:9000");
//!
//! let manager = RaftClusterManager::new(config).await?;
//! if !manager.has_prior_state() {
//!     manager.initialize_single().await?;
//! }
//!
//! let response = manager.apply(Command::increment()).await?;
//! ```

pub mod cluster;
pub mod config;
pub mod error;
pub mod network;
pub mod storage;
pub mod types;

pub use cluster::manager::{RaftClusterManager, SharedRaftClusterManager};
pub use cluster::membership::{JoinPlan, Roster, RosterEntry};
pub use config::RaftConfig;
pub use error::RaftError;
pub use network::transport::NngRaftNetwork;
pub use storage::log_storage::SledRaftLogStorage;
pub use storage::state_machine::{CounterHandle, CounterStateMachine};
pub use types::{raft_node_id, ClusterNode, Command, CounterResponse, NodeId, TypeConfig};

pub use openraft::{RaftMetrics, ServerState};
