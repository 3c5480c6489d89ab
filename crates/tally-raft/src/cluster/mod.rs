//! Cluster management for Raft.
//!
//! This module provides:
//! - [`RaftClusterManager`] - owner of the local engine
//! - [`Roster`] and [`JoinPlan`] - membership views and join planning

pub mod manager;
pub mod membership;

pub use manager::{RaftClusterManager, SharedRaftClusterManager};
pub use membership::{JoinPlan, Roster, RosterEntry};
