//! Storage implementations for Raft.
//!
//! This module provides:
//! - [`SledRaftLogStorage`] - persistent log storage using sled
//! - [`CounterStateMachine`] - state machine that applies counter commands
//! - Engine snapshots and the manual backup file

pub mod backup;
pub mod log_storage;
pub mod snapshot;
pub mod state_machine;

pub use log_storage::SledRaftLogStorage;
pub use snapshot::{CounterSnapshotBuilder, SnapshotData};
pub use state_machine::{CounterHandle, CounterStateMachine, DEDUP_WINDOW};
