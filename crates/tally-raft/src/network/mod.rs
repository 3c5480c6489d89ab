//! Network transport implementations for Raft.
//!
//! This module provides:
//! - [`NngRaftNetwork`] - client side of the Raft RPCs
//! - [`NngNetworkFactory`] - creates clients on demand for openraft
//! - [`RaftTransport`] - server receiving Raft RPCs
//! - the wire messages

pub mod factory;
pub mod messages;
pub mod server;
pub mod transport;

pub use factory::NngNetworkFactory;
pub use messages::{RaftReply, RaftRequest};
pub use server::{RaftTransport, TransportHandle};
pub use transport::NngRaftNetwork;
