//! Tally node.
//!
//! A node discovers its peers over gossip, locates the consensus leader by
//! polling their admin API, then founds or joins the Raft group that
//! replicates the counter. This crate holds the pieces around the engine:
//! - [`config`] - command line and address derivation
//! - [`membership`] - the gossip membership provider
//! - [`discovery`] and [`bootstrap`] - leader discovery and the start-up state machine
//! - [`routes`] - the admin HTTP API

pub mod bootstrap;
pub mod config;
pub mod context;
pub mod discovery;
pub mod error;
pub mod json;
pub mod membership;
pub mod routes;

pub use bootstrap::{BootstrapOrchestrator, JoinClient};
pub use config::{AddressScheme, Args, NodeConfig, NodeIdentity};
pub use context::NodeContext;
pub use discovery::{DiscoveryOutcome, LeaderDiscovery};
pub use error::{AppError, Error};
pub use membership::{GossipMembership, MembershipProvider, PeerRecord, StaticMembership};

use std::sync::Arc;

use axum::Router;
use tower_http::trace::TraceLayer;

/// Application state shared across all routes.
#[derive(Clone)]
pub struct AppState {
    /// Node context holding the engine once it exists.
    pub context: Arc<NodeContext>,
    /// Client used to forward joins to the leader.
    pub http: reqwest::Client,
}

impl AppState {
    /// Create new application state.
    pub fn new(context: Arc<NodeContext>, http: reqwest::Client) -> Self {
        Self { context, http }
    }
}

/// Create the router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(routes::status::routes())
        .merge(routes::counter::routes())
        .merge(routes::join::routes())
        .merge(routes::backup::routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
