//! Bootstrap orchestration.
//!
//! Every tick refreshes gossip membership and, until the node has started,
//! decides between founding a group, joining a leader, recovering from local
//! state or waiting for the next tick.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::config::NodeIdentity;
use crate::context::NodeContext;
use crate::discovery::{DiscoveryOutcome, LeaderDiscovery};
use crate::error::Error;

/// Membership refreshes before the first bootstrap decision.
pub const DEFAULT_SETTLE_ROUNDS: u32 = 1;

/// Asks a leader to admit this node.
#[derive(Debug, Clone)]
pub struct JoinClient {
    http: reqwest::Client,
    timeout: Duration,
}

impl JoinClient {
    pub fn new(http: reqwest::Client, timeout: Duration) -> Self {
        Self { http, timeout }
    }

    /// Send `POST /join` to `admin_addr`. Succeeds only on `200`.
    pub async fn join(&self, admin_addr: &str, identity: &NodeIdentity) -> Result<(), Error> {
        let response = self
            .http
            .post(format!("http://{admin_addr}/join"))
            .query(&[
                ("id", identity.node_id.as_str()),
                ("addr", identity.raft_addr.as_str()),
                ("http", identity.http_addr.as_str()),
            ])
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| Error::Membership(format!("join request to {admin_addr} failed: {e}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::OK {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(Error::Membership(format!(
            "join rejected by {admin_addr}: {status} {body}"
        )))
    }
}

/// Drives a node from not-started to started, exactly once.
///
/// Gossip needs a round trip before the peer list means anything, so no
/// bootstrap decision is taken until membership has been refreshed
/// `settle_rounds` times.
pub struct BootstrapOrchestrator {
    context: Arc<NodeContext>,
    discovery: LeaderDiscovery,
    join_client: JoinClient,
    seeds: Vec<SocketAddr>,
    settle_rounds: u32,
    refreshes: AtomicU32,
}

impl BootstrapOrchestrator {
    pub fn new(context: Arc<NodeContext>, http: reqwest::Client) -> Self {
        let config = context.config();
        let discovery = LeaderDiscovery::new(
            config.node_id.clone(),
            config.scheme.clone(),
            http.clone(),
            config.status_timeout,
        );
        let join_client = JoinClient::new(http, config.join_timeout);
        let seeds = config.seed_addrs();

        Self {
            context,
            discovery,
            join_client,
            seeds,
            settle_rounds: DEFAULT_SETTLE_ROUNDS,
            refreshes: AtomicU32::new(0),
        }
    }

    /// Membership refreshes to wait for before the first decision.
    pub fn with_settle_rounds(mut self, rounds: u32) -> Self {
        self.settle_rounds = rounds;
        self
    }

    /// Tick until `shutdown` fires. Returns early only on a fatal error.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> Result<(), Error> {
        let period = self.context.config().tick_interval;
        let mut ticker = interval_at(Instant::now(), period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await?;
                }
                _ = shutdown.recv() => {
                    tracing::debug!("bootstrap loop stopping");
                    return Ok(());
                }
            }
        }
    }

    /// One round. Returns `true` when this round started the node.
    pub async fn tick(&self) -> Result<bool, Error> {
        let membership = self.context.membership();
        match membership.join(&self.seeds).await {
            Ok(contacted) => tracing::trace!(contacted, "membership refreshed"),
            Err(e) => tracing::warn!(error = %e, "membership refresh failed"),
        }
        let refreshes = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;

        if self.context.is_started() {
            return Ok(false);
        }

        if let Some(addr) = &self.context.config().join_addr {
            return self.join_leader(addr).await;
        }

        let recovering = self.has_local_store() && self.context.engine().await?.has_prior_state();

        if refreshes <= self.settle_rounds {
            tracing::info!(recovering, "waiting for membership to settle");
            return Ok(false);
        }

        let peers = membership.members();
        match self.discovery.discover(&peers).await {
            DiscoveryOutcome::Alone | DiscoveryOutcome::Uncontested => self.found().await,
            DiscoveryOutcome::Leader(addr) if addr == self.context.identity().http_addr => {
                tracing::info!("peers report this node as leader");
                self.start()
            }
            DiscoveryOutcome::Leader(addr) => self.join_leader(&addr).await,
            DiscoveryOutcome::NoLeaderFound if recovering => {
                tracing::info!("no reachable leader; recovering from durable raft state");
                self.start()
            }
            DiscoveryOutcome::NoLeaderFound => {
                tracing::info!(peers = peers.len(), "no leader yet; waiting");
                Ok(false)
            }
        }
    }

    fn has_local_store(&self) -> bool {
        self.context.config().raft_config().store_path().exists()
    }

    /// Start as the first voter, unless the store already belongs to a group.
    async fn found(&self) -> Result<bool, Error> {
        let engine = self.context.engine().await?;

        if !engine.has_prior_state() && engine.roster().is_empty() {
            if let Err(e) = engine.initialize_single().await {
                tracing::warn!(error = %e, "failed to initialize single-voter cluster");
                return Ok(false);
            }
        }
        self.start()
    }

    /// Ask the leader to admit this node. Also re-announces a node with prior
    /// state, so a changed Raft address replaces the stale record.
    async fn join_leader(&self, admin_addr: &str) -> Result<bool, Error> {
        self.context.engine().await?;

        let identity = self.context.identity();
        tracing::info!(leader = %admin_addr, "requesting to join");
        match self.join_client.join(admin_addr, identity).await {
            Ok(()) => {
                tracing::info!(leader = %admin_addr, "joined cluster");
                self.start()
            }
            Err(e) => {
                tracing::warn!(error = %e, "join failed; retrying next tick");
                Ok(false)
            }
        }
    }

    fn start(&self) -> Result<bool, Error> {
        self.context.register_handlers()?;
        Ok(true)
    }
}
