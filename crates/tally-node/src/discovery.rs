//! Leader discovery.
//!
//! Turns the gossip peer list into a decision for the bootstrap
//! orchestrator by polling each peer's `/status` until one names a leader.

use std::time::Duration;

use reqwest::StatusCode;

use crate::config::AddressScheme;
use crate::error::{ErrorResponse, NOT_STARTED};
use crate::json::ClusterState;
use crate::membership::PeerRecord;

/// Result of one discovery round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryOutcome {
    /// No peer other than this node is visible.
    Alone,
    /// A peer reported a leader reachable at this admin address.
    Leader(String),
    /// Peers are visible but none reported a leader. Retry later.
    NoLeaderFound,
    /// Every visible peer is still waiting to start, all of them see
    /// exactly the members this node sees, and this node has the smallest
    /// id, so it founds the group.
    Uncontested,
}

/// How one peer answered a status request.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PeerStatus {
    Leader(String),
    NoLeader,
    /// Not started yet; carries the members the peer sees.
    Pending(Vec<String>),
    Unreachable,
}

/// Polls peers for the current leader.
#[derive(Debug, Clone)]
pub struct LeaderDiscovery {
    node_id: String,
    scheme: AddressScheme,
    http: reqwest::Client,
    timeout: Duration,
}

impl LeaderDiscovery {
    pub fn new(
        node_id: impl Into<String>,
        scheme: AddressScheme,
        http: reqwest::Client,
        timeout: Duration,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            scheme,
            http,
            timeout,
        }
    }

    /// Poll peers in order and stop at the first one that names a leader.
    pub async fn discover(&self, peers: &[PeerRecord]) -> DiscoveryOutcome {
        let others: Vec<&PeerRecord> = peers
            .iter()
            .filter(|peer| peer.node_id != self.node_id)
            .collect();

        if others.is_empty() {
            return DiscoveryOutcome::Alone;
        }

        let mut view: Vec<String> = others.iter().map(|peer| peer.node_id.clone()).collect();
        view.push(self.node_id.clone());
        view.sort();
        view.dedup();

        let mut views_agree = true;
        for peer in &others {
            match self.peer_status(peer).await {
                PeerStatus::Leader(addr) => {
                    tracing::info!(peer = %peer.node_id, leader = %addr, "found leader");
                    return DiscoveryOutcome::Leader(addr);
                }
                PeerStatus::Pending(peer_view) if peer_view == view => {}
                PeerStatus::Pending(peer_view) => {
                    tracing::debug!(peer = %peer.node_id, ?peer_view, "peer sees other members");
                    views_agree = false;
                }
                PeerStatus::NoLeader | PeerStatus::Unreachable => views_agree = false,
            }
        }

        if views_agree && view.first() == Some(&self.node_id) {
            tracing::info!(members = ?view, "all members waiting; founding the cluster");
            return DiscoveryOutcome::Uncontested;
        }

        tracing::debug!(peers = others.len(), "no leader found");
        DiscoveryOutcome::NoLeaderFound
    }

    async fn peer_status(&self, peer: &PeerRecord) -> PeerStatus {
        let Some(addr) = self.scheme.admin_addr(&peer.node_id) else {
            tracing::debug!(peer = %peer.node_id, "no admin address for peer; skipping");
            return PeerStatus::Unreachable;
        };

        let response = match self
            .http
            .get(format!("http://{addr}/status"))
            .timeout(self.timeout)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!(peer = %peer.node_id, addr = %addr, error = %e, "status request failed");
                return PeerStatus::Unreachable;
            }
        };

        match response.status() {
            StatusCode::OK => match response.json::<ClusterState>().await {
                Ok(state) => match state.leader_http_addr() {
                    Some(leader) => PeerStatus::Leader(leader.to_string()),
                    None => PeerStatus::NoLeader,
                },
                Err(e) => {
                    tracing::warn!(peer = %peer.node_id, error = %e, "undecodable status");
                    PeerStatus::Unreachable
                }
            },
            StatusCode::SERVICE_UNAVAILABLE => match response.json::<ErrorResponse>().await {
                Ok(body) if body.code == NOT_STARTED => {
                    let mut view = body.members;
                    view.sort();
                    PeerStatus::Pending(view)
                }
                _ => PeerStatus::Unreachable,
            },
            status => {
                tracing::debug!(peer = %peer.node_id, %status, "unexpected status response");
                PeerStatus::Unreachable
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use axum::{routing::get, Json, Router};

    use super::*;
    use crate::error::AppError;
    use crate::json::LeaderJson;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr
    }

    fn status_server(leader: &str, hits: Arc<AtomicUsize>) -> Router {
        let state = ClusterState {
            leader: LeaderJson {
                http_address: leader.to_string(),
                ..Default::default()
            },
            role: "Follower".into(),
            ..Default::default()
        };
        Router::new().route(
            "/status",
            get(move || {
                hits.fetch_add(1, Ordering::SeqCst);
                let state = state.clone();
                async move { Json(state) }
            }),
        )
    }

    fn pending_server(view: &[&str]) -> Router {
        let view: Vec<String> = view.iter().map(|id| id.to_string()).collect();
        Router::new().route(
            "/status",
            get(move || {
                let view = view.clone();
                async move { Err::<Json<ClusterState>, _>(AppError::Pending(view)) }
            }),
        )
    }

    fn discovery(node_id: &str, scheme: AddressScheme) -> LeaderDiscovery {
        LeaderDiscovery::new(
            node_id,
            scheme,
            reqwest::Client::new(),
            Duration::from_secs(2),
        )
    }

    #[tokio::test]
    async fn test_alone() {
        let d = discovery("node1", AddressScheme::default());
        assert_eq!(d.discover(&[]).await, DiscoveryOutcome::Alone);
        assert_eq!(
            d.discover(&[PeerRecord::new("node1", "127.0.0.1:7946")]).await,
            DiscoveryOutcome::Alone
        );
    }

    #[tokio::test]
    async fn test_first_leader_wins() {
        let first_hits = Arc::new(AtomicUsize::new(0));
        let second_hits = Arc::new(AtomicUsize::new(0));
        let first = serve(status_server("10.0.0.1:9000", first_hits.clone())).await;
        let second = serve(status_server("10.0.0.2:9000", second_hits.clone())).await;

        let scheme = AddressScheme::default()
            .with_admin("down", "127.0.0.1:1")
            .with_admin("node2", first)
            .with_admin("node3", second);
        let d = discovery("node1", scheme);

        let peers = vec![
            PeerRecord::new("node1", "a"),
            PeerRecord::new("down", "b"),
            PeerRecord::new("node2", "c"),
            PeerRecord::new("node3", "d"),
        ];
        assert_eq!(
            d.discover(&peers).await,
            DiscoveryOutcome::Leader("10.0.0.1:9000".into())
        );
        assert_eq!(first_hits.load(Ordering::SeqCst), 1);
        assert_eq!(second_hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_no_leader_found() {
        let addr = serve(status_server("", Arc::new(AtomicUsize::new(0)))).await;
        let d = discovery("node1", AddressScheme::default().with_admin("node2", addr));

        let peers = vec![PeerRecord::new("node2", "x")];
        assert_eq!(d.discover(&peers).await, DiscoveryOutcome::NoLeaderFound);
    }

    #[tokio::test]
    async fn test_unresolvable_peer_is_skipped() {
        let d = discovery("node1", AddressScheme::default());
        let peers = vec![PeerRecord::new("alpha", "x")];
        assert_eq!(d.discover(&peers).await, DiscoveryOutcome::NoLeaderFound);
    }

    #[tokio::test]
    async fn test_smallest_id_founds_when_views_agree() {
        let agreeing = serve(pending_server(&["node2", "node1"])).await;
        let scheme = AddressScheme::default().with_admin("node2", agreeing);

        let smallest = discovery("node1", scheme.clone());
        assert_eq!(
            smallest.discover(&[PeerRecord::new("node2", "x")]).await,
            DiscoveryOutcome::Uncontested
        );

        let larger = discovery("node3", scheme);
        assert_eq!(
            larger.discover(&[PeerRecord::new("node2", "x")]).await,
            DiscoveryOutcome::NoLeaderFound
        );
    }

    #[tokio::test]
    async fn test_diverging_views_do_not_found() {
        // node2 sees node3, which node1 does not know about.
        let diverging = serve(pending_server(&["node2", "node3"])).await;
        let d = discovery(
            "node1",
            AddressScheme::default().with_admin("node2", diverging),
        );

        assert_eq!(
            d.discover(&[PeerRecord::new("node2", "x")]).await,
            DiscoveryOutcome::NoLeaderFound
        );
    }

    #[tokio::test]
    async fn test_bare_not_started_does_not_found() {
        let bare = serve(Router::new().route(
            "/status",
            get(|| async { Err::<Json<ClusterState>, _>(AppError::NotStarted) }),
        ))
        .await;
        let d = discovery("node1", AddressScheme::default().with_admin("node2", bare));

        assert_eq!(
            d.discover(&[PeerRecord::new("node2", "x")]).await,
            DiscoveryOutcome::NoLeaderFound
        );
    }
}
