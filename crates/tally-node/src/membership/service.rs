//! UDP gossip membership service.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use dashmap::DashMap;
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;

use super::types::{GossipMember, GossipMessage, MemberState};
use super::{MembershipProvider, PeerRecord};
use crate::error::Error;

const GOSSIP_INTERVAL: Duration = Duration::from_millis(500);
const FAILURE_DETECTION_INTERVAL: Duration = Duration::from_secs(2);
const SUSPECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEAD_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_DATAGRAM: usize = 65_536;

/// SWIM-style gossip membership over UDP.
pub struct GossipMembership {
    local: GossipMember,
    members: DashMap<String, GossipMember>,
    socket: UdpSocket,
}

impl GossipMembership {
    /// Bind the gossip socket.
    ///
    /// `advertise` is the address peers use to reach this node; when unset
    /// the socket's local address is used.
    pub async fn bind(
        node_id: impl Into<String>,
        listen: &str,
        advertise: Option<&str>,
    ) -> Result<Arc<Self>, Error> {
        let socket = UdpSocket::bind(listen).await.map_err(|e| {
            Error::Membership(format!("failed to bind gossip socket {listen}: {e}"))
        })?;

        let addr = match advertise {
            Some(advertise) => tokio::net::lookup_host(advertise)
                .await?
                .next()
                .ok_or_else(|| {
                    Error::Membership(format!("cannot resolve gossip address {advertise}"))
                })?,
            None => socket.local_addr()?,
        };

        let local = GossipMember {
            node_id: node_id.into(),
            addr,
            state: MemberState::Alive,
            incarnation: startup_incarnation(),
            last_seen: Some(Instant::now()),
        };

        let members = DashMap::new();
        members.insert(local.node_id.clone(), local.clone());

        tracing::info!(node = %local.node_id, addr = %addr, "gossip socket bound");

        Ok(Arc::new(Self {
            local,
            members,
            socket,
        }))
    }

    /// Address peers use to reach this node.
    pub fn local_addr(&self) -> SocketAddr {
        self.local.addr
    }

    /// Spawn the gossip, receive and failure detection loops. They stop
    /// when `shutdown` fires.
    pub fn start(self: &Arc<Self>, shutdown: &broadcast::Sender<()>) {
        let service = self.clone();
        let mut rx = shutdown.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = service.gossip_loop() => {}
                _ = rx.recv() => {}
            }
        });

        let service = self.clone();
        let mut rx = shutdown.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = service.receive_loop() => {}
                _ = rx.recv() => {}
            }
        });

        let service = self.clone();
        let mut rx = shutdown.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = service.failure_detection_loop() => {}
                _ = rx.recv() => {}
            }
        });

        tracing::debug!(node = %self.local.node_id, "gossip loops started");
    }

    /// Members not known to be dead, including this node.
    pub fn alive_members(&self) -> Vec<GossipMember> {
        self.members
            .iter()
            .filter(|entry| entry.value().state != MemberState::Dead)
            .map(|entry| entry.value().clone())
            .collect()
    }

    async fn send(&self, msg: &GossipMessage, target: SocketAddr) -> Result<(), Error> {
        let encoded = serde_json::to_vec(msg)
            .map_err(|e| Error::Membership(format!("failed to encode gossip message: {e}")))?;
        self.socket.send_to(&encoded, target).await?;
        Ok(())
    }

    async fn gossip_loop(&self) {
        let mut interval = tokio::time::interval(GOSSIP_INTERVAL);

        loop {
            interval.tick().await;

            let peers: Vec<SocketAddr> = self
                .members
                .iter()
                .filter(|entry| {
                    entry.key() != &self.local.node_id && entry.value().state != MemberState::Dead
                })
                .map(|entry| entry.value().addr)
                .collect();

            if peers.is_empty() {
                continue;
            }

            let target = peers[rand::thread_rng().gen_range(0..peers.len())];
            let ping = GossipMessage::Ping {
                from: self.local.node_id.clone(),
                incarnation: self.local.incarnation,
            };
            if let Err(e) = self.send(&ping, target).await {
                tracing::debug!(target = %target, error = %e, "ping failed");
            }
        }
    }

    async fn receive_loop(&self) {
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((len, src)) => match serde_json::from_slice::<GossipMessage>(&buf[..len]) {
                    Ok(msg) => {
                        if let Err(e) = self.handle_message(msg, src).await {
                            tracing::debug!(src = %src, error = %e, "gossip reply failed");
                        }
                    }
                    Err(e) => {
                        tracing::warn!(src = %src, error = %e, "dropping malformed gossip datagram");
                    }
                },
                Err(e) => {
                    // ICMP port unreachable from a dead seed surfaces here on some platforms.
                    tracing::debug!(error = %e, "gossip receive failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn handle_message(&self, msg: GossipMessage, src: SocketAddr) -> Result<(), Error> {
        match msg {
            GossipMessage::Join { member } => {
                tracing::info!(node = %member.node_id, addr = %member.addr, "member joining");
                let reply_to = member.addr;
                self.observe(member.node_id.clone(), member.incarnation, member.addr);
                self.send(&self.ack(), reply_to).await?;
            }
            GossipMessage::Ping { from, incarnation } => {
                self.observe(from, incarnation, src);
                self.send(&self.ack(), src).await?;
            }
            GossipMessage::Ack {
                from,
                incarnation,
                members,
            } => {
                self.observe(from, incarnation, src);
                for member in members {
                    self.merge_member(member);
                }
            }
        }
        Ok(())
    }

    fn ack(&self) -> GossipMessage {
        GossipMessage::Ack {
            from: self.local.node_id.clone(),
            incarnation: self.local.incarnation,
            members: self.members.iter().map(|e| e.value().clone()).collect(),
        }
    }

    /// Record direct contact from `node_id`.
    fn observe(&self, node_id: String, incarnation: u64, addr: SocketAddr) {
        if node_id == self.local.node_id {
            return;
        }

        match self.members.get_mut(&node_id) {
            Some(mut existing) => {
                if incarnation < existing.incarnation {
                    return;
                }
                if incarnation > existing.incarnation {
                    existing.incarnation = incarnation;
                    existing.addr = addr;
                }
                if existing.state != MemberState::Alive {
                    tracing::info!(node = %node_id, "member alive again");
                }
                existing.state = MemberState::Alive;
                existing.last_seen = Some(Instant::now());
            }
            None => {
                tracing::info!(node = %node_id, addr = %addr, "discovered member");
                self.members.insert(
                    node_id.clone(),
                    GossipMember {
                        node_id,
                        addr,
                        state: MemberState::Alive,
                        incarnation,
                        last_seen: Some(Instant::now()),
                    },
                );
            }
        }
    }

    /// Merge a second-hand member record: higher incarnation wins.
    fn merge_member(&self, member: GossipMember) {
        if member.node_id == self.local.node_id {
            return;
        }

        match self.members.get_mut(&member.node_id) {
            Some(mut existing) => {
                if member.incarnation > existing.incarnation {
                    tracing::debug!(
                        node = %member.node_id,
                        from = existing.incarnation,
                        to = member.incarnation,
                        "member incarnation advanced"
                    );
                    existing.incarnation = member.incarnation;
                    existing.addr = member.addr;
                    existing.state = member.state;
                    existing.last_seen = Some(Instant::now());
                }
            }
            None if member.state == MemberState::Dead => {}
            None => {
                tracing::info!(node = %member.node_id, addr = %member.addr, "discovered member");
                let mut member = member;
                member.last_seen = Some(Instant::now());
                self.members.insert(member.node_id.clone(), member);
            }
        }
    }

    async fn failure_detection_loop(&self) {
        let mut interval = tokio::time::interval(FAILURE_DETECTION_INTERVAL);

        loop {
            interval.tick().await;
            self.detect_failures(Instant::now());
        }
    }

    fn detect_failures(&self, now: Instant) {
        for mut entry in self.members.iter_mut() {
            let member = entry.value_mut();
            if member.node_id == self.local.node_id {
                continue;
            }
            let Some(last_seen) = member.last_seen else {
                continue;
            };

            let elapsed = now.saturating_duration_since(last_seen);
            match member.state {
                MemberState::Alive if elapsed > SUSPECT_TIMEOUT => {
                    tracing::warn!(node = %member.node_id, ?elapsed, "member suspected");
                    member.state = MemberState::Suspect;
                }
                MemberState::Suspect if elapsed > DEAD_TIMEOUT => {
                    tracing::warn!(node = %member.node_id, ?elapsed, "member declared dead");
                    member.state = MemberState::Dead;
                }
                _ => {}
            }
        }
    }
}

#[async_trait]
impl MembershipProvider for GossipMembership {
    async fn join(&self, seeds: &[SocketAddr]) -> Result<usize, Error> {
        let msg = GossipMessage::Join {
            member: self.local.clone(),
        };

        let mut contacted = 0;
        for seed in seeds.iter().filter(|seed| **seed != self.local.addr) {
            match self.send(&msg, *seed).await {
                Ok(()) => contacted += 1,
                Err(e) => tracing::debug!(seed = %seed, error = %e, "seed unreachable"),
            }
        }

        tracing::debug!(contacted, members = self.members.len(), "gossip join round");
        Ok(contacted)
    }

    fn members(&self) -> Vec<PeerRecord> {
        self.alive_members()
            .into_iter()
            .map(|m| PeerRecord::new(m.node_id, m.addr.to_string()))
            .collect()
    }
}

fn startup_incarnation() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(node_id: &str, port: u16, incarnation: u64, state: MemberState) -> GossipMember {
        GossipMember {
            node_id: node_id.to_string(),
            addr: SocketAddr::from(([127, 0, 0, 1], port)),
            state,
            incarnation,
            last_seen: None,
        }
    }

    #[tokio::test]
    async fn test_members_include_self() {
        let service = GossipMembership::bind("node1", "127.0.0.1:0", None)
            .await
            .unwrap();
        let members = service.members();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].node_id, "node1");
        assert_eq!(members[0].membership_addr, service.local_addr().to_string());
    }

    #[tokio::test]
    async fn test_join_skips_own_address() {
        let service = GossipMembership::bind("node1", "127.0.0.1:0", None)
            .await
            .unwrap();
        let own = service.local_addr();
        assert_eq!(service.join(&[own]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_merge_prefers_higher_incarnation() {
        let service = GossipMembership::bind("node1", "127.0.0.1:0", None)
            .await
            .unwrap();

        service.merge_member(member("node2", 7947, 5, MemberState::Alive));
        service.merge_member(member("node2", 8000, 3, MemberState::Alive));
        assert_eq!(service.members.get("node2").unwrap().addr.port(), 7947);

        service.merge_member(member("node2", 8001, 9, MemberState::Alive));
        assert_eq!(service.members.get("node2").unwrap().addr.port(), 8001);

        // Unknown dead members are not adopted.
        service.merge_member(member("node3", 7948, 1, MemberState::Dead));
        assert!(service.members.get("node3").is_none());

        // Claims about ourselves are ignored.
        service.merge_member(member("node1", 1, u64::MAX, MemberState::Dead));
        assert_eq!(service.members().len(), 2);
    }

    #[tokio::test]
    async fn test_silent_member_becomes_suspect_then_dead() {
        let service = GossipMembership::bind("node1", "127.0.0.1:0", None)
            .await
            .unwrap();
        service.merge_member(member("node2", 7947, 1, MemberState::Alive));

        let start = Instant::now();
        service.detect_failures(start + SUSPECT_TIMEOUT + Duration::from_millis(1));
        assert_eq!(
            service.members.get("node2").unwrap().state,
            MemberState::Suspect
        );

        service.detect_failures(start + DEAD_TIMEOUT + Duration::from_millis(1));
        assert_eq!(service.members.get("node2").unwrap().state, MemberState::Dead);
        assert_eq!(service.members().len(), 1);

        // Direct contact revives it.
        service.observe("node2".into(), 1, SocketAddr::from(([127, 0, 0, 1], 7947)));
        assert_eq!(service.members().len(), 2);
    }

    #[tokio::test]
    async fn test_two_nodes_discover_each_other() {
        let (shutdown, _) = broadcast::channel(1);
        let a = GossipMembership::bind("node1", "127.0.0.1:0", None)
            .await
            .unwrap();
        let b = GossipMembership::bind("node2", "127.0.0.1:0", None)
            .await
            .unwrap();
        a.start(&shutdown);
        b.start(&shutdown);

        assert_eq!(b.join(&[a.local_addr()]).await.unwrap(), 1);

        let deadline = Instant::now() + Duration::from_secs(5);
        while (a.members().len() < 2 || b.members().len() < 2) && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(a.members().len(), 2);
        assert_eq!(b.members().len(), 2);

        let _ = shutdown.send(());
    }
}
