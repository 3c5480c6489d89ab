//! Node configuration.

use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tally_raft::RaftConfig;

use crate::error::Error;

/// Tally node command line arguments.
#[derive(Debug, Parser)]
#[command(name = "tally-node")]
#[command(about = "Gossip-bootstrapped node of the tally replicated counter")]
pub struct Args {
    /// Node identifier, unique within the fleet.
    #[arg(long, default_value = "node1")]
    pub id: String,

    /// Admin HTTP bind address.
    #[arg(long, default_value = ":9000")]
    pub http: String,

    /// Raft RPC bind address.
    #[arg(long, default_value = ":9001")]
    pub raft: String,

    /// Admin address of a leader to join, skipping discovery.
    #[arg(long)]
    pub join: Option<String>,

    /// Gossip bind address. Derived from the node id when unset.
    #[arg(long)]
    pub gossip: Option<String>,

    /// Gossip seed addresses. Defaults to the well-known candidate ports.
    #[arg(long = "seed")]
    pub seeds: Vec<String>,

    /// Explicit admin address of a peer, as `id=host:port`.
    #[arg(long = "peer-admin", value_parser = parse_peer_admin)]
    pub peer_admin: Vec<(String, String)>,

    /// Host used to complete bind addresses that omit one.
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Address advertised for Raft RPCs, when it differs from the bind address.
    #[arg(long)]
    pub raft_advertise: Option<String>,

    /// Address advertised for the admin API, when it differs from the bind address.
    #[arg(long)]
    pub http_advertise: Option<String>,

    /// Root data directory; the node keeps its state in `<data-dir>/<id>`.
    #[arg(long, default_value = "./raft-data")]
    pub data_dir: PathBuf,

    /// Manual backup file. Defaults to `<data-dir>/<id>/counter-backup.json`.
    #[arg(long)]
    pub backup_file: Option<PathBuf>,

    /// Seconds between membership refresh and bootstrap attempts.
    #[arg(long, default_value_t = 10)]
    pub tick_interval_secs: u64,

    /// Timeout (ms) for a peer status request.
    #[arg(long, default_value_t = 5_000)]
    pub status_timeout_ms: u64,

    /// Timeout (ms) for a join request, including a forwarded one.
    #[arg(long, default_value_t = 30_000)]
    pub join_timeout_ms: u64,

    /// Timeout (ms) for a command to commit.
    #[arg(long, default_value_t = 5_000)]
    pub apply_timeout_ms: u64,

    /// Log entries between engine snapshots.
    #[arg(long, default_value_t = 8)]
    pub snapshot_threshold: u64,

    /// Admin port of the node numbered 1 in the fallback address convention.
    #[arg(long, default_value_t = 9000)]
    pub http_base_port: u16,

    /// Admin port step between consecutive node numbers.
    #[arg(long, default_value_t = 2)]
    pub http_port_stride: u16,

    /// Gossip port base; node `n` gossips on `base + n`.
    #[arg(long, default_value_t = 7945)]
    pub gossip_base_port: u16,

    /// Number of well-known gossip ports tried when no seeds are given.
    #[arg(long, default_value_t = 10)]
    pub gossip_candidates: u16,
}

fn parse_peer_admin(value: &str) -> Result<(String, String), String> {
    match value.split_once('=') {
        Some((id, addr)) if !id.is_empty() && !addr.is_empty() => {
            Ok((id.to_string(), addr.to_string()))
        }
        _ => Err(format!("expected id=host:port, got '{value}'")),
    }
}

/// Maps node identifiers to their admin and gossip addresses.
///
/// The explicit table wins; otherwise the first run of digits `n` in the id
/// selects `host:(http_base_port + (n - 1) * http_port_stride)` for admin
/// and `host:(gossip_base_port + n)` for gossip.
#[derive(Debug, Clone)]
pub struct AddressScheme {
    pub host: String,
    pub http_base_port: u16,
    pub http_port_stride: u16,
    pub gossip_base_port: u16,
    pub gossip_candidates: u16,
    pub admin: HashMap<String, String>,
}

impl Default for AddressScheme {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            http_base_port: 9000,
            http_port_stride: 2,
            gossip_base_port: 7945,
            gossip_candidates: 10,
            admin: HashMap::new(),
        }
    }
}

impl AddressScheme {
    /// Register an explicit admin address for a node.
    pub fn with_admin(mut self, node_id: impl Into<String>, addr: impl Into<String>) -> Self {
        self.admin.insert(node_id.into(), addr.into());
        self
    }

    /// The number embedded in a node id: its first run of digits.
    pub fn node_number(node_id: &str) -> Option<u32> {
        let digits: String = node_id
            .chars()
            .skip_while(|c| !c.is_ascii_digit())
            .take_while(|c| c.is_ascii_digit())
            .collect();
        digits.parse().ok()
    }

    /// Admin address of `node_id`, if one is known or derivable.
    pub fn admin_addr(&self, node_id: &str) -> Option<String> {
        if let Some(addr) = self.admin.get(node_id) {
            return Some(addr.clone());
        }
        let n = Self::node_number(node_id)?.checked_sub(1)?;
        let offset = n.checked_mul(u32::from(self.http_port_stride))?;
        let port = u16::try_from(u32::from(self.http_base_port).checked_add(offset)?).ok()?;
        Some(format!("{}:{port}", self.host))
    }

    /// Gossip address of `node_id`, if derivable.
    pub fn gossip_addr(&self, node_id: &str) -> Option<String> {
        let n = Self::node_number(node_id)?;
        let port = u16::try_from(u32::from(self.gossip_base_port).checked_add(n)?).ok()?;
        Some(format!("{}:{port}", self.host))
    }

    /// Well-known gossip addresses tried when no seeds are configured.
    pub fn candidate_seeds(&self) -> Vec<String> {
        (0..self.gossip_candidates)
            .filter_map(|i| self.gossip_base_port.checked_add(i))
            .map(|port| format!("{}:{port}", self.host))
            .collect()
    }
}

/// Immutable identity of this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    pub node_id: String,
    pub http_addr: String,
    pub raft_addr: String,
    pub gossip_addr: String,
}

/// Node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: String,
    pub http_listen: String,
    pub http_addr: String,
    pub raft_listen: String,
    pub raft_addr: String,
    pub gossip_listen: String,
    pub gossip_addr: String,
    pub join_addr: Option<String>,
    pub seeds: Vec<String>,
    pub scheme: AddressScheme,
    pub data_dir: PathBuf,
    pub backup_file: Option<PathBuf>,
    pub tick_interval: Duration,
    pub status_timeout: Duration,
    pub join_timeout: Duration,
    pub apply_timeout: Duration,
    pub snapshot_threshold: u64,
    pub heartbeat_interval_ms: u64,
    pub election_timeout_ms: (u64, u64),
}

impl NodeConfig {
    /// Create a configuration for `node_id` with explicit addresses.
    pub fn new(
        node_id: impl Into<String>,
        http_addr: impl Into<String>,
        raft_addr: impl Into<String>,
        gossip_addr: impl Into<String>,
    ) -> Self {
        let http_addr = http_addr.into();
        let raft_addr = raft_addr.into();
        let gossip_addr = gossip_addr.into();
        Self {
            node_id: node_id.into(),
            http_listen: http_addr.clone(),
            http_addr,
            raft_listen: raft_addr.clone(),
            raft_addr,
            gossip_listen: gossip_addr.clone(),
            gossip_addr,
            join_addr: None,
            seeds: Vec::new(),
            scheme: AddressScheme::default(),
            data_dir: PathBuf::from("./raft-data"),
            backup_file: None,
            tick_interval: Duration::from_secs(10),
            status_timeout: Duration::from_secs(5),
            join_timeout: Duration::from_secs(30),
            apply_timeout: Duration::from_secs(5),
            snapshot_threshold: 8,
            heartbeat_interval_ms: 250,
            election_timeout_ms: (1000, 2000),
        }
    }

    pub fn with_join_addr(mut self, addr: impl Into<String>) -> Self {
        self.join_addr = Some(addr.into());
        self
    }

    pub fn with_seeds(mut self, seeds: Vec<String>) -> Self {
        self.seeds = seeds;
        self
    }

    pub fn with_scheme(mut self, scheme: AddressScheme) -> Self {
        self.scheme = scheme;
        self
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_status_timeout(mut self, timeout: Duration) -> Self {
        self.status_timeout = timeout;
        self
    }

    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    /// Raft heartbeat and election timing, in milliseconds.
    pub fn with_raft_timing(
        mut self,
        heartbeat_ms: u64,
        election_min_ms: u64,
        election_max_ms: u64,
    ) -> Self {
        self.heartbeat_interval_ms = heartbeat_ms;
        self.election_timeout_ms = (election_min_ms, election_max_ms);
        self
    }

    pub fn identity(&self) -> NodeIdentity {
        NodeIdentity {
            node_id: self.node_id.clone(),
            http_addr: self.http_addr.clone(),
            raft_addr: self.raft_addr.clone(),
            gossip_addr: self.gossip_addr.clone(),
        }
    }

    /// Gossip seeds: configured ones, else the scheme's candidates.
    pub fn seed_addrs(&self) -> Vec<SocketAddr> {
        let seeds = if self.seeds.is_empty() {
            self.scheme.candidate_seeds()
        } else {
            self.seeds.clone()
        };

        seeds
            .iter()
            .filter_map(|seed| match seed.to_socket_addrs() {
                Ok(mut addrs) => addrs.next(),
                Err(e) => {
                    tracing::warn!(seed = %seed, error = %e, "ignoring unresolvable seed");
                    None
                }
            })
            .collect()
    }

    /// Engine configuration for this node.
    pub fn raft_config(&self) -> RaftConfig {
        let mut config = RaftConfig::new(self.node_id.clone())
            .with_raft_addr(self.raft_listen.clone())
            .with_raft_advertise_addr(self.raft_addr.clone())
            .with_http_addr(self.http_addr.clone())
            .with_data_dir(self.data_dir.clone())
            .with_snapshot_threshold(self.snapshot_threshold)
            .with_heartbeat_interval_ms(self.heartbeat_interval_ms)
            .with_election_timeout_ms(self.election_timeout_ms.0, self.election_timeout_ms.1)
            .with_apply_timeout(self.apply_timeout)
            .with_membership_timeout(self.join_timeout);
        if let Some(path) = &self.backup_file {
            config = config.with_backup_path(path.clone());
        }
        config
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::new("node1", "127.0.0.1:9000", "127.0.0.1:9001", "127.0.0.1:7946")
    }
}

/// Complete an address that omits its host.
fn advertised(addr: &str, host: &str) -> String {
    match addr.strip_prefix("0.0.0.0:") {
        Some(port) => format!("{host}:{port}"),
        None if addr.starts_with(':') => format!("{host}{addr}"),
        None => addr.to_string(),
    }
}

fn listen(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

impl Args {
    /// Convert command line arguments into a node configuration.
    pub fn into_config(self) -> Result<NodeConfig, Error> {
        let scheme = AddressScheme {
            host: self.host.clone(),
            http_base_port: self.http_base_port,
            http_port_stride: self.http_port_stride,
            gossip_base_port: self.gossip_base_port,
            gossip_candidates: self.gossip_candidates,
            admin: self.peer_admin.into_iter().collect(),
        };

        let gossip = match self.gossip {
            Some(addr) => addr,
            None => scheme.gossip_addr(&self.id).ok_or_else(|| {
                Error::Config(format!(
                    "cannot derive a gossip port from node id '{}'; pass --gossip",
                    self.id
                ))
            })?,
        };
        let gossip_listen = listen(&gossip);

        let http_addr = self
            .http_advertise
            .clone()
            .unwrap_or_else(|| advertised(&self.http, &self.host));
        let raft_addr = self
            .raft_advertise
            .clone()
            .unwrap_or_else(|| advertised(&self.raft, &self.host));

        let gossip_addr = advertised(&gossip, &self.host);

        let mut config = NodeConfig::new(self.id, http_addr, raft_addr, gossip_addr)
            .with_scheme(scheme)
            .with_seeds(self.seeds)
            .with_data_dir(self.data_dir)
            .with_tick_interval(Duration::from_secs(self.tick_interval_secs.max(1)))
            .with_status_timeout(Duration::from_millis(self.status_timeout_ms))
            .with_join_timeout(Duration::from_millis(self.join_timeout_ms));
        config.http_listen = listen(&self.http);
        config.raft_listen = listen(&self.raft);
        config.gossip_listen = gossip_listen;
        config.join_addr = self.join.filter(|addr| !addr.is_empty());
        config.backup_file = self.backup_file;
        config.apply_timeout = Duration::from_millis(self.apply_timeout_ms);
        config.snapshot_threshold = self.snapshot_threshold;
        Ok(config)
    }
}
