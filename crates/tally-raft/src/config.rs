//! Configuration types for a Raft node.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{raft_node_id, ClusterNode, NodeId};

/// Default file name of the manual counter backup inside the node directory.
pub const DEFAULT_BACKUP_FILE: &str = "counter-backup.json";

/// Configuration for a Raft node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftConfig {
    /// This node's unique name (the string node identifier).
    pub node_name: String,

    /// Address this node listens on for Raft RPCs.
    pub raft_listen_addr: String,

    /// Address other nodes use to reach this node's Raft RPCs.
    pub raft_advertise_addr: String,

    /// Address other nodes use to reach this node's admin API.
    pub http_advertise_addr: String,

    /// Heartbeat interval in milliseconds.
    pub heartbeat_interval_ms: u64,

    /// Minimum election timeout in milliseconds.
    pub election_timeout_min_ms: u64,

    /// Maximum election timeout in milliseconds.
    pub election_timeout_max_ms: u64,

    /// Number of log entries between snapshots.
    pub snapshot_threshold: u64,

    /// Maximum entries per AppendEntries RPC.
    pub max_entries_per_append: u64,

    /// Root directory for Raft data; each node uses `<data_dir>/<node_name>`.
    pub data_dir: PathBuf,

    /// Manual backup file. Defaults to `<node dir>/counter-backup.json`.
    pub backup_path: Option<PathBuf>,

    /// How long a client write waits for commit.
    #[serde(with = "duration_ms")]
    pub apply_timeout: Duration,

    /// Timeout for a single outbound Raft RPC.
    #[serde(with = "duration_ms")]
    pub rpc_timeout: Duration,

    /// How long admitting a joining node (catch-up plus promotion) may take.
    #[serde(with = "duration_ms")]
    pub membership_timeout: Duration,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            node_name: "node1".to_string(),
            raft_listen_addr: "127.0.0.1:9001".to_string(),
            raft_advertise_addr: "127.0.0.1:9001".to_string(),
            http_advertise_addr: "127.0.0.1:9000".to_string(),
            heartbeat_interval_ms: 250,
            election_timeout_min_ms: 1000,
            election_timeout_max_ms: 2000,
            snapshot_threshold: 8,
            max_entries_per_append: 100,
            data_dir: PathBuf::from("./raft-data"),
            backup_path: None,
            apply_timeout: Duration::from_secs(5),
            rpc_timeout: Duration::from_secs(5),
            membership_timeout: Duration::from_secs(30),
        }
    }
}

impl RaftConfig {
    /// Create a new configuration for the named node.
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            ..Default::default()
        }
    }

    /// Set the Raft address, used both to listen and to advertise.
    pub fn with_raft_addr(mut self, addr: impl Into<String>) -> Self {
        let addr = addr.into();
        self.raft_listen_addr = addr.clone();
        self.raft_advertise_addr = addr;
        self
    }

    /// Set the Raft advertise address only.
    pub fn with_raft_advertise_addr(mut self, addr: impl Into<String>) -> Self {
        self.raft_advertise_addr = addr.into();
        self
    }

    /// Set the admin (HTTP) address advertised in the cluster membership.
    pub fn with_http_addr(mut self, addr: impl Into<String>) -> Self {
        self.http_advertise_addr = addr.into();
        self
    }

    /// Set the heartbeat interval.
    pub fn with_heartbeat_interval_ms(mut self, ms: u64) -> Self {
        self.heartbeat_interval_ms = ms;
        self
    }

    /// Set the election timeout range.
    pub fn with_election_timeout_ms(mut self, min_ms: u64, max_ms: u64) -> Self {
        self.election_timeout_min_ms = min_ms;
        self.election_timeout_max_ms = max_ms;
        self
    }

    /// Set the snapshot threshold.
    pub fn with_snapshot_threshold(mut self, threshold: u64) -> Self {
        self.snapshot_threshold = threshold;
        self
    }

    /// Set the data directory.
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    /// Set an explicit manual backup path.
    pub fn with_backup_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.backup_path = Some(path.into());
        self
    }

    /// Set the apply (commit wait) timeout.
    pub fn with_apply_timeout(mut self, timeout: Duration) -> Self {
        self.apply_timeout = timeout;
        self
    }

    /// Set the per-RPC timeout.
    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    /// Set the timeout for admitting a joining node.
    pub fn with_membership_timeout(mut self, timeout: Duration) -> Self {
        self.membership_timeout = timeout;
        self
    }

    /// Numeric openraft id derived from the node name.
    pub fn node_id(&self) -> NodeId {
        raft_node_id(&self.node_name)
    }

    /// The membership record this node advertises.
    pub fn cluster_node(&self) -> ClusterNode {
        ClusterNode::new(
            self.node_name.clone(),
            self.raft_advertise_addr.clone(),
            self.http_advertise_addr.clone(),
        )
    }

    /// Directory owned by this node.
    pub fn node_dir(&self) -> PathBuf {
        self.data_dir.join(&self.node_name)
    }

    /// Path of the sled database holding log, vote and state machine trees.
    pub fn store_path(&self) -> PathBuf {
        self.node_dir().join("raft.db")
    }

    /// Directory for engine snapshots.
    pub fn snapshot_dir(&self) -> PathBuf {
        self.node_dir().join("snapshots")
    }

    /// Path of the manual backup file.
    pub fn backup_path(&self) -> PathBuf {
        self.backup_path
            .clone()
            .unwrap_or_else(|| self.node_dir().join(DEFAULT_BACKUP_FILE))
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
