//! Engine snapshots of the counter state.

use std::collections::VecDeque;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyerror::AnyError;
use openraft::storage::{RaftSnapshotBuilder, Snapshot};
use openraft::{StorageError, StorageIOError};
use serde::{Deserialize, Serialize};

use crate::error::RaftError;
use crate::storage::state_machine::SharedCounter;
use crate::types::{NodeId, SnapshotMeta, TypeConfig};

const SNAPSHOT_VERSION: u32 = 1;
const META_FILE: &str = "current.meta";
const DATA_FILE: &str = "current.snap";

/// Serialized snapshot payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotData {
    /// Snapshot format version.
    pub version: u32,
    /// Counter value at the snapshot point.
    pub counter: u64,
    /// Recently applied request ids and the value each produced.
    #[serde(default)]
    pub recent: VecDeque<(String, u64)>,
}

impl SnapshotData {
    pub fn new(counter: u64, recent: VecDeque<(String, u64)>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            counter,
            recent,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, RaftError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, RaftError> {
        let data: SnapshotData = serde_json::from_slice(bytes)?;
        if data.version != SNAPSHOT_VERSION {
            return Err(RaftError::Snapshot(format!(
                "unsupported snapshot version {}",
                data.version
            )));
        }
        Ok(data)
    }
}

/// Builds snapshots from the shared counter state.
pub struct CounterSnapshotBuilder {
    shared: Arc<SharedCounter>,
    snapshot_dir: PathBuf,
}

impl CounterSnapshotBuilder {
    pub(crate) fn new(shared: Arc<SharedCounter>, snapshot_dir: PathBuf) -> Self {
        Self {
            shared,
            snapshot_dir,
        }
    }
}

impl RaftSnapshotBuilder<TypeConfig> for CounterSnapshotBuilder {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<NodeId>> {
        let (data, meta) = {
            let state = self.shared.lock();
            let data = SnapshotData::new(state.counter, state.recent.clone());
            let meta = SnapshotMeta {
                last_log_id: state.last_applied,
                last_membership: state.membership.clone(),
                snapshot_id: snapshot_id(state.last_applied.map(|l| l.index).unwrap_or(0)),
            };
            (data, meta)
        };

        let bytes = data
            .encode()
            .map_err(|e| StorageIOError::write_snapshot(None, AnyError::new(&e)))?;
        save_snapshot(&self.snapshot_dir, &meta, &bytes)
            .map_err(|e| StorageIOError::write_snapshot(Some(meta.signature()), AnyError::new(&e)))?;

        tracing::info!(
            snapshot_id = %meta.snapshot_id,
            counter = data.counter,
            "built snapshot"
        );

        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(bytes)),
        })
    }
}

fn snapshot_id(index: u64) -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    format!("snap-{index}-{millis}")
}

/// Metadata file contents: the engine's meta plus a digest of the payload
/// it belongs to.
#[derive(Debug, Serialize, Deserialize)]
struct StoredMeta {
    meta: SnapshotMeta,
    digest: String,
}

fn digest(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

/// Write `bytes` next to `path` and rename it into place.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), RaftError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, bytes).map_err(|e| RaftError::Snapshot(e.to_string()))?;
    std::fs::rename(&tmp, path).map_err(|e| RaftError::Snapshot(e.to_string()))?;
    Ok(())
}

/// Persist snapshot metadata and payload as the current snapshot.
pub fn save_snapshot(dir: &Path, meta: &SnapshotMeta, data: &[u8]) -> Result<(), RaftError> {
    std::fs::create_dir_all(dir).map_err(|e| RaftError::Snapshot(e.to_string()))?;
    let stored = StoredMeta {
        meta: meta.clone(),
        digest: digest(data),
    };
    let meta_bytes = serde_json::to_vec(&stored)?;
    write_atomic(&dir.join(DATA_FILE), data)?;
    write_atomic(&dir.join(META_FILE), &meta_bytes)?;
    Ok(())
}

/// Load the current snapshot, if one has been saved.
///
/// A payload that does not match the digest recorded in the metadata is
/// treated as absent.
pub fn load_snapshot(dir: &Path) -> Result<Option<(SnapshotMeta, Vec<u8>)>, RaftError> {
    let meta_path = dir.join(META_FILE);
    let data_path = dir.join(DATA_FILE);
    if !meta_path.exists() || !data_path.exists() {
        return Ok(None);
    }

    let meta_bytes = std::fs::read(&meta_path).map_err(|e| RaftError::Snapshot(e.to_string()))?;
    let stored: StoredMeta = serde_json::from_slice(&meta_bytes)?;
    let data = std::fs::read(&data_path).map_err(|e| RaftError::Snapshot(e.to_string()))?;

    if digest(&data) != stored.digest {
        tracing::warn!(
            snapshot_id = %stored.meta.snapshot_id,
            "snapshot payload does not match its metadata; ignoring"
        );
        return Ok(None);
    }
    Ok(Some((stored.meta, data)))
}
