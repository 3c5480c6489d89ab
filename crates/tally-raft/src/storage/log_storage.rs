//! Raft log storage implementation using sled.

use std::fmt::Debug;
use std::ops::{Bound, RangeBounds};
use std::sync::Arc;

use anyerror::AnyError;
use openraft::storage::{LogFlushed, RaftLogReader, RaftLogStorage};
use openraft::{LogState, OptionalSend, StorageError, StorageIOError};
use parking_lot::RwLock;
use sled::{Batch, Db, Tree};

use crate::error::RaftError;
use crate::types::{LogEntry, LogId, NodeId, TypeConfig, Vote};

const RAFT_LOG_TREE: &str = "tally_raft_log";
const RAFT_VOTE_TREE: &str = "tally_raft_vote";
const RAFT_STATE_TREE: &str = "tally_raft_state";

const KEY_VOTE: &[u8] = b"vote";
const KEY_LAST_PURGED: &[u8] = b"last_purged_log_id";
const KEY_COMMITTED: &[u8] = b"committed";

/// Raft log storage backed by sled.
///
/// Stores:
/// - Log entries in `tally_raft_log` (key = index as big-endian u64)
/// - Vote in `tally_raft_vote`
/// - Last purged and committed log ids in `tally_raft_state`
pub struct SledRaftLogStorage {
    db: Arc<Db>,
    log_tree: Tree,
    vote_tree: Tree,
    state_tree: Tree,
    /// Shared with every reader handed out by `get_log_reader`.
    last_purged: Arc<RwLock<Option<LogId>>>,
}

impl SledRaftLogStorage {
    /// Open or create the Raft log storage in the given sled database.
    pub fn open(db: Arc<Db>) -> Result<Self, RaftError> {
        let log_tree = db.open_tree(RAFT_LOG_TREE)?;
        let vote_tree = db.open_tree(RAFT_VOTE_TREE)?;
        let state_tree = db.open_tree(RAFT_STATE_TREE)?;

        let last_purged = read_json::<LogId>(&state_tree, KEY_LAST_PURGED)?;

        Ok(Self {
            db,
            log_tree,
            vote_tree,
            state_tree,
            last_purged: Arc::new(RwLock::new(last_purged)),
        })
    }

    /// Whether this store holds durable Raft state from an earlier run.
    ///
    /// A stored vote or any log entry means the node already took part in a
    /// group and must not found a new one.
    pub fn has_state(&self) -> Result<bool, RaftError> {
        if self.vote_tree.contains_key(KEY_VOTE)? {
            return Ok(true);
        }
        if self.last_purged.read().is_some() {
            return Ok(true);
        }
        Ok(!self.log_tree.is_empty())
    }

    /// Encode log index as key (big-endian for lexicographic ordering).
    fn log_key(index: u64) -> [u8; 8] {
        index.to_be_bytes()
    }

    fn last_log_id(&self) -> Result<Option<LogId>, RaftError> {
        match self.log_tree.last()? {
            Some((_, value)) => {
                let entry: LogEntry = serde_json::from_slice(&value)?;
                Ok(Some(entry.log_id))
            }
            None => Ok(None),
        }
    }

    fn save_last_purged(&self, log_id: LogId) -> Result<(), RaftError> {
        self.state_tree
            .insert(KEY_LAST_PURGED, serde_json::to_vec(&log_id)?)?;
        *self.last_purged.write() = Some(log_id);
        Ok(())
    }

    fn write_committed(&self, committed: Option<LogId>) -> Result<(), RaftError> {
        match committed {
            Some(log_id) => {
                self.state_tree
                    .insert(KEY_COMMITTED, serde_json::to_vec(&log_id)?)?;
            }
            None => {
                self.state_tree.remove(KEY_COMMITTED)?;
            }
        }
        Ok(())
    }

    /// Remove every key in the given range with a single batch.
    fn remove_range(&self, range: impl RangeBounds<[u8; 8]>) -> Result<(), RaftError> {
        let mut batch = Batch::default();
        for item in self.log_tree.range(range) {
            let (key, _) = item?;
            batch.remove(key);
        }
        self.log_tree.apply_batch(batch)?;
        Ok(())
    }
}

fn read_json<T: serde::de::DeserializeOwned>(
    tree: &Tree,
    key: &[u8],
) -> Result<Option<T>, RaftError> {
    match tree.get(key)? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

impl RaftLogReader<TypeConfig> for SledRaftLogStorage {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> Result<Vec<LogEntry>, StorageError<NodeId>> {
        let start = match range.start_bound() {
            Bound::Included(&i) => Self::log_key(i),
            Bound::Excluded(&i) => Self::log_key(i.saturating_add(1)),
            Bound::Unbounded => Self::log_key(0),
        };

        let iter = match range.end_bound() {
            Bound::Included(&i) => self.log_tree.range(start..=Self::log_key(i)),
            Bound::Excluded(&i) => self.log_tree.range(start..Self::log_key(i)),
            Bound::Unbounded => self.log_tree.range(start..),
        };

        let mut entries = Vec::new();
        for item in iter {
            let (_, value) = item.map_err(|e| StorageIOError::read_logs(AnyError::new(&e)))?;
            let entry: LogEntry = serde_json::from_slice(&value)
                .map_err(|e| StorageIOError::read_logs(AnyError::new(&e)))?;
            entries.push(entry);
        }

        Ok(entries)
    }
}

impl RaftLogStorage<TypeConfig> for SledRaftLogStorage {
    type LogReader = Self;

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError<NodeId>> {
        let last_purged = *self.last_purged.read();
        let last_log_id = self
            .last_log_id()
            .map_err(|e| StorageIOError::read_logs(AnyError::new(&e)))?
            .or(last_purged);

        Ok(LogState {
            last_purged_log_id: last_purged,
            last_log_id,
        })
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        Self {
            db: self.db.clone(),
            log_tree: self.log_tree.clone(),
            vote_tree: self.vote_tree.clone(),
            state_tree: self.state_tree.clone(),
            last_purged: self.last_purged.clone(),
        }
    }

    async fn save_vote(&mut self, vote: &Vote) -> Result<(), StorageError<NodeId>> {
        let bytes =
            serde_json::to_vec(vote).map_err(|e| StorageIOError::write_vote(AnyError::new(&e)))?;
        self.vote_tree
            .insert(KEY_VOTE, bytes)
            .map_err(|e| StorageIOError::write_vote(AnyError::new(&e)))?;
        self.vote_tree
            .flush()
            .map_err(|e| StorageIOError::write_vote(AnyError::new(&e)))?;
        Ok(())
    }

    async fn read_vote(&mut self) -> Result<Option<Vote>, StorageError<NodeId>> {
        read_json(&self.vote_tree, KEY_VOTE)
            .map_err(|e| StorageIOError::read_vote(AnyError::new(&e)).into())
    }

    async fn save_committed(
        &mut self,
        committed: Option<LogId>,
    ) -> Result<(), StorageError<NodeId>> {
        self.write_committed(committed)
            .map_err(|e| StorageIOError::write(AnyError::new(&e)).into())
    }

    async fn read_committed(&mut self) -> Result<Option<LogId>, StorageError<NodeId>> {
        read_json(&self.state_tree, KEY_COMMITTED)
            .map_err(|e| StorageIOError::read(AnyError::new(&e)).into())
    }

    async fn append<I>(
        &mut self,
        entries: I,
        callback: LogFlushed<TypeConfig>,
    ) -> Result<(), StorageError<NodeId>>
    where
        I: IntoIterator<Item = LogEntry> + Send,
        I::IntoIter: Send,
    {
        let mut batch = Batch::default();
        for entry in entries {
            let value = serde_json::to_vec(&entry)
                .map_err(|e| StorageIOError::write_logs(AnyError::new(&e)))?;
            batch.insert(Self::log_key(entry.log_id.index).to_vec(), value);
        }

        self.log_tree
            .apply_batch(batch)
            .map_err(|e| StorageIOError::write_logs(AnyError::new(&e)))?;

        let flushed = self
            .log_tree
            .flush()
            .map(|_| ())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()));
        callback.log_io_completed(flushed);
        Ok(())
    }

    async fn truncate(&mut self, log_id: LogId) -> Result<(), StorageError<NodeId>> {
        tracing::debug!(from = log_id.index, "truncating raft log");
        self.remove_range(Self::log_key(log_id.index)..)
            .map_err(|e| StorageIOError::write_logs(AnyError::new(&e)).into())
    }

    async fn purge(&mut self, log_id: LogId) -> Result<(), StorageError<NodeId>> {
        tracing::debug!(upto = log_id.index, "purging raft log");
        // Purge point is recorded before any entry is removed.
        self.save_last_purged(log_id)
            .map_err(|e| StorageIOError::write_logs(AnyError::new(&e)))?;
        self.remove_range(..=Self::log_key(log_id.index))
            .map_err(|e| StorageIOError::write_logs(AnyError::new(&e)).into())
    }
}
