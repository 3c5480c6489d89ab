//! Raft state machine holding the replicated counter.

use std::collections::VecDeque;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyerror::AnyError;
use openraft::storage::{RaftStateMachine, Snapshot};
use openraft::{EntryPayload, OptionalSend, StorageError, StorageIOError};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};

use crate::error::RaftError;
use crate::storage::backup;
use crate::storage::snapshot::{self, CounterSnapshotBuilder, SnapshotData};
use crate::types::{
    Command, CounterResponse, LogEntry, LogId, NodeId, SnapshotMeta, StoredMembership, TypeConfig,
};

const SM_STATE_TREE: &str = "tally_sm_state";
const KEY_STATE: &[u8] = b"state";

/// How many applied request ids are remembered for deduplication.
pub const DEDUP_WINDOW: usize = 1024;

/// Everything the state machine owns, guarded by a single lock.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct CounterState {
    pub counter: u64,
    pub last_applied: Option<LogId>,
    pub membership: StoredMembership,
    #[serde(default)]
    pub recent: VecDeque<(String, u64)>,
}

impl CounterState {
    fn apply_command(&mut self, command: &Command) -> CounterResponse {
        if !command.is_increment() {
            tracing::warn!(op = %command.op, "ignoring unknown command op");
            return CounterResponse::none();
        }

        if let Some(id) = &command.request_id {
            if let Some((_, value)) = self.recent.iter().find(|(seen, _)| seen == id) {
                tracing::debug!(request_id = %id, value, "duplicate increment");
                return CounterResponse::replayed(*value);
            }
        }

        let Some(next) = self.counter.checked_add(1) else {
            tracing::warn!(counter = self.counter, "counter saturated; increment ignored");
            return CounterResponse::none();
        };
        self.counter = next;
        if let Some(id) = &command.request_id {
            self.recent.push_back((id.clone(), self.counter));
            while self.recent.len() > DEDUP_WINDOW {
                self.recent.pop_front();
            }
        }
        CounterResponse::value(self.counter)
    }
}

/// Counter state shared by the state machine, its snapshot builders and
/// the admin handle.
pub(crate) struct SharedCounter {
    state: Mutex<CounterState>,
    tree: Tree,
}

impl SharedCounter {
    pub(crate) fn lock(&self) -> MutexGuard<'_, CounterState> {
        self.state.lock()
    }

    fn persist(&self, state: &CounterState) -> Result<(), RaftError> {
        self.tree.insert(KEY_STATE, serde_json::to_vec(state)?)?;
        self.tree.flush()?;
        Ok(())
    }
}

/// Raft state machine applying `increment` commands to a single counter.
pub struct CounterStateMachine {
    shared: Arc<SharedCounter>,
    snapshot_dir: PathBuf,
}

impl CounterStateMachine {
    /// Open the state machine, recovering any state persisted in `db`.
    pub fn open(db: &Db, snapshot_dir: PathBuf) -> Result<Self, RaftError> {
        let tree = db.open_tree(SM_STATE_TREE)?;
        let state = match tree.get(KEY_STATE)? {
            Some(bytes) => serde_json::from_slice(&bytes)?,
            None => CounterState::default(),
        };

        std::fs::create_dir_all(&snapshot_dir).map_err(|e| RaftError::Storage(e.to_string()))?;

        Ok(Self {
            shared: Arc::new(SharedCounter {
                state: Mutex::new(state),
                tree,
            }),
            snapshot_dir,
        })
    }

    /// Handle used by the admin surface to read, back up and restore.
    pub fn handle(&self) -> CounterHandle {
        CounterHandle {
            shared: self.shared.clone(),
        }
    }
}

impl RaftStateMachine<TypeConfig> for CounterStateMachine {
    type SnapshotBuilder = CounterSnapshotBuilder;

    async fn applied_state(
        &mut self,
    ) -> Result<(Option<LogId>, StoredMembership), StorageError<NodeId>> {
        let state = self.shared.lock();
        Ok((state.last_applied, state.membership.clone()))
    }

    async fn apply<I>(&mut self, entries: I) -> Result<Vec<CounterResponse>, StorageError<NodeId>>
    where
        I: IntoIterator<Item = LogEntry> + OptionalSend,
        I::IntoIter: OptionalSend,
    {
        let mut responses = Vec::new();
        let mut state = self.shared.lock();

        for entry in entries {
            state.last_applied = Some(entry.log_id);

            let response = match entry.payload {
                EntryPayload::Blank => CounterResponse::none(),
                EntryPayload::Normal(command) => state.apply_command(&command),
                EntryPayload::Membership(membership) => {
                    state.membership = StoredMembership::new(Some(entry.log_id), membership);
                    CounterResponse::none()
                }
            };
            responses.push(response);
        }

        self.shared
            .persist(&state)
            .map_err(|e| StorageIOError::write_state_machine(AnyError::new(&e)))?;

        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        CounterSnapshotBuilder::new(self.shared.clone(), self.snapshot_dir.clone())
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, StorageError<NodeId>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<NodeId>> {
        let bytes = snapshot.into_inner();
        let data = SnapshotData::decode(&bytes).map_err(|e| {
            StorageIOError::read_snapshot(Some(meta.signature()), AnyError::new(&e))
        })?;

        tracing::info!(
            snapshot_id = %meta.snapshot_id,
            counter = data.counter,
            "installing snapshot"
        );

        {
            let mut state = self.shared.lock();
            state.counter = data.counter;
            state.recent = data.recent;
            state.last_applied = meta.last_log_id;
            state.membership = meta.last_membership.clone();
            self.shared
                .persist(&state)
                .map_err(|e| StorageIOError::write_state_machine(AnyError::new(&e)))?;
        }

        snapshot::save_snapshot(&self.snapshot_dir, meta, &bytes).map_err(|e| {
            StorageIOError::write_snapshot(Some(meta.signature()), AnyError::new(&e))
        })?;

        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<NodeId>> {
        let loaded = snapshot::load_snapshot(&self.snapshot_dir)
            .map_err(|e| StorageIOError::read_snapshot(None, AnyError::new(&e)))?;

        Ok(loaded.map(|(meta, data)| Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        }))
    }
}

/// Cloneable handle to the counter for reads and manual backup/restore.
///
/// Every operation takes the same lock the state machine applies under.
#[derive(Clone)]
pub struct CounterHandle {
    shared: Arc<SharedCounter>,
}

impl CounterHandle {
    /// Current counter value.
    pub fn value(&self) -> u64 {
        self.shared.lock().counter
    }

    /// Write the counter to the backup file at `path`.
    pub fn backup(&self, path: &Path) -> Result<u64, RaftError> {
        let state = self.shared.lock();
        backup::write_backup(path, state.counter)?;
        tracing::info!(counter = state.counter, path = %path.display(), "counter backed up");
        Ok(state.counter)
    }

    /// Replace the counter with the value stored in the backup file.
    ///
    /// Leaves the log position untouched; the next engine snapshot captures
    /// the restored value.
    pub fn restore(&self, path: &Path) -> Result<u64, RaftError> {
        let mut state = self.shared.lock();
        let value = backup::read_backup(path)?;
        state.counter = value;
        self.shared.persist(&state)?;
        tracing::info!(counter = value, path = %path.display(), "counter restored from backup");
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Membership;
    use openraft::storage::RaftSnapshotBuilder;
    use openraft::CommittedLeaderId;
    use std::collections::BTreeSet;

    fn log_id(index: u64) -> LogId {
        LogId::new(CommittedLeaderId::new(1, 1), index)
    }

    fn normal(index: u64, command: Command) -> LogEntry {
        LogEntry {
            log_id: log_id(index),
            payload: EntryPayload::Normal(command),
        }
    }

    fn open_sm(db: &Db) -> (CounterStateMachine, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let sm = CounterStateMachine::open(db, dir.path().join("snapshots")).unwrap();
        (sm, dir)
    }

    fn temp_db() -> Db {
        sled::Config::new().temporary(true).open().unwrap()
    }

    #[tokio::test]
    async fn test_apply_increments() {
        let db = temp_db();
        let (mut sm, _dir) = open_sm(&db);

        let responses = sm
            .apply(vec![
                normal(1, Command::increment()),
                normal(2, Command::increment()),
            ])
            .await
            .unwrap();

        assert_eq!(responses[0].value, Some(1));
        assert_eq!(responses[1].value, Some(2));
        assert_eq!(sm.handle().value(), 2);

        let (last_applied, _) = sm.applied_state().await.unwrap();
        assert_eq!(last_applied, Some(log_id(2)));
    }

    #[tokio::test]
    async fn test_unknown_op_is_ignored() {
        let db = temp_db();
        let (mut sm, _dir) = open_sm(&db);

        let responses = sm
            .apply(vec![normal(1, Command::new("reset"))])
            .await
            .unwrap();

        assert_eq!(responses[0], CounterResponse::none());
        assert_eq!(sm.handle().value(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_request_id() {
        let db = temp_db();
        let (mut sm, _dir) = open_sm(&db);
        let cmd = Command::increment().with_request_id(Some("abc".into()));

        let first = sm.apply(vec![normal(1, cmd.clone())]).await.unwrap();
        let second = sm.apply(vec![normal(2, cmd)]).await.unwrap();

        assert_eq!(first[0], CounterResponse::value(1));
        assert_eq!(second[0], CounterResponse::replayed(1));
        assert_eq!(sm.handle().value(), 1);
    }

    #[test]
    fn test_dedup_window_is_bounded() {
        let mut state = CounterState::default();
        for i in 0..(DEDUP_WINDOW + 10) {
            state.apply_command(&Command::increment().with_request_id(Some(i.to_string())));
        }
        assert_eq!(state.recent.len(), DEDUP_WINDOW);

        // The oldest id fell out of the window and counts again.
        let again = state.apply_command(&Command::increment().with_request_id(Some("0".into())));
        assert!(!again.deduplicated);
    }

    #[test]
    fn test_increment_at_max_is_ignored() {
        let mut state = CounterState {
            counter: u64::MAX,
            ..Default::default()
        };
        let response =
            state.apply_command(&Command::increment().with_request_id(Some("late".into())));

        assert_eq!(response, CounterResponse::none());
        assert_eq!(state.counter, u64::MAX);
        assert!(state.recent.is_empty());
    }

    #[tokio::test]
    async fn test_membership_entry() {
        let db = temp_db();
        let (mut sm, _dir) = open_sm(&db);

        let membership = Membership::new(vec![BTreeSet::from([1, 2])], None);
        let entry = LogEntry {
            log_id: log_id(1),
            payload: EntryPayload::Membership(membership.clone()),
        };
        sm.apply(vec![entry]).await.unwrap();

        let (_, stored) = sm.applied_state().await.unwrap();
        assert_eq!(*stored.membership(), membership);
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("raft.db");

        {
            let db = sled::open(&db_path).unwrap();
            let mut sm = CounterStateMachine::open(&db, dir.path().join("snapshots")).unwrap();
            sm.apply(vec![normal(1, Command::increment()), normal(2, Command::increment())])
                .await
                .unwrap();
            db.flush().unwrap();
        }

        let db = sled::open(&db_path).unwrap();
        let mut sm = CounterStateMachine::open(&db, dir.path().join("snapshots")).unwrap();
        assert_eq!(sm.handle().value(), 2);
        let (last_applied, _) = sm.applied_state().await.unwrap();
        assert_eq!(last_applied, Some(log_id(2)));
    }

    #[tokio::test]
    async fn test_snapshot_install_replaces_counter() {
        let db = temp_db();
        let (mut leader, _a) = open_sm(&db);
        leader
            .apply((1..=5).map(|i| normal(i, Command::increment())).collect::<Vec<_>>())
            .await
            .unwrap();

        let mut builder = leader.get_snapshot_builder().await;
        let snapshot = builder.build_snapshot().await.unwrap();
        assert_eq!(snapshot.meta.last_log_id, Some(log_id(5)));

        let other_db = temp_db();
        let (mut follower, _b) = open_sm(&other_db);
        follower
            .install_snapshot(&snapshot.meta, snapshot.snapshot)
            .await
            .unwrap();

        assert_eq!(follower.handle().value(), 5);
        let current = follower.get_current_snapshot().await.unwrap().unwrap();
        assert_eq!(current.meta.snapshot_id, snapshot.meta.snapshot_id);
    }

    #[tokio::test]
    async fn test_backup_and_snapshot_are_independent() {
        let db = temp_db();
        let (mut sm, dir) = open_sm(&db);
        let backup_path = dir.path().join("counter-backup.json");
        let handle = sm.handle();

        sm.apply(vec![normal(1, Command::increment()), normal(2, Command::increment())])
            .await
            .unwrap();
        assert_eq!(handle.backup(&backup_path).unwrap(), 2);

        let snapshot = sm
            .get_snapshot_builder()
            .await
            .build_snapshot()
            .await
            .unwrap();

        sm.apply(vec![normal(3, Command::increment())]).await.unwrap();
        assert_eq!(handle.value(), 3);

        // Manual restore does not touch the engine snapshot.
        assert_eq!(handle.restore(&backup_path).unwrap(), 2);
        assert_eq!(handle.value(), 2);
        let current = sm.get_current_snapshot().await.unwrap().unwrap();
        assert_eq!(current.meta.snapshot_id, snapshot.meta.snapshot_id);

        // Engine snapshot install does not touch the backup file.
        sm.install_snapshot(&snapshot.meta, Box::new(Cursor::new(
            SnapshotData::new(9, VecDeque::new()).encode().unwrap(),
        )))
        .await
        .unwrap();
        assert_eq!(handle.value(), 9);
        assert_eq!(backup::read_backup(&backup_path).unwrap(), 2);
    }

    #[tokio::test]
    async fn test_restore_without_backup() {
        let db = temp_db();
        let (sm, dir) = open_sm(&db);
        let err = sm
            .handle()
            .restore(&dir.path().join("missing.json"))
            .unwrap_err();
        assert!(matches!(err, RaftError::BackupNotFound(_)));
    }
}
