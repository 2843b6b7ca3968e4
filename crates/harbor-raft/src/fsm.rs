//! Catalog state machine.
//!
//! Applies committed log entries to the [`StateStore`]. Each entry's log
//! index becomes the modify index of every row it touches, so replaying
//! the same log on any server yields byte-identical indexes.
//!
//! Snapshots are two-phase: `get_snapshot_builder` opens a redb read
//! transaction immediately, and `build_snapshot` serializes it later. The
//! read transaction pins the pre-snapshot view, so applies keep running
//! while the dump is written and never leak into it.

use std::io::Cursor;

use harbor_state::{
    KvsOp, KvsRequest, SessionOp, StateError, StateResult, StateSnapshot, StateStore, StoreDump,
};
use openraft::storage::{RaftSnapshotBuilder, RaftStateMachine};
use openraft::{
    BasicNode, Entry, EntryPayload, ErrorSubject, ErrorVerb, LogId, Snapshot, SnapshotMeta,
    StorageError, StoredMembership,
};
use tracing::{debug, info, warn};

use crate::command::{Command, CommandResponse, TypeConfig};

const APPLIED_KEY: &str = "raft_last_applied";
const MEMBERSHIP_KEY: &str = "raft_membership";

fn read_err(e: impl std::fmt::Display) -> StorageError<u64> {
    StorageError::from_io_error(
        ErrorSubject::StateMachine,
        ErrorVerb::Read,
        std::io::Error::other(e.to_string()),
    )
}

fn write_err(e: impl std::fmt::Display) -> StorageError<u64> {
    StorageError::from_io_error(
        ErrorSubject::StateMachine,
        ErrorVerb::Write,
        std::io::Error::other(e.to_string()),
    )
}

/// Raft state machine over the catalog store.
pub struct CatalogFsm {
    store: StateStore,
}

/// Snapshot builder holding a read view captured at builder creation.
pub struct FsmSnapshotBuilder {
    captured: Result<Captured, String>,
}

struct Captured {
    view: StateSnapshot,
    last_applied: Option<LogId<u64>>,
    membership: StoredMembership<u64, BasicNode>,
}

impl CatalogFsm {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// The store this FSM writes into. RPC reads go straight to it.
    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Apply one command at `index`.
    ///
    /// Catalog rule violations come back as [`CommandResponse::Error`];
    /// only storage failures are returned as `Err`.
    pub fn apply_command(&self, index: u64, cmd: &Command) -> StateResult<CommandResponse> {
        let result = match cmd {
            Command::Register(req) => self
                .store
                .ensure_registration(index, req)
                .map(|()| CommandResponse::Ok),
            Command::Deregister(req) => self
                .store
                .deregister(index, req)
                .map(|()| CommandResponse::Ok),
            Command::Kvs(req) => self.apply_kvs(index, req),
            Command::Txn(req) => self
                .store
                .kvs_atomic(index, &req.ops)
                .map(CommandResponse::Txn),
            Command::Session(req) => match req.op {
                SessionOp::Create => self
                    .store
                    .session_create(index, &req.session)
                    .map(|()| CommandResponse::SessionId(req.session.id.clone())),
                SessionOp::Destroy => self
                    .store
                    .session_destroy(index, &req.session.id)
                    .map(|()| CommandResponse::Ok),
            },
            Command::CoordinateBatchUpdate(updates) => self
                .store
                .coordinate_batch_update(index, updates)
                .map(|()| CommandResponse::Ok),
        };

        match result {
            Ok(resp) => {
                debug!(index, kind = cmd.kind(), "applied command");
                Ok(resp)
            }
            Err(StateError::Invalid(msg)) => {
                warn!(index, kind = cmd.kind(), error = %msg, "command rejected by catalog");
                Ok(CommandResponse::Error(msg))
            }
            Err(e) => Err(e),
        }
    }

    fn apply_kvs(&self, index: u64, req: &KvsRequest) -> StateResult<CommandResponse> {
        let ent = &req.dir_ent;
        let ok = match req.op {
            KvsOp::Set => {
                self.store.kvs_set(index, ent)?;
                true
            }
            KvsOp::Delete => {
                self.store.kvs_delete(index, &ent.key)?;
                true
            }
            KvsOp::DeleteCas => self.store.kvs_delete_cas(index, ent.modify_index, &ent.key)?,
            KvsOp::DeleteTree => {
                self.store.kvs_delete_tree(index, &ent.key)?;
                true
            }
            KvsOp::Cas => self.store.kvs_cas(index, ent)?,
            KvsOp::Lock => self.store.kvs_lock(index, ent)?,
            KvsOp::Unlock => self.store.kvs_unlock(index, ent)?,
        };
        Ok(CommandResponse::Bool(ok))
    }

    fn get_applied(&self) -> Result<Option<LogId<u64>>, StorageError<u64>> {
        match self.store.get_meta(APPLIED_KEY).map_err(read_err)? {
            Some(data) => Ok(Some(serde_json::from_slice(&data).map_err(read_err)?)),
            None => Ok(None),
        }
    }

    fn get_membership(&self) -> Result<StoredMembership<u64, BasicNode>, StorageError<u64>> {
        match self.store.get_meta(MEMBERSHIP_KEY).map_err(read_err)? {
            Some(data) => Ok(serde_json::from_slice(&data).map_err(read_err)?),
            None => Ok(StoredMembership::default()),
        }
    }

    fn save_meta<T: serde::Serialize>(&self, key: &str, value: &T) -> Result<(), StorageError<u64>> {
        let data = serde_json::to_vec(value).map_err(write_err)?;
        self.store.put_meta(key, &data).map_err(write_err)
    }

    fn capture(&self) -> Result<Captured, String> {
        let view = self.store.snapshot().map_err(|e| e.to_string())?;
        let last_applied = self.get_applied().map_err(|e| e.to_string())?;
        let membership = self.get_membership().map_err(|e| e.to_string())?;
        Ok(Captured {
            view,
            last_applied,
            membership,
        })
    }
}

impl RaftStateMachine<TypeConfig> for CatalogFsm {
    type SnapshotBuilder = FsmSnapshotBuilder;

    async fn applied_state(
        &mut self,
    ) -> Result<(Option<LogId<u64>>, StoredMembership<u64, BasicNode>), StorageError<u64>> {
        let applied = self.get_applied()?;
        let membership = self.get_membership()?;
        Ok((applied, membership))
    }

    async fn apply<I>(&mut self, entries: I) -> Result<Vec<CommandResponse>, StorageError<u64>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + Send,
        I::IntoIter: Send,
    {
        let mut responses = Vec::new();

        for entry in entries {
            let log_id = entry.log_id;

            match entry.payload {
                EntryPayload::Blank => {
                    self.save_meta(APPLIED_KEY, &log_id)?;
                    responses.push(CommandResponse::Ok);
                }
                EntryPayload::Normal(cmd) => {
                    // The applied id commits together with the catalog rows.
                    let applied = serde_json::to_vec(&log_id).map_err(write_err)?;
                    let resp = self
                        .store
                        .with_meta(APPLIED_KEY, &applied, || {
                            self.apply_command(log_id.index, &cmd)
                        })
                        .map_err(write_err)?;
                    responses.push(resp);
                }
                EntryPayload::Membership(membership) => {
                    let stored = StoredMembership::new(Some(log_id), membership);
                    self.save_meta(MEMBERSHIP_KEY, &stored)?;
                    self.save_meta(APPLIED_KEY, &log_id)?;
                    responses.push(CommandResponse::Ok);
                }
            }
        }

        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        FsmSnapshotBuilder {
            captured: self.capture(),
        }
    }

    async fn begin_receiving_snapshot(&mut self) -> Result<Box<Cursor<Vec<u8>>>, StorageError<u64>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<u64, BasicNode>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<u64>> {
        let data = snapshot.into_inner();
        let dump: StoreDump = serde_json::from_slice(&data).map_err(read_err)?;

        self.store.restore(&dump).map_err(write_err)?;
        self.save_meta(APPLIED_KEY, &meta.last_log_id)?;
        self.save_meta(MEMBERSHIP_KEY, &meta.last_membership)?;

        info!(snapshot_id = %meta.snapshot_id, "installed snapshot");
        Ok(())
    }

    async fn get_current_snapshot(&mut self) -> Result<Option<Snapshot<TypeConfig>>, StorageError<u64>> {
        if self.get_applied()?.is_none() {
            return Ok(None);
        }
        let mut builder = self.get_snapshot_builder().await;
        let snapshot = builder.build_snapshot().await?;
        Ok(Some(snapshot))
    }
}

impl RaftSnapshotBuilder<TypeConfig> for FsmSnapshotBuilder {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<u64>> {
        let captured = self.captured.as_ref().map_err(read_err)?;
        let dump = captured.view.dump().map_err(read_err)?;
        let data = serde_json::to_vec(&dump).map_err(read_err)?;

        let snapshot_id = format!("snap-{}", captured.last_applied.map_or(0, |l| l.index));
        debug!(%snapshot_id, bytes = data.len(), "built snapshot");

        let meta = SnapshotMeta {
            last_log_id: captured.last_applied,
            last_membership: captured.membership.clone(),
            snapshot_id,
        };

        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harbor_state::{
        DirEntry, KvsAtomicOp, KvsAtomicRequest, KvsAtomicVerb, NodeService, RegisterRequest,
        Session, SessionRequest,
    };
    use openraft::CommittedLeaderId;

    fn fsm() -> CatalogFsm {
        CatalogFsm::new(StateStore::open_in_memory().unwrap())
    }

    fn entry(index: u64, cmd: Command) -> Entry<TypeConfig> {
        Entry::<TypeConfig> {
            log_id: LogId::new(CommittedLeaderId::new(1, 1), index),
            payload: EntryPayload::Normal(cmd),
        }
    }

    fn register(node: &str, service: &str, tag: &str) -> Command {
        Command::Register(RegisterRequest {
            datacenter: "dc1".to_string(),
            node: node.to_string(),
            address: "127.0.0.1".to_string(),
            service: Some(NodeService {
                service: service.to_string(),
                tag: Some(tag.to_string()),
                port: 8000,
                ..Default::default()
            }),
            check: None,
        })
    }

    fn kv(op: KvsOp, key: &str, value: &str) -> Command {
        Command::Kvs(KvsRequest {
            datacenter: "dc1".to_string(),
            op,
            dir_ent: DirEntry {
                key: key.to_string(),
                value: value.as_bytes().to_vec(),
                ..Default::default()
            },
        })
    }

    #[tokio::test]
    async fn empty_state_machine() {
        let mut sm = fsm();
        let (applied, _membership) = sm.applied_state().await.unwrap();
        assert!(applied.is_none());
        assert!(sm.get_current_snapshot().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn apply_register_uses_log_index() {
        let mut sm = fsm();
        let responses = sm.apply([entry(7, register("foo", "db", "master"))]).await.unwrap();
        assert_eq!(responses, vec![CommandResponse::Ok]);

        let services = sm.store().node_services("foo").unwrap().unwrap();
        assert_eq!(services.services["db"].tag.as_deref(), Some("master"));
        assert_eq!(sm.store().index(harbor_state::Table::Services).unwrap(), 7);

        let (applied, _) = sm.applied_state().await.unwrap();
        assert_eq!(applied.map(|l| l.index), Some(7));
    }

    #[tokio::test]
    async fn applied_id_lands_with_the_write() {
        let mut sm = fsm();
        let store = sm.store().clone();
        let applied = serde_json::to_vec(&LogId::new(CommittedLeaderId::new(1, 1), 3u64)).unwrap();
        store
            .with_meta(APPLIED_KEY, &applied, || {
                store.kvs_set(
                    3,
                    &DirEntry {
                        key: "k".to_string(),
                        ..Default::default()
                    },
                )?;
                // Visible before with_meta gets a chance to write it itself.
                assert_eq!(store.get_meta(APPLIED_KEY)?, Some(applied.clone()));
                Ok(())
            })
            .unwrap();

        // A rejected command commits no rows but still advances the id.
        let lock = Command::Kvs(KvsRequest {
            datacenter: "dc1".to_string(),
            op: KvsOp::Lock,
            dir_ent: DirEntry {
                key: "lock".to_string(),
                session: Some("no-such-session".to_string()),
                ..Default::default()
            },
        });
        sm.apply([entry(4, lock)]).await.unwrap();
        let (applied, _) = sm.applied_state().await.unwrap();
        assert_eq!(applied.map(|l| l.index), Some(4));
        assert!(sm.store().kvs_get("k").unwrap().is_some());
    }

    #[tokio::test]
    async fn catalog_errors_become_error_responses() {
        let mut sm = fsm();
        let lock = Command::Kvs(KvsRequest {
            datacenter: "dc1".to_string(),
            op: KvsOp::Lock,
            dir_ent: DirEntry {
                key: "lock".to_string(),
                session: Some("no-such-session".to_string()),
                ..Default::default()
            },
        });
        let responses = sm.apply([entry(1, lock)]).await.unwrap();
        assert!(matches!(responses[0], CommandResponse::Error(_)));
        assert!(sm.store().kvs_get("lock").unwrap().is_none());
    }

    #[tokio::test]
    async fn kvs_ops_answer_with_bools() {
        let sm = fsm();
        assert_eq!(
            sm.apply_command(1, &kv(KvsOp::Set, "a", "1")).unwrap(),
            CommandResponse::Bool(true)
        );

        let mut cas = DirEntry {
            key: "a".to_string(),
            value: b"2".to_vec(),
            modify_index: 99,
            ..Default::default()
        };
        let stale = Command::Kvs(KvsRequest {
            datacenter: "dc1".to_string(),
            op: KvsOp::Cas,
            dir_ent: cas.clone(),
        });
        assert_eq!(sm.apply_command(2, &stale).unwrap(), CommandResponse::Bool(false));

        cas.modify_index = 1;
        let fresh = Command::Kvs(KvsRequest {
            datacenter: "dc1".to_string(),
            op: KvsOp::Cas,
            dir_ent: cas,
        });
        assert_eq!(sm.apply_command(3, &fresh).unwrap(), CommandResponse::Bool(true));
        assert_eq!(sm.store().kvs_get("a").unwrap().unwrap().value, b"2".to_vec());
    }

    #[tokio::test]
    async fn session_create_returns_id() {
        let sm = fsm();
        sm.apply_command(1, &register("foo", "db", "master")).unwrap();
        let create = Command::Session(SessionRequest {
            datacenter: "dc1".to_string(),
            op: SessionOp::Create,
            session: Session {
                id: "s1".to_string(),
                node: "foo".to_string(),
                name: String::new(),
                lock_delay: harbor_state::DEFAULT_LOCK_DELAY,
                create_index: 0,
            },
        });
        assert_eq!(
            sm.apply_command(2, &create).unwrap(),
            CommandResponse::SessionId("s1".to_string())
        );
        assert!(sm.store().session_get("s1").unwrap().is_some());
    }

    #[tokio::test]
    async fn failed_txn_applies_nothing() {
        let sm = fsm();
        let txn = Command::Txn(KvsAtomicRequest {
            datacenter: "dc1".to_string(),
            ops: vec![
                KvsAtomicOp {
                    verb: KvsAtomicVerb::Set,
                    dir_ent: DirEntry {
                        key: "ok".to_string(),
                        value: b"v".to_vec(),
                        ..Default::default()
                    },
                },
                KvsAtomicOp {
                    verb: KvsAtomicVerb::Lock,
                    dir_ent: DirEntry {
                        key: "bad".to_string(),
                        session: Some("missing".to_string()),
                        ..Default::default()
                    },
                },
            ],
        });
        let CommandResponse::Txn(resp) = sm.apply_command(1, &txn).unwrap() else {
            panic!("expected txn response");
        };
        assert_eq!(resp.errors.len(), 1);
        assert_eq!(resp.errors[0].op_index, 1);
        assert!(resp.results.is_empty());
        assert!(sm.store().kvs_get("ok").unwrap().is_none());
    }

    #[tokio::test]
    async fn snapshot_ignores_writes_after_capture() {
        let mut sm = fsm();
        sm.apply([entry(1, register("foo", "db", "master"))]).await.unwrap();

        let mut builder = sm.get_snapshot_builder().await;
        sm.apply([entry(2, register("bar", "db", "slave"))]).await.unwrap();

        let snapshot = builder.build_snapshot().await.unwrap();
        assert_eq!(snapshot.meta.snapshot_id, "snap-1");

        let dump: StoreDump = serde_json::from_slice(snapshot.snapshot.get_ref()).unwrap();
        let names: Vec<_> = dump.nodes.iter().map(|n| n.node.as_str()).collect();
        assert_eq!(names, vec!["foo"]);
    }

    #[tokio::test]
    async fn install_snapshot_replaces_contents() {
        let mut source = fsm();
        source.apply([entry(1, register("foo", "db", "master"))]).await.unwrap();
        source.apply([entry(2, kv(KvsOp::Set, "cfg", "x"))]).await.unwrap();
        let snapshot = source.get_current_snapshot().await.unwrap().unwrap();

        let mut target = fsm();
        target.apply([entry(1, register("stale", "web", "v1"))]).await.unwrap();
        target
            .install_snapshot(&snapshot.meta, snapshot.snapshot)
            .await
            .unwrap();

        let nodes = target.store().nodes().unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].node, "foo");
        assert_eq!(target.store().kvs_get("cfg").unwrap().unwrap().value, b"x".to_vec());

        let (applied, _) = target.applied_state().await.unwrap();
        assert_eq!(applied.map(|l| l.index), Some(2));
    }
}
