//! `KVS.*` and `Txn.Apply`.
//!
//! Both write paths run the same pre-apply check per operation: a key is
//! required (except for tree deletes), and a lock may not be taken while
//! the key is inside a lock delay. For `KVS.Apply` a lock delay is a plain
//! `false`; inside a transaction it is an error that stops the whole
//! transaction from reaching the log.

use harbor_raft::{Command, CommandResponse};
use harbor_state::{
    IndexedDirEntries, IndexedKeyList, KeyListRequest, KeyRequest, KvsAtomicError,
    KvsAtomicRequest, KvsAtomicResponse, KvsAtomicVerb, KvsOp, KvsRequest, Table,
};
use tracing::{debug, warn};

use crate::error::{RpcError, RpcResult};
use crate::server::RpcServer;

/// Outcome of the pre-apply check on one operation.
enum PreApply {
    Ok,
    /// Key is inside a lock delay.
    Delayed,
}

impl RpcServer {
    fn kvs_pre_apply(&self, key: &str, locking: bool, tree: bool) -> RpcResult<PreApply> {
        if key.is_empty() && !tree {
            return Err(RpcError::Validation("must provide key".into()));
        }
        if locking {
            if let Some(until) = self.store.kvs_lock_delay(key) {
                debug!(%key, ?until, "lock refused, key is in lock delay");
                return Ok(PreApply::Delayed);
            }
        }
        Ok(PreApply::Ok)
    }

    pub async fn kvs_apply(&self, req: KvsRequest) -> RpcResult<bool> {
        if let Some(done) = self.forward("KVS.Apply", &req.datacenter, None, &req).await? {
            return Ok(done);
        }
        let pre = self.kvs_pre_apply(
            &req.dir_ent.key,
            req.op == KvsOp::Lock,
            req.op == KvsOp::DeleteTree,
        )?;
        if let PreApply::Delayed = pre {
            return Ok(false);
        }

        match self.raft_apply(Command::Kvs(req)).await? {
            CommandResponse::Bool(ok) => Ok(ok),
            other => Err(RpcError::Apply(format!("unexpected kv response {other:?}"))),
        }
    }

    pub async fn kvs_get(&self, req: KeyRequest) -> RpcResult<IndexedDirEntries> {
        if let Some(reply) = self
            .forward("KVS.Get", &req.datacenter, Some(&req.options), &req)
            .await?
        {
            return Ok(reply);
        }
        let (entries, meta) = self
            .blocking_query(&req.options, &[Table::Kvs], |snap| {
                Ok(snap.kvs_get(&req.key)?.into_iter().collect())
            })
            .await?;
        Ok(IndexedDirEntries { entries, meta })
    }

    pub async fn kvs_list(&self, req: KeyListRequest) -> RpcResult<IndexedDirEntries> {
        if let Some(reply) = self
            .forward("KVS.List", &req.datacenter, Some(&req.options), &req)
            .await?
        {
            return Ok(reply);
        }
        let (entries, meta) = self
            .blocking_query(&req.options, &[Table::Kvs], |snap| snap.kvs_list(&req.prefix))
            .await?;
        Ok(IndexedDirEntries { entries, meta })
    }

    pub async fn kvs_list_keys(&self, req: KeyListRequest) -> RpcResult<IndexedKeyList> {
        if let Some(reply) = self
            .forward("KVS.ListKeys", &req.datacenter, Some(&req.options), &req)
            .await?
        {
            return Ok(reply);
        }
        let (keys, meta) = self
            .blocking_query(&req.options, &[Table::Kvs], |snap| {
                snap.kvs_list_keys(&req.prefix, req.separator.as_deref())
            })
            .await?;
        Ok(IndexedKeyList { keys, meta })
    }

    /// Apply a KV transaction. Every operation is checked first; if any
    /// check fails the errors are returned and nothing is committed.
    pub async fn txn_apply(&self, req: KvsAtomicRequest) -> RpcResult<KvsAtomicResponse> {
        if let Some(reply) = self.forward("Txn.Apply", &req.datacenter, None, &req).await? {
            return Ok(reply);
        }

        let mut errors = Vec::new();
        for (op_index, op) in req.ops.iter().enumerate() {
            let key = &op.dir_ent.key;
            let locking = op.verb == KvsAtomicVerb::Lock;
            let tree = matches!(op.verb, KvsAtomicVerb::DeleteTree | KvsAtomicVerb::GetTree);
            match self.kvs_pre_apply(key, locking, tree) {
                Ok(PreApply::Ok) => {}
                Ok(PreApply::Delayed) => errors.push(KvsAtomicError {
                    op_index,
                    what: format!("failed to lock key {key:?} due to lock delay"),
                }),
                Err(e) => errors.push(KvsAtomicError {
                    op_index,
                    what: e.to_string(),
                }),
            }
        }
        if !errors.is_empty() {
            warn!(failed = errors.len(), ops = req.ops.len(), "transaction rejected before apply");
            return Ok(KvsAtomicResponse {
                results: Vec::new(),
                errors,
            });
        }

        match self.raft_apply(Command::Txn(req)).await? {
            CommandResponse::Txn(resp) => Ok(resp),
            other => Err(RpcError::Apply(format!("unexpected transaction response {other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{register_node, test_server};
    use harbor_state::{DirEntry, KvsAtomicOp, Session, SessionOp, SessionRequest};
    use std::time::Duration;

    fn entry(key: &str, value: &str) -> DirEntry {
        DirEntry {
            key: key.into(),
            value: value.as_bytes().to_vec(),
            ..Default::default()
        }
    }

    fn kv(op: KvsOp, dir_ent: DirEntry) -> KvsRequest {
        KvsRequest {
            datacenter: "dc1".into(),
            op,
            dir_ent,
        }
    }

    fn key(key: &str) -> KeyRequest {
        KeyRequest {
            datacenter: "dc1".into(),
            key: key.into(),
            ..Default::default()
        }
    }

    async fn session(server: &RpcServer, node: &str, lock_delay: Duration) -> String {
        register_node(server, node, "127.0.0.1").await;
        server
            .session_apply(SessionRequest {
                datacenter: "dc1".into(),
                op: SessionOp::Create,
                session: Session {
                    id: String::new(),
                    node: node.into(),
                    name: String::new(),
                    lock_delay,
                    create_index: 0,
                },
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn set_get_list() {
        let server = test_server();
        assert!(server.kvs_apply(kv(KvsOp::Set, entry("web/a", "1"))).await.unwrap());
        assert!(server.kvs_apply(kv(KvsOp::Set, entry("web/sub/b", "2"))).await.unwrap());

        let got = server.kvs_get(key("web/a")).await.unwrap();
        assert_eq!(got.entries.len(), 1);
        assert_eq!(got.entries[0].value, b"1");
        assert!(server.kvs_get(key("missing")).await.unwrap().entries.is_empty());

        let list = server
            .kvs_list(KeyListRequest {
                datacenter: "dc1".into(),
                prefix: "web/".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(list.entries.len(), 2);

        let keys = server
            .kvs_list_keys(KeyListRequest {
                datacenter: "dc1".into(),
                prefix: "web/".into(),
                separator: Some("/".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(keys.keys, vec!["web/a", "web/sub/"]);
    }

    #[tokio::test]
    async fn empty_key_is_rejected() {
        let server = test_server();
        let err = server.kvs_apply(kv(KvsOp::Set, entry("", "x"))).await.unwrap_err();
        assert!(matches!(err, RpcError::Validation(_)));
        // Tree deletes may target the root.
        assert!(server.kvs_apply(kv(KvsOp::DeleteTree, entry("", ""))).await.unwrap());
    }

    #[tokio::test]
    async fn cas_reports_false_on_stale_index() {
        let server = test_server();
        let mut ent = entry("k", "v");
        assert!(server.kvs_apply(kv(KvsOp::Cas, ent.clone())).await.unwrap());
        // Index 0 means create-only; the key exists now.
        assert!(!server.kvs_apply(kv(KvsOp::Cas, ent.clone())).await.unwrap());

        ent.modify_index = server.kvs_get(key("k")).await.unwrap().entries[0].modify_index;
        assert!(server.kvs_apply(kv(KvsOp::Cas, ent)).await.unwrap());
    }

    #[tokio::test]
    async fn lock_delay_refuses_lock() {
        let server = test_server();
        let first = session(&server, "foo", Duration::from_secs(60)).await;

        let mut ent = entry("leader", "me");
        ent.session = Some(first.clone());
        assert!(server.kvs_apply(kv(KvsOp::Lock, ent.clone())).await.unwrap());

        server
            .session_apply(SessionRequest {
                datacenter: "dc1".into(),
                op: SessionOp::Destroy,
                session: Session {
                    id: first,
                    node: "foo".into(),
                    name: String::new(),
                    lock_delay: Duration::ZERO,
                    create_index: 0,
                },
            })
            .await
            .unwrap();

        let second = session(&server, "foo", Duration::from_secs(60)).await;
        ent.session = Some(second);
        assert!(!server.kvs_apply(kv(KvsOp::Lock, ent.clone())).await.unwrap());

        let resp = server
            .txn_apply(KvsAtomicRequest {
                datacenter: "dc1".into(),
                ops: vec![
                    KvsAtomicOp { verb: KvsAtomicVerb::Set, dir_ent: entry("other", "x") },
                    KvsAtomicOp { verb: KvsAtomicVerb::Lock, dir_ent: ent },
                ],
            })
            .await
            .unwrap();
        assert_eq!(resp.errors.len(), 1);
        assert_eq!(resp.errors[0].op_index, 1);
        assert!(resp.errors[0].what.contains("lock delay"));
        // The valid op was not applied either.
        assert!(server.kvs_get(key("other")).await.unwrap().entries.is_empty());
    }

    #[tokio::test]
    async fn txn_with_bad_session_applies_nothing() {
        let server = test_server();
        let mut lock = entry("a", "1");
        lock.session = Some("no-such-session".into());
        let resp = server
            .txn_apply(KvsAtomicRequest {
                datacenter: "dc1".into(),
                ops: vec![
                    KvsAtomicOp { verb: KvsAtomicVerb::Set, dir_ent: entry("b", "2") },
                    KvsAtomicOp { verb: KvsAtomicVerb::Lock, dir_ent: lock },
                ],
            })
            .await
            .unwrap();
        assert!(!resp.errors.is_empty());
        assert!(resp.results.is_empty());
        assert!(server.kvs_get(key("b")).await.unwrap().entries.is_empty());
    }

    #[tokio::test]
    async fn txn_reports_every_invalid_op() {
        let server = test_server();
        let resp = server
            .txn_apply(KvsAtomicRequest {
                datacenter: "dc1".into(),
                ops: vec![
                    KvsAtomicOp { verb: KvsAtomicVerb::Set, dir_ent: entry("", "x") },
                    KvsAtomicOp { verb: KvsAtomicVerb::Set, dir_ent: entry("ok", "y") },
                    KvsAtomicOp { verb: KvsAtomicVerb::Delete, dir_ent: entry("", "") },
                ],
            })
            .await
            .unwrap();
        let failed: Vec<_> = resp.errors.iter().map(|e| e.op_index).collect();
        assert_eq!(failed, vec![0, 2]);
        assert!(server.kvs_get(key("ok")).await.unwrap().entries.is_empty());
    }

    #[tokio::test]
    async fn txn_success_returns_results() {
        let server = test_server();
        let resp = server
            .txn_apply(KvsAtomicRequest {
                datacenter: "dc1".into(),
                ops: vec![
                    KvsAtomicOp { verb: KvsAtomicVerb::Set, dir_ent: entry("x", "1") },
                    KvsAtomicOp { verb: KvsAtomicVerb::Get, dir_ent: entry("x", "") },
                ],
            })
            .await
            .unwrap();
        assert!(resp.errors.is_empty());
        assert!(!resp.results.is_empty());
        assert_eq!(server.kvs_get(key("x")).await.unwrap().entries[0].value, b"1");
    }
}
