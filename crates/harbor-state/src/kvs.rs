//! KV entries, sessions and coordinates.
//!
//! Lock semantics: a key is locked while its `session` field is set. A
//! session may re-acquire its own lock (the lock index stays put); any other
//! session is refused until the holder unlocks or is destroyed. Destroying a
//! session releases every lock it holds and arms the lock delay on those
//! keys, which the RPC layer checks before submitting a new lock.

use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::requests::{KvsAtomicOp, KvsAtomicVerb};
use crate::store::{Mutation, StateStore};
use crate::tables::*;
use crate::types::{CoordinateEntry, DirEntry, Session};

impl Mutation<'_> {
    /// Upsert an entry. An existing lock holder is preserved.
    pub(crate) fn kvs_set(&mut self, ent: &DirEntry) -> StateResult<DirEntry> {
        let mut stored = ent.clone();
        match self.get::<DirEntry>(KVS, &ent.key)? {
            Some(existing) => {
                stored.create_index = existing.create_index;
                stored.session = existing.session;
                stored.lock_index = existing.lock_index;
            }
            None => {
                stored.create_index = self.index;
                stored.session = None;
                stored.lock_index = 0;
            }
        }
        stored.modify_index = self.index;
        self.put(KVS, &stored.key, &stored)?;
        self.touch(Table::Kvs);
        Ok(stored)
    }

    pub(crate) fn kvs_delete(&mut self, key: &str) -> StateResult<bool> {
        let existed = self.remove(KVS, key)?;
        if existed {
            self.touch(Table::Kvs);
        }
        Ok(existed)
    }

    /// Delete only if the entry exists and its modify index is `cas_index`.
    pub(crate) fn kvs_delete_cas(&mut self, cas_index: u64, key: &str) -> StateResult<bool> {
        match self.get::<DirEntry>(KVS, key)? {
            Some(existing) if existing.modify_index == cas_index => self.kvs_delete(key),
            _ => Ok(false),
        }
    }

    pub(crate) fn kvs_delete_tree(&mut self, prefix: &str) -> StateResult<usize> {
        let doomed: Vec<(String, DirEntry)> = self.scan(KVS, prefix)?;
        for (key, _) in &doomed {
            self.remove(KVS, key)?;
        }
        if !doomed.is_empty() {
            self.touch(Table::Kvs);
        }
        debug!(%prefix, removed = doomed.len(), "kv tree deleted");
        Ok(doomed.len())
    }

    /// Check-and-set. A zero modify index means "only if absent".
    pub(crate) fn kvs_cas(&mut self, ent: &DirEntry) -> StateResult<Option<DirEntry>> {
        let existing: Option<DirEntry> = self.get(KVS, &ent.key)?;
        let ok = match (&existing, ent.modify_index) {
            (None, 0) => true,
            (Some(e), idx) => idx != 0 && e.modify_index == idx,
            (None, _) => false,
        };
        if !ok {
            return Ok(None);
        }
        self.kvs_set(ent).map(Some)
    }

    /// Acquire the lock on `ent.key` for `ent.session`, writing the value.
    /// Returns `None` if another session holds the lock.
    pub(crate) fn kvs_lock(&mut self, ent: &DirEntry) -> StateResult<Option<DirEntry>> {
        let session = ent
            .session
            .as_deref()
            .ok_or_else(|| StateError::Invalid("missing session".into()))?;
        if self.get::<Session>(SESSIONS, session)?.is_none() {
            return Err(StateError::Invalid(format!("invalid session {session:?}")));
        }

        let mut stored = ent.clone();
        match self.get::<DirEntry>(KVS, &ent.key)? {
            Some(existing) => {
                match existing.session.as_deref() {
                    Some(holder) if holder != session => return Ok(None),
                    Some(_) => stored.lock_index = existing.lock_index,
                    None => stored.lock_index = existing.lock_index + 1,
                }
                stored.create_index = existing.create_index;
            }
            None => {
                stored.lock_index = 1;
                stored.create_index = self.index;
            }
        }
        stored.modify_index = self.index;
        self.put(KVS, &stored.key, &stored)?;
        self.touch(Table::Kvs);
        debug!(key = %stored.key, %session, lock_index = stored.lock_index, "kv lock acquired");
        Ok(Some(stored))
    }

    /// Release the lock held by `ent.session`, writing the value.
    /// Returns `None` if the lock is not held by that session.
    pub(crate) fn kvs_unlock(&mut self, ent: &DirEntry) -> StateResult<Option<DirEntry>> {
        let session = ent
            .session
            .as_deref()
            .ok_or_else(|| StateError::Invalid("missing session".into()))?;
        let Some(existing) = self.get::<DirEntry>(KVS, &ent.key)? else {
            return Ok(None);
        };
        if existing.session.as_deref() != Some(session) {
            return Ok(None);
        }
        let mut stored = ent.clone();
        stored.session = None;
        stored.lock_index = existing.lock_index;
        stored.create_index = existing.create_index;
        stored.modify_index = self.index;
        self.put(KVS, &stored.key, &stored)?;
        self.touch(Table::Kvs);
        debug!(key = %stored.key, %session, "kv lock released");
        Ok(Some(stored))
    }

    /// One transaction operation. Semantic failures come back as
    /// `StateError::Invalid` carrying the message reported to the caller.
    pub(crate) fn kvs_atomic_op(&mut self, op: &KvsAtomicOp) -> StateResult<Vec<DirEntry>> {
        let ent = &op.dir_ent;
        let key = ent.key.as_str();
        match op.verb {
            KvsAtomicVerb::Set => Ok(vec![self.kvs_set(ent)?]),
            KvsAtomicVerb::Delete => {
                self.kvs_delete(key)?;
                Ok(Vec::new())
            }
            KvsAtomicVerb::DeleteCas => {
                if self.kvs_delete_cas(ent.modify_index, key)? {
                    Ok(Vec::new())
                } else {
                    Err(StateError::Invalid(format!(
                        "failed to delete key {key:?}, index is stale"
                    )))
                }
            }
            KvsAtomicVerb::DeleteTree => {
                self.kvs_delete_tree(key)?;
                Ok(Vec::new())
            }
            KvsAtomicVerb::Cas => self.kvs_cas(ent)?.map(|e| vec![e]).ok_or_else(|| {
                StateError::Invalid(format!("failed to set key {key:?}, index is stale"))
            }),
            KvsAtomicVerb::Lock => self.kvs_lock(ent)?.map(|e| vec![e]).ok_or_else(|| {
                StateError::Invalid(format!("failed to lock key {key:?}, lock is already held"))
            }),
            KvsAtomicVerb::Unlock => self.kvs_unlock(ent)?.map(|e| vec![e]).ok_or_else(|| {
                StateError::Invalid(format!(
                    "failed to unlock key {key:?}, lock isn't held, or is held by another session"
                ))
            }),
            KvsAtomicVerb::Get => self
                .get::<DirEntry>(KVS, key)?
                .map(|e| vec![e])
                .ok_or_else(|| StateError::Invalid(format!("key {key:?} doesn't exist"))),
            KvsAtomicVerb::GetTree => Ok(self
                .scan::<DirEntry>(KVS, key)?
                .into_iter()
                .map(|(_, e)| e)
                .collect()),
            KvsAtomicVerb::CheckSession => {
                let current = self.get::<DirEntry>(KVS, key)?.and_then(|e| e.session);
                if current.is_some() && current == ent.session {
                    Ok(Vec::new())
                } else {
                    Err(StateError::Invalid(format!(
                        "failed session check for key {key:?}, current session {current:?} != {:?}",
                        ent.session
                    )))
                }
            }
            KvsAtomicVerb::CheckIndex => match self.get::<DirEntry>(KVS, key)? {
                Some(e) if e.modify_index == ent.modify_index => Ok(Vec::new()),
                Some(e) => Err(StateError::Invalid(format!(
                    "failed index check for key {key:?}, current modify index {} != {}",
                    e.modify_index, ent.modify_index
                ))),
                None => Err(StateError::Invalid(format!(
                    "failed index check for key {key:?}, key doesn't exist"
                ))),
            },
        }
    }

    // ── Sessions ───────────────────────────────────────────────────

    pub(crate) fn session_create(&mut self, session: &Session) -> StateResult<()> {
        if session.id.is_empty() {
            return Err(StateError::Invalid("missing session id".into()));
        }
        self.require_node(&session.node)?;
        if self.get::<Session>(SESSIONS, &session.id)?.is_some() {
            return Err(StateError::Invalid(format!(
                "session {:?} already exists",
                session.id
            )));
        }
        let mut stored = session.clone();
        stored.create_index = self.index;
        self.put(SESSIONS, &stored.id, &stored)?;
        self.touch(Table::Sessions);
        debug!(session = %stored.id, node = %stored.node, "session created");
        Ok(())
    }

    /// Remove a session and release every lock it holds. Returns true if
    /// the session existed.
    pub(crate) fn session_destroy(&mut self, id: &str) -> StateResult<bool> {
        let Some(session) = self.get::<Session>(SESSIONS, id)? else {
            return Ok(false);
        };
        self.remove(SESSIONS, id)?;
        self.touch(Table::Sessions);

        let entries: Vec<(String, DirEntry)> = self.scan(KVS, "")?;
        for (key, mut ent) in entries {
            if ent.session.as_deref() != Some(id) {
                continue;
            }
            ent.session = None;
            ent.modify_index = self.index;
            self.put(KVS, &key, &ent)?;
            self.touch(Table::Kvs);
            self.released.push((key, session.lock_delay));
        }
        debug!(session = %id, "session destroyed");
        Ok(true)
    }

    // ── Coordinates ────────────────────────────────────────────────

    /// Store coordinates, skipping nodes the catalog doesn't know.
    pub(crate) fn coordinate_batch_update(&mut self, updates: &[CoordinateEntry]) -> StateResult<()> {
        for update in updates {
            if self.get::<crate::types::Node>(NODES, &update.node)?.is_none() {
                debug!(node = %update.node, "coordinate for unknown node skipped");
                continue;
            }
            self.put(COORDINATES, &update.node, &update.coord)?;
            self.touch(Table::Coordinates);
        }
        Ok(())
    }
}

impl StateStore {
    // ── KV ─────────────────────────────────────────────────────────

    pub fn kvs_set(&self, index: u64, ent: &DirEntry) -> StateResult<()> {
        self.mutate(index, |m| m.kvs_set(ent).map(|_| ()))
    }

    pub fn kvs_get(&self, key: &str) -> StateResult<Option<DirEntry>> {
        self.snapshot()?.kvs_get(key)
    }

    pub fn kvs_list(&self, prefix: &str) -> StateResult<Vec<DirEntry>> {
        self.snapshot()?.kvs_list(prefix)
    }

    pub fn kvs_list_keys(&self, prefix: &str, separator: Option<&str>) -> StateResult<Vec<String>> {
        self.snapshot()?.kvs_list_keys(prefix, separator)
    }

    pub fn kvs_delete(&self, index: u64, key: &str) -> StateResult<()> {
        self.mutate(index, |m| m.kvs_delete(key).map(|_| ()))
    }

    pub fn kvs_delete_cas(&self, index: u64, cas_index: u64, key: &str) -> StateResult<bool> {
        self.mutate(index, |m| m.kvs_delete_cas(cas_index, key))
    }

    pub fn kvs_delete_tree(&self, index: u64, prefix: &str) -> StateResult<()> {
        self.mutate(index, |m| m.kvs_delete_tree(prefix).map(|_| ()))
    }

    pub fn kvs_cas(&self, index: u64, ent: &DirEntry) -> StateResult<bool> {
        self.mutate(index, |m| m.kvs_cas(ent).map(|e| e.is_some()))
    }

    pub fn kvs_lock(&self, index: u64, ent: &DirEntry) -> StateResult<bool> {
        self.mutate(index, |m| m.kvs_lock(ent).map(|e| e.is_some()))
    }

    pub fn kvs_unlock(&self, index: u64, ent: &DirEntry) -> StateResult<bool> {
        self.mutate(index, |m| m.kvs_unlock(ent).map(|e| e.is_some()))
    }

    // ── Sessions ───────────────────────────────────────────────────

    pub fn session_create(&self, index: u64, session: &Session) -> StateResult<()> {
        self.mutate(index, |m| m.session_create(session))
    }

    pub fn session_get(&self, id: &str) -> StateResult<Option<Session>> {
        self.snapshot()?.session_get(id)
    }

    pub fn session_destroy(&self, index: u64, id: &str) -> StateResult<()> {
        self.mutate(index, |m| m.session_destroy(id).map(|_| ()))
    }

    // ── Coordinates ────────────────────────────────────────────────

    pub fn coordinate_batch_update(&self, index: u64, updates: &[CoordinateEntry]) -> StateResult<()> {
        self.mutate(index, |m| m.coordinate_batch_update(updates))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Coordinate, Node};
    use std::time::Duration;

    fn store_with_node() -> StateStore {
        let s = StateStore::open_in_memory().unwrap();
        s.ensure_node(
            1,
            &Node {
                node: "foo".into(),
                address: "127.0.0.1".into(),
            },
        )
        .unwrap();
        s
    }

    fn entry(key: &str, value: &str) -> DirEntry {
        DirEntry {
            key: key.into(),
            value: value.as_bytes().to_vec(),
            ..Default::default()
        }
    }

    fn session(id: &str, delay: Duration) -> Session {
        Session {
            id: id.into(),
            node: "foo".into(),
            name: String::new(),
            lock_delay: delay,
            create_index: 0,
        }
    }

    fn locked(key: &str, session: &str) -> DirEntry {
        DirEntry {
            session: Some(session.into()),
            ..entry(key, "held")
        }
    }

    #[test]
    fn set_tracks_create_and_modify_index() {
        let s = store_with_node();
        s.kvs_set(2, &entry("foo", "bar")).unwrap();
        s.kvs_set(3, &entry("foo", "baz")).unwrap();
        let got = s.kvs_get("foo").unwrap().unwrap();
        assert_eq!(got.value, b"baz");
        assert_eq!(got.create_index, 2);
        assert_eq!(got.modify_index, 3);
    }

    #[test]
    fn cas_zero_means_create_only() {
        let s = store_with_node();
        assert!(s.kvs_cas(2, &entry("k", "v1")).unwrap());
        assert!(!s.kvs_cas(3, &entry("k", "v2")).unwrap());

        let mut update = entry("k", "v3");
        update.modify_index = 2;
        assert!(s.kvs_cas(4, &update).unwrap());
        assert!(!s.kvs_cas(5, &update).unwrap());
        assert_eq!(s.kvs_get("k").unwrap().unwrap().value, b"v3");
    }

    #[test]
    fn delete_cas_and_tree() {
        let s = store_with_node();
        s.kvs_set(2, &entry("web/a", "1")).unwrap();
        s.kvs_set(3, &entry("web/b", "2")).unwrap();
        s.kvs_set(4, &entry("other", "3")).unwrap();

        assert!(!s.kvs_delete_cas(5, 99, "web/a").unwrap());
        assert!(s.kvs_delete_cas(6, 2, "web/a").unwrap());
        assert!(!s.kvs_delete_cas(7, 0, "missing").unwrap());

        s.kvs_delete_tree(8, "web/").unwrap();
        let keys = s.kvs_list_keys("", None).unwrap();
        assert_eq!(keys, vec!["other"]);
    }

    #[test]
    fn list_keys_collapses_on_separator() {
        let s = store_with_node();
        for (i, k) in ["web/a", "web/sub/x", "web/sub/y", "webby"].iter().enumerate() {
            s.kvs_set(i as u64 + 2, &entry(k, "v")).unwrap();
        }
        let keys = s.kvs_list_keys("web/", Some("/")).unwrap();
        assert_eq!(keys, vec!["web/a", "web/sub/"]);
        let keys = s.kvs_list_keys("web", None).unwrap();
        assert_eq!(keys.len(), 4);
    }

    #[test]
    fn lock_requires_live_session() {
        let s = store_with_node();
        let err = s.kvs_lock(2, &locked("k", "nope")).unwrap_err();
        assert!(matches!(err, StateError::Invalid(_)));
        let err = s.kvs_lock(3, &entry("k", "v")).unwrap_err();
        assert!(matches!(err, StateError::Invalid(_)));
    }

    #[test]
    fn lock_and_unlock() {
        let s = store_with_node();
        s.session_create(2, &session("s1", Duration::ZERO)).unwrap();
        s.session_create(3, &session("s2", Duration::ZERO)).unwrap();

        assert!(s.kvs_lock(4, &locked("k", "s1")).unwrap());
        assert!(!s.kvs_lock(5, &locked("k", "s2")).unwrap());
        // Re-acquire by the holder keeps the lock index.
        assert!(s.kvs_lock(6, &locked("k", "s1")).unwrap());
        let got = s.kvs_get("k").unwrap().unwrap();
        assert_eq!(got.lock_index, 1);
        assert_eq!(got.session.as_deref(), Some("s1"));

        assert!(!s.kvs_unlock(7, &locked("k", "s2")).unwrap());
        assert!(s.kvs_unlock(8, &locked("k", "s1")).unwrap());
        assert_eq!(s.kvs_get("k").unwrap().unwrap().session, None);

        assert!(s.kvs_lock(9, &locked("k", "s2")).unwrap());
        assert_eq!(s.kvs_get("k").unwrap().unwrap().lock_index, 2);
    }

    #[test]
    fn set_preserves_lock_holder() {
        let s = store_with_node();
        s.session_create(2, &session("s1", Duration::ZERO)).unwrap();
        s.kvs_lock(3, &locked("k", "s1")).unwrap();
        s.kvs_set(4, &entry("k", "new")).unwrap();
        let got = s.kvs_get("k").unwrap().unwrap();
        assert_eq!(got.session.as_deref(), Some("s1"));
        assert_eq!(got.value, b"new");
    }

    #[test]
    fn session_requires_node() {
        let s = StateStore::open_in_memory().unwrap();
        let err = s.session_create(1, &session("s1", Duration::ZERO)).unwrap_err();
        assert!(matches!(err, StateError::Invalid(_)));
    }

    #[test]
    fn destroying_session_releases_locks_and_arms_delay() {
        let s = store_with_node();
        s.session_create(2, &session("s1", Duration::from_secs(30))).unwrap();
        s.kvs_lock(3, &locked("k", "s1")).unwrap();
        assert!(s.kvs_lock_delay("k").is_none());

        s.session_destroy(4, "s1").unwrap();
        let got = s.kvs_get("k").unwrap().unwrap();
        assert_eq!(got.session, None);
        assert_eq!(got.modify_index, 4);
        assert!(s.kvs_lock_delay("k").is_some());
        assert_eq!(s.session_get("s1").unwrap(), None);
    }

    #[test]
    fn deleting_node_invalidates_its_sessions() {
        let s = store_with_node();
        s.session_create(2, &session("s1", Duration::ZERO)).unwrap();
        s.kvs_lock(3, &locked("k", "s1")).unwrap();
        s.delete_node(4, "foo").unwrap();
        assert_eq!(s.session_get("s1").unwrap(), None);
        assert_eq!(s.kvs_get("k").unwrap().unwrap().session, None);
    }

    #[test]
    fn coordinates_skip_unknown_nodes() {
        let s = store_with_node();
        let updates = vec![
            CoordinateEntry {
                node: "foo".into(),
                coord: Coordinate::new(8),
            },
            CoordinateEntry {
                node: "ghost".into(),
                coord: Coordinate::new(8),
            },
        ];
        s.coordinate_batch_update(2, &updates).unwrap();
        let snap = s.snapshot().unwrap();
        assert!(snap.coordinate_get("foo").unwrap().is_some());
        assert!(snap.coordinate_get("ghost").unwrap().is_none());
        assert_eq!(snap.coordinates().unwrap().len(), 1);

        s.delete_node(3, "foo").unwrap();
        assert!(s.snapshot().unwrap().coordinate_get("foo").unwrap().is_none());
    }

    #[test]
    fn transaction_applies_every_op() {
        let s = store_with_node();
        s.kvs_set(2, &entry("guard", "x")).unwrap();
        let ops = vec![
            KvsAtomicOp {
                verb: KvsAtomicVerb::CheckIndex,
                dir_ent: DirEntry {
                    key: "guard".into(),
                    modify_index: 2,
                    ..Default::default()
                },
            },
            KvsAtomicOp {
                verb: KvsAtomicVerb::Set,
                dir_ent: entry("a", "1"),
            },
            KvsAtomicOp {
                verb: KvsAtomicVerb::Get,
                dir_ent: entry("a", ""),
            },
        ];
        let resp = s.kvs_atomic(3, &ops).unwrap();
        assert!(resp.errors.is_empty());
        assert_eq!(resp.results.len(), 2);
        assert_eq!(resp.results[1].value, b"1");
        assert_eq!(s.kvs_get("a").unwrap().unwrap().modify_index, 3);
    }

    #[test]
    fn transaction_collects_every_error() {
        let s = store_with_node();
        let ops = vec![
            KvsAtomicOp {
                verb: KvsAtomicVerb::Get,
                dir_ent: entry("missing", ""),
            },
            KvsAtomicOp {
                verb: KvsAtomicVerb::Set,
                dir_ent: entry("a", "1"),
            },
            KvsAtomicOp {
                verb: KvsAtomicVerb::Cas,
                dir_ent: DirEntry {
                    modify_index: 42,
                    ..entry("b", "2")
                },
            },
        ];
        let resp = s.kvs_atomic(2, &ops).unwrap();
        let failed: Vec<_> = resp.errors.iter().map(|e| e.op_index).collect();
        assert_eq!(failed, vec![0, 2]);
        assert_eq!(s.kvs_get("a").unwrap(), None);
    }
}
