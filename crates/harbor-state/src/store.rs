//! StateStore — redb-backed catalog persistence.
//!
//! Mutators take the replicated log index that caused them and run inside a
//! single redb write transaction, so a reader never observes half of a
//! registration or half of a node deletion. redb allows exactly one writer
//! at a time; concurrent callers queue on `begin_write`.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::requests::{DeregisterRequest, KvsAtomicError, KvsAtomicOp, KvsAtomicResponse, RegisterRequest};
use crate::snapshot::{StateSnapshot, StoreDump};
use crate::tables::{self, *};
use crate::types::*;

/// Thread-safe catalog store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    watches: Arc<Watches>,
    /// Wall-clock lock-delay deadlines. Local to this server, never replicated.
    lock_delay: Arc<Mutex<HashMap<String, Instant>>>,
    /// Meta entry to write inside the next committed write transaction.
    pending_meta: Arc<Mutex<Option<(String, Vec<u8>)>>>,
}

/// One watch channel per logical table carrying its latest modify index.
struct Watches {
    senders: [watch::Sender<u64>; Table::ALL.len()],
}

impl Watches {
    fn new() -> Self {
        Self {
            senders: std::array::from_fn(|_| watch::channel(0).0),
        }
    }

    fn notify(&self, table: Table, index: u64) {
        self.senders[table.slot()].send_replace(index);
    }
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::with_db(db)?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::with_db(db)?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn with_db(db: Database) -> StateResult<Self> {
        let store = Self {
            db: Arc::new(db),
            watches: Arc::new(Watches::new()),
            lock_delay: Arc::new(Mutex::new(HashMap::new())),
            pending_meta: Arc::new(Mutex::new(None)),
        };
        store.ensure_tables()?;
        let snap = store.snapshot()?;
        for table in Table::ALL {
            store.watches.notify(table, snap.index(table)?);
        }
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        for def in DATA_TABLES {
            txn.open_table(def).map_err(map_err!(Table))?;
        }
        txn.open_table(INDEXES).map_err(map_err!(Table))?;
        txn.open_table(META).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Store an opaque metadata value.
    pub fn put_meta(&self, key: &str, value: &[u8]) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(META).map_err(map_err!(Table))?;
            table.insert(key, value).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Run `f` and store `key = value` in the same write transaction as the
    /// first write `f` commits. When `f` commits nothing the entry is stored
    /// on its own once `f` returns successfully.
    pub fn with_meta<R>(
        &self,
        key: &str,
        value: &[u8],
        f: impl FnOnce() -> StateResult<R>,
    ) -> StateResult<R> {
        *self.staged_meta() = Some((key.to_string(), value.to_vec()));
        let result = f();
        let unwritten = self.staged_meta().take();
        let out = result?;
        if let Some((key, value)) = unwritten {
            self.put_meta(&key, &value)?;
        }
        Ok(out)
    }

    fn staged_meta(&self) -> MutexGuard<'_, Option<(String, Vec<u8>)>> {
        self.pending_meta.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get_meta(&self, key: &str) -> StateResult<Option<Vec<u8>>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(META).map_err(map_err!(Table))?;
        let value = table
            .get(key)
            .map_err(map_err!(Read))?
            .map(|g| g.value().to_vec());
        Ok(value)
    }

    /// Release the store. Outstanding snapshots stay readable until dropped.
    pub fn close(self) {
        debug!("state store closed");
    }

    /// Point-in-time read view. Unaffected by any later write.
    pub fn snapshot(&self) -> StateResult<StateSnapshot> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        Ok(StateSnapshot::new(txn))
    }

    /// Subscribe to the modify index of a table. The receiver is marked
    /// changed after every committed write touching the table.
    pub fn watch(&self, table: Table) -> watch::Receiver<u64> {
        self.watches.senders[table.slot()].subscribe()
    }

    /// Last log index that modified `table`.
    pub fn index(&self, table: Table) -> StateResult<u64> {
        self.snapshot()?.index(table)
    }

    /// Highest modify index among `tables`.
    pub fn max_index(&self, tables: &[Table]) -> StateResult<u64> {
        self.snapshot()?.max_index(tables)
    }

    /// Run `f` in a write transaction and commit it.
    pub(crate) fn mutate<R>(
        &self,
        index: u64,
        f: impl FnOnce(&mut Mutation<'_>) -> StateResult<R>,
    ) -> StateResult<R> {
        self.transact(index, |m| f(m).map(|out| (out, true)))
    }

    /// Run `f` in a write transaction; commit only when it returns `true`
    /// alongside its output. An error always aborts.
    pub(crate) fn transact<R>(
        &self,
        index: u64,
        f: impl FnOnce(&mut Mutation<'_>) -> StateResult<(R, bool)>,
    ) -> StateResult<R> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut m = Mutation::new(&txn, index);
        let (out, commit) = match f(&mut m) {
            Ok(v) => v,
            Err(e) => {
                drop(m);
                txn.abort().map_err(map_err!(Transaction))?;
                return Err(e);
            }
        };
        let Mutation {
            touched, released, ..
        } = m;
        if !commit {
            txn.abort().map_err(map_err!(Transaction))?;
            return Ok(out);
        }
        {
            let mut idx = txn.open_table(INDEXES).map_err(map_err!(Table))?;
            for table in &touched {
                idx.insert(table.as_str(), index).map_err(map_err!(Write))?;
            }
        }
        if let Some((key, value)) = self.staged_meta().take() {
            let mut meta = txn.open_table(META).map_err(map_err!(Table))?;
            meta.insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;

        self.record_lock_delays(released);
        for table in touched {
            self.watches.notify(table, index);
        }
        Ok(out)
    }

    // ── Nodes ──────────────────────────────────────────────────────

    /// Insert or update a node.
    pub fn ensure_node(&self, index: u64, node: &Node) -> StateResult<()> {
        self.mutate(index, |m| m.ensure_node(node))
    }

    pub fn get_node(&self, name: &str) -> StateResult<Option<Node>> {
        self.snapshot()?.get_node(name)
    }

    pub fn nodes(&self) -> StateResult<Vec<Node>> {
        self.snapshot()?.nodes()
    }

    /// Delete a node with every service, check, session and coordinate it
    /// owns. A missing node is a no-op.
    pub fn delete_node(&self, index: u64, node: &str) -> StateResult<()> {
        self.mutate(index, |m| m.delete_node(node))
    }

    // ── Services ───────────────────────────────────────────────────

    /// Insert or overwrite (by ID) a service on an existing node.
    pub fn ensure_service(&self, index: u64, node: &str, svc: &NodeService) -> StateResult<()> {
        self.mutate(index, |m| m.ensure_service(node, svc))
    }

    pub fn node_services(&self, node: &str) -> StateResult<Option<NodeServices>> {
        self.snapshot()?.node_services(node)
    }

    /// Delete one service and the checks bound to it. Missing is a no-op.
    pub fn delete_node_service(&self, index: u64, node: &str, service_id: &str) -> StateResult<()> {
        self.mutate(index, |m| m.delete_service(node, service_id).map(|_| ()))
    }

    pub fn services(&self) -> StateResult<std::collections::BTreeMap<String, Vec<String>>> {
        self.snapshot()?.services()
    }

    pub fn service_nodes(&self, service: &str) -> StateResult<Vec<ServiceNode>> {
        self.snapshot()?.service_nodes(service)
    }

    pub fn service_tag_nodes(&self, service: &str, tag: &str) -> StateResult<Vec<ServiceNode>> {
        self.snapshot()?.service_tag_nodes(service, tag)
    }

    // ── Checks ─────────────────────────────────────────────────────

    /// Insert or update a health check. Identical writes leave the checks
    /// index untouched.
    pub fn ensure_check(&self, index: u64, check: &HealthCheck) -> StateResult<()> {
        self.mutate(index, |m| m.ensure_check(check))
    }

    pub fn node_checks(&self, node: &str) -> StateResult<Vec<HealthCheck>> {
        self.snapshot()?.node_checks(node)
    }

    pub fn service_checks(&self, service: &str) -> StateResult<Vec<HealthCheck>> {
        self.snapshot()?.service_checks(service)
    }

    pub fn checks_in_state(&self, status: HealthStatus) -> StateResult<Vec<HealthCheck>> {
        self.snapshot()?.checks_in_state(status)
    }

    pub fn delete_node_check(&self, index: u64, node: &str, check_id: &str) -> StateResult<()> {
        self.mutate(index, |m| m.delete_check(node, check_id).map(|_| ()))
    }

    pub fn check_service_nodes(&self, service: &str) -> StateResult<Vec<CheckServiceNode>> {
        self.snapshot()?.check_service_nodes(service)
    }

    pub fn check_service_tag_nodes(
        &self,
        service: &str,
        tag: &str,
    ) -> StateResult<Vec<CheckServiceNode>> {
        self.snapshot()?.check_service_tag_nodes(service, tag)
    }

    // ── Registration ───────────────────────────────────────────────

    /// Apply a catalog registration: node, then optional service, then
    /// optional check, all in one transaction.
    pub fn ensure_registration(&self, index: u64, req: &RegisterRequest) -> StateResult<()> {
        let mut req = req.clone();
        req.normalize();
        if let Some(check) = &req.check {
            if check.node != req.node {
                return Err(StateError::Invalid(format!(
                    "check {:?} belongs to node {:?}, not {:?}",
                    check.check_id, check.node, req.node
                )));
            }
        }
        self.mutate(index, |m| {
            m.ensure_node(&Node {
                node: req.node.clone(),
                address: req.address.clone(),
            })?;
            if let Some(svc) = &req.service {
                m.ensure_service(&req.node, svc)?;
            }
            if let Some(check) = &req.check {
                m.ensure_check(check)?;
            }
            Ok(())
        })
    }

    /// Apply a catalog deregistration. A service ID wins over a check ID;
    /// with neither the whole node goes.
    pub fn deregister(&self, index: u64, req: &DeregisterRequest) -> StateResult<()> {
        self.mutate(index, |m| {
            if let Some(id) = &req.service_id {
                m.delete_service(&req.node, id)?;
            } else if let Some(id) = &req.check_id {
                m.delete_check(&req.node, id)?;
            } else {
                m.delete_node(&req.node)?;
            }
            Ok(())
        })
    }

    // ── Transactions ───────────────────────────────────────────────

    /// Run a KV transaction. Either every operation applies and `results`
    /// is filled, or nothing is written and `errors` names each failing op.
    pub fn kvs_atomic(&self, index: u64, ops: &[KvsAtomicOp]) -> StateResult<KvsAtomicResponse> {
        self.transact(index, |m| {
            let mut resp = KvsAtomicResponse::default();
            for (op_index, op) in ops.iter().enumerate() {
                match m.kvs_atomic_op(op) {
                    Ok(mut entries) => resp.results.append(&mut entries),
                    Err(StateError::Invalid(what)) => {
                        resp.errors.push(KvsAtomicError { op_index, what })
                    }
                    Err(e) => return Err(e),
                }
            }
            if resp.errors.is_empty() {
                Ok((resp, true))
            } else {
                resp.results.clear();
                Ok((resp, false))
            }
        })
    }

    // ── Lock delay ─────────────────────────────────────────────────

    /// Deadline before which `key` may not be locked again, if one is
    /// still pending.
    pub fn kvs_lock_delay(&self, key: &str) -> Option<Instant> {
        let mut delays = self.lock_delay.lock().unwrap_or_else(|e| e.into_inner());
        match delays.get(key) {
            Some(&until) if until > Instant::now() => Some(until),
            Some(_) => {
                delays.remove(key);
                None
            }
            None => None,
        }
    }

    fn record_lock_delays(&self, released: Vec<(String, Duration)>) {
        if released.is_empty() {
            return;
        }
        let now = Instant::now();
        let mut delays = self.lock_delay.lock().unwrap_or_else(|e| e.into_inner());
        for (key, delay) in released {
            if delay.is_zero() {
                continue;
            }
            debug!(%key, ?delay, "lock delay armed");
            delays.insert(key, now + delay);
        }
    }

    // ── Snapshot restore ───────────────────────────────────────────

    /// Replace the entire contents of the store with `dump`.
    pub fn restore(&self, dump: &StoreDump) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        for def in DATA_TABLES {
            txn.delete_table(def).map_err(map_err!(Table))?;
            txn.open_table(def).map_err(map_err!(Table))?;
        }
        txn.delete_table(INDEXES).map_err(map_err!(Table))?;
        {
            let m = Mutation::new(&txn, 0);
            for node in &dump.nodes {
                m.put(NODES, &node.node, node)?;
            }
            for (node, svc) in &dump.services {
                m.put(SERVICES, &tables::key(&[node, &svc.id]), svc)?;
                m.mark(SERVICE_INDEX, &tables::key(&[&svc.service, node, &svc.id]))?;
            }
            for check in &dump.checks {
                m.put(CHECKS, &tables::key(&[&check.node, &check.check_id]), check)?;
                m.mark(
                    CHECK_STATUS_INDEX,
                    &tables::key(&[check.status.as_str(), &check.node, &check.check_id]),
                )?;
            }
            for ent in &dump.kvs {
                m.put(KVS, &ent.key, ent)?;
            }
            for session in &dump.sessions {
                m.put(SESSIONS, &session.id, session)?;
            }
            for entry in &dump.coordinates {
                m.put(COORDINATES, &entry.node, &entry.coord)?;
            }
        }
        {
            let mut idx = txn.open_table(INDEXES).map_err(map_err!(Table))?;
            for table in Table::ALL {
                let value = dump.indexes.get(table.as_str()).copied().unwrap_or(0);
                idx.insert(table.as_str(), value).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;

        for table in Table::ALL {
            let value = dump.indexes.get(table.as_str()).copied().unwrap_or(0);
            self.watches.notify(table, value);
        }
        debug!(
            nodes = dump.nodes.len(),
            kvs = dump.kvs.len(),
            "state store restored"
        );
        Ok(())
    }
}

/// Every table holding JSON rows.
const DATA_TABLES: [TableDefinition<'static, &'static str, &'static [u8]>; 8] = [
    NODES,
    SERVICES,
    SERVICE_INDEX,
    CHECKS,
    CHECK_STATUS_INDEX,
    KVS,
    SESSIONS,
    COORDINATES,
];

// ── Row codecs ─────────────────────────────────────────────────────

/// Read and decode one JSON row.
pub(crate) fn get_json<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    key: &str,
) -> StateResult<Option<T>> {
    match table.get(key).map_err(map_err!(Read))? {
        Some(guard) => {
            let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

/// Decode every row whose key starts with `prefix`, in key order.
pub(crate) fn scan_json<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    prefix: &str,
) -> StateResult<Vec<(String, T)>> {
    let mut out = Vec::new();
    for entry in table.range(prefix..).map_err(map_err!(Read))? {
        let (key, value) = entry.map_err(map_err!(Read))?;
        let key = key.value();
        if !key.starts_with(prefix) {
            break;
        }
        let decoded = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
        out.push((key.to_string(), decoded));
    }
    Ok(out)
}

/// Keys starting with `prefix`, in key order.
pub(crate) fn scan_keys(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    prefix: &str,
) -> StateResult<Vec<String>> {
    let mut out = Vec::new();
    for entry in table.range(prefix..).map_err(map_err!(Read))? {
        let (key, _) = entry.map_err(map_err!(Read))?;
        let key = key.value();
        if !key.starts_with(prefix) {
            break;
        }
        out.push(key.to_string());
    }
    Ok(out)
}

// ── Mutation ───────────────────────────────────────────────────────

/// An open write transaction plus the bookkeeping needed at commit: which
/// tables changed and which keys had their lock released.
pub(crate) struct Mutation<'t> {
    txn: &'t WriteTransaction,
    pub(crate) index: u64,
    touched: BTreeSet<Table>,
    pub(crate) released: Vec<(String, Duration)>,
}

type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

impl<'t> Mutation<'t> {
    fn new(txn: &'t WriteTransaction, index: u64) -> Self {
        Self {
            txn,
            index,
            touched: BTreeSet::new(),
            released: Vec::new(),
        }
    }

    pub(crate) fn touch(&mut self, table: Table) {
        self.touched.insert(table);
    }

    pub(crate) fn get<T: DeserializeOwned>(&self, def: JsonTable, key: &str) -> StateResult<Option<T>> {
        let table = self.txn.open_table(def).map_err(map_err!(Table))?;
        get_json(&table, key)
    }

    pub(crate) fn scan<T: DeserializeOwned>(
        &self,
        def: JsonTable,
        prefix: &str,
    ) -> StateResult<Vec<(String, T)>> {
        let table = self.txn.open_table(def).map_err(map_err!(Table))?;
        scan_json(&table, prefix)
    }

    pub(crate) fn put<T: Serialize>(&self, def: JsonTable, key: &str, value: &T) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let mut table = self.txn.open_table(def).map_err(map_err!(Table))?;
        table.insert(key, bytes.as_slice()).map_err(map_err!(Write))?;
        Ok(())
    }

    /// Insert an empty-valued index row.
    fn mark(&self, def: JsonTable, key: &str) -> StateResult<()> {
        let empty: &[u8] = &[];
        let mut table = self.txn.open_table(def).map_err(map_err!(Table))?;
        table.insert(key, empty).map_err(map_err!(Write))?;
        Ok(())
    }

    pub(crate) fn remove(&self, def: JsonTable, key: &str) -> StateResult<bool> {
        let mut table = self.txn.open_table(def).map_err(map_err!(Table))?;
        let existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        Ok(existed)
    }

    pub(crate) fn require_node(&self, node: &str) -> StateResult<Node> {
        self.get(NODES, node)?
            .ok_or_else(|| StateError::Invalid(format!("missing node {node:?}")))
    }

    pub(crate) fn ensure_node(&mut self, node: &Node) -> StateResult<()> {
        tables::check_key_part("node", &node.node)?;
        let existing: Option<Node> = self.get(NODES, &node.node)?;
        if existing.as_ref() == Some(node) {
            return Ok(());
        }
        self.put(NODES, &node.node, node)?;
        self.touch(Table::Nodes);
        debug!(node = %node.node, address = %node.address, "node stored");
        Ok(())
    }

    pub(crate) fn ensure_service(&mut self, node: &str, svc: &NodeService) -> StateResult<()> {
        self.require_node(node)?;
        tables::check_key_part("service id", &svc.id)?;
        tables::check_key_part("service name", &svc.service)?;
        let key = tables::key(&[node, &svc.id]);
        let existing: Option<NodeService> = self.get(SERVICES, &key)?;
        if existing.as_ref() == Some(svc) {
            return Ok(());
        }
        if let Some(old) = &existing {
            self.remove(SERVICE_INDEX, &tables::key(&[&old.service, node, &old.id]))?;
        }
        self.put(SERVICES, &key, svc)?;
        self.mark(SERVICE_INDEX, &tables::key(&[&svc.service, node, &svc.id]))?;
        self.touch(Table::Services);
        debug!(%node, service_id = %svc.id, "service stored");
        Ok(())
    }

    /// Returns true if the service existed.
    pub(crate) fn delete_service(&mut self, node: &str, service_id: &str) -> StateResult<bool> {
        let key = tables::key(&[node, service_id]);
        let Some(old) = self.get::<NodeService>(SERVICES, &key)? else {
            return Ok(false);
        };
        self.remove(SERVICES, &key)?;
        self.remove(SERVICE_INDEX, &tables::key(&[&old.service, node, &old.id]))?;
        self.touch(Table::Services);

        let checks: Vec<(String, HealthCheck)> = self.scan(CHECKS, &tables::prefix(&[node]))?;
        for (_, check) in checks {
            if check.service_id.as_deref() == Some(service_id) {
                self.delete_check(node, &check.check_id)?;
            }
        }
        debug!(%node, %service_id, "service deleted");
        Ok(true)
    }

    pub(crate) fn ensure_check(&mut self, check: &HealthCheck) -> StateResult<()> {
        self.require_node(&check.node)?;
        tables::check_key_part("check id", &check.check_id)?;
        let mut check = check.clone();
        if let Some(service_id) = &check.service_id {
            let svc: NodeService = self
                .get(SERVICES, &tables::key(&[&check.node, service_id]))?
                .ok_or_else(|| {
                    StateError::Invalid(format!(
                        "missing service {service_id:?} on node {:?}",
                        check.node
                    ))
                })?;
            check.service_name = Some(svc.service);
        } else {
            check.service_name = None;
        }

        let key = tables::key(&[&check.node, &check.check_id]);
        let existing: Option<HealthCheck> = self.get(CHECKS, &key)?;
        if existing.as_ref() == Some(&check) {
            return Ok(());
        }
        if let Some(old) = &existing {
            self.remove(
                CHECK_STATUS_INDEX,
                &tables::key(&[old.status.as_str(), &old.node, &old.check_id]),
            )?;
        }
        self.put(CHECKS, &key, &check)?;
        self.mark(
            CHECK_STATUS_INDEX,
            &tables::key(&[check.status.as_str(), &check.node, &check.check_id]),
        )?;
        self.touch(Table::Checks);
        debug!(node = %check.node, check_id = %check.check_id, status = %check.status, "check stored");
        Ok(())
    }

    /// Returns true if the check existed.
    pub(crate) fn delete_check(&mut self, node: &str, check_id: &str) -> StateResult<bool> {
        let key = tables::key(&[node, check_id]);
        let Some(old) = self.get::<HealthCheck>(CHECKS, &key)? else {
            return Ok(false);
        };
        self.remove(CHECKS, &key)?;
        self.remove(
            CHECK_STATUS_INDEX,
            &tables::key(&[old.status.as_str(), node, check_id]),
        )?;
        self.touch(Table::Checks);
        debug!(%node, %check_id, "check deleted");
        Ok(true)
    }

    pub(crate) fn delete_node(&mut self, node: &str) -> StateResult<()> {
        if self.get::<Node>(NODES, node)?.is_none() {
            return Ok(());
        }
        let owned = tables::prefix(&[node]);

        let services: Vec<(String, NodeService)> = self.scan(SERVICES, &owned)?;
        for (key, svc) in services {
            self.remove(SERVICES, &key)?;
            self.remove(SERVICE_INDEX, &tables::key(&[&svc.service, node, &svc.id]))?;
            self.touch(Table::Services);
        }

        let checks: Vec<(String, HealthCheck)> = self.scan(CHECKS, &owned)?;
        for (key, check) in checks {
            self.remove(CHECKS, &key)?;
            self.remove(
                CHECK_STATUS_INDEX,
                &tables::key(&[check.status.as_str(), node, &check.check_id]),
            )?;
            self.touch(Table::Checks);
        }

        let sessions: Vec<(String, Session)> = self.scan(SESSIONS, "")?;
        for (id, session) in sessions {
            if session.node == node {
                self.session_destroy(&id)?;
            }
        }

        if self.remove(COORDINATES, node)? {
            self.touch(Table::Coordinates);
        }
        self.remove(NODES, node)?;
        self.touch(Table::Nodes);
        debug!(%node, "node deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::requests::KvsAtomicVerb;

    fn store() -> StateStore {
        StateStore::open_in_memory().unwrap()
    }

    fn node(name: &str, addr: &str) -> Node {
        Node {
            node: name.into(),
            address: addr.into(),
        }
    }

    fn service(id: &str, name: &str, tag: Option<&str>, port: u16) -> NodeService {
        NodeService {
            id: id.into(),
            service: name.into(),
            tag: tag.map(String::from),
            port,
        }
    }

    fn check(node: &str, id: &str, status: HealthStatus, service_id: Option<&str>) -> HealthCheck {
        HealthCheck {
            node: node.into(),
            check_id: id.into(),
            name: id.into(),
            status,
            service_id: service_id.map(String::from),
            ..Default::default()
        }
    }

    #[test]
    fn node_ensure_and_get() {
        let s = store();
        s.ensure_node(1, &node("foo", "127.0.0.1")).unwrap();
        assert_eq!(s.get_node("foo").unwrap(), Some(node("foo", "127.0.0.1")));
        assert_eq!(s.get_node("bar").unwrap(), None);

        s.ensure_node(2, &node("foo", "127.0.0.2")).unwrap();
        assert_eq!(s.get_node("foo").unwrap().unwrap().address, "127.0.0.2");
        assert_eq!(s.index(Table::Nodes).unwrap(), 2);
    }

    #[test]
    fn nodes_are_listed_in_name_order() {
        let s = store();
        s.ensure_node(1, &node("zed", "10.0.0.3")).unwrap();
        s.ensure_node(2, &node("alpha", "10.0.0.1")).unwrap();
        let names: Vec<_> = s.nodes().unwrap().into_iter().map(|n| n.node).collect();
        assert_eq!(names, vec!["alpha", "zed"]);
    }

    #[test]
    fn service_requires_node() {
        let s = store();
        let err = s
            .ensure_service(1, "ghost", &service("db", "db", None, 8000))
            .unwrap_err();
        assert!(matches!(err, StateError::Invalid(_)));
    }

    #[test]
    fn duplicate_service_id_overwrites() {
        let s = store();
        s.ensure_node(1, &node("foo", "127.0.0.1")).unwrap();
        s.ensure_service(2, "foo", &service("api", "api", None, 5000)).unwrap();
        s.ensure_service(3, "foo", &service("api", "api", Some("prod"), 5001)).unwrap();

        let ns = s.node_services("foo").unwrap().unwrap();
        assert_eq!(ns.services.len(), 1);
        let api = &ns.services["api"];
        assert_eq!(api.tag.as_deref(), Some("prod"));
        assert_eq!(api.port, 5001);
    }

    #[test]
    fn renaming_a_service_moves_its_index_row() {
        let s = store();
        s.ensure_node(1, &node("foo", "127.0.0.1")).unwrap();
        s.ensure_service(2, "foo", &service("x", "old", None, 1)).unwrap();
        s.ensure_service(3, "foo", &service("x", "new", None, 1)).unwrap();
        assert!(s.service_nodes("old").unwrap().is_empty());
        assert_eq!(s.service_nodes("new").unwrap().len(), 1);
    }

    #[test]
    fn services_collects_tags() {
        let s = store();
        s.ensure_node(1, &node("foo", "127.0.0.1")).unwrap();
        s.ensure_node(2, &node("bar", "127.0.0.2")).unwrap();
        s.ensure_service(3, "foo", &service("db", "db", Some("master"), 8000)).unwrap();
        s.ensure_service(4, "bar", &service("db", "db", Some("slave"), 8000)).unwrap();
        s.ensure_service(5, "bar", &service("api", "api", None, 5000)).unwrap();

        let services = s.services().unwrap();
        assert_eq!(services["db"], vec!["master", "slave"]);
        assert!(services["api"].is_empty());
    }

    #[test]
    fn service_nodes_and_tag_filter() {
        let s = store();
        s.ensure_node(1, &node("foo", "127.0.0.1")).unwrap();
        s.ensure_node(2, &node("bar", "127.0.0.2")).unwrap();
        s.ensure_service(3, "foo", &service("db", "db", Some("master"), 8000)).unwrap();
        s.ensure_service(4, "bar", &service("db", "db", Some("slave"), 8000)).unwrap();

        let all = s.service_nodes("db").unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].node, "bar");
        assert_eq!(all[1].node, "foo");
        assert_eq!(all[1].address, "127.0.0.1");

        let masters = s.service_tag_nodes("db", "master").unwrap();
        assert_eq!(masters.len(), 1);
        assert_eq!(masters[0].node, "foo");
        assert_eq!(masters[0].service_port, 8000);
    }

    #[test]
    fn check_requires_node_and_service() {
        let s = store();
        let err = s
            .ensure_check(1, &check("foo", "mem", HealthStatus::Passing, None))
            .unwrap_err();
        assert!(matches!(err, StateError::Invalid(_)));

        s.ensure_node(2, &node("foo", "127.0.0.1")).unwrap();
        let err = s
            .ensure_check(3, &check("foo", "db-check", HealthStatus::Passing, Some("db")))
            .unwrap_err();
        assert!(matches!(err, StateError::Invalid(_)));
    }

    #[test]
    fn check_takes_service_name_from_catalog() {
        let s = store();
        s.ensure_node(1, &node("foo", "127.0.0.1")).unwrap();
        s.ensure_service(2, "foo", &service("db1", "db", None, 8000)).unwrap();
        s.ensure_check(3, &check("foo", "db-check", HealthStatus::Passing, Some("db1")))
            .unwrap();

        let checks = s.service_checks("db").unwrap();
        assert_eq!(checks.len(), 1);
        assert_eq!(checks[0].service_name.as_deref(), Some("db"));
    }

    #[test]
    fn identical_check_does_not_bump_index() {
        let s = store();
        s.ensure_node(1, &node("foo", "127.0.0.1")).unwrap();
        let c = check("foo", "mem", HealthStatus::Passing, None);
        s.ensure_check(2, &c).unwrap();
        s.ensure_check(3, &c).unwrap();
        assert_eq!(s.index(Table::Checks).unwrap(), 2);

        let mut c2 = c.clone();
        c2.status = HealthStatus::Critical;
        s.ensure_check(4, &c2).unwrap();
        assert_eq!(s.index(Table::Checks).unwrap(), 4);
    }

    #[test]
    fn checks_in_state_follow_status_changes() {
        let s = store();
        s.ensure_node(1, &node("foo", "127.0.0.1")).unwrap();
        s.ensure_check(2, &check("foo", "mem", HealthStatus::Passing, None)).unwrap();
        s.ensure_check(3, &check("foo", "cpu", HealthStatus::Warning, None)).unwrap();
        assert_eq!(s.checks_in_state(HealthStatus::Passing).unwrap().len(), 1);

        s.ensure_check(4, &check("foo", "mem", HealthStatus::Warning, None)).unwrap();
        assert!(s.checks_in_state(HealthStatus::Passing).unwrap().is_empty());
        let warning: Vec<_> = s
            .checks_in_state(HealthStatus::Warning)
            .unwrap()
            .into_iter()
            .map(|c| c.check_id)
            .collect();
        assert_eq!(warning, vec!["cpu", "mem"]);
    }

    #[test]
    fn node_checks_sorted_by_id() {
        let s = store();
        s.ensure_node(1, &node("foo", "127.0.0.1")).unwrap();
        s.ensure_check(2, &check("foo", "zz", HealthStatus::Passing, None)).unwrap();
        s.ensure_check(3, &check("foo", "aa", HealthStatus::Passing, None)).unwrap();
        let ids: Vec<_> = s.node_checks("foo").unwrap().into_iter().map(|c| c.check_id).collect();
        assert_eq!(ids, vec!["aa", "zz"]);
    }

    #[test]
    fn check_service_nodes_orders_service_checks_first() {
        let s = store();
        s.ensure_node(1, &node("foo", "127.0.0.1")).unwrap();
        s.ensure_service(2, "foo", &service("db", "db", Some("master"), 8000)).unwrap();
        s.ensure_service(3, "foo", &service("api", "api", None, 5000)).unwrap();
        s.ensure_check(4, &check("foo", SERF_CHECK_ID, HealthStatus::Passing, None)).unwrap();
        s.ensure_check(5, &check("foo", "db", HealthStatus::Warning, Some("db"))).unwrap();
        s.ensure_check(6, &check("foo", "api", HealthStatus::Critical, Some("api"))).unwrap();

        let nodes = s.check_service_nodes("db").unwrap();
        assert_eq!(nodes.len(), 1);
        let ids: Vec<_> = nodes[0].checks.iter().map(|c| c.check_id.as_str()).collect();
        assert_eq!(ids, vec!["db", SERF_CHECK_ID]);
        assert_eq!(nodes[0].node.address, "127.0.0.1");

        assert_eq!(s.check_service_tag_nodes("db", "master").unwrap().len(), 1);
        assert!(s.check_service_tag_nodes("db", "slave").unwrap().is_empty());
    }

    #[test]
    fn delete_service_drops_bound_checks() {
        let s = store();
        s.ensure_node(1, &node("foo", "127.0.0.1")).unwrap();
        s.ensure_service(2, "foo", &service("db", "db", None, 8000)).unwrap();
        s.ensure_check(3, &check("foo", "db", HealthStatus::Passing, Some("db"))).unwrap();
        s.ensure_check(4, &check("foo", "mem", HealthStatus::Passing, None)).unwrap();

        s.delete_node_service(5, "foo", "db").unwrap();
        let ids: Vec<_> = s.node_checks("foo").unwrap().into_iter().map(|c| c.check_id).collect();
        assert_eq!(ids, vec!["mem"]);
        assert!(s.service_nodes("db").unwrap().is_empty());
    }

    #[test]
    fn deletes_of_missing_keys_are_noops() {
        let s = store();
        s.delete_node(1, "ghost").unwrap();
        s.delete_node_service(2, "ghost", "db").unwrap();
        s.delete_node_check(3, "ghost", "mem").unwrap();
        assert_eq!(s.max_index(&Table::ALL).unwrap(), 0);
    }

    #[test]
    fn delete_node_cascades() {
        let s = store();
        s.ensure_node(1, &node("foo", "127.0.0.1")).unwrap();
        s.ensure_service(2, "foo", &service("db", "db", None, 8000)).unwrap();
        s.ensure_check(3, &check("foo", "db", HealthStatus::Passing, Some("db"))).unwrap();
        s.ensure_check(4, &check("foo", "mem", HealthStatus::Critical, None)).unwrap();

        s.delete_node(5, "foo").unwrap();
        assert_eq!(s.get_node("foo").unwrap(), None);
        assert_eq!(s.node_services("foo").unwrap(), None);
        assert!(s.node_checks("foo").unwrap().is_empty());
        assert!(s.service_nodes("db").unwrap().is_empty());
        assert!(s.checks_in_state(HealthStatus::Critical).unwrap().is_empty());
        assert_eq!(s.index(Table::Nodes).unwrap(), 5);
        assert_eq!(s.index(Table::Services).unwrap(), 5);
        assert_eq!(s.index(Table::Checks).unwrap(), 5);
    }

    #[test]
    fn registration_is_all_or_nothing() {
        let s = store();
        let req = RegisterRequest {
            datacenter: "dc1".into(),
            node: "foo".into(),
            address: "127.0.0.1".into(),
            service: None,
            check: Some(check("foo", "orphan", HealthStatus::Passing, Some("nope"))),
        };
        assert!(s.ensure_registration(1, &req).is_err());
        assert_eq!(s.get_node("foo").unwrap(), None);
    }

    #[test]
    fn registration_check_must_name_the_registering_node() {
        let s = store();
        s.ensure_node(1, &node("victim", "10.0.0.1")).unwrap();
        let req = RegisterRequest {
            datacenter: "dc1".into(),
            node: "attacker".into(),
            address: "10.0.0.2".into(),
            service: None,
            check: Some(check("victim", "fake", HealthStatus::Critical, None)),
        };
        assert!(matches!(s.ensure_registration(2, &req), Err(StateError::Invalid(_))));
        assert!(s.node_checks("victim").unwrap().is_empty());
        assert_eq!(s.get_node("attacker").unwrap(), None);
    }

    #[test]
    fn nul_in_names_is_rejected() {
        let s = store();
        s.ensure_node(1, &node("a", "10.0.0.1")).unwrap();
        s.ensure_node(2, &node("b", "10.0.0.2")).unwrap();
        s.ensure_service(3, "b", &service("web", "web", None, 80)).unwrap();

        let err = s.ensure_node(4, &node("a\0b", "10.0.0.3")).unwrap_err();
        assert!(matches!(err, StateError::Invalid(_)));
        let err = s.ensure_service(4, "a", &service("x\0web", "web", None, 80)).unwrap_err();
        assert!(matches!(err, StateError::Invalid(_)));
        let err = s.ensure_service(4, "a", &service("x", "w\0eb", None, 80)).unwrap_err();
        assert!(matches!(err, StateError::Invalid(_)));
        let err = s.ensure_check(4, &check("a", "c\0d", HealthStatus::Passing, None)).unwrap_err();
        assert!(matches!(err, StateError::Invalid(_)));

        s.delete_node(5, "a").unwrap();
        assert_eq!(s.get_node("b").unwrap(), Some(node("b", "10.0.0.2")));
        assert!(s.node_services("b").unwrap().unwrap().services.contains_key("web"));
        assert_eq!(s.service_nodes("web").unwrap().len(), 1);
        assert_eq!(s.index(Table::Nodes).unwrap(), 5);
    }

    #[test]
    fn deregister_precedence() {
        let s = store();
        let req = RegisterRequest {
            datacenter: "dc1".into(),
            node: "foo".into(),
            address: "127.0.0.1".into(),
            service: Some(service("db", "db", None, 8000)),
            check: Some(check("foo", "mem", HealthStatus::Passing, None)),
        };
        s.ensure_registration(1, &req).unwrap();

        s.deregister(
            2,
            &DeregisterRequest {
                datacenter: "dc1".into(),
                node: "foo".into(),
                service_id: Some("db".into()),
                check_id: Some("mem".into()),
            },
        )
        .unwrap();
        assert!(s.node_services("foo").unwrap().unwrap().services.is_empty());
        assert_eq!(s.node_checks("foo").unwrap().len(), 1);

        s.deregister(
            3,
            &DeregisterRequest {
                datacenter: "dc1".into(),
                node: "foo".into(),
                service_id: None,
                check_id: None,
            },
        )
        .unwrap();
        assert_eq!(s.get_node("foo").unwrap(), None);
    }

    #[test]
    fn snapshot_is_isolated_from_later_writes() {
        let s = store();
        s.ensure_node(1, &node("foo", "127.0.0.1")).unwrap();
        s.ensure_service(2, "foo", &service("db", "db", Some("master"), 8000)).unwrap();

        let snap = s.snapshot().unwrap();
        s.ensure_service(3, "foo", &service("db", "db", Some("slave"), 8001)).unwrap();
        s.ensure_node(4, &node("bar", "127.0.0.2")).unwrap();

        let old = snap.node_services("foo").unwrap().unwrap();
        assert_eq!(old.services["db"].tag.as_deref(), Some("master"));
        assert_eq!(snap.nodes().unwrap().len(), 1);

        let new = s.node_services("foo").unwrap().unwrap();
        assert_eq!(new.services["db"].tag.as_deref(), Some("slave"));
        assert_eq!(s.nodes().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn watch_fires_after_commit() {
        let s = store();
        let mut rx = s.watch(Table::Nodes);
        assert_eq!(*rx.borrow_and_update(), 0);
        s.ensure_node(7, &node("foo", "127.0.0.1")).unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 7);
    }

    #[test]
    fn failed_transaction_writes_nothing() {
        let s = store();
        s.ensure_node(1, &node("foo", "127.0.0.1")).unwrap();
        let ops = vec![
            KvsAtomicOp {
                verb: KvsAtomicVerb::Set,
                dir_ent: DirEntry {
                    key: "test".into(),
                    value: b"hello".to_vec(),
                    ..Default::default()
                },
            },
            KvsAtomicOp {
                verb: KvsAtomicVerb::Lock,
                dir_ent: DirEntry {
                    key: "locked".into(),
                    session: Some("no-such-session".into()),
                    ..Default::default()
                },
            },
        ];
        let resp = s.kvs_atomic(2, &ops).unwrap();
        assert!(resp.results.is_empty());
        assert_eq!(resp.errors.len(), 1);
        assert_eq!(resp.errors[0].op_index, 1);
        assert_eq!(s.kvs_get("test").unwrap(), None);
        assert_eq!(s.index(Table::Kvs).unwrap(), 0);
    }

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.redb");
        {
            let s = StateStore::open(&path).unwrap();
            s.ensure_node(9, &node("foo", "127.0.0.1")).unwrap();
            s.close();
        }
        let s = StateStore::open(&path).unwrap();
        assert_eq!(s.get_node("foo").unwrap().unwrap().address, "127.0.0.1");
        assert_eq!(s.index(Table::Nodes).unwrap(), 9);
        assert_eq!(*s.watch(Table::Nodes).borrow(), 9);
    }
}
