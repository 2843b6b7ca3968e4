//! The agent's local view of its services and checks, and the diff
//! against the catalog that anti-entropy acts on.
//!
//! Every mutation goes through one mutex and ends by poking the sync
//! trigger. The trigger is a channel of capacity one written with
//! `try_send`, so a burst of mutations wakes the sync loop once. The
//! pause flag lives outside the mutex: check callbacks take the mutex,
//! and `pause` must never wait on them.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use harbor_cluster::random_stagger;
use harbor_health::CheckNotifier;
use harbor_rpc::{RpcClient, call};
use harbor_state::{
    CLUSTER_SERVICE_ID, DeregisterRequest, HealthCheck, HealthStatus, IndexedHealthChecks,
    IndexedNodeServices, NodeService, NodeSpecificRequest, RegisterRequest, SERF_CHECK_ID,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{AgentError, AgentResult};

/// Identity and tuning of the local agent.
#[derive(Debug, Clone)]
pub struct LocalConfig {
    pub datacenter: String,
    pub node_name: String,
    pub advertise_addr: String,
    /// Base interval between full syncs.
    pub ae_interval: Duration,
    /// When non-zero, output-only check changes are batched over roughly
    /// this long instead of syncing on every probe.
    pub check_update_interval: Duration,
    pub discard_check_output: bool,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            datacenter: "dc1".to_string(),
            node_name: String::new(),
            advertise_addr: String::new(),
            ae_interval: Duration::from_secs(60),
            check_update_interval: Duration::from_secs(5 * 60),
            discard_check_output: false,
        }
    }
}

/// Where a local entry stands relative to the catalog.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStatus {
    pub in_sync: bool,
    /// Exists remotely but not locally; needs a deregister.
    pub remote_delete: bool,
}

impl SyncStatus {
    const DIRTY: SyncStatus = SyncStatus {
        in_sync: false,
        remote_delete: false,
    };
    const DELETE: SyncStatus = SyncStatus {
        in_sync: false,
        remote_delete: true,
    };
    const CLEAN: SyncStatus = SyncStatus {
        in_sync: true,
        remote_delete: false,
    };
}

/// A check currently critical, and since when.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CriticalCheck {
    pub check: HealthCheck,
    pub critical_for: Duration,
}

/// Counts reported by the agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LocalStats {
    pub services: usize,
    pub checks: usize,
    pub out_of_sync: usize,
}

#[derive(Default)]
struct Inner {
    services: BTreeMap<String, NodeService>,
    service_status: BTreeMap<String, SyncStatus>,
    checks: BTreeMap<String, HealthCheck>,
    check_status: BTreeMap<String, SyncStatus>,
    critical_since: BTreeMap<String, Instant>,
    /// Pending write-backs of output-only check changes.
    deferred: BTreeMap<String, JoinHandle<()>>,
    node_info_in_sync: bool,
}

/// One unit of work for [`LocalState::sync_changes`].
enum SyncOp {
    DeleteService(String),
    Service(NodeService),
    DeleteCheck(String),
    Check(HealthCheck),
}

pub struct LocalState {
    config: LocalConfig,
    client: Arc<dyn RpcClient>,
    me: Weak<LocalState>,
    inner: Mutex<Inner>,
    paused: AtomicBool,
    trigger_tx: mpsc::Sender<()>,
    pub(crate) trigger_rx: tokio::sync::Mutex<mpsc::Receiver<()>>,
}

impl LocalState {
    pub fn new(config: LocalConfig, client: Arc<dyn RpcClient>) -> Arc<Self> {
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        Arc::new_cyclic(|me| Self {
            config,
            client,
            me: me.clone(),
            inner: Mutex::new(Inner::default()),
            paused: AtomicBool::new(false),
            trigger_tx,
            trigger_rx: tokio::sync::Mutex::new(trigger_rx),
        })
    }

    pub fn config(&self) -> &LocalConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wake the sync loop. Coalesces with a wake-up already pending.
    pub fn trigger_sync(&self) {
        let _ = self.trigger_tx.try_send(());
    }

    /// Stop syncing changes until [`resume`](Self::resume). Must not be
    /// called while holding the state lock.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.trigger_sync();
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    // ── Local mutations ────────────────────────────────────────────

    pub fn add_service(&self, mut service: NodeService) {
        if service.id.is_empty() {
            service.id = service.service.clone();
        }
        let mut inner = self.lock();
        inner.service_status.insert(service.id.clone(), SyncStatus::DIRTY);
        inner.services.insert(service.id.clone(), service);
        drop(inner);
        self.trigger_sync();
    }

    pub fn remove_service(&self, service_id: &str) {
        let mut inner = self.lock();
        inner.services.remove(service_id);
        inner.service_status.insert(service_id.to_string(), SyncStatus::DELETE);
        drop(inner);
        self.trigger_sync();
    }

    /// Track a check. A check bound to a service needs that service
    /// registered locally first.
    pub fn add_check(&self, mut check: HealthCheck) -> AgentResult<()> {
        if check.check_id.is_empty() {
            check.check_id = check.name.clone();
        }
        if check.check_id.is_empty() {
            return Err(AgentError::Invalid("check needs a name or id".into()));
        }
        check.node = self.config.node_name.clone();
        if self.config.discard_check_output {
            check.output.clear();
        }

        let mut inner = self.lock();
        if let Some(service_id) = check.service_id.as_deref().filter(|s| !s.is_empty()) {
            let Some(service) = inner.services.get(service_id) else {
                return Err(AgentError::UnknownService {
                    check_id: check.check_id,
                    service_id: service_id.to_string(),
                });
            };
            check.service_name = Some(service.service.clone());
        } else {
            check.service_id = None;
            check.service_name = None;
        }

        let id = check.check_id.clone();
        if check.status == HealthStatus::Critical {
            inner.critical_since.entry(id.clone()).or_insert_with(Instant::now);
        } else {
            inner.critical_since.remove(&id);
        }
        inner.check_status.insert(id.clone(), SyncStatus::DIRTY);
        inner.checks.insert(id, check);
        drop(inner);
        self.trigger_sync();
        Ok(())
    }

    pub fn remove_check(&self, check_id: &str) {
        let mut inner = self.lock();
        inner.checks.remove(check_id);
        inner.critical_since.remove(check_id);
        if let Some(timer) = inner.deferred.remove(check_id) {
            timer.abort();
        }
        inner.check_status.insert(check_id.to_string(), SyncStatus::DELETE);
        drop(inner);
        self.trigger_sync();
    }

    /// Record a probe result. Repeating the stored status and output is a
    /// no-op. With a check update interval, an output-only change is kept
    /// locally and marked for sync later by a timer.
    pub fn update_check(&self, check_id: &str, status: HealthStatus, output: &str) {
        let output = if self.config.discard_check_output { "" } else { output };
        let mut inner = self.lock();
        let Some(check) = inner.checks.get_mut(check_id) else {
            return;
        };
        if check.status == status && check.output == output {
            return;
        }

        let interval = self.config.check_update_interval;
        if !interval.is_zero() && check.status == status {
            check.output = output.to_string();
            if !inner.deferred.contains_key(check_id) {
                let delay = interval / 2 + random_stagger(interval);
                let handle = self.spawn_deferred_sync(check_id.to_string(), delay);
                inner.deferred.insert(check_id.to_string(), handle);
            }
            return;
        }

        check.status = status;
        check.output = output.to_string();
        if status == HealthStatus::Critical {
            inner
                .critical_since
                .entry(check_id.to_string())
                .or_insert_with(Instant::now);
        } else {
            inner.critical_since.remove(check_id);
        }
        inner.check_status.insert(check_id.to_string(), SyncStatus::DIRTY);
        drop(inner);
        debug!(check_id = %check_id, %status, "check status changed");
        self.trigger_sync();
    }

    fn spawn_deferred_sync(&self, check_id: String, delay: Duration) -> JoinHandle<()> {
        let me = self.me.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(state) = me.upgrade() else {
                return;
            };
            let mut inner = state.lock();
            inner.deferred.remove(&check_id);
            if inner.checks.contains_key(&check_id) {
                inner.check_status.insert(check_id, SyncStatus::DIRTY);
                drop(inner);
                state.trigger_sync();
            }
        })
    }

    // ── Reads ──────────────────────────────────────────────────────

    pub fn services(&self) -> BTreeMap<String, NodeService> {
        self.lock().services.clone()
    }

    pub fn service(&self, service_id: &str) -> Option<NodeService> {
        self.lock().services.get(service_id).cloned()
    }

    pub fn checks(&self) -> BTreeMap<String, HealthCheck> {
        self.lock().checks.clone()
    }

    pub fn check(&self, check_id: &str) -> Option<HealthCheck> {
        self.lock().checks.get(check_id).cloned()
    }

    /// Checks currently critical, with how long each has been.
    pub fn critical_checks(&self) -> BTreeMap<String, CriticalCheck> {
        let inner = self.lock();
        let now = Instant::now();
        inner
            .critical_since
            .iter()
            .filter_map(|(id, since)| {
                let check = inner.checks.get(id)?;
                (check.status == HealthStatus::Critical).then(|| {
                    (
                        id.clone(),
                        CriticalCheck {
                            check: check.clone(),
                            critical_for: now.duration_since(*since),
                        },
                    )
                })
            })
            .collect()
    }

    pub fn stats(&self) -> LocalStats {
        let inner = self.lock();
        let dirty = |s: &BTreeMap<String, SyncStatus>| s.values().filter(|s| !s.in_sync).count();
        LocalStats {
            services: inner.services.len(),
            checks: inner.checks.len(),
            out_of_sync: dirty(&inner.service_status) + dirty(&inner.check_status),
        }
    }

    pub fn service_status(&self, service_id: &str) -> Option<SyncStatus> {
        self.lock().service_status.get(service_id).copied()
    }

    pub fn check_status(&self, check_id: &str) -> Option<SyncStatus> {
        self.lock().check_status.get(check_id).copied()
    }

    // ── Sync with the catalog ─────────────────────────────────────

    fn node_request(&self) -> NodeSpecificRequest {
        NodeSpecificRequest {
            datacenter: self.config.datacenter.clone(),
            node: self.config.node_name.clone(),
            ..Default::default()
        }
    }

    /// Pull this node's services and checks from the catalog and mark
    /// every entry by whether it matches.
    pub async fn set_sync_state(&self) -> AgentResult<()> {
        let req = self.node_request();
        let services: IndexedNodeServices =
            call(self.client.as_ref(), "Catalog.NodeServices", &req).await?;
        let checks: IndexedHealthChecks =
            call(self.client.as_ref(), "Health.NodeChecks", &req).await?;

        let (remote_node, remote_services) = match services.node_services {
            Some(ns) => (Some(ns.node), ns.services),
            None => (None, BTreeMap::new()),
        };
        let remote_checks: BTreeMap<String, HealthCheck> = checks
            .checks
            .into_iter()
            .map(|c| (c.check_id.clone(), c))
            .collect();
        let ignore_output = !self.config.check_update_interval.is_zero();

        let mut inner = self.lock();
        let inner = &mut *inner;
        inner.node_info_in_sync =
            remote_node.is_some_and(|n| n.address == self.config.advertise_addr);

        inner.service_status.clear();
        for (id, local) in &inner.services {
            let status = if remote_services.get(id) == Some(local) {
                SyncStatus::CLEAN
            } else {
                SyncStatus::DIRTY
            };
            inner.service_status.insert(id.clone(), status);
        }
        for id in remote_services.keys() {
            if id != CLUSTER_SERVICE_ID && !inner.services.contains_key(id) {
                inner.service_status.insert(id.clone(), SyncStatus::DELETE);
            }
        }

        inner.check_status.clear();
        for (id, local) in &inner.checks {
            let same = remote_checks.get(id).is_some_and(|remote| {
                if ignore_output {
                    let mut remote = remote.clone();
                    remote.output.clone_from(&local.output);
                    &remote == local
                } else {
                    remote == local
                }
            });
            let status = if same { SyncStatus::CLEAN } else { SyncStatus::DIRTY };
            inner.check_status.insert(id.clone(), status);
        }
        for id in remote_checks.keys() {
            if id != SERF_CHECK_ID && !inner.checks.contains_key(id) {
                inner.check_status.insert(id.clone(), SyncStatus::DELETE);
            }
        }
        debug!(
            node_in_sync = inner.node_info_in_sync,
            services = inner.services.len(),
            checks = inner.checks.len(),
            "full sync state computed"
        );
        Ok(())
    }

    /// Work out what `sync_changes` must send: services first, then checks,
    /// each in id order.
    fn pending_ops(&self) -> (Vec<SyncOp>, bool) {
        let inner = self.lock();
        let mut ops = Vec::new();
        for (id, status) in &inner.service_status {
            if status.remote_delete {
                ops.push(SyncOp::DeleteService(id.clone()));
            } else if !status.in_sync {
                if let Some(svc) = inner.services.get(id) {
                    ops.push(SyncOp::Service(svc.clone()));
                }
            }
        }
        for (id, status) in &inner.check_status {
            if status.remote_delete {
                ops.push(SyncOp::DeleteCheck(id.clone()));
            } else if !status.in_sync {
                if let Some(check) = inner.checks.get(id) {
                    ops.push(SyncOp::Check(check.clone()));
                }
            }
        }
        (ops, inner.node_info_in_sync)
    }

    /// Push every out-of-sync entry to the catalog. Stops at the first
    /// failure; the failed entry stays out of sync for the next pass.
    pub async fn sync_changes(&self) -> AgentResult<()> {
        let (ops, node_in_sync) = self.pending_ops();
        for op in ops {
            match op {
                SyncOp::DeleteService(id) => self.delete_service(id).await?,
                SyncOp::Service(svc) => self.sync_service(svc).await?,
                SyncOp::DeleteCheck(id) => self.delete_check(id).await?,
                SyncOp::Check(check) => self.sync_check(check).await?,
            }
        }
        if !node_in_sync {
            self.sync_node_info().await?;
        }
        Ok(())
    }

    fn register_request(&self) -> RegisterRequest {
        RegisterRequest {
            datacenter: self.config.datacenter.clone(),
            node: self.config.node_name.clone(),
            address: self.config.advertise_addr.clone(),
            service: None,
            check: None,
        }
    }

    fn deregister_request(&self) -> DeregisterRequest {
        DeregisterRequest {
            datacenter: self.config.datacenter.clone(),
            node: self.config.node_name.clone(),
            service_id: None,
            check_id: None,
        }
    }

    async fn delete_service(&self, id: String) -> AgentResult<()> {
        let req = DeregisterRequest {
            service_id: Some(id.clone()),
            ..self.deregister_request()
        };
        call::<_, _, ()>(self.client.as_ref(), "Catalog.Deregister", &req)
            .await
            .inspect_err(|e| warn!(service_id = %id, error = %e, "failed to deregister service"))?;
        let mut inner = self.lock();
        if !inner.services.contains_key(&id) {
            inner.service_status.remove(&id);
        }
        info!(service_id = %id, "deregistered service");
        Ok(())
    }

    async fn sync_service(&self, svc: NodeService) -> AgentResult<()> {
        let req = RegisterRequest {
            service: Some(svc.clone()),
            ..self.register_request()
        };
        call::<_, _, ()>(self.client.as_ref(), "Catalog.Register", &req)
            .await
            .inspect_err(|e| warn!(service_id = %svc.id, error = %e, "failed to sync service"))?;
        let mut inner = self.lock();
        // A service registered implicitly registers the node.
        inner.node_info_in_sync = true;
        if inner.services.get(&svc.id) == Some(&svc) {
            inner.service_status.insert(svc.id.clone(), SyncStatus::CLEAN);
        }
        info!(service_id = %svc.id, "synced service");
        Ok(())
    }

    async fn delete_check(&self, id: String) -> AgentResult<()> {
        let req = DeregisterRequest {
            check_id: Some(id.clone()),
            ..self.deregister_request()
        };
        call::<_, _, ()>(self.client.as_ref(), "Catalog.Deregister", &req)
            .await
            .inspect_err(|e| warn!(check_id = %id, error = %e, "failed to deregister check"))?;
        let mut inner = self.lock();
        if !inner.checks.contains_key(&id) {
            inner.check_status.remove(&id);
        }
        info!(check_id = %id, "deregistered check");
        Ok(())
    }

    async fn sync_check(&self, check: HealthCheck) -> AgentResult<()> {
        let req = RegisterRequest {
            check: Some(check.clone()),
            ..self.register_request()
        };
        call::<_, _, ()>(self.client.as_ref(), "Catalog.Register", &req)
            .await
            .inspect_err(|e| warn!(check_id = %check.check_id, error = %e, "failed to sync check"))?;
        let mut inner = self.lock();
        inner.node_info_in_sync = true;
        if inner.checks.get(&check.check_id) == Some(&check) {
            inner
                .check_status
                .insert(check.check_id.clone(), SyncStatus::CLEAN);
            if let Some(timer) = inner.deferred.remove(&check.check_id) {
                timer.abort();
            }
        }
        info!(check_id = %check.check_id, "synced check");
        Ok(())
    }

    async fn sync_node_info(&self) -> AgentResult<()> {
        call::<_, _, ()>(self.client.as_ref(), "Catalog.Register", &self.register_request())
            .await
            .inspect_err(|e| warn!(error = %e, "failed to sync node info"))?;
        self.lock().node_info_in_sync = true;
        info!(node = %self.config.node_name, "synced node info");
        Ok(())
    }
}

impl CheckNotifier for LocalState {
    fn update_check(&self, check_id: &str, status: HealthStatus, output: &str) {
        LocalState::update_check(self, check_id, status, output);
    }
}

impl Drop for LocalState {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(|e| e.into_inner());
        for (_, timer) in std::mem::take(&mut inner.deferred) {
            timer.abort();
        }
    }
}
