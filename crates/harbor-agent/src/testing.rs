//! Test doubles: an in-process server behind a client that can be made
//! unreachable or told to fail one method.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use harbor_cluster::membership::{ROLE_SERVER, TAG_DC, TAG_ROLE};
use harbor_cluster::{Member, StaticMembership};
use harbor_raft::InlineConsensus;
use harbor_rpc::{RpcClient, RpcError, RpcResult, RpcServer, ServerConfig};
use harbor_state::{RegisterRequest, StateStore};
use serde_json::Value;

use crate::local::{LocalConfig, LocalState};

pub(crate) struct MockServer {
    server: RpcServer,
    reachable: AtomicBool,
    fail: Mutex<Option<String>>,
    calls: Mutex<BTreeMap<String, usize>>,
}

impl MockServer {
    pub(crate) fn new() -> Arc<Self> {
        let store = StateStore::open_in_memory().unwrap();
        let consensus = InlineConsensus::new(store.clone(), "127.0.0.1:8300").unwrap();
        let membership = StaticMembership::new(
            Member::new("server1", "127.0.0.1", 8300)
                .with_tag(TAG_ROLE, ROLE_SERVER)
                .with_tag(TAG_DC, "dc1"),
        );
        let server = RpcServer::new(
            ServerConfig {
                datacenter: "dc1".into(),
                node_name: "server1".into(),
                rpc_addr: "127.0.0.1:8300".into(),
            },
            store,
            Arc::new(consensus),
            Arc::new(membership),
        );
        Arc::new(Self {
            server,
            reachable: AtomicBool::new(true),
            fail: Mutex::new(None),
            calls: Mutex::new(BTreeMap::new()),
        })
    }

    pub(crate) fn client(self: &Arc<Self>) -> Arc<dyn RpcClient> {
        self.clone()
    }

    pub(crate) fn store(&self) -> &StateStore {
        self.server.store()
    }

    pub(crate) fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub(crate) fn fail_method(&self, method: Option<&str>) {
        *self.fail.lock().unwrap() = method.map(String::from);
    }

    pub(crate) fn calls(&self, method: &str) -> usize {
        self.calls.lock().unwrap().get(method).copied().unwrap_or(0)
    }

    pub(crate) async fn register(&self, req: RegisterRequest) {
        self.server.catalog_register(req).await.unwrap();
    }
}

#[async_trait]
impl RpcClient for MockServer {
    async fn call_raw(&self, method: &str, args: Value) -> RpcResult<Value> {
        *self.calls.lock().unwrap().entry(method.to_string()).or_default() += 1;
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(RpcError::NoServers);
        }
        if self.fail.lock().unwrap().as_deref() == Some(method) {
            return Err(RpcError::Remote(format!("{method} failed")));
        }
        self.server.dispatch(method, args).await
    }
}

pub(crate) fn config(check_update_interval: Duration) -> LocalConfig {
    LocalConfig {
        datacenter: "dc1".into(),
        node_name: "agent1".into(),
        advertise_addr: "10.0.0.5".into(),
        ae_interval: Duration::from_secs(60),
        check_update_interval,
        discard_check_output: false,
    }
}

pub(crate) fn local_state(server: &Arc<MockServer>, check_update_interval: Duration) -> Arc<LocalState> {
    LocalState::new(config(check_update_interval), server.client())
}
