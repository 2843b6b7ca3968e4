//! Shared fixtures for unit tests: a single-server dc1 on an inline log.

use std::sync::Arc;

use harbor_cluster::membership::{TAG_DC, TAG_RAFT_ID, TAG_ROLE, ROLE_SERVER};
use harbor_cluster::{Member, StaticMembership};
use harbor_raft::InlineConsensus;
use harbor_state::{RegisterRequest, StateStore};

use crate::server::{RpcServer, ServerConfig};

pub(crate) const TEST_ADDR: &str = "127.0.0.1:8300";

pub(crate) fn local_member() -> Member {
    Member::new("server1", "127.0.0.1", 8300)
        .with_tag(TAG_ROLE, ROLE_SERVER)
        .with_tag(TAG_DC, "dc1")
        .with_tag(TAG_RAFT_ID, "1")
}

pub(crate) fn test_server() -> RpcServer {
    test_server_with(Arc::new(StaticMembership::new(local_member())))
}

pub(crate) fn test_server_with(membership: Arc<StaticMembership>) -> RpcServer {
    let store = StateStore::open_in_memory().unwrap();
    let consensus = InlineConsensus::new(store.clone(), TEST_ADDR).unwrap();
    RpcServer::new(
        ServerConfig {
            datacenter: "dc1".into(),
            node_name: "server1".into(),
            rpc_addr: TEST_ADDR.into(),
        },
        store,
        Arc::new(consensus),
        membership,
    )
}

pub(crate) async fn register_node(server: &RpcServer, node: &str, addr: &str) {
    server
        .catalog_register(RegisterRequest {
            datacenter: "dc1".into(),
            node: node.into(),
            address: addr.into(),
            ..Default::default()
        })
        .await
        .unwrap();
}
