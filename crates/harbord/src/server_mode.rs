//! Server mode: catalog replica, RPC endpoints, leader reconciliation and
//! a local agent, all behind one HTTP listener.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use harbor_cluster::membership::{
    ROLE_SERVER, TAG_BOOTSTRAP, TAG_DC, TAG_PORT, TAG_RAFT_ID, TAG_ROLE,
};
use harbor_cluster::{Member, StaticMembership};
use harbor_raft::{
    CatalogFsm, Consensus, HarborRaft, InlineConsensus, LogStore, NetworkFactory, NodeIdMap,
    RaftConsensus, raft_routes,
};
use harbor_rpc::{RpcClient, RpcServer, ServerConfig, rpc_routes};
use harbor_state::{CLUSTER_SERVICE_ID, CLUSTER_SERVICE_NAME, NodeService, StateStore};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::agent_mode::{HEARTBEAT_INTERVAL, build_agent};
use crate::config::DaemonConfig;
use crate::membership_http::{membership_routes, run_heartbeat_loop};

/// How often the leader reconciles membership even without changes.
const RECONCILE_INTERVAL: Duration = Duration::from_secs(60);

/// Consensus plus the raft handle when running replicated.
struct Replication {
    consensus: Arc<dyn Consensus>,
    raft: Option<HarborRaft>,
    raft_id: u64,
}

async fn open_raft(config: &DaemonConfig, store: &StateStore) -> anyhow::Result<Replication> {
    let db_path = config.data_dir.join("raft.redb");
    let db = Arc::new(redb::Database::create(&db_path)?);
    info!(path = ?db_path, "raft store opened");

    let raft_id = match config.raft_id {
        Some(id) => id,
        None => NodeIdMap::open(db.clone())?.get_or_insert(&config.node_name)?,
    };

    let raft_config = openraft::Config {
        cluster_name: "harbor".to_string(),
        heartbeat_interval: 500,
        election_timeout_min: 1500,
        election_timeout_max: 3000,
        ..Default::default()
    }
    .validate()?;

    let log_store = LogStore::open(db)?;
    let fsm = CatalogFsm::new(store.clone());
    let raft = openraft::Raft::new(
        raft_id,
        Arc::new(raft_config),
        NetworkFactory,
        log_store,
        fsm,
    )
    .await?;
    info!(raft_id, "raft node initialized");

    let consensus = RaftConsensus::new(raft.clone(), raft_id);
    if config.bootstrap {
        consensus.bootstrap(&config.rpc_addr()).await?;
    }
    Ok(Replication {
        consensus: Arc::new(consensus),
        raft: Some(raft),
        raft_id,
    })
}

fn local_member(config: &DaemonConfig, raft_id: u64) -> Member {
    let mut member = Member::new(&config.node_name, &config.advertise_addr, config.bind_port)
        .with_tag(TAG_ROLE, ROLE_SERVER)
        .with_tag(TAG_DC, &config.datacenter)
        .with_tag(TAG_PORT, config.bind_port.to_string())
        .with_tag(TAG_RAFT_ID, raft_id.to_string());
    if config.bootstrap {
        member = member.with_tag(TAG_BOOTSTRAP, "1");
    }
    member
}

/// Everything a running server is made of, before it starts serving.
pub struct Server {
    pub rpc: Arc<RpcServer>,
    pub membership: Arc<StaticMembership>,
    pub raft: Option<HarborRaft>,
    pub raft_id: u64,
}

impl Server {
    /// Open storage and consensus. `dev` keeps the catalog in memory and
    /// commits writes without raft.
    pub async fn open(config: &DaemonConfig, dev: bool) -> anyhow::Result<Self> {
        let (store, replication) = if dev {
            let store = StateStore::open_in_memory()?;
            let consensus = InlineConsensus::new(store.clone(), config.rpc_addr())?;
            info!("dev mode: in-memory catalog, no replication");
            let replication = Replication {
                consensus: Arc::new(consensus),
                raft: None,
                raft_id: 1,
            };
            (store, replication)
        } else {
            std::fs::create_dir_all(&config.data_dir)?;
            let db_path = config.data_dir.join("catalog.redb");
            let store = StateStore::open(&db_path)?;
            info!(path = ?db_path, "catalog opened");
            let replication = open_raft(config, &store).await?;
            (store, replication)
        };

        let membership = Arc::new(StaticMembership::new(local_member(
            config,
            replication.raft_id,
        )));
        let rpc = Arc::new(RpcServer::new(
            ServerConfig {
                datacenter: config.datacenter.clone(),
                node_name: config.node_name.clone(),
                rpc_addr: config.rpc_addr(),
            },
            store,
            replication.consensus,
            membership.clone(),
        ));
        Ok(Self {
            rpc,
            membership,
            raft: replication.raft,
            raft_id: replication.raft_id,
        })
    }

    pub fn router(&self) -> Router {
        let router = rpc_routes(self.rpc.clone()).merge(membership_routes(self.membership.clone()));
        match &self.raft {
            Some(raft) => router.merge(raft_routes(raft.clone())),
            None => router,
        }
    }
}

pub async fn run(config: DaemonConfig, dev: bool) -> anyhow::Result<()> {
    info!(node = %config.node_name, dc = %config.datacenter, dev, "harbor server starting");
    let server = Server::open(&config, dev).await?;

    // The local agent talks to this server in-process.
    let client: Arc<dyn RpcClient> = server.rpc.clone();
    let agent = build_agent(&config, client)?;
    agent.add_service(
        NodeService {
            id: CLUSTER_SERVICE_ID.to_string(),
            service: CLUSTER_SERVICE_NAME.to_string(),
            tag: None,
            port: config.bind_port,
        },
        None,
    )?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let leader_handle = tokio::spawn(
        server
            .rpc
            .clone()
            .run_leader_loop(RECONCILE_INTERVAL, shutdown_rx.clone()),
    );
    let heartbeat_handle = tokio::spawn(run_heartbeat_loop(
        server.membership.clone(),
        config.join.clone(),
        HEARTBEAT_INTERVAL,
        shutdown_rx.clone(),
    ));
    let ae_handle = agent.start(server.membership.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.bind_port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, rpc_addr = %config.rpc_addr(), "rpc listener starting");

    axum::serve(listener, server.router())
        .with_graceful_shutdown(crate::shutdown_signal(shutdown_tx))
        .await?;

    agent.shutdown();
    let _ = ae_handle.await;
    let _ = leader_handle.await;
    let _ = heartbeat_handle.await;

    if let Some(raft) = server.raft {
        if let Err(e) = raft.shutdown().await {
            warn!(error = %e, "raft shutdown failed");
        }
    }

    info!("harbor server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use harbor_cluster::{Membership, ServerParts};
    use harbor_state::Table;
    use http_body_util::BodyExt;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    fn dev_config() -> DaemonConfig {
        DaemonConfig {
            node_name: "srv1".into(),
            server: true,
            ..Default::default()
        }
    }

    async fn rpc(router: Router, method: &str, body: Value) -> Value {
        let resp = router
            .oneshot(
                Request::post(format!("/rpc/{method}"))
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn server_member_advertises_its_parts() {
        let mut config = dev_config();
        config.bootstrap = true;
        let parts = ServerParts::from_member(&local_member(&config, 42)).unwrap();
        assert_eq!(parts.rpc_addr, "127.0.0.1:8300");
        assert_eq!(parts.raft_id, 42);
        assert!(parts.bootstrap && parts.voter);
    }

    #[tokio::test]
    async fn dev_server_reconciles_itself_and_serves_rpc() {
        let server = Server::open(&dev_config(), true).await.unwrap();
        assert!(server.raft.is_none());

        server.rpc.reconcile().await.unwrap();
        let services = server.rpc.store().node_services("srv1").unwrap().unwrap();
        assert!(services.services.contains_key(CLUSTER_SERVICE_ID));

        let reply = rpc(server.router(), "Catalog.ListNodes", json!({"datacenter": "dc1"})).await;
        assert_eq!(reply["result"]["nodes"][0]["node"], "srv1");

        let reply = rpc(server.router(), "Status.Leader", Value::Null).await;
        assert_eq!(reply["result"], "127.0.0.1:8300");
        assert_eq!(server.membership.lan_members().len(), 1);
        assert!(server.rpc.store().max_index(&Table::ALL).unwrap() > 0);
    }

    #[tokio::test]
    async fn persistent_server_bootstraps_raft() {
        let dir = tempfile::tempdir().unwrap();
        let config = DaemonConfig {
            data_dir: dir.path().to_path_buf(),
            bootstrap: true,
            ..dev_config()
        };
        let server = Server::open(&config, false).await.unwrap();
        let raft = server.raft.clone().unwrap();
        raft.wait(Some(Duration::from_secs(10)))
            .current_leader(server.raft_id, "single voter elects itself")
            .await
            .unwrap();
        assert!(server.rpc.consensus().is_leader());
        raft.shutdown().await.unwrap();
    }
}
