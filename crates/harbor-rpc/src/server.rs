//! The endpoint host: forwarding, the write path and method dispatch.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use harbor_cluster::Membership;
use harbor_raft::{Command, CommandResponse, Consensus};
use harbor_state::{QueryOptions, StateStore};
use rand::seq::SliceRandom;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, error};

use crate::blocking::query_wait_bound;
use crate::client::{DEFAULT_RPC_TIMEOUT, RpcClient, call_addr, decode, encode};
use crate::error::{RpcError, RpcResult};

/// Identity of the local server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub datacenter: String,
    pub node_name: String,
    /// `host:port` other members use for RPC and raft.
    pub rpc_addr: String,
}

/// Serves every `Service.Method` of one server.
pub struct RpcServer {
    pub(crate) config: ServerConfig,
    pub(crate) store: StateStore,
    pub(crate) consensus: Arc<dyn Consensus>,
    pub(crate) membership: Arc<dyn Membership>,
}

impl RpcServer {
    pub fn new(
        config: ServerConfig,
        store: StateStore,
        consensus: Arc<dyn Consensus>,
        membership: Arc<dyn Membership>,
    ) -> Self {
        Self {
            config,
            store,
            consensus,
            membership,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn consensus(&self) -> &Arc<dyn Consensus> {
        &self.consensus
    }

    /// Send the request where it belongs. `Ok(None)` means this server
    /// handles it. `read` carries the query options of read endpoints;
    /// stale reads stay local on any server of the right datacenter.
    pub(crate) async fn forward<Req, Resp>(
        &self,
        method: &str,
        datacenter: &str,
        read: Option<&QueryOptions>,
        args: &Req,
    ) -> RpcResult<Option<Resp>>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let timeout = forward_timeout(read);

        if !datacenter.is_empty() && datacenter != self.config.datacenter {
            let servers = self.membership.servers(datacenter);
            let server = servers
                .choose(&mut rand::thread_rng())
                .ok_or_else(|| RpcError::NoDcPath(datacenter.to_string()))?;
            debug!(method, %datacenter, server = %server.name, "forwarding to datacenter");
            return call_addr(&server.rpc_addr, method, args, timeout).await.map(Some);
        }

        if read.is_some_and(|o| o.allow_stale) || self.consensus.is_leader() {
            return Ok(None);
        }
        let leader = self.consensus.leader().ok_or(RpcError::NoLeader)?;
        if leader.addr == self.config.rpc_addr {
            // Leadership is changing hands; let the log decide.
            return Ok(None);
        }
        debug!(method, leader = %leader.addr, "forwarding to leader");
        call_addr(&leader.addr, method, args, timeout).await.map(Some)
    }

    /// Commit `cmd` and unwrap the state machine's answer. A committed
    /// command the FSM refused comes back as [`RpcError::Apply`].
    pub(crate) async fn raft_apply(&self, cmd: Command) -> RpcResult<CommandResponse> {
        let kind = cmd.kind();
        match self.consensus.apply(cmd).await {
            Ok(CommandResponse::Error(msg)) => Err(RpcError::Apply(msg)),
            Ok(resp) => Ok(resp),
            Err(e) => {
                error!(kind, error = %e, "raft apply failed");
                Err(e.into())
            }
        }
    }

    /// Decode `args`, run the named method, encode its reply.
    pub async fn dispatch(&self, method: &str, args: Value) -> RpcResult<Value> {
        macro_rules! route {
            ($handler:ident) => {{
                let reply = self.$handler(decode(args)?).await?;
                encode(&reply)
            }};
        }

        match method {
            "Catalog.Register" => route!(catalog_register),
            "Catalog.Deregister" => route!(catalog_deregister),
            "Catalog.ListDatacenters" => route!(catalog_list_datacenters),
            "Catalog.ListNodes" => route!(catalog_list_nodes),
            "Catalog.ListServices" => route!(catalog_list_services),
            "Catalog.ServiceNodes" => route!(catalog_service_nodes),
            "Catalog.NodeServices" => route!(catalog_node_services),

            "Health.NodeChecks" => route!(health_node_checks),
            "Health.ServiceChecks" => route!(health_service_checks),
            "Health.ChecksInState" => route!(health_checks_in_state),
            "Health.ServiceNodes" => route!(health_service_nodes),

            "KVS.Apply" => route!(kvs_apply),
            "KVS.Get" => route!(kvs_get),
            "KVS.List" => route!(kvs_list),
            "KVS.ListKeys" => route!(kvs_list_keys),
            "Txn.Apply" => route!(txn_apply),

            "Session.Apply" => route!(session_apply),
            "Session.Get" => route!(session_get),
            "Session.List" => route!(session_list),
            "Session.NodeSessions" => route!(session_node_sessions),

            "Coordinate.Update" => route!(coordinate_update),
            "Coordinate.Get" => route!(coordinate_get),

            "Status.Ping" => route!(status_ping),
            "Status.Leader" => route!(status_leader),
            "Status.Peers" => route!(status_peers),

            other => Err(RpcError::UnknownMethod(other.to_string())),
        }
    }
}

/// In-process calls, used by the agent that runs next to a server.
#[async_trait]
impl RpcClient for RpcServer {
    async fn call_raw(&self, method: &str, args: Value) -> RpcResult<Value> {
        self.dispatch(method, args).await
    }
}

fn forward_timeout(read: Option<&QueryOptions>) -> Duration {
    match read {
        Some(opts) if opts.min_query_index > 0 => query_wait_bound(opts) + DEFAULT_RPC_TIMEOUT,
        _ => DEFAULT_RPC_TIMEOUT,
    }
}
