//! Raft network layer over HTTP/JSON.
//!
//! Implements `RaftNetworkFactory` and `RaftNetwork` so openraft can reach
//! its peers, and [`raft_routes`] which serves the same three calls on the
//! receiving side. Each reply body is the JSON of
//! `Result<Response, RaftError>` so remote raft errors come back typed.

use std::time::Duration;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use openraft::BasicNode;
use openraft::error::{InstallSnapshotError, RPCError, RaftError, RemoteError, Unreachable};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::command::{HarborRaft, TypeConfig};
use crate::transport::post_json;

pub const APPEND_PATH: &str = "/raft/append";
pub const VOTE_PATH: &str = "/raft/vote";
pub const SNAPSHOT_PATH: &str = "/raft/snapshot";

/// Upper bound on a single raft RPC when openraft gives no hard TTL.
const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// Factory that creates per-peer connections.
#[derive(Debug, Clone, Default)]
pub struct NetworkFactory;

/// A peer address. Every call opens its own HTTP connection.
pub struct NetworkConnection {
    target: u64,
    addr: String,
}

impl NetworkConnection {
    async fn call<Req, Resp, E>(
        &self,
        path: &str,
        rpc: &Req,
        option: &RPCOption,
    ) -> Result<Resp, RPCError<u64, BasicNode, RaftError<u64, E>>>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
        E: std::error::Error + DeserializeOwned,
    {
        let timeout = option.hard_ttl().min(DEFAULT_RPC_TIMEOUT);
        let reply: Result<Resp, RaftError<u64, E>> = post_json(&self.addr, path, rpc, timeout)
            .await
            .map_err(|e| {
                warn!(target_node = self.target, addr = %self.addr, path, error = %e, "raft rpc failed");
                RPCError::Unreachable(Unreachable::new(&std::io::Error::other(format!(
                    "raft rpc to node {} ({}): {e}",
                    self.target, self.addr
                ))))
            })?;
        reply.map_err(|err| RPCError::RemoteError(RemoteError::new(self.target, err)))
    }
}

impl RaftNetworkFactory<TypeConfig> for NetworkFactory {
    type Network = NetworkConnection;

    async fn new_client(&mut self, target: u64, node: &BasicNode) -> Self::Network {
        debug!(target, addr = %node.addr, "creating raft network connection");
        NetworkConnection {
            target,
            addr: node.addr.clone(),
        }
    }
}

impl RaftNetwork<TypeConfig> for NetworkConnection {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        option: RPCOption,
    ) -> Result<AppendEntriesResponse<u64>, RPCError<u64, BasicNode, RaftError<u64>>> {
        self.call(APPEND_PATH, &rpc, &option).await
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<u64>,
        RPCError<u64, BasicNode, RaftError<u64, InstallSnapshotError>>,
    > {
        self.call(SNAPSHOT_PATH, &rpc, &option).await
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<u64>,
        option: RPCOption,
    ) -> Result<VoteResponse<u64>, RPCError<u64, BasicNode, RaftError<u64>>> {
        self.call(VOTE_PATH, &rpc, &option).await
    }
}

/// Routes answering peer raft RPCs against `raft`.
pub fn raft_routes(raft: HarborRaft) -> Router {
    Router::new()
        .route(APPEND_PATH, post(append))
        .route(VOTE_PATH, post(vote))
        .route(SNAPSHOT_PATH, post(snapshot))
        .with_state(raft)
}

async fn append(
    State(raft): State<HarborRaft>,
    Json(req): Json<AppendEntriesRequest<TypeConfig>>,
) -> Json<Result<AppendEntriesResponse<u64>, RaftError<u64>>> {
    Json(raft.append_entries(req).await)
}

async fn vote(
    State(raft): State<HarborRaft>,
    Json(req): Json<VoteRequest<u64>>,
) -> Json<Result<VoteResponse<u64>, RaftError<u64>>> {
    debug!(vote = %req.vote, "handling vote rpc");
    Json(raft.vote(req).await)
}

async fn snapshot(
    State(raft): State<HarborRaft>,
    Json(req): Json<InstallSnapshotRequest<TypeConfig>>,
) -> Json<Result<InstallSnapshotResponse<u64>, RaftError<u64, InstallSnapshotError>>> {
    Json(raft.install_snapshot(req).await)
}
