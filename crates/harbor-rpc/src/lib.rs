//! harbor-rpc — the server-side endpoints of a harbor cluster.
//!
//! An [`RpcServer`] owns the local [`harbor_state::StateStore`], a
//! [`harbor_raft::Consensus`] handle and the membership view. Each
//! `Service.Method` is an async method on it; [`RpcServer::dispatch`] maps
//! wire names to those methods and [`rpc_routes`] exposes them over HTTP.
//!
//! # Request flow
//!
//! 1. **Forward.** A request for another datacenter goes to a random alive
//!    server there. Writes and consistent reads go to the raft leader.
//!    Stale reads are served by whichever server got them.
//! 2. **Validate.** Malformed requests are rejected before touching the log.
//! 3. **Apply or read.** Writes become a [`harbor_raft::Command`]; reads run
//!    as blocking queries against a store snapshot.
//!
//! # Methods
//!
//! | Method | Kind |
//! |---|---|
//! | `Catalog.Register` / `Catalog.Deregister` | write |
//! | `Catalog.ListDatacenters` / `ListNodes` / `ListServices` / `ServiceNodes` / `NodeServices` | read |
//! | `Health.NodeChecks` / `ServiceChecks` / `ChecksInState` / `ServiceNodes` | read |
//! | `KVS.Apply` | write |
//! | `KVS.Get` / `KVS.List` / `KVS.ListKeys` | read |
//! | `Txn.Apply` | write |
//! | `Session.Apply` | write |
//! | `Session.Get` / `Session.List` / `Session.NodeSessions` | read |
//! | `Coordinate.Update` | write |
//! | `Coordinate.Get` | read |
//! | `Status.Ping` / `Status.Leader` / `Status.Peers` | local |
//!
//! The leader additionally runs [`RpcServer::run_leader_loop`], which
//! folds membership changes into the catalog.

pub mod blocking;
pub mod catalog;
pub mod client;
pub mod coordinate;
pub mod error;
pub mod health;
pub mod http;
pub mod kvs;
pub mod leader;
pub mod server;
pub mod session;
pub mod status;

#[cfg(test)]
mod testing;

pub use blocking::{DEFAULT_QUERY_TIME, MAX_QUERY_TIME};
pub use client::{HttpRpcClient, RpcClient, RpcReply, call, call_addr};
pub use error::{RpcError, RpcResult};
pub use http::rpc_routes;
pub use server::{RpcServer, ServerConfig};
