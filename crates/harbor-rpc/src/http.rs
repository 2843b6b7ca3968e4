//! HTTP surface for RPC: `POST /rpc/{Service.Method}` with the JSON
//! arguments as the body. Every call is answered `200` with an
//! [`RpcReply`]; failures travel in its `error` field.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::Value;
use tracing::debug;

use crate::client::RpcReply;
use crate::server::RpcServer;

pub fn rpc_routes(server: Arc<RpcServer>) -> Router {
    Router::new()
        .route("/rpc/{method}", post(handle_rpc))
        .with_state(server)
}

async fn handle_rpc(
    State(server): State<Arc<RpcServer>>,
    Path(method): Path<String>,
    Json(args): Json<Value>,
) -> Json<RpcReply> {
    let result = server.dispatch(&method, args).await;
    if let Err(e) = &result {
        debug!(%method, error = %e, "rpc failed");
    }
    Json(RpcReply::from_result(result))
}
