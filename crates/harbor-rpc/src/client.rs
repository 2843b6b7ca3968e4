//! Calling endpoints: the [`RpcClient`] seam, the JSON envelope and the
//! HTTP client used by agents and by servers forwarding to each other.

use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use harbor_raft::post_json;
use rand::seq::SliceRandom;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{RpcError, RpcResult};

/// Every method is served at `{RPC_PATH}/{Service.Method}`.
pub const RPC_PATH: &str = "/rpc";

/// Default bound on one call, enough for any non-blocking request.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// Reply body of every RPC. Exactly one side is set.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RpcReply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RpcReply {
    pub fn from_result(result: RpcResult<Value>) -> Self {
        match result {
            Ok(value) => Self {
                result: Some(value),
                error: None,
            },
            Err(e) => Self {
                result: None,
                error: Some(e.to_string()),
            },
        }
    }

    pub fn into_value(self) -> RpcResult<Value> {
        match self.error {
            Some(msg) => Err(RpcError::Remote(msg)),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

pub(crate) fn encode<T: Serialize>(value: &T) -> RpcResult<Value> {
    serde_json::to_value(value).map_err(|e| RpcError::Decode(e.to_string()))
}

pub(crate) fn decode<T: DeserializeOwned>(value: Value) -> RpcResult<T> {
    serde_json::from_value(value).map_err(|e| RpcError::Decode(e.to_string()))
}

/// Something that can run a `"Service.Method"` call against a server.
#[async_trait]
pub trait RpcClient: Send + Sync {
    async fn call_raw(&self, method: &str, args: Value) -> RpcResult<Value>;
}

/// Typed wrapper over [`RpcClient::call_raw`].
pub async fn call<C, Req, Resp>(client: &C, method: &str, args: &Req) -> RpcResult<Resp>
where
    C: RpcClient + ?Sized,
    Req: Serialize,
    Resp: DeserializeOwned,
{
    let reply = client.call_raw(method, encode(args)?).await?;
    decode(reply)
}

/// Call `method` on the server listening at `addr`.
pub async fn call_addr<Req, Resp>(
    addr: &str,
    method: &str,
    args: &Req,
    timeout: Duration,
) -> RpcResult<Resp>
where
    Req: Serialize + ?Sized,
    Resp: DeserializeOwned,
{
    let path = format!("{RPC_PATH}/{method}");
    let reply: RpcReply = post_json(addr, &path, args, timeout).await?;
    decode(reply.into_value()?)
}

/// Client that spreads calls over a set of known servers.
pub struct HttpRpcClient {
    servers: RwLock<Vec<String>>,
    timeout: Duration,
}

impl HttpRpcClient {
    pub fn new(servers: Vec<String>) -> Self {
        Self {
            servers: RwLock::new(servers),
            timeout: DEFAULT_RPC_TIMEOUT,
        }
    }

    /// Per-call bound. Blocking queries need this above their wait time.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Replace the server set, e.g. after membership reported new servers.
    pub fn set_servers(&self, servers: Vec<String>) {
        let mut guard = self.servers.write().unwrap_or_else(|e| e.into_inner());
        if *guard != servers {
            debug!(?servers, "rpc server set updated");
            *guard = servers;
        }
    }

    pub fn servers(&self) -> Vec<String> {
        self.servers.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn pick(&self) -> Option<String> {
        let servers = self.servers.read().unwrap_or_else(|e| e.into_inner());
        servers.choose(&mut rand::thread_rng()).cloned()
    }
}

#[async_trait]
impl RpcClient for HttpRpcClient {
    async fn call_raw(&self, method: &str, args: Value) -> RpcResult<Value> {
        let addr = self.pick().ok_or(RpcError::NoServers)?;
        call_addr(&addr, method, &args, self.timeout)
            .await
            .inspect_err(|e| {
                if matches!(e, RpcError::Transport(_)) {
                    warn!(%addr, method, error = %e, "rpc call failed");
                }
            })
    }
}
