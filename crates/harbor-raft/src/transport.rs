//! Minimal HTTP/1 client for JSON request/response exchanges between
//! cluster members.
//!
//! One TCP connection per call. Raft heartbeats and RPC forwards are
//! small and infrequent enough that pooling is not worth its bookkeeping.

use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

/// Failure to get a decodable 2xx answer from a peer.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect to {addr}: {reason}")]
    Connect { addr: String, reason: String },

    #[error("request to {addr} timed out after {timeout:?}")]
    Timeout { addr: String, timeout: Duration },

    #[error("http error: {0}")]
    Http(String),

    #[error("peer answered {status}: {body}")]
    Status { status: u16, body: String },

    #[error("encode request: {0}")]
    Encode(String),

    #[error("decode response: {0}")]
    Decode(String),
}

/// POST `body` as JSON to `http://{addr}{path}` and decode the JSON reply.
pub async fn post_json<Req, Resp>(
    addr: &str,
    path: &str,
    body: &Req,
    timeout: Duration,
) -> Result<Resp, TransportError>
where
    Req: Serialize + ?Sized,
    Resp: DeserializeOwned,
{
    let payload = serde_json::to_vec(body).map_err(|e| TransportError::Encode(e.to_string()))?;

    let exchange = async {
        let stream = tokio::net::TcpStream::connect(addr)
            .await
            .map_err(|e| TransportError::Connect {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?;

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| TransportError::Connect {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "peer connection closed with error");
            }
        });

        let req = http::Request::builder()
            .method("POST")
            .uri(path)
            .header("host", addr)
            .header("content-type", "application/json")
            .header("user-agent", "harbor/0.1")
            .body(Full::new(Bytes::from(payload)))
            .map_err(|e| TransportError::Http(e.to_string()))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;
        let status = resp.status();
        let bytes = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?
            .to_bytes();

        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }
        serde_json::from_slice(&bytes).map_err(|e| TransportError::Decode(e.to_string()))
    };

    match tokio::time::timeout(timeout, exchange).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout {
            addr: addr.to_string(),
            timeout,
        }),
    }
}
