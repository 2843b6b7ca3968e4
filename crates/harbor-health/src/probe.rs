//! Probe execution and result mapping.
//!
//! Script: exit 0 → passing, exit 1 → warning, anything else (other exit
//! codes, signals, spawn failure, timeout) → critical.
//!
//! HTTP: 200 → passing, 503 → warning, anything else (including transport
//! errors) → critical.

use std::process::Stdio;
use std::time::Duration;

use bytes::Bytes;
use harbor_state::HealthStatus;
use http_body_util::{BodyExt, Empty};
use tokio::process::Command;
use tracing::debug;

/// Maximum bytes of probe output kept for a check.
pub const CHECK_BUF_SIZE: usize = 4 * 1024;

/// Keep at most [`CHECK_BUF_SIZE`] bytes of `raw`, marking any cut.
pub fn truncate_output(raw: &[u8]) -> String {
    if raw.len() <= CHECK_BUF_SIZE {
        return String::from_utf8_lossy(raw).into_owned();
    }
    let mut out = String::from_utf8_lossy(&raw[..CHECK_BUF_SIZE]).into_owned();
    out.push_str(&format!(
        "\n...\nCaptured {} of {} bytes",
        CHECK_BUF_SIZE,
        raw.len()
    ));
    out
}

/// Run `script` under `sh -c`, capturing stdout and stderr together.
pub async fn run_script(script: &str, timeout: Duration) -> (HealthStatus, String) {
    let child = Command::new("/bin/sh")
        .arg("-c")
        .arg(script)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();
    let child = match child {
        Ok(c) => c,
        Err(e) => {
            debug!(%script, error = %e, "check script failed to start");
            return (HealthStatus::Critical, format!("failed to invoke {script:?}: {e}"));
        }
    };

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            return (HealthStatus::Critical, format!("failed waiting on {script:?}: {e}"));
        }
        Err(_) => {
            return (
                HealthStatus::Critical,
                format!("timed out running check {script:?} after {timeout:?}"),
            );
        }
    };

    let mut raw = output.stdout;
    raw.extend_from_slice(&output.stderr);
    let text = truncate_output(&raw);

    let status = match output.status.code() {
        Some(0) => HealthStatus::Passing,
        Some(1) => HealthStatus::Warning,
        _ => HealthStatus::Critical,
    };
    (status, text)
}

/// Map an HTTP status code to a check status.
pub fn status_for_code(code: u16) -> HealthStatus {
    match code {
        200 => HealthStatus::Passing,
        503 => HealthStatus::Warning,
        _ => HealthStatus::Critical,
    }
}

/// GET `url` (plain `http://` only) and map the response.
pub async fn http_get(url: &str, timeout: Duration) -> (HealthStatus, String) {
    let uri: http::Uri = match url.parse() {
        Ok(u) => u,
        Err(e) => return (HealthStatus::Critical, format!("invalid url {url:?}: {e}")),
    };
    if uri.scheme_str().is_some_and(|s| s != "http") {
        return (
            HealthStatus::Critical,
            format!("unsupported scheme in {url:?}"),
        );
    }
    let Some(authority) = uri.authority().cloned() else {
        return (HealthStatus::Critical, format!("no host in {url:?}"));
    };
    let addr = match authority.port_u16() {
        Some(_) => authority.to_string(),
        None => format!("{}:80", authority.host()),
    };
    let path = uri
        .path_and_query()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let result = tokio::time::timeout(timeout, async {
        let stream = tokio::net::TcpStream::connect(&addr)
            .await
            .map_err(|e| e.to_string())?;
        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| e.to_string())?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = http::Request::builder()
            .method("GET")
            .uri(path.as_str())
            .header("host", authority.as_str())
            .header("user-agent", "harbor-health/0.1")
            .body(Empty::<Bytes>::new())
            .map_err(|e| e.to_string())?;

        let resp = sender.send_request(req).await.map_err(|e| e.to_string())?;
        let code = resp.status();
        let body = resp
            .into_body()
            .collect()
            .await
            .map(|b| b.to_bytes())
            .unwrap_or_default();
        Ok::<_, String>((code, body))
    })
    .await;

    match result {
        Ok(Ok((code, body))) => {
            let status = status_for_code(code.as_u16());
            let output = format!(
                "HTTP GET {url}: {code} Output: {}",
                truncate_output(&body)
            );
            (status, output)
        }
        Ok(Err(e)) => {
            debug!(%url, error = %e, "http check request failed");
            (HealthStatus::Critical, format!("HTTP GET {url}: {e}"))
        }
        Err(_) => (
            HealthStatus::Critical,
            format!("HTTP GET {url}: timed out after {timeout:?}"),
        ),
    }
}
