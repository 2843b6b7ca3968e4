//! Heartbeat transport for [`StaticMembership`].
//!
//! Each node periodically POSTs its own [`Member`] record to every address
//! it knows about (the join list plus every member learned so far). The
//! receiver records the heartbeat and answers with its member list, which
//! is how members learn about each other. Liveness is only ever refreshed
//! by a member's own heartbeat.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use harbor_cluster::{Member, MemberStatus, Membership, StaticMembership};
use harbor_raft::post_json;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info};

pub const HEARTBEAT_PATH: &str = "/membership/heartbeat";
pub const LEAVE_PATH: &str = "/membership/leave";

const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Serialize, Deserialize)]
struct LeaveRequest {
    name: String,
}

pub fn membership_routes(membership: Arc<StaticMembership>) -> Router {
    Router::new()
        .route(HEARTBEAT_PATH, post(handle_heartbeat))
        .route(LEAVE_PATH, post(handle_leave))
        .with_state(membership)
}

async fn handle_heartbeat(
    State(membership): State<Arc<StaticMembership>>,
    Json(member): Json<Member>,
) -> Json<Vec<Member>> {
    membership.heartbeat(member);
    Json(membership.members())
}

async fn handle_leave(
    State(membership): State<Arc<StaticMembership>>,
    Json(req): Json<LeaveRequest>,
) -> Json<bool> {
    Json(membership.leave(&req.name))
}

/// Addresses to heartbeat: the join list plus every member not known to
/// have left.
fn peers(membership: &StaticMembership, join: &[String]) -> BTreeSet<String> {
    let local = membership.local_member();
    let local_addr = format!("{}:{}", local.addr, local.port);
    let mut peers: BTreeSet<String> = join.iter().cloned().collect();
    for m in membership.members() {
        if m.name != local.name && m.status != MemberStatus::Left {
            peers.insert(format!("{}:{}", m.addr, m.port));
        }
    }
    peers.remove(&local_addr);
    peers
}

/// One heartbeat round. Returns how many peers answered.
pub async fn heartbeat_once(membership: &StaticMembership, join: &[String]) -> usize {
    let local = membership.local_member();
    let mut answered = 0;
    for addr in peers(membership, join) {
        let reply: Result<Vec<Member>, _> =
            post_json(&addr, HEARTBEAT_PATH, &local, HEARTBEAT_TIMEOUT).await;
        match reply {
            Ok(members) => {
                answered += 1;
                for m in members {
                    if m.name != local.name
                        && m.status == MemberStatus::Alive
                        && membership.get(&m.name).is_none()
                    {
                        debug!(member = %m.name, via = %addr, "learned member");
                        membership.heartbeat(m);
                    }
                }
            }
            Err(e) => debug!(%addr, error = %e, "heartbeat failed"),
        }
    }
    answered
}

/// Heartbeat peers and reap silent members until `shutdown` flips, then
/// announce the leave.
pub async fn run_heartbeat_loop(
    membership: Arc<StaticMembership>,
    join: Vec<String>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    info!(peers = join.len(), ?interval, "membership heartbeat started");
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                heartbeat_once(&membership, &join).await;
                membership.reap_dead_nodes();
            }
            _ = shutdown.changed() => break,
        }
    }

    let local = membership.local_member();
    let leave = LeaveRequest { name: local.name };
    for addr in peers(&membership, &join) {
        let sent: Result<bool, _> =
            post_json(&addr, LEAVE_PATH, &leave, HEARTBEAT_TIMEOUT).await;
        if let Err(e) = sent {
            debug!(%addr, error = %e, "leave not delivered");
        }
    }
    info!("membership heartbeat stopped");
}
