//! Leader duties: keep the catalog in line with cluster membership.
//!
//! Every member is a catalog node carrying the `serfHealth` check, passing
//! while the member is alive and critical once it failed. Servers of this
//! datacenter also carry the `harbor` service and are pulled into the raft
//! voter set. Members that left, or that membership has forgotten
//! entirely, are deregistered.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use harbor_cluster::{Member, MemberStatus, ServerParts};
use harbor_raft::Command;
use harbor_state::{
    CLUSTER_SERVICE_ID, CLUSTER_SERVICE_NAME, DeregisterRequest, HealthCheck, HealthStatus,
    NodeService, RegisterRequest, SERF_CHECK_ID, SERF_CHECK_NAME,
};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::RpcResult;
use crate::server::RpcServer;

const ALIVE_OUTPUT: &str = "Agent alive and reachable";
const FAILED_OUTPUT: &str = "Agent not live or unreachable";

fn serf_check(node: &str, status: HealthStatus, output: &str) -> HealthCheck {
    HealthCheck {
        node: node.to_string(),
        check_id: SERF_CHECK_ID.to_string(),
        name: SERF_CHECK_NAME.to_string(),
        status,
        notes: String::new(),
        output: output.to_string(),
        service_id: None,
        service_name: None,
    }
}

impl RpcServer {
    /// A server of our own datacenter, if `m` is one.
    fn local_server(&self, m: &Member) -> Option<ServerParts> {
        ServerParts::from_member(m).filter(|s| s.datacenter == self.config.datacenter)
    }

    /// One reconciliation pass. Does nothing on followers. Every member is
    /// attempted; the first failure is returned after the pass.
    pub async fn reconcile(&self) -> RpcResult<()> {
        if !self.consensus.is_leader() {
            return Ok(());
        }
        let members = self.membership.lan_members();
        let mut first_err = None;
        for m in &members {
            let result = match m.status {
                MemberStatus::Alive => self.reconcile_alive(m).await,
                MemberStatus::Failed => self.reconcile_failed(m).await,
                MemberStatus::Left => self.reconcile_left(&m.name, self.local_server(m)).await,
                MemberStatus::Leaving => Ok(()),
            };
            if let Err(e) = result {
                warn!(member = %m.name, error = %e, "failed to reconcile member");
                first_err.get_or_insert(e);
            }
        }
        if let Err(e) = self.reconcile_reaped(&members).await {
            first_err.get_or_insert(e);
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn reconcile_alive(&self, m: &Member) -> RpcResult<()> {
        let server = self.local_server(m);
        if let Some(s) = &server {
            if s.raft_id != 0 && s.voter && s.name != self.config.node_name {
                if let Err(e) = self.consensus.add_server(s.raft_id, &s.rpc_addr).await {
                    warn!(server = %s.name, error = %e, "failed to add raft peer");
                }
            }
        }
        let service = server.as_ref().map(|s| NodeService {
            id: CLUSTER_SERVICE_ID.to_string(),
            service: CLUSTER_SERVICE_NAME.to_string(),
            tag: None,
            port: s
                .rpc_addr
                .rsplit_once(':')
                .and_then(|(_, p)| p.parse().ok())
                .unwrap_or(m.port),
        });

        let in_sync = {
            let snap = self.store.snapshot()?;
            match snap.get_node(&m.name)? {
                Some(node) if node.address == m.addr => {
                    let check_ok = snap.node_checks(&m.name)?.iter().any(|c| {
                        c.check_id == SERF_CHECK_ID && c.status == HealthStatus::Passing
                    });
                    let service_ok = match &service {
                        None => true,
                        Some(svc) => snap
                            .node_services(&m.name)?
                            .is_some_and(|ns| ns.services.get(CLUSTER_SERVICE_ID) == Some(svc)),
                    };
                    check_ok && service_ok
                }
                _ => false,
            }
        };
        if in_sync {
            return Ok(());
        }

        info!(member = %m.name, addr = %m.addr, server = server.is_some(), "member registered in catalog");
        self.raft_apply(Command::Register(RegisterRequest {
            datacenter: self.config.datacenter.clone(),
            node: m.name.clone(),
            address: m.addr.clone(),
            service,
            check: Some(serf_check(&m.name, HealthStatus::Passing, ALIVE_OUTPUT)),
        }))
        .await?;
        Ok(())
    }

    async fn reconcile_failed(&self, m: &Member) -> RpcResult<()> {
        let already_critical = self
            .store
            .node_checks(&m.name)?
            .iter()
            .any(|c| c.check_id == SERF_CHECK_ID && c.status == HealthStatus::Critical);
        if already_critical {
            return Ok(());
        }
        info!(member = %m.name, "member marked critical in catalog");
        self.raft_apply(Command::Register(RegisterRequest {
            datacenter: self.config.datacenter.clone(),
            node: m.name.clone(),
            address: m.addr.clone(),
            service: None,
            check: Some(serf_check(&m.name, HealthStatus::Critical, FAILED_OUTPUT)),
        }))
        .await?;
        Ok(())
    }

    async fn reconcile_left(&self, name: &str, server: Option<ServerParts>) -> RpcResult<()> {
        if name == self.config.node_name {
            return Ok(());
        }
        if let Some(s) = server.filter(|s| s.raft_id != 0) {
            if let Err(e) = self.consensus.remove_server(s.raft_id).await {
                warn!(server = %s.name, error = %e, "failed to remove raft peer");
            }
        }
        if self.store.get_node(name)?.is_none() {
            return Ok(());
        }
        info!(member = %name, "member deregistered from catalog");
        self.raft_apply(Command::Deregister(DeregisterRequest {
            datacenter: self.config.datacenter.clone(),
            node: name.to_string(),
            service_id: None,
            check_id: None,
        }))
        .await?;
        Ok(())
    }

    /// Deregister catalog nodes that membership no longer knows. Only
    /// nodes carrying the membership health check are touched; nodes
    /// registered directly through the catalog stay.
    async fn reconcile_reaped(&self, members: &[Member]) -> RpcResult<()> {
        let known: BTreeSet<&str> = members.iter().map(|m| m.name.as_str()).collect();
        let reaped: Vec<String> = {
            let snap = self.store.snapshot()?;
            let mut out = Vec::new();
            for node in snap.nodes()? {
                if known.contains(node.node.as_str()) {
                    continue;
                }
                if snap.node_checks(&node.node)?.iter().any(|c| c.check_id == SERF_CHECK_ID) {
                    out.push(node.node);
                }
            }
            out
        };
        for name in reaped {
            debug!(member = %name, "member reaped");
            self.reconcile_left(&name, None).await?;
        }
        Ok(())
    }

    /// Reconcile every `interval` and on every membership change until
    /// `shutdown` flips.
    pub async fn run_leader_loop(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut changes = self.membership.changes();
        let mut tick = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                changed = changes.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = shutdown.wait_for(|s| *s) => {
                    info!("leader reconcile loop stopped");
                    return;
                }
            }
            if let Err(e) = self.reconcile().await {
                warn!(error = %e, "reconcile pass failed");
            }
        }
    }
}
