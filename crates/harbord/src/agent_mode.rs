//! Client agent mode: local services and checks synced to remote servers.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use harbor_agent::{Agent, LocalConfig, LocalState};
use harbor_cluster::membership::{ROLE_NODE, TAG_DC, TAG_ROLE};
use harbor_cluster::{Member, Membership, StaticMembership};
use harbor_rpc::{HttpRpcClient, RpcClient};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::config::DaemonConfig;
use crate::membership_http::{membership_routes, run_heartbeat_loop};

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Build the agent for `config` and load the services and checks it
/// declares.
pub fn build_agent(config: &DaemonConfig, client: Arc<dyn RpcClient>) -> anyhow::Result<Agent> {
    let local = LocalConfig {
        datacenter: config.datacenter.clone(),
        node_name: config.node_name.clone(),
        advertise_addr: config.advertise_addr.clone(),
        ae_interval: config.ae_interval,
        check_update_interval: config.check_update_interval,
        discard_check_output: config.discard_check_output,
    };
    let agent = Agent::new(LocalState::new(local, client));

    for svc in &config.services {
        let check = match &svc.check {
            Some(def) => def.check_type()?,
            None => None,
        };
        agent.add_service(svc.node_service(), check)?;
    }
    for def in &config.checks {
        agent.add_check(def.health_check(), def.check_type()?)?;
    }
    info!(
        services = config.services.len(),
        checks = config.checks.len(),
        "agent configured"
    );
    Ok(agent)
}

/// Point `client` at the alive servers of `datacenter` whenever membership
/// changes. The join list is kept until a server is known.
async fn track_servers(
    membership: Arc<StaticMembership>,
    client: Arc<HttpRpcClient>,
    datacenter: String,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut changes = membership.changes();
    loop {
        let servers: Vec<String> = membership
            .servers(&datacenter)
            .into_iter()
            .map(|s| s.rpc_addr)
            .collect();
        if !servers.is_empty() {
            client.set_servers(servers);
        }
        tokio::select! {
            res = changes.changed() => {
                if res.is_err() {
                    return;
                }
            }
            _ = shutdown.changed() => {
                debug!("server tracking stopped");
                return;
            }
        }
    }
}

pub async fn run(config: DaemonConfig) -> anyhow::Result<()> {
    info!(node = %config.node_name, dc = %config.datacenter, "harbor agent starting");
    if config.join.is_empty() {
        anyhow::bail!("agent mode needs at least one --join server address");
    }

    let client = Arc::new(HttpRpcClient::new(config.join.clone()));
    let agent = build_agent(&config, client.clone())?;

    let local = Member::new(&config.node_name, &config.advertise_addr, config.bind_port)
        .with_tag(TAG_ROLE, ROLE_NODE)
        .with_tag(TAG_DC, &config.datacenter);
    let membership = Arc::new(StaticMembership::new(local));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let heartbeat_handle = tokio::spawn(run_heartbeat_loop(
        membership.clone(),
        config.join.clone(),
        HEARTBEAT_INTERVAL,
        shutdown_rx.clone(),
    ));
    let tracker_handle = tokio::spawn(track_servers(
        membership.clone(),
        client,
        config.datacenter.clone(),
        shutdown_rx.clone(),
    ));
    let ae_handle = agent.start(membership.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.bind_port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "membership listener starting");

    axum::serve(listener, membership_routes(membership))
        .with_graceful_shutdown(crate::shutdown_signal(shutdown_tx))
        .await?;

    agent.shutdown();
    let _ = ae_handle.await;
    let _ = heartbeat_handle.await;
    let _ = tracker_handle.await;

    info!("harbor agent stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CheckDefinition, ServiceDefinition};
    use harbor_state::HealthStatus;

    #[tokio::test]
    async fn declared_services_and_checks_are_loaded() {
        let config = DaemonConfig {
            node_name: "n1".into(),
            services: vec![ServiceDefinition {
                id: String::new(),
                name: "redis".into(),
                tag: None,
                port: 6379,
                check: Some(CheckDefinition {
                    ttl: Some("30s".into()),
                    ..Default::default()
                }),
            }],
            checks: vec![CheckDefinition {
                id: "disk".into(),
                name: "Disk".into(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let client = Arc::new(HttpRpcClient::new(vec![]));
        let agent = build_agent(&config, client).unwrap();

        let state = agent.state();
        assert!(state.service("redis").is_some());
        assert_eq!(state.check("service:redis").unwrap().status, HealthStatus::Critical);
        assert_eq!(state.check("disk").unwrap().status, HealthStatus::Critical);
        agent.update_ttl_check("service:redis", HealthStatus::Passing, "ok").unwrap();
        assert_eq!(state.check("service:redis").unwrap().status, HealthStatus::Passing);
        agent.shutdown();
    }

    #[tokio::test]
    async fn server_set_follows_membership() {
        use harbor_cluster::membership::{ROLE_SERVER, TAG_PORT};

        let membership = Arc::new(StaticMembership::new(
            Member::new("n1", "10.0.0.5", 8300).with_tag(TAG_DC, "dc1"),
        ));
        let client = Arc::new(HttpRpcClient::new(vec!["seed:8300".into()]));
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(track_servers(membership.clone(), client.clone(), "dc1".into(), rx));

        tokio::task::yield_now().await;
        assert_eq!(client.servers(), vec!["seed:8300".to_string()]);

        membership.heartbeat(
            Member::new("s1", "10.0.0.1", 8301)
                .with_tag(TAG_ROLE, ROLE_SERVER)
                .with_tag(TAG_DC, "dc1")
                .with_tag(TAG_PORT, "8300"),
        );
        for _ in 0..100 {
            if client.servers() == vec!["10.0.0.1:8300".to_string()] {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(client.servers(), vec!["10.0.0.1:8300".to_string()]);

        tx.send(true).unwrap();
        task.await.unwrap();
    }
}
