//! The agent: local state plus the check runners feeding it.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use harbor_cluster::Membership;
use harbor_health::{CheckError, CheckKind, CheckNotifier, CheckRunner, CheckType};
use harbor_state::{CLUSTER_SERVICE_ID, HealthCheck, HealthStatus, NodeService};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::error::{AgentError, AgentResult};
use crate::local::LocalState;

pub struct Agent {
    state: Arc<LocalState>,
    runners: Mutex<BTreeMap<String, CheckRunner>>,
    shutdown: watch::Sender<bool>,
}

impl Agent {
    pub fn new(state: Arc<LocalState>) -> Self {
        Self {
            state,
            runners: Mutex::new(BTreeMap::new()),
            shutdown: watch::channel(false).0,
        }
    }

    pub fn state(&self) -> &Arc<LocalState> {
        &self.state
    }

    /// Receiver that flips to `true` on [`shutdown`](Self::shutdown).
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    fn runners(&self) -> MutexGuard<'_, BTreeMap<String, CheckRunner>> {
        self.runners.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Spawn the anti-entropy loop.
    pub fn start(&self, membership: Arc<dyn Membership>) -> JoinHandle<()> {
        tokio::spawn(
            self.state
                .clone()
                .run_anti_entropy(membership, self.shutdown.subscribe()),
        )
    }

    /// Register a service, optionally with a check of its own
    /// (`service:{id}`).
    pub fn add_service(&self, mut service: NodeService, check: Option<CheckType>) -> AgentResult<()> {
        let kind = check.as_ref().map(CheckType::validate).transpose()?;
        if service.id.is_empty() {
            service.id = service.service.clone();
        }
        let id = service.id.clone();
        let name = service.service.clone();
        self.state.add_service(service);
        info!(service_id = %id, "service added");

        if let Some(kind) = kind {
            let check = HealthCheck {
                check_id: format!("service:{id}"),
                name: format!("Service '{name}' check"),
                status: HealthStatus::Critical,
                service_id: Some(id),
                ..Default::default()
            };
            self.start_check(check, kind)?;
        }
        Ok(())
    }

    /// Remove a service and every check bound to it.
    pub fn remove_service(&self, service_id: &str) -> AgentResult<()> {
        if service_id == CLUSTER_SERVICE_ID {
            return Err(AgentError::Invalid(format!(
                "the {CLUSTER_SERVICE_ID} service cannot be removed"
            )));
        }
        let bound: Vec<String> = self
            .state
            .checks()
            .into_values()
            .filter(|c| c.service_id.as_deref() == Some(service_id))
            .map(|c| c.check_id)
            .collect();
        for check_id in bound {
            self.remove_check(&check_id);
        }
        self.state.remove_service(service_id);
        info!(service_id = %service_id, "service removed");
        Ok(())
    }

    /// Track a check. With a `check_type` a runner is started for it;
    /// without one the status is only changed through the agent.
    pub fn add_check(&self, mut check: HealthCheck, check_type: Option<CheckType>) -> AgentResult<()> {
        if check.status == HealthStatus::Unknown {
            check.status = HealthStatus::Critical;
        }
        match check_type {
            Some(ct) => {
                let kind = ct.validate()?;
                self.start_check(check, kind)
            }
            None => self.state.add_check(check),
        }
    }

    fn start_check(&self, mut check: HealthCheck, kind: CheckKind) -> AgentResult<()> {
        if check.check_id.is_empty() {
            check.check_id = check.name.clone();
        }
        let id = check.check_id.clone();
        self.state.add_check(check)?;

        let notify: Arc<dyn CheckNotifier> = self.state.clone();
        let runner = CheckRunner::new(&id, &kind, notify);
        runner.start(self.shutdown.subscribe());
        // Replacing a runner drops, and so stops, the old one.
        self.runners().insert(id.clone(), runner);
        info!(check_id = %id, ?kind, "check started");
        Ok(())
    }

    pub fn remove_check(&self, check_id: &str) {
        if let Some(runner) = self.runners().remove(check_id) {
            runner.stop();
        }
        self.state.remove_check(check_id);
        info!(check_id = %check_id, "check removed");
    }

    /// Push a status into a TTL check and renew its TTL.
    pub fn update_ttl_check(
        &self,
        check_id: &str,
        status: HealthStatus,
        output: &str,
    ) -> AgentResult<()> {
        let runners = self.runners();
        let runner = runners
            .get(check_id)
            .ok_or_else(|| CheckError::UnknownCheck(check_id.to_string()))?;
        let ttl = runner
            .as_ttl()
            .ok_or_else(|| CheckError::NotTtl(check_id.to_string()))?;
        ttl.set_status(status, output);
        Ok(())
    }

    /// Stop every check and the anti-entropy loop.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let runners = std::mem::take(&mut *self.runners());
        for runner in runners.values() {
            runner.stop();
        }
        info!(checks = runners.len(), "agent shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockServer, local_state};
    use std::time::Duration;

    fn agent() -> Agent {
        let server = MockServer::new();
        Agent::new(local_state(&server, Duration::ZERO))
    }

    fn ttl(secs: u64) -> CheckType {
        CheckType {
            ttl: Some(Duration::from_secs(secs)),
            ..Default::default()
        }
    }

    fn web() -> NodeService {
        NodeService {
            id: "web".into(),
            service: "web".into(),
            tag: None,
            port: 80,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn service_ttl_check_lifecycle() {
        let agent = agent();
        agent.add_service(web(), Some(ttl(10))).unwrap();

        let check = agent.state().check("service:web").unwrap();
        assert_eq!(check.status, HealthStatus::Critical);
        assert_eq!(check.service_name.as_deref(), Some("web"));

        agent
            .update_ttl_check("service:web", HealthStatus::Passing, "ok")
            .unwrap();
        assert_eq!(agent.state().check("service:web").unwrap().status, HealthStatus::Passing);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(agent.state().check("service:web").unwrap().status, HealthStatus::Critical);

        agent.remove_service("web").unwrap();
        assert!(agent.state().check("service:web").is_none());
        assert!(agent.state().service("web").is_none());
        assert!(matches!(
            agent.update_ttl_check("service:web", HealthStatus::Passing, ""),
            Err(AgentError::Check(CheckError::UnknownCheck(_)))
        ));
    }

    #[tokio::test]
    async fn invalid_check_type_adds_nothing() {
        let agent = agent();
        let bad = CheckType {
            script: Some("true".into()),
            ..Default::default()
        };
        assert!(agent.add_service(web(), Some(bad)).is_err());
        assert!(agent.state().service("web").is_none());
    }

    #[tokio::test]
    async fn cluster_service_is_protected() {
        let agent = agent();
        assert!(matches!(
            agent.remove_service(CLUSTER_SERVICE_ID),
            Err(AgentError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn only_ttl_checks_take_updates() {
        let agent = agent();
        agent
            .add_check(
                HealthCheck {
                    name: "ping".into(),
                    ..Default::default()
                },
                Some(CheckType {
                    script: Some("exit 0".into()),
                    interval: Some(Duration::from_secs(3600)),
                    ..Default::default()
                }),
            )
            .unwrap();
        assert!(matches!(
            agent.update_ttl_check("ping", HealthStatus::Passing, ""),
            Err(AgentError::Check(CheckError::NotTtl(_)))
        ));

        // A check without a type starts critical and has no runner.
        agent
            .add_check(
                HealthCheck {
                    name: "manual".into(),
                    ..Default::default()
                },
                None,
            )
            .unwrap();
        assert_eq!(agent.state().check("manual").unwrap().status, HealthStatus::Critical);
        assert!(agent.update_ttl_check("manual", HealthStatus::Passing, "").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_checks() {
        let agent = agent();
        agent
            .add_check(
                HealthCheck {
                    name: "beat".into(),
                    ..Default::default()
                },
                Some(ttl(5)),
            )
            .unwrap();
        agent
            .update_ttl_check("beat", HealthStatus::Passing, "")
            .unwrap();

        let mut signal = agent.shutdown_signal();
        agent.shutdown();
        assert!(*signal.borrow_and_update());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(agent.state().check("beat").unwrap().status, HealthStatus::Passing);
    }
}
