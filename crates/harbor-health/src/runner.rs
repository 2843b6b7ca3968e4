//! Check runners: one background task per check.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use harbor_cluster::random_stagger;
use harbor_state::HealthStatus;
use tokio::sync::{Notify, watch};
use tokio::time::{Instant, sleep, sleep_until};
use tracing::{debug, warn};

use crate::check_type::CheckKind;
use crate::probe::{http_get, run_script};

/// Receives every status a check produces. Implementations must treat
/// repeated identical updates as no-ops; runners report on every probe.
pub trait CheckNotifier: Send + Sync {
    fn update_check(&self, check_id: &str, status: HealthStatus, output: &str);
}

/// Stop signal that may be fired any number of times.
struct StopSignal {
    stopped: AtomicBool,
    tx: watch::Sender<bool>,
}

impl StopSignal {
    fn new() -> Self {
        Self {
            stopped: AtomicBool::new(false),
            tx: watch::channel(false).0,
        }
    }

    /// Fire once; later calls do nothing.
    fn fire(&self) -> bool {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.tx.send_replace(true);
        true
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Wait until either receiver flips to `true` or its sender goes away.
async fn stopped(stop: &mut watch::Receiver<bool>, shutdown: &mut watch::Receiver<bool>) {
    tokio::select! {
        _ = stop.wait_for(|s| *s) => {}
        _ = shutdown.wait_for(|s| *s) => {}
    }
}

// ── Interval checks ────────────────────────────────────────────────

/// Periodic script check.
pub struct CheckMonitor {
    check_id: String,
    script: String,
    interval: Duration,
    timeout: Duration,
    notify: Arc<dyn CheckNotifier>,
    stop: StopSignal,
}

impl CheckMonitor {
    pub fn new(
        check_id: impl Into<String>,
        script: impl Into<String>,
        interval: Duration,
        timeout: Duration,
        notify: Arc<dyn CheckNotifier>,
    ) -> Self {
        Self {
            check_id: check_id.into(),
            script: script.into(),
            interval,
            timeout,
            notify,
            stop: StopSignal::new(),
        }
    }

    /// Spawn the probe loop. Call at most once per monitor.
    pub fn start(&self, shutdown: watch::Receiver<bool>) {
        let check_id = self.check_id.clone();
        let script = self.script.clone();
        let timeout = self.timeout;
        let notify = Arc::clone(&self.notify);
        spawn_interval_loop(
            self.check_id.clone(),
            self.interval,
            self.stop.subscribe(),
            shutdown,
            move || {
                let check_id = check_id.clone();
                let script = script.clone();
                let notify = Arc::clone(&notify);
                async move {
                    let (status, output) = run_script(&script, timeout).await;
                    if status != HealthStatus::Passing {
                        warn!(%check_id, %status, "check is not passing");
                    }
                    notify.update_check(&check_id, status, &output);
                }
            },
        );
    }

    pub fn stop(&self) {
        if self.stop.fire() {
            debug!(check_id = %self.check_id, "script check stopped");
        }
    }
}

/// Periodic HTTP GET check.
pub struct CheckHttp {
    check_id: String,
    url: String,
    interval: Duration,
    timeout: Duration,
    notify: Arc<dyn CheckNotifier>,
    stop: StopSignal,
}

impl CheckHttp {
    pub fn new(
        check_id: impl Into<String>,
        url: impl Into<String>,
        interval: Duration,
        timeout: Duration,
        notify: Arc<dyn CheckNotifier>,
    ) -> Self {
        Self {
            check_id: check_id.into(),
            url: url.into(),
            interval,
            timeout,
            notify,
            stop: StopSignal::new(),
        }
    }

    /// Spawn the probe loop. Call at most once per check.
    pub fn start(&self, shutdown: watch::Receiver<bool>) {
        let check_id = self.check_id.clone();
        let url = self.url.clone();
        let timeout = self.timeout;
        let notify = Arc::clone(&self.notify);
        spawn_interval_loop(
            self.check_id.clone(),
            self.interval,
            self.stop.subscribe(),
            shutdown,
            move || {
                let check_id = check_id.clone();
                let url = url.clone();
                let notify = Arc::clone(&notify);
                async move {
                    let (status, output) = http_get(&url, timeout).await;
                    notify.update_check(&check_id, status, &output);
                }
            },
        );
    }

    pub fn stop(&self) {
        if self.stop.fire() {
            debug!(check_id = %self.check_id, "http check stopped");
        }
    }
}

fn spawn_interval_loop<F, Fut>(
    check_id: String,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
    mut shutdown: watch::Receiver<bool>,
    probe: F,
) where
    F: Fn() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        // Spread first probes out so a restart does not fire every check
        // at the same instant.
        let mut next = sleep(random_stagger(interval));
        loop {
            tokio::select! {
                _ = next => {
                    probe().await;
                    next = sleep(interval);
                }
                _ = stopped(&mut stop, &mut shutdown) => {
                    debug!(%check_id, "check loop exiting");
                    return;
                }
            }
        }
    });
}

// ── TTL checks ─────────────────────────────────────────────────────

/// A check whose status is pushed by the application. Goes critical when
/// no update arrives within the TTL.
pub struct CheckTtl {
    check_id: String,
    ttl: Duration,
    notify: Arc<dyn CheckNotifier>,
    renew: Arc<Notify>,
    stop: StopSignal,
}

impl CheckTtl {
    pub fn new(check_id: impl Into<String>, ttl: Duration, notify: Arc<dyn CheckNotifier>) -> Self {
        Self {
            check_id: check_id.into(),
            ttl,
            notify,
            renew: Arc::new(Notify::new()),
            stop: StopSignal::new(),
        }
    }

    /// Arm the TTL timer. Call at most once per check.
    pub fn start(&self, mut shutdown: watch::Receiver<bool>) {
        let check_id = self.check_id.clone();
        let ttl = self.ttl;
        let notify = Arc::clone(&self.notify);
        let renew = Arc::clone(&self.renew);
        let mut stop = self.stop.subscribe();

        tokio::spawn(async move {
            let mut deadline = Some(Instant::now() + ttl);
            loop {
                let expiry = async move {
                    match deadline {
                        Some(at) => sleep_until(at).await,
                        None => std::future::pending::<()>().await,
                    }
                };
                tokio::select! {
                    _ = expiry => {
                        warn!(%check_id, "check missed its TTL, now critical");
                        notify.update_check(&check_id, HealthStatus::Critical, "TTL expired");
                        deadline = None;
                    }
                    _ = renew.notified() => {
                        deadline = Some(Instant::now() + ttl);
                    }
                    _ = stopped(&mut stop, &mut shutdown) => {
                        debug!(%check_id, "ttl check exiting");
                        return;
                    }
                }
            }
        });
    }

    /// Report a status and restart the TTL.
    pub fn set_status(&self, status: HealthStatus, output: &str) {
        debug!(check_id = %self.check_id, %status, "ttl check updated");
        self.notify.update_check(&self.check_id, status, output);
        self.renew.notify_one();
    }

    pub fn stop(&self) {
        if self.stop.fire() {
            debug!(check_id = %self.check_id, "ttl check stopped");
        }
    }
}

// ── Any runner ─────────────────────────────────────────────────────

/// A running check of any kind, as held by the agent.
pub enum CheckRunner {
    Monitor(CheckMonitor),
    Http(CheckHttp),
    Ttl(CheckTtl),
}

impl CheckRunner {
    /// Build the runner for a validated check kind. Not yet started.
    pub fn new(check_id: &str, kind: &CheckKind, notify: Arc<dyn CheckNotifier>) -> Self {
        match kind {
            CheckKind::Ttl { ttl } => CheckRunner::Ttl(CheckTtl::new(check_id, *ttl, notify)),
            CheckKind::Script {
                script,
                interval,
                timeout,
            } => CheckRunner::Monitor(CheckMonitor::new(
                check_id, script, *interval, *timeout, notify,
            )),
            CheckKind::Http {
                url,
                interval,
                timeout,
            } => CheckRunner::Http(CheckHttp::new(check_id, url, *interval, *timeout, notify)),
        }
    }

    pub fn start(&self, shutdown: watch::Receiver<bool>) {
        match self {
            CheckRunner::Monitor(c) => c.start(shutdown),
            CheckRunner::Http(c) => c.start(shutdown),
            CheckRunner::Ttl(c) => c.start(shutdown),
        }
    }

    pub fn stop(&self) {
        match self {
            CheckRunner::Monitor(c) => c.stop(),
            CheckRunner::Http(c) => c.stop(),
            CheckRunner::Ttl(c) => c.stop(),
        }
    }

    pub fn as_ttl(&self) -> Option<&CheckTtl> {
        match self {
            CheckRunner::Ttl(c) => Some(c),
            _ => None,
        }
    }
}

impl Drop for CheckRunner {
    fn drop(&mut self) {
        self.stop();
    }
}
