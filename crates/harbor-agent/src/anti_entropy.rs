//! The anti-entropy loop.
//!
//! A full sync diffs local state against the catalog; between full syncs,
//! every trigger pushes whatever is out of sync. A failed full sync is
//! retried after a cluster-size-scaled interval, or as soon as a server
//! becomes reachable.

use std::sync::Arc;
use std::time::Duration;

use harbor_cluster::{Membership, ae_scale, random_stagger};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::local::LocalState;

/// Base wait before retrying a failed full sync.
pub const SYNC_RETRY_INTERVAL: Duration = Duration::from_secs(15);

enum Wake {
    Retry,
    Shutdown,
}

impl LocalState {
    /// Run until `shutdown` flips to `true`.
    pub async fn run_anti_entropy(
        self: Arc<Self>,
        membership: Arc<dyn Membership>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut server_up = membership.server_up();
        let mut trigger = self.trigger_rx.lock().await;
        info!(node = %self.config().node_name, "anti-entropy started");

        loop {
            // Full sync, retried until it succeeds.
            loop {
                if *shutdown.borrow_and_update() {
                    return;
                }
                server_up.borrow_and_update();
                let err = match self.set_sync_state().await {
                    Ok(()) => break,
                    Err(e) => e,
                };
                let members = membership.lan_members().len();
                let wait =
                    ae_scale(SYNC_RETRY_INTERVAL, members) + random_stagger(SYNC_RETRY_INTERVAL);
                warn!(error = %err, retry_in = ?wait, "full sync failed");

                let wake = tokio::select! {
                    _ = tokio::time::sleep(wait) => Wake::Retry,
                    Ok(()) = server_up.changed() => {
                        debug!("server reachable, retrying full sync");
                        Wake::Retry
                    }
                    _ = shutdown.changed() => Wake::Shutdown,
                };
                if let Wake::Shutdown = wake {
                    info!("anti-entropy stopped");
                    return;
                }
            }

            // Push what the full sync found.
            self.trigger_sync();

            let interval = ae_scale(self.config().ae_interval, membership.lan_members().len());
            let next_full = tokio::time::sleep(interval + random_stagger(interval));
            tokio::pin!(next_full);

            loop {
                tokio::select! {
                    _ = &mut next_full => break,
                    Some(()) = trigger.recv() => {
                        if self.is_paused() {
                            debug!("sync paused, skipping");
                            continue;
                        }
                        if let Err(e) = self.sync_changes().await {
                            warn!(error = %e, "failed to sync changes");
                        }
                    }
                    _ = shutdown.changed() => {
                        info!("anti-entropy stopped");
                        return;
                    }
                }
            }
        }
    }
}
