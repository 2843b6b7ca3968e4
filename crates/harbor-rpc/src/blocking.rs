//! Blocking queries and RTT ordering for read endpoints.
//!
//! A read names the tables it depends on. If the caller's
//! `min_query_index` is already behind the highest modify index of those
//! tables the read runs at once; otherwise it parks on the tables' watch
//! channels until one of them moves or the wait runs out. Either way the
//! data and the returned index come from the same snapshot.

use std::cmp::Ordering;
use std::time::Duration;

use futures_util::future::select_all;
use harbor_cluster::random_stagger;
use harbor_state::{QueryMeta, QueryOptions, StateResult, StateSnapshot, Table};
use tokio::time::{Instant, sleep_until};

use crate::error::RpcResult;
use crate::server::RpcServer;

/// Wait applied when the caller gives none.
pub const DEFAULT_QUERY_TIME: Duration = Duration::from_secs(300);

/// Longest wait a caller may ask for.
pub const MAX_QUERY_TIME: Duration = Duration::from_secs(600);

/// Up to `wait / JITTER_FRACTION` is added to every wait so that many
/// watchers of the same index do not all return at once.
const JITTER_FRACTION: u32 = 16;

pub(crate) fn base_wait(opts: &QueryOptions) -> Duration {
    opts.max_query_time
        .filter(|t| !t.is_zero())
        .unwrap_or(DEFAULT_QUERY_TIME)
        .min(MAX_QUERY_TIME)
}

/// Effective wait for one blocking query, jitter included.
pub(crate) fn query_wait(opts: &QueryOptions) -> Duration {
    let wait = base_wait(opts);
    wait + random_stagger(wait / JITTER_FRACTION)
}

/// Longest a blocking query can possibly take.
pub(crate) fn query_wait_bound(opts: &QueryOptions) -> Duration {
    let wait = base_wait(opts);
    wait + wait / JITTER_FRACTION
}

impl RpcServer {
    pub(crate) fn query_meta(&self, index: u64) -> QueryMeta {
        QueryMeta {
            // Zero would make a watching client spin.
            index: index.max(1),
            known_leader: self.consensus.leader().is_some(),
        }
    }

    /// Run `read` once the index of `tables` passes `opts.min_query_index`
    /// or the wait expires.
    pub(crate) async fn blocking_query<T>(
        &self,
        opts: &QueryOptions,
        tables: &[Table],
        read: impl Fn(&StateSnapshot) -> StateResult<T>,
    ) -> RpcResult<(T, QueryMeta)> {
        let mut watches: Vec<_> = tables.iter().map(|t| self.store.watch(*t)).collect();
        let deadline = Instant::now() + query_wait(opts);

        loop {
            // Mark current values seen before reading, so a commit landing
            // between the read and the wait still wakes us.
            for w in &mut watches {
                w.borrow_and_update();
            }
            {
                let snap = self.store.snapshot()?;
                let index = snap.max_index(tables)?;
                if opts.min_query_index == 0
                    || index > opts.min_query_index
                    || watches.is_empty()
                    || Instant::now() >= deadline
                {
                    let value = read(&snap)?;
                    return Ok((value, self.query_meta(index)));
                }
            }

            let changed = select_all(watches.iter_mut().map(|w| Box::pin(w.changed())));
            tokio::select! {
                _ = changed => {}
                _ = sleep_until(deadline) => {}
            }
        }
    }
}

/// Stable-sort `items` by estimated round trip time from `near`. Items
/// whose node has no usable coordinate go last. Without a coordinate for
/// `near` the order is left alone.
pub(crate) fn sort_by_distance<T>(
    snap: &StateSnapshot,
    near: Option<&str>,
    items: &mut Vec<T>,
    node_of: impl Fn(&T) -> &str,
) -> StateResult<()> {
    let Some(near) = near.filter(|n| !n.is_empty()) else {
        return Ok(());
    };
    let Some(origin) = snap.coordinate_get(near)? else {
        return Ok(());
    };

    let mut keyed = Vec::with_capacity(items.len());
    for item in items.drain(..) {
        let dist = snap
            .coordinate_get(node_of(&item))?
            .and_then(|c| origin.distance_to(&c));
        keyed.push((dist, item));
    }
    keyed.sort_by(|(a, _), (b, _)| match (a, b) {
        (Some(a), Some(b)) => a.cmp(b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });
    items.extend(keyed.into_iter().map(|(_, item)| item));
    Ok(())
}
