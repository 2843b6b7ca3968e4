//! harbor-agent — the per-node agent.
//!
//! The agent owns this node's services and checks ([`LocalState`]) and
//! keeps the catalog in line with them through anti-entropy: periodic full
//! syncs that diff local state against the catalog, and incremental syncs
//! that push each change as it happens. Check runners from
//! `harbor-health` report into the local state through
//! [`harbor_health::CheckNotifier`].
//!
//! # Sync states
//!
//! | Local | Catalog | Action |
//! |---|---|---|
//! | present | equal | none |
//! | present | missing or different | `Catalog.Register` |
//! | removed | present | `Catalog.Deregister` |
//! | - | cluster-managed (`harbor`, `serfHealth`) | none |

pub mod agent;
pub mod anti_entropy;
pub mod error;
pub mod local;

#[cfg(test)]
mod testing;

pub use agent::Agent;
pub use anti_entropy::SYNC_RETRY_INTERVAL;
pub use error::{AgentError, AgentResult};
pub use local::{CriticalCheck, LocalConfig, LocalState, LocalStats, SyncStatus};
