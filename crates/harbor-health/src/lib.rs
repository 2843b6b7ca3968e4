//! harbor-health — health check schedulers for the local agent.
//!
//! Every check reports through a [`CheckNotifier`]. Probe failures never
//! surface as errors: a script that cannot spawn or an HTTP endpoint that
//! refuses the connection simply reports `critical`.
//!
//! # Architecture
//!
//! ```text
//! CheckType ── validate() ──► CheckKind
//!   ├── Script { script, interval } ──► CheckMonitor ── run_script()
//!   ├── Http   { url, interval }    ──► CheckHttp    ── http_get()
//!   └── Ttl    { ttl }              ──► CheckTtl     ◄── set_status()
//!                                          │
//!                                          ▼
//!                                   CheckNotifier::update_check
//! ```
//!
//! Interval checks wait a random stagger before their first probe so a
//! freshly started agent does not fire all of its checks at once. Each
//! runner owns one task that exits on its own `stop()` or on the agent's
//! shutdown signal, whichever comes first.

pub mod check_type;
pub mod error;
pub mod probe;
pub mod runner;

pub use check_type::{CheckKind, CheckType, parse_duration};
pub use error::{CheckError, CheckResult};
pub use probe::{CHECK_BUF_SIZE, http_get, run_script, truncate_output};
pub use runner::{CheckHttp, CheckMonitor, CheckNotifier, CheckRunner, CheckTtl};
