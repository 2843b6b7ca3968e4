//! harbor-state — the catalog state store.
//!
//! Backed by [redb](https://docs.rs/redb), holds the authoritative view of
//! nodes, services, health checks, the KV store, sessions and network
//! coordinates for one datacenter.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys join their parts with a NUL byte (`{node}\0{service_id}`)
//! so that a prefix scan over `{node}\0` yields everything a node owns.
//! Secondary index tables (service name, check status) hold empty values
//! and point back at the primary rows.
//!
//! Every mutation takes the replicated log index that caused it. The store
//! records, per table, the last index that modified it; blocking queries
//! use [`StateStore::watch`] to sleep until that index moves.
//!
//! Reads go through [`StateSnapshot`], a redb read transaction. A snapshot
//! taken before a write never observes that write, which is what gives the
//! FSM consistent snapshots while the live store keeps mutating.

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| $crate::error::StateError::$variant(e.to_string())
    };
}

pub mod error;
pub mod requests;
pub mod snapshot;
pub mod store;
pub mod tables;
pub mod types;

mod kvs;

pub use error::{StateError, StateResult};
pub use requests::*;
pub use snapshot::{StateSnapshot, StoreDump};
pub use store::StateStore;
pub use tables::Table;
pub use types::*;
