// openraft's StorageError is large; every storage method returns it.
#![allow(clippy::result_large_err)]

//! harbor-raft — replicated log and catalog state machine.
//!
//! Every durable catalog mutation is a [`Command`] appended to an openraft
//! log and applied, in log order, by [`CatalogFsm`] against the shared
//! [`harbor_state::StateStore`]. Peers talk to each other over HTTP/JSON.
//!
//! # Architecture
//!
//! - **`command`** — Log payloads (`Command`, `CommandResponse`) and `TypeConfig`
//! - **`fsm`** — State machine: deterministic apply, snapshot, restore
//! - **`log_store`** — Raft log storage backed by redb
//! - **`node_map`** — Stable mapping from node names to raft ids
//! - **`network`** — HTTP network transport and the axum routes serving it
//! - **`transport`** — Minimal hyper client for JSON POSTs
//! - **`consensus`** — The `Consensus` seam RPC endpoints write through

pub mod command;
pub mod consensus;
pub mod fsm;
pub mod log_store;
pub mod network;
pub mod node_map;
pub mod transport;

pub use command::{Command, CommandResponse, HarborRaft, TypeConfig};
pub use consensus::{Consensus, ConsensusError, InlineConsensus, LeaderInfo, RaftConsensus};
pub use fsm::{CatalogFsm, FsmSnapshotBuilder};
pub use log_store::LogStore;
pub use network::{NetworkConnection, NetworkFactory, raft_routes};
pub use node_map::NodeIdMap;
pub use transport::{TransportError, post_json};
