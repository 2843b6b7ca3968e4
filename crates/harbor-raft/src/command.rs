//! Raft type configuration for Harbor.
//!
//! A log entry carries one [`Command`]; applying it yields one
//! [`CommandResponse`].

use std::io::Cursor;

use harbor_state::{
    CoordinateEntry, DeregisterRequest, KvsAtomicRequest, KvsAtomicResponse, KvsRequest,
    RegisterRequest, SessionRequest,
};
use openraft::TokioRuntime;

/// Client write submitted to the Raft cluster.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum Command {
    Register(RegisterRequest),
    Deregister(DeregisterRequest),
    Kvs(KvsRequest),
    Txn(KvsAtomicRequest),
    Session(SessionRequest),
    CoordinateBatchUpdate(Vec<CoordinateEntry>),
}

impl Command {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Command::Register(_) => "register",
            Command::Deregister(_) => "deregister",
            Command::Kvs(_) => "kvs",
            Command::Txn(_) => "txn",
            Command::Session(_) => "session",
            Command::CoordinateBatchUpdate(_) => "coordinate_batch_update",
        }
    }
}

/// Result of applying a [`Command`].
///
/// A command that commits but breaks a catalog rule (lock held elsewhere,
/// unknown session, missing node) still occupies its log slot; the
/// failure travels back as [`CommandResponse::Error`].
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum CommandResponse {
    Ok,
    Bool(bool),
    SessionId(String),
    Txn(KvsAtomicResponse),
    Error(String),
}

openraft::declare_raft_types!(
    /// Harbor Raft type configuration.
    pub TypeConfig:
        D = Command,
        R = CommandResponse,
        NodeId = u64,
        Node = openraft::BasicNode,
        Entry = openraft::Entry<TypeConfig>,
        SnapshotData = Cursor<Vec<u8>>,
        AsyncRuntime = TokioRuntime,
);

/// Convenience alias for the Raft instance.
pub type HarborRaft = openraft::Raft<TypeConfig>;
