//! The write path seen from the RPC layer.
//!
//! Endpoints never touch openraft directly. They hand a [`Command`] to a
//! [`Consensus`] and get back the FSM's response once it is committed and
//! applied. [`RaftConsensus`] is the clustered implementation;
//! [`InlineConsensus`] applies in-process and backs single-node dev mode
//! and tests.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use harbor_state::StateStore;
use openraft::BasicNode;
use openraft::error::{ClientWriteError, InitializeError, RaftError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::command::{Command, CommandResponse, HarborRaft};
use crate::fsm::CatalogFsm;

#[derive(Debug, Error)]
pub enum ConsensusError {
    /// This server cannot commit; `leader` is the RPC address of the
    /// server that can, when known.
    #[error("not the leader")]
    NotLeader { leader: Option<String> },

    #[error("consensus failure: {0}")]
    Failed(String),
}

/// Where writes currently go.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderInfo {
    pub id: u64,
    pub addr: String,
}

/// Replicated command log.
#[async_trait]
pub trait Consensus: Send + Sync {
    /// Append `cmd`, wait for commit and apply, return the FSM's answer.
    async fn apply(&self, cmd: Command) -> Result<CommandResponse, ConsensusError>;

    fn is_leader(&self) -> bool;

    fn leader(&self) -> Option<LeaderInfo>;

    /// RPC addresses of every voter.
    fn peers(&self) -> Vec<String>;

    /// Bring a server into the voter set, first as a learner so it catches
    /// up before it counts toward quorum. No-op if it already votes.
    async fn add_server(&self, id: u64, addr: &str) -> Result<(), ConsensusError>;

    async fn remove_server(&self, id: u64) -> Result<(), ConsensusError>;
}

fn write_error(e: RaftError<u64, ClientWriteError<u64, BasicNode>>) -> ConsensusError {
    match e {
        RaftError::APIError(ClientWriteError::ForwardToLeader(fwd)) => ConsensusError::NotLeader {
            leader: fwd.leader_node.map(|n| n.addr),
        },
        other => ConsensusError::Failed(other.to_string()),
    }
}

/// openraft-backed consensus.
pub struct RaftConsensus {
    raft: HarborRaft,
    id: u64,
}

impl RaftConsensus {
    pub fn new(raft: HarborRaft, id: u64) -> Self {
        Self { raft, id }
    }

    pub fn raft(&self) -> &HarborRaft {
        &self.raft
    }

    /// Bootstrap a cluster whose only voter is this server. Harmless on a
    /// server that already has log state.
    pub async fn bootstrap(&self, addr: &str) -> Result<(), ConsensusError> {
        let mut members = BTreeMap::new();
        members.insert(self.id, BasicNode::new(addr));
        match self.raft.initialize(members).await {
            Ok(()) => {
                info!(raft_id = self.id, %addr, "bootstrapped raft cluster");
                Ok(())
            }
            Err(RaftError::APIError(InitializeError::NotAllowed(e))) => {
                debug!(error = %e, "raft already initialized");
                Ok(())
            }
            Err(e) => Err(ConsensusError::Failed(e.to_string())),
        }
    }

    fn voters(&self) -> BTreeSet<u64> {
        let metrics = self.raft.metrics().borrow().clone();
        metrics.membership_config.membership().voter_ids().collect()
    }
}

#[async_trait]
impl Consensus for RaftConsensus {
    async fn apply(&self, cmd: Command) -> Result<CommandResponse, ConsensusError> {
        let kind = cmd.kind();
        let resp = self.raft.client_write(cmd).await.map_err(|e| {
            let err = write_error(e);
            if !matches!(err, ConsensusError::NotLeader { .. }) {
                warn!(kind, error = %err, "raft apply failed");
            }
            err
        })?;
        debug!(kind, index = resp.log_id.index, "raft apply committed");
        Ok(resp.data)
    }

    fn is_leader(&self) -> bool {
        self.raft.metrics().borrow().current_leader == Some(self.id)
    }

    fn leader(&self) -> Option<LeaderInfo> {
        let metrics = self.raft.metrics().borrow().clone();
        let id = metrics.current_leader?;
        let node = metrics.membership_config.membership().get_node(&id)?;
        Some(LeaderInfo {
            id,
            addr: node.addr.clone(),
        })
    }

    fn peers(&self) -> Vec<String> {
        let metrics = self.raft.metrics().borrow().clone();
        let membership = metrics.membership_config.membership();
        membership
            .voter_ids()
            .filter_map(|id| membership.get_node(&id).map(|n| n.addr.clone()))
            .collect()
    }

    async fn add_server(&self, id: u64, addr: &str) -> Result<(), ConsensusError> {
        let mut voters = self.voters();
        if voters.contains(&id) {
            return Ok(());
        }
        self.raft
            .add_learner(id, BasicNode::new(addr), true)
            .await
            .map_err(write_error)?;
        voters.insert(id);
        self.raft
            .change_membership(voters, false)
            .await
            .map_err(write_error)?;
        info!(raft_id = id, %addr, "added raft voter");
        Ok(())
    }

    async fn remove_server(&self, id: u64) -> Result<(), ConsensusError> {
        let mut voters = self.voters();
        if !voters.remove(&id) {
            return Ok(());
        }
        self.raft
            .change_membership(voters, false)
            .await
            .map_err(write_error)?;
        info!(raft_id = id, "removed raft voter");
        Ok(())
    }
}

/// Single-server consensus: commands apply in submission order against
/// the local FSM with a monotonically increasing index.
pub struct InlineConsensus {
    fsm: CatalogFsm,
    addr: String,
    next_index: Mutex<u64>,
}

impl InlineConsensus {
    /// Continue numbering after the highest index already in `store`.
    pub fn new(store: StateStore, addr: impl Into<String>) -> Result<Self, ConsensusError> {
        let last = store
            .max_index(&harbor_state::Table::ALL)
            .map_err(|e| ConsensusError::Failed(e.to_string()))?;
        Ok(Self {
            fsm: CatalogFsm::new(store),
            addr: addr.into(),
            next_index: Mutex::new(last),
        })
    }
}

#[async_trait]
impl Consensus for InlineConsensus {
    async fn apply(&self, cmd: Command) -> Result<CommandResponse, ConsensusError> {
        let mut index = self.next_index.lock().await;
        *index += 1;
        self.fsm
            .apply_command(*index, &cmd)
            .map_err(|e| ConsensusError::Failed(e.to_string()))
    }

    fn is_leader(&self) -> bool {
        true
    }

    fn leader(&self) -> Option<LeaderInfo> {
        Some(LeaderInfo {
            id: 0,
            addr: self.addr.clone(),
        })
    }

    fn peers(&self) -> Vec<String> {
        vec![self.addr.clone()]
    }

    async fn add_server(&self, id: u64, addr: &str) -> Result<(), ConsensusError> {
        debug!(raft_id = id, %addr, "inline consensus ignores new servers");
        Ok(())
    }

    async fn remove_server(&self, _id: u64) -> Result<(), ConsensusError> {
        Ok(())
    }
}
