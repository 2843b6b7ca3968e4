use harbor_raft::{ConsensusError, TransportError};
use harbor_state::StateError;
use thiserror::Error;

pub type RpcResult<T> = Result<T, RpcError>;

/// Everything an endpoint can fail with. Nothing here is retried inside
/// the server; callers decide.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("no cluster leader")]
    NoLeader,

    #[error("no path to datacenter {0:?}")]
    NoDcPath(String),

    #[error("no known servers")]
    NoServers,

    /// Malformed request, rejected before it reached the log.
    #[error("{0}")]
    Validation(String),

    /// Committed, but the state machine refused it.
    #[error("{0}")]
    Apply(String),

    #[error(transparent)]
    Consensus(#[from] ConsensusError),

    #[error("unknown rpc method {0:?}")]
    UnknownMethod(String),

    #[error("decode: {0}")]
    Decode(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Error string returned by the server that handled a forwarded call.
    #[error("{0}")]
    Remote(String),

    #[error(transparent)]
    State(#[from] StateError),
}
