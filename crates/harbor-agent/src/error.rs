use harbor_health::CheckError;
use harbor_rpc::RpcError;
use thiserror::Error;

pub type AgentResult<T> = Result<T, AgentError>;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Check(#[from] CheckError),

    /// A check referenced a service this agent does not have.
    #[error("check {check_id:?} refers to unknown service {service_id:?}")]
    UnknownService { check_id: String, service_id: String },

    #[error("{0}")]
    Invalid(String),

    #[error(transparent)]
    Rpc(#[from] RpcError),
}
