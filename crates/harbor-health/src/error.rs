use thiserror::Error;

pub type CheckResult<T> = Result<T, CheckError>;

#[derive(Debug, Error)]
pub enum CheckError {
    /// The check definition names no usable probe.
    #[error("invalid check definition: {0}")]
    Invalid(String),

    #[error("check {0:?} is not a TTL check")]
    NotTtl(String),

    #[error("unknown check {0:?}")]
    UnknownCheck(String),
}
