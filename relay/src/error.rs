use std::time::Duration;

use alloy::primitives::Address;
use jsonrpsee::types::ErrorObjectOwned;

use crate::migration::Step;

pub type RelayResult<T> = Result<T, RelayError>;

/// Everything that can go wrong while serving a relay operation.
#[derive(thiserror::Error, Debug)]
pub enum RelayError {
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
    #[error("chain call failed: {cause:#}")]
    ChainCall { cause: anyhow::Error },
    #[error("timed out after {0:?} waiting for the chain")]
    Timeout(Duration),
    #[error("signature recovers to {recovered}, expected {expected}")]
    SignatureMismatch { expected: Address, recovered: Address },
    #[error("migration cannot be canceled in step {0}")]
    InvalidCancelState(Step),
    #[error("migration hash is not known yet")]
    InvalidMigrationHash,
    #[error("{operation} is not allowed in step {step}")]
    InvalidStep { operation: &'static str, step: Step },
    #[error("limit exceeded")]
    RateLimited,
    #[error("token metadata: {0}")]
    Metadata(String),
    #[error("storage failure: {0:#}")]
    Storage(anyhow::Error),
}

impl RelayError {
    pub fn chain(cause: impl Into<anyhow::Error>) -> Self {
        RelayError::ChainCall {
            cause: cause.into(),
        }
    }

    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        RelayError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            RelayError::Validation(_) => -32602,
            RelayError::NotFound { .. } => -32004,
            RelayError::ChainCall { .. } => -32010,
            RelayError::Timeout(_) => -32011,
            RelayError::SignatureMismatch { .. } => -32012,
            RelayError::InvalidCancelState(_) => -32013,
            RelayError::InvalidMigrationHash => -32014,
            RelayError::InvalidStep { .. } => -32015,
            RelayError::RateLimited => -32005,
            RelayError::Metadata(_) => -32016,
            RelayError::Storage(_) => -32603,
        }
    }
}

impl From<rusqlite::Error> for RelayError {
    fn from(error: rusqlite::Error) -> Self {
        RelayError::Storage(error.into())
    }
}

impl From<RelayError> for ErrorObjectOwned {
    fn from(error: RelayError) -> Self {
        ErrorObjectOwned::owned(error.code(), error.to_string(), None::<()>)
    }
}
