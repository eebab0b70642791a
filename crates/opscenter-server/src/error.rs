//! Fleet error taxonomy and its mapping onto gRPC status codes.

use tonic::Status;
use tracing::error;

use crate::ports::TransportError;
use crate::storage::DatabaseError;

/// Errors surfaced by fleet lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// A precondition (etag, membership, status) did not hold.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// A remote machine or cluster could not be reached in time.
    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type FleetResult<T> = Result<T, FleetError>;

impl From<DatabaseError> for FleetError {
    fn from(e: DatabaseError) -> Self {
        match e {
            DatabaseError::NotFound(msg) => Self::NotFound(msg),
            DatabaseError::Conflict(msg) => Self::Conflict(msg),
            DatabaseError::Busy(msg) => Self::Unavailable(msg),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<TransportError> for FleetError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Unreachable(_) | TransportError::Timeout(_) => {
                Self::Unavailable(e.to_string())
            }
            TransportError::Rejected(_) => Self::Internal(e.to_string()),
        }
    }
}

impl From<FleetError> for Status {
    fn from(e: FleetError) -> Self {
        match e {
            FleetError::InvalidArgument(msg) => Self::invalid_argument(msg),
            FleetError::NotFound(msg) => Self::not_found(msg),
            FleetError::Conflict(msg) => Self::failed_precondition(msg),
            FleetError::Forbidden(msg) => Self::permission_denied(msg),
            FleetError::Unavailable(msg) => Self::unavailable(msg),
            FleetError::Internal(msg) => {
                error!(error = %msg, "Internal error");
                Self::internal("Internal error")
            }
        }
    }
}
