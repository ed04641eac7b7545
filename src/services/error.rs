use displaydoc::Display;
use serde::Serialize;
use thiserror::Error;

use crate::{
    aggregator::AggregationError,
    services::auth::Role,
    state_machine::RoundError,
    storage::StorageError,
};

/// Why a submitted update was rejected.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectedReason {
    /// the signature does not match the payload
    BadSignature,
    /// the timestamp is outside of the freshness window
    StaleTimestamp,
    /// the nonce has already been used
    Replay,
    /// the payload is not a valid update
    MalformedPayload,
    /// the payload exceeds the size limit
    PayloadTooLarge,
}

/// Error type of the boundary operations.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("missing or invalid caller identity")]
    Unauthenticated,

    #[error("caller {0} lacks the {1} role")]
    Forbidden(String, Role),

    #[error("update rejected: {0}")]
    Rejected(RejectedReason),

    #[error("invalid model name {0:?}")]
    InvalidModelName(String),

    #[error("model not found")]
    NotFound,

    #[error("aggregation round failed: {0}")]
    Round(#[from] RoundError),

    #[error("store unavailable: {0}")]
    StoreUnavailable(StorageError),

    #[error("request timed out")]
    Timeout,

    #[error("the operation was cancelled by a shutdown")]
    Cancelled,
}

impl ServiceError {
    /// Whether the same request may succeed when it is retried.
    pub fn is_transient(&self) -> bool {
        match self {
            ServiceError::StoreUnavailable(_)
            | ServiceError::Timeout
            | ServiceError::Cancelled => true,
            ServiceError::Round(RoundError::Aggregation(AggregationError::EmptyBatch)) => false,
            ServiceError::Round(_) => true,
            _ => false,
        }
    }

    /// The reason of a rejected update.
    pub fn rejected_reason(&self) -> Option<RejectedReason> {
        match self {
            ServiceError::Rejected(reason) => Some(*reason),
            _ => None,
        }
    }
}

impl From<RejectedReason> for ServiceError {
    fn from(reason: RejectedReason) -> Self {
        ServiceError::Rejected(reason)
    }
}
