//! Error types for the Cardsync engine.

use crate::{EntityId, MutationId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// All possible errors from the Cardsync engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Delivery errors
    #[error("transport unavailable")]
    TransportUnavailable,

    #[error("send timed out for mutation {0}")]
    SendTimeout(MutationId),

    #[error("mutation {mutation_id} rejected by server: {reason}")]
    SendRejected {
        mutation_id: MutationId,
        reason: String,
    },

    #[error("mutation {mutation_id} exhausted after {attempts} attempts")]
    QueueExhausted {
        mutation_id: MutationId,
        attempts: u32,
    },

    #[error("metrics failure: {0}")]
    MetricsFailure(String),

    // Lookup errors
    #[error("mutation not found: {0}")]
    MutationNotFound(MutationId),

    #[error("conflict not found: {0}")]
    ConflictNotFound(String),

    #[error("entity not found: {0}")]
    EntityNotFound(EntityId),

    // Validation errors
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("mutation already exists: {0}")]
    DuplicateMutation(MutationId),

    // State errors
    #[error("persistence failure: {0}")]
    Persistence(String),

    #[error("invalid queue snapshot: {0}")]
    InvalidSnapshot(String),
}

/// Classification of failures, independent of their payload.
///
/// `Conflict` is not produced by [`Error`]; conflicts are routed to
/// [`ConflictRecord`](crate::ConflictRecord)s, but the kind is part of the
/// taxonomy collaborators switch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    TransportUnavailable,
    SendTimeout,
    SendRejected,
    Conflict,
    QueueExhausted,
    MetricsFailure,
    NotFound,
    InvalidInput,
    Persistence,
}

impl ErrorKind {
    /// Whether the failed attempt should be retried with backoff.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::TransportUnavailable | ErrorKind::SendTimeout)
    }

    /// Whether the collaborator has to be told about it.
    pub fn surfaces_to_collaborator(self) -> bool {
        matches!(
            self,
            ErrorKind::SendRejected | ErrorKind::Conflict | ErrorKind::QueueExhausted
        )
    }
}

impl Error {
    /// Get the taxonomy kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::TransportUnavailable => ErrorKind::TransportUnavailable,
            Error::SendTimeout(_) => ErrorKind::SendTimeout,
            Error::SendRejected { .. } => ErrorKind::SendRejected,
            Error::QueueExhausted { .. } => ErrorKind::QueueExhausted,
            Error::MetricsFailure(_) => ErrorKind::MetricsFailure,
            Error::MutationNotFound(_) | Error::ConflictNotFound(_) | Error::EntityNotFound(_) => {
                ErrorKind::NotFound
            }
            Error::InvalidPayload(_) | Error::DuplicateMutation(_) => ErrorKind::InvalidInput,
            Error::Persistence(_) | Error::InvalidSnapshot(_) => ErrorKind::Persistence,
        }
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
