//! Wire shapes shared by the client and the reference server.

use crate::{ChangeKind, EntityId, Mutation, MutationId, Payload, PendingMutation, Timestamp, Update};
use serde::{Deserialize, Serialize};

/// Response of `GET /updates?since=<cursor>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollResponse {
    pub updates: Vec<Update>,
    /// Cursor for the next poll
    pub server_time: Timestamp,
}

/// Frames exchanged over the push socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushFrame {
    Update { update: Update },
    Ping,
    Pong,
}

/// Body of `POST /mutations`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationRequest {
    /// Idempotency key
    pub mutation_id: MutationId,
    pub entity_id: EntityId,
    pub kind: ChangeKind,
    #[serde(default)]
    pub payload: Payload,
}

impl MutationRequest {
    pub fn new(mutation_id: impl Into<MutationId>, mutation: Mutation) -> Self {
        Self {
            mutation_id: mutation_id.into(),
            entity_id: mutation.entity_id,
            kind: mutation.kind,
            payload: mutation.payload,
        }
    }

    /// The mutation without its key.
    pub fn to_mutation(&self) -> Mutation {
        Mutation::new(self.entity_id.clone(), self.kind, self.payload.clone())
    }
}

impl From<&PendingMutation> for MutationRequest {
    fn from(pending: &PendingMutation) -> Self {
        Self::new(pending.id.clone(), pending.to_mutation())
    }
}

/// Successful `POST /mutations` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationResponse {
    pub mutation_id: MutationId,
    /// The update the mutation produced
    pub update: Update,
    /// Set when the key was already processed
    #[serde(default)]
    pub duplicate: bool,
}

/// Body of a 409/410/422 `POST /mutations` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rejection {
    pub mutation_id: MutationId,
    pub reason: String,
}

/// HTTP statuses that mean the server refused a mutation for good.
pub const REJECTION_STATUSES: [u16; 3] = [409, 410, 422];

/// Check whether an HTTP status is a final rejection.
pub fn is_rejection_status(status: u16) -> bool {
    REJECTION_STATUSES.contains(&status)
}
