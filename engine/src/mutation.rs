//! Locally-originated mutations.
//!
//! The collaborator submits a [`Mutation`]; once applied optimistically it
//! becomes a [`PendingMutation`] owned by the tracker until the server confirms
//! or rejects it.

use crate::{
    error::Result, ChangeKind, EntityId, Error, FieldName, MutationId, Payload, Timestamp,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A change requested by the collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mutation {
    /// Target entity
    pub entity_id: EntityId,
    /// Kind of change
    pub kind: ChangeKind,
    /// Field values to write (empty for deletes)
    #[serde(default)]
    pub payload: Payload,
}

impl Mutation {
    /// Create a mutation of any kind.
    pub fn new(entity_id: impl Into<EntityId>, kind: ChangeKind, payload: Payload) -> Self {
        Self {
            entity_id: entity_id.into(),
            kind,
            payload,
        }
    }

    /// Set a single field on an existing entity.
    pub fn set_field(
        entity_id: impl Into<EntityId>,
        field: impl Into<FieldName>,
        value: Value,
    ) -> Self {
        let mut payload = Payload::new();
        payload.insert(field.into(), value);
        Self::new(entity_id, ChangeKind::Updated, payload)
    }

    /// Move an entity to another column.
    pub fn move_to(entity_id: impl Into<EntityId>, column: impl Into<String>) -> Self {
        let mut payload = Payload::new();
        payload.insert("column".to_string(), Value::String(column.into()));
        Self::new(entity_id, ChangeKind::Moved, payload)
    }

    /// Delete an entity.
    pub fn delete(entity_id: impl Into<EntityId>) -> Self {
        Self::new(entity_id, ChangeKind::Deleted, Payload::new())
    }

    /// Check that the mutation is well-formed.
    pub fn validate(&self) -> Result<()> {
        if self.entity_id.is_empty() {
            return Err(Error::InvalidPayload("entity id is empty".into()));
        }
        if self.kind.carries_fields() && self.payload.is_empty() {
            return Err(Error::InvalidPayload(format!(
                "{:?} mutation for {} changes no fields",
                self.kind, self.entity_id
            )));
        }
        Ok(())
    }

    /// Names of the fields this mutation writes, sorted.
    pub fn fields(&self) -> Vec<FieldName> {
        let mut fields: Vec<_> = self.payload.keys().cloned().collect();
        fields.sort();
        fields
    }
}

/// Lifecycle of a pending mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationStatus {
    Pending,
    Confirmed,
    Failed,
}

/// View-model state captured before a mutation was applied.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriorState {
    /// Whether the entity existed in the view model
    pub existed: bool,
    /// Whether the entity was marked deleted
    pub deleted: bool,
    /// Previous value of each touched field (`None` = field was absent)
    pub fields: BTreeMap<FieldName, Option<Value>>,
}

impl PriorState {
    /// Prior field values as a payload, absent fields as `null`.
    pub fn as_payload(&self) -> Payload {
        self.fields
            .iter()
            .map(|(k, v)| (k.clone(), v.clone().unwrap_or(Value::Null)))
            .collect()
    }
}

/// A mutation applied optimistically and not yet settled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingMutation {
    /// Client-generated unique ID (also the idempotency key)
    pub id: MutationId,
    /// Target entity
    pub entity_id: EntityId,
    /// Kind of change
    pub kind: ChangeKind,
    /// Fields the mutation writes
    pub fields_changed: Vec<FieldName>,
    /// Values shown in the view model until settled
    pub optimistic_payload: Payload,
    /// When the mutation was applied locally (ms)
    pub created_at: Timestamp,
    /// Failed delivery attempts so far
    pub attempts: u32,
    /// Current status
    pub status: MutationStatus,
    /// State before the mutation was applied
    pub prior: PriorState,
}

impl PendingMutation {
    /// Build a pending mutation from a submitted one.
    pub fn new(
        id: impl Into<MutationId>,
        mutation: Mutation,
        created_at: Timestamp,
        prior: PriorState,
    ) -> Self {
        Self {
            id: id.into(),
            fields_changed: mutation.fields(),
            entity_id: mutation.entity_id,
            kind: mutation.kind,
            optimistic_payload: mutation.payload,
            created_at,
            attempts: 0,
            status: MutationStatus::Pending,
            prior,
        }
    }

    /// Optimistic value for one field.
    pub fn optimistic_value(&self, field: &str) -> Option<&Value> {
        self.optimistic_payload.get(field)
    }

    /// The mutation as submitted.
    pub fn to_mutation(&self) -> Mutation {
        Mutation::new(
            self.entity_id.clone(),
            self.kind,
            self.optimistic_payload.clone(),
        )
    }
}
