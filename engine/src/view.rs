//! The UI-facing view model.
//!
//! Holds the current (optimistic) value of every entity field the client
//! knows about. Fields under an unresolved conflict read as
//! [`FieldValue::Conflicted`] rather than either side's value, both through
//! [`ViewModel::field`] and in the [`Entity`] snapshots the view hands out.

use crate::{mutation::PriorState, EntityId, FieldName, Payload};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// An entity as shown to the collaborator.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    /// Entity ID
    pub id: EntityId,
    /// Current field values
    pub fields: BTreeMap<FieldName, FieldValue>,
    /// Tombstone flag
    pub deleted: bool,
}

impl Entity {
    /// Check if entity is active (not deleted).
    pub fn is_active(&self) -> bool {
        !self.deleted
    }

    /// Settled value of a field. `None` if the field is missing or in conflict.
    pub fn value(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)?.settled()
    }

    /// Fields with an unresolved conflict.
    pub fn conflicted_fields(&self) -> impl Iterator<Item = &FieldName> {
        self.fields
            .iter()
            .filter(|(_, value)| value.is_conflicted())
            .map(|(field, _)| field)
    }
}

/// What the collaborator sees for one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum FieldValue {
    /// A single value, optimistic or confirmed
    Settled { value: Value },
    /// Local and remote disagree; awaiting resolution
    Conflicted { local: Value, remote: Value },
}

impl FieldValue {
    /// The settled value, if the field is not in conflict.
    pub fn settled(&self) -> Option<&Value> {
        match self {
            FieldValue::Settled { value } => Some(value),
            FieldValue::Conflicted { .. } => None,
        }
    }

    /// Check if the field is in conflict.
    pub fn is_conflicted(&self) -> bool {
        matches!(self, FieldValue::Conflicted { .. })
    }
}

/// Stored state of one entity.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Record {
    fields: Payload,
    deleted: bool,
    /// Held remote values of conflicted fields
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    conflicts: BTreeMap<FieldName, Value>,
}

impl Record {
    fn read(&self, field: &str) -> Option<FieldValue> {
        let local = self.fields.get(field);
        match self.conflicts.get(field) {
            Some(remote) => Some(FieldValue::Conflicted {
                local: local.cloned().unwrap_or(Value::Null),
                remote: remote.clone(),
            }),
            None => local.map(|value| FieldValue::Settled {
                value: value.clone(),
            }),
        }
    }

    fn to_entity(&self, id: &str) -> Entity {
        let fields = self
            .fields
            .keys()
            .chain(self.conflicts.keys())
            .filter_map(|field| Some((field.clone(), self.read(field)?)))
            .collect();
        Entity {
            id: id.to_string(),
            fields,
            deleted: self.deleted,
        }
    }
}

/// In-memory view model keyed by entity ID.
///
/// Serializes with conflict markers kept, so a restored view still shows
/// unresolved fields as conflicted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewModel {
    entities: BTreeMap<EntityId, Record>,
}

impl ViewModel {
    /// Create an empty view model.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get an active entity by ID.
    pub fn get(&self, id: &str) -> Option<Entity> {
        self.active(id).map(|record| record.to_entity(id))
    }

    /// Get an entity including deleted ones.
    pub fn get_including_deleted(&self, id: &str) -> Option<Entity> {
        self.entities.get(id).map(|record| record.to_entity(id))
    }

    /// Check if an active entity exists.
    pub fn contains(&self, id: &str) -> bool {
        self.active(id).is_some()
    }

    /// Read one field of an active entity.
    pub fn field(&self, entity_id: &str, field: &str) -> Option<FieldValue> {
        self.active(entity_id)?.read(field)
    }

    /// Raw current value of a field, ignoring conflict state.
    pub fn raw_field(&self, entity_id: &str, field: &str) -> Option<&Value> {
        self.entities.get(entity_id)?.fields.get(field)
    }

    /// All active entities.
    pub fn entities(&self) -> impl Iterator<Item = Entity> + '_ {
        self.entities
            .iter()
            .filter(|(_, record)| !record.deleted)
            .map(|(id, record)| record.to_entity(id))
    }

    /// Count of active entities.
    pub fn len(&self) -> usize {
        self.entities.values().filter(|r| !r.deleted).count()
    }

    /// Check if the view has no active entities.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Capture the state of the given fields before changing them.
    pub fn capture(&self, entity_id: &str, fields: &[FieldName]) -> PriorState {
        let record = self.entities.get(entity_id);
        PriorState {
            existed: record.is_some(),
            deleted: record.map(|r| r.deleted).unwrap_or(false),
            fields: fields
                .iter()
                .map(|f| (f.clone(), record.and_then(|r| r.fields.get(f)).cloned()))
                .collect(),
        }
    }

    /// Create an entity, replacing any tombstone.
    pub fn create(&mut self, entity_id: &str, payload: &Payload) {
        let record = self.record_mut(entity_id);
        record.deleted = false;
        for (field, value) in payload {
            record.fields.insert(field.clone(), value.clone());
        }
    }

    /// Write one field, creating the entity if needed.
    pub fn set_field(&mut self, entity_id: &str, field: &str, value: Value) {
        self.record_mut(entity_id)
            .fields
            .insert(field.to_string(), value);
    }

    /// Write several fields.
    pub fn set_fields(&mut self, entity_id: &str, payload: &Payload) {
        for (field, value) in payload {
            self.set_field(entity_id, field, value.clone());
        }
    }

    /// Mark an entity deleted (tombstone).
    pub fn mark_deleted(&mut self, entity_id: &str) {
        self.record_mut(entity_id).deleted = true;
    }

    /// Restore captured state for the given fields.
    ///
    /// The entity's existence and tombstone are restored only when
    /// `restore_existence` is set.
    pub fn restore(
        &mut self,
        entity_id: &str,
        prior: &PriorState,
        fields: &[FieldName],
        restore_existence: bool,
    ) {
        if restore_existence && !prior.existed {
            self.entities.remove(entity_id);
            return;
        }

        let Some(record) = self.entities.get_mut(entity_id) else {
            return;
        };

        if restore_existence {
            record.deleted = prior.deleted;
        }

        for field in fields {
            match prior.fields.get(field) {
                Some(Some(value)) => {
                    record.fields.insert(field.clone(), value.clone());
                }
                Some(None) => {
                    record.fields.remove(field);
                }
                None => {}
            }
        }
    }

    /// Hold a remote value for a conflicted field.
    pub fn mark_conflicted(&mut self, entity_id: &str, field: &str, remote: Value) {
        self.record_mut(entity_id)
            .conflicts
            .insert(field.to_string(), remote);
    }

    /// Drop the conflict marker of a field.
    pub fn clear_conflict(&mut self, entity_id: &str, field: &str) -> Option<Value> {
        self.entities.get_mut(entity_id)?.conflicts.remove(field)
    }

    fn active(&self, id: &str) -> Option<&Record> {
        self.entities.get(id).filter(|r| !r.deleted)
    }

    fn record_mut(&mut self, entity_id: &str) -> &mut Record {
        self.entities.entry(entity_id.to_string()).or_default()
    }
}
