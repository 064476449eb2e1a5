//! Server-originated updates.
//!
//! An [`Update`] is the server's record of a change to one entity. Updates are
//! immutable once received and are totally ordered by
//! `(server_timestamp, id)`.

use crate::{EntityId, MutationId, Payload, Timestamp, UpdateId, UserId};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// What kind of change an update or mutation describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Updated,
    Moved,
    Deleted,
}

impl ChangeKind {
    /// Whether the change carries field values.
    pub fn carries_fields(self) -> bool {
        !matches!(self, ChangeKind::Deleted)
    }
}

/// A change to an entity as recorded by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Update {
    /// Server-assigned update ID
    pub id: UpdateId,
    /// Entity the update applies to
    pub entity_id: EntityId,
    /// Kind of change
    pub kind: ChangeKind,
    /// Field values written by this update
    #[serde(default)]
    pub payload: Payload,
    /// User whose action produced the update
    pub origin_user_id: UserId,
    /// Server clock at the time the update was recorded (ms)
    pub server_timestamp: Timestamp,
    /// Idempotency key of the mutation that produced this update, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mutation_id: Option<MutationId>,
}

impl Update {
    /// Create a new update without a mutation echo.
    pub fn new(
        id: impl Into<UpdateId>,
        entity_id: impl Into<EntityId>,
        kind: ChangeKind,
        payload: Payload,
        origin_user_id: impl Into<UserId>,
        server_timestamp: Timestamp,
    ) -> Self {
        Self {
            id: id.into(),
            entity_id: entity_id.into(),
            kind,
            payload,
            origin_user_id: origin_user_id.into(),
            server_timestamp,
            mutation_id: None,
        }
    }

    /// Attach the mutation ID this update confirms.
    pub fn with_mutation_id(mut self, mutation_id: impl Into<MutationId>) -> Self {
        self.mutation_id = Some(mutation_id.into());
        self
    }

    /// Check whether this update echoes the given mutation.
    pub fn echoes(&self, mutation_id: &str) -> bool {
        self.mutation_id.as_deref() == Some(mutation_id)
    }

    /// Total ordering used when applying batches: timestamp, then id.
    pub fn order(&self, other: &Update) -> Ordering {
        match self.server_timestamp.cmp(&other.server_timestamp) {
            Ordering::Equal => self.id.cmp(&other.id),
            other => other,
        }
    }

    /// Check whether this update comes strictly after another in server order.
    pub fn is_after(&self, other_timestamp: Timestamp, other_id: &str) -> bool {
        match self.server_timestamp.cmp(&other_timestamp) {
            Ordering::Equal => self.id.as_str() > other_id,
            ordering => ordering == Ordering::Greater,
        }
    }
}

/// Sort a batch of updates into application order.
pub fn sort_batch(batch: &mut [Update]) {
    batch.sort_by(|a, b| a.order(b));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload;
    use serde_json::json;

    fn update(id: &str, ts: Timestamp) -> Update {
        Update::new(
            id,
            "c1",
            ChangeKind::Moved,
            payload(json!({"column": "done"})),
            "u1",
            ts,
        )
    }

    #[test]
    fn orders_by_timestamp_then_id() {
        let mut batch = vec![update("b", 20), update("c", 10), update("a", 20)];
        sort_batch(&mut batch);

        let ids: Vec<_> = batch.iter().map(|u| u.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[test]
    fn is_after_breaks_ties_by_id() {
        let u = update("b", 20);
        assert!(u.is_after(19, "z"));
        assert!(u.is_after(20, "a"));
        assert!(!u.is_after(20, "c"));
        assert!(!u.is_after(21, "a"));
    }

    #[test]
    fn echoes_mutation_id() {
        let u = update("a", 1).with_mutation_id("m-1");
        assert!(u.echoes("m-1"));
        assert!(!u.echoes("m-2"));
        assert!(!update("a", 1).echoes("m-1"));
    }

    #[test]
    fn serialization_format() {
        let u = update("a", 1000).with_mutation_id("m-1");
        let json = serde_json::to_string(&u).unwrap();
        assert!(json.contains("\"entityId\":\"c1\""));
        assert!(json.contains("\"kind\":\"moved\""));
        assert!(json.contains("\"serverTimestamp\":1000"));
        assert!(json.contains("\"mutationId\":\"m-1\""));

        let parsed: Update = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, u);
    }

    #[test]
    fn mutation_id_is_optional_on_the_wire() {
        let json = r#"{
            "id": "u-1",
            "entityId": "c1",
            "kind": "deleted",
            "originUserId": "alice",
            "serverTimestamp": 5
        }"#;
        let parsed: Update = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.mutation_id, None);
        assert!(parsed.payload.is_empty());
        assert!(!parsed.kind.carries_fields());
    }
}
