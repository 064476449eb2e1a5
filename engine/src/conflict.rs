//! Conflict detection and resolution for inbound updates.
//!
//! # Algorithm
//!
//! For every field an inbound [`Update`] touches:
//!
//! 1. No pending mutation owns the field: apply the server value.
//! 2. The owner's optimistic value equals the server value, or the update
//!    echoes the owner's mutation ID: the field is confirmed.
//! 3. The update echoes an older local mutation that lost the field to a
//!    newer edit: skip the field, the newer edit is still in flight.
//! 4. Otherwise: record one [`ConflictRecord`] per `(entity, field)`, hold the
//!    remote value and leave the field unresolved until [`ConflictResolver::resolve`].
//!
//! Conflicts on different fields are independent. The resolver never picks a
//! side on its own beyond the confirmation fast path.

use crate::{
    error::Result, update::sort_batch, ChangeKind, EntityId, Error, FieldName, Mutation,
    MutationId, OptimisticTracker, Payload, PendingMutation, Timestamp, Update, UpdateId,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Which side wins a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    /// Keep the local value and re-submit it
    Local,
    /// Drop the local value and take the server's
    Remote,
}

/// A divergence between a pending local value and a server value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    /// Conflict ID (`<mutation id>:<field>`)
    pub id: String,
    /// Local mutation holding the field
    pub mutation_id: MutationId,
    /// Entity the conflict is on
    pub entity_id: EntityId,
    /// Conflicting field
    pub field: FieldName,
    /// Optimistic local value
    pub local_value: Value,
    /// Latest server value
    pub remote_value: Value,
    /// Update that carried the remote value
    pub update_id: UpdateId,
    /// Server timestamp of that update
    pub remote_timestamp: Timestamp,
    /// When the conflict was first detected (ms)
    pub detected_at: Timestamp,
}

/// What processing inbound updates did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteOutcome {
    /// Fields whose view value changed
    pub changed: Vec<(EntityId, FieldName)>,
    /// Entities deleted by the server
    pub deleted: Vec<EntityId>,
    /// Mutations fully confirmed by matching values
    pub confirmed: Vec<MutationId>,
    /// Conflicts created or refreshed
    pub conflicts: Vec<ConflictRecord>,
    /// Conflicts that went away because the server converged
    pub settled: Vec<ConflictRecord>,
}

impl RemoteOutcome {
    fn merge(&mut self, other: RemoteOutcome) {
        self.changed.extend(other.changed);
        self.deleted.extend(other.deleted);
        self.confirmed.extend(other.confirmed);
        self.conflicts.extend(other.conflicts);
        self.settled.extend(other.settled);
    }

    /// Check whether nothing happened.
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty()
            && self.deleted.is_empty()
            && self.confirmed.is_empty()
            && self.conflicts.is_empty()
            && self.settled.is_empty()
    }
}

/// What resolving a conflict requires from the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolutionOutcome {
    /// Submit this mutation so the server converges on the local value.
    Resubmit {
        conflict: ConflictRecord,
        mutation: Mutation,
    },
    /// The remote value was applied. When `mutation_spent` is set the local
    /// mutation has nothing left to send; otherwise only `conflict.field`
    /// must be dropped from it.
    AcceptedRemote {
        conflict: ConflictRecord,
        mutation_spent: bool,
    },
}

impl ResolutionOutcome {
    /// The resolved conflict.
    pub fn conflict(&self) -> &ConflictRecord {
        match self {
            ResolutionOutcome::Resubmit { conflict, .. } => conflict,
            ResolutionOutcome::AcceptedRemote { conflict, .. } => conflict,
        }
    }
}

/// Holds unresolved conflicts keyed by `(entity, field)`.
#[derive(Debug, Clone, Default)]
pub struct ConflictResolver {
    conflicts: BTreeMap<(EntityId, FieldName), ConflictRecord>,
}

impl ConflictResolver {
    /// Create an empty resolver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Process a batch of updates in server order.
    pub fn process_batch(
        &mut self,
        tracker: &mut OptimisticTracker,
        mut batch: Vec<Update>,
        now: Timestamp,
    ) -> RemoteOutcome {
        sort_batch(&mut batch);

        let mut outcome = RemoteOutcome::default();
        for update in &batch {
            outcome.merge(self.process(tracker, update, now));
        }
        outcome
    }

    /// Process one inbound update.
    pub fn process(
        &mut self,
        tracker: &mut OptimisticTracker,
        update: &Update,
        now: Timestamp,
    ) -> RemoteOutcome {
        let mut outcome = RemoteOutcome::default();
        let entity_id = &update.entity_id;

        match update.kind {
            ChangeKind::Deleted => {
                outcome.settled = self.take_for_entity(entity_id, tracker);
                tracker.apply_unowned(update);
                outcome.deleted.push(entity_id.clone());
                return outcome;
            }
            ChangeKind::Created if !tracker.view().contains(entity_id) => {
                tracker.view_mut().create(entity_id, &Payload::new());
            }
            _ => {}
        }

        let echo_of_local = update
            .mutation_id
            .as_deref()
            .is_some_and(|id| tracker.is_local(id));

        for (field, remote) in &update.payload {
            let owner = tracker
                .owner(entity_id, field)
                .map(|m| (m.id.clone(), m.optimistic_value(field).cloned()));

            match owner {
                None => {
                    if tracker.view().raw_field(entity_id, field) != Some(remote) {
                        tracker.view_mut().set_field(entity_id, field, remote.clone());
                        outcome.changed.push((entity_id.clone(), field.clone()));
                    }
                }
                Some((owner_id, local))
                    if update.echoes(&owner_id) || local.as_ref() == Some(remote) =>
                {
                    if let Some(settled) = self.take(entity_id, field, tracker) {
                        outcome.settled.push(settled);
                    }
                    if tracker.view().raw_field(entity_id, field) != Some(remote) {
                        tracker.view_mut().set_field(entity_id, field, remote.clone());
                        outcome.changed.push((entity_id.clone(), field.clone()));
                    }
                    if let Ok(true) = tracker.confirm_field(&owner_id, field) {
                        outcome.confirmed.push(owner_id);
                    }
                }
                Some(_) if echo_of_local => {}
                Some((owner_id, local)) => {
                    let record = self.record(
                        &owner_id,
                        update,
                        field,
                        local.unwrap_or(Value::Null),
                        remote.clone(),
                        now,
                    );
                    tracker
                        .view_mut()
                        .mark_conflicted(entity_id, field, remote.clone());
                    outcome.conflicts.push(record);
                }
            }
        }

        outcome
    }

    /// Resolve one conflict.
    pub fn resolve(
        &mut self,
        tracker: &mut OptimisticTracker,
        conflict_id: &str,
        resolution: Resolution,
    ) -> Result<ResolutionOutcome> {
        let key = self
            .conflicts
            .iter()
            .find(|(_, c)| c.id == conflict_id)
            .map(|(k, _)| k.clone())
            .ok_or_else(|| Error::ConflictNotFound(conflict_id.to_string()))?;

        let conflict = self
            .take(&key.0, &key.1, tracker)
            .ok_or_else(|| Error::ConflictNotFound(conflict_id.to_string()))?;

        match resolution {
            Resolution::Local => {
                let kind = match tracker.get(&conflict.mutation_id).map(|m| m.kind) {
                    Some(ChangeKind::Moved) => ChangeKind::Moved,
                    _ => ChangeKind::Updated,
                };
                let mut payload = Payload::new();
                payload.insert(conflict.field.clone(), conflict.local_value.clone());
                let mutation = Mutation::new(conflict.entity_id.clone(), kind, payload);

                Ok(ResolutionOutcome::Resubmit { conflict, mutation })
            }
            Resolution::Remote => {
                let owns = tracker
                    .owner(&conflict.entity_id, &conflict.field)
                    .is_some_and(|m| m.id == conflict.mutation_id);

                let mutation_spent = if owns {
                    tracker.yield_field(
                        &conflict.mutation_id,
                        &conflict.field,
                        conflict.remote_value.clone(),
                    )?
                } else {
                    tracker.view_mut().set_field(
                        &conflict.entity_id,
                        &conflict.field,
                        conflict.remote_value.clone(),
                    );
                    tracker.get(&conflict.mutation_id).is_none()
                };

                Ok(ResolutionOutcome::AcceptedRemote {
                    conflict,
                    mutation_spent,
                })
            }
        }
    }

    /// Resolve every open conflict the same way.
    ///
    /// Each conflict is still decided on its own field; one failing does not
    /// stop the others.
    pub fn resolve_all(
        &mut self,
        tracker: &mut OptimisticTracker,
        resolution: Resolution,
    ) -> Vec<Result<ResolutionOutcome>> {
        let ids: Vec<_> = self.list().into_iter().map(|c| c.id).collect();
        ids.iter()
            .map(|id| self.resolve(tracker, id, resolution))
            .collect()
    }

    /// Drop the conflicts of a mutation its own send just confirmed.
    ///
    /// A held remote value that is newer on the server than the confirming
    /// update still wins the field.
    pub fn on_confirmed(
        &mut self,
        tracker: &mut OptimisticTracker,
        mutation_id: &str,
        confirming: &Update,
    ) -> Vec<ConflictRecord> {
        let settled = self.take_for_mutation(mutation_id, tracker);
        for conflict in &settled {
            if !confirming.is_after(conflict.remote_timestamp, &conflict.update_id)
                && tracker.owner(&conflict.entity_id, &conflict.field).is_none()
            {
                tracker.view_mut().set_field(
                    &conflict.entity_id,
                    &conflict.field,
                    conflict.remote_value.clone(),
                );
            }
        }
        settled
    }

    /// Drop the conflicts of a rejected mutation; the remote values stand.
    pub fn on_reverted(
        &mut self,
        tracker: &mut OptimisticTracker,
        mutation_id: &str,
    ) -> Vec<ConflictRecord> {
        let settled = self.take_for_mutation(mutation_id, tracker);
        for conflict in &settled {
            if tracker.owner(&conflict.entity_id, &conflict.field).is_none() {
                tracker.view_mut().set_field(
                    &conflict.entity_id,
                    &conflict.field,
                    conflict.remote_value.clone(),
                );
            }
        }
        settled
    }

    /// A newer local edit to a conflicted field settles the conflict locally.
    pub fn on_local_edit(
        &mut self,
        tracker: &mut OptimisticTracker,
        pending: &PendingMutation,
    ) -> Vec<ConflictRecord> {
        pending
            .fields_changed
            .iter()
            .filter_map(|field| self.take(&pending.entity_id, field, tracker))
            .collect()
    }

    /// Unresolved conflicts, oldest first.
    pub fn list(&self) -> Vec<ConflictRecord> {
        let mut all: Vec<_> = self.conflicts.values().cloned().collect();
        all.sort_by(|a, b| a.detected_at.cmp(&b.detected_at).then(a.id.cmp(&b.id)));
        all
    }

    /// Get a conflict by ID.
    pub fn get(&self, conflict_id: &str) -> Option<&ConflictRecord> {
        self.conflicts.values().find(|c| c.id == conflict_id)
    }

    /// Count of unresolved conflicts.
    pub fn len(&self) -> usize {
        self.conflicts.len()
    }

    /// Check if there are no unresolved conflicts.
    pub fn is_empty(&self) -> bool {
        self.conflicts.is_empty()
    }

    fn record(
        &mut self,
        mutation_id: &str,
        update: &Update,
        field: &str,
        local_value: Value,
        remote_value: Value,
        now: Timestamp,
    ) -> ConflictRecord {
        let key = (update.entity_id.clone(), field.to_string());
        let record = self
            .conflicts
            .entry(key)
            .and_modify(|c| {
                c.remote_value = remote_value.clone();
                c.local_value = local_value.clone();
                c.update_id = update.id.clone();
                c.remote_timestamp = update.server_timestamp;
            })
            .or_insert_with(|| ConflictRecord {
                id: format!("{}:{}", mutation_id, field),
                mutation_id: mutation_id.to_string(),
                entity_id: update.entity_id.clone(),
                field: field.to_string(),
                local_value,
                remote_value,
                update_id: update.id.clone(),
                remote_timestamp: update.server_timestamp,
                detected_at: now,
            });
        record.clone()
    }

    fn take(
        &mut self,
        entity_id: &str,
        field: &str,
        tracker: &mut OptimisticTracker,
    ) -> Option<ConflictRecord> {
        let conflict = self
            .conflicts
            .remove(&(entity_id.to_string(), field.to_string()))?;
        tracker.view_mut().clear_conflict(entity_id, field);
        Some(conflict)
    }

    fn take_for_entity(
        &mut self,
        entity_id: &str,
        tracker: &mut OptimisticTracker,
    ) -> Vec<ConflictRecord> {
        let fields: Vec<_> = self
            .conflicts
            .keys()
            .filter(|(entity, _)| entity == entity_id)
            .map(|(_, field)| field.clone())
            .collect();

        fields
            .into_iter()
            .filter_map(|field| self.take(entity_id, &field, tracker))
            .collect()
    }

    fn take_for_mutation(
        &mut self,
        mutation_id: &str,
        tracker: &mut OptimisticTracker,
    ) -> Vec<ConflictRecord> {
        let keys: Vec<_> = self
            .conflicts
            .iter()
            .filter(|(_, c)| c.mutation_id == mutation_id)
            .map(|(k, _)| k.clone())
            .collect();

        keys.into_iter()
            .filter_map(|(entity_id, field)| self.take(&entity_id, &field, tracker))
            .collect()
    }
}
