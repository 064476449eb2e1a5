//! Optimistic update tracking.
//!
//! The tracker applies local mutations to the [`ViewModel`] immediately and
//! remembers enough to confirm or undo them once the server answers.
//!
//! # Field ownership
//!
//! Every `(entity, field)` pair is owned by at most one pending mutation. A
//! newer local edit to the same field takes ownership; a mutation left without
//! any owned field is superseded and its record dropped. Only owned fields are
//! restored on revert and shielded from server values on confirm.

use crate::{
    error::Result, update::Update, ChangeKind, EntityId, Error, FieldName,
    Mutation, MutationId, MutationStatus, Payload, PendingMutation, Timestamp, ViewModel,
};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Settled mutation IDs remembered for recognising late echoes.
pub const RECENT_LIMIT: usize = 1024;

/// A pending mutation plus the fields it still owns.
#[derive(Debug, Clone)]
struct Tracked {
    mutation: PendingMutation,
    owned: BTreeSet<FieldName>,
}

impl Tracked {
    /// Create and delete mutations also own the entity's existence.
    fn owns_existence(&self) -> bool {
        matches!(self.mutation.kind, ChangeKind::Created | ChangeKind::Deleted)
    }

    fn is_spent(&self) -> bool {
        self.owned.is_empty() && !self.owns_existence()
    }
}

/// Result of confirming a mutation against a server update.
#[derive(Debug, Clone, PartialEq)]
pub struct Confirmation {
    /// The mutation that was confirmed, if it was still tracked
    pub mutation: Option<PendingMutation>,
    /// Fields overwritten with a server value that differed from the view
    pub changed_fields: Vec<FieldName>,
}

/// Tracks optimistic mutations against the view model.
#[derive(Debug, Clone, Default)]
pub struct OptimisticTracker {
    view: ViewModel,
    pending: BTreeMap<MutationId, Tracked>,
    owners: BTreeMap<(EntityId, FieldName), MutationId>,
    superseded: BTreeSet<MutationId>,
    recent: VecDeque<MutationId>,
}

impl OptimisticTracker {
    /// Create a tracker over an empty view model.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a tracker over an existing view model.
    pub fn with_view(view: ViewModel) -> Self {
        Self {
            view,
            ..Self::default()
        }
    }

    /// Get the view model.
    pub fn view(&self) -> &ViewModel {
        &self.view
    }

    /// Get the view model mutably.
    pub fn view_mut(&mut self) -> &mut ViewModel {
        &mut self.view
    }

    /// Apply a mutation optimistically.
    ///
    /// The view model reflects the mutation when this returns.
    pub fn apply(
        &mut self,
        id: impl Into<MutationId>,
        mutation: Mutation,
        now: Timestamp,
    ) -> Result<PendingMutation> {
        let id = id.into();
        mutation.validate()?;

        if self.pending.contains_key(&id) || self.superseded.contains(&id) {
            return Err(Error::DuplicateMutation(id));
        }

        let fields = mutation.fields();
        let prior = self.view.capture(&mutation.entity_id, &fields);

        for field in &fields {
            let key = (mutation.entity_id.clone(), field.clone());
            if let Some(previous) = self.owners.insert(key, id.clone()) {
                self.drop_ownership(&previous, field);
            }
        }

        match mutation.kind {
            ChangeKind::Created => self.view.create(&mutation.entity_id, &mutation.payload),
            ChangeKind::Updated | ChangeKind::Moved => {
                self.view.set_fields(&mutation.entity_id, &mutation.payload)
            }
            ChangeKind::Deleted => self.view.mark_deleted(&mutation.entity_id),
        }

        let pending = PendingMutation::new(id.clone(), mutation, now, prior);
        self.pending.insert(
            id,
            Tracked {
                owned: pending.fields_changed.iter().cloned().collect(),
                mutation: pending.clone(),
            },
        );

        Ok(pending)
    }

    /// Confirm a mutation with the server's resulting update.
    ///
    /// Fields where the server value differs from the view are overwritten,
    /// unless a newer pending mutation owns them.
    pub fn confirm(&mut self, id: &str, update: &Update) -> Result<Confirmation> {
        let mutation = match self.pending.remove(id) {
            Some(tracked) => {
                self.release_all(id, &tracked);
                let mut mutation = tracked.mutation;
                mutation.status = MutationStatus::Confirmed;
                Some(mutation)
            }
            None if self.superseded.remove(id) => None,
            None => return Err(Error::MutationNotFound(id.to_string())),
        };
        self.remember(id);

        let changed_fields = self.apply_unowned(update);

        Ok(Confirmation {
            mutation,
            changed_fields,
        })
    }

    /// Undo a mutation the server rejected.
    ///
    /// Returns the restored values of the fields the mutation still owned.
    pub fn revert(&mut self, id: &str) -> Result<Payload> {
        let tracked = match self.pending.remove(id) {
            Some(tracked) => tracked,
            None if self.superseded.remove(id) => {
                self.remember(id);
                return Ok(Payload::new());
            }
            None => return Err(Error::MutationNotFound(id.to_string())),
        };

        self.release_all(id, &tracked);
        self.remember(id);

        let owned: Vec<_> = tracked.owned.iter().cloned().collect();
        let prior = &tracked.mutation.prior;
        self.view.restore(
            &tracked.mutation.entity_id,
            prior,
            &owned,
            tracked.owns_existence(),
        );

        Ok(owned
            .iter()
            .filter_map(|f| prior.fields.get(f).map(|v| (f.clone(), v.clone())))
            .map(|(f, v)| (f, v.unwrap_or(serde_json::Value::Null)))
            .collect())
    }

    /// Mark a single field of a mutation as confirmed by the server.
    ///
    /// Returns `true` when the mutation has nothing left pending and was
    /// removed.
    pub fn confirm_field(&mut self, id: &str, field: &str) -> Result<bool> {
        self.release_field_claim(id, field)
    }

    /// Give up a field in favour of a remote value.
    ///
    /// Returns `true` when the mutation has nothing left pending and was
    /// removed.
    pub fn yield_field(
        &mut self,
        id: &str,
        field: &str,
        remote: serde_json::Value,
    ) -> Result<bool> {
        let entity_id = self
            .pending
            .get(id)
            .map(|t| t.mutation.entity_id.clone())
            .ok_or_else(|| Error::MutationNotFound(id.to_string()))?;
        let spent = self.release_field_claim(id, field)?;
        self.view.set_field(&entity_id, field, remote);
        Ok(spent)
    }

    /// Get a tracked mutation.
    pub fn get(&self, id: &str) -> Option<&PendingMutation> {
        self.pending.get(id).map(|t| &t.mutation)
    }

    /// The mutation owning `(entity, field)`, if any.
    pub fn owner(&self, entity_id: &str, field: &str) -> Option<&PendingMutation> {
        let id = self
            .owners
            .get(&(entity_id.to_string(), field.to_string()))?;
        self.get(id)
    }

    /// Check whether a mutation ID was issued locally, either still tracked
    /// or settled recently.
    pub fn is_local(&self, id: &str) -> bool {
        self.pending.contains_key(id)
            || self.superseded.contains(id)
            || self.recent.iter().any(|r| r == id)
    }

    /// Check whether a mutation was superseded by newer edits.
    pub fn is_superseded(&self, id: &str) -> bool {
        self.superseded.contains(id)
    }

    /// Fields a tracked mutation still owns.
    pub fn owned_fields(&self, id: &str) -> Vec<FieldName> {
        self.pending
            .get(id)
            .map(|t| t.owned.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// All tracked mutations, oldest first.
    pub fn pending(&self) -> Vec<&PendingMutation> {
        let mut all: Vec<_> = self.pending.values().map(|t| &t.mutation).collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        all
    }

    /// Count of tracked mutations.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Record a failed delivery attempt on the tracked copy.
    pub fn record_attempt(&mut self, id: &str, failed: bool) {
        if let Some(tracked) = self.pending.get_mut(id) {
            tracked.mutation.attempts += 1;
            if failed {
                tracked.mutation.status = MutationStatus::Failed;
            }
        }
    }

    /// Mark a mutation pending again after a manual retry.
    pub fn reset_status(&mut self, id: &str) {
        if let Some(tracked) = self.pending.get_mut(id) {
            tracked.mutation.status = MutationStatus::Pending;
        }
    }

    /// Apply the fields of a server update that no pending mutation owns.
    ///
    /// Returns the fields whose view value changed.
    pub fn apply_unowned(&mut self, update: &Update) -> Vec<FieldName> {
        let entity_id = &update.entity_id;

        match update.kind {
            ChangeKind::Deleted => {
                self.view.mark_deleted(entity_id);
                return Vec::new();
            }
            ChangeKind::Created => {
                if !self.view.contains(entity_id) {
                    self.view.create(entity_id, &Payload::new());
                }
            }
            ChangeKind::Updated | ChangeKind::Moved => {}
        }

        let mut changed = Vec::new();
        for (field, value) in &update.payload {
            if self
                .owners
                .contains_key(&(entity_id.clone(), field.clone()))
            {
                continue;
            }
            if self.view.raw_field(entity_id, field) != Some(value) {
                self.view.set_field(entity_id, field, value.clone());
                changed.push(field.clone());
            }
        }
        changed
    }

    fn release_field_claim(&mut self, id: &str, field: &str) -> Result<bool> {
        let tracked = self
            .pending
            .get_mut(id)
            .ok_or_else(|| Error::MutationNotFound(id.to_string()))?;

        tracked.owned.remove(field);
        let key = (tracked.mutation.entity_id.clone(), field.to_string());
        if self.owners.get(&key).map(String::as_str) == Some(id) {
            self.owners.remove(&key);
        }

        if tracked.is_spent() {
            self.pending.remove(id);
            self.remember(id);
            return Ok(true);
        }
        Ok(false)
    }

    fn remember(&mut self, id: &str) {
        if self.recent.len() == RECENT_LIMIT {
            self.recent.pop_front();
        }
        self.recent.push_back(id.to_string());
    }

    fn release_all(&mut self, id: &str, tracked: &Tracked) {
        for field in &tracked.owned {
            let key = (tracked.mutation.entity_id.clone(), field.clone());
            if self.owners.get(&key).map(String::as_str) == Some(id) {
                self.owners.remove(&key);
            }
        }
    }

    /// Called when a newer mutation took `field` away from `id`.
    fn drop_ownership(&mut self, id: &str, field: &str) {
        let spent = match self.pending.get_mut(id) {
            Some(tracked) => {
                tracked.owned.remove(field);
                tracked.is_spent()
            }
            None => false,
        };
        if spent {
            self.pending.remove(id);
            self.superseded.insert(id.to_string());
        }
    }
}
