//! Durable offline queue of local mutations.
//!
//! Items are kept FIFO in submission order. Each enqueue stamps a persisted
//! sequence number and the queue is ordered by it, never by the wall-clock
//! `created_at`, so a clock step cannot reorder mutations. Only the
//! head item of each entity is ever eligible to send, and at most one send per
//! entity is in flight, so the server sees each entity's mutations in the
//! order they were made while unrelated entities proceed independently.
//!
//! Every change is written through the [`QueueStore`] before the call
//! returns; a failed write leaves the in-memory queue unchanged.

use crate::{
    backoff::Backoff,
    error::{ErrorKind, Result},
    protocol::MutationRequest,
    ChangeKind, EntityId, Error, Mutation, MutationId, Payload, PendingMutation, Timestamp,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

/// Current on-disk layout version.
pub const FORMAT_VERSION: u32 = 1;

/// Delivery status of a queued item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    /// Waiting for (re)delivery
    Pending,
    /// Out of attempts; needs a manual retry or discard
    Failed,
}

/// A mutation waiting for server confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedItem {
    pub mutation_id: MutationId,
    pub entity_id: EntityId,
    pub kind: ChangeKind,
    #[serde(default)]
    pub payload: Payload,
    pub created_at: Timestamp,
    /// Position in submission order, assigned by the queue
    #[serde(default)]
    pub seq: u64,
    /// Failed attempts so far
    pub attempts: u32,
    pub status: QueueStatus,
    /// Earliest time the next attempt may start (ms)
    #[serde(default)]
    pub next_attempt_at: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl QueuedItem {
    /// Create a fresh item.
    pub fn new(mutation_id: impl Into<MutationId>, mutation: Mutation, created_at: Timestamp) -> Self {
        Self {
            mutation_id: mutation_id.into(),
            entity_id: mutation.entity_id,
            kind: mutation.kind,
            payload: mutation.payload,
            created_at,
            seq: 0,
            attempts: 0,
            status: QueueStatus::Pending,
            next_attempt_at: created_at,
            last_error: None,
        }
    }

    /// The mutation as submitted.
    pub fn to_mutation(&self) -> Mutation {
        Mutation::new(self.entity_id.clone(), self.kind, self.payload.clone())
    }

    /// Request body for delivery.
    pub fn to_request(&self) -> MutationRequest {
        MutationRequest::new(self.mutation_id.clone(), self.to_mutation())
    }

    /// Check if the item may be sent at `now`, ignoring per-entity order.
    pub fn is_due(&self, now: Timestamp) -> bool {
        self.status == QueueStatus::Pending && self.next_attempt_at <= now
    }
}

impl From<&PendingMutation> for QueuedItem {
    fn from(pending: &PendingMutation) -> Self {
        Self::new(pending.id.clone(), pending.to_mutation(), pending.created_at)
    }
}

/// Persisted form of the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshot {
    pub format_version: u32,
    pub items: Vec<QueuedItem>,
}

impl Default for QueueSnapshot {
    fn default() -> Self {
        Self {
            format_version: FORMAT_VERSION,
            items: Vec::new(),
        }
    }
}

/// Durable storage behind the queue.
pub trait QueueStore: Send {
    /// Load the last saved snapshot, or an empty one if nothing was saved.
    fn load(&self) -> Result<QueueSnapshot>;

    /// Replace the saved snapshot.
    fn save(&self, snapshot: &QueueSnapshot) -> Result<()>;
}

/// In-memory store. Clones share the same contents, which lets tests
/// "restart" a queue over what a previous instance persisted.
#[derive(Debug, Clone, Default)]
pub struct MemoryQueueStore {
    inner: Arc<Mutex<Option<QueueSnapshot>>>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The last saved snapshot.
    pub fn saved(&self) -> Option<QueueSnapshot> {
        self.inner.lock().ok().and_then(|s| s.clone())
    }
}

impl QueueStore for MemoryQueueStore {
    fn load(&self) -> Result<QueueSnapshot> {
        let saved = self
            .inner
            .lock()
            .map_err(|e| Error::Persistence(e.to_string()))?;
        Ok(saved.clone().unwrap_or_default())
    }

    fn save(&self, snapshot: &QueueSnapshot) -> Result<()> {
        let mut saved = self
            .inner
            .lock()
            .map_err(|e| Error::Persistence(e.to_string()))?;
        *saved = Some(snapshot.clone());
        Ok(())
    }
}

/// Retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct QueuePolicy {
    /// Attempts before an item fails for good (`None` = unbounded)
    pub max_attempts: Option<u32>,
    pub backoff: Backoff,
}

/// What a failed attempt did to the item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Scheduled again
    Retry {
        attempts: u32,
        next_attempt_at: Timestamp,
    },
    /// Just ran out of attempts. Reported once per exhaustion.
    Exhausted { attempts: u32 },
    /// The item was confirmed or discarded while the attempt was in flight
    Gone,
}

/// Summary of a [`OfflineQueue::drain`] pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrainReport {
    pub sent: Vec<MutationId>,
    pub rejected: Vec<MutationId>,
    pub retried: Vec<MutationId>,
    pub exhausted: Vec<Error>,
}

/// The offline queue.
pub struct OfflineQueue {
    items: Vec<QueuedItem>,
    in_flight: BTreeMap<EntityId, MutationId>,
    next_seq: u64,
    policy: QueuePolicy,
    store: Box<dyn QueueStore>,
}

impl std::fmt::Debug for OfflineQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineQueue")
            .field("items", &self.items)
            .field("in_flight", &self.in_flight)
            .field("next_seq", &self.next_seq)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl OfflineQueue {
    /// Open a queue over a store, restoring what it holds.
    ///
    /// Restored items come back as `pending` with their attempt counts kept.
    /// Items saved without a sequence number keep their stored order.
    pub fn open(store: impl QueueStore + 'static, policy: QueuePolicy) -> Result<Self> {
        let snapshot = store.load()?;
        if snapshot.format_version > FORMAT_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "unsupported format version {}",
                snapshot.format_version
            )));
        }

        let mut seen = BTreeSet::new();
        let mut items: Vec<_> = snapshot
            .items
            .into_iter()
            .filter(|item| seen.insert(item.mutation_id.clone()))
            .map(|mut item| {
                item.status = QueueStatus::Pending;
                item
            })
            .collect();
        items.sort_by_key(|item| item.seq);
        for (n, item) in items.iter_mut().enumerate() {
            item.seq = n as u64 + 1;
        }

        let queue = Self {
            next_seq: items.len() as u64 + 1,
            items,
            in_flight: BTreeMap::new(),
            policy,
            store: Box::new(store),
        };
        queue.store.save(&queue.snapshot())?;
        Ok(queue)
    }

    /// Open an empty in-memory queue.
    pub fn in_memory(policy: QueuePolicy) -> Self {
        Self {
            items: Vec::new(),
            in_flight: BTreeMap::new(),
            next_seq: 1,
            policy,
            store: Box::new(MemoryQueueStore::new()),
        }
    }

    pub fn policy(&self) -> &QueuePolicy {
        &self.policy
    }

    /// Add an item at the back of the queue. Returns `false` if its mutation
    /// ID is already queued.
    pub fn enqueue(&mut self, mut item: QueuedItem) -> Result<bool> {
        if self.contains(&item.mutation_id) {
            return Ok(false);
        }
        item.seq = self.next_seq;
        self.write(|items| items.push(item))?;
        self.next_seq += 1;
        Ok(true)
    }

    /// Remove an item the server confirmed.
    pub fn dequeue_confirmed(&mut self, mutation_id: &str) -> Result<Option<QueuedItem>> {
        self.remove(mutation_id)
    }

    /// All items in queue order.
    pub fn all(&self) -> &[QueuedItem] {
        &self.items
    }

    pub fn get(&self, mutation_id: &str) -> Option<&QueuedItem> {
        self.items.iter().find(|i| i.mutation_id == mutation_id)
    }

    pub fn contains(&self, mutation_id: &str) -> bool {
        self.get(mutation_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Check if a send for this mutation is in flight.
    pub fn is_in_flight(&self, mutation_id: &str) -> bool {
        self.in_flight.values().any(|id| id == mutation_id)
    }

    /// Items that may be sent now: the due head item of every entity without
    /// a send in flight, in queue order.
    pub fn ready(&self, now: Timestamp) -> Vec<QueuedItem> {
        let mut heads = BTreeSet::new();
        self.items
            .iter()
            .filter(|item| heads.insert(item.entity_id.clone()))
            .filter(|item| !self.in_flight.contains_key(&item.entity_id))
            .filter(|item| item.is_due(now))
            .cloned()
            .collect()
    }

    /// Earliest time any entity head becomes sendable. Heads that failed
    /// for good or have a send in flight are skipped.
    pub fn next_deadline(&self) -> Option<Timestamp> {
        let mut heads = BTreeSet::new();
        self.items
            .iter()
            .filter(|item| heads.insert(item.entity_id.clone()))
            .filter(|item| !self.in_flight.contains_key(&item.entity_id))
            .filter(|item| item.status == QueueStatus::Pending)
            .map(|item| item.next_attempt_at)
            .min()
    }

    /// Mark an item's send as started. Returns `false` if its entity already
    /// has a send in flight or the item is gone.
    pub fn begin(&mut self, mutation_id: &str) -> bool {
        let Some(entity_id) = self.get(mutation_id).map(|i| i.entity_id.clone()) else {
            return false;
        };
        if self.in_flight.contains_key(&entity_id) {
            return false;
        }
        self.in_flight.insert(entity_id, mutation_id.to_string());
        true
    }

    /// The send confirmed the item.
    pub fn record_success(&mut self, mutation_id: &str) -> Result<Option<QueuedItem>> {
        self.remove(mutation_id)
    }

    /// The server refused the item; it is not retried.
    pub fn record_rejected(&mut self, mutation_id: &str) -> Result<Option<QueuedItem>> {
        self.remove(mutation_id)
    }

    /// The send failed and may be retried.
    pub fn record_failure(
        &mut self,
        mutation_id: &str,
        error: &str,
        now: Timestamp,
        jitter_factor: f64,
    ) -> Result<FailureOutcome> {
        self.finish(mutation_id);

        let Some(index) = self.index_of(mutation_id) else {
            return Ok(FailureOutcome::Gone);
        };
        if self.items[index].status == QueueStatus::Failed {
            return Ok(FailureOutcome::Gone);
        }

        let policy = self.policy;
        self.write(|items| {
            let item = &mut items[index];
            item.attempts = item.attempts.saturating_add(1);
            item.last_error = Some(error.to_string());

            if policy.max_attempts.is_some_and(|max| item.attempts >= max) {
                item.status = QueueStatus::Failed;
                FailureOutcome::Exhausted {
                    attempts: item.attempts,
                }
            } else {
                let delay = policy.backoff.delay(item.attempts - 1, jitter_factor);
                item.next_attempt_at = now.saturating_add(delay);
                FailureOutcome::Retry {
                    attempts: item.attempts,
                    next_attempt_at: item.next_attempt_at,
                }
            }
        })
    }

    /// Put a failed item back in line with a fresh attempt budget.
    pub fn retry(&mut self, mutation_id: &str, now: Timestamp) -> Result<QueuedItem> {
        let index = self
            .index_of(mutation_id)
            .ok_or_else(|| Error::MutationNotFound(mutation_id.to_string()))?;

        self.write(|items| {
            let item = &mut items[index];
            item.status = QueueStatus::Pending;
            item.attempts = 0;
            item.next_attempt_at = now;
            item.clone()
        })
    }

    /// Drop an item without sending it.
    pub fn discard(&mut self, mutation_id: &str) -> Result<QueuedItem> {
        self.remove(mutation_id)?
            .ok_or_else(|| Error::MutationNotFound(mutation_id.to_string()))
    }

    /// Stop sending one field of an item. An item left with nothing to write
    /// is removed; returns `true` in that case.
    pub fn drop_field(&mut self, mutation_id: &str, field: &str) -> Result<bool> {
        let Some(index) = self.index_of(mutation_id) else {
            return Ok(false);
        };

        let item = &self.items[index];
        if !item.payload.contains_key(field) {
            return Ok(false);
        }
        if item.payload.len() == 1 && item.kind.carries_fields() {
            self.remove(mutation_id)?;
            return Ok(true);
        }

        self.write(|items| {
            items[index].payload.remove(field);
        })?;
        Ok(false)
    }

    /// Send every ready item with `send`, repeating until nothing is ready.
    ///
    /// Each item is attempted at most once per drain. Rejections
    /// ([`ErrorKind::SendRejected`]) drop the item; other errors count as
    /// failed attempts.
    pub fn drain<F>(&mut self, now: Timestamp, jitter_factor: f64, mut send: F) -> Result<DrainReport>
    where
        F: FnMut(&QueuedItem) -> Result<()>,
    {
        let mut report = DrainReport::default();
        let mut attempted = BTreeSet::new();

        loop {
            let batch: Vec<_> = self
                .ready(now)
                .into_iter()
                .filter(|item| !attempted.contains(&item.mutation_id))
                .collect();
            if batch.is_empty() {
                break;
            }

            for item in batch {
                attempted.insert(item.mutation_id.clone());
                if !self.begin(&item.mutation_id) {
                    continue;
                }

                match send(&item) {
                    Ok(()) => {
                        self.record_success(&item.mutation_id)?;
                        report.sent.push(item.mutation_id);
                    }
                    Err(e) if e.kind() == ErrorKind::SendRejected => {
                        self.record_rejected(&item.mutation_id)?;
                        report.rejected.push(item.mutation_id);
                    }
                    Err(e) => {
                        match self.record_failure(&item.mutation_id, &e.to_string(), now, jitter_factor)? {
                            FailureOutcome::Exhausted { attempts } => {
                                report.exhausted.push(Error::QueueExhausted {
                                    mutation_id: item.mutation_id,
                                    attempts,
                                });
                            }
                            FailureOutcome::Retry { .. } => report.retried.push(item.mutation_id),
                            FailureOutcome::Gone => {}
                        }
                    }
                }
            }
        }

        Ok(report)
    }

    /// Current persisted form.
    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            format_version: FORMAT_VERSION,
            items: self.items.clone(),
        }
    }

    fn index_of(&self, mutation_id: &str) -> Option<usize> {
        self.items.iter().position(|i| i.mutation_id == mutation_id)
    }

    fn finish(&mut self, mutation_id: &str) {
        self.in_flight.retain(|_, id| id != mutation_id);
    }

    fn remove(&mut self, mutation_id: &str) -> Result<Option<QueuedItem>> {
        self.finish(mutation_id);
        let Some(index) = self.index_of(mutation_id) else {
            return Ok(None);
        };
        self.write(|items| items.remove(index)).map(Some)
    }

    /// Apply a change to a copy, persist it, then keep it.
    fn write<R>(&mut self, change: impl FnOnce(&mut Vec<QueuedItem>) -> R) -> Result<R> {
        let mut items = self.items.clone();
        let out = change(&mut items);
        self.store.save(&QueueSnapshot {
            format_version: FORMAT_VERSION,
            items: items.clone(),
        })?;
        self.items = items;
        Ok(out)
    }
}
