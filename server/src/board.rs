//! In-memory board: the ordered update log and current card state.
//!
//! Every accepted mutation appends exactly one [`Update`]. Server timestamps
//! are strictly increasing, so `since` cursors never skip or repeat an
//! update. Mutation IDs are idempotency keys: a repeated ID returns the
//! update it produced the first time.

use cardsync_engine::{
    ChangeKind, EntityId, MutationId, MutationRequest, Payload, PollResponse, Timestamp,
    Update,
};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Why a mutation was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Refusal {
    #[error("card {0} does not exist")]
    Unknown(EntityId),

    #[error("card {0} was deleted")]
    Deleted(EntityId),

    #[error("card {0} already exists")]
    Exists(EntityId),

    #[error("invalid mutation: {0}")]
    Invalid(String),
}

/// Result of applying a mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    /// First time this mutation ID was seen
    New(Update),
    /// Already applied; the original update
    Duplicate(Update),
}

impl Applied {
    pub fn update(&self) -> &Update {
        match self {
            Applied::New(update) | Applied::Duplicate(update) => update,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Applied::Duplicate(_))
    }
}

/// Server-side state of one card.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Card {
    pub id: EntityId,
    pub fields: Payload,
    pub deleted: bool,
}

impl Card {
    fn new(id: EntityId) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    pub fn is_active(&self) -> bool {
        !self.deleted
    }
}

#[derive(Debug, Default)]
struct BoardState {
    log: Vec<Update>,
    cards: HashMap<EntityId, Card>,
    applied: HashMap<MutationId, Update>,
    clock: Timestamp,
}

impl BoardState {
    /// Next server timestamp: wall clock, bumped past the last one if needed.
    fn tick(&mut self) -> Timestamp {
        let now = chrono::Utc::now().timestamp_millis().max(0) as Timestamp;
        self.clock = now.max(self.clock + 1);
        self.clock
    }

    fn check(&self, request: &MutationRequest) -> Result<(), Refusal> {
        request
            .to_mutation()
            .validate()
            .map_err(|e| Refusal::Invalid(e.to_string()))?;

        let card = self.cards.get(&request.entity_id);
        match (request.kind, card) {
            (ChangeKind::Created, Some(card)) if card.is_active() => {
                Err(Refusal::Exists(request.entity_id.clone()))
            }
            (ChangeKind::Created, _) => Ok(()),
            (_, None) => Err(Refusal::Unknown(request.entity_id.clone())),
            (_, Some(card)) if !card.is_active() => Err(Refusal::Deleted(request.entity_id.clone())),
            _ => Ok(()),
        }
    }
}

/// The shared board.
#[derive(Debug, Default)]
pub struct Board {
    state: RwLock<BoardState>,
}

impl Board {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a mutation on behalf of `user`.
    pub async fn apply(&self, request: MutationRequest, user: &str) -> Result<Applied, Refusal> {
        let mut state = self.state.write().await;

        if let Some(update) = state.applied.get(&request.mutation_id) {
            return Ok(Applied::Duplicate(update.clone()));
        }
        state.check(&request)?;

        let timestamp = state.tick();
        let card = state
            .cards
            .entry(request.entity_id.clone())
            .or_insert_with(|| Card::new(request.entity_id.clone()));

        match request.kind {
            ChangeKind::Created => {
                card.deleted = false;
                card.fields = request.payload.clone();
            }
            ChangeKind::Updated | ChangeKind::Moved => {
                for (field, value) in &request.payload {
                    card.fields.insert(field.clone(), value.clone());
                }
            }
            ChangeKind::Deleted => {
                card.deleted = true;
            }
        }

        let payload = match request.kind {
            ChangeKind::Deleted => Payload::new(),
            _ => request.payload,
        };
        let update = Update::new(
            uuid::Uuid::new_v4().to_string(),
            request.entity_id,
            request.kind,
            payload,
            user,
            timestamp,
        )
        .with_mutation_id(request.mutation_id.clone());

        state.applied.insert(request.mutation_id, update.clone());
        state.log.push(update.clone());

        tracing::debug!(
            update_id = %update.id,
            entity_id = %update.entity_id,
            server_timestamp = update.server_timestamp,
            "Update recorded"
        );
        Ok(Applied::New(update))
    }

    /// Updates recorded after `since`, oldest first.
    pub async fn since(&self, since: Timestamp) -> PollResponse {
        let state = self.state.read().await;
        let start = state.log.partition_point(|u| u.server_timestamp <= since);
        PollResponse {
            updates: state.log[start..].to_vec(),
            server_time: state.clock.max(since),
        }
    }

    /// Current state of a card, including tombstones.
    pub async fn card(&self, entity_id: &str) -> Option<Card> {
        self.state.read().await.cards.get(entity_id).cloned()
    }

    /// Number of updates in the log.
    pub async fn len(&self) -> usize {
        self.state.read().await.log.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
