//! Shared test doubles: an in-memory board server and a transport over it.

#![allow(dead_code)]

use async_trait::async_trait;
use cardsync_client::{EventSender, Result, SendResult, Transport, TransportEvent};
use cardsync_engine::{
    Backoff, ChangeKind, ConnectionState, EntityId, Error, MutationId, MutationRequest,
    MutationResponse, OfflineQueue, Payload, QueuePolicy, Timestamp, Transition, Update,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

/// Queue policy with immediate retries so tests never wait on backoff.
pub fn instant_retries(max_attempts: Option<u32>) -> QueuePolicy {
    QueuePolicy {
        max_attempts,
        backoff: Backoff::new(0, 0).without_jitter(),
    }
}

pub fn queue(max_attempts: Option<u32>) -> OfflineQueue {
    OfflineQueue::in_memory(instant_retries(max_attempts))
}

#[derive(Default)]
struct Board {
    clock: Timestamp,
    log: Vec<Update>,
    applied: HashMap<MutationId, Update>,
    entities: HashMap<EntityId, Payload>,
    deleted: HashSet<EntityId>,
    requests: Vec<MutationId>,
}

/// Minimal board server: strictly increasing timestamps, idempotent
/// mutations, 409 for edits to missing or deleted cards.
#[derive(Default)]
pub struct MockServer {
    board: Mutex<Board>,
}

impl MockServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a card as another user.
    pub fn seed(&self, entity_id: &str, payload: Payload) -> Update {
        self.record(entity_id, ChangeKind::Created, payload, "seed", None)
    }

    /// An edit made by another client.
    pub fn remote_edit(&self, user: &str, entity_id: &str, payload: Payload) -> Update {
        self.record(entity_id, ChangeKind::Updated, payload, user, None)
    }

    pub fn remote_delete(&self, user: &str, entity_id: &str) -> Update {
        self.record(entity_id, ChangeKind::Deleted, Payload::new(), user, None)
    }

    pub fn apply(&self, request: &MutationRequest) -> SendResult {
        {
            let mut board = self.board.lock().unwrap();
            board.requests.push(request.mutation_id.clone());
            if let Some(update) = board.applied.get(&request.mutation_id) {
                return Ok(MutationResponse {
                    mutation_id: request.mutation_id.clone(),
                    update: update.clone(),
                    duplicate: true,
                });
            }
            let known = board.entities.contains_key(&request.entity_id);
            if request.kind != ChangeKind::Created
                && (!known || board.deleted.contains(&request.entity_id))
            {
                return Err(Error::SendRejected {
                    mutation_id: request.mutation_id.clone(),
                    reason: "entity not found".to_string(),
                });
            }
        }

        let update = self.record(
            &request.entity_id,
            request.kind,
            request.payload.clone(),
            "me",
            Some(request.mutation_id.clone()),
        );
        Ok(MutationResponse {
            mutation_id: request.mutation_id.clone(),
            update,
            duplicate: false,
        })
    }

    pub fn updates_since(&self, since: Timestamp) -> Vec<Update> {
        let board = self.board.lock().unwrap();
        board
            .log
            .iter()
            .filter(|u| u.server_timestamp > since)
            .cloned()
            .collect()
    }

    /// How many times a mutation ID reached the server.
    pub fn requests_for(&self, mutation_id: &str) -> usize {
        let board = self.board.lock().unwrap();
        board.requests.iter().filter(|id| *id == mutation_id).count()
    }

    /// Updates in the log produced by a mutation ID.
    pub fn applied_count(&self, mutation_id: &str) -> usize {
        let board = self.board.lock().unwrap();
        board
            .log
            .iter()
            .filter(|u| u.mutation_id.as_deref() == Some(mutation_id))
            .count()
    }

    pub fn field(&self, entity_id: &str, field: &str) -> Option<serde_json::Value> {
        let board = self.board.lock().unwrap();
        board.entities.get(entity_id)?.get(field).cloned()
    }

    fn record(
        &self,
        entity_id: &str,
        kind: ChangeKind,
        payload: Payload,
        user: &str,
        mutation_id: Option<MutationId>,
    ) -> Update {
        let mut board = self.board.lock().unwrap();
        board.clock += 1;
        let timestamp = board.clock;

        match kind {
            ChangeKind::Deleted => {
                board.deleted.insert(entity_id.to_string());
            }
            _ => {
                let fields = board.entities.entry(entity_id.to_string()).or_default();
                for (field, value) in &payload {
                    fields.insert(field.clone(), value.clone());
                }
            }
        }

        let mut update = Update::new(
            format!("u-{}", timestamp),
            entity_id,
            kind,
            payload,
            user,
            timestamp,
        );
        if let Some(id) = mutation_id {
            update = update.with_mutation_id(id.clone());
            board.applied.insert(id, update.clone());
        }
        board.log.push(update.clone());
        update
    }
}

/// How the next sends should fail.
#[derive(Debug, Clone)]
pub enum Fault {
    /// Fail without reaching the server
    Fail(Error),
    /// Reach the server but lose the response
    LoseResponse,
}

/// Transport double over a [`MockServer`]. Starts `connected`.
pub struct MockTransport {
    server: Arc<MockServer>,
    state: Mutex<ConnectionState>,
    events: Mutex<Option<EventSender>>,
    faults: Mutex<VecDeque<Fault>>,
    outage: Mutex<Option<Error>>,
    sent: Mutex<Vec<MutationRequest>>,
}

impl MockTransport {
    pub fn new(server: Arc<MockServer>) -> Arc<Self> {
        Arc::new(Self {
            server,
            state: Mutex::new(ConnectionState::Connected),
            events: Mutex::new(None),
            faults: Mutex::new(VecDeque::new()),
            outage: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
        })
    }

    /// Change the connection state and report it like a real transport.
    pub fn set_state(&self, to: ConnectionState) {
        let from = std::mem::replace(&mut *self.state.lock().unwrap(), to);
        if let Some(events) = self.events.lock().unwrap().as_ref() {
            let _ = events.send(TransportEvent::Connection(Transition { from, to, at: 0 }));
        }
    }

    pub fn inject(&self, fault: Fault) {
        self.faults.lock().unwrap().push_back(fault);
    }

    /// Fail every send with `error` until cleared with `None`.
    pub fn set_outage(&self, error: Option<Error>) {
        *self.outage.lock().unwrap() = error;
    }

    /// Push updates as if they arrived from the server.
    pub fn deliver(&self, updates: Vec<Update>) {
        if let Some(events) = self.events.lock().unwrap().as_ref() {
            let _ = events.send(TransportEvent::Batch(updates));
        }
    }

    pub fn sent(&self) -> Vec<MutationRequest> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn start(&self, events: EventSender) -> Result<()> {
        *self.events.lock().unwrap() = Some(events);
        Ok(())
    }

    async fn stop(&self) {
        self.events.lock().unwrap().take();
    }

    async fn send(&self, request: MutationRequest) -> SendResult {
        if !self.state.lock().unwrap().may_send() {
            return Err(Error::TransportUnavailable);
        }
        self.sent.lock().unwrap().push(request.clone());

        if let Some(error) = self.outage.lock().unwrap().clone() {
            return Err(error);
        }
        let fault = self.faults.lock().unwrap().pop_front();
        match fault {
            Some(Fault::Fail(error)) => Err(error),
            Some(Fault::LoseResponse) => {
                let _ = self.server.apply(&request);
                Err(Error::SendTimeout(request.mutation_id))
            }
            None => self.server.apply(&request),
        }
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }
}
