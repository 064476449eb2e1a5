//! The sync facade.
//!
//! [`SyncFacade`] owns the engine state (view model, tracker, conflicts,
//! queue, metrics) behind one lock and runs two background tasks once
//! started:
//!
//! - the *pump* applies transport events (update batches and connection
//!   transitions) in the order the transport produced them;
//! - the *flusher* sends ready queue items whenever the queue changes, the
//!   connection becomes usable, or a retry deadline passes.
//!
//! Everything the UI needs to react to is published as a [`SyncEvent`].

use crate::{
    config::SyncConfig,
    error::{ClientError, Result},
    now_ms,
    store::FileQueueStore,
    transport::{self, Transport, TransportEvent},
};
use cardsync_engine::{
    ConflictRecord, ConflictResolver, ConnectionState, Entity, EntityId, Error, ErrorKind,
    FailureOutcome, FieldName, FieldValue, MetricsEvent, MetricsSnapshot, Mutation,
    MutationId, MutationResponse, OfflineQueue, OptimisticTracker, Payload, PendingMutation,
    QueuedItem, RemoteOutcome, Resolution, ResolutionOutcome, SyncMetrics, Transition, Update,
    ViewModel,
};
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const EVENT_CAPACITY: usize = 256;

/// How long the flusher sleeps when nothing is scheduled.
const IDLE_RECHECK: Duration = Duration::from_secs(30);

/// Notifications for the UI.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Fields of an entity changed in the view model. An empty field list
    /// means the entity itself appeared or disappeared.
    ViewChanged {
        entity_id: EntityId,
        fields: Vec<FieldName>,
    },
    /// The server accepted a mutation.
    Confirmed { mutation_id: MutationId },
    /// The server refused a mutation; `restored` holds the values put back.
    Rejected {
        mutation_id: MutationId,
        reason: String,
        restored: Payload,
    },
    ConflictDetected(ConflictRecord),
    ConflictResolved(ConflictRecord),
    /// A mutation ran out of attempts and waits for retry or discard.
    QueueExhausted {
        mutation_id: MutationId,
        attempts: u32,
    },
    ConnectionChanged(Transition),
}

/// Whether an inbound batch is being applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncPhase {
    #[default]
    Idle,
    Syncing,
}

struct State {
    tracker: OptimisticTracker,
    resolver: ConflictResolver,
    queue: OfflineQueue,
    metrics: SyncMetrics,
    events: broadcast::Sender<SyncEvent>,
    disposed: bool,
}

struct Inner {
    state: Mutex<State>,
    transport: Arc<dyn Transport>,
    events: broadcast::Sender<SyncEvent>,
    connection: watch::Sender<ConnectionState>,
    phase: watch::Sender<SyncPhase>,
    wake: Notify,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Single entry point for the UI.
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct SyncFacade {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SyncFacade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncFacade")
            .field("connection", &*self.inner.connection.borrow())
            .field("phase", &*self.inner.phase.borrow())
            .finish_non_exhaustive()
    }
}

impl SyncFacade {
    /// Build a facade over a transport and a queue.
    ///
    /// Items already in the queue are re-applied to the view so the UI
    /// shows them right away.
    pub fn new(transport: Arc<dyn Transport>, queue: OfflineQueue) -> Self {
        Self::with_view(transport, queue, ViewModel::new())
    }

    /// Like [`SyncFacade::new`], starting from a known view model.
    pub fn with_view(transport: Arc<dyn Transport>, queue: OfflineQueue, view: ViewModel) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let mut tracker = OptimisticTracker::with_view(view);
        for item in queue.all() {
            if let Err(e) = tracker.apply(item.mutation_id.clone(), item.to_mutation(), item.created_at) {
                tracing::warn!(mutation_id = %item.mutation_id, "Could not restore queued mutation: {}", e);
            }
        }
        if !queue.is_empty() {
            tracing::info!(count = queue.len(), "Restored queued mutations");
        }

        let (connection, _) = watch::channel(transport.state());
        let (phase, _) = watch::channel(SyncPhase::Idle);

        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    tracker,
                    resolver: ConflictResolver::new(),
                    queue,
                    metrics: SyncMetrics::new(),
                    events: events.clone(),
                    disposed: false,
                }),
                transport,
                events,
                connection,
                phase,
                wake: Notify::new(),
                cancel: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Build the transport and queue described by the configuration.
    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        let transport = transport::from_config(config)?;
        let policy = config.queue_policy();
        let queue = match &config.queue_path {
            Some(path) => OfflineQueue::open(FileQueueStore::new(path), policy)?,
            None => OfflineQueue::in_memory(policy),
        };
        Ok(Self::new(transport, queue))
    }

    /// Start the transport and the background tasks. Calling it again is a
    /// no-op.
    pub async fn start(&self) -> Result<()> {
        let mut tasks = self.inner.tasks.lock().await;
        if self.inner.cancel.is_cancelled() {
            return Err(ClientError::Disposed);
        }
        if !tasks.is_empty() {
            return Ok(());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.transport.start(tx).await?;

        tasks.push(tokio::spawn(self.clone().pump(rx)));
        tasks.push(tokio::spawn(self.clone().flusher()));
        self.inner.wake.notify_one();

        tracing::info!("Sync facade started");
        Ok(())
    }

    /// Stop syncing. Sends already in flight may finish, but their results
    /// are discarded. Every later call returns [`ClientError::Disposed`].
    pub async fn stop(&self) {
        {
            let mut state = self.inner.state.lock().await;
            if state.disposed {
                return;
            }
            state.disposed = true;
        }

        self.inner.cancel.cancel();
        self.inner.transport.stop().await;

        // The pump exits promptly; the flusher may still be waiting on sends.
        let mut tasks = std::mem::take(&mut *self.inner.tasks.lock().await);
        if !tasks.is_empty() {
            let pump = tasks.remove(0);
            if let Err(e) = pump.await {
                tracing::warn!("Event pump ended abnormally: {}", e);
            }
        }

        tracing::info!("Sync facade stopped");
    }

    /// Apply a local mutation optimistically and queue it for delivery.
    pub async fn submit(&self, mutation: Mutation) -> Result<PendingMutation> {
        let pending = {
            let mut state = self.lock().await?;
            state.submit(mutation)?
        };
        self.inner.wake.notify_one();
        Ok(pending)
    }

    /// Apply a batch of server updates.
    pub async fn apply_remote(&self, updates: Vec<Update>) -> Result<RemoteOutcome> {
        let outcome = {
            let mut state = self.lock().await?;
            self.inner.phase.send_replace(SyncPhase::Syncing);
            let outcome = state.apply_remote(updates);
            self.inner.phase.send_replace(SyncPhase::Idle);
            outcome
        };
        if !outcome.confirmed.is_empty() {
            self.inner.wake.notify_one();
        }
        Ok(outcome)
    }

    /// Resolve one conflict.
    pub async fn resolve(&self, conflict_id: &str, resolution: Resolution) -> Result<ConflictRecord> {
        let conflict = {
            let mut state = self.lock().await?;
            let State {
                tracker, resolver, ..
            } = &mut *state;
            let outcome = resolver.resolve(tracker, conflict_id, resolution)?;
            let conflict = state.settle(outcome)?;
            conflict
        };
        self.inner.wake.notify_one();
        Ok(conflict)
    }

    /// Resolve every open conflict the same way. Results are per conflict.
    pub async fn resolve_all(&self, resolution: Resolution) -> Result<Vec<Result<ConflictRecord>>> {
        let results: Vec<Result<ConflictRecord>> = {
            let mut state = self.lock().await?;
            let State {
                tracker, resolver, ..
            } = &mut *state;
            let outcomes = resolver.resolve_all(tracker, resolution);
            let results = outcomes
                .into_iter()
                .map(|outcome| match outcome {
                    Ok(outcome) => state.settle(outcome),
                    Err(e) => Err(e.into()),
                })
                .collect();
            results
        };
        self.inner.wake.notify_one();
        Ok(results)
    }

    /// Put an exhausted mutation back in line with a fresh attempt budget.
    pub async fn retry(&self, mutation_id: &str) -> Result<QueuedItem> {
        let item = {
            let mut state = self.lock().await?;
            let item = state.queue.retry(mutation_id, now_ms())?;
            state.tracker.reset_status(mutation_id);
            item
        };
        tracing::info!(mutation_id, "Mutation requeued");
        self.inner.wake.notify_one();
        Ok(item)
    }

    /// Drop a queued mutation and undo it in the view.
    pub async fn discard(&self, mutation_id: &str) -> Result<QueuedItem> {
        let mut state = self.lock().await?;
        let item = state.queue.discard(mutation_id)?;
        let (_, fields) = state.revert(mutation_id);
        state.emit(SyncEvent::ViewChanged {
            entity_id: item.entity_id.clone(),
            fields,
        });
        tracing::info!(mutation_id, "Mutation discarded");
        Ok(item)
    }

    /// Send every ready queue item once the connection allows it. Returns
    /// how many were confirmed.
    pub async fn flush(&self) -> Result<usize> {
        let mut delivered = 0;

        loop {
            if !self.inner.transport.state().may_send() {
                break;
            }

            let batch: Vec<QueuedItem> = {
                let mut state = self.lock().await?;
                let mut batch = state.queue.ready(now_ms());
                batch.retain(|item| state.queue.begin(&item.mutation_id));
                batch
            };
            if batch.is_empty() {
                break;
            }

            let sends = batch
                .iter()
                .map(|item| self.inner.transport.send(item.to_request()));
            let results = join_all(sends).await;

            let mut state = self.inner.state.lock().await;
            if state.disposed {
                tracing::debug!(count = batch.len(), "Discarding send results after stop");
                break;
            }

            let mut progressed = false;
            for (item, result) in batch.iter().zip(results) {
                match result {
                    Ok(response) => {
                        state.on_sent(item, response);
                        delivered += 1;
                        progressed = true;
                    }
                    Err(Error::SendRejected { reason, .. }) => {
                        state.on_rejected(item, reason);
                        progressed = true;
                    }
                    Err(e) => state.on_failed(item, &e),
                }
            }

            if !progressed {
                break;
            }
        }

        if delivered > 0 {
            self.inner.wake.notify_one();
        }
        Ok(delivered)
    }

    pub async fn entity(&self, entity_id: &str) -> Option<Entity> {
        let state = self.inner.state.lock().await;
        state.tracker.view().get(entity_id)
    }

    pub async fn field(&self, entity_id: &str, field: &str) -> Option<FieldValue> {
        let state = self.inner.state.lock().await;
        state.tracker.view().field(entity_id, field)
    }

    /// A copy of the whole view model.
    pub async fn view(&self) -> ViewModel {
        self.inner.state.lock().await.tracker.view().clone()
    }

    /// Open conflicts, oldest first.
    pub async fn list_conflicts(&self) -> Vec<ConflictRecord> {
        self.inner.state.lock().await.resolver.list()
    }

    /// Queue contents in delivery order.
    pub async fn queued(&self) -> Vec<QueuedItem> {
        self.inner.state.lock().await.queue.all().to_vec()
    }

    pub async fn pending(&self) -> Vec<PendingMutation> {
        let state = self.inner.state.lock().await;
        state.tracker.pending().into_iter().cloned().collect()
    }

    pub async fn metrics(&self) -> MetricsSnapshot {
        self.inner.state.lock().await.metrics.snapshot()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.inner.connection.borrow()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.inner.connection.subscribe()
    }

    pub fn phase(&self) -> SyncPhase {
        *self.inner.phase.borrow()
    }

    pub fn watch_phase(&self) -> watch::Receiver<SyncPhase> {
        self.inner.phase.subscribe()
    }

    async fn lock(&self) -> Result<tokio::sync::MutexGuard<'_, State>> {
        let state = self.inner.state.lock().await;
        if state.disposed {
            return Err(ClientError::Disposed);
        }
        Ok(state)
    }

    async fn pump(self, mut rx: mpsc::UnboundedReceiver<TransportEvent>) {
        loop {
            let event = tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            match event {
                TransportEvent::Batch(updates) => {
                    if let Err(e) = self.apply_remote(updates).await {
                        tracing::debug!("Inbound batch dropped: {}", e);
                    }
                }
                TransportEvent::Connection(transition) => self.on_connection(transition).await,
            }
        }
        tracing::debug!("Event pump finished");
    }

    async fn flusher(self) {
        loop {
            let wait = self.next_wake().await;
            tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                _ = self.inner.wake.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }

            if let Err(e) = self.flush().await {
                tracing::debug!("Flush stopped: {}", e);
            }
        }
        tracing::debug!("Flusher finished");
    }

    async fn next_wake(&self) -> Duration {
        if !self.inner.transport.state().may_send() {
            return IDLE_RECHECK;
        }
        let state = self.inner.state.lock().await;
        match state.queue.next_deadline() {
            Some(at) => Duration::from_millis(at.saturating_sub(now_ms())),
            None => IDLE_RECHECK,
        }
    }

    async fn on_connection(&self, transition: Transition) {
        {
            let mut state = self.inner.state.lock().await;
            state.record(MetricsEvent::Connection(transition));
            state.emit(SyncEvent::ConnectionChanged(transition));
        }
        self.inner.connection.send_replace(transition.to);

        if transition.to.may_send() {
            self.inner.wake.notify_one();
        }
    }
}

impl State {
    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn record(&mut self, event: MetricsEvent) {
        if let Err(e) = self.metrics.record(event) {
            tracing::warn!("Metrics sample dropped: {}", e);
        }
    }

    fn submit(&mut self, mutation: Mutation) -> Result<PendingMutation> {
        let id = Uuid::new_v4().to_string();
        let pending = self.tracker.apply(id.clone(), mutation, now_ms())?;

        if let Err(e) = self.queue.enqueue(QueuedItem::from(&pending)) {
            let _ = self.tracker.revert(&id);
            return Err(e.into());
        }

        for conflict in self.resolver.on_local_edit(&mut self.tracker, &pending) {
            self.emit(SyncEvent::ConflictResolved(conflict));
        }

        tracing::debug!(mutation_id = %id, entity_id = %pending.entity_id, "Mutation applied");
        self.emit(SyncEvent::ViewChanged {
            entity_id: pending.entity_id.clone(),
            fields: pending.fields_changed.clone(),
        });
        Ok(pending)
    }

    fn apply_remote(&mut self, updates: Vec<Update>) -> RemoteOutcome {
        let now = now_ms();
        let count = updates.len();
        let outcome = self.resolver.process_batch(&mut self.tracker, updates, now);

        for mutation_id in &outcome.confirmed {
            let created_at = self.queue.get(mutation_id).map(|item| item.created_at);
            // An in-flight send settles the item when its response arrives.
            if !self.queue.is_in_flight(mutation_id) {
                if let Err(e) = self.queue.dequeue_confirmed(mutation_id) {
                    tracing::error!(mutation_id = %mutation_id, "Failed to persist confirmation: {}", e);
                }
            }
            tracing::debug!(mutation_id = %mutation_id, "Mutation confirmed by inbound update");
            self.emit(SyncEvent::Confirmed {
                mutation_id: mutation_id.clone(),
            });
            if let Some(created_at) = created_at {
                self.record(MetricsEvent::Confirmed {
                    created_at,
                    confirmed_at: now,
                });
            }
        }

        for conflict in &outcome.conflicts {
            tracing::info!(
                conflict_id = %conflict.id,
                entity_id = %conflict.entity_id,
                field = %conflict.field,
                "Conflict detected"
            );
            self.emit(SyncEvent::ConflictDetected(conflict.clone()));
        }
        for conflict in &outcome.settled {
            self.emit(SyncEvent::ConflictResolved(conflict.clone()));
        }

        let mut changed: BTreeMap<EntityId, Vec<FieldName>> = BTreeMap::new();
        for (entity_id, field) in &outcome.changed {
            changed.entry(entity_id.clone()).or_default().push(field.clone());
        }
        for conflict in &outcome.conflicts {
            changed
                .entry(conflict.entity_id.clone())
                .or_default()
                .push(conflict.field.clone());
        }
        for entity_id in &outcome.deleted {
            changed.entry(entity_id.clone()).or_default();
        }
        for (entity_id, mut fields) in changed {
            fields.sort();
            fields.dedup();
            self.emit(SyncEvent::ViewChanged { entity_id, fields });
        }

        if count > 0 {
            self.record(MetricsEvent::Received { count, at: now });
        }
        outcome
    }

    fn on_sent(&mut self, item: &QueuedItem, response: MutationResponse) {
        let id = &item.mutation_id;
        if let Err(e) = self.queue.record_success(id) {
            tracing::error!(mutation_id = %id, "Failed to persist confirmation: {}", e);
        }

        let update = response.update;
        let (confirmed, mut changed) = match self.tracker.confirm(id, &update) {
            Ok(confirmation) => (true, confirmation.changed_fields),
            // Already settled by a matching inbound update.
            Err(_) => (false, self.tracker.apply_unowned(&update)),
        };

        for conflict in self.resolver.on_confirmed(&mut self.tracker, id, &update) {
            changed.push(conflict.field.clone());
            self.emit(SyncEvent::ConflictResolved(conflict));
        }

        if confirmed {
            tracing::debug!(mutation_id = %id, duplicate = response.duplicate, "Mutation confirmed");
            self.emit(SyncEvent::Confirmed {
                mutation_id: id.clone(),
            });
            self.record(MetricsEvent::Confirmed {
                created_at: item.created_at,
                confirmed_at: now_ms(),
            });
        }

        if !changed.is_empty() {
            changed.sort();
            changed.dedup();
            self.emit(SyncEvent::ViewChanged {
                entity_id: update.entity_id,
                fields: changed,
            });
        }
    }

    fn on_rejected(&mut self, item: &QueuedItem, reason: String) {
        let id = &item.mutation_id;
        if let Err(e) = self.queue.record_rejected(id) {
            tracing::error!(mutation_id = %id, "Failed to persist rejection: {}", e);
        }

        let (restored, fields) = self.revert(id);

        tracing::warn!(mutation_id = %id, reason = %reason, "Mutation rejected");
        self.record(MetricsEvent::Failed { at: now_ms() });
        self.emit(SyncEvent::Rejected {
            mutation_id: id.clone(),
            reason,
            restored,
        });
        self.emit(SyncEvent::ViewChanged {
            entity_id: item.entity_id.clone(),
            fields,
        });
    }

    fn on_failed(&mut self, item: &QueuedItem, error: &Error) {
        let id = &item.mutation_id;
        let now = now_ms();

        match self
            .queue
            .record_failure(id, &error.to_string(), now, rand::random::<f64>())
        {
            Ok(FailureOutcome::Retry {
                attempts,
                next_attempt_at,
            }) => {
                self.tracker.record_attempt(id, false);
                tracing::debug!(
                    mutation_id = %id,
                    attempts,
                    retry_in_ms = next_attempt_at.saturating_sub(now),
                    retryable = error.kind().is_retryable(),
                    "Send failed; retry scheduled"
                );
            }
            Ok(FailureOutcome::Exhausted { attempts }) => {
                self.tracker.record_attempt(id, true);
                tracing::warn!(mutation_id = %id, attempts, "Mutation exhausted its attempts");
                self.record(MetricsEvent::Failed { at: now });
                self.emit(SyncEvent::QueueExhausted {
                    mutation_id: id.clone(),
                    attempts,
                });
            }
            Ok(FailureOutcome::Gone) => {}
            Err(e) => {
                tracing::error!(mutation_id = %id, "Failed to persist attempt: {}", e);
            }
        }
    }

    /// Carry out what resolving a conflict requires.
    fn settle(&mut self, outcome: ResolutionOutcome) -> Result<ConflictRecord> {
        match outcome {
            ResolutionOutcome::Resubmit { conflict, mutation } => {
                tracing::info!(conflict_id = %conflict.id, "Conflict resolved locally; resubmitting");
                self.emit(SyncEvent::ConflictResolved(conflict.clone()));
                self.submit(mutation)?;
                Ok(conflict)
            }
            ResolutionOutcome::AcceptedRemote {
                conflict,
                mutation_spent,
            } => {
                let id = &conflict.mutation_id;
                if mutation_spent {
                    if self.queue.contains(id) && !self.queue.is_in_flight(id) {
                        self.queue.discard(id)?;
                    }
                } else {
                    self.queue.drop_field(id, &conflict.field)?;
                }

                tracing::info!(conflict_id = %conflict.id, "Conflict resolved with server value");
                self.emit(SyncEvent::ConflictResolved(conflict.clone()));
                self.emit(SyncEvent::ViewChanged {
                    entity_id: conflict.entity_id.clone(),
                    fields: vec![conflict.field.clone()],
                });
                Ok(conflict)
            }
        }
    }

    /// Undo a mutation locally. Returns the restored values and every field
    /// whose view value changed.
    fn revert(&mut self, mutation_id: &str) -> (Payload, Vec<FieldName>) {
        let restored = match self.tracker.revert(mutation_id) {
            Ok(restored) => restored,
            Err(ref e) if e.kind() == ErrorKind::NotFound => Payload::new(),
            Err(e) => {
                tracing::warn!(mutation_id, "Revert failed: {}", e);
                Payload::new()
            }
        };

        let mut fields: Vec<FieldName> = restored.keys().cloned().collect();
        for conflict in self.resolver.on_reverted(&mut self.tracker, mutation_id) {
            fields.push(conflict.field.clone());
            self.emit(SyncEvent::ConflictResolved(conflict));
        }
        fields.sort();
        fields.dedup();
        (restored, fields)
    }
}
