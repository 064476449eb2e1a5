//! # Cardsync Engine
//!
//! Deterministic core of the Cardsync update-synchronization subsystem.
//!
//! This crate holds the logic that keeps a client's view of shared board
//! entities consistent with the server while the user keeps editing:
//! optimistic updates, conflict detection, offline queuing and connection
//! state. It never touches the network or the clock; the client crate drives
//! it and passes the current time in as a millisecond [`Timestamp`].
//!
//! ## Design Principles
//!
//! - **No IO**: persistence goes through the [`QueueStore`] trait
//! - **Deterministic**: same inputs, same outputs (jitter is passed in)
//! - **Testable**: pure logic, no mocks needed
//!
//! ## Core Concepts
//!
//! ### Updates and mutations
//!
//! - [`Update`] - a change recorded by the server, ordered by
//!   `(server_timestamp, id)`
//! - [`Mutation`] - a change requested locally
//! - [`PendingMutation`] - a mutation applied optimistically and not yet settled
//!
//! ### Optimistic tracking
//!
//! The [`OptimisticTracker`] applies mutations to the [`ViewModel`] at once and
//! confirms or reverts them when the server answers. Each `(entity, field)`
//! is owned by at most one pending mutation.
//!
//! ### Conflicts
//!
//! The [`ConflictResolver`] checks inbound updates against pending mutations.
//! A differing server value on a pending field becomes a [`ConflictRecord`]
//! and the field reads as [`FieldValue::Conflicted`] until resolved.
//!
//! ### Offline queue
//!
//! The [`OfflineQueue`] keeps unconfirmed mutations durable and replays them
//! in per-entity order with [`Backoff`] between failed attempts.
//!
//! ## Quick Start
//!
//! ```rust
//! use cardsync_engine::{
//!     payload, ChangeKind, ConflictResolver, Mutation, OptimisticTracker, Resolution, Update,
//! };
//! use serde_json::json;
//!
//! let mut tracker = OptimisticTracker::new();
//! let mut resolver = ConflictResolver::new();
//!
//! // 1. Apply a local edit; the view reflects it immediately
//! tracker
//!     .apply("m-1", Mutation::move_to("card-1", "done"), 1_000)
//!     .unwrap();
//!
//! // 2. Another user moved the same card elsewhere
//! let update = Update::new(
//!     "u-1",
//!     "card-1",
//!     ChangeKind::Moved,
//!     payload(json!({"column": "review"})),
//!     "bob",
//!     1_005,
//! );
//! let outcome = resolver.process(&mut tracker, &update, 1_010);
//! assert_eq!(outcome.conflicts.len(), 1);
//!
//! // 3. Take the server's value
//! resolver
//!     .resolve(&mut tracker, &outcome.conflicts[0].id, Resolution::Remote)
//!     .unwrap();
//! let column = tracker.view().field("card-1", "column").unwrap();
//! assert_eq!(column.settled(), Some(&json!("review")));
//! ```

pub mod backoff;
pub mod conflict;
pub mod connection;
pub mod error;
pub mod metrics;
pub mod mutation;
pub mod protocol;
pub mod queue;
pub mod tracker;
pub mod update;
pub mod view;

// Re-export main types at crate root
pub use backoff::Backoff;
pub use conflict::{ConflictRecord, ConflictResolver, RemoteOutcome, Resolution, ResolutionOutcome};
pub use connection::{
    Action, ConnectionEvent, ConnectionMachine, ConnectionPolicy, ConnectionState, Step,
    Transition, TransportMode,
};
pub use error::{Error, ErrorKind};
pub use metrics::{MetricsEvent, MetricsSnapshot, SyncMetrics};
pub use mutation::{Mutation, MutationStatus, PendingMutation, PriorState};
pub use protocol::{MutationRequest, MutationResponse, PollResponse, PushFrame, Rejection};
pub use queue::{
    DrainReport, FailureOutcome, MemoryQueueStore, OfflineQueue, QueuePolicy, QueueSnapshot,
    QueueStatus, QueueStore, QueuedItem,
};
pub use tracker::{Confirmation, OptimisticTracker};
pub use update::{ChangeKind, Update};
pub use view::{Entity, FieldValue, ViewModel};

/// Type aliases for clarity
pub type EntityId = String;
pub type FieldName = String;
pub type MutationId = String;
pub type UpdateId = String;
pub type UserId = String;
/// Milliseconds since the Unix epoch
pub type Timestamp = u64;
/// Field name to JSON value
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Build a payload from a JSON value. Non-objects give an empty payload.
pub fn payload(value: serde_json::Value) -> Payload {
    match value {
        serde_json::Value::Object(map) => map,
        _ => Payload::new(),
    }
}
