//! Edge case tests for cardsync-engine
//!
//! These tests drive the tracker, resolver and queue together the way the
//! client does, and cover boundary conditions and unusual inputs.

use cardsync_engine::{
    payload, Backoff, ChangeKind, ConflictResolver, Error, FieldValue, MemoryQueueStore,
    Mutation, OfflineQueue, OptimisticTracker, QueuePolicy, QueueStatus, QueuedItem, Resolution,
    ResolutionOutcome, Update, ViewModel,
};
use serde_json::{json, Value};

fn board() -> OptimisticTracker {
    let mut view = ViewModel::new();
    view.create("c1", &payload(json!({"column": "todo", "title": "Card 1"})));
    view.create("c2", &payload(json!({"column": "todo", "title": "Card 2"})));
    OptimisticTracker::with_view(view)
}

fn policy(max_attempts: Option<u32>) -> QueuePolicy {
    QueuePolicy {
        max_attempts,
        backoff: Backoff::new(1_000, 30_000).without_jitter(),
    }
}

fn column(tracker: &OptimisticTracker, entity: &str) -> FieldValue {
    tracker.view().field(entity, "column").unwrap()
}

// ============================================================================
// Offline round trip
// ============================================================================

#[test]
fn offline_edit_is_visible_then_confirmed() {
    let mut tracker = board();
    let mut resolver = ConflictResolver::new();
    let mut queue = OfflineQueue::in_memory(policy(None));

    let pending = tracker
        .apply("m-1", Mutation::move_to("c1", "done"), 1_000)
        .unwrap();
    queue.enqueue(QueuedItem::from(&pending)).unwrap();

    assert_eq!(queue.len(), 1);
    assert_eq!(column(&tracker, "c1").settled(), Some(&json!("done")));

    // Reconnect: the send succeeds and the server echoes the update.
    let report = queue.drain(2_000, 0.0, |_| Ok(())).unwrap();
    assert_eq!(report.sent, vec!["m-1".to_string()]);

    let update = Update::new(
        "u-1",
        "c1",
        ChangeKind::Moved,
        payload(json!({"column": "done"})),
        "alice",
        1_500,
    )
    .with_mutation_id("m-1");
    tracker.confirm("m-1", &update).unwrap();
    resolver.on_confirmed(&mut tracker, "m-1", &update);

    assert!(queue.is_empty());
    assert_eq!(tracker.pending_count(), 0);
    assert_eq!(column(&tracker, "c1").settled(), Some(&json!("done")));
}

#[test]
fn replaying_the_same_echo_twice_is_harmless() {
    let mut tracker = board();
    let mut resolver = ConflictResolver::new();
    tracker
        .apply("m-1", Mutation::move_to("c1", "done"), 1_000)
        .unwrap();

    let echo = Update::new(
        "u-1",
        "c1",
        ChangeKind::Moved,
        payload(json!({"column": "done"})),
        "alice",
        1_500,
    )
    .with_mutation_id("m-1");

    let first = resolver.process(&mut tracker, &echo, 2_000);
    let second = resolver.process(&mut tracker, &echo, 2_001);

    assert_eq!(first.confirmed, vec!["m-1".to_string()]);
    assert!(second.is_empty());
    assert!(resolver.is_empty());
}

// ============================================================================
// Concurrent edits
// ============================================================================

#[test]
fn two_clients_move_the_same_card() {
    // Both clients start from the same board.
    let mut alice = board();
    let mut alice_resolver = ConflictResolver::new();
    let mut bob = board();
    let mut bob_resolver = ConflictResolver::new();

    alice
        .apply("a-1", Mutation::move_to("c1", "doing"), 1_000)
        .unwrap();
    bob.apply("b-1", Mutation::move_to("c1", "review"), 1_001)
        .unwrap();

    // The server accepts bob's send first; alice's lands after.
    let bobs = Update::new(
        "u-1",
        "c1",
        ChangeKind::Moved,
        payload(json!({"column": "review"})),
        "bob",
        1_100,
    )
    .with_mutation_id("b-1");
    let alices = Update::new(
        "u-2",
        "c1",
        ChangeKind::Moved,
        payload(json!({"column": "doing"})),
        "alice",
        1_200,
    )
    .with_mutation_id("a-1");

    // Alice polls before her own send returns and sees bob's move.
    let outcome = alice_resolver.process(&mut alice, &bobs, 1_150);
    assert_eq!(outcome.conflicts.len(), 1);
    assert_eq!(outcome.conflicts[0].field, "column");
    assert!(column(&alice, "c1").is_conflicted());

    // Alice takes the remote value; her queued move is dropped.
    let id = outcome.conflicts[0].id.clone();
    let resolved = alice_resolver
        .resolve(&mut alice, &id, Resolution::Remote)
        .unwrap();
    assert!(matches!(
        resolved,
        ResolutionOutcome::AcceptedRemote {
            mutation_spent: true,
            ..
        }
    ));

    // Bob's own send confirms.
    bob.confirm("b-1", &bobs).unwrap();
    bob_resolver.on_confirmed(&mut bob, "b-1", &bobs);

    assert_eq!(column(&alice, "c1").settled(), Some(&json!("review")));
    assert_eq!(column(&bob, "c1").settled(), Some(&json!("review")));
    assert!(alices.is_after(1_100, "u-1"));
}

#[test]
fn conflict_never_shows_a_single_side() {
    let mut tracker = board();
    let mut resolver = ConflictResolver::new();
    tracker
        .apply("m-1", Mutation::move_to("c1", "doing"), 1)
        .unwrap();

    for (n, remote) in ["done", "review", "blocked"].iter().enumerate() {
        let update = Update::new(
            format!("u-{}", n),
            "c1",
            ChangeKind::Moved,
            payload(json!({"column": remote})),
            "bob",
            10 + n as u64,
        );
        resolver.process(&mut tracker, &update, 20);

        assert_eq!(
            column(&tracker, "c1"),
            FieldValue::Conflicted {
                local: json!("doing"),
                remote: json!(remote),
            }
        );
        assert_eq!(resolver.len(), 1);
    }
}

#[test]
fn identical_values_never_conflict() {
    let mut tracker = board();
    let mut resolver = ConflictResolver::new();
    let nested = json!({"tags": ["a", "b"], "estimate": {"points": 3, "unit": null}});
    tracker
        .apply(
            "m-1",
            Mutation::set_field("c1", "meta", nested.clone()),
            1,
        )
        .unwrap();

    let update = Update::new(
        "u-1",
        "c1",
        ChangeKind::Updated,
        payload(json!({"meta": nested})),
        "bob",
        5,
    );
    let outcome = resolver.process(&mut tracker, &update, 6);

    assert!(outcome.conflicts.is_empty());
    assert_eq!(outcome.confirmed, vec!["m-1".to_string()]);
}

#[test]
fn remote_delete_of_locally_edited_card() {
    let mut tracker = board();
    let mut resolver = ConflictResolver::new();
    tracker
        .apply("m-1", Mutation::set_field("c2", "title", json!("Renamed")), 1)
        .unwrap();

    let delete = Update::new("u-1", "c2", ChangeKind::Deleted, Default::default(), "bob", 5);
    resolver.process(&mut tracker, &delete, 6);
    assert!(tracker.view().get("c2").is_none());

    // The server then rejects the rename; reverting keeps the card deleted.
    tracker.revert("m-1").unwrap();
    resolver.on_reverted(&mut tracker, "m-1");
    assert!(tracker.view().get("c2").is_none());
}

// ============================================================================
// Queue edge cases
// ============================================================================

#[test]
fn exhaustion_is_reported_once_across_restarts() {
    let store = MemoryQueueStore::new();
    let mut queue = OfflineQueue::open(store.clone(), policy(Some(5))).unwrap();
    queue
        .enqueue(QueuedItem::new("m-1", Mutation::move_to("c1", "done"), 0))
        .unwrap();

    let mut exhausted = 0;
    let mut now = 0;
    for _ in 0..10 {
        let report = queue
            .drain(now, 0.0, |item| Err(Error::SendTimeout(item.mutation_id.clone())))
            .unwrap();
        exhausted += report.exhausted.len();
        now += 60_000;
    }
    assert_eq!(exhausted, 1);
    assert_eq!(queue.get("m-1").unwrap().status, QueueStatus::Failed);

    // After a restart the item is pending again with its attempts kept.
    let restored = OfflineQueue::open(store, policy(Some(5))).unwrap();
    let item = restored.get("m-1").unwrap();
    assert_eq!(item.status, QueueStatus::Pending);
    assert_eq!(item.attempts, 5);
}

#[test]
fn unrelated_entities_are_not_blocked_by_a_failure() {
    let mut queue = OfflineQueue::in_memory(policy(Some(1)));
    queue
        .enqueue(QueuedItem::new("m-1", Mutation::move_to("c1", "done"), 1))
        .unwrap();
    queue
        .enqueue(QueuedItem::new("m-2", Mutation::move_to("c2", "done"), 2))
        .unwrap();

    let report = queue
        .drain(10, 0.0, |item| {
            if item.entity_id == "c1" {
                Err(Error::TransportUnavailable)
            } else {
                Ok(())
            }
        })
        .unwrap();

    assert_eq!(report.sent, vec!["m-2".to_string()]);
    assert_eq!(report.exhausted.len(), 1);
}

// ============================================================================
// Value edge cases
// ============================================================================

#[test]
fn unicode_and_large_values() {
    let mut tracker = board();
    let long = "x".repeat(1024 * 1024);
    let values = vec![
        json!("日本語テスト"),
        json!("🎉🚀💯"),
        json!("Hello\nWorld\tTab"),
        json!(long),
        json!(i64::MIN),
        json!(u64::MAX),
        json!(3.14159),
        Value::Null,
    ];

    for (i, value) in values.iter().enumerate() {
        tracker
            .apply(
                format!("m-{}", i),
                Mutation::set_field("c1", "title", value.clone()),
                i as u64,
            )
            .unwrap();
        assert_eq!(tracker.view().raw_field("c1", "title"), Some(value));
    }

    // Every edit superseded the previous one.
    assert_eq!(tracker.pending_count(), 1);
}

#[test]
fn mutation_on_unknown_entity_creates_it() {
    let mut tracker = OptimisticTracker::new();
    tracker
        .apply("m-1", Mutation::set_field("ghost", "title", json!("Boo")), 1)
        .unwrap();
    assert!(tracker.view().get("ghost").is_some());

    tracker.revert("m-1").unwrap();
    assert_eq!(tracker.view().raw_field("ghost", "title"), None);
}

#[test]
fn empty_mutations_are_refused() {
    let mut tracker = board();
    let err = tracker
        .apply(
            "m-1",
            Mutation::new("c1", ChangeKind::Updated, Default::default()),
            1,
        )
        .unwrap_err();
    assert!(matches!(err, Error::InvalidPayload(_)));
    assert_eq!(tracker.pending_count(), 0);
}
