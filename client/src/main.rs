//! cardsync-watch - follows a board and logs every sync event.
//!
//! Configuration comes from `CARDSYNC_*` environment variables (a `.env`
//! file is honoured). Stop with Ctrl-C.

use cardsync_client::{SyncConfig, SyncEvent, SyncFacade};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cardsync_client=debug,cardsync_watch=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let config = SyncConfig::from_env()?;

    tracing::info!(
        endpoint = %config.endpoint,
        mode = ?config.mode,
        user_id = %config.user_id,
        "Watching board"
    );

    let facade = SyncFacade::from_config(&config)?;
    let mut events = facade.subscribe();
    facade.start().await?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event log fell behind");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    facade.stop().await;

    let metrics = facade.metrics().await;
    tracing::info!(
        total = metrics.total_updates,
        success_rate = metrics.success_rate,
        average_latency_ms = metrics.average_latency_ms,
        "Final sync metrics"
    );
    Ok(())
}

fn log_event(event: &SyncEvent) {
    match event {
        SyncEvent::ViewChanged { entity_id, fields } => {
            tracing::info!(entity_id = %entity_id, ?fields, "View changed");
        }
        SyncEvent::Confirmed { mutation_id } => {
            tracing::info!(mutation_id = %mutation_id, "Confirmed");
        }
        SyncEvent::Rejected {
            mutation_id,
            reason,
            ..
        } => {
            tracing::warn!(mutation_id = %mutation_id, reason = %reason, "Rejected");
        }
        SyncEvent::ConflictDetected(conflict) => {
            tracing::warn!(
                conflict_id = %conflict.id,
                local = %conflict.local_value,
                remote = %conflict.remote_value,
                "Conflict detected"
            );
        }
        SyncEvent::ConflictResolved(conflict) => {
            tracing::info!(conflict_id = %conflict.id, "Conflict resolved");
        }
        SyncEvent::QueueExhausted {
            mutation_id,
            attempts,
        } => {
            tracing::error!(mutation_id = %mutation_id, attempts, "Mutation gave up");
        }
        SyncEvent::ConnectionChanged(transition) => {
            tracing::info!(from = %transition.from, to = %transition.to, "Connection changed");
        }
    }
}
