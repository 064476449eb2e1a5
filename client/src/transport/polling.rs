//! Polling transport.

use super::{ConnectionCell, EventSender, HttpApi, SendResult, TaskSlot, Transport, TransportEvent};
use crate::{config::SyncConfig, error::Result};
use async_trait::async_trait;
use cardsync_engine::{
    ConnectionEvent, ConnectionMachine, ConnectionPolicy, ConnectionState, Error, MutationRequest,
    TransportMode,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Fetches updates on a fixed interval.
///
/// Starts directly in `connected`; consecutive failed polls degrade the
/// connection and the next success restores it.
#[derive(Debug)]
pub struct PollingTransport {
    api: HttpApi,
    interval: Duration,
    cell: Arc<ConnectionCell>,
    cursor: Arc<AtomicU64>,
    task: TaskSlot,
}

impl PollingTransport {
    pub fn new(config: &SyncConfig) -> Result<Self> {
        let policy = ConnectionPolicy {
            mode: TransportMode::Polling,
            ..config.connection_policy()
        };

        Ok(Self {
            api: HttpApi::new(config)?,
            interval: config.poll_interval,
            cell: Arc::new(ConnectionCell::new(ConnectionMachine::new(policy))),
            cursor: Arc::new(AtomicU64::new(0)),
            task: TaskSlot::default(),
        })
    }

    /// Server time the next poll starts from.
    pub fn cursor(&self) -> u64 {
        self.cursor.load(Ordering::SeqCst)
    }
}

/// Fetch once and report the result. Shared with the push transport's
/// catch-up poll.
pub(crate) async fn poll_once(
    api: &HttpApi,
    cursor: &AtomicU64,
    events: &EventSender,
) -> Result<usize> {
    let since = cursor.load(Ordering::SeqCst);
    let response = api.fetch_updates(since).await?;

    cursor.fetch_max(response.server_time, Ordering::SeqCst);
    let count = response.updates.len();
    if count > 0 {
        tracing::debug!(since, count, "Fetched updates");
        let _ = events.send(TransportEvent::Batch(response.updates));
    }
    Ok(count)
}

#[async_trait]
impl Transport for PollingTransport {
    async fn start(&self, events: EventSender) -> Result<()> {
        let api = self.api.clone();
        let cell = self.cell.clone();
        let cursor = self.cursor.clone();
        let interval = self.interval;

        let started = self
            .task
            .spawn(move |token| async move {
                cell.handle(ConnectionEvent::Start, &events);

                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => {}
                    }

                    let result = tokio::select! {
                        _ = token.cancelled() => break,
                        result = poll_once(&api, &cursor, &events) => result,
                    };

                    match result {
                        Ok(_) => {
                            cell.handle(ConnectionEvent::PollSucceeded, &events);
                        }
                        Err(e) => {
                            tracing::warn!("Poll failed: {}", e);
                            cell.handle(ConnectionEvent::PollFailed, &events);
                        }
                    }
                }

                cell.handle(ConnectionEvent::Stop, &events);
            })
            .await;

        if started {
            tracing::info!(interval_ms = interval.as_millis() as u64, "Polling transport started");
        }
        Ok(())
    }

    async fn stop(&self) {
        self.task.stop().await;
    }

    async fn send(&self, request: MutationRequest) -> SendResult {
        if !self.cell.may_send() {
            return Err(Error::TransportUnavailable);
        }
        self.api.send_mutation(&request).await
    }

    fn state(&self) -> ConnectionState {
        self.cell.state()
    }
}
