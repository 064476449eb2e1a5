//! Update transports.
//!
//! A [`Transport`] delivers server updates and connection changes as
//! [`TransportEvent`]s and sends mutations. Two implementations exist:
//!
//! - [`PollingTransport`] fetches `GET /updates?since=` on a fixed interval
//! - [`PushTransport`] keeps a WebSocket open with heartbeats and reconnects
//!
//! Both send mutations through the same [`HttpApi`].

mod http;
mod polling;
mod push;

pub use http::HttpApi;
pub use polling::PollingTransport;
pub use push::PushTransport;

use crate::{config::SyncConfig, error::Result, now_ms};
use async_trait::async_trait;
use cardsync_engine::{
    Action, ConnectionEvent, ConnectionMachine, ConnectionState, MutationRequest,
    MutationResponse, Transition, TransportMode, Update,
};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// What a transport reports.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Updates received from the server
    Batch(Vec<Update>),
    /// The connection state changed
    Connection(Transition),
}

/// Sender half handed to [`Transport::start`].
pub type EventSender = mpsc::UnboundedSender<TransportEvent>;

/// Outcome of one mutation send. Errors are engine errors so the queue can
/// classify them (`TransportUnavailable`, `SendTimeout`, `SendRejected`).
pub type SendResult = std::result::Result<MutationResponse, cardsync_engine::Error>;

/// Delivery strategy.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Begin delivering events. Calling it twice is a no-op.
    async fn start(&self, events: EventSender) -> Result<()>;

    /// Cancel timers and sockets.
    async fn stop(&self);

    /// Send one mutation. Fails fast with `TransportUnavailable` when the
    /// connection does not allow sends.
    async fn send(&self, request: MutationRequest) -> SendResult;

    /// Current connection state.
    fn state(&self) -> ConnectionState;
}

/// Build the transport selected by the configuration.
pub fn from_config(config: &SyncConfig) -> Result<Arc<dyn Transport>> {
    let transport: Arc<dyn Transport> = match config.mode {
        TransportMode::Polling => Arc::new(PollingTransport::new(config)?),
        TransportMode::Push => Arc::new(PushTransport::new(config)?),
    };
    Ok(transport)
}

/// Connection state machine shared by a transport and its tasks.
#[derive(Debug)]
pub(crate) struct ConnectionCell {
    machine: Mutex<ConnectionMachine>,
}

impl ConnectionCell {
    pub(crate) fn new(machine: ConnectionMachine) -> Self {
        Self {
            machine: Mutex::new(machine),
        }
    }

    /// Feed an event and report any transition.
    pub(crate) fn handle(&self, event: ConnectionEvent, events: &EventSender) -> Option<Action> {
        let step = {
            let mut machine = self.machine.lock().unwrap_or_else(|e| e.into_inner());
            machine.handle(event, now_ms())
        };

        if let Some(transition) = step.transition {
            tracing::info!(
                from = %transition.from,
                to = %transition.to,
                "Connection state changed"
            );
            let _ = events.send(TransportEvent::Connection(transition));
        }
        step.action
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.machine
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .state()
    }

    pub(crate) fn may_send(&self) -> bool {
        self.machine
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .may_send()
    }

    pub(crate) fn reconnect_delay(&self, attempt: u32) -> u64 {
        self.machine
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .reconnect_delay(attempt, rand::random::<f64>())
    }
}

/// Background task of a running transport.
#[derive(Debug, Default)]
pub(crate) struct TaskSlot {
    running: tokio::sync::Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl TaskSlot {
    /// Spawn the task unless one is already running.
    pub(crate) async fn spawn<F, Fut>(&self, task: F) -> bool
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return false;
        }
        let token = CancellationToken::new();
        let handle = tokio::spawn(task(token.clone()));
        *running = Some((token, handle));
        true
    }

    /// Cancel the task and wait for it to finish.
    pub(crate) async fn stop(&self) {
        let running = self.running.lock().await.take();
        if let Some((token, handle)) = running {
            token.cancel();
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    tracing::warn!("Transport task failed: {}", e);
                }
            }
        }
    }
}
