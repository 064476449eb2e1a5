//! Push transport over a WebSocket.
//!
//! The socket loop pings every heartbeat interval; any inbound frame counts
//! as an ack. A heartbeat tick more than two intervals after the last
//! inbound frame counts as missed. Each (re)open runs a catch-up poll so
//! updates sent while the socket was down are not lost.

use super::{
    polling::poll_once, ConnectionCell, EventSender, HttpApi, SendResult, TaskSlot, Transport,
    TransportEvent,
};
use crate::{config::SyncConfig, error::Result};
use async_trait::async_trait;
use cardsync_engine::{
    Action, ConnectionEvent, ConnectionMachine, ConnectionPolicy, ConnectionState, Error,
    MutationRequest, PushFrame, TransportMode,
};
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_tungstenite::{tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

/// Why a socket session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Closed,
    HeartbeatLost,
    Cancelled,
}

/// Keeps a WebSocket open to the server.
#[derive(Debug)]
pub struct PushTransport {
    api: HttpApi,
    ws_url: String,
    heartbeat: Duration,
    cell: Arc<ConnectionCell>,
    cursor: Arc<AtomicU64>,
    task: TaskSlot,
}

impl PushTransport {
    pub fn new(config: &SyncConfig) -> Result<Self> {
        let policy = ConnectionPolicy {
            mode: TransportMode::Push,
            ..config.connection_policy()
        };

        Ok(Self {
            api: HttpApi::new(config)?,
            ws_url: config.ws_url(),
            heartbeat: config.heartbeat_interval,
            cell: Arc::new(ConnectionCell::new(ConnectionMachine::new(policy))),
            cursor: Arc::new(AtomicU64::new(0)),
            task: TaskSlot::default(),
        })
    }
}

#[derive(Clone)]
struct Link {
    api: HttpApi,
    ws_url: String,
    heartbeat: Duration,
    cell: Arc<ConnectionCell>,
    cursor: Arc<AtomicU64>,
    events: EventSender,
}

impl Link {
    /// Connect, run a session, reconnect with backoff until cancelled.
    async fn supervise(self, token: CancellationToken) {
        loop {
            self.cell.handle(ConnectionEvent::Start, &self.events);

            let connected = tokio::select! {
                _ = token.cancelled() => break,
                result = self.open() => result,
            };

            match connected {
                Ok(stream) => {
                    tracing::info!(url = %self.ws_url, "Push socket opened");
                    self.cell.handle(ConnectionEvent::Opened, &self.events);

                    if let Err(e) = poll_once(&self.api, &self.cursor, &self.events).await {
                        tracing::warn!("Catch-up poll failed: {}", e);
                    }

                    match self.session(stream, &token).await {
                        SessionEnd::Cancelled => break,
                        end => tracing::info!(?end, "Push socket closed"),
                    }
                }
                Err(e) => {
                    tracing::warn!(url = %self.ws_url, "Push connect failed: {}", e);
                }
            }

            if token.is_cancelled() {
                break;
            }

            match self.cell.handle(ConnectionEvent::Closed, &self.events) {
                Some(Action::ScheduleReconnect { attempt }) => {
                    let delay = self.cell.reconnect_delay(attempt);
                    tracing::debug!(attempt, delay_ms = delay, "Scheduling reconnect");
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
                    }
                }
                _ => {
                    tracing::info!("Reconnect disabled; push transport idle");
                    token.cancelled().await;
                    break;
                }
            }
        }

        self.cell.handle(ConnectionEvent::Stop, &self.events);
    }

    async fn open(&self) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>> {
        let (stream, _) = tokio_tungstenite::connect_async(self.ws_url.as_str()).await?;
        Ok(stream)
    }

    async fn session<S>(&self, stream: S, token: &CancellationToken) -> SessionEnd
    where
        S: futures::Stream<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>
            + futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
            + Unpin,
    {
        let (mut sink, mut stream) = stream.split();

        let mut ticker = tokio::time::interval_at(Instant::now() + self.heartbeat, self.heartbeat);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_inbound = Instant::now();

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return SessionEnd::Cancelled;
                }
                _ = ticker.tick() => {
                    if last_inbound.elapsed() > self.heartbeat * 2 {
                        tracing::debug!("Heartbeat missed");
                        if let Some(Action::ForceReconnect) =
                            self.cell.handle(ConnectionEvent::HeartbeatMissed, &self.events)
                        {
                            let _ = sink.send(Message::Close(None)).await;
                            return SessionEnd::HeartbeatLost;
                        }
                    }
                    if let Err(e) = send_frame(&mut sink, &PushFrame::Ping).await {
                        tracing::warn!("Heartbeat ping failed: {}", e);
                        return SessionEnd::Closed;
                    }
                }
                message = stream.next() => {
                    let message = match message {
                        Some(Ok(message)) => message,
                        Some(Err(e)) => {
                            tracing::warn!("Push socket error: {}", e);
                            return SessionEnd::Closed;
                        }
                        None => return SessionEnd::Closed,
                    };

                    last_inbound = Instant::now();
                    self.cell.handle(ConnectionEvent::HeartbeatAck, &self.events);

                    match message {
                        Message::Text(text) => {
                            if let Some(reply) = self.on_frame(&text) {
                                if let Err(e) = send_frame(&mut sink, &reply).await {
                                    tracing::warn!("Push reply failed: {}", e);
                                    return SessionEnd::Closed;
                                }
                            }
                        }
                        Message::Ping(data) => {
                            if sink.send(Message::Pong(data)).await.is_err() {
                                return SessionEnd::Closed;
                            }
                        }
                        Message::Close(_) => return SessionEnd::Closed,
                        _ => {}
                    }
                }
            }
        }
    }

    /// Handle a text frame; returns the reply to send, if any.
    fn on_frame(&self, text: &str) -> Option<PushFrame> {
        match serde_json::from_str::<PushFrame>(text) {
            Ok(PushFrame::Update { update }) => {
                self.cursor.fetch_max(update.server_timestamp, Ordering::SeqCst);
                let _ = self.events.send(TransportEvent::Batch(vec![update]));
                None
            }
            Ok(PushFrame::Ping) => Some(PushFrame::Pong),
            Ok(PushFrame::Pong) => None,
            Err(e) => {
                tracing::warn!("Ignoring malformed push frame: {}", e);
                None
            }
        }
    }
}

async fn send_frame<S>(sink: &mut S, frame: &PushFrame) -> Result<()>
where
    S: futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let text = serde_json::to_string(frame)?;
    sink.send(Message::Text(text.into())).await?;
    Ok(())
}

#[async_trait]
impl Transport for PushTransport {
    async fn start(&self, events: EventSender) -> Result<()> {
        let link = Link {
            api: self.api.clone(),
            ws_url: self.ws_url.clone(),
            heartbeat: self.heartbeat,
            cell: self.cell.clone(),
            cursor: self.cursor.clone(),
            events,
        };

        if self.task.spawn(move |token| link.supervise(token)).await {
            tracing::info!(url = %self.ws_url, "Push transport started");
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
