//! WebSocket handler for push clients.
//!
//! Outbound frames go through the connection manager channel so broadcasts,
//! heartbeats and replies share one writer task.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use cardsync_engine::UserId;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::websocket::{ConnectionManager, PushFrame};

/// Handle an established push socket.
///
/// This function:
/// 1. Registers the connection with the manager
/// 2. Spawns a task to forward outgoing frames
/// 3. Spawns the heartbeat ticker
/// 4. Processes incoming frames until the socket closes
pub async fn handle_websocket_connection(
    socket: WebSocket,
    conn_manager: Arc<ConnectionManager>,
    user_id: UserId,
    heartbeat: Duration,
) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<PushFrame>();
    let conn_id = conn_manager.register(user_id.clone(), tx);

    tracing::info!(conn_id = %conn_id, user_id = %user_id, "Push client connected");

    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            match serde_json::to_string(&frame) {
                Ok(text) => {
                    if let Err(e) = ws_sender.send(Message::Text(text.into())).await {
                        tracing::warn!("Failed to send push frame: {}", e);
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to serialize push frame: {}", e);
                }
            }
        }
    });

    let heartbeat_task = {
        let conn_manager = conn_manager.clone();
        let conn_id = conn_id.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + heartbeat, heartbeat);
            loop {
                ticker.tick().await;
                if !conn_manager.send_to(&conn_id, PushFrame::Ping) {
                    break;
                }
            }
        })
    };

    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(Message::Text(text)) => match serde_json::from_str::<PushFrame>(text.as_str()) {
                Ok(PushFrame::Ping) => {
                    conn_manager.send_to(&conn_id, PushFrame::Pong);
                }
                Ok(PushFrame::Pong) => {
                    tracing::trace!(conn_id = %conn_id, "Heartbeat acknowledged");
                }
                Ok(PushFrame::Update { .. }) => {
                    tracing::warn!(conn_id = %conn_id, "Clients send mutations over HTTP; update frame ignored");
                }
                Err(e) => {
                    tracing::warn!(conn_id = %conn_id, "Invalid push frame: {}", e);
                }
            },
            Ok(Message::Binary(_)) => {
                tracing::warn!("Binary messages not supported");
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => {
                tracing::info!(conn_id = %conn_id, "WebSocket close frame received");
                break;
            }
            Err(e) => {
                tracing::warn!(conn_id = %conn_id, "WebSocket error: {}", e);
                break;
            }
        }
    }

    conn_manager.unregister(&conn_id);
    heartbeat_task.abort();
    send_task.abort();

    tracing::info!(
        conn_id = %conn_id,
        user_id = %user_id,
        active_connections = conn_manager.connection_count(),
        "Push client disconnected"
    );
}
