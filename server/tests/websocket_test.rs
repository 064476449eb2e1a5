//! Integration tests for the push socket.

use cardsync_engine::{Mutation, MutationRequest, PushFrame};
use cardsync_server::{app, config::Config, AppState};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;

async fn spawn_server(heartbeat: Duration) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let config = Config {
        heartbeat_interval: heartbeat,
        ..Config::default()
    };
    tokio::spawn(async move {
        axum::serve(listener, app(AppState::new(config))).await.unwrap();
    });
    addr.to_string()
}

/// Read frames until one matches.
async fn expect_frame<S>(stream: &mut S, wanted: impl Fn(&PushFrame) -> bool) -> PushFrame
where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(Ok(Message::Text(text))) = stream.next().await {
                let frame: PushFrame = serde_json::from_str(text.as_str()).unwrap();
                if wanted(&frame) {
                    return frame;
                }
            }
        }
    })
    .await
    .unwrap()
}

#[cfg(test)]
mod websocket_protocol_tests {
    use super::*;

    #[tokio::test]
    async fn test_server_pings_on_heartbeat() {
        let addr = spawn_server(Duration::from_millis(50)).await;
        let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", addr))
            .await
            .unwrap();

        let frame = expect_frame(&mut socket, |_| true).await;
        assert_eq!(frame, PushFrame::Ping);
    }

    #[tokio::test]
    async fn test_client_ping_gets_pong() {
        let addr = spawn_server(Duration::from_secs(60)).await;
        let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", addr))
            .await
            .unwrap();

        let ping = serde_json::to_string(&PushFrame::Ping).unwrap();
        socket.send(Message::Text(ping.into())).await.unwrap();

        let frame = expect_frame(&mut socket, |f| *f == PushFrame::Pong).await;
        assert_eq!(frame, PushFrame::Pong);
    }

    #[tokio::test]
    async fn test_new_updates_are_pushed_to_every_socket() {
        let addr = spawn_server(Duration::from_secs(60)).await;
        let url = format!("ws://{}/ws?userId=bob", addr);
        let (mut first, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
        let (mut second, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();

        // Registration happens after the upgrade completes.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let request = MutationRequest::new(
            "m-1",
            Mutation::new(
                "c1",
                cardsync_engine::ChangeKind::Created,
                cardsync_engine::payload(serde_json::json!({"title": "New"})),
            ),
        );
        reqwest::Client::new()
            .post(format!("http://{}/mutations", addr))
            .header("x-user-id", "alice")
            .json(&request)
            .send()
            .await
            .unwrap()
            .error_for_status()
            .unwrap();

        for socket in [&mut first, &mut second] {
            let frame = expect_frame(socket, |f| matches!(f, PushFrame::Update { .. })).await;
            match frame {
                PushFrame::Update { update } => {
                    assert_eq!(update.entity_id, "c1");
                    assert_eq!(update.origin_user_id, "alice");
                    assert!(update.echoes("m-1"));
                }
                other => panic!("unexpected frame {:?}", other),
            }
        }
    }
}
