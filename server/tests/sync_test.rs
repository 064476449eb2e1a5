//! Integration tests for the HTTP sync surface.

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
};
use cardsync_engine::{
    payload, ChangeKind, Mutation, MutationRequest, MutationResponse, PollResponse, Rejection,
};
use cardsync_server::{app, config::Config, AppState};
use serde_json::json;
use tower::ServiceExt;

fn create_card(mutation_id: &str, card: &str) -> MutationRequest {
    MutationRequest::new(
        mutation_id,
        Mutation::new(
            card,
            ChangeKind::Created,
            payload(json!({"title": "Write docs", "column": "todo"})),
        ),
    )
}

async fn spawn_server() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app(AppState::new(Config::default())))
            .await
            .unwrap();
    });
    format!("http://{}", addr)
}

#[cfg(test)]
mod router_tests {
    use super::*;

    async fn post(state: &AppState, request: &MutationRequest) -> (StatusCode, serde_json::Value) {
        let response = app(state.clone())
            .oneshot(
                Request::post("/mutations")
                    .header("content-type", "application/json")
                    .header("x-user-id", "alice")
                    .body(Body::from(serde_json::to_vec(request).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let state = AppState::new(Config::default());
        let response = app(state)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(health["status"], "ok");
        assert_eq!(health["updates"], 0);
    }

    #[tokio::test]
    async fn test_mutation_records_acting_user() {
        let state = AppState::new(Config::default());
        let (status, body) = post(&state, &create_card("m-1", "c1")).await;
        assert_eq!(status, StatusCode::OK);

        let response: MutationResponse = serde_json::from_value(body).unwrap();
        assert!(!response.duplicate);
        assert_eq!(response.update.origin_user_id, "alice");
        assert_eq!(response.update.mutation_id.as_deref(), Some("m-1"));
    }

    #[tokio::test]
    async fn test_refusals_use_rejection_statuses() {
        let state = AppState::new(Config::default());

        let unknown = MutationRequest::new("m-1", Mutation::move_to("c9", "done"));
        let (status, body) = post(&state, &unknown).await;
        assert_eq!(status, StatusCode::CONFLICT);
        let rejection: Rejection = serde_json::from_value(body).unwrap();
        assert_eq!(rejection.mutation_id, "m-1");
        assert!(rejection.reason.contains("c9"));

        post(&state, &create_card("m-2", "c1")).await;
        post(&state, &MutationRequest::new("m-3", Mutation::delete("c1"))).await;
        let (status, _) = post(
            &state,
            &MutationRequest::new("m-4", Mutation::move_to("c1", "done")),
        )
        .await;
        assert_eq!(status, StatusCode::GONE);

        let empty = MutationRequest::new(
            "m-5",
            Mutation::new("c2", ChangeKind::Updated, Default::default()),
        );
        let (status, _) = post(&state, &empty).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_missing_mutation_id_is_a_bad_request() {
        let state = AppState::new(Config::default());
        let (status, body) = post(&state, &create_card("", "c1")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("mutationId"));
    }
}

#[cfg(test)]
mod http_tests {
    use super::*;

    #[tokio::test]
    async fn test_resent_mutation_is_applied_once() {
        let base = spawn_server().await;
        let client = reqwest::Client::new();
        let request = create_card("m-1", "c1");

        let first: MutationResponse = client
            .post(format!("{}/mutations", base))
            .json(&request)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let second: MutationResponse = client
            .post(format!("{}/mutations", base))
            .json(&request)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        assert!(!first.duplicate);
        assert!(second.duplicate);
        assert_eq!(first.update, second.update);

        let log: PollResponse = client
            .get(format!("{}/updates?since=0", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(log.updates.len(), 1);
    }

    #[tokio::test]
    async fn test_polling_with_the_returned_cursor() {
        let base = spawn_server().await;
        let client = reqwest::Client::new();

        for (id, card) in [("m-1", "c1"), ("m-2", "c2")] {
            client
                .post(format!("{}/mutations", base))
                .json(&create_card(id, card))
                .send()
                .await
                .unwrap();
        }

        let first: PollResponse = client
            .get(format!("{}/updates", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(first.updates.len(), 2);

        client
            .post(format!("{}/mutations", base))
            .json(&MutationRequest::new("m-3", Mutation::move_to("c1", "done")))
            .send()
            .await
            .unwrap();

        let next: PollResponse = client
            .get(format!("{}/updates?since={}", base, first.server_time))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(next.updates.len(), 1);
        assert_eq!(next.updates[0].kind, ChangeKind::Moved);
        assert!(next.server_time > first.server_time);
    }
}
