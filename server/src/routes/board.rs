//! Board endpoint routes.

use axum::{
    extract::{ws::WebSocketUpgrade, Query, State},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use cardsync_engine::{MutationRequest, MutationResponse, PollResponse};

use crate::error::Result;
use crate::handlers::{handle_mutation, handle_updates, handle_websocket_connection, UpdatesQuery};
use crate::user::ActingUser;
use crate::AppState;

/// Create board routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/updates", get(updates_handler))
        .route("/mutations", post(mutation_handler))
        .route("/ws", get(websocket_handler))
}

/// GET /updates - Updates newer than `since`.
async fn updates_handler(
    State(state): State<AppState>,
    Query(query): Query<UpdatesQuery>,
) -> Json<PollResponse> {
    Json(handle_updates(&state.board, query).await)
}

/// POST /mutations - Apply one mutation.
async fn mutation_handler(
    State(state): State<AppState>,
    ActingUser(user_id): ActingUser,
    Json(request): Json<MutationRequest>,
) -> Result<Json<MutationResponse>> {
    let response = handle_mutation(&state, &user_id, request).await?;
    Ok(Json(response))
}

/// GET /ws - Upgrade to a push socket.
async fn websocket_handler(
    State(state): State<AppState>,
    ActingUser(user_id): ActingUser,
    ws: WebSocketUpgrade,
) -> Response {
    let conn_manager = state.conn_manager.clone();
    let heartbeat = state.config.heartbeat_interval;
    ws.on_upgrade(move |socket| {
        handle_websocket_connection(socket, conn_manager, user_id, heartbeat)
    })
}
