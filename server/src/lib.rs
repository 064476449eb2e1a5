//! Cardsync Server - reference board server for Cardsync clients.
//!
//! Keeps the board in memory and exposes the sync surface the client
//! expects: `GET /updates?since=`, `POST /mutations` and the `/ws` push
//! socket.

pub mod board;
pub mod config;
pub mod error;
pub mod handlers;
pub mod routes;
pub mod user;
pub mod websocket;

use crate::board::Board;
use crate::config::Config;
use crate::websocket::ConnectionManager;
use axum::Router;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub board: Arc<Board>,
    pub config: Arc<Config>,
    pub conn_manager: Arc<ConnectionManager>,
}

impl AppState {
    /// Fresh state with an empty board.
    pub fn new(config: Config) -> Self {
        Self {
            board: Arc::new(Board::new()),
            config: Arc::new(config),
            conn_manager: ConnectionManager::new_shared(),
        }
    }
}

/// Build the application router.
pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(routes::create_routes())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
