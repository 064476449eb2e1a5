//! Unified error handling for the server.

use crate::board::Refusal;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use cardsync_engine::{MutationId, Rejection};
use serde::Serialize;

/// Application error type.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// A mutation the board will not apply. Clients drop it without retrying.
    #[error("Mutation {mutation_id} refused: {refusal}")]
    Refused {
        mutation_id: MutationId,
        refusal: Refusal,
    },

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    #[allow(dead_code)]
    Internal(String),
}

/// Error response body.
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::Refused { refusal, .. } => match refusal {
                Refusal::Unknown(_) | Refusal::Exists(_) => StatusCode::CONFLICT,
                Refusal::Deleted(_) => StatusCode::GONE,
                Refusal::Invalid(_) => StatusCode::UNPROCESSABLE_ENTITY,
            },
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();

        match self {
            AppError::Refused {
                mutation_id,
                refusal,
            } => {
                tracing::info!(mutation_id = %mutation_id, "Mutation refused: {}", refusal);
                let body = Json(Rejection {
                    mutation_id,
                    reason: refusal.to_string(),
                });
                (status, body).into_response()
            }
            AppError::BadRequest(msg) => {
                let body = Json(ErrorResponse {
                    error: msg,
                    details: None,
                });
                (status, body).into_response()
            }
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                let body = Json(ErrorResponse {
                    error: "Internal server error".to_string(),
                    details: Some(msg),
                });
                (status, body).into_response()
            }
        }
    }
}

/// Result type alias for handlers.
pub type Result<T> = std::result::Result<T, AppError>;
