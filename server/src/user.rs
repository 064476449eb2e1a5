//! Acting-user extraction.
//!
//! The user comes from the `x-user-id` header, or the `userId` query
//! parameter for browsers that cannot set headers on a WebSocket upgrade.
//! Requests without either act as `anonymous`.

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
};
use cardsync_engine::UserId;

/// Header carrying the acting user's ID.
pub const USER_HEADER: &str = "x-user-id";

const ANONYMOUS: &str = "anonymous";

/// User on whose behalf a request acts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActingUser(pub UserId);

impl<S> FromRequestParts<S> for ActingUser
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        if let Some(value) = parts.headers.get(USER_HEADER) {
            let user = value
                .to_str()
                .map_err(|_| (StatusCode::BAD_REQUEST, "Invalid x-user-id header"))?
                .trim();
            if user.is_empty() {
                return Err((StatusCode::BAD_REQUEST, "Empty x-user-id header"));
            }
            return Ok(ActingUser(user.to_string()));
        }

        let from_query = parts.uri.query().and_then(|query| {
            query
                .split('&')
                .filter_map(|pair| pair.split_once('='))
                .find(|(key, _)| *key == "userId")
                .map(|(_, value)| value.to_string())
        });

        Ok(ActingUser(
            from_query
                .filter(|user| !user.is_empty())
                .unwrap_or_else(|| ANONYMOUS.to_string()),
        ))
    }
}
