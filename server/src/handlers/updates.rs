//! Updates handler - serves the update log to polling clients.

use crate::board::Board;
use cardsync_engine::{PollResponse, Timestamp};
use serde::Deserialize;

/// Query parameters for `GET /updates`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatesQuery {
    /// Server timestamp cursor from the previous poll (0 for everything)
    #[serde(default)]
    pub since: Timestamp,
}

/// Return every update newer than the cursor.
pub async fn handle_updates(board: &Board, query: UpdatesQuery) -> PollResponse {
    let response = board.since(query.since).await;
    if !response.updates.is_empty() {
        tracing::debug!(
            since = query.since,
            count = response.updates.len(),
            "Serving updates"
        );
    }
    response
}
