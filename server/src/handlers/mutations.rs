//! Mutations handler - applies client mutations to the board.

use crate::board::Applied;
use crate::error::{AppError, Result};
use crate::AppState;
use cardsync_engine::{MutationRequest, MutationResponse};

/// Apply a mutation and fan the new update out to push sockets.
///
/// A repeated mutation ID returns the original update with
/// `duplicate: true` and is not broadcast again.
pub async fn handle_mutation(
    state: &AppState,
    user_id: &str,
    request: MutationRequest,
) -> Result<MutationResponse> {
    if request.mutation_id.is_empty() {
        return Err(AppError::BadRequest("mutationId is required".to_string()));
    }

    let mutation_id = request.mutation_id.clone();
    let applied = state
        .board
        .apply(request, user_id)
        .await
        .map_err(|refusal| AppError::Refused {
            mutation_id: mutation_id.clone(),
            refusal,
        })?;

    match &applied {
        Applied::New(update) => {
            state.conn_manager.broadcast(update);
            tracing::info!(
                mutation_id = %mutation_id,
                entity_id = %update.entity_id,
                user_id,
                "Mutation applied"
            );
        }
        Applied::Duplicate(_) => {
            tracing::debug!(mutation_id = %mutation_id, "Duplicate mutation");
        }
    }

    Ok(MutationResponse {
        mutation_id,
        duplicate: applied.is_duplicate(),
        update: applied.update().clone(),
    })
}
