//! REST handlers.

use axum::extract::{Path, State};
use axum::Json;

use crate::conversation::{Conversation, StoreError};
use crate::repo::RepositoryInfo;

use super::{ApiError, AppState};

/// GET /api/conversation/{id}
///
/// Returns the stored transcript for replay by the client.
pub async fn get_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Conversation>, ApiError> {
    match state.conversations.get(&id).await {
        Ok(conversation) => Ok(Json(conversation)),
        Err(StoreError::NotFound(id)) => Err(ApiError::not_found(format!("conversation {id}"))),
        Err(e) => Err(ApiError::internal(e.to_string())),
    }
}

/// GET /api/repositories
///
/// Lists clonable source repositories with their branches.
pub async fn list_repositories(State(state): State<AppState>) -> Json<Vec<RepositoryInfo>> {
    Json(state.repos.list_repositories().await)
}
