//! Session History Handlers

use axum::{
    extract::{Extension, Query, State},
    Json,
};
use serde::Deserialize;
use validator::Validate;

use crate::domain::{sort_newest_first, SessionSummary};
use crate::presentation::middleware::AuthUser;
use crate::shared::error::AppError;
use crate::startup::AppState;

const DEFAULT_LIMIT: usize = 50;

#[derive(Debug, Deserialize, Validate)]
pub struct ListSessionsQuery {
    #[validate(range(min = 1, max = 200))]
    pub limit: Option<usize>,
}

/// The caller's own sessions from the store, newest first
pub async fn list_my_sessions(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Query(query): Query<ListSessionsQuery>,
) -> Result<Json<Vec<SessionSummary>>, AppError> {
    query
        .validate()
        .map_err(|e| AppError::BadRequest(e.to_string()))?;

    let limit = query.limit.unwrap_or(DEFAULT_LIMIT);
    let timeout = state.settings.storage.timeout();
    let mut sessions =
        match tokio::time::timeout(timeout, state.store.list_user_sessions(&auth.user_id, limit)).await {
            Ok(result) => result?,
            Err(_) => {
                tracing::warn!(user_id = %auth.user_id, "Session listing timed out");
                return Err(AppError::Internal("session listing timed out".into()));
            }
        };
    sort_newest_first(&mut sessions);

    Ok(Json(sessions))
}
