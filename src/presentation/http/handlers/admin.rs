//! Admin Handlers
//!
//! Session oversight for administrators. Routes are mounted behind
//! `auth_middleware`, `require_admin` and the admin rate limiter.

use axum::{
    extract::{Extension, Path, State},
    Json,
};
use serde::Serialize;

use crate::application::services::{RegistryStats, SessionError};
use crate::domain::SessionSummary;
use crate::presentation::middleware::AuthUser;
use crate::shared::error::AppError;
use crate::startup::AppState;

#[derive(Debug, Serialize)]
pub struct SessionListResponse {
    pub sessions: Vec<SessionSummary>,
    pub total: usize,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub sessions: RegistryStats,
    pub connections: usize,
    pub online_users: usize,
}

/// Every session the registry holds, newest first
pub async fn list_sessions(State(state): State<AppState>) -> Json<SessionListResponse> {
    let sessions = state.sessions.list_sessions();

    Json(SessionListResponse {
        total: sessions.len(),
        sessions,
    })
}

pub async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        sessions: state.sessions.stats(),
        connections: state.connections.count(),
        online_users: state.connections.user_count(),
    })
}

/// Take over a session. Exactly one administrator wins; everyone else
/// gets 409 until the winner leaves.
pub async fn takeover(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionSummary>, AppError> {
    let session = state
        .router
        .take_over_session(&admin, &session_id)
        .await
        .map_err(admin_error)?;

    Ok(Json(session.summary()))
}

/// Hand a session back to the model.
pub async fn leave(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionSummary>, AppError> {
    let session = state
        .router
        .leave_session(&admin, &session_id)
        .await
        .map_err(admin_error)?;

    Ok(Json(session.summary()))
}

fn admin_error(e: SessionError) -> AppError {
    match e {
        SessionError::NotFound(id) => AppError::NotFound(format!("Session {} not found", id)),
        SessionError::AlreadyAssisted { .. } => {
            AppError::Conflict("Session is already assisted by another administrator".into())
        }
        SessionError::NotAssisting => {
            AppError::Forbidden("Session is not assisted by this administrator".into())
        }
        SessionError::OwnershipViolation => AppError::Forbidden("Access denied".into()),
        SessionError::IdExhausted => AppError::Internal(e.to_string()),
    }
}
