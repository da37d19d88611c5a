//! Maps crate-level errors onto HTTP status codes and a structured JSON
//! body, per the Input/Capacity/Transport/Unexpected taxonomy each crate's
//! error variants are documented against.

use axum::{http::StatusCode, response::IntoResponse, response::Response, Json};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error(transparent)]
    Scheduler(#[from] waypoint_scheduler::SchedulerError),
    #[error(transparent)]
    Registry(#[from] waypoint_registry::RegistryError),
    #[error(transparent)]
    Audit(#[from] waypoint_audit::AuditError),
    #[error(transparent)]
    Collab(#[from] waypoint_collab::CollabError),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Scheduler(waypoint_scheduler::SchedulerError::NotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Scheduler(_) => StatusCode::CONFLICT,
            ApiError::Registry(waypoint_registry::RegistryError::NotConnected(_)) => StatusCode::CONFLICT,
            ApiError::Registry(_) => StatusCode::CONFLICT,
            ApiError::Audit(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Collab(waypoint_collab::CollabError::SessionNotFound(_))
            | ApiError::Collab(waypoint_collab::CollabError::ParticipantNotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Collab(_) => StatusCode::CONFLICT,
        };
        (status, Json(ErrorBody { error: self.to_string() })).into_response()
    }
}
