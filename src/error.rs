//! Crate-wide error plumbing: the `axum` boundary error and a `FatalError`
//! used during start-up. Component-level errors (`PersistError`, `LlmError`,
//! `ScheduleError`, ...) live next to their components and convert into
//! `AppError` at the API edge, the way teacher's `AppError` in
//! `api/handlers.rs` wraps `DbError`/`LlmError` into HTTP responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<crate::persist::PersistError> for AppError {
    fn from(e: crate::persist::PersistError) -> Self {
        AppError::Internal(e.to_string())
    }
}

impl From<crate::memory::MemoryError> for AppError {
    fn from(e: crate::memory::MemoryError) -> Self {
        let message = e.to_string();
        match e {
            crate::memory::MemoryError::QuotaExceeded => AppError::Validation(message),
            crate::memory::MemoryError::Persist(_) => AppError::Internal(message),
        }
    }
}

impl From<crate::task_manager::TaskManagerError> for AppError {
    fn from(e: crate::task_manager::TaskManagerError) -> Self {
        let message = e.to_string();
        match e {
            crate::task_manager::TaskManagerError::NotFound(msg) => AppError::NotFound(msg),
            crate::task_manager::TaskManagerError::QuotaExceeded => AppError::Validation(message),
            _ => AppError::Internal(message),
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Validation(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

/// Errors that abort start-up rather than surfacing at request time:
/// persisted-state corruption or a schema invariant violated during boot
/// reconciliation. There is no sensible request to return these to, so they
/// are logged and the process exits non-zero.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("persisted state is corrupt: {0}")]
    CorruptState(String),

    #[error("failed to prepare persistence root: {0}")]
    PersistenceRoot(#[from] std::io::Error),
}

impl From<crate::persist::PersistError> for FatalError {
    fn from(e: crate::persist::PersistError) -> Self {
        FatalError::CorruptState(e.to_string())
    }
}
