use crate::executor::ExecError;
use crate::services::{BroadcastError, ConnectionError};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("Pooled transport not found: {0}")]
    ConnectionNotFound(String),

    #[error("Host not found: {0}")]
    HostNotFound(String),

    #[error("Host is inactive: {0}")]
    HostInactive(String),

    #[error("Key material unavailable: {0}")]
    KeyMaterial(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Not authorized for execution {0}")]
    AuthorizationDenied(String),

    #[error("Missing requester identity")]
    Unauthenticated,

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error(transparent)]
    Broadcast(#[from] BroadcastError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::Database(e) => {
                tracing::error!("Database error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
            AppError::ExecutionNotFound(id) => (
                StatusCode::NOT_FOUND,
                format!("Execution '{}' not found", id),
            ),
            AppError::ConnectionNotFound(key) => (
                StatusCode::NOT_FOUND,
                format!("Pooled transport '{}' not found", key),
            ),
            AppError::HostNotFound(id) => {
                (StatusCode::NOT_FOUND, format!("Host '{}' not found", id))
            }
            AppError::HostInactive(id) => {
                (StatusCode::FORBIDDEN, format!("Host '{}' is inactive", id))
            }
            AppError::KeyMaterial(e) => (StatusCode::BAD_REQUEST, e),
            AppError::InvalidRequest(e) => (StatusCode::BAD_REQUEST, e),
            AppError::AuthorizationDenied(id) => (
                StatusCode::FORBIDDEN,
                format!("Not authorized for execution '{}'", id),
            ),
            AppError::Unauthenticated => (
                StatusCode::UNAUTHORIZED,
                "Missing X-User-Id header".to_string(),
            ),
            AppError::Connection(e) => {
                tracing::warn!("Connection error: {}", e);
                (StatusCode::BAD_GATEWAY, e.to_string())
            }
            AppError::Exec(e) => {
                let status = match e {
                    ExecError::InvalidCommand(_) => StatusCode::BAD_REQUEST,
                    ExecError::SpawnFailed(_) | ExecError::Io(_) => StatusCode::BAD_GATEWAY,
                };
                (status, e.to_string())
            }
            AppError::Broadcast(e) => {
                let status = match e {
                    BroadcastError::NotFound(_) => StatusCode::NOT_FOUND,
                    BroadcastError::AlreadySubscribed(_) => StatusCode::CONFLICT,
                    BroadcastError::Unauthorized(_) => StatusCode::FORBIDDEN,
                };
                (status, e.to_string())
            }
            AppError::Io(e) => {
                tracing::error!("IO error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        };

        let body = json!({
            "error": message
        });

        (status, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
