//! Error taxonomy shared by the socket and HTTP surfaces.
//!
//! Every fallible operation in the server returns [`ChatError`]; the HTTP
//! layer maps each kind to a status code and the dispatcher turns failures
//! into single-recipient `error` frames.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use tracing::error;

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("{0}")]
    Unauthenticated(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Invariant(String),

    #[error("{0}")]
    Validation(String),

    #[error("backend failure: {0}")]
    Backend(String),
}

impl ChatError {
    pub fn status(&self) -> StatusCode {
        match self {
            ChatError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            ChatError::Forbidden(_) => StatusCode::FORBIDDEN,
            ChatError::NotFound(_) => StatusCode::NOT_FOUND,
            ChatError::Conflict(_) => StatusCode::CONFLICT,
            ChatError::Invariant(_) | ChatError::Validation(_) => StatusCode::BAD_REQUEST,
            ChatError::Backend(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to echo to a client. Backend details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            ChatError::Backend(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<sqlx::Error> for ChatError {
    fn from(err: sqlx::Error) -> Self {
        ChatError::Backend(format!("database: {err}"))
    }
}

impl From<redis::RedisError> for ChatError {
    fn from(err: redis::RedisError) -> Self {
        ChatError::Backend(format!("queue: {err}"))
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(err: serde_json::Error) -> Self {
        ChatError::Backend(format!("serialization: {err}"))
    }
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        if let ChatError::Backend(detail) = &self {
            error!(%detail, "request failed");
        }
        let body = Json(json!({ "success": false, "error": self.public_message() }));
        (self.status(), body).into_response()
    }
}

pub type ChatResult<T> = Result<T, ChatError>;
