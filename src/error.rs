use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use crate::rate_limit_config::RuleError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Rule(#[from] RuleError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Failure of a single strategy evaluation.
#[derive(Debug, Error)]
pub enum LimitError {
    /// The request could not be keyed; never reaches the store.
    #[error("invalid rate limit key: {0}")]
    Validation(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub code: u16,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str, code: u16) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
            code,
        }
    }

    pub fn from_error(err: &Error) -> Self {
        match err {
            Error::InvalidRequest(msg) => Self::new("bad_request", msg, 400),
            Error::Rule(RuleError::NotFound(endpoint)) => {
                Self::new("not_found", &format!("no rule for endpoint {}", endpoint), 404)
            }
            Error::Rule(e) => Self::new("validation_error", &e.to_string(), 422),
            Error::Store(e) => Self::new("service_unavailable", &e.to_string(), 503),
            Error::Config(msg) => Self::new("configuration_error", msg, 500),
            Error::Io(e) => Self::new("internal_error", &e.to_string(), 500),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let body = ErrorResponse::from_error(&self);
        let status = StatusCode::from_u16(body.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }

        (status, Json(body)).into_response()
    }
}
