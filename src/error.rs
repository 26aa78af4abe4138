use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("pairing already in progress for tenant {0}")]
    LockContention(String),
    #[error("pairing did not complete within {}s", .0.as_secs())]
    PairingTimeout(Duration),
    #[error("chat client rejected the pairing: {0}")]
    AuthenticationFailure(String),
    #[error("pairing was aborted before the session became ready: {0}")]
    PairingAborted(String),
    #[error("no ready session for tenant {0}")]
    NotConnected(String),
    #[error("send to {to} failed: {reason}")]
    SendFailure { to: String, reason: String },
    #[error("answer generation failed: {0}")]
    AnswerGeneration(String),
    #[error("chat client error: {0}")]
    Client(String),
    #[error("record store error: {0}")]
    Store(#[from] sqlx::Error),
    #[error("contact {0} not found")]
    ContactNotFound(String),
    #[error("contact id {0} belongs to another tenant")]
    ContactConflict(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("missing or invalid bearer token")]
    Unauthorized,
}

impl AppError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::LockContention(_) => "lock_contention",
            Self::PairingTimeout(_) => "pairing_timeout",
            Self::AuthenticationFailure(_) => "authentication_failure",
            Self::PairingAborted(_) => "pairing_aborted",
            Self::NotConnected(_) => "not_connected",
            Self::SendFailure { .. } => "send_failure",
            Self::AnswerGeneration(_) => "answer_generation_failure",
            Self::Client(_) => "chat_client_error",
            Self::Store(_) => "store_error",
            Self::ContactNotFound(_) => "contact_not_found",
            Self::ContactConflict(_) => "contact_conflict",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Unauthorized => "unauthorized",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::LockContention(_)
            | Self::NotConnected(_)
            | Self::PairingAborted(_)
            | Self::ContactConflict(_) => StatusCode::CONFLICT,
            Self::PairingTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::AuthenticationFailure(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::SendFailure { .. } | Self::AnswerGeneration(_) | Self::Client(_) => {
                StatusCode::BAD_GATEWAY
            }
            Self::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ContactNotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (
            self.status_code(),
            Json(json!({
                "error": self.code(),
                "message": self.to_string(),
            })),
        )
            .into_response()
    }
}
