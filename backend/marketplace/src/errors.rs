//! Application-wide error types and their HTTP mapping.

use axum::{
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::error;

use crate::quota::QuotaRejection;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed or missing input. Never retried server-side.
    #[error("Invalid request: {0}")]
    Validation(&'static str),

    /// A single field failed schema validation.
    #[error("Invalid field `{field}`: {message}")]
    InvalidField { field: &'static str, message: String },

    #[error("Unauthorized: {0}")]
    Unauthorized(&'static str),

    #[error("Forbidden: {0}")]
    Forbidden(&'static str),

    #[error("Not found: {0}")]
    NotFound(&'static str),

    /// Wrong state for the requested transition; the caller must re-fetch.
    #[error("Conflict: {0}")]
    Conflict(&'static str),

    #[error("Rate limited: {}", .0.reason)]
    RateLimited(Box<QuotaRejection>),

    /// The settlement provider rejected or failed the call. The message is the provider's.
    #[error("Upstream provider error: {0}")]
    Upstream(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, AppError>;

impl AppError {
    pub fn internal(err: impl std::fmt::Display) -> Self {
        Self::Internal(err.to_string())
    }

    pub fn invalid_field(field: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            message: message.into(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) | Self::InvalidField { .. } => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::Upstream(_) | Self::Http(_) => StatusCode::BAD_GATEWAY,
            Self::Database(_)
            | Self::Migrate(_)
            | Self::Json(_)
            | Self::Config(_)
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable reason code placed in the response envelope.
    pub fn reason(&self) -> &str {
        match self {
            Self::Validation(r)
            | Self::Unauthorized(r)
            | Self::Forbidden(r)
            | Self::NotFound(r)
            | Self::Conflict(r) => *r,
            Self::InvalidField { .. } => "invalid_request",
            Self::RateLimited(rejection) => rejection.reason,
            Self::Upstream(_) | Self::Http(_) => "provider_error",
            _ => "internal_error",
        }
    }

    /// JSON envelope for this error. Internal details never leave the process.
    pub fn body(&self) -> Value {
        match self {
            Self::InvalidField { field, message } => json!({
                "status": "error",
                "reason": self.reason(),
                "field": field,
                "message": message,
            }),
            Self::Upstream(message) => json!({
                "status": "error",
                "reason": self.reason(),
                "message": message,
            }),
            Self::Http(e) => json!({
                "status": "error",
                "reason": self.reason(),
                "message": e.to_string(),
            }),
            Self::RateLimited(rejection) => json!({
                "status": "error",
                "reason": rejection.reason,
                "retry_after": rejection.retry_after(),
            }),
            _ if self.status_code() == StatusCode::INTERNAL_SERVER_ERROR => json!({
                "status": "error",
                "reason": "internal_error",
                "message": "internal server error",
            }),
            _ => json!({
                "status": "error",
                "reason": self.reason(),
            }),
        }
    }

    /// Headers that accompany the error (quota windows on 429).
    pub fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Self::RateLimited(rejection) = self {
            rejection.snapshot.apply_headers(&mut headers);
        }
        headers
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!("Request failed: {self}");
        }
        (status, self.headers(), Json(self.body())).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_maps_to_status_codes() {
        assert_eq!(
            AppError::Validation("wrong_deliverable").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::Conflict("already_assigned").status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            AppError::Upstream("card_declined".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            AppError::internal("boom").status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn internal_detail_is_not_exposed() {
        let body = AppError::internal("db file locked at /var/secret").body();
        assert_eq!(body["reason"], "internal_error");
        assert!(!body.to_string().contains("/var/secret"));
    }

    #[test]
    fn upstream_message_is_preserved() {
        let body = AppError::Upstream("No such destination: acct_1".into()).body();
        assert_eq!(body["reason"], "provider_error");
        assert_eq!(body["message"], "No such destination: acct_1");
    }
}
