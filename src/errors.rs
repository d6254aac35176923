use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("VALIDATION: {0}")]
    Validation(String),
    #[error("UNAUTHENTICATED: {0}")]
    Unauthorized(String),
    #[error("CONNECTION_FAILED: {message}")]
    Connection { message: String, details: Option<String> },
    #[error("TIMEOUT: {0}")]
    Timeout(String),
    #[error("QUERY_FAILED: {0}")]
    Query(String),
    #[error("NOT_FOUND: {0}")]
    NotFound(String),
    #[error("CONFIG_INVALID: {0}")]
    Config(String),
    #[error("IO_FAILURE: {0}")]
    Io(String),
    #[error("INTERNAL: {0}")]
    Internal(String),
}

impl AppError {
    pub fn connection(message: impl Into<String>, details: impl std::fmt::Display) -> Self {
        Self::Connection {
            message: message.into(),
            details: Some(details.to_string()),
        }
    }

    /// Machine-readable kind returned to HTTP callers.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "missing_fields",
            Self::Unauthorized(_) => "user_unauthenticated",
            Self::Connection { .. } | Self::Timeout(_) => "failed_connection",
            Self::Query(_) => "query_failed",
            Self::NotFound(_) => "not_found",
            Self::Config(_) | Self::Io(_) | Self::Internal(_) => "server_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) | Self::Connection { .. } | Self::Timeout(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Query(_) => StatusCode::BAD_GATEWAY,
            Self::Config(_) | Self::Io(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn client_parts(&self) -> (String, Option<String>) {
        match self {
            Self::Validation(message)
            | Self::Unauthorized(message)
            | Self::Query(message)
            | Self::NotFound(message) => (message.clone(), None),
            Self::Connection { message, details } => (message.clone(), details.clone()),
            Self::Timeout(message) => ("Failed to connect to Snowflake.".to_string(), Some(message.clone())),
            Self::Config(_) | Self::Io(_) | Self::Internal(_) => {
                ("An internal error occurred.".to_string(), None)
            }
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let (message, details) = self.client_parts();
        let redactor = crate::redaction::Redactor::new(false);
        let body = ErrorBody {
            error: self.kind(),
            message,
            details: details.map(|raw| redactor.redact(&raw).content),
        };

        if status.is_server_error() {
            tracing::error!(error = %redactor.redact(&self.to_string()).content, status = %status, "request failed");
        } else {
            tracing::warn!(error_kind = body.error, status = %status, "request rejected");
        }

        (status, Json(body)).into_response()
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Query(value.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<serde_yaml::Error> for AppError {
    fn from(value: serde_yaml::Error) -> Self {
        Self::Config(value.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            Self::Timeout(value.to_string())
        } else if value.is_connect() {
            Self::connection("Failed to connect to Snowflake.", value)
        } else {
            Self::Io(value.to_string())
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(value: anyhow::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::AppError;
    use axum::http::StatusCode;

    #[test]
    fn connection_errors_map_to_failed_connection() {
        let error = AppError::connection("Failed to connect to Snowflake.", "incorrect username or password");
        assert_eq!(error.kind(), "failed_connection");
        assert_eq!(error.status_code(), StatusCode::BAD_REQUEST);

        let timeout = AppError::Timeout("connect exceeded 30s".to_string());
        assert_eq!(timeout.kind(), "failed_connection");
    }

    #[test]
    fn internal_errors_hide_their_message() {
        let error = AppError::Internal("mutex poisoned".to_string());
        let (message, details) = error.client_parts();
        assert!(!message.contains("mutex"));
        assert!(details.is_none());
        assert_eq!(error.kind(), "server_error");
    }
}
