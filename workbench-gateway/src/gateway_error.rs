//! # API Error Types
//!
//! Typed errors for the gateway's HTTP surface, with automatic mapping to
//! HTTP responses. Input errors surface as 4xx; internal errors as 5xx.
//! Transport errors from plugin calls are a different axis: they are
//! captured inside task results by the remote task driver and never escape
//! as exceptions (see `workbench_plugin_sdk::driver`).
//!
//! Responses render as `{"error": {"message", "type", "code"}}` with a
//! stable machine-readable `type` per variant. Messages are sanitized
//! upstream: handlers truncate parse errors and never include stack traces
//! or internal paths.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::capabilities::ConversionError;

/// Errors surfaced by the gateway's API handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    /// A referenced entity does not exist
    #[error("{resource} not found: {id}")]
    NotFound { resource: &'static str, id: String },

    /// Malformed or unacceptable request
    #[error("{message}")]
    BadRequest { message: String },

    /// Upload or payload in a format the gateway cannot handle
    #[error("Invalid game format: {format}{}", .detail.as_deref().map(|d| format!(" ({d})")).unwrap_or_default())]
    InvalidFormat {
        format: String,
        detail: Option<String>,
    },

    /// A conversion path exists but applying it failed
    #[error("Cannot convert from {from} to {to}")]
    ConversionFailed { from: String, to: String },

    /// No path through the conversion graph
    #[error("No conversion path from {from} to {to}")]
    NoConversionPath { from: String, to: String },

    /// The requested analysis is not offered by any registered plugin
    #[error("Unknown plugin: {plugin}. Available: {}", .available.join(", "))]
    PluginUnavailable {
        plugin: String,
        available: Vec<String>,
    },

    /// The analysis exists but cannot run on this game's format
    #[error("Plugin '{plugin}' cannot run on this game (format: {format})")]
    IncompatiblePlugin { plugin: String, format: String },

    /// Unexpected failure while parsing an uploaded game
    #[error("Failed to parse game file")]
    ParseFailed,

    /// Catch-all for internal failures
    #[error("Internal server error: {message}")]
    Internal { message: String },
}

impl ApiError {
    pub fn not_found(resource: &'static str, id: &str) -> Self {
        ApiError::NotFound {
            resource,
            id: id.to_string(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        ApiError::BadRequest {
            message: message.into(),
        }
    }

    fn status_and_type(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
            ApiError::BadRequest { .. } => (StatusCode::BAD_REQUEST, "invalid_request"),
            ApiError::InvalidFormat { .. } => (StatusCode::BAD_REQUEST, "invalid_format"),
            ApiError::ConversionFailed { .. } => (StatusCode::BAD_REQUEST, "conversion_failed"),
            ApiError::NoConversionPath { .. } => (StatusCode::BAD_REQUEST, "no_conversion_path"),
            ApiError::PluginUnavailable { .. } => (StatusCode::BAD_REQUEST, "plugin_unavailable"),
            ApiError::IncompatiblePlugin { .. } => {
                (StatusCode::BAD_REQUEST, "incompatible_plugin")
            }
            ApiError::ParseFailed => (StatusCode::INTERNAL_SERVER_ERROR, "parse_failed"),
            ApiError::Internal { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type) = self.status_and_type();
        let body = Json(json!({
            "error": {
                "message": self.to_string(),
                "type": error_type,
                "code": status.as_u16()
            }
        }));
        (status, body).into_response()
    }
}

impl From<ConversionError> for ApiError {
    fn from(err: ConversionError) -> Self {
        match err {
            ConversionError::NoPath { from, to } => ApiError::NoConversionPath { from, to },
            ConversionError::Blocked { from, to, .. }
            | ConversionError::Remote { from, to, .. } => {
                ApiError::ConversionFailed { from, to }
            }
        }
    }
}

/// Truncate a message so error responses stay terse and never leak long
/// internal dumps.
pub fn truncate_message(message: &str, max_length: usize) -> String {
    if message.len() <= max_length {
        return message.to_string();
    }
    let mut end = max_length;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &message[..end])
}
