//! Transport-level error taxonomy for plugin communication.
//!
//! These errors cover the path between the gateway and a plugin process:
//! connection failures, non-2xx responses with structured bodies, and
//! malformed payloads. API-surface errors (not-found, bad-request, ...) live
//! in the gateway crate; they are a different axis.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structured error extracted from a plugin response body.
///
/// Plugins report failures as `{code, message, details?}` objects, either at
/// the top level or wrapped in a `detail` envelope. [`WireError`] is the
/// flattened form the rest of the system passes around and stores inside
/// task results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl WireError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    /// Fallback error for a non-2xx response with no parseable body.
    pub fn from_status(status: u16) -> Self {
        Self::new(format!("HTTP_{status}"), format!("HTTP {status}"))
    }
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Errors raised by [`PluginClient`](crate::client::PluginClient) operations.
#[derive(Debug, Error)]
pub enum PluginError {
    /// The connection could not be established at all.
    #[error("service unreachable: {service}: {message}")]
    Unreachable { service: String, message: String },

    /// Transport failed after connecting (timeout, reset, bad body, ...).
    #[error("request to {service} failed: {message}")]
    Request { service: String, message: String },

    /// The service answered with a non-2xx status; the body was parsed into
    /// a structured error where possible.
    #[error("{service} returned HTTP {status}: {error}")]
    Status {
        service: String,
        status: u16,
        error: WireError,
    },

    /// A 2xx response whose body did not match the expected shape.
    #[error("unexpected response from {service}: {message}")]
    Decode { service: String, message: String },
}

impl PluginError {
    /// Flatten into the wire representation stored in task results.
    pub fn to_wire(&self) -> WireError {
        match self {
            PluginError::Unreachable { message, .. } => WireError::new("UNREACHABLE", message),
            PluginError::Request { message, .. } => WireError::new("REQUEST_ERROR", message),
            PluginError::Status { error, .. } => error.clone(),
            PluginError::Decode { message, .. } => WireError::new("DECODE_ERROR", message),
        }
    }

    pub fn is_unreachable(&self) -> bool {
        matches!(self, PluginError::Unreachable { .. })
    }
}
