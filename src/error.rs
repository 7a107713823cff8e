//! Error types for the docgate service.
//!
//! One enum, [`ServiceError`], covers every failure the front-end can see.
//! Two phases matter for how an error is treated:
//!
//! * **Startup**: the backend could not be launched or never became ready.
//!   These errors are fatal: initialisation aborts and nothing is served.
//!   See [`ServiceError::is_fatal`].
//!
//! * **Invocation**: a single request failed (bad payload, backend error,
//!   timeout). These never escape the broker as faults; they are converted
//!   into a failure [`crate::broker::InferenceResult`] tagged with an
//!   [`ErrorKind`] so the facade can map them onto a transport response.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// All errors produced by the docgate library.
#[derive(Debug, Error)]
pub enum ServiceError {
    // ── Startup errors ────────────────────────────────────────────────────
    /// The backend never answered its liveness probe within the polling ceiling.
    #[error("Backend did not become ready after {attempts} attempts ({interval_ms}ms apart)")]
    StartupTimeout { attempts: u32, interval_ms: u64 },

    /// The backend process could not be spawned at all.
    #[error("Failed to spawn backend '{program}': {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The backend process exited before it became ready.
    #[error("Backend process exited during startup with status: {status}")]
    BackendExited { status: String },

    // ── Request errors ────────────────────────────────────────────────────
    /// The inbound request did not carry `application/json`.
    #[error("Unsupported media type '{content_type}', expected application/json")]
    UnsupportedMediaType { content_type: String },

    /// A required request field was absent or empty.
    #[error("Missing {field} parameter")]
    MissingField { field: &'static str },

    /// The body was not a JSON object, or a field held an unknown value.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The document payload was not valid base64.
    #[error("Invalid base64 payload: {0}")]
    DecodeError(String),

    // ── Backend errors ────────────────────────────────────────────────────
    /// The backend answered with a non-success status, or could not be reached.
    #[error("{}", backend_failure_message(*status, message))]
    BackendCallFailure {
        status: Option<u16>,
        message: String,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error (staging I/O, task panics, ...).
    #[error("Internal error: {0}")]
    Internal(String),
}

fn backend_failure_message(status: Option<u16>, message: &str) -> String {
    match status {
        Some(code) => format!("Backend returned HTTP {code}: {message}"),
        None => format!("Backend call failed: {message}"),
    }
}

impl ServiceError {
    /// Shorthand for a transport-level backend failure (no HTTP status).
    pub fn backend(message: impl Into<String>) -> Self {
        ServiceError::BackendCallFailure {
            status: None,
            message: message.into(),
        }
    }

    /// The wire tag for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServiceError::StartupTimeout { .. } => ErrorKind::StartupTimeout,
            ServiceError::SpawnFailed { .. } | ServiceError::BackendExited { .. } => {
                ErrorKind::StartupFailure
            }
            ServiceError::UnsupportedMediaType { .. } => ErrorKind::UnsupportedMediaType,
            ServiceError::MissingField { .. } => ErrorKind::MissingField,
            ServiceError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            ServiceError::DecodeError(_) => ErrorKind::DecodeError,
            ServiceError::BackendCallFailure { .. } => ErrorKind::BackendCallFailure,
            ServiceError::InvalidConfig(_) | ServiceError::Internal(_) => ErrorKind::InternalError,
        }
    }

    /// Whether this error must abort service initialisation.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ServiceError::StartupTimeout { .. }
                | ServiceError::SpawnFailed { .. }
                | ServiceError::BackendExited { .. }
                | ServiceError::InvalidConfig(_)
        )
    }
}

/// Serialisable error category carried by a failed invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    StartupTimeout,
    StartupFailure,
    UnsupportedMediaType,
    MissingField,
    InvalidRequest,
    DecodeError,
    BackendCallFailure,
    InternalError,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::StartupTimeout => "startup_timeout",
            ErrorKind::StartupFailure => "startup_failure",
            ErrorKind::UnsupportedMediaType => "unsupported_media_type",
            ErrorKind::MissingField => "missing_field",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::DecodeError => "decode_error",
            ErrorKind::BackendCallFailure => "backend_call_failure",
            ErrorKind::InternalError => "internal_error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startup_timeout_display() {
        let e = ServiceError::StartupTimeout {
            attempts: 30,
            interval_ms: 1000,
        };
        let msg = e.to_string();
        assert!(msg.contains("30 attempts"), "got: {msg}");
        assert!(msg.contains("1000ms"), "got: {msg}");
        assert!(e.is_fatal());
        assert_eq!(e.kind(), ErrorKind::StartupTimeout);
    }

    #[test]
    fn backend_failure_display_with_status() {
        let e = ServiceError::BackendCallFailure {
            status: Some(503),
            message: "overloaded".into(),
        };
        assert_eq!(e.to_string(), "Backend returned HTTP 503: overloaded");
        assert!(!e.is_fatal());
    }

    #[test]
    fn backend_failure_display_without_status() {
        let e = ServiceError::backend("connection refused");
        assert_eq!(e.to_string(), "Backend call failed: connection refused");
        assert_eq!(e.kind(), ErrorKind::BackendCallFailure);
    }

    #[test]
    fn missing_field_display() {
        let e = ServiceError::MissingField { field: "pdf_base64" };
        assert_eq!(e.to_string(), "Missing pdf_base64 parameter");
        assert_eq!(e.kind(), ErrorKind::MissingField);
    }

    #[test]
    fn kind_serialises_snake_case() {
        let json = serde_json::to_string(&ErrorKind::UnsupportedMediaType).unwrap();
        assert_eq!(json, "\"unsupported_media_type\"");
        assert_eq!(ErrorKind::InternalError.to_string(), "internal_error");
    }

    #[test]
    fn request_errors_are_not_fatal() {
        assert!(!ServiceError::DecodeError("bad".into()).is_fatal());
        assert!(!ServiceError::Internal("oops".into()).is_fatal());
        assert!(ServiceError::InvalidConfig("bad".into()).is_fatal());
    }
}
