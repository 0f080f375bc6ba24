//! Centralized error types for the Zonecast core library.
//!
//! This module provides a unified error handling system that:
//! - Defines structured error types using `thiserror`
//! - Gives every error a machine-readable code for clients
//! - Implements `IntoResponse` for JSON error responses on the API surface

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use crate::persistence::StoreError;
use crate::playback::encoder::EncoderError;
use crate::types::PlaybackMode;
use crate::zones::codec::CodecError;
use crate::zones::topics::TopicError;
use crate::zones::traits::TransportError;

/// Trait for error types that provide machine-readable error codes.
pub trait ErrorCode {
    /// Returns a machine-readable error code.
    fn code(&self) -> &'static str;
}

impl ErrorCode for CodecError {
    fn code(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "malformed_frame",
            Self::ZoneOutOfRange(_) => "zone_out_of_range",
            Self::InvalidVector(_) => "invalid_bulk_vector",
            Self::Io(_) => "serial_io_error",
        }
    }
}

impl ErrorCode for TopicError {
    fn code(&self) -> &'static str {
        match self {
            Self::UnknownTopic(_) => "unknown_topic",
            Self::InvalidZone(_) => "invalid_zone",
            Self::InvalidPayload(_) => "invalid_payload",
        }
    }
}

impl ErrorCode for EncoderError {
    fn code(&self) -> &'static str {
        match self {
            Self::Spawn(_) => "encoder_spawn_failed",
            Self::InvalidTransition { .. } => "encoder_busy",
            Self::InputClosed => "encoder_input_closed",
            Self::NotRunning => "encoder_not_running",
        }
    }
}

/// Application-wide error type.
///
/// Boundary operations (start, pause, resume, status requests) return these
/// synchronously. Failures that happen after the boundary are only reported as
/// events on the realtime channel.
#[derive(Debug, Error, Serialize, PartialEq, Eq)]
#[serde(tag = "type", content = "details")]
pub enum ZonecastError {
    /// Malformed topic, payload or request; rejected with no state change.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// No zone has streaming enabled, so nothing may broadcast.
    #[error("Streaming is disabled on every zone")]
    StreamDisabled,

    /// The encoder is occupied by a different source.
    #[error("Playback busy: {active_mode} is active, {requested_mode} was requested")]
    ModeBusy {
        #[serde(rename = "activeMode")]
        active_mode: PlaybackMode,
        #[serde(rename = "requestedMode")]
        requested_mode: PlaybackMode,
    },

    /// Operation not supported for the current source (pause on mic, ...).
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// A zone request was not answered in time.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Serial, broker or encoder I/O failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Server configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ZonecastError {
    /// Returns a machine-readable error code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::StreamDisabled => "stream_disabled",
            Self::ModeBusy { .. } => "mode_busy",
            Self::UnsupportedOperation(_) => "unsupported_operation",
            Self::Timeout(_) => "timeout",
            Self::Transport(_) => "transport_error",
            Self::Configuration(_) => "configuration_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Maps the error to an appropriate HTTP status code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::StreamDisabled | Self::ModeBusy { .. } => StatusCode::CONFLICT,
            Self::UnsupportedOperation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Transport(_) => StatusCode::BAD_GATEWAY,
            Self::Configuration(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Result Type Aliases
// ─────────────────────────────────────────────────────────────────────────────

/// Convenient Result alias for application-wide operations.
pub type ZonecastResult<T> = Result<T, ZonecastError>;

/// JSON response body for error responses.
#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
    status: u16,
}

impl IntoResponse for ZonecastError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: self.code(),
            message: self.to_string(),
            status: status.as_u16(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<CodecError> for ZonecastError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Io(_) => Self::Transport(err.to_string()),
            _ => Self::Validation(err.to_string()),
        }
    }
}

impl From<TopicError> for ZonecastError {
    fn from(err: TopicError) -> Self {
        Self::Validation(err.to_string())
    }
}

impl From<EncoderError> for ZonecastError {
    fn from(err: EncoderError) -> Self {
        match err {
            EncoderError::InvalidTransition { .. } => Self::Internal(err.to_string()),
            _ => Self::Transport(err.to_string()),
        }
    }
}

impl From<StoreError> for ZonecastError {
    fn from(err: StoreError) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<TransportError> for ZonecastError {
    fn from(err: TransportError) -> Self {
        Self::Transport(err.to_string())
    }
}
