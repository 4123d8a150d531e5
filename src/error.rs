//! # Error Handling
//!
//! This module defines the error types used across the bridge and how the
//! HTTP-facing ones are converted to responses.
//!
//! ## Two Error Families:
//!
//! ### AppError (HTTP surface)
//! - **Purpose**: Returned by actix handlers and rendered as JSON error bodies
//! - **ResponseError trait**: Maps each variant to a status code
//!
//! ### StreamError (media path)
//! - **Purpose**: Failures while moving audio for one call
//! - **Scope**: Each variant says how far the failure reaches:
//!   a dropped frame, a failed conversion, a lost segment or a dead channel
//!
//! ## Key Rust Concepts:
//! - **Display trait**: Hand-written so messages stay stable in logs
//! - **From trait**: Lets `?` convert library errors into our own types
//! - **std::error::Error**: Lets our errors flow into `anyhow` at the edges

use actix_web::{HttpResponse, ResponseError};  // Web framework error handling
use serde_json::json;                          // For creating JSON error responses
use std::fmt;                                  // For implementing Display trait

/// Errors returned by HTTP handlers.
///
/// ## Error Categories:
/// - **Internal**: Server-side problems (500 errors)
/// - **BadRequest**: Client sent invalid data (400 errors)
/// - **NotFound**: Requested resource doesn't exist (404 errors)
/// - **ConfigError**: Configuration problems (500 errors)
/// - **ValidationError**: Data validation failed (400 errors)
///
/// ## Usage Example:
/// ```rust,ignore
/// return Err(AppError::NotFound(format!("Audio {} not found", id)));
/// ```
#[derive(Debug)]
pub enum AppError {
    /// Internal server errors
    Internal(String),

    /// Client sent invalid or malformed data
    BadRequest(String),

    /// Requested resource was not found (or has been evicted)
    NotFound(String),

    /// Configuration file or environment variable problems
    ConfigError(String),

    /// User input failed validation rules
    ValidationError(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

/// Converts errors into HTTP responses.
///
/// ## HTTP Status Code Mapping:
/// - Internal/ConfigError → 500 (Internal Server Error)
/// - BadRequest/ValidationError → 400 (Bad Request)
/// - NotFound → 404 (Not Found)
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "not_found",
///     "message": "Audio 4f1c... not found",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = match self {
            AppError::Internal(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,  // 500
                "internal_error",
                msg.clone(),
            ),
            AppError::BadRequest(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,  // 400
                "bad_request",
                msg.clone(),
            ),
            AppError::NotFound(msg) => (
                actix_web::http::StatusCode::NOT_FOUND,  // 404
                "not_found",
                msg.clone(),
            ),
            AppError::ConfigError(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,  // 500
                "config_error",
                msg.clone(),
            ),
            AppError::ValidationError(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,  // 400
                "validation_error",
                msg.clone(),
            ),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,           // Machine-readable error type
                "message": message,           // Human-readable error message
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

/// Config validation and update failures surface through anyhow.
/// They are the client's fault when they come from a PUT body, so the
/// config handler maps them to `ValidationError` explicitly; everything
/// else lands here as an internal error.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// JSON parsing errors are almost always the client's fault → 400.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

/// Shorthand for `Result<T, AppError>` used by handlers.
pub type AppResult<T> = Result<T, AppError>;

/// Failures on the real-time media path of a single call.
///
/// ## Blast Radius:
/// - **Protocol**: a malformed or unexpected frame. Logged, the frame is
///   dropped and the session carries on.
/// - **Transcode**: an audio conversion failed. Only that one conversion is
///   lost (for example a single synthesized reply).
/// - **SegmentFlush**: a collaborator failed on a sealed segment. Logged and
///   the segment is discarded.
/// - **Channel**: the peer is gone. Fatal to the session; pending work is
///   cancelled and nothing is retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    Protocol(String),
    Transcode(String),
    SegmentFlush(String),
    Channel(String),
}

impl StreamError {
    /// Whether the error ends the session it occurred in.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StreamError::Channel(_))
    }
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            StreamError::Transcode(msg) => write!(f, "Transcode error: {}", msg),
            StreamError::SegmentFlush(msg) => write!(f, "Segment flush error: {}", msg),
            StreamError::Channel(msg) => write!(f, "Channel error: {}", msg),
        }
    }
}

impl std::error::Error for StreamError {}

/// A frame that isn't valid JSON (or doesn't fit the frame schema) is a
/// protocol error, never fatal.
impl From<serde_json::Error> for StreamError {
    fn from(err: serde_json::Error) -> Self {
        StreamError::Protocol(format!("Malformed frame: {}", err))
    }
}

impl From<base64::DecodeError> for StreamError {
    fn from(err: base64::DecodeError) -> Self {
        StreamError::Protocol(format!("Invalid base64 payload: {}", err))
    }
}
