//! # Error Handling
//!
//! Two layers of errors live here:
//! - **VoiceError**: everything the voice pipeline can report (remote session
//!   handshake, lifecycle conflicts, transport failures)
//! - **AppError**: what the HTTP control plane returns, with a JSON body and a
//!   status code chosen per variant
//!
//! ## Error Taxonomy (pipeline):
//! - **Connection failures**: the remote session never reached `Configured`.
//!   Surfaced to whoever asked to start a conversation; nothing is retried.
//! - **Lifecycle conflicts**: joining twice, starting twice, acting on a guild
//!   that has no session.
//! - **Transient protocol problems**: error events and undecodable fragments.
//!   These are logged by the listen loop and never reach a caller.

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use thiserror::Error;

use crate::voice::GuildId;

/// Errors produced by the voice pipeline.
///
/// ## Usage Example:
/// ```rust
/// return Err(VoiceError::NotJoined(guild_id));
/// ```
#[derive(Debug, Error)]
pub enum VoiceError {
    /// The duplex connection could not be opened or died during the handshake
    #[error("Connection to realtime service failed: {0}")]
    ConnectionFailed(String),

    /// The first inbound message was not `session.created`
    #[error("Realtime handshake rejected: expected session.created, got {0}")]
    HandshakeRejected(String),

    /// The answer to `session.update` was not `session.updated`
    #[error("Realtime session configuration rejected: expected session.updated, got {0}")]
    ConfigurationRejected(String),

    /// No credential configured for this guild
    #[error("No API credential configured for guild {0}")]
    MissingCredential(GuildId),

    /// An operation was attempted in the wrong protocol state
    #[error("Invalid protocol state: {0}")]
    InvalidState(String),

    /// A session already exists for this guild
    #[error("Guild {0} already has a voice session")]
    AlreadyJoined(GuildId),

    /// A conversation is already running for this guild
    #[error("Guild {0} already has an active conversation")]
    AlreadyActive(GuildId),

    /// No session exists for this guild
    #[error("Guild {0} has no voice session")]
    NotJoined(GuildId),

    /// The session exists but no conversation is running
    #[error("Guild {0} has no active conversation")]
    NotActive(GuildId),

    /// Too many guilds are joined at once
    #[error("Maximum concurrent sessions ({0}) reached")]
    SessionLimit(usize),

    /// The voice transport refused an operation
    #[error("Voice transport error: {0}")]
    Transport(String),

    /// The connection failed while streaming
    #[error("Realtime protocol error: {0}")]
    Protocol(String),

    /// A base64 payload could not be decoded
    #[error("Audio payload decode failed: {0}")]
    Decode(#[from] base64::DecodeError),

    /// A message could not be encoded or parsed
    #[error("Realtime message serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A bounded wait ran out
    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),
}

impl From<tokio_tungstenite::tungstenite::Error> for VoiceError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        VoiceError::Protocol(err.to_string())
    }
}

/// Errors returned by the HTTP control plane.
///
/// ## Error Categories:
/// - **Internal**: Server-side problems (500 errors)
/// - **BadRequest**: Client sent invalid data (400 errors)
/// - **NotFound**: Requested guild has no session (404 errors)
/// - **Conflict**: Lifecycle step not allowed right now (409 errors)
/// - **Upstream**: Realtime service could not be reached or configured (502 errors)
/// - **ConfigError**: Configuration problems (500 errors)
/// - **ValidationError**: Data validation failed (400 errors)
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl AppError {
    fn parts(&self) -> (actix_web::http::StatusCode, &'static str, &str) {
        use actix_web::http::StatusCode;

        match self {
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg),
            AppError::Upstream(msg) => (StatusCode::BAD_GATEWAY, "upstream_error", msg),
            AppError::ConfigError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error", msg),
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg),
        }
    }
}

/// Converts errors into JSON HTTP responses.
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "conflict",
///     "message": "Guild 42 already has an active conversation",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        self.parts().0
    }

    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = self.parts();

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

/// Map pipeline failures onto HTTP semantics.
///
/// Lifecycle conflicts become 409, unknown guilds 404, and anything that went
/// wrong talking to the realtime service 502.
impl From<VoiceError> for AppError {
    fn from(err: VoiceError) -> Self {
        let message = err.to_string();
        match err {
            VoiceError::NotJoined(_) => AppError::NotFound(message),
            VoiceError::AlreadyJoined(_)
            | VoiceError::AlreadyActive(_)
            | VoiceError::NotActive(_)
            | VoiceError::SessionLimit(_)
            | VoiceError::InvalidState(_) => AppError::Conflict(message),
            VoiceError::ConnectionFailed(_)
            | VoiceError::HandshakeRejected(_)
            | VoiceError::ConfigurationRejected(_)
            | VoiceError::MissingCredential(_)
            | VoiceError::Protocol(_)
            | VoiceError::Timeout(_) => AppError::Upstream(message),
            VoiceError::Transport(_)
            | VoiceError::Decode(_)
            | VoiceError::Serialization(_) => AppError::Internal(message),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// JSON parsing errors are almost always the client's fault.
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
