//! # Error Handling
//!
//! Two layers of errors live here:
//!
//! - **Domain errors** (`thiserror`): raised by the turn-taking engine and the
//!   session registry. Per-chunk and per-transition errors are recovered
//!   locally by the session; only registry errors reach API callers.
//! - **AppError**: the HTTP boundary type. Implements `ResponseError` so
//!   handlers can return `AppResult<HttpResponse>` and use `?`.
//!
//! ## JSON Response Format:
//! ```json
//! {
//!   "error": {
//!     "type": "not_found",
//!     "message": "Session 'abc' not found",
//!     "timestamp": "2025-01-01T12:00:00Z"
//!   }
//! }
//! ```

use crate::conversation::state_machine::{ConversationEvent, ConversationState};
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;
use thiserror::Error;

/// A chunk that cannot enter a session buffer.
///
/// The chunk is dropped; the session keeps running.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AudioFormatError {
    #[error("sample rate mismatch: expected {expected} Hz, got {actual} Hz")]
    SampleRateMismatch { expected: u32, actual: u32 },

    #[error("audio chunk contains no samples")]
    Empty,

    #[error("PCM16 payload length must be even, got {0} bytes")]
    OddByteLength(usize),

    #[error("unsupported audio format: {0}")]
    Unsupported(String),
}

/// A state machine event that is not legal in the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal transition: {event} while {state}")]
pub struct IllegalTransitionError {
    pub state: ConversationState,
    pub event: ConversationEvent,
}

/// Why a downstream turn (STT → LLM → TTS) did not produce agent speech.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DownstreamError {
    #[error("downstream deadline of {after_ms}ms exceeded")]
    Timeout { after_ms: u64 },

    #[error("downstream collaborator failed: {0}")]
    Failure(String),

    #[error("turn cancelled")]
    Cancelled,
}

/// Registry errors surfaced by the session management API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("session '{0}' not found")]
    NotFound(String),

    #[error("session '{0}' already exists")]
    Duplicate(String),

    #[error("maximum concurrent sessions ({0}) reached")]
    LimitReached(usize),
}

/// HTTP-facing error type.
///
/// ## Status Code Mapping:
/// - Internal/ConfigError → 500
/// - BadRequest/ValidationError → 400
/// - NotFound → 404
/// - Conflict → 409
/// - Unavailable → 503
#[derive(Debug)]
pub enum AppError {
    Internal(String),
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Unavailable(String),
    ConfigError(String),
    ValidationError(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::Conflict(msg) => write!(f, "Conflict: {}", msg),
            AppError::Unavailable(msg) => write!(f, "Unavailable: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        use actix_web::http::StatusCode;
        match self {
            AppError::Internal(_) | AppError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadRequest(_) | AppError::ValidationError(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let (error_type, message) = match self {
            AppError::Internal(msg) => ("internal_error", msg),
            AppError::BadRequest(msg) => ("bad_request", msg),
            AppError::NotFound(msg) => ("not_found", msg),
            AppError::Conflict(msg) => ("conflict", msg),
            AppError::Unavailable(msg) => ("unavailable", msg),
            AppError::ConfigError(msg) => ("config_error", msg),
            AppError::ValidationError(msg) => ("validation_error", msg),
        };

        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<SessionError> for AppError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::NotFound(_) => AppError::NotFound(err.to_string()),
            SessionError::Duplicate(_) => AppError::Conflict(err.to_string()),
            SessionError::LimitReached(_) => AppError::Unavailable(err.to_string()),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// JSON parsing errors are the client's fault, so they map to 400.
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

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::http::StatusCode;

    #[test]
    fn test_session_errors_map_to_http_status() {
        let not_found: AppError = SessionError::NotFound("a".into()).into();
        assert_eq!(not_found.status_code(), StatusCode::NOT_FOUND);

        let duplicate: AppError = SessionError::Duplicate("a".into()).into();
        assert_eq!(duplicate.status_code(), StatusCode::CONFLICT);

        let full: AppError = SessionError::LimitReached(4).into();
        assert_eq!(full.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_illegal_transition_message() {
        let err = IllegalTransitionError {
            state: ConversationState::Idle,
            event: ConversationEvent::AgentSpeechFinished,
        };
        assert_eq!(err.to_string(), "illegal transition: agent_speech_finished while idle");
    }
}
