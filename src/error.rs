//! # Error Handling
//!
//! The failure taxonomy for the whole pipeline, plus the conversion to HTTP
//! responses for the relay's REST surface.
//!
//! ## Recovery policy:
//! - **Device**: microphone unavailable or rejected; reported to the caller,
//!   capture state stays stopped.
//! - **Transport**: a connection failed or dropped; the client schedules a
//!   reconnect; the relay tears down the affected Pairing.
//! - **Parse**: a malformed inbound frame: logged and dropped, the
//!   connection stays open.
//! - **UpstreamUnavailable**: the outbound connect failed; reported to the
//!   inbound side exactly once, never retried automatically.
//!
//! None of these terminate the process. The only fatal path is failing to
//! bind the relay's listen port at startup, which is handled in `main`.

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Application-level error categories.
#[derive(Debug)]
pub enum RelayError {
    /// Microphone device unavailable, denied, or rejected the stream config
    Device(String),

    /// A transport connection failed to open or dropped mid-session
    Transport(String),

    /// An inbound frame could not be parsed as a control message
    Parse(String),

    /// The outbound upstream connection could not be established
    UpstreamUnavailable(String),

    /// Configuration file or environment variable problems
    Config(String),

    /// Anything else that should surface as a server fault
    Internal(String),
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayError::Device(msg) => write!(f, "Device error: {}", msg),
            RelayError::Transport(msg) => write!(f, "Transport error: {}", msg),
            RelayError::Parse(msg) => write!(f, "Parse error: {}", msg),
            RelayError::UpstreamUnavailable(msg) => write!(f, "Upstream unavailable: {}", msg),
            RelayError::Config(msg) => write!(f, "Configuration error: {}", msg),
            RelayError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for RelayError {}

/// Conversion to HTTP responses for the REST endpoints.
///
/// All errors return JSON with a consistent structure:
/// ```json
/// {
///   "error": {
///     "type": "upstream_unavailable",
///     "message": "connection refused",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for RelayError {
    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = match self {
            RelayError::Device(msg) => (
                actix_web::http::StatusCode::SERVICE_UNAVAILABLE,
                "device_error",
                msg.clone(),
            ),
            RelayError::Transport(msg) => (
                actix_web::http::StatusCode::BAD_GATEWAY,
                "transport_error",
                msg.clone(),
            ),
            RelayError::Parse(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "parse_error",
                msg.clone(),
            ),
            RelayError::UpstreamUnavailable(msg) => (
                actix_web::http::StatusCode::BAD_GATEWAY,
                "upstream_unavailable",
                msg.clone(),
            ),
            RelayError::Config(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "config_error",
                msg.clone(),
            ),
            RelayError::Internal(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                msg.clone(),
            ),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for RelayError {
    fn from(err: anyhow::Error) -> Self {
        RelayError::Internal(err.to_string())
    }
}

/// JSON parsing failures are frame-level problems, not server faults.
impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::Parse(err.to_string())
    }
}

impl From<config::ConfigError> for RelayError {
    fn from(err: config::ConfigError) -> Self {
        RelayError::Config(err.to_string())
    }
}

/// A malformed endpoint address is a configuration problem: URLs are only
/// ever built from configured values plus the session token.
impl From<url::ParseError> for RelayError {
    fn from(err: url::ParseError) -> Self {
        RelayError::Config(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for RelayError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        RelayError::Transport(err.to_string())
    }
}

pub type RelayResult<T> = Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_category() {
        let err = RelayError::UpstreamUnavailable("connection refused".to_string());
        assert_eq!(
            err.to_string(),
            "Upstream unavailable: connection refused"
        );
    }

    #[test]
    fn test_transport_from_tungstenite() {
        let err: RelayError =
            tokio_tungstenite::tungstenite::Error::ConnectionClosed.into();
        assert!(matches!(err, RelayError::Transport(_)));
    }

    #[test]
    fn test_parse_from_serde() {
        let parse_failure = serde_json::from_str::<serde_json::Value>("{oops").unwrap_err();
        let err: RelayError = parse_failure.into();
        assert!(matches!(err, RelayError::Parse(_)));
    }
}
