//! # Error Handling
//!
//! Every failure the voice session can run into is expressed as a
//! [`SessionError`]. The variants are grouped by how the engine reacts to them:
//!
//! ## Error Categories:
//! - **Fatal** (`AudioDevice`, `ConnectionLost`, `Config`): reported to the caller
//!   as a single `SessionEvent::Error`, after which the session is torn down.
//!   Calling `connect` again is the only retry.
//! - **Recoverable** (`Transport`, `Protocol`, `Decode`): handled inside the
//!   session (reconnect, acknowledge and ignore, skip one frame) and only logged.
//!
//! ## Rust Concepts:
//! - **From trait**: lets `?` turn library errors (tungstenite, serde_json, base64,
//!   config) into a `SessionError` without manual mapping at every call site
//! - **Clone + PartialEq**: errors travel inside events, so tests can compare them

use std::fmt;

/// Failures raised by the voice session engine.
///
/// ## Usage Example:
/// ```rust
/// use onboard_voice::SessionError;
///
/// let err = SessionError::ConnectionLost { attempts: 5 };
/// assert!(err.is_fatal());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum SessionError {
    /// Microphone or output graph could not be acquired, or the microphone went away
    AudioDevice(String),

    /// Network drop, abnormal close or failed connect attempt
    Transport(String),

    /// The reconnect budget was exhausted
    ConnectionLost { attempts: u32 },

    /// Unknown tool, malformed payload, stage regression
    Protocol(String),

    /// Corrupt audio payload
    Decode(String),

    /// Invalid or unreadable configuration
    Config(String),
}

impl SessionError {
    /// Whether this error ends the session.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SessionError::AudioDevice(_)
                | SessionError::ConnectionLost { .. }
                | SessionError::Config(_)
        )
    }

    /// Short machine-readable tag, used in logs and in the session summary.
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::AudioDevice(_) => "audio_device",
            SessionError::Transport(_) => "transport",
            SessionError::ConnectionLost { .. } => "connection_lost",
            SessionError::Protocol(_) => "protocol",
            SessionError::Decode(_) => "decode",
            SessionError::Config(_) => "config",
        }
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::AudioDevice(msg) => write!(f, "Audio device error: {}", msg),
            SessionError::Transport(msg) => write!(f, "Transport error: {}", msg),
            SessionError::ConnectionLost { attempts } => write!(
                f,
                "Connection lost after {} reconnect attempts. Please reconnect.",
                attempts
            ),
            SessionError::Protocol(msg) => write!(f, "Protocol anomaly: {}", msg),
            SessionError::Decode(msg) => write!(f, "Decode error: {}", msg),
            SessionError::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<tokio_tungstenite::tungstenite::Error> for SessionError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        SessionError::Transport(err.to_string())
    }
}

/// Malformed JSON from the relay is a protocol anomaly, never a transport failure.
impl From<serde_json::Error> for SessionError {
    fn from(err: serde_json::Error) -> Self {
        SessionError::Protocol(format!("JSON parsing error: {}", err))
    }
}

impl From<base64::DecodeError> for SessionError {
    fn from(err: base64::DecodeError) -> Self {
        SessionError::Decode(format!("invalid base64: {}", err))
    }
}

impl From<config::ConfigError> for SessionError {
    fn from(err: config::ConfigError) -> Self {
        SessionError::Config(err.to_string())
    }
}

/// Shorthand for `Result<T, SessionError>`.
pub type SessionResult<T> = Result<T, SessionError>;
