//! Error types for the room client

use thiserror::Error;

/// Room client error type
#[derive(Debug, Error)]
pub enum Error {
    /// The signaling channel is not open
    #[error("Signaling channel is not connected")]
    NotConnected,

    /// The signaling channel closed while a request was in flight
    #[error("Signaling channel closed")]
    ChannelClosed,

    /// No response arrived within the request timeout
    #[error("Request '{method}' timed out")]
    Timeout {
        /// Signaling method of the request
        method: String,
    },

    /// The server answered a request with an error response
    #[error("Request '{method}' rejected ({code}): {reason}")]
    Rejected {
        /// Signaling method of the request
        method: String,
        /// Server error code
        code: i64,
        /// Server error reason
        reason: String,
    },

    /// Could not establish the signaling connection
    #[error("Connection error: {0}")]
    Connect(String),

    /// WebSocket transport error
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Frame did not follow the signaling protocol
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration validation failed
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Configuration file could not be parsed
    #[error("Config file error: {0}")]
    ConfigFile(#[from] toml::de::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Media engine failure
    #[error("Media engine error: {0}")]
    Engine(String),

    /// Capture device failure
    #[error("Capture error: {0}")]
    Capture(String),
}

/// Broad error categories, used when surfacing errors to observers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Channel-level failure (connect, disconnect, framing)
    ChannelError,
    /// A signaling request failed
    RequestError,
    /// Bad configuration
    ConfigError,
    /// Media engine or capture failure
    MediaError,
    /// Anything else
    InternalError,
}

impl Error {
    /// Get the error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::NotConnected
            | Error::ChannelClosed
            | Error::Connect(_)
            | Error::WebSocket(_)
            | Error::Protocol(_) => ErrorCode::ChannelError,
            Error::Timeout { .. } | Error::Rejected { .. } => ErrorCode::RequestError,
            Error::InvalidConfig(_) | Error::ConfigFile(_) => ErrorCode::ConfigError,
            Error::Engine(_) | Error::Capture(_) => ErrorCode::MediaError,
            Error::Json(_) | Error::Io(_) => ErrorCode::InternalError,
        }
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Create a media engine error
    pub fn engine(msg: impl Into<String>) -> Self {
        Error::Engine(msg.into())
    }

    /// Create a capture error
    pub fn capture(msg: impl Into<String>) -> Self {
        Error::Capture(msg.into())
    }

    /// Create a configuration error
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Error::InvalidConfig(msg.into())
    }
}

/// Result type for room client operations
pub type Result<T> = std::result::Result<T, Error>;
