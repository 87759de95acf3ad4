/*
[INPUT]:  Error sources (transport, decode, auth, order book integrity, config)
[OUTPUT]: Structured error type with classification helpers
[POS]:    Error handling layer - unified error type for entire crate
[UPDATE]: When adding new error sources or changing failure classification
*/

use thiserror::Error;

use crate::types::BookKey;

/// Main error type for the streaming core
#[derive(Error, Debug)]
pub enum StreamError {
    /// Transport level failure reported by the websocket library
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Socket dropped while a caller was waiting on it
    #[error("connection closed")]
    ConnectionClosed,

    /// Send attempted on a socket that is not (or no longer) connected
    #[error("connection not established")]
    NotConnected,

    /// No matching reply arrived in time
    #[error("timeout after {duration_ms}ms waiting for {operation}")]
    Timeout { operation: String, duration_ms: u64 },

    /// Serialization/deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Frame decoded but required fields were missing or malformed
    #[error("decode error: {0}")]
    Decode(String),

    /// Venue rejected the login or it timed out
    #[error("authentication failed (code {code}): {message}")]
    Authentication { code: String, message: String },

    /// Authenticated feature used while the session is not authenticated
    #[error("authenticated endpoints unavailable")]
    NotAuthenticated,

    /// Venue returned an error reply for a request
    #[error("API error (code {code}): {message}")]
    Api { code: String, message: String },

    /// Locally computed checksum differs from the venue's
    #[error("checksum mismatch for {key}: expected {expected}, computed {computed}")]
    ChecksumMismatch {
        key: BookKey,
        expected: i64,
        computed: u32,
    },

    /// Best bid is not strictly below best ask
    #[error("crossed order book for {key}")]
    CrossedBook { key: BookKey },

    /// Update arrived for a book that has no valid snapshot
    #[error("order book for {key} not synchronized")]
    BookNotSynced { key: BookKey },

    /// A request with the same id or criteria is still outstanding
    #[error("duplicate outstanding request: {0}")]
    DuplicateRequest(String),

    /// Subscribing would exceed the venue's per-connection cap
    #[error("subscription limit exceeded: {current} active + {incoming} incoming > {max}")]
    SubscriptionLimit {
        current: usize,
        incoming: usize,
        max: usize,
    },

    /// URL parsing failed
    #[error("Invalid URL: {0}")]
    UrlParse(#[from] url::ParseError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Rate limiter refused the send
    #[error("rate limited: {0}")]
    RateLimited(String),
}

impl StreamError {
    /// Check if the error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StreamError::WebSocket(_)
                | StreamError::ConnectionClosed
                | StreamError::NotConnected
                | StreamError::Timeout { .. }
                | StreamError::RateLimited(_)
        )
    }

    /// Check if error indicates authentication failure
    pub fn is_auth_error(&self) -> bool {
        matches!(
            self,
            StreamError::Authentication { .. } | StreamError::NotAuthenticated
        )
    }

    /// Check if error means the local book no longer matches the venue
    pub fn is_desync(&self) -> bool {
        matches!(
            self,
            StreamError::ChecksumMismatch { .. }
                | StreamError::CrossedBook { .. }
                | StreamError::BookNotSynced { .. }
        )
    }

    /// Check if error requires a full reconnect cycle
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            StreamError::WebSocket(_) | StreamError::ConnectionClosed | StreamError::NotConnected
        )
    }

    pub(crate) fn timeout(operation: impl Into<String>, duration: std::time::Duration) -> Self {
        StreamError::Timeout {
            operation: operation.into(),
            duration_ms: duration.as_millis() as u64,
        }
    }
}

/// Result type alias for streaming operations
pub type Result<T> = std::result::Result<T, StreamError>;
