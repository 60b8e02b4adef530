//! Error taxonomy for the synchronization core.
//!
//! DESIGN
//! ======
//! Each layer owns a `thiserror` enum. `ValidationError` is returned before
//! any network call. `TransportError` covers the live channels and the
//! channel directory. `ApiError` is the raw HTTP layer and is mapped into
//! `SnapshotUnavailable` or `WriteRejected` at component boundaries.
//! `SyncError` is what the public operations return.

#[cfg(test)]
#[path = "error_test.rs"]
mod tests;

use crate::channel::ChannelState;

// =============================================================================
// ERROR CODES
// =============================================================================

/// Grepable code and retry hint, in the same shape for every layer.
pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> &'static str;

    fn retryable(&self) -> bool {
        false
    }
}

// =============================================================================
// VALIDATION
// =============================================================================

/// Caller input rejected before reaching the network.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("pixel ({x}, {y}) is outside the {width}x{height} canvas")]
    OutOfBounds { x: i64, y: i64, width: u32, height: u32 },
    #[error("message body is empty")]
    EmptyMessage,
    #[error("invalid color `{0}`; expected #rgb or #rrggbb")]
    InvalidColor(String),
    #[error("invalid author name: {0}")]
    InvalidAuthor(String),
}

impl ErrorCode for ValidationError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::OutOfBounds { .. } => "E_OUT_OF_BOUNDS",
            Self::EmptyMessage => "E_EMPTY_MESSAGE",
            Self::InvalidColor(_) => "E_INVALID_COLOR",
            Self::InvalidAuthor(_) => "E_INVALID_AUTHOR",
        }
    }
}

// =============================================================================
// TRANSPORT
// =============================================================================

/// Failures of a live channel or of the directory lookup that precedes it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("channel directory lookup failed: {0}")]
    Resolve(String),
    #[error("websocket connect failed: {0}")]
    Connect(String),
    #[error("timed out connecting to {0}")]
    Timeout(String),
    #[error("websocket send failed: {0}")]
    Send(String),
    #[error("payload encode failed: {0}")]
    Encode(String),
    #[error("channel not ready (state: {0})")]
    ChannelNotReady(ChannelState),
    #[error("channel already opened (state: {0})")]
    AlreadyOpened(ChannelState),
}

impl ErrorCode for TransportError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Resolve(_) => "E_RESOLVE",
            Self::Connect(_) => "E_CONNECT",
            Self::Timeout(_) => "E_TIMEOUT",
            Self::Send(_) => "E_SEND",
            Self::Encode(_) => "E_ENCODE",
            Self::ChannelNotReady(_) => "E_CHANNEL_NOT_READY",
            Self::AlreadyOpened(_) => "E_ALREADY_OPENED",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Resolve(_) | Self::Connect(_) | Self::Timeout(_) | Self::Send(_))
    }
}

// =============================================================================
// HTTP
// =============================================================================

/// Errors produced by the HTTP endpoints.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    /// The request never produced a response (DNS, connect, timeout).
    #[error("request failed: {0}")]
    Request(String),
    /// The server answered with a non-success HTTP status.
    #[error("http status {status}: {body}")]
    Status { status: u16, body: String },
    /// The body was not the expected envelope.
    #[error("response parse failed: {0}")]
    Parse(String),
    /// The envelope carried `success: false`.
    #[error("server declined: {0}")]
    Declined(String),
    /// The envelope reported success but carried no `data`.
    #[error("response missing data")]
    MissingData,
    /// The HTTP client could not be constructed.
    #[error("HTTP client build failed: {0}")]
    ClientBuild(String),
}

impl ErrorCode for ApiError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Request(_) => "E_API_REQUEST",
            Self::Status { .. } => "E_API_STATUS",
            Self::Parse(_) => "E_API_PARSE",
            Self::Declined(_) => "E_API_DECLINED",
            Self::MissingData => "E_API_MISSING_DATA",
            Self::ClientBuild(_) => "E_API_CLIENT_BUILD",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Request(_) | Self::Status { status: 429 | 500..=599, .. })
    }
}

impl ApiError {
    /// True when the server received the request and said no.
    #[must_use]
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Declined(_) | Self::Status { status: 400..=499, .. })
    }
}

// =============================================================================
// SYNC
// =============================================================================

/// Error surface of the synchronization core.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("snapshot unavailable: {0}")]
    SnapshotUnavailable(String),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("write rejected: {0}")]
    WriteRejected(String),
    #[error("session is closed")]
    SessionClosed,
}

impl SyncError {
    /// Map a failed write request: declines become `WriteRejected`, the rest
    /// are transport failures.
    #[must_use]
    pub fn from_write(err: ApiError) -> Self {
        if err.is_rejection() {
            Self::WriteRejected(err.to_string())
        } else {
            Self::Transport(TransportError::Send(err.to_string()))
        }
    }
}

impl ErrorCode for SyncError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Transport(e) => e.error_code(),
            Self::SnapshotUnavailable(_) => "E_SNAPSHOT_UNAVAILABLE",
            Self::Validation(e) => e.error_code(),
            Self::WriteRejected(_) => "E_WRITE_REJECTED",
            Self::SessionClosed => "E_SESSION_CLOSED",
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::Transport(e) => e.retryable(),
            Self::SnapshotUnavailable(_) => true,
            Self::Validation(_) | Self::WriteRejected(_) | Self::SessionClosed => false,
        }
    }
}
