//! Shared Error Types
//!
//! This module defines the error taxonomy of the realtime client. Every error
//! that can reach the owner of a [`RealtimeClient`](crate::client::RealtimeClient)
//! or a [`ConversationReconciler`](crate::client::ConversationReconciler) is
//! one of these types.
//!
//! # Error Categories
//!
//! - **Precondition** - no credential, or an expired one, at connect time
//! - **Terminal** - the broker rejected the credential, or reconnection gave up
//! - **Transient** - socket errors and broker errors that are retried
//! - **Local** - recovered in place (publish while disconnected)
//!
//! # Usage
//!
//! ```rust
//! use campus_chat::shared::error::{ErrorClass, RealtimeError};
//!
//! let error = RealtimeError::authentication_rejected("Invalid or expired JWT token");
//! assert_eq!(error.class(), ErrorClass::Terminal);
//! assert!(error.is_terminal());
//! ```
use thiserror::Error;

/// How the owner of the client should react to an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Reported immediately, nothing was attempted
    Precondition,
    /// Automatic recovery stopped; the user must refresh or sign in again
    Terminal,
    /// Being retried by the reconnect policy
    Transient,
    /// Handled locally, informational only
    Local,
}

/// Errors surfaced by the realtime client
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RealtimeError {
    /// The credential supplier had no token
    #[error("No authentication token found")]
    MissingCredential,

    /// The credential supplier reported the token as invalid or expired
    #[error("Authentication token expired. Please refresh the page.")]
    CredentialExpired,

    /// The broker refused the credential; auto-reconnect is disabled
    #[error("Authentication failed, re-authentication required: {message}")]
    AuthenticationRejected {
        /// Message reported by the broker
        message: String,
    },

    /// Reconnection attempts were exhausted
    #[error("Failed to reconnect after {attempts} attempts")]
    ReconnectExhausted {
        /// Number of attempts made
        attempts: u32,
    },

    /// Socket level failure (refused, reset, unexpected close)
    #[error("WebSocket connection error: {message}")]
    Transport {
        /// Human-readable error message
        message: String,
    },

    /// Broker reported an error that is not an authentication problem
    #[error("WebSocket error: {message}")]
    BrokerError {
        /// Message reported by the broker
        message: String,
    },

    /// An operation that needs a live session was called while disconnected
    #[error("WebSocket not connected")]
    NotConnected,

    /// The broker sent bytes that are not a STOMP frame
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// The driver task has stopped
    #[error("Realtime client has been shut down")]
    ClientClosed,
}

impl RealtimeError {
    /// Create a transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create a broker error
    pub fn broker(message: impl Into<String>) -> Self {
        Self::BrokerError {
            message: message.into(),
        }
    }

    /// Create an authentication rejection
    pub fn authentication_rejected(message: impl Into<String>) -> Self {
        Self::AuthenticationRejected {
            message: message.into(),
        }
    }

    /// Classify this error for the UI
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::MissingCredential | Self::CredentialExpired => ErrorClass::Precondition,
            Self::AuthenticationRejected { .. }
            | Self::ReconnectExhausted { .. }
            | Self::ClientClosed => ErrorClass::Terminal,
            Self::Transport { .. } | Self::BrokerError { .. } | Self::Frame(_) => {
                ErrorClass::Transient
            }
            Self::NotConnected => ErrorClass::Local,
        }
    }

    /// Whether automatic recovery has stopped for good
    pub fn is_terminal(&self) -> bool {
        self.class() == ErrorClass::Terminal
    }

    /// Whether the user has to obtain a fresh credential
    pub fn requires_reauthentication(&self) -> bool {
        matches!(
            self,
            Self::MissingCredential | Self::CredentialExpired | Self::AuthenticationRejected { .. }
        )
    }
}

/// STOMP codec errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,
    #[error("unknown STOMP command: {0}")]
    UnknownCommand(String),
    #[error("malformed header line: {0}")]
    MalformedHeader(String),
    #[error("invalid escape sequence in header: {0}")]
    InvalidEscape(String),
    #[error("frame is missing its NUL terminator")]
    Unterminated,
    #[error("content-length {declared} exceeds body of {actual} bytes")]
    ContentLength { declared: usize, actual: usize },
    #[error("body is not valid UTF-8")]
    InvalidUtf8,
}

/// Inbound payloads that cannot become a [`Message`](crate::shared::messaging::Message)
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PayloadError {
    #[error("payload is not valid JSON: {0}")]
    Json(String),
    #[error("payload is missing required field `{0}`")]
    MissingField(&'static str),
}

impl From<serde_json::Error> for PayloadError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err.to_string())
    }
}

/// REST collaborator errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ApiError {
    /// 401 from the backend
    #[error("unauthorized")]
    Unauthorized,

    /// 403 from the backend, typically "not a member of this project"
    #[error("forbidden")]
    Forbidden,

    /// Any other non-success status
    #[error("request failed with status {status}: {message}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Backend `message` field or the status text
        message: String,
    },

    /// Connection or timeout failure
    #[error("network error: {0}")]
    Network(String),

    /// Response body could not be decoded
    #[error("invalid response body: {0}")]
    Decode(String),
}

impl ApiError {
    /// Permission failures are expected for projects the user left
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Self::Unauthorized | Self::Forbidden)
    }

    /// Substring classification of backend error text.
    ///
    /// The backend reports duplicates ("already has a pending invitation",
    /// "already a member") only in the message text.
    pub fn is_duplicate(&self) -> bool {
        match self {
            Self::Status { message, .. } => {
                let lowered = message.to_lowercase();
                lowered.contains("already") || lowered.contains("duplicate")
            }
            _ => false,
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(format!("JSON error: {}", err))
    }
}
