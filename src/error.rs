//! Error types for the SMB client

use crate::protocol::status::{self, Severity};
use std::io;
use thiserror::Error;

/// Result type for SMB operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for SMB client operations
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error occurred
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Protocol parsing error
    #[error("Protocol parsing error: {0}")]
    ParseError(String),

    /// Invalid SMB header
    #[error("Invalid SMB header: {0}")]
    InvalidHeader(String),

    /// Buffer too small
    #[error("Buffer too small: need {need} bytes, have {have}")]
    BufferTooSmall { need: usize, have: usize },

    /// Server selected a dialect we did not offer
    #[error("Unsupported dialect: {0}")]
    UnsupportedDialect(String),

    /// Socket or negotiation failure
    #[error("Connection error: {message}")]
    ConnectionError {
        message: String,
        #[source]
        source: Option<Box<Error>>,
    },

    /// The connection dropped while a request was outstanding
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Logon or credential renewal failure
    #[error("Authentication failed: {message}")]
    AuthenticationFailed {
        message: String,
        #[source]
        source: Option<Box<Error>>,
    },

    /// Non-success wire status
    #[error("{message} (0x{status:08X})")]
    Status {
        status: u32,
        severity: Severity,
        message: &'static str,
    },

    /// The path is covered by a DFS link and must be resolved elsewhere
    #[error("DFS referral required for {path}")]
    DfsRedirect { path: String },

    #[error("Not a DFS path: {0}")]
    NotDfsPath(String),

    #[error("No referral available for {0}")]
    NoReferral(String),

    /// Timeout occurred
    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// Invalid parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Tree id invalidated by a session re-authentication
    #[error("Tree connection invalidated: {0}")]
    StaleTree(String),

    /// Protocol violation by the peer
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl Error {
    pub fn connection(message: impl Into<String>) -> Self {
        Error::ConnectionError {
            message: message.into(),
            source: None,
        }
    }

    pub fn connection_caused(message: impl Into<String>, cause: Error) -> Self {
        Error::ConnectionError {
            message: message.into(),
            source: Some(Box::new(cause)),
        }
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Error::AuthenticationFailed {
            message: message.into(),
            source: None,
        }
    }

    pub fn authentication_caused(message: impl Into<String>, cause: Error) -> Self {
        Error::AuthenticationFailed {
            message: message.into(),
            source: Some(Box::new(cause)),
        }
    }

    /// Build the error for a non-success wire status.
    pub fn from_status(code: u32) -> Self {
        let entry = status::lookup(code);
        Error::Status {
            status: code,
            severity: entry.severity,
            message: entry.message,
        }
    }

    /// Wire status carried by this error, if any.
    pub fn status(&self) -> Option<u32> {
        match self {
            Error::Status { status, .. } => Some(*status),
            Error::DfsRedirect { .. } => Some(status::STATUS_PATH_NOT_COVERED),
            _ => None,
        }
    }

    /// A send failure that left the connection usable and may be retried once.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }

    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Error::ConnectionLost(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }

    pub fn is_redirect(&self) -> bool {
        matches!(self, Error::DfsRedirect { .. })
    }

    pub fn is_authentication(&self) -> bool {
        matches!(self, Error::AuthenticationFailed { .. })
    }
}
