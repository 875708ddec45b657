//! Error types for BlueTransfer.
//!
//! This module provides a unified error type for all engine operations,
//! with specific error variants for different failure modes.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::protocol::TransferId;
use crate::transfer::TransferStatus;

/// A specialized `Result` type for BlueTransfer operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for BlueTransfer.
#[derive(Error, Debug)]
pub enum Error {
    /// Connection lost during transfer (E001)
    #[error("connection lost during transfer with {0}")]
    ConnectionLost(SocketAddr),

    /// Unable to reach the peer (E002)
    #[error("unable to connect to {addr}: {reason}")]
    ConnectFailed {
        /// Peer address
        addr: SocketAddr,
        /// Underlying reason
        reason: String,
    },

    /// Transfer was cancelled
    #[error("transfer cancelled")]
    TransferCancelled,

    /// No transfer with this ID is registered
    #[error("unknown transfer {0}")]
    TransferNotFound(TransferId),

    /// Operation not allowed in the transfer's current state
    #[error("cannot {operation} transfer {id} while it is {status}")]
    InvalidState {
        /// Transfer ID
        id: TransferId,
        /// Operation that was attempted
        operation: &'static str,
        /// Status at the time of the attempt
        status: TransferStatus,
    },

    /// Source file yielded fewer bytes than announced (E003)
    #[error("source file '{file}' ended after {read} of {expected} bytes")]
    SourceTruncated {
        /// File being sent
        file: String,
        /// Bytes actually read
        read: u64,
        /// Bytes announced in the request
        expected: u64,
    },

    /// File not found
    #[error("file not found: {0}")]
    FileNotFound(String),

    /// Invalid path
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Invalid protocol message
    #[error("invalid protocol message: {0}")]
    ProtocolError(String),

    /// Unexpected message type
    #[error("unexpected message type: expected {expected}, got {actual}")]
    UnexpectedMessage {
        /// Expected message type
        expected: String,
        /// Actual message type received
        actual: String,
    },

    /// Configuration file error
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Invalid configuration value
    #[error("invalid configuration value for '{key}': {reason}")]
    InvalidConfig {
        /// Configuration key
        key: String,
        /// Reason for invalidity
        reason: String,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Internal error (should not happen)
    #[error("internal error: {0}")]
    Internal(String),

    /// Operation timeout
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
}

impl Error {
    /// Returns the error code associated with this error, if any.
    ///
    /// Error codes follow the pattern EXXX where XXX is a 3-digit number.
    #[must_use]
    pub const fn code(&self) -> Option<&'static str> {
        match self {
            Self::ConnectionLost(_) => Some("E001"),
            Self::ConnectFailed { .. } => Some("E002"),
            Self::SourceTruncated { .. } => Some("E003"),
            _ => None,
        }
    }

    /// Returns whether this error is recoverable (can be retried).
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionLost(_) | Self::ConnectFailed { .. } | Self::Timeout(_)
        )
    }

    /// Returns a helpful suggestion for resolving the error, if applicable.
    #[must_use]
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::ConnectFailed { .. } => Some(
                "Make sure the peer is running `bluetransfer listen` and that\n\
                 the port is reachable (check firewalls and the configured port).",
            ),
            Self::SourceTruncated { .. } => {
                Some("The file changed while it was being sent. Send it again.")
            }
            Self::InvalidState { .. } => {
                Some("The transfer already moved on; refresh the transfer list.")
            }
            _ => None,
        }
    }

    /// Whether the error means the peer simply went away.
    #[must_use]
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::ConnectionLost(_) => true,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let addr: SocketAddr = "127.0.0.1:15556".parse().expect("addr");
        assert_eq!(Error::ConnectionLost(addr).code(), Some("E001"));
        assert_eq!(Error::TransferCancelled.code(), None);
    }

    #[test]
    fn test_recoverable_errors() {
        let addr: SocketAddr = "127.0.0.1:15556".parse().expect("addr");
        assert!(Error::ConnectionLost(addr).is_recoverable());
        assert!(Error::Timeout(Duration::from_secs(1)).is_recoverable());
        assert!(!Error::TransferCancelled.is_recoverable());
        assert!(!Error::FileNotFound("a.txt".to_string()).is_recoverable());
    }

    #[test]
    fn test_timeout_message_keeps_subsecond_precision() {
        let err = Error::Timeout(Duration::from_millis(250));
        assert_eq!(err.to_string(), "operation timed out after 250ms");
    }

    #[test]
    fn test_disconnect_detection() {
        let eof = Error::Io(io::Error::new(io::ErrorKind::UnexpectedEof, "eof"));
        assert!(eof.is_disconnect());

        let other = Error::ProtocolError("bad".to_string());
        assert!(!other.is_disconnect());
    }

    #[test]
    fn test_invalid_state_message() {
        let id = TransferId::new();
        let err = Error::InvalidState {
            id,
            operation: "pause",
            status: TransferStatus::Finished,
        };
        assert_eq!(
            err.to_string(),
            format!("cannot pause transfer {id} while it is finished")
        );
    }
}
