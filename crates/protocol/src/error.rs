//! Error types for the protocol crate.

use std::time::Duration;

use thiserror::Error;

/// Protocol error type covering all possible failure modes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Serialization errors
    /// Failed to serialize data.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize data.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    /// Base64 body could not be decoded.
    #[error("invalid base64 payload: {0}")]
    Decode(String),

    // Fragment errors
    /// A datagram carried the fragment tag but its header could not be parsed.
    #[error("malformed fragment: {0}")]
    MalformedFragment(String),

    /// The configured chunk size cannot carry any data.
    #[error("invalid chunk size: {0} (must be at least 1)")]
    InvalidChunkSize(usize),

    /// Too many messages are partially reassembled at once.
    #[error("reassembly table full: {limit} messages pending")]
    ReassemblyFull {
        /// Maximum number of concurrently pending messages.
        limit: usize,
    },

    // Connection errors
    /// Connection was closed unexpectedly.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// No complete message with the expected prefix arrived in time.
    #[error("timed out after {waited:?} waiting for {prefix:?} message")]
    Timeout {
        /// The prefix that was being waited for.
        prefix: String,
        /// How long the wait lasted.
        waited: Duration,
    },

    /// Sending or receiving data failed.
    #[error("transfer failed: {0}")]
    TransferFailed(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

// Conversions from underlying crate errors

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Deserialization(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}

impl From<base64::DecodeError> for ProtocolError {
    fn from(err: base64::DecodeError) -> Self {
        ProtocolError::Decode(err.to_string())
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => ProtocolError::ConnectionClosed(err.to_string()),
            _ => ProtocolError::TransferFailed(err.to_string()),
        }
    }
}

impl ProtocolError {
    /// Returns true if this error is a signaling timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ProtocolError::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_fragment_display() {
        let err = ProtocolError::MalformedFragment("missing chunk index".to_string());
        assert_eq!(err.to_string(), "malformed fragment: missing chunk index");
    }

    #[test]
    fn test_invalid_chunk_size_display() {
        let err = ProtocolError::InvalidChunkSize(0);
        assert_eq!(err.to_string(), "invalid chunk size: 0 (must be at least 1)");
    }

    #[test]
    fn test_timeout_display_and_predicate() {
        let err = ProtocolError::Timeout {
            prefix: "ANSWER:".to_string(),
            waited: Duration::from_millis(100),
        };
        assert_eq!(
            err.to_string(),
            "timed out after 100ms waiting for \"ANSWER:\" message"
        );
        assert!(err.is_timeout());
        assert!(!ProtocolError::TransferFailed("x".to_string()).is_timeout());
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("{invalid}").unwrap_err();
        let err: ProtocolError = json_err.into();
        assert!(matches!(err, ProtocolError::Deserialization(_)));
    }

    #[test]
    fn test_from_base64_error() {
        use base64::Engine;
        let b64_err = base64::engine::general_purpose::STANDARD
            .decode("not base64!")
            .unwrap_err();
        let err: ProtocolError = b64_err.into();
        assert!(matches!(err, ProtocolError::Decode(_)));
    }

    #[test]
    fn test_from_io_error_connection_reset() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let err: ProtocolError = io_err.into();
        assert!(matches!(err, ProtocolError::ConnectionClosed(_)));
    }

    #[test]
    fn test_from_io_error_broken_pipe() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broken");
        let err: ProtocolError = io_err.into();
        assert!(matches!(err, ProtocolError::ConnectionClosed(_)));
    }

    #[test]
    fn test_from_io_error_other() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: ProtocolError = io_err.into();
        assert!(matches!(err, ProtocolError::TransferFailed(_)));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ProtocolError>();
    }
}
