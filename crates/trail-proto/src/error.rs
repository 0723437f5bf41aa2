//! Error types for the trail-proto crate.

use thiserror::Error;

/// Errors that can occur during protocol operations.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// Failed to encode a message.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Failed to decode a message.
    #[error("decoding error: {0}")]
    Decoding(String),

    /// A log path could not be turned into a log identity.
    #[error("invalid log path '{path}': {reason}")]
    InvalidIdentity {
        /// The offending path.
        path: String,
        /// What is wrong with it.
        reason: &'static str,
    },

    /// A watcher address is malformed.
    #[error("invalid watcher address: {0}")]
    InvalidAddress(String),

    /// Validation error.
    #[error("validation error: {0}")]
    Validation(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let err = ProtoError::Encoding("bad utf-8".to_string());
        assert_eq!(err.to_string(), "encoding error: bad utf-8");

        let err = ProtoError::Decoding("eof".to_string());
        assert_eq!(err.to_string(), "decoding error: eof");

        let err = ProtoError::InvalidIdentity {
            path: "node://".to_string(),
            reason: "missing node name",
        };
        assert_eq!(err.to_string(), "invalid log path 'node://': missing node name");

        let err = ProtoError::InvalidAddress("nohost".to_string());
        assert_eq!(err.to_string(), "invalid watcher address: nohost");

        let err = ProtoError::Validation("destination id is empty".to_string());
        assert_eq!(err.to_string(), "validation error: destination id is empty");
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ProtoError>();
    }
}
