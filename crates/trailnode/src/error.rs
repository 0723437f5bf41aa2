//! Error types for trailnode.

use thiserror::Error;
use trail_logs::LogError;
use trail_proto::{FailureCode, LogIdentity, ProtoError, RequestId};

/// Errors that can occur in node operations.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// The log belongs to another node.
    #[error("log '{identity}' belongs to node '{owner}', not '{local}'")]
    ForeignNode {
        /// The requested log.
        identity: LogIdentity,
        /// Node owning the log.
        owner: String,
        /// This node.
        local: String,
    },

    /// No endpoint is configured for a node name.
    #[error("unknown peer node: {0}")]
    UnknownPeer(String),

    /// A peer could not be reached or the connection dropped.
    #[error("peer unavailable: {0}")]
    Unavailable(String),

    /// A peer did not answer in time.
    #[error("request {0} timed out")]
    Timeout(RequestId),

    /// A peer answered with a failure.
    #[error("request rejected ({code:?}): {message}")]
    Rejected {
        /// Failure category reported by the peer.
        code: FailureCode,
        /// Reason reported by the peer.
        message: String,
    },

    /// A peer answered with a reply that does not match the request.
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),

    /// Failed to bind the RPC listener.
    #[error("failed to bind to {0}: {1}")]
    BindFailed(String, std::io::Error),

    /// WebSocket error.
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// Tracking engine error.
    #[error(transparent)]
    Engine(#[from] LogError),

    /// Protocol error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtoError),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl NodeError {
    /// Failure category reported to a remote caller.
    #[must_use]
    pub const fn failure_code(&self) -> FailureCode {
        match self {
            Self::Protocol(_) => FailureCode::InvalidRequest,
            Self::Engine(LogError::AccessDenied(_)) => FailureCode::AccessDenied,
            Self::Engine(LogError::InvalidTimestampFormat(_) | LogError::InvalidSettings(_)) => {
                FailureCode::InvalidRequest
            }
            Self::ForeignNode { .. } | Self::UnknownPeer(_) => FailureCode::ForeignNode,
            Self::Unavailable(_) | Self::Timeout(_) | Self::WebSocket(_) => FailureCode::Unavailable,
            Self::Rejected { code, .. } => *code,
            _ => FailureCode::Internal,
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for NodeError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(err.to_string())
    }
}

/// Result type alias for node operations.
pub type Result<T> = std::result::Result<T, NodeError>;
