//! Protocol message definitions.
//!
//! Every node-to-node link carries [`Frame`]s encoded as JSON text.
//! Requests wait for a reply with the same [`RequestId`]; deliveries are
//! fire-and-forget.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::identity::LogIdentity;
use crate::record::{LifecycleEvent, Record};
use crate::request::TrackingRequest;

/// Correlates a request frame with its reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub Uuid);

impl RequestId {
    /// Generate a new random id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result of a successful register call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterOutcome {
    /// A new sending layer was created.
    Registered,
    /// The watcher was already registered; nothing changed.
    AlreadyRegistered,
}

/// Result of a successful unregister call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnregisterOutcome {
    /// The sending layer was removed.
    Unregistered,
    /// No registration existed; nothing changed.
    NotRegistered,
}

/// Machine-readable reason of a failed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCode {
    /// The request did not validate.
    InvalidRequest,
    /// The access policy rejected the log path.
    AccessDenied,
    /// The log belongs to another node.
    ForeignNode,
    /// The target node could not be reached.
    Unavailable,
    /// Any other failure on the serving node.
    Internal,
}

/// Control requests sent from a watcher's node to the node owning a log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Start delivering a log to a watcher.
    Register {
        /// The tracking request.
        request: TrackingRequest,
    },
    /// Stop delivering a log to a watcher.
    Unregister {
        /// The tracking request given at registration.
        request: TrackingRequest,
    },
}

impl ControlMessage {
    /// Create a register message.
    #[must_use]
    pub const fn register(request: TrackingRequest) -> Self {
        Self::Register { request }
    }

    /// Create an unregister message.
    #[must_use]
    pub const fn unregister(request: TrackingRequest) -> Self {
        Self::Unregister { request }
    }

    /// The request carried by this message.
    #[must_use]
    pub const fn request(&self) -> &TrackingRequest {
        match self {
            Self::Register { request } | Self::Unregister { request } => request,
        }
    }
}

/// Replies to [`ControlMessage`]s.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlReply {
    /// Register succeeded.
    Registered {
        /// What the register call did.
        outcome: RegisterOutcome,
    },
    /// Unregister succeeded.
    Unregistered {
        /// What the unregister call did.
        outcome: UnregisterOutcome,
    },
    /// The request failed.
    Failed {
        /// Failure category.
        code: FailureCode,
        /// Human-readable reason.
        message: String,
    },
}

impl ControlReply {
    /// Create a failure reply.
    #[must_use]
    pub fn failed(code: FailureCode, message: impl Into<String>) -> Self {
        Self::Failed {
            code,
            message: message.into(),
        }
    }

    /// Whether this reply reports a failure.
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// Content of a delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeliveryPayload {
    /// A released record.
    Record(Record),
    /// A lifecycle event of the source.
    Event(LifecycleEvent),
}

/// A record or event addressed to one watcher subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    /// Log the payload came from.
    pub identity: LogIdentity,
    /// Watcher-side subscription id.
    pub destination_id: String,
    /// The payload.
    pub payload: DeliveryPayload,
}

/// Envelope of everything sent over a node link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// A control request awaiting a reply.
    Request {
        /// Request id.
        id: RequestId,
        /// The request.
        body: ControlMessage,
    },
    /// The reply to a request.
    Reply {
        /// Id of the answered request.
        id: RequestId,
        /// The reply.
        body: ControlReply,
    },
    /// A fire-and-forget delivery.
    Delivery {
        /// The delivery.
        delivery: Delivery,
    },
}

impl Frame {
    /// Serialize to JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, crate::ProtoError> {
        serde_json::to_string(self).map_err(|e| crate::ProtoError::Encoding(e.to_string()))
    }

    /// Deserialize from JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if deserialization fails.
    pub fn from_json(json: &str) -> Result<Self, crate::ProtoError> {
        serde_json::from_str(json).map_err(|e| crate::ProtoError::Decoding(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{LifecycleKind, LineStyle, StyledLine};
    use crate::request::WatcherAddress;

    fn request() -> TrackingRequest {
        TrackingRequest::grouped(
            LogIdentity::file("agent-1", "/var/log/app.log"),
            "%Y-%m-%d %H:%M:%S",
            WatcherAddress::new("server", 7400),
            "sub-42",
        )
    }

    #[test]
    fn test_register_frame_json() {
        let frame = Frame::Request {
            id: RequestId::new(),
            body: ControlMessage::register(request()),
        };
        let json = frame.to_json().unwrap();
        assert!(json.contains(r#""type":"request""#));
        assert!(json.contains(r#""type":"register""#));
        assert!(json.contains("sub-42"));
    }

    #[test]
    fn test_reply_roundtrip() {
        let id = RequestId::new();
        let frame = Frame::Reply {
            id,
            body: ControlReply::failed(FailureCode::AccessDenied, "nope"),
        };
        let parsed = Frame::from_json(&frame.to_json().unwrap()).unwrap();
        assert_eq!(parsed, frame);
        assert!(matches!(parsed, Frame::Reply { ref body, .. } if body.is_failure()));
    }

    #[test]
    fn test_delivery_record_json() {
        let frame = Frame::Delivery {
            delivery: Delivery {
                identity: LogIdentity::container("agent-1", "web"),
                destination_id: "sub-1".to_string(),
                payload: DeliveryPayload::Record(Record {
                    lines: vec![StyledLine::new("hello", LineStyle::Plain)],
                    level: None,
                    timestamp: None,
                    sequence: 1,
                }),
            },
        };
        let json = frame.to_json().unwrap();
        assert!(json.contains(r#""type":"delivery""#));
        assert!(json.contains(r#""type":"record""#));
        assert_eq!(Frame::from_json(&json).unwrap(), frame);
    }

    #[test]
    fn test_delivery_event_json() {
        let payload = DeliveryPayload::Event(LifecycleEvent::new(
            LifecycleKind::Rotated,
            "tail: 'a.log' has been replaced;  following new file",
        ));
        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains(r#""type":"event""#));
        assert!(json.contains(r#""kind":"rotated""#));
    }

    #[test]
    fn test_control_message_request_accessor() {
        let msg = ControlMessage::unregister(request());
        assert_eq!(msg.request().destination_id, "sub-42");
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        let err = Frame::from_json("{\"type\":\"bogus\"}").unwrap_err();
        assert!(err.to_string().starts_with("decoding error"));
    }
}
