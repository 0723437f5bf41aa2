//! # trail-proto
//!
//! Protocol definitions shared by trail nodes.
//!
//! This crate provides:
//!
//! - [`LogIdentity`] — The key naming one log source (file, container, pod)
//! - [`TrackingRequest`] — A watcher's request to start or stop tracking a log
//! - [`Record`] and [`LifecycleEvent`] — What flows back to the watcher
//! - [`Frame`] — The JSON envelope carried over node-to-node links
//!
//! ## Example
//!
//! ```rust
//! use trail_proto::{LogIdentity, TrackingRequest, WatcherAddress};
//!
//! let identity = LogIdentity::parse("docker://billing-api", "node-a").unwrap();
//! let watcher = WatcherAddress::new("10.0.0.5", 7400);
//! let request = TrackingRequest::flat(identity, watcher, "sub-1").with_backlog(true);
//!
//! assert!(request.validate().is_ok());
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod identity;
pub mod messages;
pub mod record;
pub mod request;

pub use error::{ProtoError, Result};
pub use identity::{LogIdentity, SourceKind};
pub use messages::{
    ControlMessage, ControlReply, Delivery, DeliveryPayload, FailureCode, Frame, RegisterOutcome,
    RequestId, UnregisterOutcome,
};
pub use record::{LifecycleEvent, LifecycleKind, LineStyle, LogLevel, Record, StyledLine};
pub use request::{TrackingKey, TrackingMode, TrackingRequest, WatcherAddress};
