//! # trailnode
//!
//! The trail node agent. A node follows the logs it owns and streams
//! records to watchers, on this node or on other nodes.
//!
//! This crate provides:
//!
//! - [`WatchService`] — Register and unregister watches with refcounted layers
//! - [`TrailNode`] — The service plus its WebSocket listener, routing watch
//!   calls to the node owning a log
//! - [`PeerDirectory`] — Links to other nodes, created on first use
//! - [`RecordSink`] — Where deliveries for local watchers end up
//! - [`NodeConfig`] — JSON configuration

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod directory;
pub mod error;
pub mod locks;
pub mod node;
pub mod rpc;
pub mod sending;
pub mod service;
pub mod sink;

pub use config::NodeConfig;
pub use directory::{LocalLink, PeerDirectory, PeerLink};
pub use error::{NodeError, Result};
pub use locks::KeyedLocks;
pub use node::TrailNode;
pub use rpc::{RemoteLink, RpcServer};
pub use sending::{SendingKey, SendingLayer};
pub use service::WatchService;
pub use sink::{ChannelSink, LoggingSink, RecordSink};
