//! # trail-logs
//!
//! Live log tracking engine for trail nodes.
//!
//! This crate provides:
//!
//! - [`OriginAdapter`] — Supervises one `tail`/`docker`/`kubectl` follow process
//! - [`AccessGuard`] — Include/exclude globs and symlink resolution for file logs
//! - [`TailLayer`] — One follow process per log, shared by all its watchers
//! - [`TrackingLayer`] — Groups tail output into records, one per log and mode
//! - [`RecordAggregator`] and [`FlatBatcher`] — The grouping algorithms
//! - [`RefRegistry`] — Reference-counted sharing of layers
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Instant;
//! use trail_logs::{ChronoTimestampParser, RawLine, RecordAggregator, ReleasePolicy};
//!
//! let parser = ChronoTimestampParser::new("%Y-%m-%d %H:%M:%S").unwrap();
//! let mut aggregator = RecordAggregator::new(ReleasePolicy::default(), Arc::new(parser));
//!
//! let now = Instant::now();
//! aggregator.push(RawLine::new("2024-03-01 10:00:00 ERROR failed", 1), now);
//! aggregator.push(RawLine::new("\tat Main.run(Main.java:7)", 2), now);
//!
//! let record = aggregator.flush().unwrap();
//! assert_eq!(record.len(), 2);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod aggregator;
pub mod batcher;
pub mod error;
pub mod glob;
pub mod guard;
pub mod level;
pub mod markup;
pub mod origin;
pub mod profile;
pub mod registry;
pub mod tail;
pub mod timestamp;
pub mod tracking;
pub mod types;

// Re-export main types
pub use aggregator::{RecordAggregator, ReleasePolicy};
pub use batcher::FlatBatcher;
pub use error::{LogError, Result};
pub use glob::Glob;
pub use guard::AccessGuard;
pub use level::LevelDetector;
pub use origin::{AdapterState, OriginAdapter, OriginOutput, SupervisionSettings};
pub use profile::{BacklogSizes, CommandSettings, FollowCommand, SourceProfile};
pub use registry::{RefRegistry, Release};
pub use tail::TailLayer;
pub use timestamp::{ChronoTimestampParser, TimestampParser};
pub use tracking::{Grouping, TrackingLayer, TrackingSettings};
pub use types::{RawLine, TailItem, TrackingItem};
