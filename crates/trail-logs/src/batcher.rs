//! Flat batching for logs without a timestamp format.
//!
//! No record boundaries are detected: a batch is released once it reaches
//! the size threshold or stays idle for the group timeout, so a multi-line
//! entry can be split across two batches.

use std::time::Instant;

use trail_proto::Record;

use crate::aggregator::ReleasePolicy;
use crate::level::LevelDetector;
use crate::markup;
use crate::types::RawLine;

/// Batches lines of one log.
#[derive(Debug)]
pub struct FlatBatcher {
    policy: ReleasePolicy,
    levels: LevelDetector,
    lines: Vec<RawLine>,
    last_arrival: Option<Instant>,
}

impl FlatBatcher {
    /// Create a batcher.
    #[must_use]
    pub const fn new(policy: ReleasePolicy) -> Self {
        Self {
            policy,
            levels: LevelDetector::new(),
            lines: Vec::new(),
            last_arrival: None,
        }
    }

    /// Number of lines waiting.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.lines.len()
    }

    /// Add a line; returns a batch when the threshold is reached.
    pub fn push(&mut self, line: RawLine, now: Instant) -> Option<Record> {
        self.lines.push(line);
        self.last_arrival = Some(now);
        if self.lines.len() >= self.policy.size_threshold {
            return self.release();
        }
        None
    }

    /// Release the batch if it has been idle for the group timeout.
    pub fn poll(&mut self, now: Instant) -> Option<Record> {
        let idle = self
            .last_arrival
            .is_some_and(|last| now.saturating_duration_since(last) >= self.policy.group_timeout);
        if idle { self.release() } else { None }
    }

    /// Release whatever is buffered.
    pub fn flush(&mut self) -> Option<Record> {
        self.release()
    }

    fn release(&mut self) -> Option<Record> {
        let first = self.lines.first()?.sequence;
        let lines = std::mem::take(&mut self.lines);
        Some(Record {
            lines: markup::style_flat(&lines, &self.levels),
            level: None,
            timestamp: None,
            sequence: first,
        })
    }
}
