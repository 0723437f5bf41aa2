//! Items flowing between the tail, tracking and sending layers.

use chrono::NaiveDateTime;
use trail_proto::{LifecycleEvent, LogLevel, Record};

/// One line read from a follow process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLine {
    /// Line text without the trailing newline.
    pub text: String,
    /// Position in the tail's output, starting at 1.
    pub sequence: u64,
    /// Timestamp found at the start of the line.
    pub timestamp: Option<NaiveDateTime>,
    /// Logical record this line belongs to.
    pub correlation_id: u64,
    /// Level found in a timestamped line.
    pub level: Option<LogLevel>,
}

impl RawLine {
    /// A line as read from the source, before enrichment.
    #[must_use]
    pub fn new(text: impl Into<String>, sequence: u64) -> Self {
        Self {
            text: text.into(),
            sequence,
            timestamp: None,
            correlation_id: 0,
            level: None,
        }
    }
}

/// What a tail layer publishes.
#[derive(Debug, Clone)]
pub enum TailItem {
    /// A line from the source.
    Line(RawLine),
    /// A lifecycle event of the source.
    Event(LifecycleEvent),
}

/// What a tracking layer publishes.
#[derive(Debug, Clone)]
pub enum TrackingItem {
    /// A released record.
    Record(Record),
    /// A lifecycle event passed through from the tail.
    Event(LifecycleEvent),
}
