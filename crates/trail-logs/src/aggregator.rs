//! Grouping of raw lines into multi-line records.
//!
//! A line carrying a timestamp opens a new logical record and gets a fresh
//! correlation id; lines without one (stack frames, XML bodies) inherit the
//! current id. Lines are buffered in sequence order and released as one
//! [`Record`] when
//!
//! 1. the group reaches the size threshold,
//! 2. the two newest lines have different correlation ids (the newest one is
//!    held back and queued again for the next group), or
//! 3. no line arrived for the group timeout.
//!
//! A group of a single line is never released by rule 2.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use trail_proto::Record;

use crate::error::{LogError, Result};
use crate::level::LevelDetector;
use crate::markup;
use crate::timestamp::TimestampParser;
use crate::types::RawLine;

/// When buffered lines are released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleasePolicy {
    /// Group size that forces a release.
    pub size_threshold: usize,
    /// Idle time after which a group is released as is.
    pub group_timeout: Duration,
}

impl ReleasePolicy {
    /// Validate the policy.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::InvalidSettings`] if the threshold is below two or
    /// the timeout is zero.
    pub fn validate(&self) -> Result<()> {
        if self.size_threshold < 2 {
            return Err(LogError::InvalidSettings(
                "size threshold must be at least 2".to_string(),
            ));
        }
        if self.group_timeout.is_zero() {
            return Err(LogError::InvalidSettings(
                "group timeout must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for ReleasePolicy {
    fn default() -> Self {
        Self {
            size_threshold: 500,
            group_timeout: Duration::from_millis(1000),
        }
    }
}

/// Heap entry ordered by sequence number only.
#[derive(Debug)]
struct BySequence(RawLine);

impl PartialEq for BySequence {
    fn eq(&self, other: &Self) -> bool {
        self.0.sequence == other.0.sequence
    }
}

impl Eq for BySequence {}

impl PartialOrd for BySequence {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BySequence {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.sequence.cmp(&other.0.sequence)
    }
}

/// Groups lines of one log into records.
#[derive(Debug)]
pub struct RecordAggregator {
    policy: ReleasePolicy,
    timestamps: Arc<dyn TimestampParser>,
    levels: LevelDetector,
    correlation: u64,
    queue: BinaryHeap<Reverse<BySequence>>,
    group: Vec<RawLine>,
    last_arrival: Option<Instant>,
}

impl RecordAggregator {
    /// Create an aggregator.
    #[must_use]
    pub fn new(policy: ReleasePolicy, timestamps: Arc<dyn TimestampParser>) -> Self {
        Self {
            policy,
            timestamps,
            levels: LevelDetector::new(),
            correlation: 0,
            queue: BinaryHeap::new(),
            group: Vec::new(),
            last_arrival: None,
        }
    }

    /// Number of lines waiting in the current group.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.group.len() + self.queue.len()
    }

    /// Feed a line read from the tail; returns the records it released.
    pub fn push(&mut self, line: RawLine, now: Instant) -> Vec<Record> {
        let line = self.correlate(line);
        self.queue.push(Reverse(BySequence(line)));
        self.drain(now)
    }

    /// Release the group if it has been idle for the group timeout.
    pub fn poll(&mut self, now: Instant) -> Option<Record> {
        let idle = self
            .last_arrival
            .is_some_and(|last| now.saturating_duration_since(last) >= self.policy.group_timeout);
        if idle && !self.group.is_empty() {
            return self.release();
        }
        None
    }

    /// Release whatever is buffered.
    pub fn flush(&mut self) -> Option<Record> {
        while let Some(Reverse(BySequence(line))) = self.queue.pop() {
            self.group.push(line);
        }
        self.release()
    }

    fn correlate(&mut self, mut line: RawLine) -> RawLine {
        let timestamp = if line.text.starts_with("\tat ") {
            None
        } else {
            self.timestamps.parse(&line.text)
        };

        if timestamp.is_some() {
            self.correlation += 1;
            line.level = self.levels.detect(&line.text);
        }
        line.timestamp = timestamp;
        line.correlation_id = self.correlation;
        line
    }

    fn drain(&mut self, now: Instant) -> Vec<Record> {
        let mut released = Vec::new();
        while let Some(Reverse(BySequence(line))) = self.queue.pop() {
            self.group.push(line);
            self.last_arrival = Some(now);
            if let Some(record) = self.evaluate() {
                released.push(record);
            }
        }
        released
    }

    fn evaluate(&mut self) -> Option<Record> {
        let size = self.group.len();
        if size >= self.policy.size_threshold {
            return self.release();
        }
        if size < 2 {
            return None;
        }

        let newest = self.group[size - 1].correlation_id;
        let previous = self.group[size - 2].correlation_id;
        if newest == previous {
            return None;
        }

        let held_back = self.group.pop()?;
        let record = self.release();
        self.queue.push(Reverse(BySequence(held_back)));
        record
    }

    fn release(&mut self) -> Option<Record> {
        if self.group.is_empty() {
            return None;
        }
        let lines = std::mem::take(&mut self.group);
        let first = &lines[0];
        Some(Record {
            level: first.level,
            timestamp: first.timestamp,
            sequence: first.sequence,
            lines: markup::style_group(&lines, first.level),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDateTime;
    use proptest::prelude::*;
    use trail_proto::{LineStyle, LogLevel};

    use crate::timestamp::ChronoTimestampParser;

    const FORMAT: &str = "%Y-%m-%d %H:%M:%S";

    /// Treats lines starting with `#` as timestamped.
    #[derive(Debug)]
    struct HashMarks;

    impl TimestampParser for HashMarks {
        fn parse(&self, line: &str) -> Option<NaiveDateTime> {
            line.starts_with('#').then(NaiveDateTime::default)
        }
    }

    fn aggregator(threshold: usize) -> RecordAggregator {
        let policy = ReleasePolicy {
            size_threshold: threshold,
            group_timeout: Duration::from_millis(1000),
        };
        RecordAggregator::new(policy, Arc::new(HashMarks))
    }

    fn texts(record: &Record) -> Vec<&str> {
        record.texts().collect()
    }

    // ========================================================================
    // Release rules
    // ========================================================================

    #[test]
    fn size_threshold_releases_immediately() {
        let mut agg = aggregator(3);
        let t0 = Instant::now();
        assert!(agg.push(RawLine::new("#a", 1), t0).is_empty());
        assert!(agg.push(RawLine::new("b", 2), t0).is_empty());
        let released = agg.push(RawLine::new("c", 3), t0);

        assert_eq!(released.len(), 1);
        assert_eq!(texts(&released[0]), vec!["#a", "b", "c"]);
        assert_eq!(agg.buffered(), 0);
    }

    #[test]
    fn timeout_releases_partial_group_once() {
        let mut agg = aggregator(3);
        let t0 = Instant::now();
        agg.push(RawLine::new("#a", 1), t0);
        agg.push(RawLine::new("b", 2), t0);

        assert!(agg.poll(t0 + Duration::from_millis(999)).is_none());
        let record = agg.poll(t0 + Duration::from_millis(1000)).unwrap();
        assert_eq!(texts(&record), vec!["#a", "b"]);
        assert!(agg.poll(t0 + Duration::from_millis(5000)).is_none());
    }

    #[test]
    fn boundary_releases_previous_record_and_keeps_newest() {
        let mut agg = aggregator(10);
        let t0 = Instant::now();
        agg.push(RawLine::new("#A", 1), t0);
        agg.push(RawLine::new("B", 2), t0);
        let released = agg.push(RawLine::new("#C", 3), t0);

        assert_eq!(released.len(), 1);
        assert_eq!(texts(&released[0]), vec!["#A", "B"]);
        assert_eq!(agg.buffered(), 1);

        let later = agg.poll(t0 + Duration::from_secs(1)).unwrap();
        assert_eq!(texts(&later), vec!["#C"]);
        assert_eq!(later.sequence, 3);
        assert!(agg.poll(t0 + Duration::from_secs(10)).is_none());
        assert!(agg.flush().is_none());
    }

    #[test]
    fn single_line_group_waits() {
        let mut agg = aggregator(10);
        let t0 = Instant::now();
        assert!(agg.push(RawLine::new("#A", 1), t0).is_empty());
        assert!(agg.push(RawLine::new("#B", 2), t0).len() == 1);
        assert!(agg.push(RawLine::new("#C", 3), t0).len() == 1);
        assert_eq!(agg.buffered(), 1);
    }

    #[test]
    fn lines_before_first_timestamp_share_seed_id() {
        let mut agg = aggregator(10);
        let t0 = Instant::now();
        agg.push(RawLine::new("orphan 1", 1), t0);
        agg.push(RawLine::new("orphan 2", 2), t0);
        let released = agg.push(RawLine::new("#first", 3), t0);
        assert_eq!(texts(&released[0]), vec!["orphan 1", "orphan 2"]);
        assert_eq!(released[0].level, None);
        assert_eq!(released[0].timestamp, None);
    }

    #[test]
    fn flush_releases_queue_and_group() {
        let mut agg = aggregator(10);
        let t0 = Instant::now();
        agg.push(RawLine::new("#A", 1), t0);
        agg.push(RawLine::new("B", 2), t0);
        let record = agg.flush().unwrap();
        assert_eq!(texts(&record), vec!["#A", "B"]);
        assert!(agg.flush().is_none());
    }

    #[test]
    fn policy_validation() {
        let mut policy = ReleasePolicy::default();
        assert!(policy.validate().is_ok());
        policy.size_threshold = 1;
        assert!(policy.validate().is_err());
        policy.size_threshold = 2;
        policy.group_timeout = Duration::ZERO;
        assert!(policy.validate().is_err());
    }

    // ========================================================================
    // Enrichment
    // ========================================================================

    #[test]
    fn record_carries_first_line_metadata() {
        let parser = Arc::new(ChronoTimestampParser::new(FORMAT).unwrap());
        let mut agg = RecordAggregator::new(ReleasePolicy::default(), parser);
        let t0 = Instant::now();
        agg.push(RawLine::new("2024-03-01 10:00:00 ERROR boom", 5), t0);
        agg.push(RawLine::new("java.lang.IllegalStateException: INFO is not a level here", 6), t0);
        agg.push(RawLine::new("\tat com.example.Main.run(Main.java:10)", 7), t0);
        let record = agg.flush().unwrap();

        assert_eq!(record.sequence, 5);
        assert_eq!(record.level, Some(LogLevel::Error));
        assert_eq!(
            record.timestamp.map(|t| t.to_string()),
            Some("2024-03-01 10:00:00".to_string())
        );
        assert_eq!(record.lines[0].style, LineStyle::Level(LogLevel::Error));
        assert_eq!(record.lines[1].style, LineStyle::Plain);
        assert_eq!(record.lines[2].style, LineStyle::Plain);
    }

    #[test]
    fn stack_frames_skip_timestamp_parsing() {
        #[derive(Debug)]
        struct Everything;
        impl TimestampParser for Everything {
            fn parse(&self, _line: &str) -> Option<NaiveDateTime> {
                Some(NaiveDateTime::default())
            }
        }

        let mut agg = RecordAggregator::new(ReleasePolicy::default(), Arc::new(Everything));
        let t0 = Instant::now();
        agg.push(RawLine::new("head", 1), t0);
        let released = agg.push(RawLine::new("\tat frame", 2), t0);
        assert!(released.is_empty());
        assert_eq!(texts(&agg.flush().unwrap()), vec!["head", "\tat frame"]);
    }

    // ========================================================================
    // Invariants
    // ========================================================================

    proptest! {
        #[test]
        fn every_line_is_released_exactly_once_in_order(
            heads in prop::collection::vec(any::<bool>(), 1..200),
            threshold in 2usize..12,
        ) {
            let mut agg = aggregator(threshold);
            let t0 = Instant::now();
            let mut out: Vec<u64> = Vec::new();

            for (i, head) in heads.iter().enumerate() {
                let text = if *head { format!("#{i}") } else { format!("{i}") };
                for record in agg.push(RawLine::new(text, i as u64 + 1), t0) {
                    prop_assert!(record.len() <= threshold);
                    out.extend((0..record.len()).map(|k| record.sequence + k as u64));
                }
            }
            if let Some(record) = agg.poll(t0 + Duration::from_secs(2)) {
                out.extend((0..record.len()).map(|k| record.sequence + k as u64));
            }

            let expected: Vec<u64> = (1..=heads.len() as u64).collect();
            prop_assert_eq!(out, expected);
        }

        #[test]
        fn released_records_never_mix_correlation_ids(
            heads in prop::collection::vec(any::<bool>(), 1..100),
        ) {
            let mut agg = aggregator(1000);
            let t0 = Instant::now();
            let mut records = Vec::new();
            for (i, head) in heads.iter().enumerate() {
                let text = if *head { format!("#{i}") } else { format!("{i}") };
                records.extend(agg.push(RawLine::new(text, i as u64 + 1), t0));
            }
            records.extend(agg.flush());

            for record in records {
                let heads_inside = record.texts().skip(1).filter(|t| t.starts_with('#')).count();
                prop_assert_eq!(heads_inside, 0);
            }
        }
    }
}
