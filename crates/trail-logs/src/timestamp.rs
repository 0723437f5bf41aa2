//! Timestamp extraction from log lines.

use std::fmt;

use chrono::format::{Item, StrftimeItems};
use chrono::{Local, NaiveDateTime, NaiveTime};

use crate::error::{LogError, Result};

/// How far into a line a timestamp may start.
const MAX_TIMESTAMP_OFFSET: usize = 64;

/// Finds the timestamp that starts a log record.
pub trait TimestampParser: Send + Sync + fmt::Debug {
    /// Parse the timestamp of `line`, or `None` if the line has none.
    fn parse(&self, line: &str) -> Option<NaiveDateTime>;
}

/// Parses timestamps written in a chrono `strftime` format.
///
/// The timestamp may be preceded by a short prefix such as `[` or a thread
/// name; it is searched at the start of each word within the first
/// characters of the line. Formats without a date resolve to today.
#[derive(Debug, Clone)]
pub struct ChronoTimestampParser {
    format: String,
}

impl ChronoTimestampParser {
    /// Create a parser for `format`.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::InvalidTimestampFormat`] if the format is empty or
    /// contains an unknown specifier.
    pub fn new(format: impl Into<String>) -> Result<Self> {
        let format = format.into();
        if format.trim().is_empty() {
            return Err(LogError::InvalidTimestampFormat(
                "format is empty".to_string(),
            ));
        }
        if StrftimeItems::new(&format).any(|item| matches!(item, Item::Error)) {
            return Err(LogError::InvalidTimestampFormat(format));
        }
        Ok(Self { format })
    }

    /// The format string.
    #[must_use]
    pub fn format(&self) -> &str {
        &self.format
    }

    fn parse_at(&self, candidate: &str) -> Option<NaiveDateTime> {
        if let Ok((parsed, _)) = NaiveDateTime::parse_and_remainder(candidate, &self.format) {
            return Some(parsed);
        }
        NaiveTime::parse_and_remainder(candidate, &self.format)
            .ok()
            .map(|(time, _)| Local::now().date_naive().and_time(time))
    }
}

impl TimestampParser for ChronoTimestampParser {
    fn parse(&self, line: &str) -> Option<NaiveDateTime> {
        word_starts(line)
            .take_while(|&pos| pos < MAX_TIMESTAMP_OFFSET)
            .find_map(|pos| self.parse_at(&line[pos..]))
    }
}

/// Byte offsets where a word starts: 0 and every alphanumeric character
/// preceded by a non-alphanumeric one.
fn word_starts(line: &str) -> impl Iterator<Item = usize> + '_ {
    let mut previous_alnum = false;
    line.char_indices().filter_map(move |(pos, c)| {
        let alnum = c.is_alphanumeric();
        let start = pos == 0 || (alnum && !previous_alnum);
        previous_alnum = alnum;
        start.then_some(pos)
    })
}
