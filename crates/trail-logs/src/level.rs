//! Level detection in log lines.

use once_cell::sync::Lazy;
use regex::Regex;
use trail_proto::LogLevel;

static LEVEL_PATTERNS: Lazy<Vec<(LogLevel, Regex)>> = Lazy::new(|| {
    LogLevel::ALL
        .into_iter()
        .map(|level| {
            let pattern = format!(r"\b{}\b", level.as_str());
            (level, Regex::new(&pattern).unwrap_or_else(|_| unreachable!()))
        })
        .collect()
});

/// Finds the level marker of a log line.
///
/// Each level is located at its last word-bounded occurrence; the level
/// whose occurrence comes first in the line wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct LevelDetector;

impl LevelDetector {
    /// Create a detector.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Detect the level of `line`.
    #[must_use]
    pub fn detect(&self, line: &str) -> Option<LogLevel> {
        LEVEL_PATTERNS
            .iter()
            .filter_map(|(level, pattern)| pattern.find_iter(line).last().map(|m| (m.start(), *level)))
            .min_by_key(|(start, _)| *start)
            .map(|(_, level)| level)
    }
}
