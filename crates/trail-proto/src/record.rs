//! Records and lifecycle events delivered to watchers.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::error::ProtoError;

/// Severity level found in a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    /// Trace level.
    Trace,
    /// Debug level.
    Debug,
    /// Info level.
    Info,
    /// Warning level.
    Warn,
    /// Error level.
    Error,
    /// Fatal level.
    Fatal,
}

impl LogLevel {
    /// Every level, least severe first.
    pub const ALL: [Self; 6] = [
        Self::Trace,
        Self::Debug,
        Self::Info,
        Self::Warn,
        Self::Error,
        Self::Fatal,
    ];

    /// The marker as it appears in log text.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "TRACE",
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
            Self::Fatal => "FATAL",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|level| level.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ProtoError::Validation(format!("unknown log level: {s}")))
    }
}

/// How a line should be rendered by the watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineStyle {
    /// The line carries this level.
    Level(LogLevel),
    /// Ordinary text.
    Plain,
    /// Part of an XML document.
    Xml,
}

/// One line of a record with its style.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StyledLine {
    /// Line text without trailing newline.
    pub text: String,
    /// Rendering style.
    pub style: LineStyle,
}

impl StyledLine {
    /// Create a styled line.
    #[must_use]
    pub fn new(text: impl Into<String>, style: LineStyle) -> Self {
        Self {
            text: text.into(),
            style,
        }
    }
}

/// A logical log record: one or more lines released together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Lines in source order.
    pub lines: Vec<StyledLine>,
    /// Level of the first line, if any was detected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<LogLevel>,
    /// Timestamp of the first line, if it had one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<NaiveDateTime>,
    /// Sequence number of the first line.
    pub sequence: u64,
}

impl Record {
    /// Number of lines.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Whether the record has no lines.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Iterate over the line texts.
    pub fn texts(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(|l| l.text.as_str())
    }
}

/// Kinds of lifecycle events raised while tailing a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleKind {
    /// The source does not exist (yet).
    NotFound,
    /// The source appeared or became accessible.
    Appeared,
    /// The source was replaced by a new file.
    Rotated,
    /// The source became inaccessible.
    Disappeared,
    /// The source was truncated.
    Truncated,
    /// Diagnostic output that matched no known phrase.
    Unrecognized,
    /// The source resolves to a location outside the access policy.
    AccessViolation,
    /// The follow process could not be started.
    SourceFailed,
}

impl LifecycleKind {
    /// Events after which the source path may point somewhere new.
    #[must_use]
    pub const fn requires_access_check(self) -> bool {
        matches!(self, Self::Appeared | Self::Rotated | Self::Truncated)
    }
}

/// A lifecycle event with the text that caused it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    /// Event kind.
    pub kind: LifecycleKind,
    /// Human-readable detail.
    pub message: String,
}

impl LifecycleEvent {
    /// Create an event.
    #[must_use]
    pub fn new(kind: LifecycleKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// An access violation event.
    #[must_use]
    pub fn access_violation(message: impl Into<String>) -> Self {
        Self::new(LifecycleKind::AccessViolation, message)
    }
}
