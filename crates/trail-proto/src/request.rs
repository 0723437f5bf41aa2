//! Tracking requests exchanged between nodes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ProtoError, Result};
use crate::identity::LogIdentity;

/// How raw lines are turned into records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingMode {
    /// Lines are grouped into multi-line records by timestamp.
    Grouped,
    /// Lines are batched without boundary detection.
    Flat,
}

impl TrackingMode {
    /// Short name used as a tracking id prefix.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Grouped => "group",
            Self::Flat => "flat",
        }
    }
}

impl fmt::Display for TrackingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Network address where a watcher receives deliveries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WatcherAddress {
    /// Host name or IP address.
    pub host: String,
    /// Listening port.
    pub port: u16,
}

impl WatcherAddress {
    /// Create a new address.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl FromStr for WatcherAddress {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| ProtoError::InvalidAddress(s.to_string()))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(ProtoError::InvalidAddress(s.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| ProtoError::InvalidAddress(s.to_string()))?;
        Ok(Self::new(host, port))
    }
}

impl fmt::Display for WatcherAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Key of a tracking layer: one per log and mode.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TrackingKey {
    /// The tracked log.
    pub identity: LogIdentity,
    /// Grouping mode.
    pub mode: TrackingMode,
}

impl fmt::Display for TrackingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.mode, self.identity)
    }
}

/// A request to start or stop delivering a log to a watcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingRequest {
    /// Log to track.
    pub identity: LogIdentity,
    /// Grouping mode.
    pub mode: TrackingMode,
    /// Timestamp format of the log's first record lines (chrono syntax).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp_format: Option<String>,
    /// Where records are delivered.
    pub watcher: WatcherAddress,
    /// Watcher-side subscription id attached to every delivery.
    pub destination_id: String,
    /// Whether the last lines of the log should be sent first.
    #[serde(default)]
    pub include_backlog: bool,
}

impl TrackingRequest {
    /// A flat tracking request.
    #[must_use]
    pub fn flat(
        identity: LogIdentity,
        watcher: WatcherAddress,
        destination_id: impl Into<String>,
    ) -> Self {
        Self {
            identity,
            mode: TrackingMode::Flat,
            timestamp_format: None,
            watcher,
            destination_id: destination_id.into(),
            include_backlog: false,
        }
    }

    /// A grouped tracking request.
    #[must_use]
    pub fn grouped(
        identity: LogIdentity,
        timestamp_format: impl Into<String>,
        watcher: WatcherAddress,
        destination_id: impl Into<String>,
    ) -> Self {
        Self {
            identity,
            mode: TrackingMode::Grouped,
            timestamp_format: Some(timestamp_format.into()),
            watcher,
            destination_id: destination_id.into(),
            include_backlog: false,
        }
    }

    /// Ask for the backlog.
    #[must_use]
    pub fn with_backlog(mut self, include: bool) -> Self {
        self.include_backlog = include;
        self
    }

    /// Key of the tracking layer serving this request.
    #[must_use]
    pub fn tracking_key(&self) -> TrackingKey {
        TrackingKey {
            identity: self.identity.clone(),
            mode: self.mode,
        }
    }

    /// Validate the request.
    ///
    /// # Errors
    ///
    /// Returns [`ProtoError::Validation`] if the destination id or watcher
    /// host is empty, the port is zero, or a grouped request has no
    /// timestamp format.
    pub fn validate(&self) -> Result<()> {
        if self.destination_id.is_empty() {
            return Err(ProtoError::Validation(
                "destination id cannot be empty".to_string(),
            ));
        }

        if self.watcher.host.is_empty() || self.watcher.port == 0 {
            return Err(ProtoError::Validation(format!(
                "watcher address '{}' is not routable",
                self.watcher
            )));
        }

        let has_format = self
            .timestamp_format
            .as_deref()
            .is_some_and(|f| !f.trim().is_empty());
        if self.mode == TrackingMode::Grouped && !has_format {
            return Err(ProtoError::Validation(format!(
                "grouped tracking of '{}' requires a timestamp format",
                self.identity
            )));
        }

        Ok(())
    }
}
