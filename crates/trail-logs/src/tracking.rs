//! Tracking layer: records for one (log, mode) pair.
//!
//! A tracking layer drains one tail subscription and runs a single task
//! that feeds lines into a [`RecordAggregator`] (grouped mode) or a
//! [`FlatBatcher`] (flat mode). The task also ticks on a short interval so
//! idle groups are released without new input. Released records and the
//! tail's lifecycle events are published on a broadcast channel that the
//! sending layers subscribe to.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};
use trail_proto::{Record, TrackingKey, TrackingMode, TrackingRequest};

use crate::aggregator::{RecordAggregator, ReleasePolicy};
use crate::batcher::FlatBatcher;
use crate::error::{LogError, Result};
use crate::timestamp::{ChronoTimestampParser, TimestampParser};
use crate::types::{TailItem, TrackingItem};

/// Settings shared by all tracking layers of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackingSettings {
    /// When groups are released.
    pub policy: ReleasePolicy,
    /// How often idle groups are checked.
    pub poll_interval: Duration,
    /// Capacity of the tail queue and of the record broadcast channel.
    pub channel_capacity: usize,
}

impl Default for TrackingSettings {
    fn default() -> Self {
        Self {
            policy: ReleasePolicy::default(),
            poll_interval: Duration::from_millis(50),
            channel_capacity: 1024,
        }
    }
}

impl TrackingSettings {
    /// Validate the settings.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::InvalidSettings`] for out-of-range values.
    pub fn validate(&self) -> Result<()> {
        self.policy.validate()?;
        if self.poll_interval.is_zero() {
            return Err(LogError::InvalidSettings(
                "poll interval must be greater than 0".to_string(),
            ));
        }
        if self.channel_capacity == 0 {
            return Err(LogError::InvalidSettings(
                "channel capacity must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// How lines are turned into records.
#[derive(Debug, Clone)]
pub enum Grouping {
    /// Multi-line records delimited by timestamps.
    Grouped(Arc<dyn TimestampParser>),
    /// Size and time based batches.
    Flat,
}

impl Grouping {
    /// Grouping for a watch request.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::InvalidTimestampFormat`] if a grouped request has
    /// no usable timestamp format.
    pub fn for_request(request: &TrackingRequest) -> Result<Self> {
        match request.mode {
            TrackingMode::Flat => Ok(Self::Flat),
            TrackingMode::Grouped => {
                let format = request.timestamp_format.as_deref().unwrap_or_default();
                let parser = ChronoTimestampParser::new(format)?;
                Ok(Self::Grouped(Arc::new(parser)))
            }
        }
    }
}

enum Grouper {
    Grouped(RecordAggregator),
    Flat(FlatBatcher),
}

impl Grouper {
    fn new(grouping: Grouping, policy: ReleasePolicy) -> Self {
        match grouping {
            Grouping::Grouped(parser) => Self::Grouped(RecordAggregator::new(policy, parser)),
            Grouping::Flat => Self::Flat(FlatBatcher::new(policy)),
        }
    }

    fn push(&mut self, line: crate::types::RawLine, now: Instant) -> Vec<Record> {
        match self {
            Self::Grouped(aggregator) => aggregator.push(line, now),
            Self::Flat(batcher) => batcher.push(line, now).into_iter().collect(),
        }
    }

    fn poll(&mut self, now: Instant) -> Option<Record> {
        match self {
            Self::Grouped(aggregator) => aggregator.poll(now),
            Self::Flat(batcher) => batcher.poll(now),
        }
    }

    fn flush(&mut self) -> Option<Record> {
        match self {
            Self::Grouped(aggregator) => aggregator.flush(),
            Self::Flat(batcher) => batcher.flush(),
        }
    }
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Record source for one (log, mode) pair.
pub struct TrackingLayer {
    key: TrackingKey,
    settings: TrackingSettings,
    sender: broadcast::Sender<TrackingItem>,
    pending: Mutex<Option<(mpsc::Receiver<TailItem>, Grouping)>>,
    running: Mutex<Option<Running>>,
}

impl std::fmt::Debug for TrackingLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackingLayer")
            .field("key", &self.key)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl TrackingLayer {
    /// Create a tracking layer over a tail subscription; nothing runs until
    /// [`start`](Self::start).
    ///
    /// # Errors
    ///
    /// Returns [`LogError::InvalidSettings`] if `settings` are out of range.
    pub fn new(
        key: TrackingKey,
        source: mpsc::Receiver<TailItem>,
        grouping: Grouping,
        settings: TrackingSettings,
    ) -> Result<Self> {
        settings.validate()?;
        let (sender, _) = broadcast::channel(settings.channel_capacity);
        Ok(Self {
            key,
            settings,
            sender,
            pending: Mutex::new(Some((source, grouping))),
            running: Mutex::new(None),
        })
    }

    /// The (log, mode) pair served.
    #[must_use]
    pub const fn key(&self) -> &TrackingKey {
        &self.key
    }

    /// Whether the grouping task is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Subscribe to records and events published from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TrackingItem> {
        self.sender.subscribe()
    }

    /// Start the grouping task.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::AlreadyStarted`] if the layer was started before.
    pub fn start(&self) -> Result<()> {
        let Some((source, grouping)) = self.pending.lock().take() else {
            return Err(LogError::AlreadyStarted(self.key.to_string()));
        };

        let cancel = CancellationToken::new();
        let driver = Driver {
            key: self.key.clone(),
            grouper: Grouper::new(grouping, self.settings.policy),
            sender: self.sender.clone(),
            poll_interval: self.settings.poll_interval,
        };
        let task = tokio::spawn(driver.run(source, cancel.clone()));
        *self.running.lock() = Some(Running { cancel, task });

        info!(key = %self.key, "tracking started");
        Ok(())
    }

    /// Stop the grouping task, publishing whatever was still buffered.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::Task`] if the task panicked.
    pub async fn stop(&self) -> Result<()> {
        let running = self.running.lock().take();
        if let Some(running) = running {
            running.cancel.cancel();
            running
                .task
                .await
                .map_err(|e| LogError::Task(e.to_string()))?;
            debug!(key = %self.key, "tracking stopped");
        }
        Ok(())
    }
}

struct Driver {
    key: TrackingKey,
    grouper: Grouper,
    sender: broadcast::Sender<TrackingItem>,
    poll_interval: Duration,
}

impl Driver {
    async fn run(mut self, mut source: mpsc::Receiver<TailItem>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                item = source.recv() => match item {
                    Some(TailItem::Line(line)) => {
                        for record in self.grouper.push(line, Instant::now()) {
                            self.publish(TrackingItem::Record(record));
                        }
                    }
                    Some(TailItem::Event(event)) => {
                        debug!(key = %self.key, event = ?event.kind, "passing lifecycle event");
                        self.publish(TrackingItem::Event(event));
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    if let Some(record) = self.grouper.poll(Instant::now()) {
                        self.publish(TrackingItem::Record(record));
                    }
                }
            }
        }

        if let Some(record) = self.grouper.flush() {
            self.publish(TrackingItem::Record(record));
        }
    }

    fn publish(&self, item: TrackingItem) {
        if let TrackingItem::Record(record) = &item {
            trace!(key = %self.key, sequence = record.sequence, lines = record.len(), "record released");
        }
        let _ = self.sender.send(item);
    }
}
