//! Per-watcher forwarding of tracked records.

use std::fmt;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use trail_logs::TrackingItem;
use trail_proto::{
    Delivery, DeliveryPayload, LogIdentity, TrackingKey, TrackingRequest, WatcherAddress,
};

use crate::directory::PeerLink;

/// Identifies one sending layer: a log and the watcher it feeds.
///
/// A watcher gets at most one sending layer per log, whatever mode it
/// asked for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SendingKey {
    /// The tracked log.
    pub identity: LogIdentity,
    /// Where records go.
    pub watcher: WatcherAddress,
}

impl SendingKey {
    /// Key of a request.
    #[must_use]
    pub fn of(request: &TrackingRequest) -> Self {
        Self {
            identity: request.identity.clone(),
            watcher: request.watcher.clone(),
        }
    }
}

impl fmt::Display for SendingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.identity, self.watcher)
    }
}

/// Forwards one tracking layer's output to one watcher.
#[derive(Debug)]
pub struct SendingLayer {
    key: SendingKey,
    tracking_key: TrackingKey,
    destination_id: String,
    task: JoinHandle<()>,
}

impl SendingLayer {
    /// Spawn the forwarding task.
    #[must_use]
    pub fn start(
        request: &TrackingRequest,
        source: broadcast::Receiver<TrackingItem>,
        link: Arc<dyn PeerLink>,
    ) -> Self {
        let key = SendingKey::of(request);
        let tracking_key = request.tracking_key();
        let destination_id = request.destination_id.clone();
        let task = tokio::spawn(forward(
            key.clone(),
            destination_id.clone(),
            source,
            link,
        ));
        info!(key = %key, mode = %tracking_key.mode, destination = %destination_id, "sending started");
        Self {
            key,
            tracking_key,
            destination_id,
            task,
        }
    }

    /// The key this layer is registered under.
    #[must_use]
    pub const fn key(&self) -> &SendingKey {
        &self.key
    }

    /// The tracking layer this sender reads from.
    #[must_use]
    pub const fn tracking_key(&self) -> &TrackingKey {
        &self.tracking_key
    }

    /// Watcher-side subscription id.
    #[must_use]
    pub fn destination_id(&self) -> &str {
        &self.destination_id
    }

    /// Whether the forwarding task has ended.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Abort the forwarding task.
    pub fn stop(self) {
        self.task.abort();
        debug!(key = %self.key, "sending stopped");
    }
}

async fn forward(
    key: SendingKey,
    destination_id: String,
    mut source: broadcast::Receiver<TrackingItem>,
    link: Arc<dyn PeerLink>,
) {
    let mut failing = false;
    loop {
        let payload = match source.recv().await {
            Ok(TrackingItem::Record(record)) => DeliveryPayload::Record(record),
            Ok(TrackingItem::Event(event)) => DeliveryPayload::Event(event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(key = %key, skipped, "watcher fell behind, records dropped");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        let delivery = Delivery {
            identity: key.identity.clone(),
            destination_id: destination_id.clone(),
            payload,
        };
        match link.deliver(delivery).await {
            Ok(()) if failing => {
                info!(key = %key, "delivery recovered");
                failing = false;
            }
            Ok(()) => {}
            Err(e) if !failing => {
                warn!(key = %key, error = %e, "delivery failed");
                failing = true;
            }
            Err(_) => {}
        }
    }
    debug!(key = %key, "tracking source closed");
}
