//! Where deliveries addressed to this node end up.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::info;
use trail_proto::{Delivery, DeliveryPayload};

use crate::error::{NodeError, Result};

/// Receives records and events addressed to watchers on this node.
#[async_trait]
pub trait RecordSink: Send + Sync + std::fmt::Debug {
    /// Accept one delivery.
    async fn deliver(&self, delivery: Delivery) -> Result<()>;
}

/// Forwards deliveries into an mpsc channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<Delivery>,
}

impl ChannelSink {
    /// Create a sink and the receiver its deliveries arrive on.
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Delivery>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl RecordSink for ChannelSink {
    async fn deliver(&self, delivery: Delivery) -> Result<()> {
        self.tx
            .send(delivery)
            .await
            .map_err(|_| NodeError::Unavailable("delivery receiver dropped".to_string()))
    }
}

/// Logs every delivery.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingSink;

#[async_trait]
impl RecordSink for LoggingSink {
    async fn deliver(&self, delivery: Delivery) -> Result<()> {
        match &delivery.payload {
            DeliveryPayload::Record(record) => {
                for line in record.texts() {
                    info!(
                        identity = %delivery.identity,
                        destination = %delivery.destination_id,
                        sequence = record.sequence,
                        level = ?record.level,
                        "{line}"
                    );
                }
            }
            DeliveryPayload::Event(event) => {
                info!(
                    identity = %delivery.identity,
                    destination = %delivery.destination_id,
                    event = ?event.kind,
                    message = %event.message,
                    "source event"
                );
            }
        }
        Ok(())
    }
}
