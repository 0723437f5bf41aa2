//! Outgoing node link over WebSocket.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use trail_proto::{ControlMessage, ControlReply, Delivery, Frame, RequestId, WatcherAddress};

use crate::config::RpcConfig;
use crate::directory::PeerLink;
use crate::error::{NodeError, Result};

type Pending = Arc<Mutex<HashMap<RequestId, oneshot::Sender<ControlReply>>>>;

/// Link to another node, connected on first use.
///
/// Frames are queued on an mpsc channel drained by a writer task; a reader
/// task matches replies to waiting requests. A dropped connection is
/// re-established by the next call.
#[derive(Debug)]
pub struct RemoteLink {
    endpoint: WatcherAddress,
    rpc: RpcConfig,
    outbound: tokio::sync::Mutex<Option<mpsc::Sender<Frame>>>,
    pending: Pending,
}

impl RemoteLink {
    /// Create an unconnected link.
    #[must_use]
    pub fn new(endpoint: WatcherAddress, rpc: RpcConfig) -> Self {
        Self {
            endpoint,
            rpc,
            outbound: tokio::sync::Mutex::new(None),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The peer's address.
    #[must_use]
    pub const fn endpoint(&self) -> &WatcherAddress {
        &self.endpoint
    }

    /// Whether a connection is currently open.
    pub async fn is_connected(&self) -> bool {
        self.outbound
            .lock()
            .await
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    async fn sender(&self) -> Result<mpsc::Sender<Frame>> {
        let mut outbound = self.outbound.lock().await;
        if let Some(tx) = outbound.as_ref().filter(|tx| !tx.is_closed()) {
            return Ok(tx.clone());
        }

        let tx = self.connect().await?;
        *outbound = Some(tx.clone());
        Ok(tx)
    }

    async fn connect(&self) -> Result<mpsc::Sender<Frame>> {
        let url = format!("ws://{}", self.endpoint);
        debug!(url = %url, "connecting to peer");

        let (ws_stream, _) = timeout(self.rpc.request_timeout(), connect_async(url.as_str()))
            .await
            .map_err(|_| NodeError::Unavailable(format!("connection to {url} timed out")))?
            .map_err(|e| NodeError::Unavailable(format!("connection to {url} failed: {e}")))?;

        info!(endpoint = %self.endpoint, "connected to peer");

        let (mut write, mut read) = ws_stream.split();
        let (tx, mut rx) = mpsc::channel::<Frame>(self.rpc.outbound_queue);

        let (closed_tx, mut closed_rx) = oneshot::channel::<()>();

        let endpoint = self.endpoint.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    frame = rx.recv() => frame,
                    _ = &mut closed_rx => None,
                };
                let Some(frame) = frame else {
                    break;
                };
                let json = match frame.to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(endpoint = %endpoint, error = %e, "failed to encode frame");
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(json)).await {
                    warn!(endpoint = %endpoint, error = %e, "send error, closing link");
                    break;
                }
            }
            let _ = write.close().await;
        });

        let endpoint = self.endpoint.clone();
        let pending = Arc::clone(&self.pending);
        tokio::spawn(async move {
            while let Some(message) = read.next().await {
                match message {
                    Ok(Message::Text(text)) => match Frame::from_json(&text) {
                        Ok(Frame::Reply { id, body }) => {
                            if let Some(waiter) = pending.lock().remove(&id) {
                                let _ = waiter.send(body);
                            } else {
                                debug!(endpoint = %endpoint, request_id = %id, "reply for unknown request");
                            }
                        }
                        Ok(_) => debug!(endpoint = %endpoint, "ignoring unexpected frame"),
                        Err(e) => warn!(endpoint = %endpoint, error = %e, "failed to decode frame"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(endpoint = %endpoint, error = %e, "websocket error");
                        break;
                    }
                }
            }
            info!(endpoint = %endpoint, "peer link closed");
            // waiters see a closed channel instead of timing out
            pending.lock().clear();
            let _ = closed_tx.send(());
        });

        Ok(tx)
    }
}

#[async_trait]
impl PeerLink for RemoteLink {
    async fn request(&self, message: ControlMessage) -> Result<ControlReply> {
        let tx = self.sender().await?;
        let id = RequestId::new();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.lock().insert(id, reply_tx);

        if tx.send(Frame::Request { id, body: message }).await.is_err() {
            self.pending.lock().remove(&id);
            return Err(NodeError::Unavailable(format!(
                "link to {} is closed",
                self.endpoint
            )));
        }

        match timeout(self.rpc.request_timeout(), reply_rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(NodeError::Unavailable(format!(
                "link to {} closed before the reply",
                self.endpoint
            ))),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(NodeError::Timeout(id))
            }
        }
    }

    async fn deliver(&self, delivery: Delivery) -> Result<()> {
        let tx = self.sender().await?;
        tx.send(Frame::Delivery { delivery })
            .await
            .map_err(|_| NodeError::Unavailable(format!("link to {} is closed", self.endpoint)))
    }
}
