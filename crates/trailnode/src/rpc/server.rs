//! WebSocket listener serving other nodes.
//!
//! Each connection carries [`Frame`]s. Requests are handed to the watch
//! service and answered on the same connection; deliveries go to the
//! node's record sink in arrival order.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message as WsMessage};
use tracing::{debug, info, warn};
use trail_proto::Frame;

use crate::error::Result;
use crate::service::WatchService;
use crate::sink::RecordSink;

/// Replies queued per connection before request handlers wait.
const REPLY_QUEUE: usize = 32;

/// RPC server for node-to-node frames.
#[derive(Debug)]
pub struct RpcServer {
    listener: TcpListener,
    service: Arc<WatchService>,
    sink: Arc<dyn RecordSink>,
}

impl RpcServer {
    /// Create a server on an already bound listener.
    #[must_use]
    pub fn new(listener: TcpListener, service: Arc<WatchService>, sink: Arc<dyn RecordSink>) -> Self {
        Self {
            listener,
            service,
            sink,
        }
    }

    /// Address the listener is bound to.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket has no local address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until a shutdown signal arrives.
    pub async fn serve(self, mut shutdown_rx: mpsc::Receiver<()>) {
        if let Ok(addr) = self.listener.local_addr() {
            info!(addr = %addr, "RPC server listening");
        }

        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            let service = Arc::clone(&self.service);
                            let sink = Arc::clone(&self.sink);
                            tokio::spawn(async move {
                                handle_connection(stream, peer_addr, service, sink).await;
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        info!("RPC server shutting down");
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    service: Arc<WatchService>,
    sink: Arc<dyn RecordSink>,
) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(peer = %peer_addr, error = %e, "WebSocket handshake failed");
            return;
        }
    };
    debug!(peer = %peer_addr, "peer connected");

    let (mut ws_sink, mut ws_stream) = ws_stream.split();
    let (reply_tx, mut reply_rx) = mpsc::channel::<Frame>(REPLY_QUEUE);

    let read_task = async move {
        while let Some(msg_result) = ws_stream.next().await {
            let text = match msg_result {
                Ok(WsMessage::Text(text)) => text,
                Ok(WsMessage::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    warn!(peer = %peer_addr, error = %e, "WebSocket read error");
                    break;
                }
            };

            match Frame::from_json(&text) {
                Ok(Frame::Request { id, body }) => {
                    let service = Arc::clone(&service);
                    let reply_tx = reply_tx.clone();
                    tokio::spawn(async move {
                        let body = service.handle(body).await;
                        let _ = reply_tx.send(Frame::Reply { id, body }).await;
                    });
                }
                Ok(Frame::Delivery { delivery }) => {
                    if let Err(e) = sink.deliver(delivery).await {
                        warn!(peer = %peer_addr, error = %e, "failed to accept delivery");
                    }
                }
                Ok(Frame::Reply { id, .. }) => {
                    debug!(peer = %peer_addr, request_id = %id, "ignoring reply on server link");
                }
                Err(e) => warn!(peer = %peer_addr, error = %e, "Failed to parse frame"),
            }
        }
    };

    let write_task = async move {
        while let Some(frame) = reply_rx.recv().await {
            match frame.to_json() {
                Ok(json) => {
                    if ws_sink.send(WsMessage::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "Failed to serialize reply"),
            }
        }
    };

    tokio::select! {
        () = read_task => {}
        () = write_task => {}
    }
    debug!(peer = %peer_addr, "peer disconnected");
}
