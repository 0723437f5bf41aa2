//! A running trail node: watch service plus RPC listener.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use trail_proto::{
    ControlMessage, ControlReply, RegisterOutcome, TrackingRequest, UnregisterOutcome,
    WatcherAddress,
};

use crate::config::NodeConfig;
use crate::error::{NodeError, Result};
use crate::rpc::RpcServer;
use crate::service::WatchService;
use crate::sink::RecordSink;

/// A started node.
///
/// Watch calls are routed to the node owning the log: this node's service
/// directly, other nodes over their RPC link.
#[derive(Debug)]
pub struct TrailNode {
    service: Arc<WatchService>,
    local_addr: SocketAddr,
    shutdown_tx: mpsc::Sender<()>,
    server: JoinHandle<()>,
}

impl TrailNode {
    /// Bind the listener and start serving.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::Config`] for an invalid configuration and
    /// [`NodeError::BindFailed`] if the listen address is taken.
    pub async fn start(config: &NodeConfig, sink: Arc<dyn RecordSink>) -> Result<Self> {
        config.validate()?;

        let listen = config.node.listen.clone();
        let listener = TcpListener::bind(&listen)
            .await
            .map_err(|e| NodeError::BindFailed(listen.clone(), e))?;
        let local_addr = listener.local_addr()?;
        let address = config.node.advertised_address(local_addr)?;

        let service = WatchService::new(config, address, Arc::clone(&sink))?;
        let server = RpcServer::new(listener, Arc::clone(&service), sink);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let server = tokio::spawn(server.serve(shutdown_rx));

        info!(node = %config.node.name, addr = %local_addr, "trail node started");
        Ok(Self {
            service,
            local_addr,
            shutdown_tx,
            server,
        })
    }

    /// Name of this node.
    #[must_use]
    pub fn name(&self) -> &str {
        self.service.node_name()
    }

    /// Address the RPC listener is bound to.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Address watchers on this node register with.
    #[must_use]
    pub fn watcher_address(&self) -> WatcherAddress {
        self.service.directory().local_address().clone()
    }

    /// The local watch service.
    #[must_use]
    pub const fn service(&self) -> &Arc<WatchService> {
        &self.service
    }

    /// Register a watch with the node owning the log.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::Rejected`] if the owning node refused the
    /// request, or a transport error if it could not be reached.
    pub async fn watch(&self, request: TrackingRequest) -> Result<RegisterOutcome> {
        match self.route(ControlMessage::register(request)).await? {
            ControlReply::Registered { outcome } => Ok(outcome),
            other => Err(unexpected(other)),
        }
    }

    /// Register several watches; each result is reported on its own.
    pub async fn watch_all(&self, requests: Vec<TrackingRequest>) -> Vec<Result<RegisterOutcome>> {
        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            results.push(self.watch(request).await);
        }
        results
    }

    /// Remove a watch from the node owning the log.
    ///
    /// # Errors
    ///
    /// Same as [`watch`](Self::watch).
    pub async fn unwatch(&self, request: TrackingRequest) -> Result<UnregisterOutcome> {
        match self.route(ControlMessage::unregister(request)).await? {
            ControlReply::Unregistered { outcome } => Ok(outcome),
            other => Err(unexpected(other)),
        }
    }

    /// Tear down all registrations and stop the listener.
    pub async fn shutdown(self) {
        self.service.shutdown().await;
        let _ = self.shutdown_tx.send(()).await;
        if let Err(e) = self.server.await {
            warn!(error = %e, "RPC server task failed");
        }
        info!("trail node stopped");
    }

    async fn route(&self, message: ControlMessage) -> Result<ControlReply> {
        let owner = message.request().identity.node().to_string();
        let link = self.service.directory().link_for_node(&owner)?;
        match link.request(message).await? {
            ControlReply::Failed { code, message } => Err(NodeError::Rejected { code, message }),
            reply => Ok(reply),
        }
    }
}

fn unexpected(reply: ControlReply) -> NodeError {
    NodeError::UnexpectedReply(format!("{reply:?}"))
}
