//! Links to other nodes.
//!
//! Every node is reached through a [`PeerLink`]. The link to this node is a
//! [`LocalLink`] that calls the local watch service directly; links to
//! other nodes are [`RemoteLink`]s created on first use and cached by
//! endpoint.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;
use trail_proto::{ControlMessage, ControlReply, Delivery, WatcherAddress};

use crate::config::RpcConfig;
use crate::error::{NodeError, Result};
use crate::rpc::RemoteLink;
use crate::service::WatchService;
use crate::sink::RecordSink;

/// A channel to one node.
#[async_trait]
pub trait PeerLink: Send + Sync + std::fmt::Debug {
    /// Send a control request and wait for its reply.
    async fn request(&self, message: ControlMessage) -> Result<ControlReply>;

    /// Hand a delivery to the node without waiting for it to be processed.
    async fn deliver(&self, delivery: Delivery) -> Result<()>;
}

/// Link to this node.
#[derive(Debug)]
pub struct LocalLink {
    service: Weak<WatchService>,
    sink: Arc<dyn RecordSink>,
}

impl LocalLink {
    /// Create the link; `service` is the service owning the directory.
    #[must_use]
    pub fn new(service: Weak<WatchService>, sink: Arc<dyn RecordSink>) -> Self {
        Self { service, sink }
    }
}

#[async_trait]
impl PeerLink for LocalLink {
    async fn request(&self, message: ControlMessage) -> Result<ControlReply> {
        let service = self
            .service
            .upgrade()
            .ok_or_else(|| NodeError::Unavailable("local watch service stopped".to_string()))?;
        Ok(service.handle(message).await)
    }

    async fn deliver(&self, delivery: Delivery) -> Result<()> {
        self.sink.deliver(delivery).await
    }
}

/// Resolves node names and watcher addresses to links.
#[derive(Debug)]
pub struct PeerDirectory {
    local_name: String,
    local_address: WatcherAddress,
    local: Arc<LocalLink>,
    endpoints: HashMap<String, WatcherAddress>,
    rpc: RpcConfig,
    links: Mutex<HashMap<WatcherAddress, Arc<RemoteLink>>>,
}

impl PeerDirectory {
    /// Create a directory.
    #[must_use]
    pub fn new(
        local_name: impl Into<String>,
        local_address: WatcherAddress,
        local: Arc<LocalLink>,
        endpoints: HashMap<String, WatcherAddress>,
        rpc: RpcConfig,
    ) -> Self {
        Self {
            local_name: local_name.into(),
            local_address,
            local,
            endpoints,
            rpc,
            links: Mutex::new(HashMap::new()),
        }
    }

    /// Name of this node.
    #[must_use]
    pub fn local_name(&self) -> &str {
        &self.local_name
    }

    /// Address other nodes deliver to.
    #[must_use]
    pub const fn local_address(&self) -> &WatcherAddress {
        &self.local_address
    }

    /// Link to the node called `name`.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::UnknownPeer`] if no endpoint is configured.
    pub fn link_for_node(&self, name: &str) -> Result<Arc<dyn PeerLink>> {
        if name == self.local_name {
            return Ok(self.local.clone());
        }
        let address = self
            .endpoints
            .get(name)
            .ok_or_else(|| NodeError::UnknownPeer(name.to_string()))?;
        Ok(self.link_for_address(address))
    }

    /// Link to whoever listens on `address`.
    #[must_use]
    pub fn link_for_address(&self, address: &WatcherAddress) -> Arc<dyn PeerLink> {
        if *address == self.local_address {
            return self.local.clone();
        }
        let mut links = self.links.lock();
        let link = links.entry(address.clone()).or_insert_with(|| {
            debug!(endpoint = %address, "creating peer link");
            Arc::new(RemoteLink::new(address.clone(), self.rpc))
        });
        link.clone()
    }

    /// Number of cached remote links.
    #[must_use]
    pub fn remote_links(&self) -> usize {
        self.links.lock().len()
    }
}
