//! The watch registration protocol.
//!
//! A [`WatchService`] owns the three layer registries of a node:
//!
//! - tails, keyed by [`LogIdentity`] and counted by tracking layers
//! - tracking layers, keyed by [`TrackingKey`] and counted by senders
//! - sending layers, keyed by [`SendingKey`]; one per log and watcher
//!
//! Register and unregister calls for one identity run under that
//! identity's lock, so the registries never see a half-built chain from
//! another call.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use tracing::{debug, info, warn};
use trail_logs::{
    AccessGuard, CommandSettings, Grouping, RefRegistry, Release, SourceProfile,
    SupervisionSettings, TailLayer, TrackingLayer, TrackingSettings,
};
use trail_proto::{
    ControlMessage, ControlReply, LogIdentity, RegisterOutcome, TrackingKey, TrackingRequest,
    UnregisterOutcome, WatcherAddress,
};

use crate::config::NodeConfig;
use crate::directory::{LocalLink, PeerDirectory};
use crate::error::{NodeError, Result};
use crate::locks::KeyedLocks;
use crate::sending::{SendingKey, SendingLayer};
use crate::sink::RecordSink;

/// Everything a service needs that can fail to build.
struct EngineSettings {
    guard: Arc<AccessGuard>,
    commands: CommandSettings,
    supervision: SupervisionSettings,
    tracking: TrackingSettings,
    endpoints: HashMap<String, WatcherAddress>,
}

impl EngineSettings {
    fn from_config(config: &NodeConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            guard: Arc::new(config.access.to_guard()?),
            commands: config.adapters.command_settings(),
            supervision: config.adapters.supervision(),
            tracking: config.tracking.settings(),
            endpoints: config.peer_endpoints()?,
        })
    }
}

/// Serves register and unregister calls for logs owned by this node.
#[derive(Debug)]
pub struct WatchService {
    node_name: String,
    guard: Arc<AccessGuard>,
    commands: CommandSettings,
    supervision: SupervisionSettings,
    tracking: TrackingSettings,
    locks: KeyedLocks<LogIdentity>,
    tails: RefRegistry<LogIdentity, TailLayer>,
    trackers: RefRegistry<TrackingKey, TrackingLayer>,
    senders: parking_lot::Mutex<HashMap<SendingKey, SendingLayer>>,
    directory: Arc<PeerDirectory>,
}

impl WatchService {
    /// Build a service and the peer directory it delivers through.
    ///
    /// `local_address` is where other nodes reach this one; deliveries for
    /// watchers at that address go straight to `sink`.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::Config`] if the configuration does not validate.
    pub fn new(
        config: &NodeConfig,
        local_address: WatcherAddress,
        sink: Arc<dyn RecordSink>,
    ) -> Result<Arc<Self>> {
        let settings = EngineSettings::from_config(config)?;
        let node_name = config.node.name.clone();
        let rpc = config.rpc;

        Ok(Arc::new_cyclic(|service: &Weak<Self>| {
            let local = Arc::new(LocalLink::new(service.clone(), sink));
            let directory = Arc::new(PeerDirectory::new(
                node_name.clone(),
                local_address,
                local,
                settings.endpoints,
                rpc,
            ));
            Self {
                node_name,
                guard: settings.guard,
                commands: settings.commands,
                supervision: settings.supervision,
                tracking: settings.tracking,
                locks: KeyedLocks::new(),
                tails: RefRegistry::new(),
                trackers: RefRegistry::new(),
                senders: parking_lot::Mutex::new(HashMap::new()),
                directory,
            }
        }))
    }

    /// Name of this node.
    #[must_use]
    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Directory used to reach watchers and other nodes.
    #[must_use]
    pub const fn directory(&self) -> &Arc<PeerDirectory> {
        &self.directory
    }

    /// Start delivering a log to a watcher.
    ///
    /// # Errors
    ///
    /// Fails if the request is invalid, names a log of another node, or
    /// the access guard rejects the log. Nothing stays registered on error.
    pub async fn register(&self, request: &TrackingRequest) -> Result<RegisterOutcome> {
        request.validate()?;
        self.ensure_local(&request.identity)?;
        let grouping = Grouping::for_request(request)?;

        let key = SendingKey::of(request);
        let _lock = self.locks.lock(&request.identity).await;

        if let Some(existing) = self.senders.lock().get(&key) {
            info!(
                key = %key,
                registered = %existing.tracking_key().mode,
                requested = %request.mode,
                "watcher already registered"
            );
            return Ok(RegisterOutcome::AlreadyRegistered);
        }

        let identity = &request.identity;
        let (tail, tail_created) = self
            .tails
            .find_or_try_insert_with(identity, || self.open_tail(request))?;

        let tracking_key = request.tracking_key();
        let tracker = self.trackers.find_or_try_insert_with(&tracking_key, || {
            TrackingLayer::new(tracking_key.clone(), tail.subscribe(), grouping, self.tracking)
        });
        let (tracker, tracker_created) = match tracker {
            Ok(found) => found,
            Err(e) => {
                if tail_created {
                    self.tails.remove(identity);
                }
                return Err(e.into());
            }
        };
        if tracker_created {
            self.tails.acquire(identity);
        }

        let link = self.directory.link_for_address(&request.watcher);
        let sender = SendingLayer::start(request, tracker.subscribe(), link);
        self.trackers.acquire(&tracking_key);
        self.senders.lock().insert(key.clone(), sender);

        let started = Self::start_layers(&tracker, tracker_created, &tail, tail_created);
        if let Err(e) = started {
            warn!(key = %key, error = %e, "register failed, releasing layers");
            self.teardown(&key).await;
            return Err(e);
        }

        info!(
            key = %key,
            destination = %request.destination_id,
            new_tail = tail_created,
            new_tracking = tracker_created,
            "watcher registered"
        );
        Ok(RegisterOutcome::Registered)
    }

    /// Register several requests, each on its own.
    pub async fn register_all(&self, requests: &[TrackingRequest]) -> Vec<Result<RegisterOutcome>> {
        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            results.push(self.register(request).await);
        }
        results
    }

    /// Stop delivering a log to a watcher.
    ///
    /// Unknown registrations are not an error.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::Protocol`] if the request is invalid.
    pub async fn unregister(&self, request: &TrackingRequest) -> Result<UnregisterOutcome> {
        request.validate()?;
        let key = SendingKey::of(request);
        let _lock = self.locks.lock(&request.identity).await;

        if self.teardown(&key).await {
            info!(key = %key, "watcher unregistered");
            Ok(UnregisterOutcome::Unregistered)
        } else {
            warn!(key = %key, "unregister for unknown watcher");
            Ok(UnregisterOutcome::NotRegistered)
        }
    }

    /// Answer a control message.
    pub async fn handle(&self, message: ControlMessage) -> ControlReply {
        match message {
            ControlMessage::Register { request } => match self.register(&request).await {
                Ok(outcome) => ControlReply::Registered { outcome },
                Err(e) => Self::failure(&request, &e),
            },
            ControlMessage::Unregister { request } => match self.unregister(&request).await {
                Ok(outcome) => ControlReply::Unregistered { outcome },
                Err(e) => Self::failure(&request, &e),
            },
        }
    }

    /// Tear down every registration.
    pub async fn shutdown(&self) {
        let keys: Vec<SendingKey> = self.senders.lock().keys().cloned().collect();
        for key in keys {
            let _lock = self.locks.lock(&key.identity).await;
            self.teardown(&key).await;
        }
        info!(node = %self.node_name, "watch service stopped");
    }

    /// Number of live tails.
    #[must_use]
    pub fn tail_count(&self) -> usize {
        self.tails.len()
    }

    /// Number of live tracking layers.
    #[must_use]
    pub fn tracking_count(&self) -> usize {
        self.trackers.len()
    }

    /// Number of live sending layers.
    #[must_use]
    pub fn sending_count(&self) -> usize {
        self.senders.lock().len()
    }

    /// Tracking layers reading from the tail of `identity`.
    #[must_use]
    pub fn tail_refs(&self, identity: &LogIdentity) -> Option<usize> {
        self.tails.count(identity)
    }

    /// Sending layers reading from the tracking layer `key`.
    #[must_use]
    pub fn tracking_refs(&self, key: &TrackingKey) -> Option<usize> {
        self.trackers.count(key)
    }

    /// The tail of `identity`, if one is live.
    #[must_use]
    pub fn tail(&self, identity: &LogIdentity) -> Option<Arc<TailLayer>> {
        self.tails.get(identity)
    }

    fn ensure_local(&self, identity: &LogIdentity) -> Result<()> {
        if identity.node() == self.node_name {
            Ok(())
        } else {
            Err(NodeError::ForeignNode {
                identity: identity.clone(),
                owner: identity.node().to_string(),
                local: self.node_name.clone(),
            })
        }
    }

    fn open_tail(&self, request: &TrackingRequest) -> trail_logs::Result<TailLayer> {
        let identity = &request.identity;
        let backlog = self
            .commands
            .backlog
            .lines(identity.kind(), request.mode, request.include_backlog);
        let command =
            SourceProfile::of(identity.kind()).follow_command(identity, backlog, &self.commands);
        let guard = identity
            .is_local_file(&self.node_name)
            .then(|| Arc::clone(&self.guard));
        debug!(identity = %identity, command = %command, "opening tail");
        TailLayer::open(
            identity.clone(),
            command,
            guard,
            self.supervision,
            self.tracking.channel_capacity,
        )
    }

    fn start_layers(
        tracker: &TrackingLayer,
        tracker_created: bool,
        tail: &TailLayer,
        tail_created: bool,
    ) -> Result<()> {
        if tracker_created {
            tracker.start()?;
        }
        if tail_created {
            tail.start()?;
        } else if tail.is_violated() {
            tail.resume()?;
        }
        Ok(())
    }

    /// Remove a sending layer and release what it held. Returns whether
    /// the sending layer existed.
    async fn teardown(&self, key: &SendingKey) -> bool {
        let Some(sender) = self.senders.lock().remove(key) else {
            return false;
        };
        let tracking_key = sender.tracking_key().clone();
        sender.stop();

        match self.trackers.release(&tracking_key) {
            Some(Release::Remaining(n)) => {
                debug!(key = %tracking_key, remaining = n, "tracking layer still in use");
            }
            Some(Release::Emptied(tracker)) => {
                if let Err(e) = tracker.stop().await {
                    warn!(key = %tracking_key, error = %e, "failed to stop tracking layer");
                }
                self.release_tail(&key.identity).await;
            }
            None => warn!(key = %tracking_key, "tracking layer missing during teardown"),
        }
        true
    }

    /// Drop one hold on the tail of `identity`. The last hold kills the
    /// follow process before the tail leaves the registry.
    async fn release_tail(&self, identity: &LogIdentity) {
        if self.tails.is_last_hold(identity) {
            if let Some(tail) = self.tails.get(identity) {
                if let Err(e) = tail.stop().await {
                    warn!(identity = %identity, error = %e, "failed to stop tail");
                }
            }
        }
        match self.tails.release(identity) {
            Some(Release::Remaining(n)) => {
                debug!(identity = %identity, remaining = n, "tail still in use");
            }
            Some(Release::Emptied(_)) => info!(identity = %identity, "tail closed"),
            None => warn!(identity = %identity, "tail missing during teardown"),
        }
    }

    fn failure(request: &TrackingRequest, error: &NodeError) -> ControlReply {
        warn!(
            identity = %request.identity,
            watcher = %request.watcher,
            error = %error,
            "control request failed"
        );
        ControlReply::failed(error.failure_code(), error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::mpsc;
    use trail_proto::{Delivery, DeliveryPayload, FailureCode, TrackingMode};

    use crate::sink::ChannelSink;

    const LOCAL: &str = "web-1";

    struct Fixture {
        dir: TempDir,
        service: Arc<WatchService>,
        deliveries: mpsc::Receiver<Delivery>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let mut config = NodeConfig::default();
            config.node.name = LOCAL.to_string();
            config.access.include = vec![format!("{}/**", dir.path().display())];
            config.access.exclude = vec!["**/*.secret".to_string()];
            config.tracking.size_threshold = 2;
            config.tracking.group_timeout_ms = 100;
            config.adapters.restart_delay_ms = 100;

            let (sink, deliveries) = ChannelSink::new(64);
            let service =
                WatchService::new(&config, watcher(), Arc::new(sink)).unwrap();
            Self {
                dir,
                service,
                deliveries,
            }
        }

        fn log(&self, name: &str, content: &str) -> PathBuf {
            let path = self.dir.path().join(name);
            std::fs::write(&path, content).unwrap();
            path
        }

        async fn next(&mut self) -> Delivery {
            tokio::time::timeout(Duration::from_secs(5), self.deliveries.recv())
                .await
                .unwrap()
                .unwrap()
        }
    }

    fn watcher() -> WatcherAddress {
        WatcherAddress::new("127.0.0.1", 7400)
    }

    fn request(path: &Path, destination: &str) -> TrackingRequest {
        TrackingRequest::flat(
            LogIdentity::file(LOCAL, path.display().to_string()),
            watcher(),
            destination,
        )
        .with_backlog(true)
    }

    // ==================== Registration ====================

    #[tokio::test]
    async fn register_delivers_backlog_to_local_sink() {
        let mut fx = Fixture::new();
        let path = fx.log("app.log", "first\nsecond\n");

        let outcome = fx.service.register(&request(&path, "sub-1")).await.unwrap();
        assert_eq!(outcome, RegisterOutcome::Registered);

        let delivery = fx.next().await;
        assert_eq!(delivery.destination_id, "sub-1");
        let DeliveryPayload::Record(record) = delivery.payload else {
            unreachable!("expected a record");
        };
        assert_eq!(record.texts().collect::<Vec<_>>(), vec!["first", "second"]);

        fx.service.shutdown().await;
    }

    #[tokio::test]
    async fn duplicate_register_is_ignored() {
        let fx = Fixture::new();
        let path = fx.log("app.log", "");
        let req = request(&path, "sub-1");

        assert_eq!(
            fx.service.register(&req).await.unwrap(),
            RegisterOutcome::Registered
        );
        assert_eq!(
            fx.service.register(&req).await.unwrap(),
            RegisterOutcome::AlreadyRegistered
        );
        assert_eq!(fx.service.sending_count(), 1);
        assert_eq!(fx.service.tracking_refs(&req.tracking_key()), Some(1));

        fx.service.shutdown().await;
    }

    #[tokio::test]
    async fn layers_are_shared_and_refcounted() {
        let fx = Fixture::new();
        let path = fx.log("app.log", "");
        let first = request(&path, "sub-1");
        let mut second = request(&path, "sub-2");
        second.watcher = WatcherAddress::new("127.0.0.1", 7401);
        let identity = first.identity.clone();

        fx.service.register(&first).await.unwrap();
        fx.service.register(&second).await.unwrap();
        assert_eq!(fx.service.tail_count(), 1);
        assert_eq!(fx.service.tracking_count(), 1);
        assert_eq!(fx.service.sending_count(), 2);
        assert_eq!(fx.service.tail_refs(&identity), Some(1));
        assert_eq!(fx.service.tracking_refs(&first.tracking_key()), Some(2));

        let tail = fx.service.tail(&identity).unwrap();
        assert_eq!(
            fx.service.unregister(&first).await.unwrap(),
            UnregisterOutcome::Unregistered
        );
        assert!(tail.is_running());
        assert_eq!(fx.service.tracking_refs(&first.tracking_key()), Some(1));

        fx.service.unregister(&second).await.unwrap();
        assert!(!tail.is_running());
        assert_eq!(fx.service.tail_count(), 0);
        assert_eq!(fx.service.tracking_count(), 0);
        assert_eq!(fx.service.sending_count(), 0);
    }

    #[tokio::test]
    async fn second_mode_for_same_watcher_is_already_registered() {
        let fx = Fixture::new();
        let path = fx.log("app.log", "");
        let flat = request(&path, "sub-1");
        let grouped =
            TrackingRequest::grouped(flat.identity.clone(), "%H:%M:%S", watcher(), "sub-1");

        assert_eq!(
            fx.service.register(&flat).await.unwrap(),
            RegisterOutcome::Registered
        );
        assert_eq!(
            fx.service.register(&grouped).await.unwrap(),
            RegisterOutcome::AlreadyRegistered
        );
        assert_eq!(fx.service.sending_count(), 1);
        assert_eq!(fx.service.tracking_count(), 1);
        assert_eq!(fx.service.tracking_refs(&flat.tracking_key()), Some(1));
        assert_eq!(fx.service.tracking_refs(&grouped.tracking_key()), None);

        assert_eq!(
            fx.service.unregister(&grouped).await.unwrap(),
            UnregisterOutcome::Unregistered
        );
        assert_eq!(fx.service.tracking_count(), 0);
        assert_eq!(fx.service.tail_count(), 0);
    }

    #[tokio::test]
    async fn modes_share_one_tail() {
        let fx = Fixture::new();
        let path = fx.log("app.log", "");
        let flat = request(&path, "sub-1");
        let grouped = TrackingRequest::grouped(
            flat.identity.clone(),
            "%Y-%m-%d %H:%M:%S",
            WatcherAddress::new("127.0.0.1", 7401),
            "sub-2",
        );

        fx.service.register(&flat).await.unwrap();
        fx.service.register(&grouped).await.unwrap();
        assert_eq!(fx.service.tail_count(), 1);
        assert_eq!(fx.service.tracking_count(), 2);
        assert_eq!(fx.service.tail_refs(&flat.identity), Some(2));

        fx.service.shutdown().await;
        assert_eq!(fx.service.tail_count(), 0);
    }

    #[tokio::test]
    async fn unregister_without_registration_is_ok() {
        let fx = Fixture::new();
        let path = fx.dir.path().join("never.log");
        assert_eq!(
            fx.service.unregister(&request(&path, "sub-1")).await.unwrap(),
            UnregisterOutcome::NotRegistered
        );
    }

    // ==================== Failures ====================

    #[tokio::test]
    async fn denied_path_leaves_nothing_behind() {
        let fx = Fixture::new();
        let path = fx.log("keys.secret", "");

        let result = fx.service.register(&request(&path, "sub-1")).await;
        assert!(matches!(
            result,
            Err(NodeError::Engine(trail_logs::LogError::AccessDenied(_)))
        ));
        assert_eq!(fx.service.tail_count(), 0);
        assert_eq!(fx.service.sending_count(), 0);
    }

    #[tokio::test]
    async fn foreign_identity_is_rejected() {
        let fx = Fixture::new();
        let req = TrackingRequest::flat(
            LogIdentity::remote_file("db-1", "/var/log/pg.log"),
            watcher(),
            "sub-1",
        );
        let reply = fx.service.handle(ControlMessage::register(req)).await;
        assert!(matches!(
            reply,
            ControlReply::Failed { code: FailureCode::ForeignNode, .. }
        ));
    }

    #[tokio::test]
    async fn invalid_timestamp_format_is_an_invalid_request() {
        let fx = Fixture::new();
        let path = fx.log("app.log", "");
        let mut req = request(&path, "sub-1");
        req.mode = TrackingMode::Grouped;
        req.timestamp_format = Some("%Q".to_string());

        let reply = fx.service.handle(ControlMessage::register(req)).await;
        assert!(matches!(
            reply,
            ControlReply::Failed { code: FailureCode::InvalidRequest, .. }
        ));
        assert_eq!(fx.service.tail_count(), 0);
    }

    #[tokio::test]
    async fn register_all_reports_each_request() {
        let fx = Fixture::new();
        let good = fx.log("app.log", "");
        let bad = fx.log("keys.secret", "");
        let results = fx
            .service
            .register_all(&[request(&good, "sub-1"), request(&bad, "sub-2")])
            .await;

        assert!(matches!(results[0], Ok(RegisterOutcome::Registered)));
        assert!(results[1].is_err());
        assert_eq!(fx.service.sending_count(), 1);

        fx.service.shutdown().await;
    }
}
