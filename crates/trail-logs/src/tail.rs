//! Tail layer: one follow process per log identity.
//!
//! The tail stamps every line with a sequence number and hands lines and
//! lifecycle events to each subscriber over its own bounded queue. A slow
//! subscriber holds the pump back instead of losing lines, and the follow
//! process in turn blocks on its output pipe. For local files it re-runs
//! the access guard whenever the file behind the path may have changed
//! (appeared, rotated, truncated) and shuts the source down on violation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use trail_proto::{LifecycleEvent, LogIdentity};

use crate::error::{LogError, Result};
use crate::guard::AccessGuard;
use crate::origin::{OriginAdapter, OriginOutput, SupervisionSettings};
use crate::profile::FollowCommand;
use crate::types::{RawLine, TailItem};

/// Capacity of the queue between the follow process and the tail.
const ORIGIN_QUEUE: usize = 256;

/// Source of raw lines and lifecycle events for one log.
pub struct TailLayer {
    identity: LogIdentity,
    adapter: Arc<OriginAdapter>,
    subscribers: Subscribers,
    capacity: usize,
    guard: Option<Arc<AccessGuard>>,
    violated: Arc<AtomicBool>,
    sequence: Arc<AtomicU64>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

type Subscribers = Arc<Mutex<Vec<mpsc::Sender<TailItem>>>>;

impl std::fmt::Debug for TailLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TailLayer")
            .field("identity", &self.identity)
            .field("adapter", &self.adapter)
            .field("violated", &self.is_violated())
            .finish_non_exhaustive()
    }
}

impl TailLayer {
    /// Create a tail that is not started yet.
    ///
    /// When `guard` is set the identity's path is checked before anything
    /// else happens, and again on every file change reported by the source.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::AccessDenied`] if the guard rejects the path.
    pub fn open(
        identity: LogIdentity,
        command: FollowCommand,
        guard: Option<Arc<AccessGuard>>,
        supervision: SupervisionSettings,
        capacity: usize,
    ) -> Result<Self> {
        if let Some(guard) = &guard {
            guard.check_access(identity.target())?;
        }

        let adapter = Arc::new(OriginAdapter::new(identity.clone(), command, supervision));

        Ok(Self {
            identity,
            adapter,
            subscribers: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
            guard,
            violated: Arc::new(AtomicBool::new(false)),
            sequence: Arc::new(AtomicU64::new(0)),
            pump: Mutex::new(None),
        })
    }

    /// The log followed by this tail.
    #[must_use]
    pub const fn identity(&self) -> &LogIdentity {
        &self.identity
    }

    /// The follow process supervisor.
    #[must_use]
    pub fn adapter(&self) -> &OriginAdapter {
        &self.adapter
    }

    /// Whether the source was shut down by an access violation.
    #[must_use]
    pub fn is_violated(&self) -> bool {
        self.violated.load(Ordering::SeqCst)
    }

    /// Whether the follow process is meant to be running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.adapter.is_active()
    }

    /// Subscribe to lines and events published from now on.
    ///
    /// The pump waits for every subscriber, so a receiver must be drained
    /// or dropped.
    #[must_use]
    pub fn subscribe(&self) -> mpsc::Receiver<TailItem> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.subscribers.lock().push(tx);
        rx
    }

    /// Number of subscribers still receiving.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().iter().filter(|s| !s.is_closed()).count()
    }

    /// Start the follow process.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::AlreadyStarted`] if the tail is running.
    pub fn start(&self) -> Result<()> {
        let mut pump = self.pump.lock();
        if self.adapter.is_active() {
            return Err(LogError::AlreadyStarted(self.identity.to_string()));
        }

        let (tx, rx) = mpsc::channel(ORIGIN_QUEUE);
        self.adapter.start(tx)?;

        let task = Pump {
            identity: self.identity.clone(),
            adapter: Arc::clone(&self.adapter),
            subscribers: Arc::clone(&self.subscribers),
            guard: self.guard.clone(),
            violated: Arc::clone(&self.violated),
            sequence: Arc::clone(&self.sequence),
        };
        *pump = Some(tokio::spawn(task.run(rx)));
        info!(identity = %self.identity, command = %self.adapter.command(), "tail started");
        Ok(())
    }

    /// Re-check access and restart a tail shut down by a violation.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::AccessDenied`] if the path is still rejected.
    pub fn resume(&self) -> Result<()> {
        if let Some(guard) = &self.guard {
            guard.check_access(self.identity.target())?;
        }
        self.violated.store(false, Ordering::SeqCst);
        info!(identity = %self.identity, "resuming tail after access violation");
        self.start()
    }

    /// Kill the follow process and wait until everything it produced has
    /// been published.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::Task`] if a background task panicked.
    pub async fn stop(&self) -> Result<()> {
        self.adapter.stop().await?;
        let pump = self.pump.lock().take();
        if let Some(pump) = pump {
            pump.await.map_err(|e| LogError::Task(e.to_string()))?;
        }
        debug!(identity = %self.identity, "tail stopped");
        Ok(())
    }
}

struct Pump {
    identity: LogIdentity,
    adapter: Arc<OriginAdapter>,
    subscribers: Subscribers,
    guard: Option<Arc<AccessGuard>>,
    violated: Arc<AtomicBool>,
    sequence: Arc<AtomicU64>,
}

impl Pump {
    async fn run(self, mut rx: mpsc::Receiver<OriginOutput>) {
        let mut denial = None;

        while let Some(output) = rx.recv().await {
            let item = match output {
                OriginOutput::Line(text) => {
                    let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
                    TailItem::Line(RawLine::new(text, sequence))
                }
                OriginOutput::Event(event) => {
                    if let Some(reason) = self.recheck(&event) {
                        denial = Some(reason);
                        break;
                    }
                    TailItem::Event(event)
                }
            };
            self.publish(item).await;
        }

        let Some(reason) = denial else {
            return;
        };

        self.violated.store(true, Ordering::SeqCst);
        drop(rx);
        if let Err(e) = self.adapter.stop().await {
            warn!(identity = %self.identity, error = %e, "failed to stop violated source");
        }
        warn!(identity = %self.identity, reason = %reason, "access violation, source stopped");
        self.publish(TailItem::Event(LifecycleEvent::access_violation(reason)))
            .await;
    }

    /// Hand `item` to every subscriber, waiting for room in each queue.
    async fn publish(&self, item: TailItem) {
        let targets = self.subscribers.lock().clone();
        let mut closed = false;
        for target in &targets {
            if target.send(item.clone()).await.is_err() {
                closed = true;
            }
        }
        if closed {
            self.subscribers.lock().retain(|s| !s.is_closed());
            debug!(identity = %self.identity, "dropped closed subscribers");
        }
    }

    /// Returns the denial reason if `event` means the file changed and the
    /// new file is no longer allowed.
    fn recheck(&self, event: &LifecycleEvent) -> Option<String> {
        let guard = self.guard.as_ref()?;
        if !event.kind.requires_access_check() {
            return None;
        }
        match guard.check_access(self.identity.target()) {
            Ok(_) => None,
            Err(e) => Some(e.to_string()),
        }
    }
}
