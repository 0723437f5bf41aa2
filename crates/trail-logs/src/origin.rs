//! Process-backed log sources.
//!
//! An [`OriginAdapter`] runs one follow command (`tail -F`, `docker logs
//! --follow`, `kubectl logs --follow`) and turns its output into
//! [`OriginOutput`]s: stdout lines become [`OriginOutput::Line`], stderr
//! lines are classified by the source profile into lifecycle events.
//!
//! The process exiting is not a terminal failure. While the adapter is
//! meant to run, an exited or unstartable process is restarted after a
//! fixed delay until [`OriginAdapter::stop`] is called.

use std::fmt;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::io::AsyncRead;
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, FramedRead};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use trail_proto::{LifecycleEvent, LifecycleKind, LogIdentity};

use crate::error::{LogError, Result};
use crate::profile::{FollowCommand, SourceProfile};

/// Longest line accepted from a follow process; longer lines are dropped.
pub const MAX_LINE_LENGTH: usize = 1024 * 1024;

/// Lifecycle state of an adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    /// Created, never started.
    Init,
    /// The follow process is running.
    Running,
    /// Waiting to respawn the follow process.
    Restarting,
    /// Stopped; may be started again.
    Stopped,
}

impl fmt::Display for AdapterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Init => "init",
            Self::Running => "running",
            Self::Restarting => "restarting",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Output of a follow process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OriginOutput {
    /// A stdout line.
    Line(String),
    /// A classified stderr line or a spawn failure.
    Event(LifecycleEvent),
}

/// Supervision settings of an adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisionSettings {
    /// Delay before respawning an exited process.
    pub restart_delay: Duration,
    /// Whether stderr is read and classified.
    pub capture_stderr: bool,
}

impl Default for SupervisionSettings {
    fn default() -> Self {
        Self {
            restart_delay: Duration::from_secs(5),
            capture_stderr: true,
        }
    }
}

struct Running {
    cancel: CancellationToken,
    supervisor: JoinHandle<()>,
}

/// Supervises the follow process of one log source.
pub struct OriginAdapter {
    identity: LogIdentity,
    command: FollowCommand,
    profile: &'static SourceProfile,
    settings: SupervisionSettings,
    state: Arc<Mutex<AdapterState>>,
    running: Mutex<Option<Running>>,
}

impl fmt::Debug for OriginAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OriginAdapter")
            .field("identity", &self.identity)
            .field("command", &self.command)
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

impl OriginAdapter {
    /// Create an adapter; nothing is spawned until [`start`](Self::start).
    #[must_use]
    pub fn new(identity: LogIdentity, command: FollowCommand, settings: SupervisionSettings) -> Self {
        let profile = SourceProfile::of(identity.kind());
        Self {
            identity,
            command,
            profile,
            settings,
            state: Arc::new(Mutex::new(AdapterState::Init)),
            running: Mutex::new(None),
        }
    }

    /// The source being followed.
    #[must_use]
    pub const fn identity(&self) -> &LogIdentity {
        &self.identity
    }

    /// The follow command.
    #[must_use]
    pub const fn command(&self) -> &FollowCommand {
        &self.command
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> AdapterState {
        *self.state.lock()
    }

    /// Whether the adapter is meant to be running.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Spawn the follow process and start forwarding its output to `out`.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::AlreadyRunning`] if the adapter was already
    /// started and not stopped since.
    pub fn start(&self, out: mpsc::Sender<OriginOutput>) -> Result<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(LogError::AlreadyRunning(self.identity.to_string()));
        }

        let cancel = CancellationToken::new();
        let supervisor = Supervisor {
            identity: self.identity.clone(),
            command: self.command.clone(),
            profile: self.profile,
            settings: self.settings,
            state: Arc::clone(&self.state),
        };
        let handle = tokio::spawn(supervisor.run(cancel.clone(), out));

        *running = Some(Running {
            cancel,
            supervisor: handle,
        });
        Ok(())
    }

    /// Kill the follow process and wait until it is reaped.
    ///
    /// Stopping an adapter that is not running does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::Task`] if the supervisor task panicked.
    pub async fn stop(&self) -> Result<()> {
        let Some(running) = self.running.lock().take() else {
            return Ok(());
        };

        running.cancel.cancel();
        running
            .supervisor
            .await
            .map_err(|e| LogError::Task(e.to_string()))?;
        debug!(identity = %self.identity, "origin adapter stopped");
        Ok(())
    }
}

struct Supervisor {
    identity: LogIdentity,
    command: FollowCommand,
    profile: &'static SourceProfile,
    settings: SupervisionSettings,
    state: Arc<Mutex<AdapterState>>,
}

impl Supervisor {
    fn set_state(&self, state: AdapterState) {
        *self.state.lock() = state;
    }

    fn spawn_child(&self) -> std::io::Result<Child> {
        let stderr = if self.settings.capture_stderr {
            Stdio::piped()
        } else {
            Stdio::null()
        };
        self.command
            .to_command()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(stderr)
            .kill_on_drop(true)
            .spawn()
    }

    async fn run(self, cancel: CancellationToken, out: mpsc::Sender<OriginOutput>) {
        loop {
            match self.spawn_child() {
                Ok(mut child) => {
                    self.set_state(AdapterState::Running);
                    info!(
                        identity = %self.identity,
                        command = %self.command,
                        pid = child.id(),
                        "follow process started"
                    );

                    let readers = self.spawn_readers(&mut child, &out);

                    tokio::select! {
                        () = cancel.cancelled() => {
                            if let Err(e) = child.kill().await {
                                warn!(identity = %self.identity, error = %e, "failed to kill follow process");
                            }
                            readers.iter().for_each(JoinHandle::abort);
                            info!(identity = %self.identity, "follow process killed");
                            break;
                        }
                        status = child.wait() => {
                            for reader in readers {
                                let _ = reader.await;
                            }
                            match status {
                                Ok(status) => warn!(
                                    identity = %self.identity,
                                    status = %status,
                                    "follow process exited"
                                ),
                                Err(e) => warn!(
                                    identity = %self.identity,
                                    error = %e,
                                    "failed to wait for follow process"
                                ),
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        identity = %self.identity,
                        command = %self.command,
                        error = %e,
                        "failed to start follow process"
                    );
                    let event = LifecycleEvent::new(
                        LifecycleKind::SourceFailed,
                        format!("cannot start '{}': {e}", self.command),
                    );
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        sent = out.send(OriginOutput::Event(event)) => {
                            if sent.is_err() {
                                break;
                            }
                        }
                    }
                }
            }

            self.set_state(AdapterState::Restarting);
            debug!(
                identity = %self.identity,
                delay = ?self.settings.restart_delay,
                "scheduling follow process restart"
            );
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(self.settings.restart_delay) => {}
            }
        }

        self.set_state(AdapterState::Stopped);
    }

    fn spawn_readers(
        &self,
        child: &mut Child,
        out: &mpsc::Sender<OriginOutput>,
    ) -> Vec<JoinHandle<()>> {
        let mut readers = Vec::with_capacity(2);

        if let Some(stdout) = child.stdout.take() {
            let out = out.clone();
            let identity = self.identity.clone();
            readers.push(tokio::spawn(async move {
                read_lines(stdout, &identity, |line| {
                    let out = out.clone();
                    async move { out.send(OriginOutput::Line(line)).await.is_ok() }
                })
                .await;
            }));
        }

        if let Some(stderr) = child.stderr.take() {
            let out = out.clone();
            let identity = self.identity.clone();
            let profile = self.profile;
            readers.push(tokio::spawn(async move {
                let source = identity.clone();
                read_lines(stderr, &source, |line| {
                    let out = out.clone();
                    let kind = profile.recognize(&line);
                    if kind == LifecycleKind::Unrecognized {
                        warn!(identity = %identity, message = %line, "unrecognized follow process diagnostic");
                    } else {
                        info!(identity = %identity, event = ?kind, message = %line, "source lifecycle event");
                    }
                    async move {
                        out.send(OriginOutput::Event(LifecycleEvent::new(kind, line)))
                            .await
                            .is_ok()
                    }
                })
                .await;
            }));
        }

        readers
    }
}

/// Read newline-delimited lines, decoding invalid UTF-8 lossily, until EOF
/// or until `emit` reports the receiver is gone.
async fn read_lines<R, F, Fut>(reader: R, identity: &LogIdentity, mut emit: F)
where
    R: AsyncRead + Unpin,
    F: FnMut(String) -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let codec = AnyDelimiterCodec::new_with_max_length(b"\n".to_vec(), Vec::new(), MAX_LINE_LENGTH);
    let mut frames = FramedRead::new(reader, codec);

    while let Some(frame) = frames.next().await {
        match frame {
            Ok(bytes) => {
                let line = String::from_utf8_lossy(&bytes);
                let line = line.strip_suffix('\r').unwrap_or(&line).to_string();
                if !emit(line).await {
                    break;
                }
            }
            Err(AnyDelimiterCodecError::MaxChunkLengthExceeded) => {
                warn!(identity = %identity, max = MAX_LINE_LENGTH, "dropping overlong line");
            }
            Err(AnyDelimiterCodecError::Io(e)) => {
                warn!(identity = %identity, error = %e, "failed to read follow process output");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::time::timeout;

    /// Write a shell script standing in for a follow command.
    fn script(dir: &TempDir, body: &str) -> FollowCommand {
        let path = dir.path().join("follow.sh");
        std::fs::write(&path, body).unwrap();
        FollowCommand {
            program: "sh".to_string(),
            args: vec![path.to_string_lossy().to_string()],
        }
    }

    fn adapter(command: FollowCommand, restart_delay: Duration) -> OriginAdapter {
        OriginAdapter::new(
            LogIdentity::file("test", "/var/log/app.log"),
            command,
            SupervisionSettings {
                restart_delay,
                capture_stderr: true,
            },
        )
    }

    fn missing_program() -> FollowCommand {
        FollowCommand {
            program: "/nonexistent/follow".to_string(),
            args: Vec::new(),
        }
    }

    async fn next(rx: &mut mpsc::Receiver<OriginOutput>) -> OriginOutput {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for output")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn stdout_lines_are_forwarded() {
        let dir = TempDir::new().unwrap();
        let program = script(&dir, "printf 'one\\ntwo\\r\\n'\nexec sleep 30");
        let adapter = adapter(program, Duration::from_secs(5));
        let (tx, mut rx) = mpsc::channel(16);

        adapter.start(tx).unwrap();
        assert_eq!(next(&mut rx).await, OriginOutput::Line("one".to_string()));
        assert_eq!(next(&mut rx).await, OriginOutput::Line("two".to_string()));
        assert_eq!(adapter.state(), AdapterState::Running);

        adapter.stop().await.unwrap();
        assert_eq!(adapter.state(), AdapterState::Stopped);
        assert!(!adapter.is_active());
    }

    #[tokio::test]
    async fn stderr_is_classified() {
        let dir = TempDir::new().unwrap();
        let program = script(
            &dir,
            "echo \"tail: '/var/log/app.log' has been replaced;  following new file\" >&2\n\
             echo 'something odd' >&2\nexec sleep 30",
        );
        let adapter = adapter(program, Duration::from_secs(5));
        let (tx, mut rx) = mpsc::channel(16);
        adapter.start(tx).unwrap();

        let mut kinds = Vec::new();
        for _ in 0..2 {
            if let OriginOutput::Event(event) = next(&mut rx).await {
                kinds.push(event.kind);
            }
        }
        assert_eq!(kinds, vec![LifecycleKind::Rotated, LifecycleKind::Unrecognized]);
        adapter.stop().await.unwrap();
    }

    #[tokio::test]
    async fn exited_process_is_restarted() {
        let dir = TempDir::new().unwrap();
        let program = script(&dir, "echo run");
        let adapter = adapter(program, Duration::from_millis(50));
        let (tx, mut rx) = mpsc::channel(16);
        adapter.start(tx).unwrap();

        for _ in 0..3 {
            assert_eq!(next(&mut rx).await, OriginOutput::Line("run".to_string()));
        }
        adapter.stop().await.unwrap();
        assert_eq!(adapter.state(), AdapterState::Stopped);
    }

    #[tokio::test]
    async fn spawn_failure_is_reported_and_retried() {
        let adapter = adapter(missing_program(), Duration::from_millis(20));
        let (tx, mut rx) = mpsc::channel(16);
        adapter.start(tx).unwrap();

        for _ in 0..2 {
            match next(&mut rx).await {
                OriginOutput::Event(event) => {
                    assert_eq!(event.kind, LifecycleKind::SourceFailed);
                    assert!(event.message.contains("/nonexistent/follow"));
                }
                OriginOutput::Line(line) => unreachable!("unexpected line {line}"),
            }
        }
        adapter.stop().await.unwrap();
    }

    #[tokio::test]
    async fn double_start_is_rejected_and_restart_after_stop_works() {
        let dir = TempDir::new().unwrap();
        let program = script(&dir, "echo up\nexec sleep 30");
        let adapter = adapter(program, Duration::from_secs(5));

        let (tx, mut rx) = mpsc::channel(16);
        adapter.start(tx.clone()).unwrap();
        assert!(matches!(adapter.start(tx), Err(LogError::AlreadyRunning(_))));
        assert_eq!(next(&mut rx).await, OriginOutput::Line("up".to_string()));
        adapter.stop().await.unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        adapter.start(tx).unwrap();
        assert_eq!(next(&mut rx).await, OriginOutput::Line("up".to_string()));
        adapter.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_without_start_is_noop() {
        let adapter = adapter(missing_program(), Duration::from_secs(5));
        adapter.stop().await.unwrap();
        assert_eq!(adapter.state(), AdapterState::Init);
    }
}
