//! Per-source-kind strategies.
//!
//! Each [`SourceProfile`] row knows how to build the follow command for one
//! kind of source and how to read the diagnostics that command prints on
//! stderr. Supporting a new kind means adding a row, not a type.

use std::fmt;

use trail_proto::{LifecycleKind, LogIdentity, SourceKind, TrackingMode};

/// A stderr phrase rule: every phrase must be present for the row to match.
#[derive(Debug, Clone, Copy)]
pub struct RecognizerRow {
    /// Phrases that must all occur in the line.
    pub phrases: &'static [&'static str],
    /// Event raised on match.
    pub kind: LifecycleKind,
}

const fn row(phrases: &'static [&'static str], kind: LifecycleKind) -> RecognizerRow {
    RecognizerRow { phrases, kind }
}

const FILE_ROWS: &[RecognizerRow] = &[
    // GNU tail
    row(&["cannot open"], LifecycleKind::NotFound),
    row(&["has appeared"], LifecycleKind::Appeared),
    row(&["has become accessible"], LifecycleKind::Appeared),
    row(&["replaced with an untailable"], LifecycleKind::Disappeared),
    row(&["has been replaced", "new file"], LifecycleKind::Rotated),
    row(&["has become inaccessible"], LifecycleKind::Disappeared),
    row(&["truncated"], LifecycleKind::Truncated),
    // BSD and Solaris tail
    row(&["No such file"], LifecycleKind::NotFound),
    row(&["cannot open input"], LifecycleKind::NotFound),
];

const CONTAINER_ROWS: &[RecognizerRow] = &[row(&["No such container"], LifecycleKind::NotFound)];

const POD_ROWS: &[RecognizerRow] = &[row(&["NotFound"], LifecycleKind::NotFound)];

/// Executables and backlog sizes used to build follow commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSettings {
    /// Program following files.
    pub tail_executable: String,
    /// Program following container logs.
    pub docker_executable: String,
    /// Program following pod logs.
    pub kubectl_executable: String,
    /// Backlog length per mode.
    pub backlog: BacklogSizes,
}

impl Default for CommandSettings {
    fn default() -> Self {
        Self {
            tail_executable: "tail".to_string(),
            docker_executable: "docker".to_string(),
            kubectl_executable: "kubectl".to_string(),
            backlog: BacklogSizes::default(),
        }
    }
}

/// How many existing lines a follow command prints before following.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BacklogSizes {
    /// Backlog for flat tracking.
    pub flat: usize,
    /// Backlog for grouped tracking.
    pub grouped: usize,
    /// Smallest backlog accepted by the pod follow command.
    pub pod_minimum: usize,
}

impl Default for BacklogSizes {
    fn default() -> Self {
        Self {
            flat: 45,
            grouped: 20,
            pod_minimum: 1,
        }
    }
}

impl BacklogSizes {
    /// Backlog length for a request.
    #[must_use]
    pub const fn lines(&self, kind: SourceKind, mode: TrackingMode, wanted: bool) -> usize {
        let lines = match (wanted, mode) {
            (false, _) => 0,
            (true, TrackingMode::Flat) => self.flat,
            (true, TrackingMode::Grouped) => self.grouped,
        };
        // kubectl reads --tail=0 as "everything"
        if matches!(kind, SourceKind::Pod) && lines < self.pod_minimum {
            self.pod_minimum
        } else {
            lines
        }
    }
}

/// A program and its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FollowCommand {
    /// Executable name or path.
    pub program: String,
    /// Arguments.
    pub args: Vec<String>,
}

impl FollowCommand {
    /// Build a process command ready for spawning.
    #[must_use]
    pub fn to_command(&self) -> tokio::process::Command {
        let mut command = tokio::process::Command::new(&self.program);
        command.args(&self.args);
        command
    }
}

impl fmt::Display for FollowCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

type Builder = fn(&LogIdentity, usize, &CommandSettings) -> FollowCommand;

/// Strategy row for one source kind.
pub struct SourceProfile {
    /// Kind served by this row.
    pub kind: SourceKind,
    build: Builder,
    recognizers: &'static [RecognizerRow],
}

impl fmt::Debug for SourceProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceProfile")
            .field("kind", &self.kind)
            .field("recognizers", &self.recognizers.len())
            .finish_non_exhaustive()
    }
}

static PROFILES: [SourceProfile; 4] = [
    SourceProfile {
        kind: SourceKind::File,
        build: file_command,
        recognizers: FILE_ROWS,
    },
    SourceProfile {
        kind: SourceKind::RemoteFile,
        build: file_command,
        recognizers: FILE_ROWS,
    },
    SourceProfile {
        kind: SourceKind::Container,
        build: container_command,
        recognizers: CONTAINER_ROWS,
    },
    SourceProfile {
        kind: SourceKind::Pod,
        build: pod_command,
        recognizers: POD_ROWS,
    },
];

impl SourceProfile {
    /// The row serving `kind`.
    #[must_use]
    pub fn of(kind: SourceKind) -> &'static Self {
        match kind {
            SourceKind::File => &PROFILES[0],
            SourceKind::RemoteFile => &PROFILES[1],
            SourceKind::Container => &PROFILES[2],
            SourceKind::Pod => &PROFILES[3],
        }
    }

    /// Build the follow command for `identity`.
    #[must_use]
    pub fn follow_command(
        &self,
        identity: &LogIdentity,
        backlog: usize,
        settings: &CommandSettings,
    ) -> FollowCommand {
        (self.build)(identity, backlog, settings)
    }

    /// Classify a line the follow command printed on stderr.
    #[must_use]
    pub fn recognize(&self, text: &str) -> LifecycleKind {
        self.recognizers
            .iter()
            .find(|row| row.phrases.iter().all(|p| text.contains(p)))
            .map_or(LifecycleKind::Unrecognized, |row| row.kind)
    }
}

fn file_command(identity: &LogIdentity, backlog: usize, settings: &CommandSettings) -> FollowCommand {
    FollowCommand {
        program: settings.tail_executable.clone(),
        args: vec![
            "-F".to_string(),
            "-n".to_string(),
            backlog.to_string(),
            identity.target().to_string(),
        ],
    }
}

fn container_command(
    identity: &LogIdentity,
    backlog: usize,
    settings: &CommandSettings,
) -> FollowCommand {
    FollowCommand {
        program: settings.docker_executable.clone(),
        args: vec![
            "logs".to_string(),
            "--follow".to_string(),
            format!("--tail={backlog}"),
            identity.target().to_string(),
        ],
    }
}

fn pod_command(identity: &LogIdentity, backlog: usize, settings: &CommandSettings) -> FollowCommand {
    let mut args = vec![
        "logs".to_string(),
        "--follow".to_string(),
        format!("--tail={backlog}"),
    ];
    args.extend(kubectl_target_args(identity.target()));
    FollowCommand {
        program: settings.kubectl_executable.clone(),
        args,
    }
}

/// Turn a pod target such as `namespace ops deploy/api c main` into
/// kubectl arguments.
fn kubectl_target_args(target: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut tokens = target.split_whitespace();
    while let Some(token) = tokens.next() {
        match token {
            "namespace" => match tokens.next() {
                Some(ns) => args.push(format!("--namespace={ns}")),
                None => args.push(token.to_string()),
            },
            "container" | "c" => match tokens.next() {
                Some(c) => args.push(format!("--container={c}")),
                None => args.push(token.to_string()),
            },
            resource => args.push(resource.to_string()),
        }
    }
    args
}
