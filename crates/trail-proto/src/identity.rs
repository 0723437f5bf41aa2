//! Log source identities.
//!
//! A [`LogIdentity`] is parsed from the path a watcher asks for. Paths carry
//! an optional scheme prefix telling which kind of source backs them:
//!
//! | prefix | kind |
//! |---|---|
//! | *(none)* | [`SourceKind::File`] on the local node |
//! | `node://<node>/<path>` | [`SourceKind::RemoteFile`] |
//! | `docker://<container>` | [`SourceKind::Container`] |
//! | `kubernetes://<target>`, `k8s://<target>` | [`SourceKind::Pod`] |

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ProtoError, Result};

/// Prefix of a file living on a named node.
pub const NODE_PREFIX: &str = "node://";
/// Prefix of a container log.
pub const DOCKER_PREFIX: &str = "docker://";
/// Prefix of an orchestrator pod log.
pub const KUBERNETES_PREFIX: &str = "kubernetes://";
/// Short alias of [`KUBERNETES_PREFIX`].
pub const K8S_PREFIX: &str = "k8s://";

/// The kind of source backing a log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// A file on the node serving the request.
    File,
    /// A file addressed by node name.
    RemoteFile,
    /// A container's output.
    Container,
    /// An orchestrator pod's output.
    Pod,
}

impl SourceKind {
    /// Returns true for kinds that name a file system path.
    #[must_use]
    pub const fn is_file(self) -> bool {
        matches!(self, Self::File | Self::RemoteFile)
    }

    /// Lowercase name used in logs and command tables.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::RemoteFile => "remote_file",
            Self::Container => "container",
            Self::Pod => "pod",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable key of one log source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogIdentity {
    kind: SourceKind,
    node: String,
    target: String,
    full_path: String,
}

impl LogIdentity {
    /// A plain file on `node`.
    #[must_use]
    pub fn file(node: impl Into<String>, path: impl Into<String>) -> Self {
        let target = path.into();
        Self {
            kind: SourceKind::File,
            node: node.into(),
            full_path: target.clone(),
            target,
        }
    }

    /// A file addressed as `node://<node><path>`.
    #[must_use]
    pub fn remote_file(node: impl Into<String>, path: impl Into<String>) -> Self {
        let node = node.into();
        let target = path.into();
        Self {
            kind: SourceKind::RemoteFile,
            full_path: format!("{NODE_PREFIX}{node}{target}"),
            node,
            target,
        }
    }

    /// A container log served by `node`.
    #[must_use]
    pub fn container(node: impl Into<String>, target: impl Into<String>) -> Self {
        let target = target.into();
        Self {
            kind: SourceKind::Container,
            node: node.into(),
            full_path: format!("{DOCKER_PREFIX}{target}"),
            target,
        }
    }

    /// A pod log served by `node`.
    #[must_use]
    pub fn pod(node: impl Into<String>, target: impl Into<String>) -> Self {
        let target = target.into();
        Self {
            kind: SourceKind::Pod,
            node: node.into(),
            full_path: format!("{KUBERNETES_PREFIX}{target}"),
            target,
        }
    }

    /// Parse a watcher-supplied path.
    ///
    /// Paths without a scheme prefix are files on `local_node`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtoError::InvalidIdentity`] when the path or the part
    /// after its prefix is empty, or a `node://` path lacks a node name or
    /// an absolute file path.
    pub fn parse(path: &str, local_node: &str) -> Result<Self> {
        let path = path.trim();
        let invalid = |reason| ProtoError::InvalidIdentity {
            path: path.to_string(),
            reason,
        };

        if path.is_empty() {
            return Err(invalid("path is empty"));
        }

        if let Some(rest) = path.strip_prefix(NODE_PREFIX) {
            let Some(slash) = rest.find('/') else {
                return Err(invalid("missing file path after node name"));
            };
            let (node, file) = rest.split_at(slash);
            if node.is_empty() {
                return Err(invalid("missing node name"));
            }
            return Ok(Self::remote_file(node, file));
        }

        if let Some(target) = path.strip_prefix(DOCKER_PREFIX) {
            return non_empty(target)
                .map(|t| Self::container(local_node, t))
                .ok_or_else(|| invalid("missing container name"));
        }

        let pod_target = path
            .strip_prefix(KUBERNETES_PREFIX)
            .or_else(|| path.strip_prefix(K8S_PREFIX));
        if let Some(target) = pod_target {
            return non_empty(target)
                .map(|t| Self::pod(local_node, t))
                .ok_or_else(|| invalid("missing pod target"));
        }

        Ok(Self::file(local_node, path))
    }

    /// The source kind.
    #[must_use]
    pub const fn kind(&self) -> SourceKind {
        self.kind
    }

    /// Name of the node that owns the source.
    #[must_use]
    pub fn node(&self) -> &str {
        &self.node
    }

    /// File path, container name or pod target, without prefix.
    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Canonical prefixed form.
    #[must_use]
    pub fn full_path(&self) -> &str {
        &self.full_path
    }

    /// Whether this identity is a file that `local_node` reads from its own disk.
    #[must_use]
    pub fn is_local_file(&self, local_node: &str) -> bool {
        match self.kind {
            SourceKind::File => true,
            SourceKind::RemoteFile => self.node == local_node,
            SourceKind::Container | SourceKind::Pod => false,
        }
    }
}

impl fmt::Display for LogIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full_path)
    }
}

fn non_empty(s: &str) -> Option<&str> {
    let s = s.trim();
    (!s.is_empty()).then_some(s)
}
