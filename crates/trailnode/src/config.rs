//! Node configuration.
//!
//! Configuration for the trail node agent, including:
//! - Node identity, listen address and peer endpoints
//! - File log access policy
//! - Follow command executables, restart delay and backlog sizes
//! - Record grouping settings
//! - Node-to-node request settings

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use trail_logs::{
    AccessGuard, BacklogSizes, CommandSettings, ReleasePolicy, SupervisionSettings,
    TrackingSettings,
};
use trail_proto::WatcherAddress;

use crate::error::NodeError;

/// Node identity and addressing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NodeSection {
    /// Name other nodes use for this node.
    pub name: String,
    /// Address the RPC listener binds to.
    pub listen: String,
    /// Address other nodes reach this one at, when it differs from the
    /// bound address (for example when listening on `0.0.0.0`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advertise: Option<String>,
    /// Other nodes by name, as `host:port`.
    pub peers: BTreeMap<String, String>,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            name: "trailnode".to_string(),
            listen: "127.0.0.1:7400".to_string(),
            advertise: None,
            peers: BTreeMap::new(),
        }
    }
}

impl NodeSection {
    /// Address announced to watchers, given the address actually bound.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::Config`] if `advertise` is not `host:port`.
    pub fn advertised_address(&self, bound: SocketAddr) -> Result<WatcherAddress, NodeError> {
        match &self.advertise {
            Some(advertise) => advertise
                .parse()
                .map_err(|e| NodeError::Config(format!("node.advertise: {e}"))),
            None => Ok(WatcherAddress::new(bound.ip().to_string(), bound.port())),
        }
    }
}

/// Which file logs may be tailed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AccessConfig {
    /// Globs of allowed locations.
    pub include: Vec<String>,
    /// Globs of locations rejected even when included.
    pub exclude: Vec<String>,
    /// Maximum symbolic link hops followed; 0 forbids links.
    pub symlink_hop_limit: u32,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            include: Vec::new(),
            exclude: Vec::new(),
            symlink_hop_limit: 1,
        }
    }
}

impl AccessConfig {
    /// Compile the access guard.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::Config`] if a glob is invalid.
    pub fn to_guard(&self) -> Result<AccessGuard, NodeError> {
        AccessGuard::new(&self.include, &self.exclude, self.symlink_hop_limit)
            .map_err(|e| NodeError::Config(format!("access: {e}")))
    }
}

/// Backlog line counts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BacklogConfig {
    /// Lines for flat tracking.
    pub flat: usize,
    /// Lines for grouped tracking.
    pub grouped: usize,
    /// Lines requested from pods when no backlog is wanted.
    pub pod_minimum: usize,
}

impl Default for BacklogConfig {
    fn default() -> Self {
        let sizes = BacklogSizes::default();
        Self {
            flat: sizes.flat,
            grouped: sizes.grouped,
            pod_minimum: sizes.pod_minimum,
        }
    }
}

/// Follow process settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AdapterConfig {
    /// Program following files.
    pub tail_executable: String,
    /// Program following container logs.
    pub docker_executable: String,
    /// Program following pod logs.
    pub kubectl_executable: String,
    /// Delay before an exited follow process is restarted.
    pub restart_delay_ms: u64,
    /// Whether stderr of follow processes is classified into events.
    pub capture_stderr: bool,
    /// Backlog sizes.
    pub backlog: BacklogConfig,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        let commands = CommandSettings::default();
        Self {
            tail_executable: commands.tail_executable,
            docker_executable: commands.docker_executable,
            kubectl_executable: commands.kubectl_executable,
            restart_delay_ms: 5000,
            capture_stderr: true,
            backlog: BacklogConfig::default(),
        }
    }
}

impl AdapterConfig {
    /// Settings used to build follow commands.
    #[must_use]
    pub fn command_settings(&self) -> CommandSettings {
        CommandSettings {
            tail_executable: self.tail_executable.clone(),
            docker_executable: self.docker_executable.clone(),
            kubectl_executable: self.kubectl_executable.clone(),
            backlog: BacklogSizes {
                flat: self.backlog.flat,
                grouped: self.backlog.grouped,
                pod_minimum: self.backlog.pod_minimum,
            },
        }
    }

    /// Settings used to supervise follow processes.
    #[must_use]
    pub const fn supervision(&self) -> SupervisionSettings {
        SupervisionSettings {
            restart_delay: Duration::from_millis(self.restart_delay_ms),
            capture_stderr: self.capture_stderr,
        }
    }
}

/// Record grouping settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TrackingConfig {
    /// Group size that forces a release.
    pub size_threshold: usize,
    /// Idle time after which a group is released.
    pub group_timeout_ms: u64,
    /// How often idle groups are checked.
    pub poll_interval_ms: u64,
    /// Capacity of the tail and record channels.
    pub channel_capacity: usize,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            size_threshold: 500,
            group_timeout_ms: 1000,
            poll_interval_ms: 50,
            channel_capacity: 1024,
        }
    }
}

impl TrackingConfig {
    /// Engine-side tracking settings.
    #[must_use]
    pub const fn settings(&self) -> TrackingSettings {
        TrackingSettings {
            policy: ReleasePolicy {
                size_threshold: self.size_threshold,
                group_timeout: Duration::from_millis(self.group_timeout_ms),
            },
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            channel_capacity: self.channel_capacity,
        }
    }
}

/// Node-to-node request settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RpcConfig {
    /// How long a register or unregister waits for its reply.
    pub request_timeout_ms: u64,
    /// Frames queued per link before senders wait.
    pub outbound_queue: usize,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 5000,
            outbound_queue: 256,
        }
    }
}

impl RpcConfig {
    /// Reply timeout.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Main node configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NodeConfig {
    /// Identity and addressing.
    pub node: NodeSection,
    /// File access policy.
    pub access: AccessConfig,
    /// Follow process settings.
    pub adapters: AdapterConfig,
    /// Record grouping settings.
    pub tracking: TrackingConfig,
    /// Node-to-node request settings.
    pub rpc: RpcConfig,
}

impl NodeConfig {
    /// Load configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, NodeError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            NodeError::Config(format!(
                "failed to read config file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;

        Self::from_json(&content)
    }

    /// Parse configuration from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is invalid or the values do not validate.
    pub fn from_json(content: &str) -> Result<Self, NodeError> {
        let config: Self = serde_json::from_str(content)
            .map_err(|e| NodeError::Config(format!("invalid JSON: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Write the configuration as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), NodeError> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| NodeError::Config(format!("failed to encode config: {e}")))?;
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path.as_ref(), json)?;
        Ok(())
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<(), NodeError> {
        if self.node.name.is_empty() {
            return Err(NodeError::Config("node name cannot be empty".to_string()));
        }

        if !self
            .node
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return Err(NodeError::Config(
                "node name must contain only alphanumeric characters, dots, hyphens, and underscores"
                    .to_string(),
            ));
        }

        if self.node.listen.is_empty() {
            return Err(NodeError::Config("node.listen cannot be empty".to_string()));
        }

        if let Some(advertise) = &self.node.advertise {
            advertise
                .parse::<WatcherAddress>()
                .map_err(|e| NodeError::Config(format!("node.advertise: {e}")))?;
        }

        self.peer_endpoints()?;
        self.access.to_guard()?;

        if self.adapters.restart_delay_ms == 0 {
            return Err(NodeError::Config(
                "adapters.restart_delay_ms must be greater than 0".to_string(),
            ));
        }

        for (key, value) in [
            ("adapters.tail_executable", &self.adapters.tail_executable),
            ("adapters.docker_executable", &self.adapters.docker_executable),
            ("adapters.kubectl_executable", &self.adapters.kubectl_executable),
        ] {
            if value.is_empty() {
                return Err(NodeError::Config(format!("{key} cannot be empty")));
            }
        }

        self.tracking
            .settings()
            .validate()
            .map_err(|e| NodeError::Config(format!("tracking: {e}")))?;

        if self.rpc.request_timeout_ms == 0 {
            return Err(NodeError::Config(
                "rpc.request_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.rpc.outbound_queue == 0 {
            return Err(NodeError::Config(
                "rpc.outbound_queue must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Parsed peer endpoints by node name.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::Config`] if an endpoint is not `host:port`.
    pub fn peer_endpoints(&self) -> Result<HashMap<String, WatcherAddress>, NodeError> {
        self.node
            .peers
            .iter()
            .map(|(name, endpoint)| {
                endpoint
                    .parse::<WatcherAddress>()
                    .map(|address| (name.clone(), address))
                    .map_err(|e| NodeError::Config(format!("node.peers.{name}: {e}")))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;
    use test_case::test_case;

    fn create_temp_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().expect("failed to create temp file");
        file.write_all(content.as_bytes())
            .expect("failed to write temp file");
        file
    }

    // ==================== Parsing ====================

    #[test]
    fn test_parse_minimal_config() {
        let config = NodeConfig::from_json(r#"{"node": {"name": "web-1"}}"#)
            .expect("should parse minimal config");

        assert_eq!(config.node.name, "web-1");
        assert_eq!(config.node.listen, "127.0.0.1:7400");
        assert_eq!(config.access.symlink_hop_limit, 1);
        assert_eq!(config.adapters.tail_executable, "tail");
        assert_eq!(config.adapters.restart_delay_ms, 5000);
        assert!(config.adapters.capture_stderr);
        assert_eq!(config.adapters.backlog.flat, 45);
        assert_eq!(config.adapters.backlog.grouped, 20);
        assert_eq!(config.adapters.backlog.pod_minimum, 1);
        assert_eq!(config.tracking.size_threshold, 500);
        assert_eq!(config.tracking.group_timeout_ms, 1000);
        assert_eq!(config.tracking.poll_interval_ms, 50);
        assert_eq!(config.rpc.request_timeout_ms, 5000);
    }

    #[test]
    fn test_parse_full_config() {
        let json = r#"{
            "node": {
                "name": "web-1",
                "listen": "0.0.0.0:7500",
                "peers": {"db-1": "10.0.0.7:7500"}
            },
            "access": {
                "include": ["/var/log/**"],
                "exclude": ["/var/log/secure*"],
                "symlink_hop_limit": 0
            },
            "adapters": {
                "tail_executable": "/usr/bin/tail",
                "restart_delay_ms": 1000,
                "capture_stderr": false,
                "backlog": {"flat": 100, "grouped": 10, "pod_minimum": 1}
            },
            "tracking": {"size_threshold": 50, "group_timeout_ms": 250},
            "rpc": {"request_timeout_ms": 2000, "outbound_queue": 32}
        }"#;

        let config = NodeConfig::from_json(json).expect("should parse full config");

        assert_eq!(config.node.listen, "0.0.0.0:7500");
        assert_eq!(config.access.include, vec!["/var/log/**"]);
        assert_eq!(config.access.symlink_hop_limit, 0);
        assert!(!config.adapters.capture_stderr);
        assert_eq!(config.adapters.docker_executable, "docker");
        assert_eq!(config.tracking.size_threshold, 50);
        assert_eq!(config.tracking.poll_interval_ms, 50);
        assert_eq!(config.rpc.outbound_queue, 32);

        let peers = config.peer_endpoints().unwrap();
        assert_eq!(peers["db-1"], WatcherAddress::new("10.0.0.7", 7500));
    }

    #[test]
    fn test_conversions() {
        let config = NodeConfig::default();

        let commands = config.adapters.command_settings();
        assert_eq!(commands, CommandSettings::default());

        let supervision = config.adapters.supervision();
        assert_eq!(supervision.restart_delay, Duration::from_secs(5));

        let tracking = config.tracking.settings();
        assert_eq!(tracking, TrackingSettings::default());
        assert_eq!(config.rpc.request_timeout(), Duration::from_secs(5));
    }

    // ==================== Files ====================

    #[test]
    fn test_load_from_file() {
        let temp_file = create_temp_config(r#"{"node": {"name": "file-node"}}"#);
        let config = NodeConfig::from_file(temp_file.path()).expect("should load from file");
        assert_eq!(config.node.name, "file-node");
    }

    #[test]
    fn test_file_not_found() {
        let result = NodeConfig::from_file("/nonexistent/path/config.json");
        assert!(matches!(result, Err(NodeError::Config(_))));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut config = NodeConfig::default();
        config.access.include.push("/var/log/**".to_string());
        config.save(&path).unwrap();

        let loaded = NodeConfig::from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    // ==================== Validation ====================

    #[test]
    fn test_empty_name_rejected() {
        let err = NodeConfig::from_json(r#"{"node": {"name": ""}}"#).unwrap_err();
        assert!(err.to_string().contains("name cannot be empty"));
    }

    #[test]
    fn test_invalid_name_chars_rejected() {
        let err = NodeConfig::from_json(r#"{"node": {"name": "web 1"}}"#).unwrap_err();
        assert!(err.to_string().contains("alphanumeric"));
    }

    #[test]
    fn test_size_threshold_below_two_rejected() {
        let err = NodeConfig::from_json(r#"{"tracking": {"size_threshold": 1}}"#).unwrap_err();
        assert!(err.to_string().contains("size threshold"));
    }

    #[test]
    fn test_invalid_glob_rejected() {
        let err = NodeConfig::from_json(r#"{"access": {"include": ["/var/log/[abc"]}}"#)
            .unwrap_err();
        assert!(matches!(err, NodeError::Config(_)));
        assert!(err.to_string().contains("access"));
    }

    #[test]
    fn test_invalid_peer_rejected() {
        let err = NodeConfig::from_json(r#"{"node": {"peers": {"db-1": "no-port"}}}"#)
            .unwrap_err();
        assert!(err.to_string().contains("node.peers.db-1"));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let err = NodeConfig::from_json(r#"{"rpc": {"request_timeout_ms": 0}}"#).unwrap_err();
        assert!(err.to_string().contains("request_timeout_ms"));
    }

    #[test]
    fn test_invalid_json_rejected() {
        let err = NodeConfig::from_json("{not json").unwrap_err();
        assert!(err.to_string().contains("invalid JSON"));
    }

    #[test]
    fn test_advertised_address() {
        let bound: SocketAddr = "0.0.0.0:7400".parse().unwrap();
        let mut section = NodeSection::default();
        assert_eq!(
            section.advertised_address(bound).unwrap(),
            WatcherAddress::new("0.0.0.0", 7400)
        );

        section.advertise = Some("10.0.0.5:7400".to_string());
        assert_eq!(
            section.advertised_address(bound).unwrap(),
            WatcherAddress::new("10.0.0.5", 7400)
        );
    }

    #[test]
    fn test_invalid_advertise_rejected() {
        let err = NodeConfig::from_json(r#"{"node": {"advertise": "nowhere"}}"#).unwrap_err();
        assert!(err.to_string().contains("node.advertise"));
    }

    #[test_case(r#"{"node": {"listen": ""}}"#, "node.listen" ; "empty listen")]
    #[test_case(r#"{"adapters": {"restart_delay_ms": 0}}"#, "restart_delay_ms" ; "zero restart delay")]
    #[test_case(r#"{"adapters": {"tail_executable": ""}}"#, "adapters.tail_executable" ; "empty tail")]
    #[test_case(r#"{"tracking": {"poll_interval_ms": 0}}"#, "poll interval" ; "zero poll interval")]
    #[test_case(r#"{"rpc": {"outbound_queue": 0}}"#, "outbound_queue" ; "zero queue")]
    fn test_out_of_range_values_rejected(json: &str, expected: &str) {
        let err = NodeConfig::from_json(json).unwrap_err();
        assert!(matches!(err, NodeError::Config(_)));
        assert!(err.to_string().contains(expected), "{err}");
    }
}
