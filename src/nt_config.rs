//! Cluster configuration: the static node table plus protocol timing.
//!
//! Loaded once at startup from key-value pairs (process environment or a
//! `config.env` file) or from a YAML document:
//!
//! ```text
//! TOTAL_NODES=3
//! NODE_1_IP=127.0.0.1
//! NODE_1_PORT=5001
//! NT_MSG_TIMEOUT=10
//! ```
//!
//! Any missing or invalid entry is an error; the node must not start with an
//! incomplete view of the cluster.

use hashbrown::HashMap;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::nt_interface::{NodeId, NtTime};

// ============================================================================
// Protocol Parameters
// ============================================================================

/// Timing and fault-tolerance parameters of the queue protocol
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Number of predecessors carried in COMMIT, k (default: 2)
    pub fault_tolerance: usize,

    /// Bounded wait for any single reply, T_msg (in ticks, default: 10)
    pub msg_timeout: NtTime,

    /// Heartbeat period towards the predecessor, T_ping (in ticks, default: 5)
    pub ping_interval: NtTime,

    /// Wait for COMMIT or TOKEN after sending REQUEST (in ticks, default: 60)
    pub request_timeout: NtTime,

    /// Time ELECTION messages are collected before deciding (in ticks, default: 10)
    pub election_window: NtTime,

    /// Wall-clock length of one tick for the threaded driver (default: 100 ms)
    pub tick_duration_ms: u64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            fault_tolerance: 2,
            msg_timeout: 10,
            ping_interval: 5,
            request_timeout: 60,
            election_window: 10,
            tick_duration_ms: 100,
        }
    }
}

impl ProtocolConfig {
    /// PONG deadline after a PING, 2·T_msg
    pub fn pong_timeout(&self) -> NtTime {
        2 * self.msg_timeout
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.fault_tolerance == 0 {
            return Err(ConfigError::Invalid(
                "fault_tolerance must be at least 1".to_string(),
            ));
        }
        if self.msg_timeout == 0 || self.ping_interval == 0 || self.tick_duration_ms == 0 {
            return Err(ConfigError::Invalid(
                "timeouts and tick duration must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Required key absent
    Missing(String),
    /// Key present but its value does not parse
    InvalidValue { key: String, value: String },
    /// Table is structurally wrong (empty, ids out of range, ...)
    Invalid(String),
    /// Config file could not be read
    Io { path: String, reason: String },
    /// YAML document did not deserialize
    Yaml(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Missing(key) => write!(f, "missing configuration key {}", key),
            ConfigError::InvalidValue { key, value } => {
                write!(f, "invalid value '{}' for {}", value, key)
            }
            ConfigError::Invalid(reason) => write!(f, "invalid cluster configuration: {}", reason),
            ConfigError::Io { path, reason } => write!(f, "cannot read {}: {}", path, reason),
            ConfigError::Yaml(reason) => write!(f, "invalid YAML configuration: {}", reason),
        }
    }
}

impl std::error::Error for ConfigError {}

// ============================================================================
// Cluster Table
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NodeAddress {
    pub address: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClusterConfig {
    nodes: BTreeMap<NodeId, NodeAddress>,

    #[serde(default)]
    pub protocol: ProtocolConfig,
}

impl ClusterConfig {
    /// Validated table built from explicit entries
    pub fn new(
        nodes: BTreeMap<NodeId, NodeAddress>,
        protocol: ProtocolConfig,
    ) -> Result<Self, ConfigError> {
        let config = Self { nodes, protocol };
        config.validate()?;
        Ok(config)
    }

    /// `n` nodes on 127.0.0.1 with consecutive ports starting at `base_port`
    pub fn local(n: u32, base_port: u16) -> Result<Self, ConfigError> {
        let nodes = (1..=n)
            .map(|id| {
                let port = u16::try_from(id - 1)
                    .ok()
                    .and_then(|offset| base_port.checked_add(offset))
                    .ok_or_else(|| {
                        ConfigError::Invalid(format!(
                            "{} nodes do not fit above port {}",
                            n, base_port
                        ))
                    })?;
                Ok((
                    id,
                    NodeAddress {
                        address: "127.0.0.1".to_string(),
                        port,
                    },
                ))
            })
            .collect::<Result<BTreeMap<_, _>, ConfigError>>()?;
        Self::new(nodes, ProtocolConfig::default())
    }

    /// Parse the `TOTAL_NODES` / `NODE_<i>_IP` / `NODE_<i>_PORT` key set.
    /// Optional `NT_*` keys override protocol parameters.
    pub fn from_key_values<I, K, V>(pairs: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let values: HashMap<String, String> = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();

        let total: u32 = required(&values, "TOTAL_NODES")?;
        let mut nodes = BTreeMap::new();
        for id in 1..=total {
            let ip_key = format!("NODE_{}_IP", id);
            let address = values
                .get(&ip_key)
                .map(|v| v.trim().to_string())
                .ok_or(ConfigError::Missing(ip_key))?;
            let port: u16 = required(&values, &format!("NODE_{}_PORT", id))?;
            nodes.insert(id, NodeAddress { address, port });
        }

        let mut protocol = ProtocolConfig::default();
        if let Some(v) = optional(&values, "NT_FAULT_TOLERANCE")? {
            protocol.fault_tolerance = v;
        }
        if let Some(v) = optional(&values, "NT_MSG_TIMEOUT")? {
            protocol.msg_timeout = v;
        }
        if let Some(v) = optional(&values, "NT_PING_INTERVAL")? {
            protocol.ping_interval = v;
        }
        if let Some(v) = optional(&values, "NT_REQUEST_TIMEOUT")? {
            protocol.request_timeout = v;
        }
        if let Some(v) = optional(&values, "NT_ELECTION_WINDOW")? {
            protocol.election_window = v;
        }
        if let Some(v) = optional(&values, "NT_TICK_MS")? {
            protocol.tick_duration_ms = v;
        }

        Self::new(nodes, protocol)
    }

    /// Read the cluster table from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_key_values(std::env::vars())
    }

    /// Read a `KEY=VALUE` file (blank lines and `#` comments ignored)
    pub fn from_env_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_key_values(parse_env_lines(&content))
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: ClusterConfig =
            serde_yaml::from_str(yaml).map_err(|e| ConfigError::Yaml(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn address(&self, id: NodeId) -> Option<&str> {
        self.nodes.get(&id).map(|n| n.address.as_str())
    }

    pub fn port(&self, id: NodeId) -> Option<u16> {
        self.nodes.get(&id).map(|n| n.port)
    }

    pub fn total_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.nodes.is_empty() {
            return Err(ConfigError::Invalid("no nodes configured".to_string()));
        }
        let total = self.nodes.len() as NodeId;
        for (&id, node) in &self.nodes {
            if id == 0 || id > total {
                return Err(ConfigError::Invalid(format!(
                    "node id {} outside 1..={}",
                    id, total
                )));
            }
            if node.address.is_empty() {
                return Err(ConfigError::Invalid(format!("node {} has no address", id)));
            }
            if node.port == 0 {
                return Err(ConfigError::Invalid(format!("node {} has port 0", id)));
            }
        }
        self.protocol.validate()
    }
}

fn parse_env_lines(content: &str) -> Vec<(String, String)> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| {
            let v = v.trim().trim_matches('"');
            (k.trim().to_string(), v.to_string())
        })
        .collect()
}

fn required<T: std::str::FromStr>(
    values: &HashMap<String, String>,
    key: &str,
) -> Result<T, ConfigError> {
    optional(values, key)?.ok_or_else(|| ConfigError::Missing(key.to_string()))
}

fn optional<T: std::str::FromStr>(
    values: &HashMap<String, String>,
    key: &str,
) -> Result<Option<T>, ConfigError> {
    match values.get(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value: raw.clone(),
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(entries: &[(&str, &str)]) -> Vec<(String, String)> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_key_values_build_table() {
        let config = ClusterConfig::from_key_values(pairs(&[
            ("TOTAL_NODES", "2"),
            ("NODE_1_IP", "10.0.0.1"),
            ("NODE_1_PORT", "5001"),
            ("NODE_2_IP", "10.0.0.2"),
            ("NODE_2_PORT", "5002"),
            ("NT_MSG_TIMEOUT", "4"),
        ]))
        .unwrap();

        assert_eq!(config.total_nodes(), 2);
        assert_eq!(config.address(2), Some("10.0.0.2"));
        assert_eq!(config.port(1), Some(5001));
        assert_eq!(config.port(3), None);
        assert_eq!(config.protocol.msg_timeout, 4);
        assert_eq!(config.protocol.pong_timeout(), 8);
        assert_eq!(config.protocol.fault_tolerance, 2);
        assert_eq!(config.node_ids(), vec![1, 2]);
    }

    #[test]
    fn test_missing_and_invalid_entries_fail() {
        let missing = ClusterConfig::from_key_values(pairs(&[
            ("TOTAL_NODES", "2"),
            ("NODE_1_IP", "10.0.0.1"),
            ("NODE_1_PORT", "5001"),
        ]));
        assert_eq!(missing, Err(ConfigError::Missing("NODE_2_IP".to_string())));

        let bad_port = ClusterConfig::from_key_values(pairs(&[
            ("TOTAL_NODES", "1"),
            ("NODE_1_IP", "10.0.0.1"),
            ("NODE_1_PORT", "70000"),
        ]));
        assert!(matches!(bad_port, Err(ConfigError::InvalidValue { .. })));

        let no_total = ClusterConfig::from_key_values(pairs(&[]));
        assert_eq!(no_total, Err(ConfigError::Missing("TOTAL_NODES".to_string())));

        let empty = ClusterConfig::from_key_values(pairs(&[("TOTAL_NODES", "0")]));
        assert!(matches!(empty, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_env_file_lines() {
        let parsed = parse_env_lines(
            "# cluster\nTOTAL_NODES=1\n\nNODE_1_IP = \"127.0.0.1\"\nNODE_1_PORT=6000\nnot a pair\n",
        );
        let config = ClusterConfig::from_key_values(parsed).unwrap();
        assert_eq!(config.address(1), Some("127.0.0.1"));
        assert_eq!(config.port(1), Some(6000));
    }

    #[test]
    fn test_env_file_missing_is_io_error() {
        let result = ClusterConfig::from_env_file("/nonexistent/config.env");
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_yaml_config() {
        let yaml = r#"
nodes:
  1: { address: 127.0.0.1, port: 7001 }
  2: { address: 127.0.0.1, port: 7002 }
protocol:
  fault_tolerance: 1
  msg_timeout: 3
"#;
        let config = ClusterConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.total_nodes(), 2);
        assert_eq!(config.protocol.fault_tolerance, 1);
        assert_eq!(config.protocol.msg_timeout, 3);
        // unspecified fields keep their defaults
        assert_eq!(config.protocol.ping_interval, 5);

        let gap = "nodes:\n  1: { address: a, port: 1 }\n  3: { address: b, port: 2 }\n";
        assert!(matches!(
            ClusterConfig::from_yaml_str(gap),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_local_cluster() {
        let config = ClusterConfig::local(3, 9100).unwrap();
        assert_eq!(config.port(3), Some(9102));
        assert!(config.contains(1));
        assert!(!config.contains(4));
    }

    #[test]
    fn test_local_cluster_rejects_port_overflow() {
        let top = ClusterConfig::local(2, u16::MAX - 1).unwrap();
        assert_eq!(top.port(2), Some(u16::MAX));

        assert!(matches!(
            ClusterConfig::local(3, u16::MAX - 1),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            ClusterConfig::local(70_000, 0),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            ClusterConfig::local(0, 9100),
            Err(ConfigError::Invalid(_))
        ));
    }
}
