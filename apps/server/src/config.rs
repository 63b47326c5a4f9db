//! Server configuration, loaded from a JSON file. Command-line flags
//! override the file.

use std::path::Path;

use serde::Deserialize;
use serde_json::Value;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address the client-facing HTTP/WebSocket server binds to.
    pub listen: String,
    /// Base64-encoded salt for validating API keys. Empty disables the
    /// check.
    pub api_key_salt: String,
    /// Token authenticator settings.
    pub auth_token: TokenConfig,
    /// Adapter selection and its opaque settings.
    pub store_config: StoreConfig,
    /// Hard cap on group-topic membership.
    pub max_subscriber_count: usize,
    /// Hard cap on discovery tags per user or topic.
    pub max_tag_count: usize,
    /// Quiet window before an idle topic is unloaded, in seconds.
    pub topic_timeout_secs: u64,
    /// Push notification backends.
    pub push: Vec<PushConfig>,
    /// Cluster membership. Empty `self` means standalone.
    pub cluster: ClusterConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:6060".to_string(),
            api_key_salt: String::new(),
            auth_token: TokenConfig::default(),
            store_config: StoreConfig::default(),
            max_subscriber_count: 32,
            max_tag_count: 16,
            topic_timeout_secs: 240,
            push: Vec::new(),
            cluster: ClusterConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file. A missing file yields the
    /// defaults; a malformed one is an error.
    pub fn load(path: &Path) -> Result<Self, String> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "config file not found, using defaults");
                return Ok(Self::default());
            }
            Err(err) => return Err(format!("cannot read {}: {err}", path.display())),
        };
        serde_json::from_str(&raw).map_err(|err| format!("cannot parse {}: {err}", path.display()))
    }
}

/// Token authenticator block.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// Base64-encoded signing key, at least 32 bytes once decoded.
    pub key: String,
    /// Token lifetime in seconds.
    pub expire_in: i64,
    /// Serial number; bumping it invalidates all outstanding tokens.
    pub serial_num: u16,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            key: String::new(),
            expire_in: 1_209_600, // two weeks
            serial_num: 0,
        }
    }
}

/// Storage adapter selection.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Adapter name; only "mem" ships in-tree.
    pub adapter: String,
    /// Opaque adapter settings, passed through untouched.
    pub config: Value,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            adapter: "mem".to_string(),
            config: Value::Null,
        }
    }
}

/// One push backend.
#[derive(Debug, Clone, Deserialize)]
pub struct PushConfig {
    pub name: String,
    #[serde(default)]
    pub config: Value,
}

/// Cluster membership and failover knobs.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClusterConfig {
    /// Name of this node; empty disables clustering.
    #[serde(default, rename = "self")]
    pub this_name: String,
    #[serde(default)]
    pub nodes: Vec<ClusterNodeConfig>,
    #[serde(default)]
    pub failover: Option<FailoverConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClusterNodeConfig {
    pub name: String,
    pub addr: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    pub enabled: bool,
    /// How long a peer stays unreachable before it is declared dead.
    pub node_down_after_ms: u64,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            node_down_after_ms: 10_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.listen, "0.0.0.0:6060");
        assert_eq!(cfg.max_subscriber_count, 32);
        assert!(cfg.cluster.this_name.is_empty());
        assert_eq!(cfg.store_config.adapter, "mem");
    }

    #[test]
    fn parses_cluster_section() {
        let raw = r#"{
            "listen": ":7070",
            "cluster": {
                "self": "one",
                "nodes": [
                    {"name": "one", "addr": "localhost:12001"},
                    {"name": "two", "addr": "localhost:12002"}
                ],
                "failover": {"enabled": true, "node_down_after_ms": 5000}
            }
        }"#;
        let cfg: Config = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.listen, ":7070");
        assert_eq!(cfg.cluster.this_name, "one");
        assert_eq!(cfg.cluster.nodes.len(), 2);
        assert_eq!(cfg.cluster.failover.unwrap().node_down_after_ms, 5000);
        // Unset fields fall back to defaults.
        assert_eq!(cfg.max_subscriber_count, 32);
    }

    #[test]
    fn rejects_malformed_json() {
        let dir = std::env::temp_dir().join("palaver-config-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("broken.conf");
        std::fs::write(&path, "{not json").unwrap();
        assert!(Config::load(&path).is_err());
        std::fs::remove_file(&path).ok();
    }
}
