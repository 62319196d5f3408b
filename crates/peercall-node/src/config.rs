use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use peercall_protocol::codec::SIGNALING_PORT;

/// Node configuration, loaded from a TOML file.
///
/// Only process-level knobs live here. Everything the user edits (contacts,
/// identity, connect policy) is kept in the encrypted store.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// IP address to listen on (default "::", dual-stack).
    #[serde(default = "default_host")]
    pub host: String,

    /// TCP port for signaling connections.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Port contacts are dialed on.
    #[serde(default = "default_port")]
    pub peer_port: u16,

    /// Path of the encrypted database file.
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,

    /// How long a presence probe waits for the `pong`.
    #[serde(default = "default_probe_read_timeout_ms")]
    pub probe_read_timeout_ms: u64,

    /// How long a call waits for each signaling reply before giving up.
    /// Does not apply while the call is connected or the user is ringing.
    #[serde(default = "default_call_read_timeout_secs")]
    pub call_read_timeout_secs: u64,

    /// How long an incoming call rings before it counts as missed.
    #[serde(default = "default_ring_timeout_secs")]
    pub ring_timeout_secs: u64,
}

fn default_host() -> String {
    "::".into()
}

fn default_port() -> u16 {
    SIGNALING_PORT
}

fn default_store_path() -> PathBuf {
    "peercall.db".into()
}

fn default_probe_read_timeout_ms() -> u64 {
    3000
}

fn default_call_read_timeout_secs() -> u64 {
    30
}

fn default_ring_timeout_secs() -> u64 {
    60
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            peer_port: default_port(),
            store_path: default_store_path(),
            probe_read_timeout_ms: default_probe_read_timeout_ms(),
            call_read_timeout_secs: default_call_read_timeout_secs(),
            ring_timeout_secs: default_ring_timeout_secs(),
        }
    }
}

impl NodeConfig {
    pub fn probe_read_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_read_timeout_ms)
    }

    pub fn call_read_timeout(&self) -> Duration {
        Duration::from_secs(self.call_read_timeout_secs)
    }

    pub fn ring_timeout(&self) -> Duration {
        Duration::from_secs(self.ring_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = NodeConfig::default();
        assert_eq!(config.port, 10001);
        assert_eq!(config.peer_port, 10001);
        assert_eq!(config.host, "::");
        assert_eq!(config.probe_read_timeout(), Duration::from_secs(3));
    }

    #[test]
    fn config_toml_deserialization() {
        let toml = r#"
            host = "0.0.0.0"
            port = 12345
            store_path = "/tmp/node.db"
            probe_read_timeout_ms = 500
        "#;
        let config: NodeConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 12345);
        assert_eq!(config.store_path, PathBuf::from("/tmp/node.db"));
        assert_eq!(config.probe_read_timeout_ms, 500);
        assert_eq!(config.call_read_timeout_secs, 30);
    }
}
