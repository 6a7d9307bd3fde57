use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UptermConfig {
    #[serde(default = "_default_ssh_listen")]
    pub ssh_listen: String,

    /// WebSocket transport endpoint; absent disables the adapter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ws_listen: Option<String>,

    /// Address advertised to clients as the owner of sessions published
    /// on this node. Must be reachable from every other node.
    #[serde(default = "_default_node_addr")]
    pub node_addr: String,

    /// `scheme://addr` put into session descriptors.
    #[serde(default = "_default_host_url")]
    pub host_url: String,

    #[serde(default = "_default_keys_dir")]
    pub keys_dir: PathBuf,

    #[serde(default = "_default_keepalive_interval", with = "humantime_serde")]
    pub keepalive_interval: Duration,

    /// Bytes of recent PTY output replayed to late joiners.
    #[serde(default = "_default_replay_buffer_size")]
    pub replay_buffer_size: usize,

    #[serde(
        default = "_default_graceful_shutdown_timeout",
        with = "humantime_serde"
    )]
    pub graceful_shutdown_timeout: Duration,

    #[serde(default)]
    pub routing: RoutingConfig,
}

impl Default for UptermConfig {
    fn default() -> Self {
        Self {
            ssh_listen: _default_ssh_listen(),
            ws_listen: None,
            node_addr: _default_node_addr(),
            host_url: _default_host_url(),
            keys_dir: _default_keys_dir(),
            keepalive_interval: _default_keepalive_interval(),
            replay_buffer_size: _default_replay_buffer_size(),
            graceful_shutdown_timeout: _default_graceful_shutdown_timeout(),
            routing: RoutingConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoutingConfig {
    #[serde(default)]
    pub mode: RoutingMode,

    #[serde(default = "_default_consul_url")]
    pub consul_url: String,

    #[serde(default = "_default_consul_ttl", with = "humantime_serde")]
    pub consul_ttl: Duration,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            mode: RoutingMode::default(),
            consul_url: _default_consul_url(),
            consul_ttl: _default_consul_ttl(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoutingMode {
    #[default]
    #[serde(rename = "embedded")]
    Embedded,
    #[serde(rename = "consul")]
    Consul,
}

#[inline]
fn _default_ssh_listen() -> String {
    "0.0.0.0:2222".to_owned()
}

#[inline]
fn _default_node_addr() -> String {
    "127.0.0.1:2222".to_owned()
}

#[inline]
fn _default_host_url() -> String {
    "ssh://127.0.0.1:2222".to_owned()
}

#[inline]
fn _default_keys_dir() -> PathBuf {
    "./data/keys".into()
}

const fn _default_keepalive_interval() -> Duration {
    Duration::from_secs(10)
}

const fn _default_replay_buffer_size() -> usize {
    16384
}

const fn _default_graceful_shutdown_timeout() -> Duration {
    Duration::from_secs(5)
}

#[inline]
fn _default_consul_url() -> String {
    "http://127.0.0.1:8500".to_owned()
}

const fn _default_consul_ttl() -> Duration {
    Duration::from_secs(15)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_gets_defaults() {
        let config: UptermConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.ssh_listen, "0.0.0.0:2222");
        assert_eq!(config.routing.mode, RoutingMode::Embedded);
        assert_eq!(config.keepalive_interval, Duration::from_secs(10));
    }

    #[test]
    fn test_routing_mode_names() {
        let config: UptermConfig =
            serde_json::from_str(r#"{"routing": {"mode": "consul"}}"#).unwrap();
        assert_eq!(config.routing.mode, RoutingMode::Consul);
        assert_eq!(config.routing.consul_url, "http://127.0.0.1:8500");
    }
}
