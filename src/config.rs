use std::net::SocketAddr;
use std::path::Path;

use serde::Deserialize;

use crate::error::{CronError, Result};

/// Process-wide configuration, loaded from a JSON file. Missing fields fall
/// back to the defaults below, so an empty file (or no file at all) yields a
/// usable single-node setup against a local redis.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Conf {
    pub base: BaseConf,
    pub gossip: GossipConf,
    pub custom: CustomConf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BaseConf {
    pub http_addr: String,
    pub redis_url: String,
}

impl Default for BaseConf {
    fn default() -> Self {
        Self {
            http_addr: ":8080".to_string(),
            redis_url: "redis://127.0.0.1:6379".to_string(),
        }
    }
}

impl BaseConf {
    /// Resolve `http_addr` to a socket address. A bare `:port` binds all
    /// interfaces, matching the usual server convention.
    pub fn http_socket_addr(&self) -> Result<SocketAddr> {
        let addr = if self.http_addr.starts_with(':') {
            format!("0.0.0.0{}", self.http_addr)
        } else {
            self.http_addr.clone()
        };
        addr.parse()
            .map_err(|_| CronError::Internal(format!("invalid http_addr: {}", self.http_addr)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum GossipNetwork {
    #[serde(rename = "LAN")]
    Lan,
    #[serde(rename = "WAN")]
    Wan,
    #[serde(rename = "Local")]
    Local,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GossipConf {
    pub network: GossipNetwork,
    pub node_name: String,
    pub bind_addr: String,
    pub bind_port: u16,
    /// Address advertised to peers. Empty means derive from `bind_addr`
    /// (loopback when bound to all interfaces).
    pub advertise_addr: String,
}

impl Default for GossipConf {
    fn default() -> Self {
        Self {
            network: GossipNetwork::Lan,
            node_name: default_node_name(),
            bind_addr: "0.0.0.0".to_string(),
            bind_port: 7946,
            advertise_addr: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CustomConf {
    pub key_entry: String,
    pub key_timeline: String,
    pub key_executor: String,
    pub max_history_num: i64,
    pub max_output_length: usize,
}

impl Default for CustomConf {
    fn default() -> Self {
        Self {
            key_entry: "_entry".to_string(),
            key_timeline: "_timeline".to_string(),
            key_executor: "_exe".to_string(),
            max_history_num: 5,
            max_output_length: 1000,
        }
    }
}

impl Conf {
    pub fn load(path: impl AsRef<Path>) -> Result<Conf> {
        let data = std::fs::read_to_string(path)?;
        let conf = serde_json::from_str(&data)?;
        Ok(conf)
    }
}

fn default_node_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| format!("node-{}", std::process::id()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_sections() {
        let conf: Conf = serde_json::from_str("{}").unwrap();
        assert_eq!(conf.base.http_addr, ":8080");
        assert_eq!(conf.gossip.bind_port, 7946);
        assert_eq!(conf.gossip.network, GossipNetwork::Lan);
        assert_eq!(conf.custom.key_timeline, "_timeline");
        assert_eq!(conf.custom.max_history_num, 5);
        assert_eq!(conf.custom.max_output_length, 1000);
    }

    #[test]
    fn partial_sections_keep_defaults() {
        let conf: Conf = serde_json::from_str(
            r#"{"gossip": {"network": "Local", "bind_port": 8001}, "custom": {"max_history_num": 3}}"#,
        )
        .unwrap();
        assert_eq!(conf.gossip.network, GossipNetwork::Local);
        assert_eq!(conf.gossip.bind_port, 8001);
        assert_eq!(conf.gossip.bind_addr, "0.0.0.0");
        assert_eq!(conf.custom.max_history_num, 3);
        assert_eq!(conf.custom.key_entry, "_entry");
    }

    #[test]
    fn http_addr_without_host_binds_all_interfaces() {
        let base = BaseConf::default();
        assert_eq!(
            base.http_socket_addr().unwrap(),
            "0.0.0.0:8080".parse().unwrap()
        );
    }
}
