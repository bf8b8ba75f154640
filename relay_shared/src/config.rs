//! Configuration system.
//!
//! Loads relay configuration from JSON strings/files (file IO left to app).

use serde::{Deserialize, Serialize};

/// Root configuration shared by client/server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Server listen/connect address, e.g. `0.0.0.0:2021`.
    pub server_addr: String,
    /// Lowest UDP port handed out for datagram channels.
    #[serde(default = "default_udp_min_port")]
    pub udp_min_port: u16,
    /// Highest UDP port handed out for datagram channels.
    #[serde(default = "default_udp_max_port")]
    pub udp_max_port: u16,
    /// Rider identity (client only).
    #[serde(default = "default_user_id")]
    pub user_id: String,
    #[serde(default = "default_user_name")]
    pub user_name: String,
    #[serde(default = "default_user_domain")]
    pub user_domain: String,
}

fn default_udp_min_port() -> u16 {
    30001
}

fn default_udp_max_port() -> u16 {
    40000
}

fn default_user_id() -> String {
    "0".to_string()
}

fn default_user_name() -> String {
    "Rider".to_string()
}

fn default_user_domain() -> String {
    "local".to_string()
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            server_addr: "0.0.0.0:2021".to_string(),
            udp_min_port: default_udp_min_port(),
            udp_max_port: default_udp_max_port(),
            user_id: default_user_id(),
            user_name: default_user_name(),
            user_domain: default_user_domain(),
        }
    }
}

impl RelayConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_fills_defaults() {
        let cfg = RelayConfig::from_json_str(r#"{"server_addr":"127.0.0.1:2021"}"#).unwrap();
        assert_eq!(cfg.server_addr, "127.0.0.1:2021");
        assert_eq!(cfg.udp_min_port, 30001);
        assert_eq!(cfg.udp_max_port, 40000);
        assert_eq!(cfg.user_name, "Rider");
    }
}
