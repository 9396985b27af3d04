//! Top-level daemon configuration: listen address, logging, and the
//! per-peer IKE configuration table loaded via `config`/`serde`/`toml`.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

use crate::network::ike::config::{PeerConfigurations, RawIkeConfig};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct IkeDaemonConfig {
    pub listen_addr: String,
    pub listen_port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub peers: HashMap<String, RawIkeConfig>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl IkeDaemonConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name("ikev2d.toml").required(false))
            .add_source(File::with_name("/etc/ikev2d/config.toml").required(false))
            .add_source(Environment::with_prefix("IKEV2D").separator("__"))
            .set_default("listen_addr", "0.0.0.0")?
            .set_default("listen_port", 500)?
            .set_default("log_level", "info")?
            .build()?;

        config.try_deserialize()
    }

    pub fn my_addr(&self) -> Result<Ipv4Addr, std::net::AddrParseError> {
        self.listen_addr.parse()
    }

    /// Validates and converts the raw per-peer table into the daemon's
    /// working configuration set, keyed by peer address.
    pub fn peer_configurations(&self) -> Result<PeerConfigurations, crate::network::ike::config::ConfigError> {
        PeerConfigurations::load(self.my_addr().map_err(|e| {
            crate::network::ike::config::ConfigError::Invalid(format!("invalid listen_addr: {e}"))
        })?, self.peers.clone())
    }
}
