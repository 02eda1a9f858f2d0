//! Configuration for the Garuda daemon
//!
//! Loads configuration from a TOML file. Every field has a default, so a
//! partial file (or none at all) is valid.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use setu_proto::Framing;
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

/// Top-level daemon configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub pairing: PairingConfig,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub wire: WireConfig,
}

/// Command server (network link)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// TCP bind address for commands
    ///
    /// Examples:
    /// - `0.0.0.0:9192` - all interfaces, the port the firmware always used
    /// - `127.0.0.1:0` - localhost, any free port
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Per-connection read timeout in milliseconds
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Address reported to the controller in `STAINFO`.
    /// Discovered from the routing table when unset.
    #[serde(default)]
    pub advertise_address: Option<IpAddr>,
}

/// How the pairing link is exposed to the daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PairingTransport {
    /// Bluetooth SPP / UART device node
    Serial,
    /// TCP listener standing in for the radio (simulation)
    Tcp,
}

/// Pairing link configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PairingConfig {
    #[serde(default = "default_pairing_transport")]
    pub transport: PairingTransport,

    /// Serial device path (e.g. `/dev/rfcomm0`, `/dev/ttyS1`)
    #[serde(default = "default_pairing_port")]
    pub port: String,

    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Listen address when `transport = "tcp"`
    #[serde(default = "default_pairing_listen")]
    pub listen_address: String,
}

/// Device identity and local state
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceConfig {
    /// Name the controller looks for among its paired devices
    #[serde(default = "default_device_name")]
    pub name: String,

    /// JSON file where `set_config` payloads are persisted (in memory only when unset)
    #[serde(default)]
    pub settings_path: Option<String>,
}

/// Stream framing shared by both links
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct WireConfig {
    #[serde(default)]
    pub framing: Framing,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            read_timeout_ms: default_read_timeout_ms(),
            advertise_address: None,
        }
    }
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            transport: default_pairing_transport(),
            port: default_pairing_port(),
            baud_rate: default_baud_rate(),
            listen_address: default_pairing_listen(),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: default_device_name(),
            settings_path: None,
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0:9192".to_string()
}

fn default_read_timeout_ms() -> u64 {
    500
}

fn default_pairing_transport() -> PairingTransport {
    PairingTransport::Serial
}

fn default_pairing_port() -> String {
    "/dev/rfcomm0".to_string()
}

fn default_baud_rate() -> u32 {
    115200
}

fn default_pairing_listen() -> String {
    "0.0.0.0:9191".to_string()
}

fn default_device_name() -> String {
    "mpy-uart".to_string()
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.server.read_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.bind_address, "0.0.0.0:9192");
        assert_eq!(config.device.name, "mpy-uart");
        assert_eq!(config.pairing.transport, PairingTransport::Serial);
        assert_eq!(config.wire.framing, Framing::Line);
        assert_eq!(config.read_timeout(), Duration::from_millis(500));
    }

    #[test]
    fn test_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            [pairing]
            transport = "tcp"
            listen_address = "127.0.0.1:7000"

            [wire]
            framing = "raw"
            "#,
        )
        .unwrap();
        assert_eq!(config.pairing.transport, PairingTransport::Tcp);
        assert_eq!(config.pairing.listen_address, "127.0.0.1:7000");
        assert_eq!(config.pairing.baud_rate, 115200);
        assert_eq!(config.wire.framing, Framing::Raw);
        assert_eq!(config.server.bind_address, "0.0.0.0:9192");
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garuda.toml");

        let mut config = Config::default();
        config.device.settings_path = Some("/var/lib/garuda/settings.json".into());
        config.server.advertise_address = Some("10.0.0.5".parse().unwrap());
        config.to_file(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.device.settings_path, config.device.settings_path);
        assert_eq!(loaded.server.advertise_address, config.server.advertise_address);
    }

    #[test]
    fn test_missing_file_is_config_error() {
        assert!(matches!(
            Config::load("/nonexistent/garuda.toml"),
            Err(Error::Config(_))
        ));
    }
}
