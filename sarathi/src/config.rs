//! Configuration loading for Sarathi

use crate::error::{Result, SarathiError};
use serde::Deserialize;
use setu_proto::Framing;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

/// Main configuration structure
#[derive(Clone, Debug, Default, Deserialize)]
pub struct SarathiConfig {
    #[serde(default)]
    pub pairing: PairingConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub app: AppConfig,
    #[serde(default)]
    pub wire: WireConfig,
}

/// How the pairing link reaches the device
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PairingTransport {
    /// RFCOMM / UART device node
    Serial,
    /// TCP socket to a simulated device
    Tcp,
}

/// Pairing link settings
#[derive(Clone, Debug, Deserialize)]
pub struct PairingConfig {
    /// Name the device advertises (default: mpy-uart)
    #[serde(default = "default_device_name")]
    pub device_name: String,

    #[serde(default = "default_pairing_transport")]
    pub transport: PairingTransport,

    /// Serial device node bound to the paired device
    #[serde(default = "default_pairing_port")]
    pub port: String,

    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Device pairing address when `transport = "tcp"`
    #[serde(default = "default_pairing_address")]
    pub address: String,
}

/// Network link settings
#[derive(Clone, Debug, Deserialize)]
pub struct NetworkConfig {
    /// Network the device should join
    #[serde(default)]
    pub ssid: String,

    #[serde(default)]
    pub password: String,

    /// Own address sent in WLANDATA (default: route lookup towards the device)
    #[serde(default)]
    pub controller_address: Option<IpAddr>,

    /// Connection timeout in milliseconds (default: 3000)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Wait for a reply in milliseconds (default: 2000)
    #[serde(default = "default_receive_timeout")]
    pub receive_timeout_ms: u64,
}

/// Intervals of the background tasks, in seconds
#[derive(Clone, Debug, Deserialize)]
pub struct PollingConfig {
    /// Control vector send interval, overridden by the `tick` setting
    #[serde(default = "default_tick")]
    pub tick_secs: f64,

    #[serde(default = "default_telemetry")]
    pub telemetry_secs: f64,

    #[serde(default = "default_link_quality")]
    pub link_quality_secs: f64,

    #[serde(default = "default_pairing_check")]
    pub pairing_check_secs: f64,

    /// Base interval of the registration retry (backoff doubles it up to 8x)
    #[serde(default = "default_registration")]
    pub registration_secs: f64,

    #[serde(default = "default_ack")]
    pub ack_secs: f64,

    #[serde(default = "default_animation")]
    pub animation_secs: f64,

    /// Failed registrations before "Connection failed" is shown
    #[serde(default = "default_max_registration_attempts")]
    pub max_registration_attempts: u32,
}

/// Application behaviour
#[derive(Clone, Debug, Deserialize)]
pub struct AppConfig {
    /// Skip the handshake and report Ready after `offline_delay_ms`
    #[serde(default)]
    pub offline_mode: bool,

    #[serde(default = "default_offline_delay")]
    pub offline_delay_ms: u64,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct WireConfig {
    #[serde(default)]
    pub framing: Framing,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            device_name: default_device_name(),
            transport: default_pairing_transport(),
            port: default_pairing_port(),
            baud_rate: default_baud_rate(),
            address: default_pairing_address(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            ssid: String::new(),
            password: String::new(),
            controller_address: None,
            connect_timeout_ms: default_connect_timeout(),
            receive_timeout_ms: default_receive_timeout(),
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_tick(),
            telemetry_secs: default_telemetry(),
            link_quality_secs: default_link_quality(),
            pairing_check_secs: default_pairing_check(),
            registration_secs: default_registration(),
            ack_secs: default_ack(),
            animation_secs: default_animation(),
            max_registration_attempts: default_max_registration_attempts(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            offline_mode: false,
            offline_delay_ms: default_offline_delay(),
        }
    }
}

// Default value functions
fn default_device_name() -> String {
    "mpy-uart".to_string()
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

fn default_pairing_address() -> String {
    "127.0.0.1:9191".to_string()
}

fn default_connect_timeout() -> u64 {
    3000
}

fn default_receive_timeout() -> u64 {
    2000
}

fn default_tick() -> f64 {
    0.1
}

fn default_telemetry() -> f64 {
    1.0
}

fn default_link_quality() -> f64 {
    2.0
}

fn default_pairing_check() -> f64 {
    1.0
}

fn default_registration() -> f64 {
    1.0
}

fn default_ack() -> f64 {
    0.2
}

fn default_animation() -> f64 {
    0.5
}

fn default_max_registration_attempts() -> u32 {
    5
}

fn default_offline_delay() -> u64 {
    1000
}

/// Seconds to a duration, clamped to at least 1ms
pub fn secs(value: f64) -> Duration {
    if value.is_finite() && value > 0.001 {
        Duration::from_secs_f64(value)
    } else {
        Duration::from_millis(1)
    }
}

impl SarathiConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SarathiError::Config(format!("Failed to read config file: {}", e)))?;
        let config: SarathiConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.network.connect_timeout_ms)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.network.receive_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SarathiConfig::default();
        assert_eq!(config.pairing.device_name, "mpy-uart");
        assert_eq!(config.polling.max_registration_attempts, 5);
        assert_eq!(config.wire.framing, Framing::Line);
        assert!(!config.app.offline_mode);
        assert_eq!(config.receive_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn test_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sarathi.toml");
        std::fs::write(
            &path,
            r#"
            [pairing]
            transport = "tcp"
            address = "192.168.4.1:9191"

            [network]
            ssid = "field"
            password = "hunter2"

            [polling]
            tick_secs = 0.05
            "#,
        )
        .unwrap();

        let config = SarathiConfig::load(&path).unwrap();
        assert_eq!(config.pairing.transport, PairingTransport::Tcp);
        assert_eq!(config.network.ssid, "field");
        assert_eq!(config.polling.tick_secs, 0.05);
        assert_eq!(config.polling.telemetry_secs, 1.0);
    }

    #[test]
    fn test_invalid_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[polling]\ntick_secs = \"fast\"").unwrap();
        assert!(matches!(
            SarathiConfig::load(&path),
            Err(SarathiError::Config(_))
        ));
    }

    #[test]
    fn test_secs_clamps() {
        assert_eq!(secs(0.0), Duration::from_millis(1));
        assert_eq!(secs(f64::NAN), Duration::from_millis(1));
        assert_eq!(secs(0.5), Duration::from_millis(500));
    }
}
