//! Sarathi - headless controller
//!
//! Runs the connection handshake against a flight controller, submits the
//! configured network credentials when the device asks for them, and logs
//! status and telemetry until Ctrl-C.

use sarathi::config::{PairingTransport, SarathiConfig};
use sarathi::orchestrator::{Collaborators, ConnectionOrchestrator, ConnectionState};
use sarathi::pairing::{PairedDevice, PairingAdapter, SerialPairing, StaticPairing};
use sarathi::settings::MemorySettings;
use sarathi::translate::Passthrough;
use sarathi::transport::LinkEndpointAddress;
use sarathi::{Result, SarathiError};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{info, warn};

const DEFAULT_CONFIG_PATH: &str = "sarathi.toml";

/// How often the main thread looks at the orchestrator
const MONITOR_INTERVAL: Duration = Duration::from_millis(200);

fn load_config() -> Result<SarathiConfig> {
    let args: Vec<String> = std::env::args().collect();
    let path = match args.get(1).map(String::as_str) {
        Some("--config" | "-c") => args.get(2).cloned(),
        Some(path) if !path.starts_with('-') => Some(path.to_string()),
        _ => None,
    };

    match path {
        Some(path) => {
            info!("Loading configuration from {}", path);
            SarathiConfig::load(Path::new(&path))
        }
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
            info!("Loading configuration from {}", DEFAULT_CONFIG_PATH);
            SarathiConfig::load(Path::new(DEFAULT_CONFIG_PATH))
        }
        None => {
            info!("Using default configuration");
            Ok(SarathiConfig::default())
        }
    }
}

/// `host:port` of a simulated pairing link
fn tcp_pairing_endpoint(address: &str) -> Result<LinkEndpointAddress> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| SarathiError::Config(format!("pairing address '{}' has no port", address)))?;
    let port = port
        .parse()
        .map_err(|_| SarathiError::Config(format!("invalid pairing port in '{}'", address)))?;
    Ok(LinkEndpointAddress::new(host, port))
}

fn pairing_adapter(config: &SarathiConfig) -> Result<Arc<dyn PairingAdapter>> {
    let pairing = &config.pairing;
    Ok(match pairing.transport {
        PairingTransport::Serial => Arc::new(SerialPairing::new(
            pairing.device_name.clone(),
            pairing.port.clone(),
        )),
        PairingTransport::Tcp => Arc::new(StaticPairing::new(vec![PairedDevice::new(
            pairing.device_name.clone(),
            tcp_pairing_endpoint(&pairing.address)?,
        )])),
    })
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("sarathi=info")),
        )
        .init();

    info!("Sarathi v{}", env!("CARGO_PKG_VERSION"));
    let config = load_config()?;
    info!(
        "Looking for '{}' over {:?} pairing (framing {:?})",
        config.pairing.device_name, config.pairing.transport, config.wire.framing
    );

    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        r.store(false, Ordering::Relaxed);
    })
    .map_err(|e| SarathiError::Config(format!("Error setting Ctrl-C handler: {}", e)))?;

    let collaborators = Collaborators {
        pairing: pairing_adapter(&config)?,
        settings: Arc::new(MemorySettings::new()),
        translator: Arc::new(Passthrough),
    };
    let ssid = config.network.ssid.clone();
    let password = config.network.password.clone();
    let orchestrator = ConnectionOrchestrator::new(config, collaborators);
    orchestrator.start()?;

    let mut last_status = String::new();
    let mut last_telemetry = None;
    let mut warned_missing_ssid = false;

    while running.load(Ordering::Relaxed) {
        std::thread::sleep(MONITOR_INTERVAL);

        if orchestrator.state() == ConnectionState::CredentialHandoff
            && !orchestrator.has_credentials()
        {
            if ssid.is_empty() {
                if !warned_missing_ssid {
                    warn!("Device is waiting for credentials but [network] ssid is not set");
                    warned_missing_ssid = true;
                }
            } else if let Err(e) = orchestrator.submit_credentials(&ssid, &password) {
                warn!("Credentials rejected: {}", e);
            }
        }

        let status = orchestrator.status();
        if status != last_status {
            info!("[{}] {}", orchestrator.state(), status);
            last_status = status;
        }

        if let Some(session) = orchestrator.session()
            && let Some(t) = session.telemetry()
            && last_telemetry != Some(t)
        {
            info!(
                "Altitude {:.1}  speed {:.1}  position {:.5},{:.5}",
                t.altitude, t.speed, t.latitude, t.longitude
            );
            last_telemetry = Some(t);
        }
    }

    orchestrator.stop();
    info!("Sarathi stopped");
    Ok(())
}
