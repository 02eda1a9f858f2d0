//! Garuda - flight controller daemon
//!
//! ## Links
//!
//! - **Pairing link**: credential handoff (`WLAN`, `WC`, `STAINFO`, `WLANDATA`, `WS`)
//! - **TCP (port 9192)**: commands, one frame per connection
//!
//! Only the controller that registered first may use private commands.

use garuda_fc::app::GarudaApp;
use garuda_fc::config::Config;
use garuda_fc::error::{Error, Result};
use std::env;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

const DEFAULT_CONFIG_PATH: &str = "/etc/garuda.toml";

/// Command line options
struct Args {
    config_path: Option<String>,
    no_provisioning: bool,
}

/// Parse command line arguments.
///
/// Supports:
/// - `garuda-fc <path>` (positional)
/// - `garuda-fc --config <path>` / `-c <path>`
/// - `--no-provisioning` to bind the command server directly
fn parse_args() -> Args {
    let args: Vec<String> = env::args().collect();
    let mut parsed = Args {
        config_path: None,
        no_provisioning: false,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" if i + 1 < args.len() => {
                parsed.config_path = Some(args[i + 1].clone());
                i += 1;
            }
            "--no-provisioning" => parsed.no_provisioning = true,
            other if !other.starts_with('-') && parsed.config_path.is_none() => {
                parsed.config_path = Some(other.to_string());
            }
            other => log::warn!("Ignoring argument: {}", other),
        }
        i += 1;
    }
    parsed
}

fn load_config(path: Option<&str>) -> Result<Config> {
    match path {
        Some(path) => {
            log::info!("Using config: {}", path);
            Config::load(path)
        }
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
            log::info!("Using config: {}", DEFAULT_CONFIG_PATH);
            Config::load(DEFAULT_CONFIG_PATH)
        }
        None => {
            log::info!("Using default configuration");
            Ok(Config::default())
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    log::info!("Garuda v{} starting...", env!("CARGO_PKG_VERSION"));

    let args = parse_args();
    let config = load_config(args.config_path.as_deref())?;
    log::info!(
        "Device: {} (framing {:?})",
        config.device.name,
        config.wire.framing
    );

    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    ctrlc::set_handler(move || {
        log::info!("Received shutdown signal");
        r.store(false, Ordering::Relaxed);
    })
    .map_err(|e| Error::Other(format!("Error setting Ctrl-C handler: {}", e)))?;

    let app = GarudaApp::new(config, running);
    if let Err(e) = app.run(args.no_provisioning) {
        if app.is_running() {
            return Err(e);
        }
        log::info!("Stopped during startup: {}", e);
    }

    log::info!("Garuda stopped");
    Ok(())
}
