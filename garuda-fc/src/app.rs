//! Daemon orchestration: provisioning, then command serving until shutdown

use crate::config::Config;
use crate::dispatcher::CommandDispatcher;
use crate::error::{Error, Result};
use crate::provisioning::{HostNetwork, Provisioner};
use crate::server::CommandServer;
use crate::settings::DeviceSettings;
use crate::telemetry::{SimulatedTelemetry, TelemetrySource};
use crate::transport::open_pairing_link;
use log::{info, warn};
use setu_proto::ProtoError;
use std::net::TcpListener;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

/// Pause before reopening a pairing link that dropped
const RELINK_DELAY: Duration = Duration::from_secs(1);

/// Main application structure
pub struct GarudaApp {
    config: Config,
    running: Arc<AtomicBool>,
}

impl GarudaApp {
    pub fn new(config: Config, running: Arc<AtomicBool>) -> Self {
        Self { config, running }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Provision (unless skipped) and serve commands until shutdown
    pub fn run(&self, skip_provisioning: bool) -> Result<()> {
        let dispatcher = self.build_dispatcher(Box::new(SimulatedTelemetry::new()))?;

        let listener = if skip_provisioning {
            info!("Provisioning skipped, binding {}", self.config.server.bind_address);
            TcpListener::bind(&self.config.server.bind_address).map_err(|e| {
                Error::Other(format!(
                    "Failed to bind to {}: {}",
                    self.config.server.bind_address, e
                ))
            })?
        } else {
            self.provision()?
        };

        let mut server = CommandServer::new(
            listener,
            dispatcher,
            self.config.wire.framing,
            self.config.read_timeout(),
            Arc::clone(&self.running),
        )?;
        server.run()
    }

    pub fn build_dispatcher(
        &self,
        telemetry: Box<dyn TelemetrySource>,
    ) -> Result<CommandDispatcher> {
        let settings = match &self.config.device.settings_path {
            Some(path) => DeviceSettings::open(path)?,
            None => DeviceSettings::in_memory(),
        };
        Ok(CommandDispatcher::new(settings, telemetry))
    }

    /// Run the pairing handoff, reopening the link whenever it drops
    pub fn provision(&self) -> Result<TcpListener> {
        info!(
            "Advertising as '{}' on the pairing link ({:?})",
            self.config.device.name, self.config.pairing.transport
        );

        let mut provisioner = Provisioner::new(
            self.config.wire.framing,
            Box::new(HostNetwork::new(self.config.server.advertise_address)),
            self.config.server.bind_address.clone(),
            Arc::clone(&self.running),
        );

        loop {
            let mut link = open_pairing_link(
                &self.config.pairing,
                self.config.read_timeout(),
                &self.running,
            )?;

            match provisioner.run(link.as_mut()) {
                Ok(provisioned) => return Ok(provisioned.listener),
                Err(Error::Proto(ProtoError::Disconnected)) | Err(Error::Io(_))
                    if self.running.load(Ordering::Relaxed) =>
                {
                    warn!("Pairing link {} lost, reopening", link.describe());
                    thread::sleep(RELINK_DELAY);
                }
                Err(e) => return Err(e),
            }
        }
    }
}
