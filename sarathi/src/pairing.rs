//! Pairing radio adapter: is the radio on, and which devices are paired

use crate::transport::LinkEndpointAddress;
use parking_lot::Mutex;
use serialport::SerialPortType;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

/// A paired peer and where its pairing link is reached
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairedDevice {
    pub name: String,
    pub endpoint: LinkEndpointAddress,
}

impl PairedDevice {
    pub fn new(name: impl Into<String>, endpoint: LinkEndpointAddress) -> Self {
        Self {
            name: name.into(),
            endpoint,
        }
    }
}

pub trait PairingAdapter: Send + Sync {
    fn is_enabled(&self) -> bool;

    fn paired_devices(&self) -> Vec<PairedDevice>;
}

/// Pairing links exposed as serial device nodes (RFCOMM, USB UART).
///
/// The node bound to the expected device is reported under that device's
/// name; other ports are reported under their product name or path.
pub struct SerialPairing {
    device_name: String,
    port: String,
}

impl SerialPairing {
    pub fn new(device_name: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            device_name: device_name.into(),
            port: port.into(),
        }
    }
}

impl PairingAdapter for SerialPairing {
    fn is_enabled(&self) -> bool {
        match serialport::available_ports() {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!("Serial port enumeration failed: {}", e);
                false
            }
        }
    }

    fn paired_devices(&self) -> Vec<PairedDevice> {
        let ports = serialport::available_ports().unwrap_or_default();
        let mut devices: Vec<PairedDevice> = ports
            .into_iter()
            .map(|port| {
                let name = if port.port_name == self.port {
                    self.device_name.clone()
                } else {
                    match &port.port_type {
                        SerialPortType::UsbPort(usb) => {
                            usb.product.clone().unwrap_or_else(|| port.port_name.clone())
                        }
                        _ => port.port_name.clone(),
                    }
                };
                PairedDevice::new(name, LinkEndpointAddress::new(port.port_name, 0))
            })
            .collect();

        // rfcomm nodes are not always enumerated
        let listed = devices.iter().any(|d| d.endpoint.address == self.port);
        if !listed && Path::new(&self.port).exists() {
            devices.push(PairedDevice::new(
                self.device_name.clone(),
                LinkEndpointAddress::new(self.port.clone(), 0),
            ));
        }
        devices
    }
}

/// Fixed device list with a switchable radio
#[derive(Debug)]
pub struct StaticPairing {
    enabled: AtomicBool,
    devices: Mutex<Vec<PairedDevice>>,
}

impl StaticPairing {
    pub fn new(devices: Vec<PairedDevice>) -> Self {
        Self {
            enabled: AtomicBool::new(true),
            devices: Mutex::new(devices),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn set_devices(&self, devices: Vec<PairedDevice>) {
        *self.devices.lock() = devices;
    }
}

impl PairingAdapter for StaticPairing {
    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    fn paired_devices(&self) -> Vec<PairedDevice> {
        self.devices.lock().clone()
    }
}
