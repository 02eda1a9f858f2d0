//! Pairing link transports
//!
//! The pairing link is a byte stream between the device and the controller
//! that exists before either side is on the network. On hardware it is a
//! Bluetooth SPP / UART device node; for simulation a TCP socket stands in.

use crate::config::{PairingConfig, PairingTransport};
use crate::error::Result;
use std::io::{Read, Write};
use std::sync::atomic::AtomicBool;
use std::time::Duration;

#[cfg(test)]
pub(crate) mod mock;
mod serial;
mod tcp;

pub use serial::SerialLink;
pub use tcp::TcpLink;

/// Byte stream carrying pairing frames
///
/// Reads must time out (returning `WouldBlock`/`TimedOut`) so callers can
/// check their running flag between frames.
pub trait PairingLink: Read + Write + Send {
    /// Human-readable endpoint for logs
    fn describe(&self) -> String;
}

/// Open the pairing link described by `config`.
///
/// For `tcp` this blocks until a controller connects or `running` is cleared.
pub fn open_pairing_link(
    config: &PairingConfig,
    read_timeout: Duration,
    running: &AtomicBool,
) -> Result<Box<dyn PairingLink>> {
    match config.transport {
        PairingTransport::Serial => Ok(Box::new(SerialLink::open(
            &config.port,
            config.baud_rate,
            read_timeout,
        )?)),
        PairingTransport::Tcp => Ok(Box::new(TcpLink::accept(
            &config.listen_address,
            read_timeout,
            running,
        )?)),
    }
}
