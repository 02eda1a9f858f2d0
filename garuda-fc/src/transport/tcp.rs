//! TCP pairing link for running without a radio

use super::PairingLink;
use crate::error::{Error, Result};
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

/// Pairing link over one accepted TCP connection
pub struct TcpLink {
    stream: TcpStream,
    peer: SocketAddr,
}

impl TcpLink {
    /// Bind `address` and wait for the controller to connect
    pub fn accept(address: &str, read_timeout: Duration, running: &AtomicBool) -> Result<Self> {
        let listener = TcpListener::bind(address)
            .map_err(|e| Error::Other(format!("Failed to bind pairing link {}: {}", address, e)))?;
        log::info!("Pairing link listening on {}", listener.local_addr()?);
        Self::accept_from(&listener, read_timeout, running)
    }

    /// Wait on an already bound listener
    pub fn accept_from(
        listener: &TcpListener,
        read_timeout: Duration,
        running: &AtomicBool,
    ) -> Result<Self> {
        listener.set_nonblocking(true)?;

        while running.load(Ordering::Relaxed) {
            match listener.accept() {
                Ok((stream, peer)) => {
                    stream.set_nonblocking(false)?;
                    stream.set_read_timeout(Some(read_timeout))?;
                    log::info!("Pairing link connected: {}", peer);
                    return Ok(Self { stream, peer });
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(10));
                }
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Err(Error::Other("Shutdown while waiting for pairing link".into()))
    }
}

impl Read for TcpLink {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for TcpLink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.stream.flush()
    }
}

impl PairingLink for TcpLink {
    fn describe(&self) -> String {
        format!("tcp {}", self.peer)
    }
}
