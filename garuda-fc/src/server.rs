//! TCP command server (network link)
//!
//! One frame per connection, like the firmware it replaces:
//!
//! ```text
//! 1. Accept (non-blocking listener, 10ms idle sleep)
//! 2. Read one frame (per-connection read timeout)
//! 3. Dispatch, write the reply if there is one
//! 4. Close
//! ```
//!
//! Connections are served one at a time. A `reset` command drops the
//! listener and binds a new one on the same address.

use crate::dispatcher::CommandDispatcher;
use crate::error::{Error, Result};
use setu_proto::{Framer, Framing};
use std::io::ErrorKind;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

/// Delay between bind attempts after a reset
const REBIND_DELAY: Duration = Duration::from_millis(100);

/// Command server owning the dispatcher
pub struct CommandServer {
    listener: Option<TcpListener>,
    address: SocketAddr,
    dispatcher: CommandDispatcher,
    framing: Framing,
    read_timeout: Duration,
    running: Arc<AtomicBool>,
}

impl CommandServer {
    /// Wrap an already bound listener
    pub fn new(
        listener: TcpListener,
        dispatcher: CommandDispatcher,
        framing: Framing,
        read_timeout: Duration,
        running: Arc<AtomicBool>,
    ) -> Result<Self> {
        listener.set_nonblocking(true)?;
        let address = listener.local_addr()?;
        Ok(Self {
            listener: Some(listener),
            address,
            dispatcher,
            framing,
            read_timeout,
            running,
        })
    }

    /// Bind `address` and wrap the listener
    pub fn bind(
        address: &str,
        dispatcher: CommandDispatcher,
        framing: Framing,
        read_timeout: Duration,
        running: Arc<AtomicBool>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(address)
            .map_err(|e| Error::Other(format!("Failed to bind to {}: {}", address, e)))?;
        Self::new(listener, dispatcher, framing, read_timeout, running)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    pub fn dispatcher(&self) -> &CommandDispatcher {
        &self.dispatcher
    }

    /// Serve until the running flag is cleared
    pub fn run(&mut self) -> Result<()> {
        log::info!("Command server listening on {}", self.address);

        while self.running.load(Ordering::Relaxed) {
            let Some(listener) = &self.listener else {
                self.rebind();
                continue;
            };

            match listener.accept() {
                Ok((stream, peer)) => {
                    if self.handle_connection(stream, peer) {
                        self.restart();
                    }
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(10));
                }
                Err(e) => {
                    log::error!("Accept error: {}", e);
                }
            }
        }

        log::info!("Command server stopped");
        Ok(())
    }

    /// Serve one connection; true if the listener must be rebuilt
    fn handle_connection(&mut self, mut stream: TcpStream, peer: SocketAddr) -> bool {
        log::debug!("Connection from {}", peer);

        if let Err(e) = stream.set_nonblocking(false) {
            log::error!("Failed to set socket to blocking mode: {}", e);
            return false;
        }
        if let Err(e) = stream.set_read_timeout(Some(self.read_timeout)) {
            log::warn!("Failed to set read timeout: {}", e);
        }

        let mut framer = Framer::new(self.framing);
        let restart = match framer.read_frame(&mut stream) {
            Ok(Some(text)) => {
                log::debug!("{} -> {}", peer, text);
                let response = self.dispatcher.dispatch(peer.ip(), &text);
                if let Some(reply) = &response.reply {
                    log::debug!("{} <- {}", peer, reply);
                    if let Err(e) = framer.write_frame(&mut stream, reply) {
                        log::warn!("Failed to reply to {}: {}", peer, e);
                    }
                }
                response.restart
            }
            Ok(None) => {
                log::debug!("No frame from {} within {:?}", peer, self.read_timeout);
                false
            }
            Err(e) => {
                log::warn!("Failed to read from {}: {}", peer, e);
                false
            }
        };

        let _ = stream.shutdown(Shutdown::Both);
        restart
    }

    fn restart(&mut self) {
        log::info!("Restarting command server on {}", self.address);
        self.listener = None;
        self.rebind();
    }

    /// Bind the listener again, retrying until it works or shutdown
    fn rebind(&mut self) {
        while self.running.load(Ordering::Relaxed) {
            match TcpListener::bind(self.address).and_then(|l| l.set_nonblocking(true).map(|_| l)) {
                Ok(listener) => {
                    log::info!("Command server listening on {}", self.address);
                    self.listener = Some(listener);
                    return;
                }
                Err(e) => {
                    log::error!("Failed to rebind {}: {}", self.address, e);
                    thread::sleep(REBIND_DELAY);
                }
            }
        }
    }
}
