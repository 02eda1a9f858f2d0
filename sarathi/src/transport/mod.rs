//! Transport client: the same frame protocol over the pairing or network link.
//!
//! A [`TransportClient`] owns one remote target and any number of logical
//! channels to it, each with its own socket. A stalled read on one channel
//! never blocks sends on another.
//!
//! | Channel | Used for |
//! |---------|----------|
//! | `CONTROL` (0) | handshake, registration, control vector |
//! | `TELEMETRY` (1) | `get_sensor_data` polling |
//! | `LINK_QUALITY` (2) | `get_conn_data` polling |
//!
//! Reconnection is lazy: a channel opens its socket on the first send, and
//! in [`SessionMode::OneShot`] every later send reconnects (the device closes
//! the connection after one frame).

mod endpoint;
mod serial;
mod tcp;

pub use endpoint::LinkEndpoint;
pub use serial::SerialConnector;
pub use tcp::{TcpConnector, local_address_towards};

use crate::error::{Result, SarathiError};
use parking_lot::Mutex;
use setu_proto::{Frame, Framing};
use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::Duration;

/// Logical channel index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u8);

impl ChannelId {
    pub const CONTROL: ChannelId = ChannelId(0);
    pub const TELEMETRY: ChannelId = ChannelId(1);
    pub const LINK_QUALITY: ChannelId = ChannelId(2);
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ChannelId::CONTROL => write!(f, "control"),
            ChannelId::TELEMETRY => write!(f, "telemetry"),
            ChannelId::LINK_QUALITY => write!(f, "link-quality"),
            ChannelId(n) => write!(f, "channel-{}", n),
        }
    }
}

/// Remote side of a link. For serial links `address` is the device node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkEndpointAddress {
    pub address: String,
    pub port: u16,
}

impl LinkEndpointAddress {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }
}

impl fmt::Display for LinkEndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.port == 0 {
            write!(f, "{}", self.address)
        } else {
            write!(f, "{}:{}", self.address, self.port)
        }
    }
}

/// When a channel opens a new connection before sending
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    /// Fresh connection for every send after the first
    OneShot,
    /// Keep the connection until it fails
    Persistent,
}

/// One open byte stream
pub trait Link: Read + Write + Send {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()>;

    /// Close the stream; further use fails
    fn shutdown(&mut self);
}

/// Opens links of one kind
pub trait Connector: Send + Sync {
    fn connect(&self, endpoint: &LinkEndpointAddress, timeout: Duration) -> Result<Box<dyn Link>>;
}

/// Client for one remote target over any number of channels
pub struct TransportClient {
    name: &'static str,
    connector: Arc<dyn Connector>,
    mode: SessionMode,
    framing: Framing,
    connect_timeout: Duration,
    target: Mutex<Option<LinkEndpointAddress>>,
    channels: Mutex<HashMap<ChannelId, Arc<Mutex<LinkEndpoint>>>>,
}

impl TransportClient {
    pub fn new(
        name: &'static str,
        connector: Arc<dyn Connector>,
        mode: SessionMode,
        framing: Framing,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            name,
            connector,
            mode,
            framing,
            connect_timeout,
            target: Mutex::new(None),
            channels: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    /// Current target, if connected at least once since the last reset
    pub fn target(&self) -> Option<LinkEndpointAddress> {
        self.target.lock().clone()
    }

    /// Open the control channel to `address:port` and remember the target
    /// for the other channels. No retries.
    pub fn connect(&self, address: &str, port: u16) -> Result<()> {
        let endpoint = LinkEndpointAddress::new(address, port);
        *self.target.lock() = Some(endpoint);
        let result = self.connect_channel(ChannelId::CONTROL);
        if result.is_err() {
            *self.target.lock() = None;
        }
        result
    }

    /// Open (or reopen) one channel to the current target
    pub fn connect_channel(&self, channel: ChannelId) -> Result<()> {
        let target = self
            .target()
            .ok_or(SarathiError::NotConnected(channel))?;
        let endpoint = self.endpoint(channel);
        let mut endpoint = endpoint.lock();
        endpoint.open(&*self.connector, &target, self.connect_timeout, self.framing)?;
        tracing::debug!("{} {} connected to {}", self.name, channel, target);
        Ok(())
    }

    pub fn is_connected(&self, channel: ChannelId) -> bool {
        let endpoint = self.channels.lock().get(&channel).cloned();
        endpoint.is_some_and(|endpoint| endpoint.lock().is_connected())
    }

    /// Encode and write `frame` on `channel`, reconnecting first if needed
    pub fn send(&self, channel: ChannelId, frame: &Frame) -> Result<()> {
        let endpoint = self.endpoint(channel);
        let mut endpoint = endpoint.lock();
        self.prepare(channel, &mut endpoint)?;
        endpoint.send(&frame.encode())
    }

    /// Wait for a frame whose tag contains `match_tag` (empty matches any).
    ///
    /// Frames with other tags are discarded. `Ok(None)` when `timeout`
    /// elapses first; `None` blocks until a frame or an error.
    pub fn receive(
        &self,
        channel: ChannelId,
        match_tag: &str,
        timeout: Option<Duration>,
    ) -> Result<Option<Frame>> {
        let endpoint = self.endpoint(channel);
        let mut endpoint = endpoint.lock();
        if !endpoint.is_connected() {
            return Err(SarathiError::NotConnected(channel));
        }
        endpoint.receive(match_tag, timeout)
    }

    /// Send, then receive on the same connection, holding the channel
    /// for the whole exchange
    pub fn request(
        &self,
        channel: ChannelId,
        frame: &Frame,
        match_tag: &str,
        timeout: Option<Duration>,
    ) -> Result<Option<Frame>> {
        let endpoint = self.endpoint(channel);
        let mut endpoint = endpoint.lock();
        self.prepare(channel, &mut endpoint)?;
        endpoint.send(&frame.encode())?;
        endpoint.receive(match_tag, timeout)
    }

    /// Close one channel
    pub fn reset_channel(&self, channel: ChannelId) {
        let endpoint = self.channels.lock().get(&channel).cloned();
        if let Some(endpoint) = endpoint {
            endpoint.lock().reset();
        }
    }

    /// Close every channel and forget the target. Safe to call repeatedly.
    ///
    /// Waits for in-flight receives to finish (bounded by their timeouts).
    pub fn reset(&self) {
        *self.target.lock() = None;
        let endpoints: Vec<_> = self.channels.lock().values().cloned().collect();
        for endpoint in endpoints {
            endpoint.lock().reset();
        }
        tracing::debug!("{} transport reset", self.name);
    }

    fn endpoint(&self, channel: ChannelId) -> Arc<Mutex<LinkEndpoint>> {
        let mut channels = self.channels.lock();
        Arc::clone(
            channels
                .entry(channel)
                .or_insert_with(|| Arc::new(Mutex::new(LinkEndpoint::new()))),
        )
    }

    /// Lazy (re)connect before a send
    fn prepare(&self, channel: ChannelId, endpoint: &mut LinkEndpoint) -> Result<()> {
        if !endpoint.needs_reconnect(self.mode) {
            return Ok(());
        }
        let target = self
            .target()
            .ok_or(SarathiError::NotConnected(channel))?;
        tracing::trace!("{} {} reconnecting to {}", self.name, channel, target);
        endpoint.open(&*self.connector, &target, self.connect_timeout, self.framing)
    }
}

impl fmt::Debug for TransportClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportClient")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .field("target", &self.target())
            .finish()
    }
}
