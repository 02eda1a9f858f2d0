//! Network provisioning over the pairing link
//!
//! Device side of the credential handoff:
//!
//! ```text
//! controller                          device
//!     WLAN|ssid|password  ─────────▶  join network
//!                         ◀─────────  WC1 (or WC0, then wait for WLAN again)
//!                         ◀─────────  STAINFO|ip|port
//!     WLANDATA|ip         ─────────▶
//!                         ◀─────────  WS1 (command server ready)
//! ```
//!
//! The command listener is bound right after a successful join, so the port
//! in `STAINFO` is the one actually listening (this matters for port `0`).

use crate::error::{Error, Result};
use crate::transport::PairingLink;
use setu_proto::vocabulary::{STAINFO, WC, WLAN, WLANDATA, WS};
use setu_proto::{Frame, Framer, Framing, ProtoError, decode};
use std::net::{IpAddr, Ipv4Addr, TcpListener, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Joins the network named in the credentials and reports the address obtained
pub trait NetworkJoiner: Send {
    fn join(&mut self, ssid: &str, password: &str) -> Result<IpAddr>;
}

/// Joiner for a daemon running on a host that is already on the network.
///
/// Nothing is actually joined; the host's own address is reported.
pub struct HostNetwork {
    advertise: Option<IpAddr>,
}

impl HostNetwork {
    pub fn new(advertise: Option<IpAddr>) -> Self {
        Self { advertise }
    }
}

impl NetworkJoiner for HostNetwork {
    fn join(&mut self, ssid: &str, _password: &str) -> Result<IpAddr> {
        if ssid.trim().is_empty() {
            return Err(Error::Other("empty network name".into()));
        }
        let address = match self.advertise {
            Some(address) => address,
            None => discover_host_address(),
        };
        log::info!("Network '{}' available, advertising {}", ssid, address);
        Ok(address)
    }
}

/// Address of the interface holding the default route.
///
/// A connected UDP socket sends nothing but makes the kernel pick a source
/// address. Falls back to loopback without a route.
fn discover_host_address() -> IpAddr {
    let probe = UdpSocket::bind("0.0.0.0:0").and_then(|socket| {
        socket.connect("8.8.8.8:80")?;
        socket.local_addr()
    });
    match probe {
        Ok(addr) if !addr.ip().is_unspecified() => addr.ip(),
        Ok(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
        Err(e) => {
            log::warn!("No route to discover host address ({}), using loopback", e);
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}

/// Result of a completed handoff
#[derive(Debug)]
pub struct Provisioned {
    /// Bound, non-blocking command listener
    pub listener: TcpListener,
    /// Address sent in `STAINFO`
    pub device_address: IpAddr,
    /// Address received in `WLANDATA`
    pub controller_address: Option<IpAddr>,
}

/// Runs the device side of the handoff on one pairing link
pub struct Provisioner {
    framer: Framer,
    joiner: Box<dyn NetworkJoiner>,
    bind_address: String,
    running: Arc<AtomicBool>,
}

impl Provisioner {
    pub fn new(
        framing: Framing,
        joiner: Box<dyn NetworkJoiner>,
        bind_address: impl Into<String>,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            framer: Framer::new(framing),
            joiner,
            bind_address: bind_address.into(),
            running,
        }
    }

    /// Run the handoff until the command server is ready.
    ///
    /// Failed joins and binds are reported to the controller and the handoff
    /// starts over; only a lost link or shutdown end it with an error.
    pub fn run(&mut self, link: &mut dyn PairingLink) -> Result<Provisioned> {
        log::info!("Waiting for network credentials on {}", link.describe());
        let mut pending: Option<Frame> = None;

        loop {
            let credentials = match pending.take() {
                Some(frame) => frame,
                None => self.next_frame(link, &[WLAN])?,
            };
            let (Some(ssid), Some(password)) = (credentials.field(0), credentials.field(1)) else {
                log::warn!("WLAN frame without ssid/password");
                self.send(link, &format!("{}0", WC))?;
                continue;
            };

            let device_address = match self.joiner.join(ssid, password) {
                Ok(address) => address,
                Err(e) => {
                    log::warn!("Joining '{}' failed: {}", ssid, e);
                    self.send(link, &format!("{}0", WC))?;
                    continue;
                }
            };

            let listener = match TcpListener::bind(&self.bind_address) {
                Ok(listener) => listener,
                Err(e) => {
                    log::error!("Failed to bind command server {}: {}", self.bind_address, e);
                    self.send(link, &format!("{}0", WC))?;
                    continue;
                }
            };
            let port = listener.local_addr()?.port();

            self.send(link, &format!("{}1", WC))?;
            self.send(
                link,
                &setu_proto::encode(STAINFO, &[device_address.to_string(), port.to_string()]),
            )?;

            let reply = self.next_frame(link, &[WLANDATA, WLAN])?;
            if reply.tag == WLAN {
                log::info!("New credentials before WLANDATA, restarting handoff");
                pending = Some(reply);
                continue;
            }
            let controller_address = reply.parse_field::<IpAddr>(0);
            match controller_address {
                Some(address) => log::info!("Controller address: {}", address),
                None => log::warn!("WLANDATA without a usable address: {:?}", reply.fields),
            }

            if let Err(e) = listener.set_nonblocking(true) {
                log::error!("Command listener not usable: {}", e);
                self.send(link, &format!("{}0", WS))?;
                continue;
            }
            self.send(link, &format!("{}1", WS))?;
            log::info!("Command server ready on {}:{}", device_address, port);

            return Ok(Provisioned {
                listener,
                device_address,
                controller_address,
            });
        }
    }

    /// Next frame whose tag is exactly one of `tags`; others are logged and skipped
    fn next_frame(&mut self, link: &mut dyn PairingLink, tags: &[&str]) -> Result<Frame> {
        loop {
            if !self.running.load(Ordering::Relaxed) {
                return Err(Error::Other("Shutdown during provisioning".into()));
            }
            let text = match self.framer.read_frame(link) {
                Ok(Some(text)) => text,
                Ok(None) => continue,
                Err(ProtoError::MalformedFrame(reason)) => {
                    log::warn!("Pairing link: {}", reason);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            match decode(&text) {
                Ok(frame) if tags.contains(&frame.tag.as_str()) => return Ok(frame),
                Ok(frame) => log::debug!("Ignoring {} while waiting for {:?}", frame.tag, tags),
                Err(e) => log::warn!("Pairing link: {}", e),
            }
        }
    }

    fn send(&self, link: &mut dyn PairingLink, text: &str) -> Result<()> {
        self.framer.write_frame(link, text)?;
        Ok(())
    }
}
