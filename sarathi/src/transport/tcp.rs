//! TCP links (network link, simulated pairing link)

use super::{Connector, Link, LinkEndpointAddress};
use crate::error::{Result, SarathiError};
use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::time::Duration;

/// Connects TCP sockets with a timeout
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

impl TcpConnector {
    pub fn new() -> Self {
        Self
    }
}

impl Connector for TcpConnector {
    fn connect(&self, endpoint: &LinkEndpointAddress, timeout: Duration) -> Result<Box<dyn Link>> {
        let failed = |source: io::Error| SarathiError::ConnectFailed {
            endpoint: endpoint.to_string(),
            source,
        };

        let addrs: Vec<SocketAddr> = (endpoint.address.as_str(), endpoint.port)
            .to_socket_addrs()
            .map_err(failed)?
            .collect();

        let mut last_error = io::Error::new(io::ErrorKind::NotFound, "no addresses resolved");
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::warn!("Failed to set TCP_NODELAY on {}: {}", addr, e);
                    }
                    return Ok(Box::new(TcpLink { stream }));
                }
                Err(e) => last_error = e,
            }
        }
        Err(failed(last_error))
    }
}

/// Connected TCP stream
pub struct TcpLink {
    stream: TcpStream,
}

impl Read for TcpLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for TcpLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl Link for TcpLink {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.stream.set_read_timeout(timeout)
    }

    fn shutdown(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// Own address on the route towards `target`.
///
/// Connecting a UDP socket sends nothing; it only makes the OS choose the
/// outgoing interface.
pub fn local_address_towards(target: IpAddr) -> Result<IpAddr> {
    let bind: SocketAddr = match target {
        IpAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        IpAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = UdpSocket::bind(bind)?;
    socket.connect((target, 9))?;
    Ok(socket.local_addr()?.ip())
}
