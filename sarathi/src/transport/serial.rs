//! Serial links (RFCOMM / UART pairing link)

use super::{Connector, Link, LinkEndpointAddress};
use crate::error::{Result, SarathiError};
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::io::{self, Read, Write};
use std::time::Duration;

/// Opens serial device nodes; the endpoint address is the device path
#[derive(Debug, Clone, Copy)]
pub struct SerialConnector {
    baud_rate: u32,
}

impl SerialConnector {
    pub fn new(baud_rate: u32) -> Self {
        Self { baud_rate }
    }
}

impl Connector for SerialConnector {
    fn connect(&self, endpoint: &LinkEndpointAddress, timeout: Duration) -> Result<Box<dyn Link>> {
        let port = serialport::new(&endpoint.address, self.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(timeout)
            .open()
            .map_err(|e| SarathiError::ConnectFailed {
                endpoint: endpoint.to_string(),
                source: e.into(),
            })?;

        tracing::info!(
            "Opened serial port: {} at {} baud",
            endpoint.address,
            self.baud_rate
        );
        Ok(Box::new(SerialLink { port }))
    }
}

/// Open serial port
pub struct SerialLink {
    port: Box<dyn SerialPort>,
}

impl Read for SerialLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }
}

impl Write for SerialLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}

impl Link for SerialLink {
    /// Serial reads always time out; `None` maps to a long wait
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        let timeout = timeout.unwrap_or(Duration::from_secs(3600));
        self.port.set_timeout(timeout).map_err(io::Error::from)
    }

    fn shutdown(&mut self) {
        if let Err(e) = self.port.clear(serialport::ClearBuffer::All) {
            tracing::debug!("Failed to clear serial buffers: {}", e);
        }
    }
}
