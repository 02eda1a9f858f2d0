//! One channel's socket binding

use super::{Connector, Link, LinkEndpointAddress, SessionMode};
use crate::error::{Result, SarathiError};
use setu_proto::{Frame, Framer, Framing, ProtoError, decode};
use std::time::{Duration, Instant};

/// Either fully connected (link, address and framer present) or fully reset.
///
/// Any I/O failure, end of stream or malformed frame resets the endpoint, so
/// no half-open state survives a call.
#[derive(Default)]
pub struct LinkEndpoint {
    binding: Option<Binding>,
}

struct Binding {
    address: LinkEndpointAddress,
    link: Box<dyn Link>,
    framer: Framer,
    /// At least one frame was sent on this connection
    used: bool,
}

impl LinkEndpoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_connected(&self) -> bool {
        self.binding.is_some()
    }

    pub fn address(&self) -> Option<&LinkEndpointAddress> {
        self.binding.as_ref().map(|b| &b.address)
    }

    /// Replace any existing connection with a new one
    pub fn open(
        &mut self,
        connector: &dyn Connector,
        address: &LinkEndpointAddress,
        timeout: Duration,
        framing: Framing,
    ) -> Result<()> {
        self.reset();
        let link = connector.connect(address, timeout)?;
        self.binding = Some(Binding {
            address: address.clone(),
            link,
            framer: Framer::new(framing),
            used: false,
        });
        Ok(())
    }

    pub fn needs_reconnect(&self, mode: SessionMode) -> bool {
        match &self.binding {
            None => true,
            Some(binding) => mode == SessionMode::OneShot && binding.used,
        }
    }

    pub fn send(&mut self, text: &str) -> Result<()> {
        let binding = self.binding.as_mut().ok_or_else(not_connected)?;
        binding.used = true;
        let result = binding.framer.write_frame(&mut *binding.link, text);
        if let Err(e) = result {
            tracing::debug!("Send to {} failed: {}", binding.address, e);
            self.reset();
            return Err(e.into());
        }
        Ok(())
    }

    /// Blocking read until a frame whose tag contains `match_tag` arrives,
    /// the timeout elapses (`Ok(None)`), or the link fails.
    pub fn receive(&mut self, match_tag: &str, timeout: Option<Duration>) -> Result<Option<Frame>> {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let binding = self.binding.as_mut().ok_or_else(not_connected)?;

            let remaining = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Ok(None);
                    }
                    Some(remaining)
                }
                None => None,
            };
            if let Err(e) = binding.link.set_read_timeout(remaining) {
                self.reset();
                return Err(SarathiError::TransportUnavailable(e.to_string()));
            }

            let text = match binding.framer.read_frame(&mut *binding.link) {
                Ok(Some(text)) => text,
                Ok(None) => continue,
                Err(e) => {
                    let address = binding.address.clone();
                    self.reset();
                    return Err(match e {
                        ProtoError::Disconnected => SarathiError::TransportUnavailable(format!(
                            "{} closed the connection",
                            address
                        )),
                        other => other.into(),
                    });
                }
            };

            match decode(&text) {
                Ok(frame) if frame.has_tag(match_tag) => return Ok(Some(frame)),
                Ok(frame) => {
                    tracing::debug!("Discarding {} while waiting for '{}'", frame.tag, match_tag);
                }
                Err(e) => {
                    self.reset();
                    return Err(e.into());
                }
            }
        }
    }

    /// Close the link and clear the binding. Safe to call repeatedly.
    pub fn reset(&mut self) {
        if let Some(mut binding) = self.binding.take() {
            binding.link.shutdown();
        }
    }
}

impl Drop for LinkEndpoint {
    fn drop(&mut self) {
        self.reset();
    }
}

fn not_connected() -> SarathiError {
    SarathiError::TransportUnavailable("endpoint not connected".into())
}
