//! Pairing session: the one controller allowed to use private commands

use std::net::IpAddr;

/// Record of the bound controller.
///
/// Identity is the peer IP only; the controller opens a fresh connection
/// (and source port) for every frame.
#[derive(Debug, Default)]
pub struct PairingSession {
    bound: Option<IpAddr>,
}

impl PairingSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `peer` if nothing is bound yet
    pub fn register(&mut self, peer: IpAddr) -> bool {
        if self.bound.is_some() {
            return false;
        }
        self.bound = Some(peer);
        true
    }

    /// Release the binding if `peer` holds it
    pub fn unregister(&mut self, peer: IpAddr) -> bool {
        if self.bound == Some(peer) {
            self.bound = None;
            true
        } else {
            false
        }
    }

    pub fn is_authorized(&self, peer: IpAddr) -> bool {
        self.bound == Some(peer)
    }

    pub fn bound(&self) -> Option<IpAddr> {
        self.bound
    }

    pub fn clear(&mut self) {
        self.bound = None;
    }
}
