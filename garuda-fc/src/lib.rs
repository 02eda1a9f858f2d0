//! Garuda - flight controller side daemon
//!
//! Talks to the hand-held controller over two links:
//!
//! - **Pairing link** (Bluetooth SPP / UART, or TCP in simulation): receives
//!   network credentials and reports the device address ([`provisioning`])
//! - **Network link** (TCP): one frame per connection, dispatched against the
//!   pairing session ([`server`], [`dispatcher`])

pub mod app;
pub mod config;
pub mod data;
pub mod dispatcher;
pub mod error;
pub mod provisioning;
pub mod server;
pub mod session;
pub mod settings;
pub mod telemetry;
pub mod transport;

// Re-export commonly used types
pub use config::Config;
pub use dispatcher::{CommandDispatcher, Response};
pub use error::{Error, Result};
pub use server::CommandServer;
