//! Sarathi - hand-held controller core
//!
//! Brings a flight controller from "paired" to "flying":
//!
//! 1. [`orchestrator`] hands network credentials to the device over the
//!    pairing link and registers this controller over the network link
//! 2. [`session`] then pushes stick positions and polls telemetry and link
//!    quality
//!
//! All I/O runs on [`polling`] tasks over [`transport`] clients, so the
//! caller's thread (a UI loop, or the headless binary) never blocks.

pub mod config;
pub mod error;
pub mod link_quality;
pub mod orchestrator;
pub mod pairing;
pub mod polling;
pub mod session;
pub mod settings;
pub mod shared;
pub mod translate;
pub mod transport;

// Re-export commonly used types
pub use config::SarathiConfig;
pub use error::{Result, SarathiError};
pub use orchestrator::{Collaborators, ConnectionOrchestrator, ConnectionState};
pub use polling::{PollingTask, TickFlow};
pub use transport::{ChannelId, TransportClient};
