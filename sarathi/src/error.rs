//! Error types for Sarathi

use crate::transport::ChannelId;
use setu_proto::ProtoError;
use thiserror::Error;

/// Sarathi error type
#[derive(Error, Debug)]
pub enum SarathiError {
    /// Link not reachable or dropped; the owning task retries
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("Connection to {endpoint} failed: {source}")]
    ConnectFailed {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    /// Received text is not a frame; the connection that produced it is closed
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// Device rejected a private command
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Device already has another controller bound
    #[error("Registration conflict: device is bound to another controller")]
    RegistrationConflict,

    #[error("Protocol timeout: {0}")]
    ProtocolTimeout(String),

    #[error("Channel {0} is not connected")]
    NotConnected(ChannelId),

    /// Operation on a task that can no longer run
    #[error("Task finished: {0}")]
    TaskFinished(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ProtoError> for SarathiError {
    fn from(e: ProtoError) -> Self {
        match e {
            ProtoError::MalformedFrame(reason) => SarathiError::MalformedFrame(reason),
            ProtoError::Io(e) => SarathiError::TransportUnavailable(e.to_string()),
            ProtoError::Disconnected => {
                SarathiError::TransportUnavailable("peer closed the connection".into())
            }
        }
    }
}

impl From<toml::de::Error> for SarathiError {
    fn from(e: toml::de::Error) -> Self {
        SarathiError::Config(e.to_string())
    }
}

impl From<serde_json::Error> for SarathiError {
    fn from(e: serde_json::Error) -> Self {
        SarathiError::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SarathiError>;
