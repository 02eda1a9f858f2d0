//! Error types for Garuda

use setu_proto::ProtoError;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Garuda error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame protocol error
    #[error("Protocol error: {0}")]
    Proto(#[from] ProtoError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serial port error (pairing link)
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Device settings payload or file could not be parsed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<toml::ser::Error> for Error {
    fn from(e: toml::ser::Error) -> Self {
        Error::Config(e.to_string())
    }
}
