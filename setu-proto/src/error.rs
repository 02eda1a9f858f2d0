//! Error types for the frame protocol

/// Result type alias
pub type Result<T> = std::result::Result<T, ProtoError>;

/// Protocol error types
#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    /// Frame could not be built or parsed
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// I/O error on the underlying stream
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Peer closed the stream
    #[error("Peer disconnected")]
    Disconnected,
}
