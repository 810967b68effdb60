//! Error types for Beacon device

use thiserror::Error;

/// Result type alias for Beacon device operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the Beacon device core
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Audio hardware error
    #[error("audio error: {0}")]
    Audio(String),

    /// Compression codec or resampler error
    #[error("codec error: {0}")]
    Codec(String),

    /// Wire protocol error (framing, handshake, malformed message)
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Audio channel error (connect/open failure, channel closed)
    #[error("channel error: {0}")]
    Channel(String),

    /// Sound asset error
    #[error("sound error: {0}")]
    Sound(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
