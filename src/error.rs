//! VoxBridge error types

use thiserror::Error;

/// VoxBridge error type
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Protocol error (handshake rejected, timed out, or answered with a
    /// malformed payload)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Session error
    #[error("Session error: {0}")]
    Session(String),

    /// Agent bridge error
    #[error("Bridge error: {0}")]
    Bridge(String),

    /// Transport error (dial failures, socket errors, unexpected closes)
    #[error("Transport error: {0}")]
    Transport(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Result type alias for VoxBridge operations
pub type Result<T> = std::result::Result<T, Error>;
