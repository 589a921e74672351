//! Error type shared by every BirdBath component

use std::fmt;

/// Errors raised while configuring or running the pipeline
#[derive(Debug)]
pub enum Error {
    /// Malformed or missing configuration (fatal at startup)
    Config(String),
    /// IO error on a pipe, socket or file
    Io(std::io::Error),
    /// Failed to encode or decode a message
    Codec(String),
    /// Pattern could not be resolved or failed to render
    Pattern(String),
    /// Peer channel closed or timed out
    Channel(String),
    /// Peer sent a message that does not fit the protocol
    Protocol(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::Codec(msg) => write!(f, "Codec error: {}", msg),
            Error::Pattern(msg) => write!(f, "Pattern error: {}", msg),
            Error::Channel(msg) => write!(f, "Channel error: {}", msg),
            Error::Protocol(msg) => write!(f, "Protocol error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Codec(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Codec(e.to_string())
    }
}

/// Result type for BirdBath operations
pub type Result<T> = std::result::Result<T, Error>;
