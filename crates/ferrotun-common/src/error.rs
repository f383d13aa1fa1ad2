//! Common error types for ferrotun.

use ferrotun_core::CoreError;
use ferrotun_crypto::CryptoError;
use thiserror::Error;

/// Result type alias using ferrotun's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for ferrotun operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (file, network, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Cryptographic operation failed
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Malformed or unexpected message
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<CoreError> for Error {
    fn from(err: CoreError) -> Self {
        Self::Protocol(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl Error {
    /// Create a config error from any displayable type.
    pub fn config(msg: impl std::fmt::Display) -> Self {
        Self::Config(msg.to_string())
    }

    /// True for failures that must not be retried blindly.
    ///
    /// Entropy exhaustion is the only crypto failure that escalates; all
    /// others are contained to one packet or handshake attempt.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Crypto(CryptoError::Entropy(_)) => true,
            Self::Crypto(_) | Self::Protocol(_) => false,
            _ => true,
        }
    }
}
