use ferrotun_core::CoreError;
use ferrotun_crypto::CryptoError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("unknown peer {0}")]
    UnknownPeer(String),

    #[error("peer {0} already exists")]
    DuplicatePeer(String),

    #[error("packet of {0} bytes exceeds the maximum content size")]
    PacketTooLarge(usize),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<CoreError> for DeviceError {
    fn from(err: CoreError) -> Self {
        Self::Crypto(err.into())
    }
}
