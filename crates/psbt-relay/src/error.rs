//! Relay error types

use crate::PeerId;
use bitcoin::p2p::Magic;
use thiserror::Error;

/// Relay error types
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Truncated message: {0}")]
    TruncatedMessage(String),
    #[error("Malformed message: {0}")]
    MalformedMessage(String),
    #[error("Unexpected command '{0}'")]
    UnexpectedCommand(String),
    #[error("Wrong network: expected magic {expected}, got {actual}")]
    WrongNetwork { expected: Magic, actual: Magic },
    #[error("Unknown peer: {0}")]
    UnknownPeer(PeerId),
    #[error("Transport error: {0}")]
    Transport(String),
}

pub type Result<T> = std::result::Result<T, RelayError>;

impl From<bitcoin::consensus::encode::Error> for RelayError {
    fn from(e: bitcoin::consensus::encode::Error) -> Self {
        use bitcoin::consensus::encode::Error;
        match e {
            Error::Io(io) if io.kind() == bitcoin::io::ErrorKind::UnexpectedEof => {
                RelayError::TruncatedMessage(io.to_string())
            }
            other => RelayError::MalformedMessage(other.to_string()),
        }
    }
}

impl From<RelayError> for quorum_core::Error {
    fn from(e: RelayError) -> Self {
        quorum_core::Error::Relay(e.to_string())
    }
}
