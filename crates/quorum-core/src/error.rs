//! Error types for quorum setup and signing rounds

use std::time::Duration;
use thiserror::Error;

/// Result type alias for quorum operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while setting up a quorum or running a signing round
#[derive(Debug, Error)]
pub enum Error {
    /// A key expression could not be parsed or derived
    #[error("key '{key}' is not valid: {reason}")]
    InvalidKeyMaterial { key: String, reason: String },

    /// Descriptor text is malformed
    #[error("Invalid descriptor: {0}")]
    InvalidDescriptor(String),

    /// Threshold outside `1..=signers`
    #[error("Invalid threshold {threshold} for {signers} signers")]
    InvalidThreshold { threshold: usize, signers: usize },

    /// A signer's view derives a different challenge than the quorum
    #[error("Address mismatch for signer {signer}: expected {expected}, derived {actual}")]
    AddressMismatch {
        signer: usize,
        expected: String,
        actual: String,
    },

    /// Two different signatures were presented for the same slot
    #[error("Conflicting signature for {slot}")]
    ConflictingSignature { slot: String },

    /// A signature does not verify or is otherwise unusable
    #[error("Invalid signature for {slot}: {reason}")]
    InvalidSignature { slot: String, reason: String },

    /// Extraction attempted before the threshold was met
    #[error("Incomplete signature set: required {required}, got {actual}")]
    IncompleteSignatureSet { required: usize, actual: usize },

    /// PSBT or witness disagrees with the quorum's committed script
    #[error("Script mismatch: {0}")]
    ScriptMismatch(String),

    /// Bounded wait for signatures exceeded
    #[error("Signature collection timed out after {0:?}")]
    CollectionTimeout(Duration),

    /// The round already failed and accepts no further steps
    #[error("Signing round failed: {0}")]
    RoundFailed(String),

    /// Block carries no witness commitment output
    #[error("Block has no witness commitment")]
    MissingWitnessCommitment,

    /// PSBT structure error
    #[error("PSBT error: {0}")]
    Psbt(String),

    /// Block structure error
    #[error("Block error: {0}")]
    Block(String),

    /// Network/relay error
    #[error("Relay error: {0}")]
    Relay(String),

    /// Session not found
    #[error("Session not found: {0}")]
    SessionNotFound(u64),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub(crate) fn invalid_key(key: &str, reason: impl ToString) -> Self {
        Error::InvalidKeyMaterial {
            key: key.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Internal(e.to_string())
    }
}

impl From<bitcoin::psbt::Error> for Error {
    fn from(e: bitcoin::psbt::Error) -> Self {
        Error::Psbt(e.to_string())
    }
}

impl From<bitcoin::sighash::TaprootError> for Error {
    fn from(e: bitcoin::sighash::TaprootError) -> Self {
        Error::Psbt(e.to_string())
    }
}
