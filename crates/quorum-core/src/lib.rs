//! # Quorum Core
//!
//! Building blocks for a federated signet whose blocks are authorized by an
//! M-of-N Taproot quorum.
//!
//! This crate provides:
//! - Quorum descriptors `tr(internal, multi_a(M, k1..kN))` and the signet
//!   challenge they commit to
//! - A threshold signing round that merges partial PSBT signatures
//! - Signet solution extraction and embedding (BIP325)
//!
//! ## Example
//!
//! ```rust,ignore
//! use quorum_core::{QuorumBuilder, SigningRound, solution};
//!
//! let (descriptor, challenge) = QuorumBuilder::build(&keys, 10)?;
//! let psbt = signet::signet_psbt(&block, &challenge)?;
//!
//! let mut round = SigningRound::new(descriptor.quorum(), psbt)?;
//! for signer in &signers {
//!     round.apply(signer)?;
//! }
//!
//! let section = solution::extract_solution(round.psbt(), &descriptor.quorum())?;
//! ```

pub mod error;
pub mod quorum;
pub mod sign;
pub mod signet;
pub mod solution;
pub mod types;

pub use error::{Error, Result};
pub use quorum::{Quorum, QuorumBuilder, QuorumDescriptor};
pub use sign::{LocalSigner, PsbtSigner, RoundState, SessionManager, SigningRound};
pub use solution::SignetSolution;
pub use types::{compute_short_id, ShortId, SignerKeyPair, SignerSlot};

/// Protocol version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Signature threshold used by the reference federation
pub const DEFAULT_THRESHOLD: usize = 10;

/// Number of multisig keys in the reference federation
pub const DEFAULT_SIGNERS: usize = 100;
