//! # PSBT Relay
//!
//! Propagates partially signed signet block templates between signers.
//!
//! - [`SignetPsbtMessage`]: the `signetpsbt` wire message and its P2P frame
//! - [`RelayEngine`]: dedup window, no-echo forwarding and unknown-signer
//!   filtering
//! - [`RelayNode`]: an engine bound to a [`PeerTransport`]

pub mod engine;
pub mod error;
pub mod message;
pub mod transport;
pub mod window;

pub use engine::{DedupKey, DropReason, RelayDecision, RelayEngine, RelayPolicy};
pub use error::{RelayError, Result};
pub use message::{SignetPsbtMessage, COMMAND, MAX_MESSAGE_SIZE};
pub use transport::{Delivery, MemoryTransport, PeerTransport, RelayNode};
pub use window::SeenWindow;

pub use ::async_trait::async_trait;

/// Connection identifier
pub type PeerId = uuid::Uuid;
