//! Relay policy: deduplication, no-echo forwarding and local hand-off

use crate::error::Result;
use crate::message::SignetPsbtMessage;
use crate::window::SeenWindow;
use crate::PeerId;
use bitcoin::p2p::Magic;
use bitcoin::secp256k1::XOnlyPublicKey;
use quorum_core::{compute_short_id, Quorum};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

/// What identifies "the same message" in the dedup window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DedupKey {
    /// One message per session nonce
    #[default]
    Nonce,
    /// One message per nonce and signer set, so re-signed templates propagate
    NonceAndSigners,
}

impl FromStr for DedupKey {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "nonce" => Ok(DedupKey::Nonce),
            "nonce-and-signers" => Ok(DedupKey::NonceAndSigners),
            other => Err(format!("unknown dedup key '{}'", other)),
        }
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DedupKey::Nonce => f.write_str("nonce"),
            DedupKey::NonceAndSigners => f.write_str("nonce-and-signers"),
        }
    }
}

/// Relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayPolicy {
    /// Number of dedup keys remembered
    pub capacity: usize,
    /// Forget keys older than this
    pub ttl: Option<Duration>,
    pub dedup: DedupKey,
    /// Forward new messages to every other peer
    pub flood: bool,
}

impl Default for RelayPolicy {
    fn default() -> Self {
        Self {
            capacity: 1024,
            ttl: Some(Duration::from_secs(3600)),
            dedup: DedupKey::Nonce,
            flood: true,
        }
    }
}

/// Why a message was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Dedup key already in the window
    Duplicate,
    /// Frame or body failed to decode
    Malformed,
    /// A short id does not belong to any quorum key
    UnknownSigner,
}

/// Outcome of handling one inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayDecision {
    Drop(DropReason),
    Accept {
        /// Peers to forward the message to (never the sender)
        forward_to: Vec<PeerId>,
        /// The local signer has not signed this template yet
        sign: bool,
    },
}

impl RelayDecision {
    pub fn is_accepted(&self) -> bool {
        matches!(self, RelayDecision::Accept { .. })
    }
}

/// Decides, per inbound message, whether to process and where to forward
pub struct RelayEngine {
    policy: RelayPolicy,
    magic: Magic,
    window: Mutex<SeenWindow<[u8; 32]>>,
    quorum: Option<Arc<Quorum>>,
    local: Option<XOnlyPublicKey>,
}

impl RelayEngine {
    /// Create an engine for the network identified by `magic`
    pub fn new(policy: RelayPolicy, magic: Magic) -> Self {
        let ttl = policy.ttl.and_then(|ttl| chrono::Duration::from_std(ttl).ok());
        Self {
            window: Mutex::new(SeenWindow::new(policy.capacity, ttl)),
            policy,
            magic,
            quorum: None,
            local: None,
        }
    }

    /// Drop messages naming signers outside `quorum`
    pub fn with_quorum(mut self, quorum: Arc<Quorum>) -> Self {
        self.quorum = Some(quorum);
        self
    }

    /// Key of the local signer, if this node signs
    pub fn with_local_signer(mut self, key: XOnlyPublicKey) -> Self {
        self.local = Some(key);
        self
    }

    pub fn policy(&self) -> &RelayPolicy {
        &self.policy
    }

    pub fn magic(&self) -> Magic {
        self.magic
    }

    fn dedup_key(&self, message: &SignetPsbtMessage) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&message.nonce.to_le_bytes());
        if self.policy.dedup == DedupKey::NonceAndSigners {
            let mut ids = message.signers_short_ids.clone();
            ids.sort_unstable();
            ids.dedup();
            for id in ids {
                hasher.update(&id.to_le_bytes());
            }
        }
        *hasher.finalize().as_bytes()
    }

    /// Record `key`; false if already seen
    fn record(&self, key: [u8; 32]) -> bool {
        self.window
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key)
    }

    /// Handle a decoded message received from `from` (`None` for local
    /// injection) while `peers` are connected
    pub fn handle(&self, from: Option<PeerId>, peers: &[PeerId], message: &SignetPsbtMessage) -> RelayDecision {
        // Rejected messages must not claim a slot in the window
        if let Some(quorum) = &self.quorum {
            let known = quorum.short_ids(message.nonce);
            if let Some(id) = message.signers_short_ids.iter().find(|id| !known.contains(id)) {
                warn!(nonce = message.nonce, short_id = id, peer = ?from, "Message names an unknown signer");
                return RelayDecision::Drop(DropReason::UnknownSigner);
            }
        }

        let key = self.dedup_key(message);
        if !self.record(key) {
            debug!(nonce = message.nonce, key = %hex::encode(&key[..8]), "Dropping duplicate message");
            return RelayDecision::Drop(DropReason::Duplicate);
        }

        let forward_to = if self.policy.flood {
            peers.iter().copied().filter(|peer| Some(*peer) != from).collect()
        } else {
            Vec::new()
        };

        let sign = self.local.map_or(false, |key| {
            !message
                .signers_short_ids
                .contains(&compute_short_id(message.nonce, &key))
        });

        debug!(
            nonce = message.nonce,
            signers = message.signers_short_ids.len(),
            forward = forward_to.len(),
            sign,
            "Message accepted"
        );
        RelayDecision::Accept { forward_to, sign }
    }

    /// Decode and handle a P2P frame
    pub fn handle_frame(
        &self,
        from: Option<PeerId>,
        peers: &[PeerId],
        frame: &[u8],
    ) -> (RelayDecision, Option<SignetPsbtMessage>) {
        match SignetPsbtMessage::from_frame(frame, self.magic) {
            Ok(message) => (self.handle(from, peers, &message), Some(message)),
            Err(error) => {
                warn!(%error, peer = ?from, "Dropping malformed frame");
                (RelayDecision::Drop(DropReason::Malformed), None)
            }
        }
    }

    /// Record an outbound message so its echo is dropped; returns its frame
    pub fn originate(&self, message: &SignetPsbtMessage) -> Result<Vec<u8>> {
        self.record(self.dedup_key(message));
        self.encode_frame(message)
    }

    pub fn encode_frame(&self, message: &SignetPsbtMessage) -> Result<Vec<u8>> {
        message.to_frame(self.magic)
    }

    /// Forget expired dedup keys
    pub fn cleanup(&self) {
        self.window
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cleanup();
    }
}

impl fmt::Debug for RelayEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayEngine")
            .field("policy", &self.policy)
            .field("magic", &self.magic)
            .field("quorum", &self.quorum.is_some())
            .field("local", &self.local)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    const MAGIC: [u8; 4] = [0x0a, 0x03, 0xcf, 0x40];

    fn message(nonce: u64, ids: Vec<u64>) -> SignetPsbtMessage {
        SignetPsbtMessage {
            nonce,
            psbt: vec![1, 2, 3],
            block_template: vec![4, 5],
            signers_short_ids: ids,
        }
    }

    fn engine(policy: RelayPolicy) -> RelayEngine {
        RelayEngine::new(policy, Magic::from_bytes(MAGIC))
    }

    #[test]
    fn test_duplicate_nonce_dropped() {
        let engine = engine(RelayPolicy::default());
        let peers = [Uuid::new_v4(), Uuid::new_v4()];

        assert!(engine.handle(Some(peers[0]), &peers, &message(1, vec![])).is_accepted());
        assert_eq!(
            engine.handle(Some(peers[1]), &peers, &message(1, vec![9])),
            RelayDecision::Drop(DropReason::Duplicate)
        );
        assert!(engine.handle(Some(peers[1]), &peers, &message(2, vec![])).is_accepted());
    }

    #[test]
    fn test_never_echo_to_sender() {
        let engine = engine(RelayPolicy::default());
        let peers = [Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];

        match engine.handle(Some(peers[1]), &peers, &message(5, vec![])) {
            RelayDecision::Accept { forward_to, .. } => {
                assert_eq!(forward_to, vec![peers[0], peers[2]]);
            }
            other => panic!("unexpected decision {:?}", other),
        }
    }

    #[test]
    fn test_local_injection_forwards_to_all() {
        let engine = engine(RelayPolicy::default());
        let peers = [Uuid::new_v4(), Uuid::new_v4()];

        match engine.handle(None, &peers, &message(5, vec![])) {
            RelayDecision::Accept { forward_to, .. } => assert_eq!(forward_to.len(), 2),
            other => panic!("unexpected decision {:?}", other),
        }
    }

    #[test]
    fn test_no_flood_policy() {
        let engine = engine(RelayPolicy {
            flood: false,
            ..RelayPolicy::default()
        });
        let peers = [Uuid::new_v4(), Uuid::new_v4()];

        assert_eq!(
            engine.handle(Some(peers[0]), &peers, &message(5, vec![])),
            RelayDecision::Accept {
                forward_to: vec![],
                sign: false
            }
        );
    }

    #[test]
    fn test_nonce_and_signers_dedup() {
        let engine = engine(RelayPolicy {
            dedup: DedupKey::NonceAndSigners,
            ..RelayPolicy::default()
        });

        assert!(engine.handle(None, &[], &message(1, vec![1])).is_accepted());
        assert!(engine.handle(None, &[], &message(1, vec![1, 2])).is_accepted());
        assert!(!engine.handle(None, &[], &message(1, vec![2, 1])).is_accepted());
    }

    #[test]
    fn test_originate_drops_echo() {
        let engine = engine(RelayPolicy::default());
        let peer = Uuid::new_v4();
        let frame = engine.originate(&message(3, vec![])).unwrap();

        let (decision, decoded) = engine.handle_frame(Some(peer), &[peer], &frame);
        assert_eq!(decision, RelayDecision::Drop(DropReason::Duplicate));
        assert_eq!(decoded, Some(message(3, vec![])));
    }

    #[test]
    fn test_malformed_frame_dropped() {
        let engine = engine(RelayPolicy::default());
        let frame = message(3, vec![]).to_frame(Magic::from_bytes([1, 1, 1, 1])).unwrap();

        let (decision, decoded) = engine.handle_frame(None, &[], &frame);
        assert_eq!(decision, RelayDecision::Drop(DropReason::Malformed));
        assert!(decoded.is_none());

        let (decision, _) = engine.handle_frame(None, &[], &frame[..10]);
        assert_eq!(decision, RelayDecision::Drop(DropReason::Malformed));
    }

    #[test]
    fn test_unknown_signer_and_local_signing() {
        use bitcoin::secp256k1::{Keypair, Secp256k1, SecretKey};

        let secp = Secp256k1::new();
        let keys: Vec<XOnlyPublicKey> = (1..=4u8)
            .map(|i| {
                let sk = SecretKey::from_slice(&[i; 32]).unwrap();
                Keypair::from_secret_key(&secp, &sk).x_only_public_key().0
            })
            .collect();
        let quorum = Arc::new(Quorum::new(keys[0], keys[1..].to_vec(), 2).unwrap());
        let engine = engine(RelayPolicy::default())
            .with_quorum(quorum)
            .with_local_signer(keys[2]);

        assert_eq!(
            engine.handle(None, &[], &message(10, vec![12345])),
            RelayDecision::Drop(DropReason::UnknownSigner)
        );

        let theirs = compute_short_id(11, &keys[1]);
        assert_eq!(
            engine.handle(None, &[], &message(11, vec![theirs])),
            RelayDecision::Accept {
                forward_to: vec![],
                sign: true
            }
        );

        let signed = vec![compute_short_id(12, &keys[1]), compute_short_id(12, &keys[2])];
        assert_eq!(
            engine.handle(None, &[], &message(12, signed)),
            RelayDecision::Accept {
                forward_to: vec![],
                sign: false
            }
        );
    }

    #[test]
    fn test_unknown_signer_does_not_claim_nonce() {
        use bitcoin::secp256k1::{Keypair, Secp256k1, SecretKey};

        let secp = Secp256k1::new();
        let keys: Vec<XOnlyPublicKey> = (1..=3u8)
            .map(|i| {
                let sk = SecretKey::from_slice(&[i; 32]).unwrap();
                Keypair::from_secret_key(&secp, &sk).x_only_public_key().0
            })
            .collect();
        let quorum = Arc::new(Quorum::new(keys[0], keys[1..].to_vec(), 1).unwrap());
        let engine = engine(RelayPolicy::default()).with_quorum(quorum);

        assert_eq!(
            engine.handle(None, &[], &message(50, vec![12345])),
            RelayDecision::Drop(DropReason::UnknownSigner)
        );
        let valid = message(50, vec![compute_short_id(50, &keys[1])]);
        assert!(engine.handle(None, &[], &valid).is_accepted());
        assert_eq!(
            engine.handle(None, &[], &valid),
            RelayDecision::Drop(DropReason::Duplicate)
        );
    }
}
