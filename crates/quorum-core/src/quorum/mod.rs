//! Quorum descriptor builder
//!
//! A quorum is `tr(internal, multi_a(M, k1..kN))`: the internal key may spend
//! alone through the key path, otherwise any M of the N leaf keys must sign
//! the single tapscript leaf.

mod builder;
pub mod descriptor;
pub mod keys;

pub use builder::{QuorumBuilder, QuorumDescriptor, SignerView};

use crate::types::{compute_short_id, ShortId, SignerSlot};
use crate::{Error, Result};
use bitcoin::opcodes::all::{OP_CHECKSIG, OP_CHECKSIGADD, OP_NUMEQUAL};
use bitcoin::script::Builder;
use bitcoin::secp256k1::{Secp256k1, XOnlyPublicKey};
use bitcoin::taproot::{
    ControlBlock, LeafVersion, TapLeafHash, TapNodeHash, TaprootBuilder, TaprootSpendInfo,
};
use bitcoin::{Address, Network, ScriptBuf};
use std::collections::HashSet;

/// Maximum number of keys in a `multi_a` leaf
pub const MAX_PUBKEYS_PER_MULTI_A: usize = 999;

/// An M-of-N taproot quorum.
///
/// Built once per chain instantiation and shared read-only (usually behind
/// an `Arc`).
#[derive(Debug, Clone)]
pub struct Quorum {
    internal_key: XOnlyPublicKey,
    signers: Vec<XOnlyPublicKey>,
    threshold: usize,
    script: ScriptBuf,
    leaf_hash: TapLeafHash,
    spend_info: TaprootSpendInfo,
    control_block: ControlBlock,
    challenge: ScriptBuf,
}

impl Quorum {
    /// Create a quorum from its internal key, ordered leaf keys and threshold
    pub fn new(
        internal_key: XOnlyPublicKey,
        signers: Vec<XOnlyPublicKey>,
        threshold: usize,
    ) -> Result<Self> {
        if threshold == 0 || threshold > signers.len() || signers.len() > MAX_PUBKEYS_PER_MULTI_A {
            return Err(Error::InvalidThreshold {
                threshold,
                signers: signers.len(),
            });
        }

        let mut seen = HashSet::with_capacity(signers.len());
        for key in &signers {
            if !seen.insert(*key) {
                return Err(Error::invalid_key(&key.to_string(), "duplicate key in multi_a leaf"));
            }
        }

        let script = Self::multisig_script(&signers, threshold);
        let leaf_hash = TapLeafHash::from_script(&script, LeafVersion::TapScript);

        let secp = Secp256k1::verification_only();
        let spend_info = TaprootBuilder::new()
            .add_leaf(0, script.clone())
            .map_err(|e| Error::Internal(e.to_string()))?
            .finalize(&secp, internal_key)
            .map_err(|_| Error::Internal("taproot tree is incomplete".into()))?;

        let control_block = spend_info
            .control_block(&(script.clone(), LeafVersion::TapScript))
            .ok_or_else(|| Error::Internal("leaf missing from taproot tree".into()))?;

        let challenge = ScriptBuf::new_p2tr_tweaked(spend_info.output_key());

        Ok(Self {
            internal_key,
            signers,
            threshold,
            script,
            leaf_hash,
            spend_info,
            control_block,
            challenge,
        })
    }

    /// `<k1> CHECKSIG <k2> CHECKSIGADD ... <kN> CHECKSIGADD <M> NUMEQUAL`
    pub fn multisig_script(signers: &[XOnlyPublicKey], threshold: usize) -> ScriptBuf {
        let mut builder = Builder::new();
        for (i, key) in signers.iter().enumerate() {
            builder = builder.push_x_only_key(key);
            builder = if i == 0 {
                builder.push_opcode(OP_CHECKSIG)
            } else {
                builder.push_opcode(OP_CHECKSIGADD)
            };
        }
        builder
            .push_int(threshold as i64)
            .push_opcode(OP_NUMEQUAL)
            .into_script()
    }

    /// Taproot internal key
    pub fn internal_key(&self) -> XOnlyPublicKey {
        self.internal_key
    }

    /// Ordered `multi_a` keys
    pub fn signers(&self) -> &[XOnlyPublicKey] {
        &self.signers
    }

    /// Signatures required on the script path
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// The `multi_a` tapscript
    pub fn script(&self) -> &ScriptBuf {
        &self.script
    }

    /// Leaf hash of the `multi_a` tapscript
    pub fn leaf_hash(&self) -> TapLeafHash {
        self.leaf_hash
    }

    /// Merkle root of the single-leaf tree
    pub fn merkle_root(&self) -> Option<TapNodeHash> {
        self.spend_info.merkle_root()
    }

    /// Control block for the `multi_a` leaf
    pub fn control_block(&self) -> &ControlBlock {
        &self.control_block
    }

    /// Tweaked output key the key-path signature must verify against
    pub fn output_key(&self) -> XOnlyPublicKey {
        self.spend_info.output_key().to_x_only_public_key()
    }

    /// Signet challenge (`OP_1 <output key>`)
    pub fn challenge(&self) -> &ScriptBuf {
        &self.challenge
    }

    /// Address of the challenge on the given network
    pub fn address(&self, network: Network) -> Address {
        Address::p2tr_tweaked(self.spend_info.output_key(), network)
    }

    /// Key occupying a slot
    pub fn key_for(&self, slot: SignerSlot) -> Option<XOnlyPublicKey> {
        match slot {
            SignerSlot::KeyPath => Some(self.internal_key),
            SignerSlot::Script(i) => self.signers.get(i).copied(),
        }
    }

    /// Slot occupied by a key. Leaf keys take precedence over the internal key.
    pub fn slot_of(&self, key: &XOnlyPublicKey) -> Option<SignerSlot> {
        if let Some(i) = self.signers.iter().position(|k| k == key) {
            return Some(SignerSlot::Script(i));
        }
        (*key == self.internal_key).then_some(SignerSlot::KeyPath)
    }

    /// Number of keys, internal key included
    pub fn key_count(&self) -> usize {
        self.signers.len() + 1
    }

    /// Short id of the key in `slot` for a session
    pub fn short_id(&self, nonce: u64, slot: SignerSlot) -> Option<ShortId> {
        self.key_for(slot).map(|key| compute_short_id(nonce, &key))
    }

    /// Short ids of every quorum key for a session
    pub fn short_ids(&self, nonce: u64) -> HashSet<ShortId> {
        std::iter::once(&self.internal_key)
            .chain(self.signers.iter())
            .map(|key| compute_short_id(nonce, key))
            .collect()
    }
}

impl PartialEq for Quorum {
    fn eq(&self, other: &Self) -> bool {
        self.internal_key == other.internal_key
            && self.signers == other.signers
            && self.threshold == other.threshold
    }
}

impl Eq for Quorum {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::keypairs;

    fn quorum(n: usize, m: usize) -> Quorum {
        let keys: Vec<XOnlyPublicKey> =
            keypairs(n + 1).iter().map(|k| k.x_only_public_key().0).collect();
        Quorum::new(keys[0], keys[1..].to_vec(), m).unwrap()
    }

    #[test]
    fn test_script_length() {
        let q = quorum(100, 10);
        assert_eq!(q.script().len(), 100 * 34 + 2);
        assert!(q.challenge().is_p2tr());
        assert_eq!(q.control_block().serialize().len(), 33);
    }

    #[test]
    fn test_threshold_bounds() {
        let keys: Vec<XOnlyPublicKey> =
            keypairs(4).iter().map(|k| k.x_only_public_key().0).collect();

        assert!(matches!(
            Quorum::new(keys[0], keys[1..].to_vec(), 0),
            Err(Error::InvalidThreshold { .. })
        ));
        assert!(matches!(
            Quorum::new(keys[0], keys[1..].to_vec(), 4),
            Err(Error::InvalidThreshold { .. })
        ));
        assert!(Quorum::new(keys[0], keys[1..].to_vec(), 3).is_ok());
    }

    #[test]
    fn test_duplicate_leaf_keys_rejected() {
        let keys: Vec<XOnlyPublicKey> =
            keypairs(2).iter().map(|k| k.x_only_public_key().0).collect();

        assert!(matches!(
            Quorum::new(keys[0], vec![keys[1], keys[1]], 1),
            Err(Error::InvalidKeyMaterial { .. })
        ));
    }

    #[test]
    fn test_challenge_is_deterministic() {
        assert_eq!(quorum(5, 3).challenge(), quorum(5, 3).challenge());
        assert_ne!(quorum(5, 3).challenge(), quorum(5, 2).challenge());
    }

    #[test]
    fn test_slots_and_short_ids() {
        let q = quorum(3, 2);

        assert_eq!(q.slot_of(&q.internal_key()), Some(SignerSlot::KeyPath));
        assert_eq!(q.slot_of(&q.signers()[2]), Some(SignerSlot::Script(2)));
        assert_eq!(q.short_ids(99).len(), 4);
        assert!(q.short_ids(99).contains(&q.short_id(99, SignerSlot::Script(1)).unwrap()));
        assert!(q.address(Network::Signet).to_string().starts_with("tb1p"));
    }
}
