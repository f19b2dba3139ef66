//! Core types shared by the quorum, signing and relay layers

use bitcoin::hashes::siphash24;
use bitcoin::secp256k1::{Parity, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Compact, non-cryptographic signer identifier used in relay bookkeeping
pub type ShortId = u64;

/// Key expressions for one quorum member.
///
/// Exactly one member per signer view carries `extended_private_key`; all
/// other members are referenced by their public expression only.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct SignerKeyPair {
    /// Private key expression (WIF or `xprv`/`tprv` with derivation suffix)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extended_private_key: Option<String>,

    /// Public key expression (hex x-only/compressed key or `xpub`/`tpub`)
    pub extended_public_key: String,
}

impl SignerKeyPair {
    /// Public-only member
    pub fn public(extended_public_key: impl Into<String>) -> Self {
        Self {
            extended_private_key: None,
            extended_public_key: extended_public_key.into(),
        }
    }

    /// Member with local private key material
    pub fn with_private(
        extended_private_key: impl Into<String>,
        extended_public_key: impl Into<String>,
    ) -> Self {
        Self {
            extended_private_key: Some(extended_private_key.into()),
            extended_public_key: extended_public_key.into(),
        }
    }

    /// Whether this member can sign locally
    pub fn has_private(&self) -> bool {
        self.extended_private_key.is_some()
    }
}

impl fmt::Debug for SignerKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignerKeyPair")
            .field(
                "extended_private_key",
                &self.extended_private_key.as_ref().map(|_| "<redacted>"),
            )
            .field("extended_public_key", &self.extended_public_key)
            .finish()
    }
}

/// Parse a JSON key file (an array of [`SignerKeyPair`])
pub fn parse_key_file(json: &str) -> crate::Result<Vec<SignerKeyPair>> {
    Ok(serde_json::from_str(json)?)
}

/// Position of a signer within the quorum
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SignerSlot {
    /// The taproot internal key (key-path spend)
    KeyPath,
    /// The i-th key of the `multi_a` leaf (zero based)
    Script(usize),
}

impl SignerSlot {
    /// Index in the flat key list used by descriptors (internal key first)
    pub fn key_index(&self) -> usize {
        match self {
            SignerSlot::KeyPath => 0,
            SignerSlot::Script(i) => i + 1,
        }
    }

    /// Inverse of [`SignerSlot::key_index`]
    pub fn from_key_index(index: usize) -> Self {
        match index {
            0 => SignerSlot::KeyPath,
            i => SignerSlot::Script(i - 1),
        }
    }
}

impl fmt::Display for SignerSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignerSlot::KeyPath => write!(f, "key-path slot"),
            SignerSlot::Script(i) => write!(f, "script slot {}", i),
        }
    }
}

/// SipHash-2-4 of the signer's compressed public key, keyed by the
/// session nonce.
///
/// Quorum keys are x-only, so the even-parity (`0x02`) encoding is hashed.
pub fn compute_short_id(nonce: u64, key: &XOnlyPublicKey) -> ShortId {
    let compressed = key.public_key(Parity::Even).serialize();
    siphash24::Hash::hash_with_keys(nonce, 0, &compressed).as_u64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::secp256k1::{Keypair, Secp256k1, SecretKey};

    fn key(byte: u8) -> XOnlyPublicKey {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[byte; 32]).unwrap();
        Keypair::from_secret_key(&secp, &sk).x_only_public_key().0
    }

    #[test]
    fn test_short_id_hashes_compressed_key() {
        let k = key(3);
        let mut compressed = vec![0x02];
        compressed.extend_from_slice(&k.serialize());

        let expected = siphash24::Hash::hash_with_keys(77, 0, &compressed).as_u64();
        assert_eq!(compute_short_id(77, &k), expected);
        assert_ne!(
            compute_short_id(77, &k),
            siphash24::Hash::hash_with_keys(77, 0, &k.serialize()).as_u64()
        );
    }

    #[test]
    fn test_short_id_depends_on_nonce_and_key() {
        let a = key(1);
        let b = key(2);

        assert_eq!(compute_short_id(7, &a), compute_short_id(7, &a));
        assert_ne!(compute_short_id(7, &a), compute_short_id(8, &a));
        assert_ne!(compute_short_id(7, &a), compute_short_id(7, &b));
    }

    #[test]
    fn test_slot_key_index() {
        assert_eq!(SignerSlot::KeyPath.key_index(), 0);
        assert_eq!(SignerSlot::Script(4).key_index(), 5);
        assert_eq!(SignerSlot::from_key_index(5), SignerSlot::Script(4));
        assert_eq!(SignerSlot::from_key_index(0), SignerSlot::KeyPath);
    }

    #[test]
    fn test_key_file_redacts_private_key() {
        let json = r#"[{"extended_private_key":"tprvsecret","extended_public_key":"tpub"},{"extended_public_key":"tpub2"}]"#;
        let keys = parse_key_file(json).unwrap();

        assert_eq!(keys.len(), 2);
        assert!(keys[0].has_private());
        assert!(!keys[1].has_private());
        assert!(!format!("{:?}", keys[0]).contains("tprvsecret"));
    }
}
