//! Signing capability

use super::{sighashes, update_psbt, SIGHASH_TYPE};
use crate::quorum::{Quorum, QuorumDescriptor};
use crate::types::{compute_short_id, ShortId, SignerSlot};
use crate::{Error, Result};
use bitcoin::key::TapTweak;
use bitcoin::psbt::Psbt;
use bitcoin::secp256k1::{All, Keypair, Secp256k1, XOnlyPublicKey};
use bitcoin::taproot;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Produces a signature for exactly one quorum slot.
///
/// Implementations must only add their own slot's signature and leave every
/// other field of the PSBT untouched.
pub trait PsbtSigner: Send + Sync {
    /// Slot this signer can fill
    fn slot(&self) -> SignerSlot;

    /// Return a copy of `psbt` carrying this signer's signature
    fn sign_psbt(&self, psbt: &Psbt) -> Result<Psbt>;
}

/// Signer backed by a locally held key
pub struct LocalSigner {
    quorum: Arc<Quorum>,
    slot: SignerSlot,
    keypair: Keypair,
    secp: Secp256k1<All>,
}

impl LocalSigner {
    /// Create a signer for `slot`; the key must be the one the quorum holds there
    pub fn new(quorum: Arc<Quorum>, slot: SignerSlot, keypair: Keypair) -> Result<Self> {
        let public = keypair.x_only_public_key().0;
        match quorum.key_for(slot) {
            Some(expected) if expected == public => Ok(Self {
                quorum,
                slot,
                keypair,
                secp: Secp256k1::new(),
            }),
            Some(_) => Err(Error::invalid_key(
                &public.to_string(),
                format!("key does not occupy {}", slot),
            )),
            None => Err(Error::invalid_key(
                &public.to_string(),
                format!("quorum has no {}", slot),
            )),
        }
    }

    /// Signer for the private key held by a descriptor
    pub fn from_descriptor(descriptor: &QuorumDescriptor) -> Result<Self> {
        let (slot, keypair) = descriptor.local_keypair().ok_or_else(|| {
            Error::InvalidDescriptor("descriptor holds no private key".into())
        })?;
        Self::new(descriptor.quorum(), slot, keypair)
    }

    /// Public key of this signer
    pub fn public_key(&self) -> XOnlyPublicKey {
        self.keypair.x_only_public_key().0
    }

    /// Short id of this signer for a session
    pub fn short_id(&self, nonce: u64) -> ShortId {
        compute_short_id(nonce, &self.public_key())
    }

    /// Quorum this signer belongs to
    pub fn quorum(&self) -> &Arc<Quorum> {
        &self.quorum
    }
}

impl PsbtSigner for LocalSigner {
    fn slot(&self) -> SignerSlot {
        self.slot
    }

    #[instrument(skip_all, fields(slot = %self.slot))]
    fn sign_psbt(&self, psbt: &Psbt) -> Result<Psbt> {
        let mut psbt = psbt.clone();
        update_psbt(&mut psbt, &self.quorum)?;
        let hashes = sighashes(&psbt, &self.quorum)?;

        let input = &mut psbt.inputs[0];
        match self.slot {
            SignerSlot::KeyPath => {
                let tweaked = self
                    .keypair
                    .tap_tweak(&self.secp, self.quorum.merkle_root())
                    .to_keypair();
                let signature = self.secp.sign_schnorr_no_aux_rand(&hashes.key_path, &tweaked);
                input.tap_key_sig = Some(taproot::Signature {
                    signature,
                    sighash_type: SIGHASH_TYPE,
                });
            }
            SignerSlot::Script(_) => {
                let signature = self.secp.sign_schnorr_no_aux_rand(&hashes.script_path, &self.keypair);
                input.tap_script_sigs.insert(
                    (self.public_key(), self.quorum.leaf_hash()),
                    taproot::Signature {
                        signature,
                        sighash_type: SIGHASH_TYPE,
                    },
                );
            }
        }

        debug!(key = %self.public_key(), "PSBT signed");
        Ok(psbt)
    }
}

impl fmt::Debug for LocalSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalSigner")
            .field("slot", &self.slot)
            .field("public_key", &self.public_key())
            .finish()
    }
}
