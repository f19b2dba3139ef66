//! Descriptor construction and cross-signer challenge verification

use super::descriptor::{parse_parts, render, strip_checksum, with_checksum};
use super::keys::parse_key;
use super::Quorum;
use crate::types::{SignerKeyPair, SignerSlot};
use crate::{Error, Result};
use bitcoin::secp256k1::{Keypair, Secp256k1};
use bitcoin::{Address, Network, ScriptBuf};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// A parsed quorum descriptor, optionally holding one local private key
#[derive(Clone)]
pub struct QuorumDescriptor {
    text: String,
    quorum: Arc<Quorum>,
    local: Option<(SignerSlot, Keypair)>,
}

impl QuorumDescriptor {
    /// Parse `tr(KEY,multi_a(M,KEY,...))` with an optional checksum.
    ///
    /// At most one key may be private: a descriptor is a single signer's view.
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        let body = strip_checksum(text)?;
        let parts = parse_parts(body)?;
        let secp = Secp256k1::new();

        let mut exprs = Vec::with_capacity(parts.keys.len() + 1);
        for key in std::iter::once(parts.internal).chain(parts.keys.iter().copied()) {
            let expr = parse_key(key, &secp).map_err(|e| match e {
                Error::InvalidKeyMaterial { key, reason } => Error::InvalidKeyMaterial {
                    key,
                    reason: format!("tr(): {}", reason),
                },
                other => other,
            })?;
            exprs.push(expr);
        }

        let mut local = None;
        for (index, expr) in exprs.iter().enumerate() {
            if let Some(keypair) = expr.keypair {
                if local.is_some() {
                    return Err(Error::invalid_key(
                        if index == 0 { parts.internal } else { parts.keys[index - 1] },
                        "descriptor holds more than one private key",
                    ));
                }
                local = Some((SignerSlot::from_key_index(index), keypair));
            }
        }

        let quorum = Quorum::new(
            exprs[0].public,
            exprs[1..].iter().map(|e| e.public).collect(),
            parts.threshold,
        )?;

        Ok(Self {
            text: with_checksum(body)?,
            quorum: Arc::new(quorum),
            local,
        })
    }

    /// Descriptor text with checksum
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Shared quorum
    pub fn quorum(&self) -> Arc<Quorum> {
        self.quorum.clone()
    }

    /// Signet challenge committed to by this descriptor
    pub fn challenge(&self) -> &ScriptBuf {
        self.quorum.challenge()
    }

    /// Challenge address
    pub fn address(&self, network: Network) -> Address {
        self.quorum.address(network)
    }

    /// Slot of the local private key
    pub fn local_slot(&self) -> Option<SignerSlot> {
        self.local.map(|(slot, _)| slot)
    }

    pub(crate) fn local_keypair(&self) -> Option<(SignerSlot, Keypair)> {
        self.local
    }
}

impl fmt::Display for QuorumDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.local.is_some() {
            write!(f, "<descriptor with private key>")
        } else {
            f.write_str(&self.text)
        }
    }
}

impl fmt::Debug for QuorumDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuorumDescriptor")
            .field("threshold", &self.quorum.threshold())
            .field("signers", &self.quorum.signers().len())
            .field("local_slot", &self.local_slot())
            .finish()
    }
}

/// A signer's self-signing descriptor: its own slot private, all others public
#[derive(Clone)]
pub struct SignerView {
    pub slot: SignerSlot,
    pub descriptor: String,
}

impl fmt::Debug for SignerView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignerView").field("slot", &self.slot).finish()
    }
}

/// Builds quorum descriptors from an ordered key list (internal key first)
pub struct QuorumBuilder;

impl QuorumBuilder {
    /// Build the public descriptor and its challenge.
    ///
    /// Every key carrying private material is rendered into its own signer
    /// view, parsed back and checked to derive the identical challenge.
    #[instrument(skip(keys), fields(keys = keys.len()))]
    pub fn build(keys: &[SignerKeyPair], threshold: usize) -> Result<(QuorumDescriptor, ScriptBuf)> {
        if keys.len() < 2 {
            return Err(Error::InvalidThreshold {
                threshold,
                signers: keys.len().saturating_sub(1),
            });
        }

        let public: Vec<&str> = keys.iter().map(|k| k.extended_public_key.as_str()).collect();
        let descriptor = QuorumDescriptor::parse(&render(public[0], threshold, &public[1..]))?;
        if descriptor.local.is_some() {
            return Err(Error::invalid_key(
                "extended_public_key",
                "public key list contains private material",
            ));
        }

        let expected = descriptor.address(Network::Signet).to_string();
        let views = Self::signer_views(keys, threshold)?;
        for view in &views {
            let parsed = QuorumDescriptor::parse(&view.descriptor)?;
            let actual = parsed.address(Network::Signet).to_string();
            if parsed.challenge() != descriptor.challenge() {
                return Err(Error::AddressMismatch {
                    signer: view.slot.key_index(),
                    expected,
                    actual,
                });
            }
            debug!(slot = %view.slot, address = %actual, "Signer view verified");
        }

        info!(
            threshold,
            signers = keys.len() - 1,
            views = views.len(),
            address = %expected,
            challenge = %hex::encode(descriptor.challenge().as_bytes()),
            "Descriptor initialized successfully"
        );

        let challenge = descriptor.challenge().clone();
        Ok((descriptor, challenge))
    }

    /// Render the self-signing descriptor of every key with private material
    pub fn signer_views(keys: &[SignerKeyPair], threshold: usize) -> Result<Vec<SignerView>> {
        let mut views = Vec::new();
        for (index, key) in keys.iter().enumerate() {
            let Some(private) = key.extended_private_key.as_deref() else {
                continue;
            };
            let slot_keys: Vec<&str> = keys
                .iter()
                .enumerate()
                .map(|(i, k)| if i == index { private } else { k.extended_public_key.as_str() })
                .collect();
            views.push(SignerView {
                slot: SignerSlot::from_key_index(index),
                descriptor: with_checksum(&render(slot_keys[0], threshold, &slot_keys[1..]))?,
            });
        }
        Ok(views)
    }
}
