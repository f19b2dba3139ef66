//! Signing round state machine

use super::{sighashes, update_psbt, PsbtSigner, Sighashes, SIGHASH_TYPE};
use crate::quorum::Quorum;
use crate::types::SignerSlot;
use crate::{Error, Result};
use bitcoin::psbt::Psbt;
use bitcoin::secp256k1::{Secp256k1, VerifyOnly, XOnlyPublicKey};
use bitcoin::taproot;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, instrument, warn};

/// Signing round state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundState {
    /// Fewer valid signatures than the threshold
    Collecting { signatures: usize, required: usize },
    /// Enough valid signatures to satisfy the key path or the leaf
    Complete,
    /// A signer produced a conflicting or invalid signature
    Failed { reason: String },
}

/// Collects partial signatures for one signet block into a single PSBT.
///
/// Slots are additive: a slot is filled once and any later signature for it
/// must be identical. The resulting state depends only on the set of
/// signatures seen, never on their arrival order.
#[derive(Debug)]
pub struct SigningRound {
    quorum: Arc<Quorum>,
    psbt: Psbt,
    sighashes: Sighashes,
    key_path: Option<taproot::Signature>,
    script: Vec<Option<taproot::Signature>>,
    failure: Option<String>,
    secp: Secp256k1<VerifyOnly>,
}

impl SigningRound {
    /// Start a round for `psbt`, ingesting any signatures it already carries
    pub fn new(quorum: Arc<Quorum>, psbt: Psbt) -> Result<Self> {
        let incoming = psbt.clone();
        let mut psbt = psbt;
        update_psbt(&mut psbt, &quorum)?;
        let sighashes = sighashes(&psbt, &quorum)?;

        let input = &mut psbt.inputs[0];
        input.tap_key_sig = None;
        input.tap_script_sigs.clear();

        let mut round = Self {
            script: vec![None; quorum.signers().len()],
            quorum,
            psbt,
            sighashes,
            key_path: None,
            failure: None,
            secp: Secp256k1::verification_only(),
        };
        round.merge(&incoming)?;
        Ok(round)
    }

    /// Current state
    pub fn state(&self) -> RoundState {
        if let Some(reason) = &self.failure {
            return RoundState::Failed {
                reason: reason.clone(),
            };
        }
        if self.is_complete() {
            return RoundState::Complete;
        }
        RoundState::Collecting {
            signatures: self.signature_count(),
            required: self.quorum.threshold(),
        }
    }

    /// True once the key path is signed or the leaf threshold is met
    pub fn is_complete(&self) -> bool {
        self.failure.is_none()
            && (self.key_path.is_some() || self.script_signature_count() >= self.quorum.threshold())
    }

    /// Number of filled slots, key path included
    pub fn signature_count(&self) -> usize {
        self.script_signature_count() + usize::from(self.key_path.is_some())
    }

    fn script_signature_count(&self) -> usize {
        self.script.iter().filter(|s| s.is_some()).count()
    }

    /// Filled slots in key order
    pub fn signed_slots(&self) -> Vec<SignerSlot> {
        self.key_path
            .iter()
            .map(|_| SignerSlot::KeyPath)
            .chain(
                self.script
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| s.is_some())
                    .map(|(i, _)| SignerSlot::Script(i)),
            )
            .collect()
    }

    /// The merged PSBT
    pub fn psbt(&self) -> &Psbt {
        &self.psbt
    }

    pub fn into_psbt(self) -> Psbt {
        self.psbt
    }

    pub fn quorum(&self) -> &Arc<Quorum> {
        &self.quorum
    }

    /// One signing step: let `signer` fill its slot and merge the result
    #[instrument(skip_all, fields(slot = %signer.slot()))]
    pub fn apply(&mut self, signer: &dyn PsbtSigner) -> Result<RoundState> {
        self.ensure_active()?;
        let signed = signer.sign_psbt(&self.psbt)?;
        self.merge(&signed)?;
        Ok(self.state())
    }

    /// Merge the signatures of a partial PSBT produced by any quorum member
    pub fn merge(&mut self, partial: &Psbt) -> Result<RoundState> {
        self.ensure_active()?;
        if partial.unsigned_tx != self.psbt.unsigned_tx {
            return Err(Error::Psbt("partial PSBT signs a different transaction".into()));
        }
        let Some(input) = partial.inputs.first() else {
            return Err(Error::Psbt("partial PSBT has no inputs".into()));
        };

        for (_, (script, _)) in &input.tap_scripts {
            if script != self.quorum.script() {
                return Err(self.fail(Error::ScriptMismatch(
                    "partial PSBT carries a foreign leaf script".into(),
                )));
            }
        }

        if let Some(signature) = &input.tap_key_sig {
            self.accept(SignerSlot::KeyPath, signature)?;
        }
        for ((key, leaf_hash), signature) in &input.tap_script_sigs {
            if *leaf_hash != self.quorum.leaf_hash() {
                return Err(self.fail(Error::ScriptMismatch(format!(
                    "signature by {} commits to leaf {}",
                    key, leaf_hash
                ))));
            }
            let slot = match self.quorum.slot_of(key) {
                Some(slot @ SignerSlot::Script(_)) => slot,
                _ => {
                    return Err(self.fail(Error::InvalidSignature {
                        slot: key.to_string(),
                        reason: "key is not part of the multi_a leaf".into(),
                    }))
                }
            };
            self.accept(slot, signature)?;
        }

        let state = self.state();
        debug!(?state, "Partial PSBT merged");
        Ok(state)
    }

    /// Wait for partial PSBTs on `rx` until the round completes.
    ///
    /// PSBTs for other transactions are skipped; any other error ends the
    /// collection. The round is left as is on timeout and may be resumed.
    pub async fn collect(&mut self, rx: &mut mpsc::Receiver<Psbt>, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        while !self.is_complete() {
            self.ensure_active()?;
            let partial = match timeout_at(deadline, rx.recv()).await {
                Ok(Some(partial)) => partial,
                Ok(None) => return Err(Error::Relay("partial PSBT channel closed".into())),
                Err(_) => return Err(Error::CollectionTimeout(timeout)),
            };
            match self.merge(&partial) {
                Ok(_) => {}
                Err(Error::Psbt(e)) => warn!(error = %e, "Skipping unrelated PSBT"),
                Err(e) => return Err(e),
            }
        }
        info!(signatures = self.signature_count(), "Signing round complete");
        Ok(())
    }

    fn ensure_active(&self) -> Result<()> {
        match &self.failure {
            Some(reason) => Err(Error::RoundFailed(reason.clone())),
            None => Ok(()),
        }
    }

    fn accept(&mut self, slot: SignerSlot, signature: &taproot::Signature) -> Result<()> {
        let filled = match slot {
            SignerSlot::KeyPath => self.key_path.clone(),
            SignerSlot::Script(i) => self.script[i].clone(),
        };
        if filled.as_ref() == Some(signature) {
            return Ok(());
        }

        if let Err(reason) = self.verify(slot, signature) {
            return Err(self.fail(Error::InvalidSignature {
                slot: slot.to_string(),
                reason,
            }));
        }
        if filled.is_some() {
            return Err(self.fail(Error::ConflictingSignature {
                slot: slot.to_string(),
            }));
        }

        let input = &mut self.psbt.inputs[0];
        match slot {
            SignerSlot::KeyPath => {
                self.key_path = Some(signature.clone());
                input.tap_key_sig = Some(signature.clone());
            }
            SignerSlot::Script(i) => {
                let key = self.quorum.signers()[i];
                self.script[i] = Some(signature.clone());
                input
                    .tap_script_sigs
                    .insert((key, self.quorum.leaf_hash()), signature.clone());
            }
        }
        debug!(%slot, "Signature accepted");
        Ok(())
    }

    fn verify(&self, slot: SignerSlot, signature: &taproot::Signature) -> std::result::Result<(), String> {
        if signature.sighash_type != SIGHASH_TYPE {
            return Err(format!("unexpected sighash type {}", signature.sighash_type));
        }
        let (message, key): (_, XOnlyPublicKey) = match slot {
            SignerSlot::KeyPath => (&self.sighashes.key_path, self.quorum.output_key()),
            SignerSlot::Script(i) => (&self.sighashes.script_path, self.quorum.signers()[i]),
        };
        self.secp
            .verify_schnorr(&signature.signature, message, &key)
            .map_err(|e| e.to_string())
    }

    fn fail(&mut self, error: Error) -> Error {
        warn!(%error, "Signing round failed");
        self.failure = Some(error.to_string());
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sign::LocalSigner;
    use crate::test_support::{keypairs, quorum_with_keys, spending_psbt};
    use bitcoin::secp256k1::{Keypair, Message};

    fn signers(quorum: &Arc<Quorum>, keys: &[Keypair]) -> Vec<LocalSigner> {
        keys[1..]
            .iter()
            .enumerate()
            .map(|(i, k)| LocalSigner::new(quorum.clone(), SignerSlot::Script(i), *k).unwrap())
            .collect()
    }

    #[test]
    fn test_threshold_and_monotonicity() {
        let (quorum, keys) = quorum_with_keys(5, 3);
        let signers = signers(&quorum, &keys);
        let mut round = SigningRound::new(quorum.clone(), spending_psbt(quorum.challenge())).unwrap();

        assert_eq!(
            round.state(),
            RoundState::Collecting { signatures: 0, required: 3 }
        );
        round.apply(&signers[0]).unwrap();
        round.apply(&signers[3]).unwrap();
        assert!(!round.is_complete());

        assert_eq!(round.apply(&signers[4]).unwrap(), RoundState::Complete);
        assert_eq!(round.apply(&signers[1]).unwrap(), RoundState::Complete);
        assert_eq!(round.signature_count(), 4);
        assert_eq!(
            round.signed_slots(),
            vec![
                SignerSlot::Script(0),
                SignerSlot::Script(1),
                SignerSlot::Script(3),
                SignerSlot::Script(4)
            ]
        );
    }

    #[test]
    fn test_idempotent_signing() {
        let (quorum, keys) = quorum_with_keys(3, 2);
        let signers = signers(&quorum, &keys);
        let mut round = SigningRound::new(quorum.clone(), spending_psbt(quorum.challenge())).unwrap();

        round.apply(&signers[1]).unwrap();
        let once = round.psbt().clone();
        round.apply(&signers[1]).unwrap();

        assert_eq!(round.psbt(), &once);
        assert_eq!(round.signature_count(), 1);
    }

    #[test]
    fn test_order_independence() {
        let (quorum, keys) = quorum_with_keys(4, 2);
        let signers = signers(&quorum, &keys);
        let psbt = spending_psbt(quorum.challenge());

        let mut ab = SigningRound::new(quorum.clone(), psbt.clone()).unwrap();
        ab.apply(&signers[0]).unwrap();
        ab.apply(&signers[2]).unwrap();

        let mut ba = SigningRound::new(quorum.clone(), psbt.clone()).unwrap();
        ba.apply(&signers[2]).unwrap();
        ba.apply(&signers[0]).unwrap();

        assert_eq!(ab.state(), ba.state());
        assert_eq!(ab.psbt(), ba.psbt());
    }

    #[test]
    fn test_merge_independent_partials() {
        let (quorum, keys) = quorum_with_keys(4, 3);
        let signers = signers(&quorum, &keys);
        let psbt = spending_psbt(quorum.challenge());

        let partials: Vec<Psbt> = signers.iter().map(|s| s.sign_psbt(&psbt).unwrap()).collect();
        let mut round = SigningRound::new(quorum.clone(), psbt).unwrap();
        for partial in partials.iter().rev().take(3) {
            round.merge(partial).unwrap();
        }

        assert!(round.is_complete());
        assert_eq!(round.signature_count(), 3);
    }

    #[test]
    fn test_conflicting_signature_fails_round() {
        let (quorum, keys) = quorum_with_keys(3, 2);
        let signers = signers(&quorum, &keys);
        let mut round = SigningRound::new(quorum.clone(), spending_psbt(quorum.challenge())).unwrap();
        round.apply(&signers[0]).unwrap();

        // A second valid signature for slot 0, made with auxiliary randomness
        let secp = Secp256k1::new();
        let hashes = sighashes(round.psbt(), &quorum).unwrap();
        let signature = secp.sign_schnorr_with_aux_rand(&hashes.script_path, &keys[1], &[7u8; 32]);
        let mut partial = round.psbt().clone();
        partial.inputs[0].tap_script_sigs.insert(
            (keys[1].x_only_public_key().0, quorum.leaf_hash()),
            taproot::Signature {
                signature,
                sighash_type: SIGHASH_TYPE,
            },
        );

        assert!(matches!(
            round.merge(&partial),
            Err(Error::ConflictingSignature { .. })
        ));
        assert!(matches!(round.state(), RoundState::Failed { .. }));
        assert!(matches!(round.apply(&signers[1]), Err(Error::RoundFailed(_))));
    }

    #[test]
    fn test_invalid_signature_fails_round() {
        let (quorum, keys) = quorum_with_keys(3, 2);
        let mut round = SigningRound::new(quorum.clone(), spending_psbt(quorum.challenge())).unwrap();

        let secp = Secp256k1::new();
        let signature = secp.sign_schnorr_no_aux_rand(&Message::from_digest([1u8; 32]), &keys[2]);
        let mut partial = round.psbt().clone();
        partial.inputs[0].tap_script_sigs.insert(
            (keys[2].x_only_public_key().0, quorum.leaf_hash()),
            taproot::Signature {
                signature,
                sighash_type: SIGHASH_TYPE,
            },
        );

        assert!(matches!(
            round.merge(&partial),
            Err(Error::InvalidSignature { .. })
        ));
        assert!(matches!(round.state(), RoundState::Failed { .. }));
    }

    #[test]
    fn test_unrelated_psbt_keeps_round_alive() {
        let (quorum, keys) = quorum_with_keys(3, 2);
        let signers = signers(&quorum, &keys);
        let mut round = SigningRound::new(quorum.clone(), spending_psbt(quorum.challenge())).unwrap();

        let mut other = round.psbt().clone();
        other.unsigned_tx.lock_time = bitcoin::absolute::LockTime::from_consensus(1);

        assert!(matches!(round.merge(&other), Err(Error::Psbt(_))));
        assert!(round.apply(&signers[0]).is_ok());
    }

    #[test]
    fn test_key_path_fast_path() {
        let (quorum, keys) = quorum_with_keys(3, 3);
        let internal = LocalSigner::new(quorum.clone(), SignerSlot::KeyPath, keys[0]).unwrap();
        let mut round = SigningRound::new(quorum.clone(), spending_psbt(quorum.challenge())).unwrap();

        assert_eq!(round.apply(&internal).unwrap(), RoundState::Complete);
        assert_eq!(round.signed_slots(), vec![SignerSlot::KeyPath]);
        assert!(round.psbt().inputs[0].tap_key_sig.is_some());
    }

    #[test]
    fn test_new_ingests_existing_signatures() {
        let (quorum, keys) = quorum_with_keys(3, 2);
        let signers = signers(&quorum, &keys);
        let psbt = signers[2].sign_psbt(&spending_psbt(quorum.challenge())).unwrap();

        let round = SigningRound::new(quorum, psbt).unwrap();
        assert_eq!(round.signed_slots(), vec![SignerSlot::Script(2)]);
    }

    #[test]
    fn test_foreign_challenge_rejected() {
        let (quorum, _) = quorum_with_keys(3, 2);
        let (other, _) = quorum_with_keys(3, 1);

        assert!(matches!(
            SigningRound::new(quorum, spending_psbt(other.challenge())),
            Err(Error::ScriptMismatch(_))
        ));
    }

    #[test]
    fn test_local_signer_rejects_wrong_slot() {
        let (quorum, keys) = quorum_with_keys(3, 2);
        let stranger = keypairs(10).pop().unwrap();

        assert!(LocalSigner::new(quorum.clone(), SignerSlot::Script(0), keys[2]).is_err());
        assert!(LocalSigner::new(quorum.clone(), SignerSlot::Script(7), keys[1]).is_err());
        assert!(LocalSigner::new(quorum, SignerSlot::KeyPath, stranger).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_collect_until_complete() {
        let (quorum, keys) = quorum_with_keys(4, 2);
        let signers = signers(&quorum, &keys);
        let psbt = spending_psbt(quorum.challenge());
        let (tx, mut rx) = mpsc::channel(8);

        for signer in &signers[1..3] {
            tx.send(signer.sign_psbt(&psbt).unwrap()).await.unwrap();
        }

        let mut round = SigningRound::new(quorum, psbt).unwrap();
        round.collect(&mut rx, Duration::from_secs(5)).await.unwrap();
        assert!(round.is_complete());
    }

    #[tokio::test(start_paused = true)]
    async fn test_collect_times_out() {
        let (quorum, keys) = quorum_with_keys(4, 2);
        let signers = signers(&quorum, &keys);
        let psbt = spending_psbt(quorum.challenge());
        let (tx, mut rx) = mpsc::channel(8);
        tx.send(signers[0].sign_psbt(&psbt).unwrap()).await.unwrap();

        let mut round = SigningRound::new(quorum, psbt).unwrap();
        let result = round.collect(&mut rx, Duration::from_secs(5)).await;

        assert!(matches!(result, Err(Error::CollectionTimeout(_))));
        assert_eq!(round.signature_count(), 1);
        drop(tx);
    }
}
