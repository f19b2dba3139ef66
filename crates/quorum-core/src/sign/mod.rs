//! Threshold signing coordinator
//!
//! Partial signatures are gathered into one PSBT by a [`SigningRound`].
//! Every signer only fills its own slot through a [`PsbtSigner`], so partial
//! PSBTs from different signers can be merged in any order.

mod round;
mod session;
mod signer;

pub use round::{RoundState, SigningRound};
pub use session::SessionManager;
pub use signer::{LocalSigner, PsbtSigner};

use crate::quorum::Quorum;
use crate::{Error, Result};
use bitcoin::hashes::Hash;
use bitcoin::psbt::{Psbt, PsbtSighashType};
use bitcoin::secp256k1::Message;
use bitcoin::sighash::{Prevouts, SighashCache, TapSighashType};
use bitcoin::taproot::LeafVersion;
use bitcoin::TxOut;

/// Sighash type used by every quorum signature
pub const SIGHASH_TYPE: TapSighashType = TapSighashType::All;

/// Messages the key-path and script-path signatures commit to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Sighashes {
    pub key_path: Message,
    pub script_path: Message,
}

/// Output spent by the single signet input
pub(crate) fn spent_output(psbt: &Psbt) -> Result<TxOut> {
    if psbt.unsigned_tx.input.len() != 1 || psbt.inputs.len() != 1 {
        return Err(Error::Psbt(format!(
            "expected exactly one input, got {}",
            psbt.unsigned_tx.input.len()
        )));
    }
    let input = &psbt.inputs[0];
    if let Some(utxo) = &input.witness_utxo {
        return Ok(utxo.clone());
    }
    let vout = psbt.unsigned_tx.input[0].previous_output.vout as usize;
    input
        .non_witness_utxo
        .as_ref()
        .and_then(|tx| tx.output.get(vout))
        .cloned()
        .ok_or_else(|| Error::Psbt("input is missing its spent output".into()))
}

/// Fill the taproot metadata of input 0 for `quorum` (PSBT updater role).
///
/// Existing metadata that disagrees with the quorum is rejected.
pub(crate) fn update_psbt(psbt: &mut Psbt, quorum: &Quorum) -> Result<()> {
    let utxo = spent_output(psbt)?;
    if &utxo.script_pubkey != quorum.challenge() {
        return Err(Error::ScriptMismatch(format!(
            "PSBT spends {} instead of the quorum challenge {}",
            hex::encode(utxo.script_pubkey.as_bytes()),
            hex::encode(quorum.challenge().as_bytes())
        )));
    }

    let input = &mut psbt.inputs[0];
    input.witness_utxo.get_or_insert(utxo);

    match input.tap_internal_key {
        Some(key) if key != quorum.internal_key() => {
            return Err(Error::ScriptMismatch(format!(
                "PSBT internal key {} is not the quorum internal key",
                key
            )))
        }
        _ => input.tap_internal_key = Some(quorum.internal_key()),
    }
    input.tap_merkle_root = quorum.merkle_root();

    for (control_block, (script, _)) in &input.tap_scripts {
        if script != quorum.script() || control_block != quorum.control_block() {
            return Err(Error::ScriptMismatch(
                "PSBT leaf script differs from the quorum script".into(),
            ));
        }
    }
    input.tap_scripts.insert(
        quorum.control_block().clone(),
        (quorum.script().clone(), LeafVersion::TapScript),
    );
    input
        .sighash_type
        .get_or_insert(PsbtSighashType::from(SIGHASH_TYPE));

    Ok(())
}

pub(crate) fn sighashes(psbt: &Psbt, quorum: &Quorum) -> Result<Sighashes> {
    let prevouts = [spent_output(psbt)?];
    let prevouts = Prevouts::All(&prevouts);
    let mut cache = SighashCache::new(&psbt.unsigned_tx);

    let key_path = cache.taproot_key_spend_signature_hash(0, &prevouts, SIGHASH_TYPE)?;
    let script_path =
        cache.taproot_script_spend_signature_hash(0, &prevouts, quorum.leaf_hash(), SIGHASH_TYPE)?;

    Ok(Sighashes {
        key_path: Message::from_digest(key_path.to_byte_array()),
        script_path: Message::from_digest(script_path.to_byte_array()),
    })
}
