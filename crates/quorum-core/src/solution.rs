//! Signet solution extraction
//!
//! The solution is the scriptSig and witness that spend the virtual
//! `to_spend` output. For a quorum the scriptSig is always empty and the
//! witness is either a single key-path signature or a `multi_a` script-path
//! stack (one item per leaf key in reverse key order, the leaf script and
//! the control block).

use crate::quorum::Quorum;
use crate::signet::SIGNET_HEADER;
use crate::{Error, Result};
use bitcoin::consensus::encode::{serialize, Decodable};
use bitcoin::psbt::{Input, Psbt};
use bitcoin::{ScriptBuf, Witness};
use std::collections::BTreeMap;
use tracing::{debug, instrument};

/// scriptSig and witness authorizing a signet block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignetSolution {
    pub script_sig: ScriptBuf,
    pub witness: Witness,
}

impl SignetSolution {
    /// `compact(script_sig) || witness`
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = serialize(&self.script_sig);
        bytes.extend(serialize(&self.witness));
        bytes
    }

    /// Solution prefixed with the signet header, as pushed into the block
    pub fn commitment_section(&self) -> Vec<u8> {
        let mut section = SIGNET_HEADER.to_vec();
        section.extend(self.to_bytes());
        section
    }

    /// Parse a solution without the header
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut reader = bytes;
        let script_sig = ScriptBuf::consensus_decode(&mut reader).map_err(|e| Error::Block(e.to_string()))?;
        let witness = Witness::consensus_decode(&mut reader).map_err(|e| Error::Block(e.to_string()))?;
        if !reader.is_empty() {
            return Err(Error::Block(format!(
                "{} trailing bytes after signet solution",
                reader.len()
            )));
        }
        Ok(Self { script_sig, witness })
    }

    /// Parse a header-prefixed commitment section
    pub fn from_commitment_section(section: &[u8]) -> Result<Self> {
        let body = section
            .strip_prefix(&SIGNET_HEADER[..])
            .ok_or_else(|| Error::Block("commitment section lacks the signet header".into()))?;
        Self::from_bytes(body)
    }

    /// Build the solution from a signed PSBT
    pub fn from_psbt(psbt: &Psbt, quorum: &Quorum) -> Result<Self> {
        let input = psbt
            .inputs
            .first()
            .ok_or_else(|| Error::Psbt("PSBT has no inputs".into()))?;

        let witness = match &input.final_script_witness {
            Some(witness) => {
                check_witness(witness, quorum)?;
                witness.clone()
            }
            None => build_witness(input, quorum)?,
        };

        Ok(Self {
            script_sig: input.final_script_sig.clone().unwrap_or_default(),
            witness,
        })
    }
}

/// Assemble the witness from the partial signatures of input 0
fn build_witness(input: &Input, quorum: &Quorum) -> Result<Witness> {
    let mut witness = Witness::new();
    if let Some(signature) = &input.tap_key_sig {
        witness.push(signature.to_vec());
        return Ok(witness);
    }

    for (control_block, (script, _)) in &input.tap_scripts {
        if script != quorum.script() || control_block != quorum.control_block() {
            return Err(Error::ScriptMismatch(
                "PSBT leaf script differs from the quorum script".into(),
            ));
        }
    }

    let leaf_hash = quorum.leaf_hash();
    let signed: BTreeMap<usize, Vec<u8>> = quorum
        .signers()
        .iter()
        .enumerate()
        .filter_map(|(i, key)| {
            input
                .tap_script_sigs
                .get(&(*key, leaf_hash))
                .map(|signature| (i, signature.to_vec()))
        })
        .take(quorum.threshold())
        .collect();

    if signed.len() < quorum.threshold() {
        return Err(Error::IncompleteSignatureSet {
            required: quorum.threshold(),
            actual: signed.len(),
        });
    }

    for i in (0..quorum.signers().len()).rev() {
        match signed.get(&i) {
            Some(signature) => witness.push(signature),
            None => witness.push([0u8; 0]),
        }
    }
    witness.push(quorum.script().as_bytes());
    witness.push(quorum.control_block().serialize());
    Ok(witness)
}

/// Validate a finalized witness against the quorum's leaf
fn check_witness(witness: &Witness, quorum: &Quorum) -> Result<()> {
    if witness.len() == 1 {
        return match witness.nth(0) {
            Some(signature) if is_signature_length(signature) => Ok(()),
            _ => Err(Error::ScriptMismatch(
                "key-path witness is not a schnorr signature".into(),
            )),
        };
    }

    let n = quorum.signers().len();
    if witness.len() != n + 2 {
        return Err(Error::ScriptMismatch(format!(
            "witness has {} items, expected {}",
            witness.len(),
            n + 2
        )));
    }
    if witness.nth(n) != Some(quorum.script().as_bytes()) {
        return Err(Error::ScriptMismatch(
            "witness script differs from the quorum script".into(),
        ));
    }
    if witness.nth(n + 1) != Some(&quorum.control_block().serialize()[..]) {
        return Err(Error::ScriptMismatch(
            "witness control block differs from the quorum control block".into(),
        ));
    }

    let mut signatures = 0;
    for item in witness.iter().take(n).filter(|item| !item.is_empty()) {
        if !is_signature_length(item) {
            return Err(Error::ScriptMismatch(format!(
                "witness signature has {} bytes",
                item.len()
            )));
        }
        signatures += 1;
    }
    // OP_NUMEQUAL fails on any count other than the threshold
    if signatures > quorum.threshold() {
        return Err(Error::ScriptMismatch(format!(
            "witness has {} signatures, the leaf requires exactly {}",
            signatures,
            quorum.threshold()
        )));
    }
    if signatures < quorum.threshold() {
        return Err(Error::IncompleteSignatureSet {
            required: quorum.threshold(),
            actual: signatures,
        });
    }
    Ok(())
}

/// 64 bytes with the default sighash, 65 with an explicit one
fn is_signature_length(item: &[u8]) -> bool {
    item.len() == 64 || item.len() == 65
}

/// Move the partial signatures of input 0 into its final witness
/// (PSBT finalizer role)
pub fn finalize_psbt(psbt: &mut Psbt, quorum: &Quorum) -> Result<()> {
    let solution = SignetSolution::from_psbt(psbt, quorum)?;
    let input = &mut psbt.inputs[0];
    input.final_script_sig = Some(solution.script_sig);
    input.final_script_witness = Some(solution.witness);

    input.tap_key_sig = None;
    input.tap_script_sigs.clear();
    input.tap_scripts.clear();
    input.tap_key_origins.clear();
    input.tap_internal_key = None;
    input.tap_merkle_root = None;
    input.sighash_type = None;
    Ok(())
}

/// Header-prefixed signet solution of a signed PSBT
#[instrument(skip_all)]
pub fn extract_solution(psbt: &Psbt, quorum: &Quorum) -> Result<Vec<u8>> {
    let section = SignetSolution::from_psbt(psbt, quorum)?.commitment_section();
    debug!(bytes = section.len(), "Signet solution extracted");
    Ok(section)
}
