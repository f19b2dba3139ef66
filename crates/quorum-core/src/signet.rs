//! BIP325 signet helpers
//!
//! A signet block is authorized by spending a virtual `to_spend` output locked
//! to the challenge script. The spending `to_sign` transaction commits to the
//! block through the signet merkle root, which is the block merkle root with
//! the solution stripped from the witness commitment.

use crate::solution::SignetSolution;
use crate::{Error, Result};
use bitcoin::absolute::LockTime;
use bitcoin::consensus::encode::serialize;
use bitcoin::hashes::{sha256d, Hash};
use bitcoin::opcodes::all::{OP_PUSHBYTES_0, OP_RETURN};
use bitcoin::p2p::Magic;
use bitcoin::psbt::Psbt;
use bitcoin::script::{Builder, Instruction, PushBytes, PushBytesBuf};
use bitcoin::transaction::Version;
use bitcoin::{
    merkle_tree, Amount, Block, OutPoint, Script, ScriptBuf, Sequence, Transaction, TxIn,
    TxMerkleNode, TxOut, Witness,
};
use tracing::debug;

/// Marker prefixing the solution push inside the witness commitment
pub const SIGNET_HEADER: [u8; 4] = [0xec, 0xc7, 0xda, 0xa2];

/// `OP_RETURN OP_PUSHBYTES_36 aa21a9ed`
const WITNESS_COMMITMENT_PREFIX: [u8; 6] = [0x6a, 0x24, 0xaa, 0x21, 0xa9, 0xed];

/// Index of the coinbase witness commitment output (the last one wins)
pub fn witness_commitment_index(block: &Block) -> Option<usize> {
    block.txdata.first()?.output.iter().rposition(|out| {
        let bytes = out.script_pubkey.as_bytes();
        bytes.len() >= 38 && bytes.starts_with(&WITNESS_COMMITMENT_PREFIX)
    })
}

/// Rebuild a commitment script with its solution push replaced by
/// `replacement`, appending it when the script carries no solution.
/// Returns the new script and the solution bytes that followed the header.
fn replace_section(script: &Script, replacement: &PushBytes) -> Result<(ScriptBuf, Option<Vec<u8>>)> {
    let mut builder = Builder::new();
    let mut section = None;
    for instruction in script.instructions() {
        match instruction.map_err(|e| Error::Block(e.to_string()))? {
            Instruction::PushBytes(push)
                if section.is_none()
                    && push.len() > SIGNET_HEADER.len()
                    && push.as_bytes().starts_with(&SIGNET_HEADER) =>
            {
                section = Some(push.as_bytes()[SIGNET_HEADER.len()..].to_vec());
                builder = builder.push_slice(replacement);
            }
            Instruction::PushBytes(push) => builder = builder.push_slice(push),
            Instruction::Op(op) => builder = builder.push_opcode(op),
        }
    }
    if section.is_none() {
        builder = builder.push_slice(replacement);
    }
    Ok((builder.into_script(), section))
}

fn header_push() -> &'static PushBytes {
    <&PushBytes>::from(&SIGNET_HEADER)
}

/// Solution bytes committed in the block, if any
pub fn commitment_solution(block: &Block) -> Result<Option<Vec<u8>>> {
    let index = witness_commitment_index(block).ok_or(Error::MissingWitnessCommitment)?;
    let (_, section) = replace_section(&block.txdata[0].output[index].script_pubkey, header_push())?;
    Ok(section)
}

/// Merkle root the signet solution commits to: the solution push is cut
/// down to the bare header (or a bare header push is appended).
pub fn signet_merkle_root(block: &Block) -> Result<TxMerkleNode> {
    let index = witness_commitment_index(block).ok_or(Error::MissingWitnessCommitment)?;
    let mut coinbase = block.txdata[0].clone();
    let (stripped, _) = replace_section(&coinbase.output[index].script_pubkey, header_push())?;
    coinbase.output[index].script_pubkey = stripped;

    let txids = std::iter::once(coinbase.compute_txid())
        .chain(block.txdata[1..].iter().map(Transaction::compute_txid))
        .map(|txid| txid.to_raw_hash());
    merkle_tree::calculate_root(txids)
        .map(TxMerkleNode::from_raw_hash)
        .ok_or_else(|| Error::Block("block has no transactions".into()))
}

/// Build the virtual `to_spend` and `to_sign` transactions for a block
pub fn signet_txs(block: &Block, challenge: &Script) -> Result<(Transaction, Transaction)> {
    let header = &block.header;
    let mut data = Vec::with_capacity(72);
    data.extend_from_slice(&header.version.to_consensus().to_le_bytes());
    data.extend_from_slice(header.prev_blockhash.as_byte_array());
    data.extend_from_slice(signet_merkle_root(block)?.as_byte_array());
    data.extend_from_slice(&header.time.to_le_bytes());
    let data = PushBytesBuf::try_from(data).map_err(|e| Error::Block(e.to_string()))?;

    let to_spend = Transaction {
        version: Version(0),
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::null(),
            script_sig: Builder::new()
                .push_opcode(OP_PUSHBYTES_0)
                .push_slice(&data)
                .into_script(),
            sequence: Sequence::ZERO,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::ZERO,
            script_pubkey: challenge.to_owned(),
        }],
    };

    let to_sign = Transaction {
        version: Version(0),
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::new(to_spend.compute_txid(), 0),
            script_sig: ScriptBuf::new(),
            sequence: Sequence::ZERO,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::ZERO,
            script_pubkey: Builder::new().push_opcode(OP_RETURN).into_script(),
        }],
    };

    Ok((to_spend, to_sign))
}

/// PSBT the quorum signs to authorize `block`
pub fn signet_psbt(block: &Block, challenge: &Script) -> Result<Psbt> {
    let (to_spend, to_sign) = signet_txs(block, challenge)?;
    let mut psbt = Psbt::from_unsigned_tx(to_sign)?;
    psbt.inputs[0].witness_utxo = Some(to_spend.output[0].clone());
    psbt.inputs[0].non_witness_utxo = Some(to_spend);
    Ok(psbt)
}

/// Push `section` (header included) into the witness commitment and
/// recompute the block merkle root. Any previous solution is replaced.
pub fn embed_commitment_section(block: &mut Block, section: &[u8]) -> Result<()> {
    if section.len() <= SIGNET_HEADER.len() || !section.starts_with(&SIGNET_HEADER) {
        return Err(Error::Block("commitment section lacks the signet header".into()));
    }
    let index = witness_commitment_index(block).ok_or(Error::MissingWitnessCommitment)?;

    let push = PushBytesBuf::try_from(section.to_vec()).map_err(|e| Error::Block(e.to_string()))?;
    let output = &mut block.txdata[0].output[index];
    let (script, _) = replace_section(&output.script_pubkey, &push)?;
    output.script_pubkey = script;

    block.header.merkle_root = block
        .compute_merkle_root()
        .ok_or_else(|| Error::Block("block has no transactions".into()))?;
    debug!(bytes = section.len(), merkle_root = %block.header.merkle_root, "Signet solution embedded");
    Ok(())
}

/// Embed a solution into `block`
pub fn embed_solution(block: &mut Block, solution: &SignetSolution) -> Result<()> {
    embed_commitment_section(block, &solution.commitment_section())
}

/// Network magic of a signet with this challenge
pub fn signet_magic(challenge: &Script) -> Magic {
    let hash = sha256d::Hash::hash(&serialize(&challenge.to_owned()));
    let bytes = hash.as_byte_array();
    Magic::from_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}
