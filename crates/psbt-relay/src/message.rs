//! `signetpsbt` wire message
//!
//! | field              | encoding                          |
//! |--------------------|-----------------------------------|
//! | nonce              | u64 little endian                 |
//! | psbt               | compact size + bytes              |
//! | block_template     | compact size + bytes              |
//! | signers_short_ids  | compact size count + N × u64 LE   |

use crate::error::{RelayError, Result};
use bitcoin::consensus::encode::{self, deserialize, serialize, Decodable, Encodable, VarInt};
use bitcoin::io::{self, Read, Write};
use bitcoin::p2p::message::{CommandString, NetworkMessage, RawNetworkMessage};
use bitcoin::p2p::Magic;
use bitcoin::psbt::Psbt;
use bitcoin::Block;
use quorum_core::ShortId;
use serde::{Deserialize, Serialize};

/// P2P command carrying partially signed block templates
pub const COMMAND: &str = "signetpsbt";

/// Largest accepted message body: a full block template plus its PSBT
pub const MAX_MESSAGE_SIZE: usize = 16_000_000;

/// A partially signed block template travelling between signers
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SignetPsbtMessage {
    /// Session nonce, used for deduplication only
    pub nonce: u64,
    /// Serialized PSBT
    pub psbt: Vec<u8>,
    /// Serialized block the PSBT authorizes
    pub block_template: Vec<u8>,
    /// Short ids of the signers whose signatures the PSBT carries
    pub signers_short_ids: Vec<ShortId>,
}

impl SignetPsbtMessage {
    /// Create a message from a PSBT and its block
    pub fn new(nonce: u64, psbt: &Psbt, block: &Block, signers_short_ids: Vec<ShortId>) -> Self {
        Self {
            nonce,
            psbt: psbt.serialize(),
            block_template: serialize(block),
            signers_short_ids,
        }
    }

    /// Start a new session with a random nonce and no signers
    pub fn initiate(psbt: &Psbt, block: &Block) -> Self {
        Self::new(rand::random(), psbt, block, Vec::new())
    }

    /// Same session and block, new PSBT and signer set
    pub fn resigned(&self, psbt: &Psbt, signers_short_ids: Vec<ShortId>) -> Self {
        Self {
            nonce: self.nonce,
            psbt: psbt.serialize(),
            block_template: self.block_template.clone(),
            signers_short_ids,
        }
    }

    /// Encode the message body
    pub fn encode(&self) -> Vec<u8> {
        serialize(self)
    }

    /// Decode a message body; the input must be consumed exactly
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(RelayError::MalformedMessage(format!(
                "message of {} bytes exceeds the {} byte limit",
                bytes.len(),
                MAX_MESSAGE_SIZE
            )));
        }
        let mut reader = bytes;
        let message = Self::consensus_decode_from_finite_reader(&mut reader)?;
        if !reader.is_empty() {
            return Err(RelayError::MalformedMessage(format!(
                "{} trailing bytes",
                reader.len()
            )));
        }
        Ok(message)
    }

    /// Parse the carried PSBT
    pub fn parse_psbt(&self) -> Result<Psbt> {
        Psbt::deserialize(&self.psbt).map_err(|e| RelayError::MalformedMessage(e.to_string()))
    }

    /// Parse the carried block
    pub fn parse_block(&self) -> Result<Block> {
        deserialize(&self.block_template).map_err(|e| RelayError::MalformedMessage(e.to_string()))
    }

    /// Wrap the message in a P2P frame for the network identified by `magic`
    pub fn to_frame(&self, magic: Magic) -> Result<Vec<u8>> {
        let command = CommandString::try_from_static(COMMAND)
            .map_err(|e| RelayError::MalformedMessage(e.to_string()))?;
        let raw = RawNetworkMessage::new(
            magic,
            NetworkMessage::Unknown {
                command,
                payload: self.encode(),
            },
        );
        Ok(serialize(&raw))
    }

    /// Unwrap a P2P frame, checking network magic and command
    pub fn from_frame(frame: &[u8], magic: Magic) -> Result<Self> {
        let raw: RawNetworkMessage = deserialize(frame)?;
        if *raw.magic() != magic {
            return Err(RelayError::WrongNetwork {
                expected: magic,
                actual: *raw.magic(),
            });
        }
        match raw.into_payload() {
            NetworkMessage::Unknown { command, payload } if command.as_ref() == COMMAND => {
                Self::decode(&payload)
            }
            other => Err(RelayError::UnexpectedCommand(other.cmd().to_string())),
        }
    }
}

impl Encodable for SignetPsbtMessage {
    fn consensus_encode<W: Write + ?Sized>(&self, w: &mut W) -> std::result::Result<usize, io::Error> {
        let mut len = self.nonce.consensus_encode(w)?;
        len += self.psbt.consensus_encode(w)?;
        len += self.block_template.consensus_encode(w)?;
        len += VarInt(self.signers_short_ids.len() as u64).consensus_encode(w)?;
        for id in &self.signers_short_ids {
            len += id.consensus_encode(w)?;
        }
        Ok(len)
    }
}

impl Decodable for SignetPsbtMessage {
    fn consensus_decode_from_finite_reader<R: Read + ?Sized>(
        r: &mut R,
    ) -> std::result::Result<Self, encode::Error> {
        let nonce = u64::consensus_decode_from_finite_reader(r)?;
        let psbt = Vec::<u8>::consensus_decode_from_finite_reader(r)?;
        let block_template = Vec::<u8>::consensus_decode_from_finite_reader(r)?;

        let count = VarInt::consensus_decode_from_finite_reader(r)?.0;
        if count > (MAX_MESSAGE_SIZE / 8) as u64 {
            return Err(encode::Error::OversizedVectorAllocation {
                requested: count as usize,
                max: MAX_MESSAGE_SIZE,
            });
        }
        let mut signers_short_ids = Vec::with_capacity(count.min(1024) as usize);
        for _ in 0..count {
            signers_short_ids.push(u64::consensus_decode_from_finite_reader(r)?);
        }

        Ok(Self {
            nonce,
            psbt,
            block_template,
            signers_short_ids,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> SignetPsbtMessage {
        SignetPsbtMessage {
            nonce: 0x0102_0304_0506_0708,
            psbt: vec![0xaa; 3],
            block_template: vec![0xbb; 2],
            signers_short_ids: vec![1, u64::MAX],
        }
    }

    #[test]
    fn test_wire_layout() {
        let bytes = message().encode();

        let mut expected = vec![0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01];
        expected.extend([0x03, 0xaa, 0xaa, 0xaa]);
        expected.extend([0x02, 0xbb, 0xbb]);
        expected.push(0x02);
        expected.extend(1u64.to_le_bytes());
        expected.extend(u64::MAX.to_le_bytes());
        assert_eq!(bytes, expected);

        assert_eq!(SignetPsbtMessage::decode(&bytes).unwrap(), message());
    }

    #[test]
    fn test_round_trip_large_fields() {
        let message = SignetPsbtMessage {
            nonce: 7,
            psbt: vec![0x11; 70_000],
            block_template: Vec::new(),
            signers_short_ids: (0..300).collect(),
        };
        let bytes = message.encode();

        // 0xfe-prefixed length for the psbt, 0xfd-prefixed count for the ids
        assert_eq!(bytes[8], 0xfe);
        assert_eq!(SignetPsbtMessage::decode(&bytes).unwrap(), message);
    }

    #[test]
    fn test_round_trip_above_consensus_vec_limit() {
        let message = SignetPsbtMessage {
            nonce: 8,
            psbt: vec![0x22; 2_500_000],
            block_template: vec![0x33; 2_000_000],
            signers_short_ids: vec![3],
        };
        let bytes = message.encode();

        assert!(bytes.len() > 4_000_000);
        assert_eq!(SignetPsbtMessage::decode(&bytes).unwrap(), message);
    }

    #[test]
    fn test_oversized_message_rejected() {
        let message = SignetPsbtMessage {
            nonce: 9,
            psbt: vec![0x44; MAX_MESSAGE_SIZE],
            block_template: Vec::new(),
            signers_short_ids: Vec::new(),
        };

        assert!(matches!(
            SignetPsbtMessage::decode(&message.encode()),
            Err(RelayError::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_truncated_input() {
        let bytes = message().encode();

        for len in [0, 5, 8, 10, bytes.len() - 1] {
            assert!(
                matches!(
                    SignetPsbtMessage::decode(&bytes[..len]),
                    Err(RelayError::TruncatedMessage(_))
                ),
                "length {}",
                len
            );
        }
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = message().encode();
        bytes.push(0);

        assert!(matches!(
            SignetPsbtMessage::decode(&bytes),
            Err(RelayError::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_frame_checks_magic_and_command() {
        let magic = Magic::from_bytes([1, 2, 3, 4]);
        let frame = message().to_frame(magic).unwrap();

        assert_eq!(&frame[..4], &[1, 2, 3, 4]);
        assert_eq!(&frame[4..14], COMMAND.as_bytes());
        assert_eq!(SignetPsbtMessage::from_frame(&frame, magic).unwrap(), message());

        assert!(matches!(
            SignetPsbtMessage::from_frame(&frame, Magic::from_bytes([4, 3, 2, 1])),
            Err(RelayError::WrongNetwork { .. })
        ));

        let ping = serialize(&RawNetworkMessage::new(magic, NetworkMessage::Ping(1)));
        assert!(matches!(
            SignetPsbtMessage::from_frame(&ping, magic),
            Err(RelayError::UnexpectedCommand(cmd)) if cmd == "ping"
        ));
    }
}
