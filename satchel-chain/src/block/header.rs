use std::io;

use chrono::{DateTime, Utc};

use crate::work::difficulty::CompactDifficulty;
use crate::{BitcoinDeserialize, BitcoinSerialize, SerializationError};

use super::{merkle, Hash};

/// A block header, containing metadata about a block.
///
/// Blocks are chained together via the backwards reference (previous header
/// hash) present in the block header. Each block points backwards to its
/// parent, all the way back to the genesis block.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Header {
    /// The block's version field.
    pub version: u32,

    /// The hash of the previous block, used to create a chain of blocks back
    /// to the genesis block.
    pub previous_block_hash: Hash,

    /// The root of the transaction Merkle tree, binding the block header to
    /// the transactions in the block.
    pub merkle_root: merkle::Root,

    /// The block timestamp is a Unix epoch time (UTC) when the miner started
    /// hashing the header (according to the miner).
    pub time: DateTime<Utc>,

    /// An encoded version of the target threshold this block's header hash
    /// must be less than or equal to, in the nBits format used by Bitcoin.
    pub difficulty_threshold: CompactDifficulty,

    /// An arbitrary field that miners change to produce a header hash below
    /// the target threshold.
    pub nonce: u32,
}

impl Header {
    /// Returns length of a serialized header in bytes
    pub const fn len() -> usize {
        80
    }

    /// Compute the hash of this header.
    pub fn hash(&self) -> Hash {
        Hash::from(self)
    }
}

impl BitcoinSerialize for Header {
    fn bitcoin_serialize<W: io::Write>(&self, mut writer: W) -> Result<(), io::Error> {
        self.version.bitcoin_serialize(&mut writer)?;
        self.previous_block_hash.bitcoin_serialize(&mut writer)?;
        self.merkle_root.bitcoin_serialize(&mut writer)?;
        self.time.bitcoin_serialize(&mut writer)?;
        self.difficulty_threshold.bitcoin_serialize(&mut writer)?;
        self.nonce.bitcoin_serialize(&mut writer)
    }
}

impl BitcoinDeserialize for Header {
    fn bitcoin_deserialize<R: io::Read>(mut reader: R) -> Result<Self, SerializationError> {
        Ok(Header {
            version: u32::bitcoin_deserialize(&mut reader)?,
            previous_block_hash: Hash::bitcoin_deserialize(&mut reader)?,
            merkle_root: merkle::Root::bitcoin_deserialize(&mut reader)?,
            time: <DateTime<Utc>>::bitcoin_deserialize(&mut reader)?,
            difficulty_threshold: CompactDifficulty::bitcoin_deserialize(&mut reader)?,
            nonce: u32::bitcoin_deserialize(&mut reader)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The Bitcoin mainnet genesis block header.
    const GENESIS_HEADER_HEX: &str = concat!(
        "01000000",
        "0000000000000000000000000000000000000000000000000000000000000000",
        "3ba3edfd7a7b12b27ac72c3e67768f617fc81bc3888a51323a9fb8aa4b1e5e4a",
        "29ab5f49",
        "ffff001d",
        "1dac2b7c",
    );

    #[test]
    fn genesis_header_parses() {
        let raw = hex::decode(GENESIS_HEADER_HEX).unwrap();
        assert_eq!(raw.len(), Header::len());

        let header = Header::bitcoin_deserialize(&raw[..]).expect("genesis header parses");
        assert_eq!(header.version, 1);
        assert_eq!(
            header.previous_block_hash,
            crate::parameters::GENESIS_PREVIOUS_BLOCK_HASH
        );
        assert_eq!(
            header.merkle_root.to_string(),
            "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b"
        );
        assert_eq!(header.time.timestamp(), 1231006505);
        assert_eq!(header.difficulty_threshold.0, 0x1d00ffff);
        assert_eq!(header.nonce, 0x7c2bac1d);

        assert_eq!(header.bitcoin_serialize_to_vec().unwrap(), raw);
    }

    #[test]
    fn genesis_header_hash() {
        let raw = hex::decode(GENESIS_HEADER_HEX).unwrap();
        let header = Header::bitcoin_deserialize(&raw[..]).unwrap();

        assert_eq!(
            Some(header.hash()),
            crate::parameters::genesis_hash(crate::parameters::Network::Mainnet)
        );
    }
}
