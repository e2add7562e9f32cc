//! The Bitcoin transaction Merkle tree, as seen by a light client: roots
//! stored in headers, and branches linking a transaction to a root.

use std::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::serialization::{sha256d, BitcoinDeserialize, BitcoinSerialize, SerializationError};
use crate::transaction;

/// The root of a transaction Merkle tree, as committed to in a block header.
///
/// Displayed in big-endian byte order like transaction and block hashes.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct Root(pub [u8; 32]);

impl fmt::Display for Root {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut reversed_bytes = self.0;
        reversed_bytes.reverse();
        f.write_str(&hex::encode(&reversed_bytes))
    }
}

impl fmt::Debug for Root {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut reversed_bytes = self.0;
        reversed_bytes.reverse();
        f.debug_tuple("merkle::Root")
            .field(&hex::encode(&reversed_bytes))
            .finish()
    }
}

impl std::str::FromStr for Root {
    type Err = SerializationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0; 32];
        if hex::decode_to_slice(s, &mut bytes[..]).is_err() {
            Err(SerializationError::Parse("hex decoding error"))
        } else {
            bytes.reverse();
            Ok(Root(bytes))
        }
    }
}

impl Serialize for Root {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Root {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(D::Error::custom)
    }
}

impl BitcoinSerialize for Root {
    fn bitcoin_serialize<W: std::io::Write>(&self, writer: W) -> Result<(), std::io::Error> {
        self.0.bitcoin_serialize(writer)
    }
}

impl BitcoinDeserialize for Root {
    fn bitcoin_deserialize<R: std::io::Read>(mut reader: R) -> Result<Self, SerializationError> {
        Ok(Root(<[u8; 32]>::bitcoin_deserialize(&mut reader)?))
    }
}

/// Fold a Merkle branch up from a leaf transaction hash.
///
/// `position` is the index of the transaction within its block; its bits
/// select whether each sibling hash is concatenated on the left or on the
/// right, from the leaf level upward.
pub fn branch_root(
    leaf: &transaction::Hash,
    branch: &[transaction::Hash],
    position: u32,
) -> Root {
    let mut accumulator = leaf.0;
    for (level, sibling) in branch.iter().enumerate() {
        let mut concat = [0u8; 64];
        if (position >> level) & 1 == 1 {
            concat[..32].copy_from_slice(&sibling.0);
            concat[32..].copy_from_slice(&accumulator);
        } else {
            concat[..32].copy_from_slice(&accumulator);
            concat[32..].copy_from_slice(&sibling.0);
        }
        accumulator = sha256d::hash(&concat);
    }
    Root(accumulator)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_transaction_block() {
        // A block with one transaction has that txid as its Merkle root.
        let txid = transaction::Hash([5; 32]);
        assert_eq!(branch_root(&txid, &[], 0).0, txid.0);
    }

    #[test]
    fn two_level_branch() {
        // Transaction at position 2 of a four-leaf tree: the first sibling
        // joins on the right, the second on the left.
        let leaf = transaction::Hash([0xaa; 32]);
        let sibling0 = transaction::Hash([0xbb; 32]);
        let sibling1 = transaction::Hash([0xcc; 32]);

        let mut level0 = [0u8; 64];
        level0[..32].copy_from_slice(&leaf.0);
        level0[32..].copy_from_slice(&sibling0.0);
        let mut level1 = [0u8; 64];
        level1[..32].copy_from_slice(&sibling1.0);
        level1[32..].copy_from_slice(&sha256d::hash(&level0));
        let expected = Root(sha256d::hash(&level1));

        assert_eq!(branch_root(&leaf, &[sibling0, sibling1], 2), expected);
    }

    #[test]
    fn corrupted_sibling_changes_root() {
        let leaf = transaction::Hash([0xaa; 32]);
        let sibling0 = transaction::Hash([0xbb; 32]);
        let mut sibling1 = transaction::Hash([0xcc; 32]);

        let good = branch_root(&leaf, &[sibling0, sibling1], 2);
        sibling1.0[7] ^= 0x01;
        let bad = branch_root(&leaf, &[sibling0, sibling1], 2);

        assert_ne!(good, bad);
    }
}
