//! Transactions and transaction-related structures.

mod hash;
mod serialize;
mod sighash;

pub use hash::Hash;
pub use sighash::SIGHASH_ALL;

use crate::compactint::CompactInt;
use crate::transparent;

/// A Bitcoin transaction. SegWit is deliberately not supported: the wallet
/// only produces and spends pre-witness pay-to-pubkey-hash outputs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    /// The transaction version.
    pub version: i32,
    /// The transaction inputs.
    pub inputs: Vec<transparent::Input>,
    /// The transaction outputs.
    pub outputs: Vec<transparent::Output>,
    /// Earliest block or time this transaction may be mined; zero disables
    /// the lock.
    pub lock_time: u32,
}

impl Transaction {
    /// Assemble a transaction from parts.
    pub fn new(
        version: i32,
        inputs: Vec<transparent::Input>,
        outputs: Vec<transparent::Output>,
        lock_time: u32,
    ) -> Transaction {
        Transaction {
            version,
            inputs,
            outputs,
            lock_time,
        }
    }

    /// Get the hash (txid) of this transaction.
    pub fn hash(&self) -> Hash {
        Hash::from(self)
    }

    /// Returns `true` if this transaction creates new coins.
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].is_coinbase()
    }

    /// Returns the serialized length (in bytes) of this transaction.
    pub fn len(&self) -> usize {
        let mut size = 4 + CompactInt::size(self.inputs.len());
        for input in self.inputs.iter() {
            size += input.len();
        }
        size += CompactInt::size(self.outputs.len());
        for output in self.outputs.iter() {
            size += output.len();
        }
        size + 4
    }
}

#[cfg(test)]
mod tests {
    use crate::serialization::{BitcoinDeserialize, BitcoinSerialize};

    use super::*;

    /// The coinbase transaction of the Bitcoin genesis block.
    pub(super) const GENESIS_COINBASE_HEX: &str = concat!(
        "01000000",
        "01",
        "0000000000000000000000000000000000000000000000000000000000000000ffffffff",
        "4d",
        "04ffff001d0104455468652054696d65732030332f4a616e2f32303039204368616e63",
        "656c6c6f72206f6e206272696e6b206f66207365636f6e64206261696c6f757420666f",
        "722062616e6b73",
        "ffffffff",
        "01",
        "00f2052a01000000",
        "43",
        "4104678afdb0fe5548271967f1a67130b7105cd6a828e03909a67962e0ea1f61deb649",
        "f6bc3f4cef38c4f35504e51ec112de5c384df7ba0b8d578a4c702b6bf11d5fac",
        "00000000",
    );

    #[test]
    fn genesis_coinbase_parses() {
        let raw = hex::decode(GENESIS_COINBASE_HEX).unwrap();
        let tx = Transaction::bitcoin_deserialize(&raw[..]).expect("genesis coinbase parses");

        assert_eq!(tx.version, 1);
        assert_eq!(tx.lock_time, 0);
        assert_eq!(tx.inputs.len(), 1);
        assert_eq!(tx.outputs.len(), 1);
        assert!(tx.is_coinbase());
        assert_eq!(tx.outputs[0].value.as_sat(), 50 * crate::amount::COIN);
        assert_eq!(tx.len(), raw.len());

        // Reserialization is byte-identical.
        let reserialized = tx.bitcoin_serialize_to_vec().unwrap();
        assert_eq!(raw, reserialized);
    }

    #[test]
    fn genesis_coinbase_txid() {
        let raw = hex::decode(GENESIS_COINBASE_HEX).unwrap();
        let tx = Transaction::bitcoin_deserialize(&raw[..]).unwrap();

        assert_eq!(
            tx.hash().to_string(),
            "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b"
        );
    }
}
