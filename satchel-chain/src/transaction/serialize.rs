//! Wire-format impls for transactions, so that all of the transaction
//! serialization logic is in one place.

use std::io;

use crate::serialization::{BitcoinDeserialize, BitcoinSerialize, SerializationError};
use crate::transparent;

use super::Transaction;

/// The maximum size of a transaction in bytes.
pub const MAX_TX_SIZE: u64 = 1_000_000;

impl BitcoinSerialize for Transaction {
    fn bitcoin_serialize<W: io::Write>(&self, mut writer: W) -> Result<(), io::Error> {
        self.version.bitcoin_serialize(&mut writer)?;
        self.inputs.bitcoin_serialize(&mut writer)?;
        self.outputs.bitcoin_serialize(&mut writer)?;
        self.lock_time.bitcoin_serialize(&mut writer)
    }
}

impl BitcoinDeserialize for Transaction {
    fn bitcoin_deserialize<R: io::Read>(src: R) -> Result<Self, SerializationError> {
        // Cap reads at one whole block to protect against DOS attacks.
        let mut src = src.take(MAX_TX_SIZE);
        Ok(Transaction {
            version: i32::bitcoin_deserialize(&mut src)?,
            inputs: <Vec<transparent::Input>>::bitcoin_deserialize(&mut src)?,
            outputs: <Vec<transparent::Output>>::bitcoin_deserialize(&mut src)?,
            lock_time: u32::bitcoin_deserialize(&mut src)?,
        })
    }
}

#[cfg(test)]
mod proptests {
    use proptest::prelude::*;

    use crate::{amount::Amount, transaction::Hash, transparent};

    use super::*;

    fn arbitrary_transaction() -> impl Strategy<Value = Transaction> {
        let input = (
            any::<[u8; 32]>(),
            any::<u32>(),
            proptest::collection::vec(any::<u8>(), 0..128),
            any::<u32>(),
        )
            .prop_map(|(hash, index, script, sequence)| transparent::Input {
                outpoint: transparent::OutPoint {
                    hash: Hash(hash),
                    index,
                },
                unlock_script: transparent::Script(script),
                sequence,
            });
        let output = (0_i64..1000 * crate::amount::COIN, proptest::collection::vec(any::<u8>(), 0..128))
            .prop_map(|(value, script)| transparent::Output {
                value: Amount::from_sat(value),
                lock_script: transparent::Script(script),
            });
        (
            any::<i32>(),
            proptest::collection::vec(input, 0..8),
            proptest::collection::vec(output, 0..8),
            any::<u32>(),
        )
            .prop_map(|(version, inputs, outputs, lock_time)| {
                Transaction::new(version, inputs, outputs, lock_time)
            })
    }

    proptest! {
        #[test]
        fn transaction_wire_roundtrip(tx in arbitrary_transaction()) {
            let bytes = tx.bitcoin_serialize_to_vec().expect("serializing to a Vec never fails");
            prop_assert_eq!(bytes.len(), tx.len());

            let parsed = Transaction::bitcoin_deserialize(&bytes[..]).expect("roundtrip parses");
            prop_assert_eq!(parsed, tx);
        }
    }
}
