//! SIGHASH_ALL digests for signing inputs.

use crate::serialization::{sha256d, BitcoinSerialize, SerializationError};
use crate::transparent::Script;

use super::Transaction;

/// The sighash type the wallet signs with: commit to all inputs and outputs.
pub const SIGHASH_ALL: u32 = 1;

impl Transaction {
    /// The digest that input `input_index` signs under `SIGHASH_ALL`.
    ///
    /// The transaction is reserialized with every input script empty except
    /// input `input_index`, which instead carries the lock script of the
    /// output it spends; the 4-byte sighash type is appended before hashing.
    pub fn sighash_all(
        &self,
        input_index: usize,
        prev_lock_script: &Script,
    ) -> Result<[u8; 32], SerializationError> {
        if input_index >= self.inputs.len() {
            return Err(SerializationError::Parse("sighash input index out of range"));
        }

        let mut copy = self.clone();
        for (i, input) in copy.inputs.iter_mut().enumerate() {
            input.unlock_script = if i == input_index {
                prev_lock_script.clone()
            } else {
                Script(Vec::new())
            };
        }

        let mut hash_writer = sha256d::Writer::default();
        copy.bitcoin_serialize(&mut hash_writer)
            .expect("sha256d::Writer is infallible");
        SIGHASH_ALL
            .bitcoin_serialize(&mut hash_writer)
            .expect("sha256d::Writer is infallible");
        Ok(hash_writer.finish())
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        amount::Amount,
        transaction::Hash,
        transparent::{Input, OutPoint, Output},
    };

    use super::*;

    fn two_input_transaction() -> Transaction {
        let input = |n: u8| Input {
            outpoint: OutPoint {
                hash: Hash([n; 32]),
                index: n as u32,
            },
            unlock_script: Script(vec![n; 3]),
            sequence: crate::transparent::SEQUENCE_FINAL,
        };
        Transaction::new(
            1,
            vec![input(1), input(2)],
            vec![Output {
                value: Amount::from_sat(5000),
                lock_script: Script::pay_to_pubkey_hash(&[9; 20]),
            }],
            0,
        )
    }

    #[test]
    fn digest_matches_manual_construction() {
        let tx = two_input_transaction();
        let prev_script = Script::pay_to_pubkey_hash(&[7; 20]);

        let mut expected = tx.clone();
        expected.inputs[0].unlock_script = prev_script.clone();
        expected.inputs[1].unlock_script = Script(Vec::new());
        let mut preimage = expected.bitcoin_serialize_to_vec().unwrap();
        preimage.extend_from_slice(&[1, 0, 0, 0]);

        assert_eq!(
            tx.sighash_all(0, &prev_script).unwrap(),
            sha256d::hash(&preimage)
        );
    }

    #[test]
    fn digest_depends_on_input_index() {
        let tx = two_input_transaction();
        let prev_script = Script::pay_to_pubkey_hash(&[7; 20]);
        assert_ne!(
            tx.sighash_all(0, &prev_script).unwrap(),
            tx.sighash_all(1, &prev_script).unwrap()
        );
    }

    #[test]
    fn out_of_range_index_rejected() {
        let tx = two_input_transaction();
        assert!(tx.sighash_all(2, &Script(Vec::new())).is_err());
    }
}
