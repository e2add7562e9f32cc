//! Wire-format impls for outpoints, inputs, and outputs.

use std::io;

use crate::{
    amount::Amount,
    serialization::{BitcoinDeserialize, BitcoinSerialize, SerializationError},
    transaction,
};

use super::{Input, OutPoint, Output, Script};

impl BitcoinSerialize for OutPoint {
    fn bitcoin_serialize<W: io::Write>(&self, mut writer: W) -> Result<(), io::Error> {
        self.hash.0.bitcoin_serialize(&mut writer)?;
        self.index.bitcoin_serialize(&mut writer)
    }
}

impl BitcoinDeserialize for OutPoint {
    fn bitcoin_deserialize<R: io::Read>(mut reader: R) -> Result<Self, SerializationError> {
        Ok(OutPoint {
            hash: transaction::Hash(<[u8; 32]>::bitcoin_deserialize(&mut reader)?),
            index: u32::bitcoin_deserialize(&mut reader)?,
        })
    }
}

impl BitcoinSerialize for Input {
    fn bitcoin_serialize<W: io::Write>(&self, mut writer: W) -> Result<(), io::Error> {
        self.outpoint.bitcoin_serialize(&mut writer)?;
        self.unlock_script.bitcoin_serialize(&mut writer)?;
        self.sequence.bitcoin_serialize(&mut writer)
    }
}

impl BitcoinDeserialize for Input {
    fn bitcoin_deserialize<R: io::Read>(mut reader: R) -> Result<Self, SerializationError> {
        Ok(Input {
            outpoint: OutPoint::bitcoin_deserialize(&mut reader)?,
            unlock_script: Script::bitcoin_deserialize(&mut reader)?,
            sequence: u32::bitcoin_deserialize(&mut reader)?,
        })
    }
}

impl BitcoinSerialize for Output {
    fn bitcoin_serialize<W: io::Write>(&self, mut writer: W) -> Result<(), io::Error> {
        self.value.bitcoin_serialize(&mut writer)?;
        self.lock_script.bitcoin_serialize(&mut writer)
    }
}

impl BitcoinDeserialize for Output {
    fn bitcoin_deserialize<R: io::Read>(mut reader: R) -> Result<Self, SerializationError> {
        Ok(Output {
            value: Amount::bitcoin_deserialize(&mut reader)?,
            lock_script: Script::bitcoin_deserialize(&mut reader)?,
        })
    }
}
