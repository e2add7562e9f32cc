use std::{
    fmt,
    io::{self, Read},
};

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{
    compactint::CompactInt,
    parameters::Network,
    serialization::{BitcoinDeserialize, BitcoinSerialize, SerializationError},
};

use super::Address;

/// Scripts longer than this are not relayed by the network.
const MAX_SCRIPT_LEN: u64 = 10_000;

mod op {
    pub const DUP: u8 = 0x76;
    pub const HASH160: u8 = 0xa9;
    pub const EQUAL: u8 = 0x87;
    pub const EQUALVERIFY: u8 = 0x88;
    pub const CHECKSIG: u8 = 0xac;
}

/// An encoding of a Bitcoin script.
#[derive(Clone, Eq, PartialEq, Hash)]
pub struct Script(pub Vec<u8>);

impl Script {
    /// The length-prefixed size of this script on the wire.
    pub fn serialized_size(&self) -> usize {
        CompactInt::size(self.0.len()) + self.0.len()
    }

    /// True for the zero-length script.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The standard pay-to-pubkey-hash lock script:
    /// `OP_DUP OP_HASH160 <hash> OP_EQUALVERIFY OP_CHECKSIG`.
    pub fn pay_to_pubkey_hash(pubkey_hash: &[u8; 20]) -> Script {
        let mut data = Vec::with_capacity(25);
        data.extend_from_slice(&[op::DUP, op::HASH160, 20]);
        data.extend_from_slice(pubkey_hash);
        data.extend_from_slice(&[op::EQUALVERIFY, op::CHECKSIG]);
        Script(data)
    }

    /// The standard pay-to-script-hash lock script:
    /// `OP_HASH160 <hash> OP_EQUAL`.
    pub fn pay_to_script_hash(script_hash: &[u8; 20]) -> Script {
        let mut data = Vec::with_capacity(23);
        data.extend_from_slice(&[op::HASH160, 20]);
        data.extend_from_slice(script_hash);
        data.push(op::EQUAL);
        Script(data)
    }

    /// The unlock script for a pay-to-pubkey-hash output:
    /// `<signature> <pubkey>` as two pushes.
    ///
    /// `signature` must already carry its trailing sighash-type byte, and
    /// `pubkey` its leading format byte.
    pub fn unlock_pay_to_pubkey_hash(signature: &[u8], pubkey: &[u8]) -> Script {
        let mut data = Vec::with_capacity(2 + signature.len() + pubkey.len());
        // Both pushes fit in a single-byte direct push (max 75 bytes).
        data.push(signature.len() as u8);
        data.extend_from_slice(signature);
        data.push(pubkey.len() as u8);
        data.extend_from_slice(pubkey);
        Script(data)
    }

    /// If this is one of the two standard lock-script templates, the
    /// address it pays.
    pub fn to_address(&self, network: Network) -> Option<Address> {
        let bytes = &self.0;
        match bytes.as_slice() {
            [op::DUP, op::HASH160, 20, hash @ .., op::EQUALVERIFY, op::CHECKSIG]
                if hash.len() == 20 =>
            {
                let mut pub_key_hash = [0u8; 20];
                pub_key_hash.copy_from_slice(hash);
                Some(Address::PayToPublicKeyHash {
                    network,
                    pub_key_hash,
                })
            }
            [op::HASH160, 20, hash @ .., op::EQUAL] if hash.len() == 20 => {
                let mut script_hash = [0u8; 20];
                script_hash.copy_from_slice(hash);
                Some(Address::PayToScriptHash {
                    network,
                    script_hash,
                })
            }
            _ => None,
        }
    }
}

impl fmt::Debug for Script {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("Script")
            .field(&hex::encode(&self.0))
            .finish()
    }
}

impl BitcoinSerialize for Script {
    fn bitcoin_serialize<W: io::Write>(&self, mut writer: W) -> Result<(), io::Error> {
        CompactInt::from(self.0.len()).bitcoin_serialize(&mut writer)?;
        writer.write_all(&self.0[..])?;
        Ok(())
    }
}

impl BitcoinDeserialize for Script {
    fn bitcoin_deserialize<R: io::Read>(mut reader: R) -> Result<Self, SerializationError> {
        let len = CompactInt::bitcoin_deserialize(&mut reader)?.value();
        if len > MAX_SCRIPT_LEN {
            return Err(SerializationError::Parse("script above consensus limit"));
        }
        let mut bytes = Vec::with_capacity(len as usize);
        reader.take(len).read_to_end(&mut bytes)?;
        if bytes.len() as u64 != len {
            return Err(SerializationError::Parse("truncated script"));
        }
        Ok(Script(bytes))
    }
}

impl Serialize for Script {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Script {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        let bytes = hex::decode(&text).map_err(D::Error::custom)?;
        Ok(Script(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn p2pkh_template_roundtrip() {
        let hash = [7u8; 20];
        let script = Script::pay_to_pubkey_hash(&hash);
        assert_eq!(script.0.len(), 25);
        match script.to_address(Network::Mainnet) {
            Some(Address::PayToPublicKeyHash { pub_key_hash, .. }) => {
                assert_eq!(pub_key_hash, hash)
            }
            other => panic!("wrong template match: {:?}", other),
        }
    }

    #[test]
    fn p2sh_template_roundtrip() {
        let hash = [9u8; 20];
        let script = Script::pay_to_script_hash(&hash);
        assert_eq!(script.0.len(), 23);
        match script.to_address(Network::Mainnet) {
            Some(Address::PayToScriptHash { script_hash, .. }) => {
                assert_eq!(script_hash, hash)
            }
            other => panic!("wrong template match: {:?}", other),
        }
    }

    #[test]
    fn nonstandard_scripts_have_no_address() {
        assert_eq!(Script(vec![]).to_address(Network::Mainnet), None);
        assert_eq!(Script(vec![op::CHECKSIG]).to_address(Network::Mainnet), None);
        // One byte short of a valid p2pkh template.
        let mut p2pkh = Script::pay_to_pubkey_hash(&[7u8; 20]).0;
        p2pkh.pop();
        assert_eq!(Script(p2pkh).to_address(Network::Mainnet), None);
    }

    #[test]
    fn oversized_script_rejected() {
        let mut encoded = Vec::new();
        CompactInt::from(20_000)
            .bitcoin_serialize(&mut encoded)
            .unwrap();
        encoded.extend_from_slice(&[0u8; 20_000]);
        assert!(Script::bitcoin_deserialize(&encoded[..]).is_err());
    }
}

#[cfg(test)]
mod proptests {
    use std::io::Cursor;

    use proptest::prelude::*;

    use super::*;

    proptest! {
        #[test]
        fn script_wire_roundtrip(data in proptest::collection::vec(any::<u8>(), 0..256)) {
            let script = Script(data);
            let mut bytes = Cursor::new(Vec::new());
            script.bitcoin_serialize(&mut bytes)?;

            bytes.set_position(0);
            let other_script = Script::bitcoin_deserialize(&mut bytes)?;

            prop_assert_eq![script, other_script];
        }
    }
}
