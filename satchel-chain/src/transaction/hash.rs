use std::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::serialization::{sha256d, BitcoinDeserialize, BitcoinSerialize, SerializationError};

use super::Transaction;

/// A transaction hash (txid): the SHA-256d digest of the serialized
/// transaction.
///
/// Note: transaction hashes are displayed in big-endian byte order,
/// following the u256 convention set by Bitcoin, while the wire and the
/// digest itself use the reverse order.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Hash(pub [u8; 32]);

impl<'a> From<&'a Transaction> for Hash {
    fn from(transaction: &'a Transaction) -> Self {
        let mut hash_writer = sha256d::Writer::default();
        transaction
            .bitcoin_serialize(&mut hash_writer)
            .expect("sha256d::Writer is infallible");
        Self(hash_writer.finish())
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut reversed_bytes = self.0;
        reversed_bytes.reverse();
        f.write_str(&hex::encode(&reversed_bytes))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut reversed_bytes = self.0;
        reversed_bytes.reverse();
        f.debug_tuple("transaction::Hash")
            .field(&hex::encode(&reversed_bytes))
            .finish()
    }
}

impl std::str::FromStr for Hash {
    type Err = SerializationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0; 32];
        if hex::decode_to_slice(s, &mut bytes[..]).is_err() {
            Err(SerializationError::Parse("hex decoding error"))
        } else {
            bytes.reverse();
            Ok(Hash(bytes))
        }
    }
}

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(D::Error::custom)
    }
}

impl BitcoinSerialize for Hash {
    fn bitcoin_serialize<W: std::io::Write>(&self, writer: W) -> Result<(), std::io::Error> {
        self.0.bitcoin_serialize(writer)
    }
}

impl BitcoinDeserialize for Hash {
    fn bitcoin_deserialize<R: std::io::Read>(mut reader: R) -> Result<Self, SerializationError> {
        Ok(Hash(<[u8; 32]>::bitcoin_deserialize(&mut reader)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_reverses_bytes() {
        let mut bytes = [0u8; 32];
        bytes[0] = 0xab;
        let hash = Hash(bytes);
        let text = hash.to_string();
        assert!(text.ends_with("ab"));
        assert_eq!(text.parse::<Hash>().unwrap(), hash);
    }

    #[test]
    fn from_str_rejects_bad_input() {
        assert!("zz".repeat(32).parse::<Hash>().is_err());
        assert!("abcd".parse::<Hash>().is_err());
    }
}
