//! Transparent address types.

use std::{fmt, io, str::FromStr};

use ripemd160::{Digest, Ripemd160};
use secp256k1::PublicKey;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as Sha2Digest, Sha256};

#[cfg(test)]
use proptest::{arbitrary::Arbitrary, collection::vec, prelude::*};

use crate::{
    parameters::Network,
    serialization::{BitcoinDeserialize, BitcoinSerialize, SerializationError},
};

use super::Script;

/// Magic numbers used to identify what network an address is
/// associated with.
mod magics {
    pub mod p2sh {
        pub const MAINNET: [u8; 1] = [0x05];
        pub const TESTNET: [u8; 1] = [0xc4];
    }

    pub mod p2pkh {
        pub const MAINNET: [u8; 1] = [0x00];
        pub const TESTNET: [u8; 1] = [0x6f];
    }
}

/// Bitcoin addresses.
///
/// A single version byte is prepended to the 20-byte hash to mark the
/// address type, the result is hashed with sha256d, the first four bytes of
/// the digest are appended as a checksum, and the whole is Base58 encoded.
///
/// <https://en.bitcoin.it/wiki/Base58Check_encoding>
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub enum Address {
    /// P2SH (pay to script hash) addresses
    PayToScriptHash {
        /// Production, test, or regression network.
        network: Network,
        /// 20 bytes specifying a script hash.
        script_hash: [u8; 20],
    },
    /// P2PKH (pay to public key hash) addresses
    PayToPublicKeyHash {
        /// Production, test, or regression network.
        network: Network,
        /// 20 bytes specifying a public key hash, which is a RIPEMD-160
        /// hash of a SHA-256 hash of an ECDSA key encoding.
        pub_key_hash: [u8; 20],
    },
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut debug_struct = f.debug_struct("Address");

        match self {
            Address::PayToScriptHash {
                network,
                script_hash,
            } => debug_struct
                .field("network", network)
                .field("script_hash", &hex::encode(script_hash))
                .finish(),
            Address::PayToPublicKeyHash {
                network,
                pub_key_hash,
            } => debug_struct
                .field("network", network)
                .field("pub_key_hash", &hex::encode(pub_key_hash))
                .finish(),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut bytes = io::Cursor::new(Vec::new());
        let _ = self.bitcoin_serialize(&mut bytes);

        f.write_str(&bs58::encode(bytes.get_ref()).with_check().into_string())
    }
}

impl FromStr for Address {
    type Err = SerializationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let result = &bs58::decode(s).with_check(None).into_vec();

        match result {
            Ok(bytes) => Self::bitcoin_deserialize(&bytes[..]),
            Err(_) => Err(SerializationError::Parse("bad base58check address")),
        }
    }
}

impl BitcoinSerialize for Address {
    fn bitcoin_serialize<W: io::Write>(&self, mut writer: W) -> Result<(), io::Error> {
        match self {
            Address::PayToScriptHash {
                network,
                script_hash,
            } => {
                // Regtest has no version bytes of its own; it reuses the
                // testnet encoding, as bitcoind does.
                match *network {
                    Network::Mainnet => writer.write_all(&magics::p2sh::MAINNET[..])?,
                    _ => writer.write_all(&magics::p2sh::TESTNET[..])?,
                }
                writer.write_all(script_hash)?
            }
            Address::PayToPublicKeyHash {
                network,
                pub_key_hash,
            } => {
                match *network {
                    Network::Mainnet => writer.write_all(&magics::p2pkh::MAINNET[..])?,
                    _ => writer.write_all(&magics::p2pkh::TESTNET[..])?,
                }
                writer.write_all(pub_key_hash)?
            }
        }

        Ok(())
    }
}

impl BitcoinDeserialize for Address {
    fn bitcoin_deserialize<R: io::Read>(mut reader: R) -> Result<Self, SerializationError> {
        let mut version_bytes = [0; 1];
        reader.read_exact(&mut version_bytes)?;

        let mut hash_bytes = [0; 20];
        reader.read_exact(&mut hash_bytes)?;

        match version_bytes {
            magics::p2sh::MAINNET => Ok(Address::PayToScriptHash {
                network: Network::Mainnet,
                script_hash: hash_bytes,
            }),
            magics::p2sh::TESTNET => Ok(Address::PayToScriptHash {
                network: Network::Testnet,
                script_hash: hash_bytes,
            }),
            magics::p2pkh::MAINNET => Ok(Address::PayToPublicKeyHash {
                network: Network::Mainnet,
                pub_key_hash: hash_bytes,
            }),
            magics::p2pkh::TESTNET => Ok(Address::PayToPublicKeyHash {
                network: Network::Testnet,
                pub_key_hash: hash_bytes,
            }),
            _ => Err(SerializationError::Parse("bad addr version/type")),
        }
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(D::Error::custom)
    }
}

impl Address {
    /// A pay-to-pubkey-hash address for a known key hash.
    pub fn p2pkh(network: Network, pub_key_hash: [u8; 20]) -> Address {
        Address::PayToPublicKeyHash {
            network,
            pub_key_hash,
        }
    }

    /// The address of the uncompressed (`0x04 || x || y`) encoding of
    /// `pub_key`.
    ///
    /// Sequence-derived wallets always hash the uncompressed form.
    pub fn from_uncompressed_pubkey(network: Network, pub_key: &PublicKey) -> Address {
        Address::PayToPublicKeyHash {
            network,
            pub_key_hash: Address::hash_payload(&pub_key.serialize_uncompressed()[..]),
        }
    }

    /// The network this address encodes for.
    pub fn network(&self) -> Network {
        match self {
            Address::PayToScriptHash { network, .. } => *network,
            Address::PayToPublicKeyHash { network, .. } => *network,
        }
    }

    /// The raw 20-byte hash inside the address.
    pub fn hash_bytes(&self) -> &[u8; 20] {
        match self {
            Address::PayToScriptHash { script_hash, .. } => script_hash,
            Address::PayToPublicKeyHash { pub_key_hash, .. } => pub_key_hash,
        }
    }

    /// Whether this address can receive coins on `network`.
    ///
    /// Regtest reuses the testnet encoding, so the two are interchangeable.
    pub fn valid_for(&self, network: Network) -> bool {
        match (self.network(), network) {
            (Network::Mainnet, Network::Mainnet) => true,
            (Network::Testnet, Network::Testnet | Network::Regtest) => true,
            _ => false,
        }
    }

    /// The standard lock script paying this address.
    pub fn lock_script(&self) -> Script {
        match self {
            Address::PayToScriptHash { script_hash, .. } => {
                Script::pay_to_script_hash(script_hash)
            }
            Address::PayToPublicKeyHash { pub_key_hash, .. } => {
                Script::pay_to_pubkey_hash(pub_key_hash)
            }
        }
    }

    /// A hash of a transparent address payload: RIPEMD-160 of SHA-256.
    ///
    /// The resulting hash is always exactly 20 bytes.
    pub fn hash_payload(bytes: &[u8]) -> [u8; 20] {
        let sha_hash = Sha256::digest(bytes);
        let ripe_hash = Ripemd160::digest(&sha_hash);
        let mut payload = [0u8; 20];
        payload[..].copy_from_slice(&ripe_hash[..]);
        payload
    }
}

#[cfg(test)]
impl Address {
    fn p2pkh_strategy() -> impl Strategy<Value = Self> {
        (any::<Network>(), vec(any::<u8>(), 20))
            .prop_map(|(network, payload_bytes)| {
                let mut bytes = [0; 20];
                bytes.copy_from_slice(payload_bytes.as_slice());
                Self::PayToPublicKeyHash {
                    network,
                    pub_key_hash: bytes,
                }
            })
            .boxed()
    }

    fn p2sh_strategy() -> impl Strategy<Value = Self> {
        (any::<Network>(), vec(any::<u8>(), 20))
            .prop_map(|(network, payload_bytes)| {
                let mut bytes = [0; 20];
                bytes.copy_from_slice(payload_bytes.as_slice());
                Self::PayToScriptHash {
                    network,
                    script_hash: bytes,
                }
            })
            .boxed()
    }
}

#[cfg(test)]
impl Arbitrary for Address {
    type Parameters = ();

    fn arbitrary_with(_args: Self::Parameters) -> Self::Strategy {
        prop_oneof![Self::p2pkh_strategy(), Self::p2sh_strategy()].boxed()
    }

    type Strategy = BoxedStrategy<Self>;
}

#[cfg(test)]
mod tests {
    use secp256k1::PublicKey;

    use super::*;

    #[test]
    fn pubkey_mainnet_uncompressed() {
        let pub_key = PublicKey::from_slice(&[
            4, 80, 134, 58, 214, 74, 135, 174, 138, 47, 232, 60, 26, 241, 168, 64, 60, 181, 63, 83,
            228, 134, 216, 81, 29, 173, 138, 4, 136, 126, 91, 35, 82, 44, 212, 112, 36, 52, 83,
            162, 153, 250, 158, 119, 35, 119, 22, 16, 58, 188, 17, 161, 223, 56, 133, 94, 214, 242,
            238, 24, 126, 156, 88, 43, 166,
        ])
        .expect("A PublicKey from slice");

        let addr = Address::from_uncompressed_pubkey(Network::Mainnet, &pub_key);

        assert_eq!(format!("{}", addr), "16UwLL9Risc3QfPqBUvKofHmBQ7wMtjvM");
    }

    #[test]
    fn burn_address_decodes() {
        let addr: Address = "1BitcoinEaterAddressDontSendf59kuE"
            .parse()
            .expect("famous burn address decodes");

        assert_eq!(addr.network(), Network::Mainnet);
        assert!(matches!(addr, Address::PayToPublicKeyHash { .. }));
        assert_eq!(
            format!("{}", addr),
            "1BitcoinEaterAddressDontSendf59kuE"
        );
    }

    #[test]
    fn checksum_mismatch_rejected() {
        // Last character altered: the Base58Check checksum no longer matches.
        assert!("1BitcoinEaterAddressDontSendf59kuF"
            .parse::<Address>()
            .is_err());
    }

    #[test]
    fn lock_script_pays_same_hash() {
        let addr = Address::p2pkh(Network::Mainnet, [3u8; 20]);
        let script = addr.lock_script();
        assert_eq!(script.to_address(Network::Mainnet), Some(addr));
    }
}

#[cfg(test)]
proptest! {

    #[test]
    fn address_text_roundtrip(addr in any::<Address>()) {
        let encoded = addr.to_string();
        let decoded: Address = encoded.parse().expect("generated address reparses");

        // Regtest addresses decode as testnet, which shares their encoding.
        let expected_network = match addr.network() {
            Network::Mainnet => Network::Mainnet,
            _ => Network::Testnet,
        };
        prop_assert_eq![decoded.network(), expected_network];
        prop_assert_eq![decoded.hash_bytes(), addr.hash_bytes()];
    }
}
