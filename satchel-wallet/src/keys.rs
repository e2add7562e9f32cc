//! The deterministic key hierarchy.
//!
//! A wallet is born from a single 128-bit seed. Stretching the seed yields
//! the master secret exponent; its public point (the master public key) is
//! enough to derive every receiving and change address without the seed.
//! Child keys are indexed by `(sequence number, change flag)` — there are
//! no chain codes, and this scheme predates and differs from BIP-32.

use rand::RngCore;
use secp256k1::{PublicKey, Secp256k1, SecretKey};
use sha2::{Digest, Sha256};

use satchel_chain::{
    parameters::Network,
    serialization::sha256d,
    transparent::Address,
};

use crate::error::WalletError;

/// The seed format this wallet writes and accepts.
pub const SEED_VERSION: u32 = 4;

/// Iterations of the seed-stretching hash.
const STRETCH_ROUNDS: usize = 100_000;

/// A wallet seed: 128 random bits kept as 32 lowercase hex characters.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Seed(String);

impl Seed {
    /// A fresh random seed.
    pub fn generate() -> Seed {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        Seed(hex::encode(bytes))
    }

    /// Accept a user-supplied seed, normalizing case.
    pub fn from_hex(text: &str) -> Result<Seed, WalletError> {
        let text = text.trim().to_lowercase();
        if text.len() != 32 || !text.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(WalletError::InvalidSeed("expected 32 hex characters"));
        }
        Ok(Seed(text))
    }

    /// The canonical hex form, as persisted.
    pub fn as_hex(&self) -> &str {
        &self.0
    }

    /// Stretch the seed into the master secret exponent.
    ///
    /// `x_0` is the raw seed; each round hashes the accumulator with the
    /// raw seed appended. The final digest, read as a big-endian integer,
    /// must land in `[1, n)` to be a valid secp256k1 scalar.
    pub fn stretch(&self) -> Result<SecretKey, WalletError> {
        let raw = hex::decode(&self.0).expect("seed is validated hex");

        let mut acc: Vec<u8> = raw.clone();
        for _ in 0..STRETCH_ROUNDS {
            let mut hasher = Sha256::new();
            hasher.update(&acc);
            hasher.update(&raw);
            acc = hasher.finalize().to_vec();
        }

        SecretKey::from_slice(&acc)
            .map_err(|_| WalletError::InvalidSeed("stretched seed is not a valid scalar"))
    }
}

/// The master public key: the uncompressed point of the stretched seed,
/// without its `0x04` prefix.
pub fn master_public_key(master: &SecretKey) -> [u8; 64] {
    let secp = Secp256k1::new();
    let point = PublicKey::from_secret_key(&secp, master);
    let mut mpk = [0u8; 64];
    mpk.copy_from_slice(&point.serialize_uncompressed()[1..]);
    mpk
}

/// The derivation offset for child `(index, for_change)`.
///
/// `sha256d(ascii(index) ++ ":" ++ ascii(flag) ++ ":" ++ mpk)`, used both
/// as a scalar added to the master secret and (times the generator) as a
/// point added to the master public key.
fn sequence_offset(mpk: &[u8; 64], index: u32, for_change: bool) -> [u8; 32] {
    let mut preimage = format!("{}:{}:", index, for_change as u8).into_bytes();
    preimage.extend_from_slice(mpk);
    sha256d::hash(&preimage)
}

/// The public key of child `(index, for_change)`, derivable without the
/// seed.
pub fn derive_pubkey(
    mpk: &[u8; 64],
    index: u32,
    for_change: bool,
) -> Result<PublicKey, WalletError> {
    let mut encoded = [0u8; 65];
    encoded[0] = 0x04;
    encoded[1..].copy_from_slice(mpk);
    let mut point = PublicKey::from_slice(&encoded)
        .map_err(|_| WalletError::InvalidSeed("master public key is not on the curve"))?;

    let offset = sequence_offset(mpk, index, for_change);
    let secp = Secp256k1::new();
    point
        .add_exp_assign(&secp, &offset)
        .map_err(|_| WalletError::InvalidSeed("derivation offset is out of range"))?;
    Ok(point)
}

/// The private key of child `(index, for_change)`; requires the seed.
pub fn derive_secret(
    master: &SecretKey,
    mpk: &[u8; 64],
    index: u32,
    for_change: bool,
) -> Result<SecretKey, WalletError> {
    let offset = sequence_offset(mpk, index, for_change);
    let mut child = *master;
    child
        .add_assign(&offset)
        .map_err(|_| WalletError::InvalidSeed("derivation offset is out of range"))?;
    Ok(child)
}

/// The address of child `(index, for_change)`.
pub fn derive_address(
    network: Network,
    mpk: &[u8; 64],
    index: u32,
    for_change: bool,
) -> Result<Address, WalletError> {
    let pubkey = derive_pubkey(mpk, index, for_change)?;
    Ok(Address::from_uncompressed_pubkey(network, &pubkey))
}

/// Encode a standalone private key in wallet-import format.
pub fn wif_encode(secret: &SecretKey, network: Network) -> String {
    let version: u8 = match network {
        Network::Mainnet => 0x80,
        _ => 0xef,
    };
    let mut payload = Vec::with_capacity(33);
    payload.push(version);
    payload.extend_from_slice(&secret[..]);
    bs58_check_encode(&payload)
}

/// Decode a wallet-import-format key.
///
/// Only the uncompressed (33-byte payload) form is accepted: sequence
/// wallets hash uncompressed public keys, and a compressed-key import would
/// silently watch the wrong address.
pub fn wif_decode(text: &str) -> Result<(SecretKey, Network), WalletError> {
    let payload = bs58::decode(text)
        .with_check(None)
        .into_vec()
        .map_err(|_| WalletError::InvalidSeed("bad private key checksum"))?;
    if payload.len() != 33 {
        return Err(WalletError::InvalidSeed(
            "unsupported private key encoding",
        ));
    }
    let network = match payload[0] {
        0x80 => Network::Mainnet,
        0xef => Network::Testnet,
        _ => return Err(WalletError::InvalidSeed("unknown private key version")),
    };
    let secret = SecretKey::from_slice(&payload[1..])
        .map_err(|_| WalletError::InvalidSeed("private key is not a valid scalar"))?;
    Ok((secret, network))
}

fn bs58_check_encode(payload: &[u8]) -> String {
    bs58::encode(payload).with_check().into_string()
}

/// The address a standalone private key controls (uncompressed encoding).
pub fn address_of_secret(secret: &SecretKey, network: Network) -> Address {
    let secp = Secp256k1::new();
    let pubkey = PublicKey::from_secret_key(&secp, secret);
    Address::from_uncompressed_pubkey(network, &pubkey)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zero_seed() -> Seed {
        Seed::from_hex(&"00".repeat(16)).unwrap()
    }

    #[test]
    fn seed_validation() {
        assert!(Seed::from_hex("00112233445566778899aabbccddeeff").is_ok());
        // Case is normalized, not rejected.
        assert_eq!(
            Seed::from_hex("00112233445566778899AABBCCDDEEFF")
                .unwrap()
                .as_hex(),
            "00112233445566778899aabbccddeeff"
        );
        assert!(Seed::from_hex("too short").is_err());
        assert!(Seed::from_hex(&"00".repeat(17)).is_err());
        assert!(Seed::from_hex(&"zz".repeat(16)).is_err());
    }

    #[test]
    fn derivation_is_deterministic() {
        let master = zero_seed().stretch().unwrap();
        let mpk = master_public_key(&master);

        let once = derive_address(Network::Mainnet, &mpk, 0, false).unwrap();
        let again = derive_address(Network::Mainnet, &mpk, 0, false).unwrap();
        assert_eq!(once, again);

        // Receiving and change sequences are independent.
        let change = derive_address(Network::Mainnet, &mpk, 0, true).unwrap();
        assert_ne!(once, change);
        let next = derive_address(Network::Mainnet, &mpk, 1, false).unwrap();
        assert_ne!(once, next);
    }

    #[test]
    fn public_and_private_derivation_agree() {
        let master = zero_seed().stretch().unwrap();
        let mpk = master_public_key(&master);
        let secp = Secp256k1::new();

        for (index, for_change) in [(0, false), (0, true), (7, false), (31, true)] {
            let from_mpk = derive_pubkey(&mpk, index, for_change).unwrap();
            let secret = derive_secret(&master, &mpk, index, for_change).unwrap();
            let from_secret = PublicKey::from_secret_key(&secp, &secret);
            assert_eq!(from_mpk, from_secret);
        }
    }

    #[test]
    fn derived_address_matches_hash_construction() {
        let master = zero_seed().stretch().unwrap();
        let mpk = master_public_key(&master);

        let pubkey = derive_pubkey(&mpk, 0, false).unwrap();
        let address = derive_address(Network::Mainnet, &mpk, 0, false).unwrap();

        let payload = Address::hash_payload(&pubkey.serialize_uncompressed()[..]);
        assert_eq!(address, Address::p2pkh(Network::Mainnet, payload));
    }

    #[test]
    fn wif_roundtrip() {
        let master = zero_seed().stretch().unwrap();
        let encoded = wif_encode(&master, Network::Mainnet);
        assert!(encoded.starts_with('5'));

        let (decoded, network) = wif_decode(&encoded).unwrap();
        assert_eq!(decoded, master);
        assert_eq!(network, Network::Mainnet);

        assert!(wif_decode("not a key").is_err());
    }
}
