//! The persisted wallet record.
//!
//! On disk the wallet is a single JSON document with typed fields and an
//! explicit seed-format version; unknown versions are rejected rather than
//! migrated. Every save atomically replaces the file: write to a sibling
//! temp file, fsync, rename. An advisory lock file keeps two processes
//! from clobbering each other's saves.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use satchel_chain::{amount::Amount, transaction, transparent::Address};
use satchel_network::{HistoryEntry, ServerAddr};
use satchel_spv::VerifiedStamp;

use crate::error::WalletError;
use crate::keys::SEED_VERSION;

/// Exactly the state a wallet needs to persist, in serializable form.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WalletRecord {
    /// Version of the seed/derivation scheme; see [`SEED_VERSION`].
    pub seed_version: u32,
    /// Whether `seed` and imported keys are ciphertext.
    pub use_encryption: bool,
    /// The seed, hex when plaintext, Base64 when encrypted.
    pub seed: String,
    /// The master public key as 128 hex characters (x || y).
    pub master_public_key: String,
    /// The receiving sequence, dense from index zero.
    pub receiving_addresses: Vec<Address>,
    /// The change sequence, dense from index zero.
    pub change_addresses: Vec<Address>,
    /// Standalone keys: encoded address to (possibly encrypted) WIF.
    pub imported_keys: BTreeMap<String, String>,
    /// Last seen status hash per subscribed address.
    pub status: BTreeMap<String, Option<String>>,
    /// Per-address history, as verified-on-receipt server rows.
    pub history: BTreeMap<String, Vec<HistoryEntry>>,
    /// Raw transactions by txid, hex encoded.
    pub transactions: BTreeMap<transaction::Hash, String>,
    /// Merkle-verification stamps by txid.
    pub verified: BTreeMap<transaction::Hash, VerifiedStamp>,
    /// Free-form labels on addresses and txids.
    pub labels: BTreeMap<String, String>,
    /// Addresses the user has paid or chosen to remember.
    pub contacts: Vec<Address>,
    /// Trailing window of unused receiving addresses to maintain.
    pub gap_limit: u32,
    /// Fee rate in satoshis per kilobyte.
    pub fee_per_kb: Amount,
    /// The chosen indexer server.
    pub server: ServerAddr,
    /// Last chain tip height the wallet saw.
    pub tip_height: u32,
}

impl WalletRecord {
    /// Read and structurally validate the record at `path`.
    pub fn load(path: &Path) -> Result<WalletRecord, WalletError> {
        let bytes = fs::read(path)?;
        let record: WalletRecord = serde_json::from_slice(&bytes).map_err(|error| {
            WalletError::StoreCorrupt {
                reason: format!("unparsable wallet file: {}", error),
            }
        })?;

        if record.seed_version != SEED_VERSION {
            return Err(WalletError::StoreCorrupt {
                reason: "unsupported seed version".to_string(),
            });
        }
        if record.master_public_key.len() != 128
            || hex::decode(&record.master_public_key).is_err()
        {
            return Err(WalletError::StoreCorrupt {
                reason: "malformed master public key".to_string(),
            });
        }
        if !record.use_encryption && !is_hex_seed(&record.seed) {
            return Err(WalletError::StoreCorrupt {
                reason: "plaintext seed is not hex".to_string(),
            });
        }
        Ok(record)
    }

    /// Atomically replace the record at `path`.
    pub fn save(&self, path: &Path) -> Result<(), WalletError> {
        let _lock = LockFile::acquire(path)?;

        let temp_path = path.with_extension("tmp");
        let data = serde_json::to_vec_pretty(self).map_err(|error| {
            WalletError::StoreCorrupt {
                reason: format!("unserializable wallet state: {}", error),
            }
        })?;

        let mut file = fs::File::create(&temp_path)?;
        file.write_all(&data)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, path)?;
        debug!(path = %path.display(), bytes = data.len(), "wallet saved");
        Ok(())
    }
}

fn is_hex_seed(seed: &str) -> bool {
    seed.len() == 32 && seed.bytes().all(|b| b.is_ascii_hexdigit())
}

/// An advisory lock next to the wallet file, held for the duration of a
/// save.
struct LockFile {
    path: std::path::PathBuf,
}

impl LockFile {
    fn acquire(wallet_path: &Path) -> Result<LockFile, WalletError> {
        let path = wallet_path.with_extension("lock");
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(_) => Ok(LockFile { path }),
            Err(error) if error.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(WalletError::Io(std::io::Error::new(
                    std::io::ErrorKind::WouldBlock,
                    "wallet file is locked by another process",
                )))
            }
            Err(error) => Err(error.into()),
        }
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_record() -> WalletRecord {
        WalletRecord {
            seed_version: SEED_VERSION,
            use_encryption: false,
            seed: "00112233445566778899aabbccddeeff".to_string(),
            master_public_key: "ab".repeat(64),
            receiving_addresses: Vec::new(),
            change_addresses: Vec::new(),
            imported_keys: BTreeMap::new(),
            status: BTreeMap::new(),
            history: BTreeMap::new(),
            transactions: BTreeMap::new(),
            verified: BTreeMap::new(),
            labels: BTreeMap::new(),
            contacts: Vec::new(),
            gap_limit: 5,
            fee_per_kb: Amount::from_sat(100_000),
            server: ServerAddr::new("ecdsa.org", 50001),
            tip_height: 0,
        }
    }

    #[test]
    fn save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wallet");

        let mut record = minimal_record();
        record.labels.insert("somekey".into(), "rent".into());
        record.tip_height = 170_000;

        record.save(&path).unwrap();
        let loaded = WalletRecord::load(&path).unwrap();
        assert_eq!(loaded, record);

        // The save lock is released afterwards.
        record.save(&path).unwrap();
    }

    #[test]
    fn unsupported_seed_version_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wallet");

        let mut record = minimal_record();
        record.seed_version = 2;
        record.save(&path).unwrap();

        match WalletRecord::load(&path) {
            Err(WalletError::StoreCorrupt { reason }) => {
                assert_eq!(reason, "unsupported seed version")
            }
            other => panic!("expected StoreCorrupt, got {:?}", other),
        }
    }

    #[test]
    fn garbage_file_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wallet");
        fs::write(&path, b"{ not json").unwrap();

        assert!(matches!(
            WalletRecord::load(&path),
            Err(WalletError::StoreCorrupt { .. })
        ));
    }

    #[test]
    fn held_lock_blocks_saves() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wallet");

        let _held = LockFile::acquire(&path).unwrap();
        assert!(minimal_record().save(&path).is_err());
    }
}
