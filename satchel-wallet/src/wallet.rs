//! The wallet state: address sequences, histories, the transaction table,
//! balances, the derived UTXO view, and transaction construction.
//!
//! This type is purely local: it never touches the network. The
//! synchronizer feeds it server data and the verifier feeds it stamps;
//! everything here is deterministic given those inputs.

use std::collections::{BTreeMap, HashMap, HashSet};

use secp256k1::{Message, Secp256k1, SecretKey};
use tracing::{debug, info, warn};

use satchel_chain::{
    amount::Amount,
    serialization::sha256d,
    transaction::{self, Transaction},
    transparent::{Address, Input, OutPoint, Output, Script, SEQUENCE_FINAL},
    BitcoinDeserialize,
};
use satchel_network::{HistoryEntry, ServerAddr};
use satchel_spv::VerifiedStamp;

use crate::config::Config;
use crate::encryption::{pw_decode, pw_encode};
use crate::error::WalletError;
use crate::keys::{self, Seed, SEED_VERSION};
use crate::store::WalletRecord;

/// Rough serialized size of one signed pay-to-pubkey-hash input with an
/// uncompressed key.
const INPUT_SIZE_ESTIMATE: usize = 181;

/// Rough serialized size of one pay-to-pubkey-hash output.
const OUTPUT_SIZE_ESTIMATE: usize = 34;

/// Version + counts + locktime overhead of a transaction.
const TX_OVERHEAD_ESTIMATE: usize = 10;

/// A spendable output owned by this wallet, derived from history.
#[derive(Clone, Debug)]
pub struct Unspent {
    /// Where the coin lives.
    pub outpoint: OutPoint,
    /// Its value.
    pub value: Amount,
    /// The owned address it pays.
    pub address: Address,
    /// The lock script to sign against.
    pub lock_script: Script,
    /// Confirmation height, zero for mempool.
    pub height: u32,
    /// When the wallet first saw it (block timestamp).
    pub first_seen: u32,
}

/// One line of the user-facing transaction history.
#[derive(Clone, Debug)]
pub struct HistoryItem {
    /// The transaction.
    pub txid: transaction::Hash,
    /// Confirmation height, zero for mempool.
    pub height: u32,
    /// Block timestamp, zero for mempool.
    pub timestamp: u32,
    /// Net effect on the wallet across all owned addresses.
    pub value: Amount,
    /// The user's label, if any.
    pub label: Option<String>,
}

/// The in-memory wallet.
pub struct Wallet {
    config: Config,
    seed: String,
    use_encryption: bool,
    master_public_key: [u8; 64],
    receiving_addresses: Vec<Address>,
    change_addresses: Vec<Address>,
    imported_keys: BTreeMap<String, String>,
    status: HashMap<String, Option<String>>,
    history: HashMap<String, Vec<HistoryEntry>>,
    transactions: HashMap<transaction::Hash, Transaction>,
    raw_transactions: HashMap<transaction::Hash, Vec<u8>>,
    verified: HashMap<transaction::Hash, VerifiedStamp>,
    labels: BTreeMap<String, String>,
    contacts: Vec<Address>,
    gap_limit: u32,
    fee_per_kb: Amount,
    server: ServerAddr,
    tip_height: u32,
    /// Change addresses handed out by `mktx` this session, so consecutive
    /// payments do not share one before the first hits the history.
    reserved_change: HashSet<String>,
}

impl Wallet {
    /// Create a fresh wallet, optionally restoring from a known seed.
    ///
    /// The first receiving address is derived immediately;
    /// `use_encryption` reflects whether a password was supplied.
    pub fn create_new(
        config: Config,
        seed: Option<Seed>,
        password: Option<&str>,
    ) -> Result<Wallet, WalletError> {
        let seed = match seed {
            Some(seed) => seed,
            None => Seed::generate(),
        };
        let master = seed.stretch()?;
        let master_public_key = keys::master_public_key(&master);

        let mut wallet = Wallet {
            seed: pw_encode(seed.as_hex(), password),
            use_encryption: password.is_some(),
            master_public_key,
            receiving_addresses: Vec::new(),
            change_addresses: Vec::new(),
            imported_keys: BTreeMap::new(),
            status: HashMap::new(),
            history: HashMap::new(),
            transactions: HashMap::new(),
            raw_transactions: HashMap::new(),
            verified: HashMap::new(),
            labels: BTreeMap::new(),
            contacts: Vec::new(),
            gap_limit: config.gap_limit,
            fee_per_kb: config.fee_per_kb,
            server: config.server.clone(),
            tip_height: 0,
            reserved_change: HashSet::new(),
            config,
        };
        wallet.derive_next(false)?;
        info!(address = %wallet.receiving_addresses[0], "created new wallet");
        Ok(wallet)
    }

    /// Load the wallet at `config.wallet_path`.
    pub fn open(config: Config) -> Result<Wallet, WalletError> {
        let record = WalletRecord::load(&config.wallet_path)?;
        Wallet::from_record(config, record)
    }

    /// Persist the wallet atomically.
    pub fn save(&self) -> Result<(), WalletError> {
        self.to_record()?.save(&self.config.wallet_path)
    }

    fn from_record(config: Config, record: WalletRecord) -> Result<Wallet, WalletError> {
        let corrupt = |reason: &str| WalletError::StoreCorrupt {
            reason: reason.to_string(),
        };

        let mpk_bytes =
            hex::decode(&record.master_public_key).map_err(|_| corrupt("mpk is not hex"))?;
        let mut master_public_key = [0u8; 64];
        master_public_key.copy_from_slice(&mpk_bytes);

        // The address lists must be dense prefixes of the derivation
        // sequences; re-derive and compare.
        for (list, for_change) in [
            (&record.receiving_addresses, false),
            (&record.change_addresses, true),
        ] {
            for (index, stored) in list.iter().enumerate() {
                let derived = keys::derive_address(
                    config.network,
                    &master_public_key,
                    index as u32,
                    for_change,
                )?;
                if *stored != derived {
                    return Err(corrupt("address sequence does not match master key"));
                }
            }
        }

        let mut transactions = HashMap::new();
        let mut raw_transactions = HashMap::new();
        for (txid, raw_hex) in &record.transactions {
            let raw = hex::decode(raw_hex).map_err(|_| corrupt("stored transaction not hex"))?;
            if transaction::Hash(sha256d::hash(&raw)) != *txid {
                return Err(corrupt("stored transaction does not match its txid"));
            }
            let parsed = Transaction::bitcoin_deserialize(&raw[..])
                .map_err(|_| corrupt("stored transaction is malformed"))?;
            transactions.insert(*txid, parsed);
            raw_transactions.insert(*txid, raw);
        }

        Ok(Wallet {
            seed: record.seed,
            use_encryption: record.use_encryption,
            master_public_key,
            receiving_addresses: record.receiving_addresses,
            change_addresses: record.change_addresses,
            imported_keys: record.imported_keys,
            status: record.status.into_iter().collect(),
            history: record.history.into_iter().collect(),
            transactions,
            raw_transactions,
            verified: record.verified.into_iter().collect(),
            labels: record.labels,
            contacts: record.contacts,
            gap_limit: record.gap_limit,
            fee_per_kb: record.fee_per_kb,
            server: record.server,
            tip_height: record.tip_height,
            reserved_change: HashSet::new(),
            config,
        })
    }

    fn to_record(&self) -> Result<WalletRecord, WalletError> {
        let mut transactions = BTreeMap::new();
        for (txid, raw) in &self.raw_transactions {
            transactions.insert(*txid, hex::encode(raw));
        }
        Ok(WalletRecord {
            seed_version: SEED_VERSION,
            use_encryption: self.use_encryption,
            seed: self.seed.clone(),
            master_public_key: hex::encode(self.master_public_key),
            receiving_addresses: self.receiving_addresses.clone(),
            change_addresses: self.change_addresses.clone(),
            imported_keys: self.imported_keys.clone(),
            status: self.status.clone().into_iter().collect(),
            history: self.history.clone().into_iter().collect(),
            transactions,
            verified: self.verified.clone().into_iter().collect(),
            labels: self.labels.clone(),
            contacts: self.contacts.clone(),
            gap_limit: self.gap_limit,
            fee_per_kb: self.fee_per_kb,
            server: self.server.clone(),
            tip_height: self.tip_height,
        })
    }

    // ---- accessors ----

    /// The network this wallet lives on.
    pub fn network(&self) -> satchel_chain::parameters::Network {
        self.config.network
    }

    /// The configured indexer server.
    pub fn server(&self) -> &ServerAddr {
        &self.server
    }

    /// Switch to a different indexer server; persisted on the next save.
    pub fn set_server(&mut self, server: ServerAddr) {
        self.server = server;
    }

    /// The trailing-unused window size.
    pub fn gap_limit(&self) -> u32 {
        self.gap_limit
    }

    /// The last chain height the wallet saw.
    pub fn tip_height(&self) -> u32 {
        self.tip_height
    }

    /// Record a new chain tip.
    pub fn set_tip(&mut self, height: u32) {
        self.tip_height = height;
    }

    /// The receiving sequence.
    pub fn receiving_addresses(&self) -> &[Address] {
        &self.receiving_addresses
    }

    /// The change sequence.
    pub fn change_addresses(&self) -> &[Address] {
        &self.change_addresses
    }

    /// Imported standalone addresses.
    pub fn imported_addresses(&self) -> Vec<Address> {
        self.imported_keys
            .keys()
            .filter_map(|encoded| encoded.parse().ok())
            .collect()
    }

    /// Every address the wallet controls.
    pub fn all_addresses(&self) -> Vec<Address> {
        let mut all = self.receiving_addresses.clone();
        all.extend_from_slice(&self.change_addresses);
        all.extend(self.imported_addresses());
        all
    }

    /// Whether the wallet controls `address`.
    pub fn is_mine(&self, address: &Address) -> bool {
        self.receiving_addresses.contains(address)
            || self.change_addresses.contains(address)
            || self.imported_keys.contains_key(&address.to_string())
    }

    /// Whether `address` belongs to the change sequence.
    pub fn is_change(&self, address: &Address) -> bool {
        self.change_addresses.contains(address)
    }

    /// Whether `address` has any history rows.
    pub fn has_history(&self, address: &Address) -> bool {
        self.history
            .get(&address.to_string())
            .map(|rows| !rows.is_empty())
            .unwrap_or(false)
    }

    /// The stored status hash for an address; outer `None` means never
    /// subscribed.
    pub fn status(&self, address: &str) -> Option<&Option<String>> {
        self.status.get(address)
    }

    /// Record the server's status hash for an address.
    pub fn set_status(&mut self, address: &str, status: Option<String>) {
        self.status.insert(address.to_string(), status);
    }

    /// A user label.
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    /// Attach (or clear) a user label on an address or txid.
    pub fn set_label(&mut self, key: &str, text: &str) {
        if text.is_empty() {
            self.labels.remove(key);
        } else {
            self.labels.insert(key.to_string(), text.to_string());
        }
    }

    /// Resolve a label back to the address it names, for pay-to-label.
    pub fn resolve_label(&self, name: &str) -> Option<Address> {
        self.labels
            .iter()
            .find(|(_, label)| label.as_str() == name)
            .and_then(|(key, _)| key.parse().ok())
    }

    /// The contact list.
    pub fn contacts(&self) -> &[Address] {
        &self.contacts
    }

    /// Remember an outgoing address.
    pub fn add_contact(&mut self, address: Address) {
        if !self.contacts.contains(&address) {
            self.contacts.push(address);
        }
    }

    // ---- key and address management ----

    /// Decrypt and return the seed hex.
    pub fn seed_hex(&self, password: Option<&str>) -> Result<String, WalletError> {
        Ok(self.unlock_seed(password)?.as_hex().to_string())
    }

    /// Check a password without doing anything else.
    pub fn check_password(&self, password: Option<&str>) -> Result<(), WalletError> {
        self.unlock_seed(password).map(|_| ())
    }

    fn unlock_seed(&self, password: Option<&str>) -> Result<Seed, WalletError> {
        let password = if self.use_encryption { password } else { None };
        let text = pw_decode(&self.seed, password)?;
        // The recovered plaintext must be seed-shaped, otherwise the
        // password was wrong.
        Seed::from_hex(&text).map_err(|_| WalletError::WrongPassword)
    }

    fn master_secret(&self, password: Option<&str>) -> Result<SecretKey, WalletError> {
        self.unlock_seed(password)?.stretch()
    }

    fn derive_next(&mut self, for_change: bool) -> Result<Address, WalletError> {
        let index = if for_change {
            self.change_addresses.len() as u32
        } else {
            self.receiving_addresses.len() as u32
        };
        let address = keys::derive_address(
            self.config.network,
            &self.master_public_key,
            index,
            for_change,
        )?;
        if for_change {
            self.change_addresses.push(address);
        } else {
            self.receiving_addresses.push(address);
        }
        debug!(%address, index, for_change, "derived address");
        Ok(address)
    }

    fn trailing_unused_receiving(&self) -> u32 {
        self.receiving_addresses
            .iter()
            .rev()
            .take_while(|address| !self.has_history(address))
            .count() as u32
    }

    /// Hand out a fresh receiving address, refusing to run more than the
    /// gap limit ahead of used addresses.
    pub fn get_new_address(&mut self) -> Result<Address, WalletError> {
        if self.trailing_unused_receiving() > self.gap_limit {
            return Err(WalletError::GapLimitReached);
        }
        self.derive_next(false)
    }

    /// Grow the receiving and change sequences to honor the gap-limit
    /// policy, returning every address created.
    ///
    /// Terminates once a pass derives nothing: the last change address is
    /// unused and the last `gap_limit` receiving addresses are all empty.
    pub fn synchronize_sequences(&mut self) -> Result<Vec<Address>, WalletError> {
        let mut created = Vec::new();
        loop {
            let before = created.len();

            // Always keep an unused change address available.
            let change_needed = match self.change_addresses.last() {
                None => true,
                Some(last) => self.has_history(last),
            };
            if change_needed {
                created.push(self.derive_next(true)?);
            }

            // Maintain the trailing window of empty receiving addresses.
            while (self.receiving_addresses.len() as u32) < self.gap_limit
                || self.last_receiving_window_has_history()
            {
                created.push(self.derive_next(false)?);
            }

            if created.len() == before {
                return Ok(created);
            }
        }
    }

    fn last_receiving_window_has_history(&self) -> bool {
        self.receiving_addresses
            .iter()
            .rev()
            .take(self.gap_limit as usize)
            .any(|address| self.has_history(address))
    }

    /// Whether a restored wallet found anything on the chain.
    pub fn is_found(&self) -> bool {
        self.history.values().any(|rows| !rows.is_empty())
    }

    /// Import a standalone private key; returns its address.
    pub fn import_key(
        &mut self,
        wif: &str,
        password: Option<&str>,
    ) -> Result<Address, WalletError> {
        self.check_password(password)?;
        let (secret, key_network) = keys::wif_decode(wif)?;
        let address = keys::address_of_secret(&secret, key_network);
        if !address.valid_for(self.config.network) {
            return Err(WalletError::InvalidAddress("key is for another network"));
        }
        let stored = pw_encode(wif, if self.use_encryption { password } else { None });
        self.imported_keys.insert(address.to_string(), stored);
        info!(%address, "imported key");
        Ok(address)
    }

    /// The private key for any owned address.
    pub fn get_private_key(
        &self,
        address: &Address,
        password: Option<&str>,
    ) -> Result<SecretKey, WalletError> {
        if let Some(index) = self
            .receiving_addresses
            .iter()
            .position(|known| known == address)
        {
            let master = self.master_secret(password)?;
            return keys::derive_secret(&master, &self.master_public_key, index as u32, false);
        }
        if let Some(index) = self
            .change_addresses
            .iter()
            .position(|known| known == address)
        {
            let master = self.master_secret(password)?;
            return keys::derive_secret(&master, &self.master_public_key, index as u32, true);
        }
        if let Some(stored) = self.imported_keys.get(&address.to_string()) {
            self.check_password(password)?;
            let wif = pw_decode(stored, if self.use_encryption { password } else { None })?;
            let (secret, _) = keys::wif_decode(&wif).map_err(|_| WalletError::WrongPassword)?;
            return Ok(secret);
        }
        Err(WalletError::UnknownAddress)
    }

    /// Re-encrypt the seed and every imported key under a new password.
    pub fn change_password(
        &mut self,
        old: Option<&str>,
        new: Option<&str>,
    ) -> Result<(), WalletError> {
        let seed = self.unlock_seed(old)?;

        let mut reencrypted = BTreeMap::new();
        for (address, stored) in &self.imported_keys {
            let wif = pw_decode(stored, if self.use_encryption { old } else { None })?;
            reencrypted.insert(address.clone(), pw_encode(&wif, new));
        }

        self.seed = pw_encode(seed.as_hex(), new);
        self.imported_keys = reencrypted;
        self.use_encryption = new.is_some();
        self.save()
    }

    // ---- history and transactions ----

    /// Replace the history of `address` with fresh server rows. Returns
    /// the txids referenced but not yet in the transaction table.
    pub fn apply_history(
        &mut self,
        address: &str,
        entries: Vec<HistoryEntry>,
    ) -> Vec<transaction::Hash> {
        let missing: Vec<transaction::Hash> = entries
            .iter()
            .map(|entry| entry.tx_hash)
            .filter(|txid| !self.transactions.contains_key(txid))
            .collect();
        self.history.insert(address.to_string(), entries);
        missing
    }

    /// Insert a raw transaction fetched from the server. Idempotent by
    /// txid; a body that does not hash to `txid` is rejected.
    pub fn add_transaction(
        &mut self,
        txid: transaction::Hash,
        raw: Vec<u8>,
    ) -> Result<bool, WalletError> {
        if self.transactions.contains_key(&txid) {
            return Ok(false);
        }
        if transaction::Hash(sha256d::hash(&raw)) != txid {
            return Err(WalletError::Server {
                code: 0,
                message: format!("server returned a different transaction than {}", txid),
            });
        }
        let parsed = Transaction::bitcoin_deserialize(&raw[..]).map_err(|_| {
            WalletError::Server {
                code: 0,
                message: format!("transaction {} does not parse", txid),
            }
        })?;
        self.transactions.insert(txid, parsed);
        self.raw_transactions.insert(txid, raw);
        Ok(true)
    }

    /// The parsed transaction for `txid`, if stored.
    pub fn transaction(&self, txid: &transaction::Hash) -> Option<&Transaction> {
        self.transactions.get(txid)
    }

    /// Txids referenced by some history row but missing from the table.
    pub fn missing_transactions(&self) -> Vec<transaction::Hash> {
        let mut missing: Vec<transaction::Hash> = self
            .history
            .values()
            .flatten()
            .map(|entry| entry.tx_hash)
            .filter(|txid| !self.transactions.contains_key(txid))
            .collect();
        missing.sort();
        missing.dedup();
        missing
    }

    /// Stored, confirmed transactions still awaiting Merkle verification.
    pub fn unverified_transactions(&self) -> Vec<(transaction::Hash, u32)> {
        let mut heights: HashMap<transaction::Hash, u32> = HashMap::new();
        for entry in self.history.values().flatten() {
            if entry.height > 0 && self.transactions.contains_key(&entry.tx_hash) {
                heights.entry(entry.tx_hash).or_insert(entry.height);
            }
        }
        let mut unverified: Vec<(transaction::Hash, u32)> = heights
            .into_iter()
            .filter(|(txid, _)| !self.verified.contains_key(txid))
            .collect();
        unverified.sort();
        unverified
    }

    /// Attach a verification stamp produced by the SPV verifier.
    pub fn add_verified(&mut self, txid: transaction::Hash, stamp: VerifiedStamp) {
        if self.transactions.contains_key(&txid) {
            self.verified.insert(txid, stamp);
        }
    }

    /// The verification stamp for `txid`, if any.
    pub fn verified_stamp(&self, txid: &transaction::Hash) -> Option<&VerifiedStamp> {
        self.verified.get(txid)
    }

    /// Drop stamps invalidated by a reorg at or above `height`. The
    /// transactions stay; they will be re-verified against the new chain.
    pub fn unverify_above(&mut self, height: u32) {
        let before = self.verified.len();
        self.verified.retain(|_, stamp| stamp.height < height);
        let dropped = before - self.verified.len();
        if dropped > 0 {
            warn!(height, dropped, "cleared verification stamps after reorg");
        }
    }

    // ---- balances and coins ----

    /// Confirmed and unconfirmed balance of one owned address.
    ///
    /// Rows whose transaction has not arrived yet contribute nothing.
    pub fn get_addr_balance(&self, address: &Address) -> (Amount, Amount) {
        let mut confirmed = Amount::ZERO;
        let mut unconfirmed = Amount::ZERO;
        if let Some(rows) = self.history.get(&address.to_string()) {
            for entry in rows {
                if !self.transactions.contains_key(&entry.tx_hash) {
                    continue;
                }
                let bucket = if entry.height > 0 {
                    &mut confirmed
                } else {
                    &mut unconfirmed
                };
                *bucket = bucket.checked_add(entry.value).unwrap_or(*bucket);
            }
        }
        (confirmed, unconfirmed)
    }

    /// Confirmed and unconfirmed balance over every owned address.
    pub fn get_balance(&self) -> (Amount, Amount) {
        let mut confirmed = Amount::ZERO;
        let mut unconfirmed = Amount::ZERO;
        for address in self.all_addresses() {
            let (c, u) = self.get_addr_balance(&address);
            confirmed = confirmed.checked_add(c).unwrap_or(confirmed);
            unconfirmed = unconfirmed.checked_add(u).unwrap_or(unconfirmed);
        }
        (confirmed, unconfirmed)
    }

    /// The wallet's spendable outputs, oldest first.
    ///
    /// Candidates are history rows that fund an address and still carry
    /// their lock script; anything referenced as an input by a stored
    /// transaction is spent.
    pub fn unspent_outputs(&self) -> Vec<Unspent> {
        let mut spent: HashSet<OutPoint> = HashSet::new();
        for tx in self.transactions.values() {
            for input in &tx.inputs {
                spent.insert(input.outpoint);
            }
        }

        let mut coins = Vec::new();
        for address in self.all_addresses() {
            let rows = match self.history.get(&address.to_string()) {
                Some(rows) => rows,
                None => continue,
            };
            for entry in rows {
                if entry.is_input || entry.value.is_negative() {
                    continue;
                }
                let lock_script = match &entry.script_pubkey {
                    Some(script) if !script.is_empty() => script.clone(),
                    _ => continue,
                };
                if !self.transactions.contains_key(&entry.tx_hash) {
                    continue;
                }
                let outpoint = OutPoint {
                    hash: entry.tx_hash,
                    index: entry.pos,
                };
                if spent.contains(&outpoint) {
                    continue;
                }
                coins.push(Unspent {
                    outpoint,
                    value: entry.value,
                    address,
                    lock_script,
                    height: entry.height,
                    first_seen: entry.timestamp,
                });
            }
        }

        // Oldest first; mempool coins (timestamp zero) go last.
        coins.sort_by_key(|coin| {
            let seen = if coin.first_seen == 0 {
                u32::MAX
            } else {
                coin.first_seen
            };
            (seen, coin.outpoint.hash, coin.outpoint.index)
        });
        coins
    }

    /// The wallet's transaction history, oldest first, with net values.
    pub fn transaction_history(&self) -> Vec<HistoryItem> {
        let mut by_txid: BTreeMap<transaction::Hash, HistoryItem> = BTreeMap::new();
        for entry in self.history.values().flatten() {
            if !self.transactions.contains_key(&entry.tx_hash) {
                continue;
            }
            let item = by_txid.entry(entry.tx_hash).or_insert_with(|| HistoryItem {
                txid: entry.tx_hash,
                height: entry.height,
                timestamp: entry.timestamp,
                value: Amount::ZERO,
                label: self.labels.get(&entry.tx_hash.to_string()).cloned(),
            });
            item.height = item.height.max(entry.height);
            item.timestamp = item.timestamp.max(entry.timestamp);
            item.value = item.value.checked_add(entry.value).unwrap_or(item.value);
        }
        let mut items: Vec<HistoryItem> = by_txid.into_values().collect();
        items.sort_by_key(|item| {
            let seen = if item.timestamp == 0 {
                u32::MAX
            } else {
                item.timestamp
            };
            (seen, item.txid)
        });
        items
    }

    /// After a restore, remember every non-owned output address seen in
    /// the recovered transactions.
    pub fn fill_addressbook(&mut self) {
        let candidates: Vec<Address> = self
            .transactions
            .values()
            .flat_map(|tx| &tx.outputs)
            .filter_map(|output| output.lock_script.to_address(self.config.network))
            .collect();
        for address in candidates {
            if !self.is_mine(&address) {
                self.add_contact(address);
            }
        }
    }

    // ---- transaction construction ----

    fn choose_change_address(&mut self) -> Result<Address, WalletError> {
        let mut assigned: HashSet<Script> = HashSet::new();
        for tx in self.transactions.values() {
            for output in &tx.outputs {
                assigned.insert(output.lock_script.clone());
            }
        }

        let available = self.change_addresses.iter().copied().find(|address| {
            !self.has_history(address)
                && !assigned.contains(&address.lock_script())
                && !self.reserved_change.contains(&address.to_string())
        });
        let chosen = match available {
            Some(address) => address,
            None => self.derive_next(true)?,
        };
        self.reserved_change.insert(chosen.to_string());
        Ok(chosen)
    }

    fn estimated_fee(&self, input_count: usize, output_count: usize) -> Amount {
        let size = TX_OVERHEAD_ESTIMATE
            + input_count * INPUT_SIZE_ESTIMATE
            + output_count * OUTPUT_SIZE_ESTIMATE;
        let kilobytes = (size + 999) / 1000;
        Amount::from_sat(self.fee_per_kb.as_sat() * kilobytes as i64)
    }

    /// Build and sign a payment of `amount` to `recipient`.
    ///
    /// Inputs are accumulated oldest-first until they cover the amount and
    /// fee; when no fee is given it is recomputed from the estimated size
    /// each time an input is added. Any surplus goes to a fresh change
    /// output.
    pub fn mktx(
        &mut self,
        recipient: &Address,
        amount: Amount,
        fee: Option<Amount>,
        password: Option<&str>,
        label: Option<&str>,
    ) -> Result<Transaction, WalletError> {
        if !recipient.valid_for(self.config.network) {
            return Err(WalletError::InvalidAddress("wrong network"));
        }
        if amount <= Amount::ZERO {
            return Err(WalletError::InvalidAddress("amount must be positive"));
        }
        let master = self.master_secret(password)?;

        let coins = self.unspent_outputs();
        let mut selected: Vec<Unspent> = Vec::new();
        let mut total = Amount::ZERO;
        let mut current_fee = fee.unwrap_or_else(|| self.estimated_fee(1, 2));
        loop {
            let target = amount
                .checked_add(current_fee)
                .ok_or(WalletError::InsufficientFunds)?;
            while total < target {
                let next = selected.len();
                match coins.get(next) {
                    Some(coin) => {
                        total = total
                            .checked_add(coin.value)
                            .ok_or(WalletError::InsufficientFunds)?;
                        selected.push(coin.clone());
                    }
                    None => return Err(WalletError::InsufficientFunds),
                }
            }
            if fee.is_some() {
                break;
            }
            let recomputed = self.estimated_fee(selected.len(), 2);
            if recomputed <= current_fee {
                break;
            }
            current_fee = recomputed;
        }

        let change = total
            .checked_sub(amount)
            .and_then(|rest| rest.checked_sub(current_fee))
            .ok_or(WalletError::InsufficientFunds)?;

        let mut outputs = vec![Output {
            value: amount,
            lock_script: recipient.lock_script(),
        }];
        if change > Amount::ZERO {
            let change_address = self.choose_change_address()?;
            outputs.push(Output {
                value: change,
                lock_script: change_address.lock_script(),
            });
        }

        let inputs: Vec<Input> = selected
            .iter()
            .map(|coin| Input {
                outpoint: coin.outpoint,
                unlock_script: Script(Vec::new()),
                sequence: SEQUENCE_FINAL,
            })
            .collect();
        let mut tx = Transaction::new(1, inputs, outputs, 0);

        self.sign_transaction(&mut tx, &selected, &master, password)?;

        let txid = tx.hash();
        if let Some(label) = label {
            self.set_label(&txid.to_string(), label);
        }
        if !self.is_mine(recipient) {
            self.add_contact(*recipient);
        }
        info!(%txid, %amount, fee = %current_fee, inputs = tx.inputs.len(), "built transaction");
        Ok(tx)
    }

    fn sign_transaction(
        &self,
        tx: &mut Transaction,
        coins: &[Unspent],
        master: &SecretKey,
        password: Option<&str>,
    ) -> Result<(), WalletError> {
        let secp = Secp256k1::new();
        for (index, coin) in coins.iter().enumerate() {
            let secret = self.signing_key(&coin.address, master, password)?;
            let pubkey = secp256k1::PublicKey::from_secret_key(&secp, &secret);

            let digest = tx
                .sighash_all(index, &coin.lock_script)
                .map_err(|_| WalletError::InsufficientFunds)?;
            let message =
                Message::from_slice(&digest).expect("sighash digests are 32 bytes");
            let signature = secp.sign(&message, &secret);

            let mut signature_bytes = signature.serialize_der().to_vec();
            signature_bytes.push(transaction::SIGHASH_ALL as u8);
            tx.inputs[index].unlock_script = Script::unlock_pay_to_pubkey_hash(
                &signature_bytes,
                &pubkey.serialize_uncompressed(),
            );
        }
        Ok(())
    }

    /// The key for `address`, given an already-stretched master secret.
    fn signing_key(
        &self,
        address: &Address,
        master: &SecretKey,
        password: Option<&str>,
    ) -> Result<SecretKey, WalletError> {
        if let Some(index) = self
            .receiving_addresses
            .iter()
            .position(|known| known == address)
        {
            return keys::derive_secret(master, &self.master_public_key, index as u32, false);
        }
        if let Some(index) = self
            .change_addresses
            .iter()
            .position(|known| known == address)
        {
            return keys::derive_secret(master, &self.master_public_key, index as u32, true);
        }
        self.get_private_key(address, password)
    }
}

#[cfg(test)]
mod tests {
    use satchel_chain::{parameters::Network, BitcoinSerialize};

    use super::*;

    fn test_config(dir: &tempfile::TempDir) -> Config {
        let mut config = Config::new(dir.path().join("wallet"));
        config.network = Network::Mainnet;
        config
    }

    fn fresh_wallet(dir: &tempfile::TempDir) -> Wallet {
        let seed = Seed::from_hex(&"00".repeat(16)).unwrap();
        Wallet::create_new(test_config(dir), Some(seed), None).unwrap()
    }

    /// A confirmed coin of `value` paying `address`, wired into history
    /// and the transaction table.
    fn fund(wallet: &mut Wallet, address: Address, value: Amount, timestamp: u32) {
        let funding = Transaction::new(
            1,
            vec![Input {
                outpoint: OutPoint {
                    hash: transaction::Hash([0; 32]),
                    index: u32::MAX,
                },
                unlock_script: Script(vec![0x51]),
                sequence: SEQUENCE_FINAL,
            }],
            vec![Output {
                value,
                lock_script: address.lock_script(),
            }],
            0,
        );
        let raw = funding.bitcoin_serialize_to_vec().unwrap();
        let txid = funding.hash();
        wallet.add_transaction(txid, raw).unwrap();
        wallet.apply_history(
            &address.to_string(),
            vec![HistoryEntry {
                tx_hash: txid,
                height: 100,
                value,
                pos: 0,
                is_input: false,
                script_pubkey: Some(address.lock_script()),
                timestamp,
            }],
        );
    }

    #[test]
    fn create_generates_exactly_one_address() {
        let dir = tempfile::tempdir().unwrap();
        let wallet = fresh_wallet(&dir);
        assert_eq!(wallet.receiving_addresses().len(), 1);
        assert!(wallet.change_addresses().is_empty());
    }

    #[test]
    fn gap_limit_honored() {
        let dir = tempfile::tempdir().unwrap();
        let mut wallet = fresh_wallet(&dir);

        let mut handed_out = Vec::new();
        for _ in 0..5 {
            handed_out.push(wallet.get_new_address().unwrap());
        }
        let distinct: HashSet<String> =
            handed_out.iter().map(|address| address.to_string()).collect();
        assert_eq!(distinct.len(), 5);

        // None of them used: the sixth request is refused.
        assert!(matches!(
            wallet.get_new_address(),
            Err(WalletError::GapLimitReached)
        ));

        // Marking one used frees the window again.
        let used = handed_out[4];
        fund(&mut wallet, used, Amount::from_sat(1000), 500);
        assert!(wallet.get_new_address().is_ok());
    }

    #[test]
    fn sequence_synchronization_reaches_quiescence() {
        let dir = tempfile::tempdir().unwrap();
        let mut wallet = fresh_wallet(&dir);

        let created = wallet.synchronize_sequences().unwrap();
        assert!(!created.is_empty());
        // Quiescent: gap-limit receiving addresses, one unused change.
        assert_eq!(wallet.receiving_addresses().len() as u32, wallet.gap_limit());
        assert_eq!(wallet.change_addresses().len(), 1);

        // A second pass with no new history derives nothing.
        assert!(wallet.synchronize_sequences().unwrap().is_empty());

        // Fresh history inside the window pushes the sequences onward.
        let used = *wallet.receiving_addresses().last().unwrap();
        fund(&mut wallet, used, Amount::from_sat(5000), 700);
        let created = wallet.synchronize_sequences().unwrap();
        assert!(!created.is_empty());
        let trailing = wallet.trailing_unused_receiving();
        assert_eq!(trailing, wallet.gap_limit());
    }

    #[test]
    fn balances_follow_history() {
        let dir = tempfile::tempdir().unwrap();
        let mut wallet = fresh_wallet(&dir);
        let address = wallet.receiving_addresses()[0];

        fund(&mut wallet, address, Amount::from_sat(70_000), 600);
        let (confirmed, unconfirmed) = wallet.get_balance();
        assert_eq!(confirmed.as_sat(), 70_000);
        assert_eq!(unconfirmed.as_sat(), 0);

        let (addr_confirmed, _) = wallet.get_addr_balance(&address);
        assert_eq!(addr_confirmed.as_sat(), 70_000);
    }

    #[test]
    fn pending_history_rows_do_not_count() {
        let dir = tempfile::tempdir().unwrap();
        let mut wallet = fresh_wallet(&dir);
        let address = wallet.receiving_addresses()[0];

        let missing = wallet.apply_history(
            &address.to_string(),
            vec![HistoryEntry {
                tx_hash: transaction::Hash([9; 32]),
                height: 50,
                value: Amount::from_sat(123_456),
                pos: 0,
                is_input: false,
                script_pubkey: Some(address.lock_script()),
                timestamp: 400,
            }],
        );
        assert_eq!(missing.len(), 1);

        // The referenced transaction never arrived: no balance, no coins.
        assert_eq!(wallet.get_balance().0, Amount::ZERO);
        assert!(wallet.unspent_outputs().is_empty());
        assert_eq!(wallet.missing_transactions(), missing);
    }

    #[test]
    fn build_and_sign_pays_recipient_and_change() {
        let dir = tempfile::tempdir().unwrap();
        let mut wallet = fresh_wallet(&dir);
        let funded = wallet.receiving_addresses()[0];
        fund(
            &mut wallet,
            funded,
            Amount::from_btc_str("1").unwrap(),
            900,
        );

        let recipient: Address = "1BitcoinEaterAddressDontSendf59kuE".parse().unwrap();
        let tx = wallet
            .mktx(
                &recipient,
                Amount::from_btc_str("0.1").unwrap(),
                Some(Amount::from_btc_str("0.001").unwrap()),
                None,
                Some("lunch"),
            )
            .unwrap();

        assert_eq!(tx.version, 1);
        assert_eq!(tx.lock_time, 0);
        assert_eq!(tx.inputs.len(), 1);
        assert_eq!(tx.outputs.len(), 2);
        assert_eq!(tx.outputs[0].value, Amount::from_btc_str("0.1").unwrap());
        assert_eq!(
            tx.outputs[0].lock_script.to_address(Network::Mainnet),
            Some(recipient)
        );
        // Change lands on change index zero, for the difference.
        assert_eq!(
            tx.outputs[1].value,
            Amount::from_btc_str("0.899").unwrap()
        );
        assert_eq!(wallet.change_addresses().len(), 1);
        assert_eq!(
            tx.outputs[1].lock_script.to_address(Network::Mainnet),
            Some(wallet.change_addresses()[0])
        );

        // Inputs minus outputs equals the declared fee.
        let out_total: i64 = tx.outputs.iter().map(|o| o.value.as_sat()).sum();
        assert_eq!(
            Amount::from_btc_str("1").unwrap().as_sat() - out_total,
            Amount::from_btc_str("0.001").unwrap().as_sat()
        );

        // The signature verifies against the spent output's script.
        let secp = Secp256k1::new();
        let digest = tx.sighash_all(0, &funded.lock_script()).unwrap();
        let message = Message::from_slice(&digest).unwrap();
        let script = &tx.inputs[0].unlock_script.0;
        let sig_len = script[0] as usize;
        let signature =
            secp256k1::Signature::from_der(&script[1..sig_len]).expect("parsable der signature");
        let pubkey_len = script[1 + sig_len] as usize;
        let pubkey = secp256k1::PublicKey::from_slice(
            &script[2 + sig_len..2 + sig_len + pubkey_len],
        )
        .expect("parsable pubkey");
        secp.verify(&message, &signature, &pubkey)
            .expect("signature verifies");

        // And the key that signed is the key the output demands.
        assert_eq!(
            Address::from_uncompressed_pubkey(Network::Mainnet, &pubkey),
            funded
        );

        assert_eq!(wallet.label(&tx.hash().to_string()), Some("lunch"));
    }

    #[test]
    fn mktx_without_funds_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut wallet = fresh_wallet(&dir);
        let recipient: Address = "1BitcoinEaterAddressDontSendf59kuE".parse().unwrap();
        assert!(matches!(
            wallet.mktx(
                &recipient,
                Amount::from_sat(1000),
                None,
                None,
                None
            ),
            Err(WalletError::InsufficientFunds)
        ));
    }

    #[test]
    fn wrong_password_aborts_mktx() {
        let dir = tempfile::tempdir().unwrap();
        let seed = Seed::from_hex(&"11".repeat(16)).unwrap();
        let mut wallet =
            Wallet::create_new(test_config(&dir), Some(seed), Some("secret")).unwrap();
        let funded = wallet.receiving_addresses()[0];
        fund(&mut wallet, funded, Amount::from_sat(50_000), 900);

        let recipient: Address = "1BitcoinEaterAddressDontSendf59kuE".parse().unwrap();
        assert!(matches!(
            wallet.mktx(
                &recipient,
                Amount::from_sat(1000),
                None,
                Some("wrong"),
                None
            ),
            Err(WalletError::WrongPassword)
        ));
    }

    #[test]
    fn store_roundtrip_preserves_wallet() {
        let dir = tempfile::tempdir().unwrap();
        let mut wallet = fresh_wallet(&dir);
        let funded = wallet.receiving_addresses()[0];
        fund(&mut wallet, funded, Amount::from_sat(42_000), 321);
        wallet.set_label(&funded.to_string(), "mine");
        wallet.set_tip(171_000);
        wallet.synchronize_sequences().unwrap();
        wallet.save().unwrap();

        let reopened = Wallet::open(test_config(&dir)).unwrap();
        assert_eq!(
            reopened.receiving_addresses(),
            wallet.receiving_addresses()
        );
        assert_eq!(reopened.change_addresses(), wallet.change_addresses());
        assert_eq!(reopened.get_balance(), wallet.get_balance());
        assert_eq!(reopened.tip_height(), 171_000);
        assert_eq!(reopened.label(&funded.to_string()), Some("mine"));
        assert_eq!(reopened.to_record().unwrap(), wallet.to_record().unwrap());
    }

    #[test]
    fn change_password_reencrypts() {
        let dir = tempfile::tempdir().unwrap();
        let seed = Seed::from_hex(&"22".repeat(16)).unwrap();
        let mut wallet =
            Wallet::create_new(test_config(&dir), Some(seed.clone()), Some("old")).unwrap();

        wallet.change_password(Some("old"), Some("new")).unwrap();
        assert_eq!(wallet.seed_hex(Some("new")).unwrap(), seed.as_hex());
        assert!(matches!(
            wallet.seed_hex(Some("old")),
            Err(WalletError::WrongPassword)
        ));

        // Dropping the password leaves the seed in the clear.
        wallet.change_password(Some("new"), None).unwrap();
        assert_eq!(wallet.seed_hex(None).unwrap(), seed.as_hex());
    }

    #[test]
    fn unknown_address_has_no_key() {
        let dir = tempfile::tempdir().unwrap();
        let wallet = fresh_wallet(&dir);
        let stranger: Address = "1BitcoinEaterAddressDontSendf59kuE".parse().unwrap();
        assert!(matches!(
            wallet.get_private_key(&stranger, None),
            Err(WalletError::UnknownAddress)
        ));
    }

    #[test]
    fn verification_stamps_clear_on_reorg() {
        let dir = tempfile::tempdir().unwrap();
        let mut wallet = fresh_wallet(&dir);
        let funded = wallet.receiving_addresses()[0];
        fund(&mut wallet, funded, Amount::from_sat(1000), 500);

        let (txid, height) = wallet.unverified_transactions()[0];
        wallet.add_verified(
            txid,
            VerifiedStamp {
                height,
                timestamp: 500,
                pos: 0,
            },
        );
        assert!(wallet.unverified_transactions().is_empty());

        // A reorg below the stamp height unverifies it; the tx remains.
        wallet.unverify_above(height);
        assert_eq!(wallet.unverified_transactions(), vec![(txid, height)]);
        assert!(wallet.transaction(&txid).is_some());
    }
}
