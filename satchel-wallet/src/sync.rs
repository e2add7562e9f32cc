//! The synchronization engine.
//!
//! Drives the address-status subscription protocol until the wallet is
//! quiescent: every owned address subscribed, every changed history
//! refetched, every referenced transaction stored, new addresses derived
//! under the gap limit, and every confirmed transaction handed to the SPV
//! verifier.
//!
//! The wallet itself stays a plain mutable value behind a mutex; all
//! network and verifier results funnel through this one task, so no other
//! writer ever races it.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use satchel_chain::{transaction, BitcoinSerialize};
use satchel_network::{Client, Notification};
use satchel_spv as spv;

use crate::error::WalletError;
use crate::wallet::Wallet;

/// A wallet shared between the command task and the synchronizer.
pub type SharedWallet = Arc<Mutex<Wallet>>;

/// Transient failures are retried this many times before surfacing.
const MAX_ATTEMPTS: u32 = 5;

/// How long to wait for the verifier before giving up on a pass.
const VERIFIER_WAIT: Duration = Duration::from_secs(60);

/// The synchronization engine; see the module docs.
pub struct Synchronizer {
    wallet: SharedWallet,
    client: Client,
    notifications: mpsc::Receiver<Notification>,
    verifier_requests: mpsc::Sender<spv::Request>,
    verifier_events: mpsc::Receiver<spv::Event>,
    /// Addresses whose server status differs from the stored one, with the
    /// status that made them stale.
    stale: VecDeque<(String, Option<String>)>,
}

impl Synchronizer {
    /// Wire up a synchronizer; channels come from [`Client::spawn`] and the
    /// verifier task.
    pub fn new(
        wallet: SharedWallet,
        client: Client,
        notifications: mpsc::Receiver<Notification>,
        verifier_requests: mpsc::Sender<spv::Request>,
        verifier_events: mpsc::Receiver<spv::Event>,
    ) -> Synchronizer {
        Synchronizer {
            wallet,
            client,
            notifications,
            verifier_requests,
            verifier_events,
            stale: VecDeque::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Wallet> {
        self.wallet.lock().expect("wallet mutex poisoned")
    }

    /// Run the protocol until quiescent, then verify confirmations.
    pub async fn synchronize(&mut self) -> Result<(), WalletError> {
        let tip = self
            .with_retry(|client| async move { client.subscribe_numblocks().await })
            .await?;
        info!(tip, "chain tip");
        self.lock().set_tip(tip);
        let _ = self
            .verifier_requests
            .send(spv::Request::Tip { height: tip })
            .await;

        let known: Vec<String> = self
            .lock()
            .all_addresses()
            .iter()
            .map(ToString::to_string)
            .collect();
        for address in known {
            self.subscribe(address).await?;
        }

        loop {
            self.drain_notifications().await;

            if let Some((address, status)) = self.stale.pop_front() {
                self.refresh_address(address, status).await?;
                continue;
            }

            let created = self.lock().synchronize_sequences()?;
            if !created.is_empty() {
                debug!(count = created.len(), "derived addresses under gap limit");
                for address in created {
                    self.subscribe(address.to_string()).await?;
                }
                continue;
            }

            self.drain_notifications().await;
            if self.stale.is_empty() {
                break;
            }
        }

        self.fetch_missing_transactions().await?;
        self.verify_pass().await?;
        info!("synchronization quiescent");
        Ok(())
    }

    /// Broadcast a signed transaction, checking the server echoes its txid.
    pub async fn broadcast(
        &mut self,
        tx: &satchel_chain::transaction::Transaction,
    ) -> Result<transaction::Hash, WalletError> {
        let raw = tx
            .bitcoin_serialize_to_vec()
            .expect("serializing to a Vec never fails");
        let txid = tx.hash();
        let response = self.client.broadcast(&raw).await?;
        if response.trim() != txid.to_string() {
            return Err(WalletError::Server {
                code: 0,
                message: response,
            });
        }
        info!(%txid, "broadcast accepted");
        Ok(txid)
    }

    async fn subscribe(&mut self, address: String) -> Result<(), WalletError> {
        let for_call = address.clone();
        let status = self
            .with_retry(move |client| {
                let address = for_call.clone();
                async move { client.subscribe_address(&address).await }
            })
            .await?;
        self.note_status(address, status);
        Ok(())
    }

    /// Mark an address stale if the server's status differs from ours.
    /// Repeated identical notifications collapse into one refresh.
    fn note_status(&mut self, address: String, status: Option<String>) {
        let unchanged = self.lock().status(&address) == Some(&status);
        if unchanged {
            return;
        }
        if let Some(entry) = self.stale.iter_mut().find(|(queued, _)| *queued == address) {
            entry.1 = status;
        } else {
            self.stale.push_back((address, status));
        }
    }

    async fn refresh_address(
        &mut self,
        address: String,
        status: Option<String>,
    ) -> Result<(), WalletError> {
        let for_call = address.clone();
        let entries = self
            .with_retry(move |client| {
                let address = for_call.clone();
                async move { client.get_history(&address).await }
            })
            .await?;

        // Process anything that arrived while we were fetching: if this
        // address's status moved again, this response is already outdated
        // and the queued entry will refetch it.
        self.drain_notifications().await;
        if self
            .stale
            .iter()
            .any(|(queued, newer)| *queued == address && *newer != status)
        {
            debug!(%address, "discarding outdated history response");
            return Ok(());
        }

        let missing = {
            let mut wallet = self.lock();
            let missing = wallet.apply_history(&address, entries);
            wallet.set_status(&address, status);
            missing
        };
        for txid in missing {
            self.fetch_transaction(txid).await?;
        }
        Ok(())
    }

    async fn fetch_transaction(&mut self, txid: transaction::Hash) -> Result<(), WalletError> {
        let raw = self
            .with_retry(move |client| async move { client.get_transaction(&txid).await })
            .await?;
        match self.lock().add_transaction(txid, raw) {
            Ok(_) => Ok(()),
            // A server body that does not match its txid is withheld; the
            // history rows stay pending rather than poisoning balances.
            Err(error) => {
                warn!(%txid, %error, "rejected transaction from server");
                Ok(())
            }
        }
    }

    async fn fetch_missing_transactions(&mut self) -> Result<(), WalletError> {
        loop {
            let missing = self.lock().missing_transactions();
            if missing.is_empty() {
                return Ok(());
            }
            let before = missing.len();
            for txid in missing {
                self.fetch_transaction(txid).await?;
            }
            // A server that keeps withholding a transaction must not spin
            // us; the rows stay pending until a later synchronization.
            let after = self.lock().missing_transactions().len();
            if after >= before {
                warn!(still_missing = after, "could not retrieve every transaction");
                return Ok(());
            }
        }
    }

    /// Submit unverified confirmed transactions and absorb the verifier's
    /// verdicts.
    async fn verify_pass(&mut self) -> Result<(), WalletError> {
        let tip = self.lock().tip_height();
        let _ = self
            .verifier_requests
            .send(spv::Request::Tip { height: tip })
            .await;

        let pending = self.lock().unverified_transactions();
        if pending.is_empty() {
            return Ok(());
        }
        let mut outstanding: HashSet<transaction::Hash> = HashSet::new();
        for (txid, height) in pending {
            outstanding.insert(txid);
            let _ = self
                .verifier_requests
                .send(spv::Request::Verify { txid, height })
                .await;
        }

        while !outstanding.is_empty() {
            match tokio::time::timeout(VERIFIER_WAIT, self.verifier_events.recv()).await {
                Err(_) => {
                    warn!(
                        remaining = outstanding.len(),
                        "verifier did not finish in time; continuing without stamps"
                    );
                    break;
                }
                Ok(None) => break,
                Ok(Some(event)) => self.apply_verifier_event(event, &mut outstanding),
            }
        }
        Ok(())
    }

    fn apply_verifier_event(
        &mut self,
        event: spv::Event,
        outstanding: &mut HashSet<transaction::Hash>,
    ) {
        match event {
            spv::Event::Verified { txid, stamp } => {
                self.lock().add_verified(txid, stamp);
                outstanding.remove(&txid);
            }
            spv::Event::Failed { txid } => {
                warn!(%txid, "transaction failed merkle verification");
                outstanding.remove(&txid);
            }
            spv::Event::Unverified { above_height } => {
                self.lock().unverify_above(above_height);
            }
            spv::Event::HeadersSynced { height } => {
                debug!(height, "headers synced");
            }
        }
    }

    /// Pull everything currently queued on the notification channel.
    async fn drain_notifications(&mut self) {
        while let Ok(notification) = self.notifications.try_recv() {
            match notification {
                Notification::AddressStatus { address, status } => {
                    self.note_status(address, status)
                }
                Notification::TipHeight(height) => {
                    self.lock().set_tip(height);
                    let _ = self
                        .verifier_requests
                        .send(spv::Request::Tip { height })
                        .await;
                }
                Notification::Connected => info!("server connected"),
                Notification::Disconnected => warn!("server disconnected, reconnecting"),
            }
        }
    }

    /// Retry `op` with linear backoff while it fails transiently.
    async fn with_retry<Op, Fut, T>(&self, mut op: Op) -> Result<T, WalletError>
    where
        Op: FnMut(Client) -> Fut,
        Fut: Future<Output = Result<T, satchel_network::Error>>,
    {
        let mut attempt = 0;
        loop {
            match op(self.client.clone()).await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_transient() && attempt + 1 < MAX_ATTEMPTS => {
                    attempt += 1;
                    warn!(%error, attempt, "transient network failure, retrying");
                    tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
                }
                Err(error) => return Err(error.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use satchel_network::{ClientConfig, ServerAddr};

    use crate::{Config, Seed};

    use super::*;

    fn test_synchronizer(
        dir: &tempfile::TempDir,
    ) -> (Synchronizer, mpsc::Receiver<spv::Request>, mpsc::Sender<spv::Event>) {
        let config = Config::new(dir.path().join("wallet"));
        let seed = Seed::from_hex(&"00".repeat(16)).unwrap();
        let wallet = Wallet::create_new(config, Some(seed), None).unwrap();
        let shared: SharedWallet = Arc::new(Mutex::new(wallet));

        // A dead endpoint: the worker retries in the background and these
        // tests never issue a request.
        let (client, notifications) = satchel_network::Client::spawn(ClientConfig {
            server: ServerAddr::new("127.0.0.1", 1),
            client_version: "test".to_string(),
        });
        let (request_tx, request_rx) = mpsc::channel(8);
        let (event_tx, event_rx) = mpsc::channel(8);
        let synchronizer =
            Synchronizer::new(shared, client, notifications, request_tx, event_rx);
        (synchronizer, request_rx, event_tx)
    }

    #[tokio::test]
    async fn repeated_status_notifications_collapse() {
        let dir = tempfile::tempdir().unwrap();
        let (mut synchronizer, _requests, _events) = test_synchronizer(&dir);

        synchronizer.note_status("1abc".to_string(), Some("aa".to_string()));
        synchronizer.note_status("1abc".to_string(), Some("aa".to_string()));
        assert_eq!(synchronizer.stale.len(), 1);

        // A different status replaces the queued one instead of appending.
        synchronizer.note_status("1abc".to_string(), Some("bb".to_string()));
        assert_eq!(synchronizer.stale.len(), 1);
        assert_eq!(synchronizer.stale[0].1.as_deref(), Some("bb"));
    }

    #[tokio::test]
    async fn stored_status_suppresses_refetch() {
        let dir = tempfile::tempdir().unwrap();
        let (mut synchronizer, _requests, _events) = test_synchronizer(&dir);

        synchronizer
            .lock()
            .set_status("1abc", Some("aa".to_string()));
        synchronizer.note_status("1abc".to_string(), Some("aa".to_string()));
        assert!(synchronizer.stale.is_empty());
    }

    #[tokio::test]
    async fn verifier_events_update_the_wallet() {
        let dir = tempfile::tempdir().unwrap();
        let (mut synchronizer, _requests, _events) = test_synchronizer(&dir);

        let txid = satchel_chain::transaction::Hash([7; 32]);
        let mut outstanding: HashSet<_> = [txid].into_iter().collect();
        // Stamps for unknown transactions are ignored, but the bookkeeping
        // still resolves the request.
        synchronizer.apply_verifier_event(
            spv::Event::Verified {
                txid,
                stamp: satchel_spv::VerifiedStamp {
                    height: 5,
                    timestamp: 1000,
                    pos: 0,
                },
            },
            &mut outstanding,
        );
        assert!(outstanding.is_empty());
    }
}
