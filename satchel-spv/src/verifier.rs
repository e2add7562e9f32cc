//! The verification task: keeps the header chain at the network tip and
//! turns Merkle branches into verification stamps.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use satchel_chain::{block::merkle, transaction};
use satchel_network::Client;
use serde::{Deserialize, Serialize};

use crate::error::HeaderError;
use crate::headers::HeaderChain;

/// Give up on a transaction after this many bad branches from the server.
const MAX_BRANCH_ATTEMPTS: u32 = 3;

/// How often the task retries work it could not finish.
const RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// Proof that a transaction is in the chain: issued only after its Merkle
/// branch hashed up to a locally validated header.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct VerifiedStamp {
    /// The height of the block containing the transaction.
    pub height: u32,
    /// That block's header timestamp.
    pub timestamp: u32,
    /// The transaction's index within the block.
    pub pos: u32,
}

/// Work sent to the verifier.
#[derive(Clone, Debug)]
pub enum Request {
    /// The server reported a new chain tip.
    Tip {
        /// The reported best height.
        height: u32,
    },
    /// Verify one transaction the wallet believes is confirmed.
    Verify {
        /// The transaction to verify.
        txid: transaction::Hash,
        /// The height its history entry reports.
        height: u32,
    },
}

/// Results sent back to the wallet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// A transaction's branch checked out against the stored header.
    Verified {
        /// The verified transaction.
        txid: transaction::Hash,
        /// Its confirmation record.
        stamp: VerifiedStamp,
    },
    /// A reorganization replaced headers; stamps at or above this height
    /// are no longer backed by the stored chain.
    Unverified {
        /// First height whose header changed.
        above_height: u32,
    },
    /// The server kept answering with branches that do not verify.
    Failed {
        /// The affected transaction.
        txid: transaction::Hash,
    },
    /// The header chain reached this height.
    HeadersSynced {
        /// The local tip after catching up.
        height: u32,
    },
}

struct QueuedTx {
    height: u32,
    attempts: u32,
}

/// The verification task state. Owns the header chain exclusively; other
/// tasks learn about chain movement through [`Event`]s.
pub struct Verifier {
    chain: HeaderChain,
    client: Client,
    network_tip: Option<u32>,
    queue: HashMap<transaction::Hash, QueuedTx>,
}

impl Verifier {
    /// Build a verifier over an existing header chain.
    pub fn new(chain: HeaderChain, client: Client) -> Verifier {
        Verifier {
            chain,
            client,
            network_tip: None,
            queue: HashMap::new(),
        }
    }

    /// Run until the request channel closes.
    pub async fn run(
        mut self,
        mut requests: mpsc::Receiver<Request>,
        events: mpsc::Sender<Event>,
    ) {
        let mut retry = tokio::time::interval(RETRY_INTERVAL);
        retry.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                request = requests.recv() => match request {
                    None => return,
                    Some(Request::Tip { height }) => {
                        self.network_tip = Some(height);
                        self.tick(&events).await;
                    }
                    Some(Request::Verify { txid, height }) => {
                        self.queue.entry(txid).or_insert(QueuedTx { height, attempts: 0 });
                        self.tick(&events).await;
                    }
                },
                _ = retry.tick() => self.tick(&events).await,
            }
        }
    }

    /// One round of catching up headers and draining the queue. Network
    /// failures end the round early; the retry timer brings us back.
    async fn tick(&mut self, events: &mpsc::Sender<Event>) {
        match self.sync_headers(events).await {
            Ok(true) => {
                let _ = events
                    .send(Event::HeadersSynced {
                        height: self.chain.tip().map(|h| h.0).unwrap_or(0),
                    })
                    .await;
            }
            Ok(false) => {}
            Err(error) => {
                debug!(%error, "header sync interrupted");
                return;
            }
        }
        self.drain_queue(events).await;
    }

    /// Bring the header chain up to the network tip, handling reorgs.
    /// Returns whether the chain is at the tip.
    async fn sync_headers(
        &mut self,
        events: &mpsc::Sender<Event>,
    ) -> Result<bool, satchel_network::Error> {
        let target = match self.network_tip {
            Some(target) => target,
            None => return Ok(false),
        };

        // Confirm the suffix of our stored chain is still the server's
        // chain; walk backward to the fork point if not.
        if !self.chain.is_empty() {
            let tip = self.chain.len() as u32 - 1;
            let mut check = std::cmp::min(target, tip);
            let mut fork = None;
            loop {
                let (_, remote) = self.client.get_header(check).await?;
                let local = self
                    .chain
                    .get(check)
                    .expect("check height is within the stored chain");
                if local.hash() == remote.hash() {
                    break;
                }
                fork = Some(check);
                if check == 0 {
                    break;
                }
                check -= 1;
            }
            if let Some(first_changed) = fork {
                warn!(first_changed, "chain reorganization detected");
                if let Err(error) = self.chain.truncate(first_changed) {
                    warn!(%error, "failed to persist truncated chain");
                }
                let _ = events
                    .send(Event::Unverified {
                        above_height: first_changed,
                    })
                    .await;
            }
        }

        while (self.chain.len() as u32) <= target {
            let next = self.chain.len() as u32;
            let (_, header) = self.client.get_header(next).await?;
            match self.chain.push(header) {
                Ok(()) => {}
                Err(HeaderError::Unlinked) => {
                    // The server's chain moved under us mid-walk; start
                    // over on the next round.
                    debug!(next, "header does not link, restarting sync");
                    return Ok(false);
                }
                Err(error) => {
                    warn!(height = next, %error, "server sent an invalid header");
                    return Ok(false);
                }
            }
        }
        info!(tip = target, "header chain is current");
        Ok(true)
    }

    /// Request and check branches for everything ready to verify.
    async fn drain_queue(&mut self, events: &mpsc::Sender<Event>) {
        let local_tip = match self.chain.tip() {
            Some(tip) => tip.0,
            None => return,
        };

        let ready: Vec<transaction::Hash> = self
            .queue
            .iter()
            .filter(|(_, queued)| queued.height <= local_tip)
            .map(|(txid, _)| *txid)
            .collect();

        for txid in ready {
            let height = self.queue[&txid].height;
            match self.verify_one(&txid, height).await {
                Ok(stamp) => {
                    self.queue.remove(&txid);
                    info!(%txid, height = stamp.height, "verified");
                    let _ = events.send(Event::Verified { txid, stamp }).await;
                }
                Err(VerifyFailure::BadBranch) => {
                    let queued = self
                        .queue
                        .get_mut(&txid)
                        .expect("ready entries are still queued");
                    queued.attempts += 1;
                    warn!(%txid, attempts = queued.attempts, "merkle branch did not verify");
                    if queued.attempts >= MAX_BRANCH_ATTEMPTS {
                        self.queue.remove(&txid);
                        let _ = events.send(Event::Failed { txid }).await;
                    }
                }
                Err(VerifyFailure::HeaderMissing) => {
                    // Height above our chain; wait for more headers.
                    continue;
                }
                Err(VerifyFailure::Network(error)) => {
                    debug!(%error, "verification round interrupted");
                    return;
                }
            }
        }
    }

    async fn verify_one(
        &self,
        txid: &transaction::Hash,
        height: u32,
    ) -> Result<VerifiedStamp, VerifyFailure> {
        let proof = self.client.get_merkle(txid, height).await?;
        let header = self
            .chain
            .get(proof.block_height)
            .ok_or(VerifyFailure::HeaderMissing)?;

        let root = merkle::branch_root(txid, &proof.branch, proof.pos);
        if root != header.merkle_root {
            return Err(VerifyFailure::BadBranch);
        }

        Ok(VerifiedStamp {
            height: proof.block_height,
            timestamp: header.time.timestamp() as u32,
            pos: proof.pos,
        })
    }
}

enum VerifyFailure {
    BadBranch,
    HeaderMissing,
    Network(satchel_network::Error),
}

impl From<satchel_network::Error> for VerifyFailure {
    fn from(error: satchel_network::Error) -> Self {
        VerifyFailure::Network(error)
    }
}

#[cfg(test)]
mod tests {
    use satchel_chain::serialization::sha256d;

    use crate::headers::testutil::{chain_of, child_with_root};

    use super::*;

    fn concat_hash(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
        let mut joined = [0u8; 64];
        joined[..32].copy_from_slice(left);
        joined[32..].copy_from_slice(right);
        sha256d::hash(&joined)
    }

    /// A branch of length two at position two verifies against the root
    /// `hash(s1 || hash(h0 || s0))`, and any flipped sibling byte fails.
    #[test]
    fn branch_fold_shape() {
        let h0 = transaction::Hash([0x11; 32]);
        let s0 = transaction::Hash([0x22; 32]);
        let s1 = transaction::Hash([0x33; 32]);

        let expected = concat_hash(&s1.0, &concat_hash(&h0.0, &s0.0));
        assert_eq!(merkle::branch_root(&h0, &[s0, s1], 2).0, expected);

        let mut tampered = s1;
        tampered.0[0] ^= 1;
        assert_ne!(merkle::branch_root(&h0, &[s0, tampered], 2).0, expected);
    }

    /// End to end against a real (regtest) header: the stamp carries the
    /// header's time and the branch position.
    #[test]
    fn stamp_fields_come_from_the_header() {
        let txid = transaction::Hash([0x44; 32]);
        let sibling = transaction::Hash([0x55; 32]);
        let root = merkle::branch_root(&txid, &[sibling], 0);

        let (mut chain, headers) = chain_of(3);
        let block = child_with_root(headers.last(), root, 1_300_002_000);
        chain.push(block).unwrap();

        let header = chain.get(3).unwrap();
        assert_eq!(header.merkle_root, root);

        let stamp = VerifiedStamp {
            height: 3,
            timestamp: header.time.timestamp() as u32,
            pos: 0,
        };
        assert_eq!(stamp.timestamp, 1_300_002_000);
    }
}
