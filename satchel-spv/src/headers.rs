//! The locally validated header chain.
//!
//! Headers are kept in memory as a dense array indexed by height and
//! mirrored to a flat file of concatenated 80-byte records next to the
//! wallet, so restarts do not re-download the chain.

use std::fs;
use std::io::Write;
use std::path::PathBuf;

use tracing::{info, warn};

use satchel_chain::{
    block::{Header, Height},
    parameters::{genesis_hash, Network, GENESIS_PREVIOUS_BLOCK_HASH},
    work::difficulty::ExpandedDifficulty,
    BitcoinDeserialize, BitcoinSerialize,
};

use crate::error::HeaderError;

/// An append/truncate store of block headers, validated on the way in.
pub struct HeaderChain {
    network: Network,
    headers: Vec<Header>,
    path: Option<PathBuf>,
}

impl HeaderChain {
    /// An empty in-memory chain.
    pub fn new(network: Network) -> HeaderChain {
        HeaderChain {
            network,
            headers: Vec::new(),
            path: None,
        }
    }

    /// Load the chain persisted at `path`, validating every record; a
    /// missing file yields an empty chain. Trailing invalid records are
    /// dropped rather than trusted.
    pub fn load(network: Network, path: PathBuf) -> Result<HeaderChain, HeaderError> {
        let mut chain = HeaderChain::new(network);

        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                chain.path = Some(path);
                return Ok(chain);
            }
            Err(error) => return Err(error.into()),
        };

        for record in bytes.chunks_exact(Header::len()) {
            let header = match Header::bitcoin_deserialize(record) {
                Ok(header) => header,
                Err(_) => break,
            };
            if chain.check(&header).is_err() {
                warn!(
                    height = chain.headers.len(),
                    "invalid stored header, truncating headers file"
                );
                break;
            }
            chain.headers.push(header);
        }
        info!(headers = chain.headers.len(), "loaded header chain");

        chain.path = Some(path);
        Ok(chain)
    }

    /// The number of stored headers.
    pub fn len(&self) -> usize {
        self.headers.len()
    }

    /// True when no headers are stored yet.
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    /// The height of the best stored header.
    pub fn tip(&self) -> Option<Height> {
        self.headers.len().checked_sub(1).map(|h| Height(h as u32))
    }

    /// The stored header at `height`.
    pub fn get(&self, height: u32) -> Option<&Header> {
        self.headers.get(height as usize)
    }

    /// Validate `header` as the next header of the chain.
    fn check(&self, header: &Header) -> Result<(), HeaderError> {
        // Linkage first: a mismatch signals a reorg, not a bad header.
        match self.headers.last() {
            Some(previous) => {
                if header.previous_block_hash != previous.hash() {
                    return Err(HeaderError::Unlinked);
                }
            }
            None => {
                if header.previous_block_hash != GENESIS_PREVIOUS_BLOCK_HASH {
                    return Err(HeaderError::Unlinked);
                }
            }
        }

        let target = header
            .difficulty_threshold
            .to_expanded()
            .ok_or(HeaderError::BadDifficulty)?;
        if target > ExpandedDifficulty::target_difficulty_limit(self.network) {
            return Err(HeaderError::BadDifficulty);
        }
        let hash = header.hash();
        if hash > target {
            return Err(HeaderError::BadProofOfWork);
        }

        // The chain bottoms out at the well-known genesis hash, so no
        // checkpoint beyond the protocol constants is needed.
        if self.headers.is_empty() {
            if let Some(expected) = genesis_hash(self.network) {
                if hash != expected {
                    return Err(HeaderError::WrongGenesis);
                }
            }
        }
        Ok(())
    }

    /// Validate and append the next header.
    pub fn push(&mut self, header: Header) -> Result<(), HeaderError> {
        self.check(&header)?;
        self.headers.push(header);
        self.append_to_disk(&header)?;
        Ok(())
    }

    /// Drop every header at or above `height` after a reorganization.
    pub fn truncate(&mut self, height: u32) -> Result<(), HeaderError> {
        if (height as usize) >= self.headers.len() {
            return Ok(());
        }
        self.headers.truncate(height as usize);
        self.rewrite_disk()
    }

    fn append_to_disk(&self, header: &Header) -> Result<(), HeaderError> {
        let path = match &self.path {
            Some(path) => path,
            None => return Ok(()),
        };
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        let record = header
            .bitcoin_serialize_to_vec()
            .expect("serializing to a Vec never fails");
        file.write_all(&record)?;
        Ok(())
    }

    fn rewrite_disk(&self) -> Result<(), HeaderError> {
        let path = match &self.path {
            Some(path) => path,
            None => return Ok(()),
        };
        let mut data = Vec::with_capacity(self.headers.len() * Header::len());
        for header in &self.headers {
            header
                .bitcoin_serialize(&mut data)
                .expect("serializing to a Vec never fails");
        }
        fs::write(path, data)?;
        Ok(())
    }
}

/// Helpers for building small regtest chains in tests.
#[cfg(test)]
pub(crate) mod testutil {
    use chrono::{TimeZone, Utc};

    use satchel_chain::block::merkle;
    use satchel_chain::work::difficulty::CompactDifficulty;

    use super::*;

    /// Regtest's trivial target lets tests "mine" a valid header in a few
    /// nonce increments.
    pub(crate) fn mine(mut header: Header) -> Header {
        for nonce in 0..10_000 {
            header.nonce = nonce;
            let target = header.difficulty_threshold.to_expanded().unwrap();
            if !(header.hash() > target) {
                return header;
            }
        }
        panic!("could not satisfy the regtest target in 10k nonces");
    }

    /// Mine a header on top of `previous`, or a height-zero header.
    pub(crate) fn child_of(previous: Option<&Header>, time: i64) -> Header {
        child_with_root(previous, merkle::Root([0xee; 32]), time)
    }

    /// Mine a header with a chosen Merkle root.
    pub(crate) fn child_with_root(
        previous: Option<&Header>,
        merkle_root: merkle::Root,
        time: i64,
    ) -> Header {
        let previous_block_hash = previous
            .map(|h| h.hash())
            .unwrap_or(GENESIS_PREVIOUS_BLOCK_HASH);
        mine(Header {
            version: 1,
            previous_block_hash,
            merkle_root,
            time: Utc.timestamp_opt(time, 0).single().unwrap(),
            difficulty_threshold: CompactDifficulty(0x207f_ffff),
            nonce: 0,
        })
    }

    /// A connected regtest chain of `length` headers.
    pub(crate) fn chain_of(length: usize) -> (HeaderChain, Vec<Header>) {
        let mut chain = HeaderChain::new(Network::Regtest);
        let mut headers = Vec::new();
        for i in 0..length {
            let header = child_of(headers.last(), 1_300_000_000 + i as i64 * 600);
            chain.push(header).expect("mined header connects");
            headers.push(header);
        }
        (chain, headers)
    }
}

#[cfg(test)]
mod tests {
    use satchel_chain::work::difficulty::CompactDifficulty;

    use super::testutil::{chain_of, child_of};
    use super::*;

    #[test]
    fn builds_and_links() {
        let (chain, headers) = chain_of(5);
        assert_eq!(chain.len(), 5);
        assert_eq!(chain.tip(), Some(Height(4)));
        assert_eq!(chain.get(3).unwrap().hash(), headers[3].hash());
    }

    #[test]
    fn rejects_unlinked_header() {
        let (mut chain, _) = chain_of(3);
        let orphan = child_of(None, 1_300_999_999);
        assert!(matches!(chain.push(orphan), Err(HeaderError::Unlinked)));
    }

    #[test]
    fn rejects_failed_proof_of_work() {
        let (mut chain, headers) = chain_of(2);
        let mut bad = child_of(headers.last(), 1_300_001_200);
        // Claim mainnet-grade difficulty that the mined nonce cannot meet.
        bad.difficulty_threshold = CompactDifficulty(0x1d00_ffff);
        assert!(matches!(
            chain.push(bad),
            Err(HeaderError::BadProofOfWork)
        ));
    }

    #[test]
    fn rejects_target_above_network_limit() {
        let mut mainnet = HeaderChain::new(Network::Mainnet);
        let mut header = child_of(None, 1_231_006_505);
        header.difficulty_threshold = CompactDifficulty(0x207f_ffff);
        assert!(matches!(
            mainnet.push(header),
            Err(HeaderError::BadDifficulty)
        ));
    }

    #[test]
    fn truncate_drops_suffix() {
        let (mut chain, headers) = chain_of(10);
        chain.truncate(6).unwrap();
        assert_eq!(chain.len(), 6);
        assert_eq!(chain.tip(), Some(Height(5)));

        // The replacement branch extends from the ancestor.
        let replacement = child_of(Some(&headers[5]), 1_300_700_000);
        chain.push(replacement).expect("replacement links");
        assert_eq!(chain.tip(), Some(Height(6)));
        assert_ne!(chain.get(6).unwrap().hash(), headers[6].hash());
    }

    #[test]
    fn persistence_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("headers");

        {
            let mut chain = HeaderChain::load(Network::Regtest, path.clone()).unwrap();
            let mut previous = None;
            for i in 0..4 {
                let header = child_of(previous.as_ref(), 1_300_000_000 + i * 600);
                chain.push(header).unwrap();
                previous = Some(header);
            }
        }

        let reloaded = HeaderChain::load(Network::Regtest, path).unwrap();
        assert_eq!(reloaded.len(), 4);
    }
}
